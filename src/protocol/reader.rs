//! Datagram reads over an abstract transport
//!
//! The handler only needs two primitives from the transport: whether a
//! datagram is ready, and fetching it. Blocking reads poll those primitives
//! with a short sleep, bounded by an optional timeout and cancellation flag.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::{ClusterMsgHandler, CodecError, DatagramIterator, Header, MessageType};

/// Default idle delay between availability checks in a blocking read
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Source of whole datagrams
pub trait DataSource {
    /// Whether a datagram can be fetched right now
    fn data_available(&mut self) -> bool;

    /// Move the next datagram into `datagram`.
    ///
    /// On failure, whatever was written to `datagram` is handed back to the
    /// caller untouched.
    fn fetch_next(&mut self, datagram: &mut BytesMut) -> io::Result<()>;

    /// Whether the source will never produce another datagram
    fn is_closed(&self) -> bool {
        false
    }
}

/// Outcome of a single read attempt
#[derive(Debug)]
pub enum Received {
    /// No data was available
    Empty,
    /// Data was reported available but could not be fetched
    FetchFailed { datagram: Bytes },
    /// The header could not be decoded
    Corrupt { datagram: Bytes, error: CodecError },
    /// Header decoded, cursor positioned at the first payload byte
    Datagram {
        datagram: Bytes,
        header: Header,
        payload: DatagramIterator,
    },
}

impl Received {
    /// Message type, or `NONE` for anything that did not decode
    pub fn msg_type(&self) -> MessageType {
        match self {
            Received::Datagram { header, .. } => header.msg_type,
            _ => MessageType::None,
        }
    }

    /// Raw datagram, kept even when decoding failed
    pub fn datagram(&self) -> Option<&Bytes> {
        match self {
            Received::Empty => None,
            Received::FetchFailed { datagram }
            | Received::Corrupt { datagram, .. }
            | Received::Datagram { datagram, .. } => Some(datagram),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Received::Empty)
    }
}

/// Blocking read errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("No datagram within {0:?}")]
    Timeout(Duration),

    #[error("Read cancelled")]
    Cancelled,

    #[error("Data source closed")]
    Closed,
}

pub type ReadResult<T> = Result<T, ReadError>;

/// Tuning for blocking reads
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Sleep between availability checks
    pub poll_interval: Duration,
    /// Give up after this long (wait forever if unset)
    pub timeout: Option<Duration>,
    /// Shared flag that aborts the wait when set
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            cancel: None,
        }
    }
}

impl ReadOptions {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl ClusterMsgHandler {
    fn fetch<S: DataSource + ?Sized>(&self, source: &mut S) -> Received {
        let mut buf = BytesMut::new();
        if let Err(e) = source.fetch_next(&mut buf) {
            tracing::warn!(handler = %self.name(), "fetch_next failed: {}", e);
            return Received::FetchFailed {
                datagram: buf.freeze(),
            };
        }

        let datagram = buf.freeze();
        match self.read_header(&datagram) {
            Ok((payload, header)) => Received::Datagram {
                datagram,
                header,
                payload,
            },
            Err(error) => {
                tracing::warn!(
                    handler = %self.name(),
                    "Dropping corrupt datagram ({} bytes): {}",
                    datagram.len(),
                    error
                );
                Received::Corrupt { datagram, error }
            }
        }
    }

    /// Check the source once and decode a datagram if one is ready
    pub fn non_blocking_read<S: DataSource + ?Sized>(&self, source: &mut S) -> Received {
        if source.data_available() {
            self.fetch(source)
        } else {
            Received::Empty
        }
    }

    /// Poll the source until a datagram is ready, then decode it.
    ///
    /// Never returns `Received::Empty`.
    pub fn blocking_read<S: DataSource + ?Sized>(
        &self,
        source: &mut S,
        options: &ReadOptions,
    ) -> ReadResult<Received> {
        let started = Instant::now();
        loop {
            if options.is_cancelled() {
                return Err(ReadError::Cancelled);
            }
            if source.data_available() {
                return Ok(self.fetch(source));
            }
            if source.is_closed() {
                return Err(ReadError::Closed);
            }
            if let Some(timeout) = options.timeout {
                if started.elapsed() >= timeout {
                    return Err(ReadError::Timeout(timeout));
                }
            }
            std::thread::sleep(options.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::BufMut;

    use crate::protocol::{ClusterMessage, Pose};

    /// In-memory source whose datagrams become visible at `ready_at`
    #[derive(Default)]
    struct MockSource {
        queue: VecDeque<Option<Vec<u8>>>,
        ready_at: Option<Instant>,
        closed: bool,
        fetches: usize,
    }

    impl MockSource {
        fn with(datagrams: Vec<Option<Vec<u8>>>) -> Self {
            Self {
                queue: datagrams.into(),
                ..Default::default()
            }
        }
    }

    impl DataSource for MockSource {
        fn data_available(&mut self) -> bool {
            let ready = self.ready_at.map(|t| Instant::now() >= t).unwrap_or(true);
            ready && !self.queue.is_empty()
        }

        fn fetch_next(&mut self, datagram: &mut BytesMut) -> io::Result<()> {
            self.fetches += 1;
            match self.queue.pop_front() {
                Some(Some(bytes)) => {
                    datagram.put_slice(&bytes);
                    Ok(())
                }
                Some(None) => {
                    datagram.put_slice(&[0xde, 0xad]);
                    Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame"))
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty")),
            }
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, capture.contents())
    }

    #[test]
    fn test_non_blocking_read_without_data() {
        let handler = ClusterMsgHandler::new(0, "test");
        let mut source = MockSource::default();

        let received = handler.non_blocking_read(&mut source);
        assert!(received.is_empty());
        assert_eq!(received.msg_type(), MessageType::None);
        assert!(received.datagram().is_none());
        assert_eq!(source.fetches, 0);
    }

    #[test]
    fn test_non_blocking_read_decodes_header() {
        let mut sender = ClusterMsgHandler::new(7, "sender");
        let datagram = sender.make_cam_movement_datagram([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        let receiver = ClusterMsgHandler::new(0, "receiver");
        let mut source = MockSource::with(vec![Some(datagram.to_vec())]);

        match receiver.non_blocking_read(&mut source) {
            Received::Datagram {
                datagram: raw,
                header,
                mut payload,
            } => {
                assert_eq!(raw, datagram);
                assert_eq!(header.sequence, 7);
                assert_eq!(header.msg_type, MessageType::CamMovement);
                let pose = receiver.parse_message(header.msg_type, &mut payload).unwrap();
                assert_eq!(
                    pose,
                    ClusterMessage::CamMovement(Pose::new([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]))
                );
            }
            other => panic!("expected datagram, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_failure_keeps_buffer_and_warns() {
        let handler = ClusterMsgHandler::new(0, "renderer");
        let mut source = MockSource::with(vec![None]);

        let (received, logs) = capture_logs(|| handler.non_blocking_read(&mut source));

        assert_eq!(received.msg_type(), MessageType::None);
        match &received {
            Received::FetchFailed { datagram } => assert_eq!(&datagram[..], &[0xde, 0xad]),
            other => panic!("expected fetch failure, got {:?}", other),
        }
        assert!(logs.contains("WARN"), "logs: {}", logs);
        assert!(logs.contains("fetch_next failed"), "logs: {}", logs);
    }

    #[test]
    fn test_corrupt_datagram_keeps_buffer() {
        let handler = ClusterMsgHandler::new(0, "test");
        let mut source = MockSource::with(vec![Some(vec![1, 0, 0, 0, 200])]);

        let received = handler.non_blocking_read(&mut source);
        assert_eq!(received.msg_type(), MessageType::None);
        match received {
            Received::Corrupt { datagram, error } => {
                assert_eq!(datagram.len(), 5);
                assert_eq!(error, CodecError::UnknownType(200));
            }
            other => panic!("expected corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_blocking_read_liveness() {
        let mut sender = ClusterMsgHandler::new(0, "sender");
        let handler = ClusterMsgHandler::new(0, "receiver");
        let mut source = MockSource::with(vec![Some(sender.make_swap_now_datagram().to_vec())]);
        source.ready_at = Some(Instant::now() + Duration::from_millis(10));

        let started = Instant::now();
        let received = handler
            .blocking_read(&mut source, &ReadOptions::default())
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(received.msg_type(), MessageType::SwapNow);
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(50), "took {:?}", elapsed);
    }

    #[test]
    fn test_blocking_read_timeout() {
        let handler = ClusterMsgHandler::new(0, "test");
        let mut source = MockSource::default();
        let options = ReadOptions::default().with_timeout(Duration::from_millis(15));

        let started = Instant::now();
        let err = handler.blocking_read(&mut source, &options).unwrap_err();
        assert_eq!(err, ReadError::Timeout(Duration::from_millis(15)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_blocking_read_cancelled() {
        let handler = ClusterMsgHandler::new(0, "test");
        let mut source = MockSource::default();
        let cancel = Arc::new(AtomicBool::new(false));
        let options = ReadOptions::default().with_cancel(cancel.clone());

        let flag = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            flag.store(true, Ordering::SeqCst);
        });

        let err = handler.blocking_read(&mut source, &options).unwrap_err();
        assert_eq!(err, ReadError::Cancelled);
        canceller.join().unwrap();
    }

    #[test]
    fn test_blocking_read_closed_source() {
        let handler = ClusterMsgHandler::new(0, "test");
        let mut sender = ClusterMsgHandler::new(0, "sender");
        let mut source = MockSource::with(vec![Some(sender.make_exit_datagram().to_vec())]);
        source.closed = true;

        // Queued data is still delivered after close
        let received = handler
            .blocking_read(&mut source, &ReadOptions::default())
            .unwrap();
        assert_eq!(received.msg_type(), MessageType::Exit);

        let err = handler
            .blocking_read(&mut source, &ReadOptions::default())
            .unwrap_err();
        assert_eq!(err, ReadError::Closed);
    }
}
