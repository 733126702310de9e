//! Connection handling for cluster links
//!
//! Each datagram travels on the TCP stream behind a 2-byte little-endian
//! length. A reader task and a writer task own the socket halves; frame loops
//! only see the queues:
//! - `QueuedReader` implements `DataSource` for the protocol reads
//! - `DatagramSender` queues outgoing datagrams from async or blocking code

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::protocol::{DataSource, MAX_DATAGRAM_SIZE};

/// Length prefix in front of every datagram on the stream
pub const FRAME_HEADER_SIZE: usize = 2;

const QUEUE_CAPACITY: usize = 256;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Datagram too large: {0} bytes (max: {1})")]
    DatagramTooLarge(usize, usize),

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Append one length-prefixed datagram to `buf`
pub fn encode_frame(datagram: &[u8], buf: &mut BytesMut) -> ConnectionResult<()> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(ConnectionError::DatagramTooLarge(
            datagram.len(),
            MAX_DATAGRAM_SIZE,
        ));
    }
    buf.reserve(FRAME_HEADER_SIZE + datagram.len());
    buf.put_u16_le(datagram.len() as u16);
    buf.put_slice(datagram);
    Ok(())
}

/// Split the next complete datagram off `buf`.
/// Returns None if more data is needed.
pub fn decode_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let length = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < FRAME_HEADER_SIZE + length {
        return None;
    }
    buf.advance(FRAME_HEADER_SIZE);
    Some(buf.split_to(length).freeze())
}

/// A live link to a remote cluster endpoint
pub struct Connection {
    remote_addr: SocketAddr,
    reader: QueuedReader,
    sender: DatagramSender,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Wrap an established stream and start its reader/writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);

        let sender = DatagramSender::new(out_tx);

        tokio::spawn(read_loop(read_half, in_tx, remote_addr));
        let writer = tokio::spawn(write_loop(
            write_half,
            out_rx,
            sender.connected.clone(),
            remote_addr,
        ));

        Self {
            remote_addr,
            reader: QueuedReader::new(in_rx),
            sender,
            writer,
        }
    }

    /// Connect to a remote endpoint with a timeout
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> ConnectionResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(Self::new(stream, addr))
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn reader_mut(&mut self) -> &mut QueuedReader {
        &mut self.reader
    }

    pub fn sender(&self) -> &DatagramSender {
        &self.sender
    }

    /// Split into the receive queue, the send handle and the writer task.
    ///
    /// The writer task finishes once every `DatagramSender` clone is dropped
    /// and the queued datagrams are written out.
    pub fn into_parts(self) -> (QueuedReader, DatagramSender, JoinHandle<()>) {
        (self.reader, self.sender, self.writer)
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Bytes>, addr: SocketAddr) {
    let mut read_buf = BytesMut::with_capacity(4096);
    'outer: loop {
        while let Some(datagram) = decode_frame(&mut read_buf) {
            if tx.send(datagram).await.is_err() {
                break 'outer;
            }
        }

        match read_half.read_buf(&mut read_buf).await {
            Ok(0) => {
                if !read_buf.is_empty() {
                    tracing::warn!(
                        "{} closed with {} bytes of a partial datagram",
                        addr,
                        read_buf.len()
                    );
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Read error from {}: {}", addr, e);
                break;
            }
        }
    }
    tracing::debug!("Reader for {} finished", addr);
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    connected: Arc<AtomicBool>,
    addr: SocketAddr,
) {
    let mut write_buf = BytesMut::with_capacity(4096);
    while let Some(datagram) = rx.recv().await {
        write_buf.clear();
        if let Err(e) = encode_frame(&datagram, &mut write_buf) {
            tracing::warn!("Dropping datagram for {}: {}", addr, e);
            continue;
        }
        if let Err(e) = write_half.write_all(&write_buf).await {
            tracing::warn!("Write error to {}: {}", addr, e);
            break;
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = write_half.shutdown().await;
    tracing::debug!("Writer for {} finished", addr);
}

/// Receive queue of one connection
#[derive(Debug)]
pub struct QueuedReader {
    receiver: mpsc::Receiver<Bytes>,
    pending: Option<Bytes>,
    disconnected: bool,
}

impl QueuedReader {
    pub fn new(receiver: mpsc::Receiver<Bytes>) -> Self {
        Self {
            receiver,
            pending: None,
            disconnected: false,
        }
    }

    /// Wait for the next datagram without polling
    pub async fn recv(&mut self) -> Option<Bytes> {
        if let Some(datagram) = self.pending.take() {
            return Some(datagram);
        }
        let datagram = self.receiver.recv().await;
        if datagram.is_none() {
            self.disconnected = true;
        }
        datagram
    }
}

impl DataSource for QueuedReader {
    fn data_available(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(datagram) => {
                self.pending = Some(datagram);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.disconnected = true;
                false
            }
        }
    }

    fn fetch_next(&mut self, datagram: &mut BytesMut) -> io::Result<()> {
        match self.pending.take() {
            Some(bytes) => {
                datagram.extend_from_slice(&bytes);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no datagram queued",
            )),
        }
    }

    fn is_closed(&self) -> bool {
        self.pending.is_none() && self.disconnected
    }
}

/// A handle for sending datagrams to a connection
#[derive(Clone, Debug)]
pub struct DatagramSender {
    sender: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

impl DatagramSender {
    pub fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    fn check(&self, datagram: &Bytes) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(ConnectionError::DatagramTooLarge(
                datagram.len(),
                MAX_DATAGRAM_SIZE,
            ));
        }
        Ok(())
    }

    /// Queue a datagram from async code
    pub async fn send(&self, datagram: Bytes) -> ConnectionResult<()> {
        self.check(&datagram)?;
        self.sender
            .send(datagram)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Queue a datagram from a blocking frame loop.
    ///
    /// Panics if called from inside an async task; use `send` there.
    pub fn blocking_send(&self, datagram: Bytes) -> ConnectionResult<()> {
        self.check(&datagram)?;
        self.sender
            .blocking_send(datagram)
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Check if the writer is still running
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
