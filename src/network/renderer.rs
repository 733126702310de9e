//! Cluster renderer
//!
//! The renderer listens for one controller at a time, mirrors the camera
//! state it receives and takes part in the swap barrier:
//! CAM_MOVEMENT -> SWAP_READY -> SWAP_NOW, once per frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;

use super::connection::{Connection, ConnectionError, DatagramSender, QueuedReader};
use crate::protocol::{
    ClusterMessage, ClusterMsgHandler, DataSource, Frustum, Pose, ReadError, ReadOptions,
    Received, SelectedMovement, SequenceMonitor, CLUSTER_SERVER_PORT, RENDERER_PACKET_START,
};

/// Renderer errors
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type RendererResult<T> = Result<T, RendererError>;

/// Renderer settings
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Interface to listen on
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Take part in the swap barrier
    pub sync: bool,
    /// Blocking read tuning (poll interval, timeout, cancellation)
    pub read: ReadOptions,
    /// Frame period in free-run mode
    pub frame_interval: Duration,
    /// First packet number of the renderer's own datagrams
    pub packet_start: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: CLUSTER_SERVER_PORT,
            sync: true,
            read: ReadOptions::default(),
            frame_interval: Duration::from_micros(16_667),
            packet_start: RENDERER_PACKET_START,
        }
    }
}

/// What the renderer does after applying a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Why a controller session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The controller sent EXIT
    Exit,
    /// The controller went away
    Disconnected,
    /// Local shutdown was requested
    Cancelled,
}

/// Camera and selection state mirrored from the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneState {
    /// Fixed offset of this display relative to the shared camera
    pub camera_offset: Pose,
    /// Shared camera pose
    pub camera: Pose,
    pub frustum: Option<Frustum>,
    pub selected: Option<SelectedMovement>,
    /// Command strings received, in order
    pub commands: Vec<String>,
    /// Completed buffer swaps
    pub swaps: u64,
}

impl SceneState {
    pub fn apply(&mut self, message: &ClusterMessage) -> Flow {
        match message {
            ClusterMessage::CamOffset(pose) => self.camera_offset = *pose,
            ClusterMessage::CamFrustum(frustum) => self.frustum = Some(*frustum),
            ClusterMessage::CamMovement(pose) => self.camera = *pose,
            ClusterMessage::SelectedMovement(sel) => self.selected = Some(*sel),
            ClusterMessage::CommandString(command) => {
                tracing::info!("Command received: {}", command);
                self.commands.push(command.clone());
            }
            ClusterMessage::SwapNow => self.swaps += 1,
            ClusterMessage::SwapReady | ClusterMessage::None => {
                tracing::debug!("Ignoring {} on renderer", message.msg_type());
            }
            ClusterMessage::Exit => return Flow::Exit,
        }
        Flow::Continue
    }
}

/// Renderer endpoint
pub struct Renderer {
    config: RendererConfig,
    handler: ClusterMsgHandler,
    scene: SceneState,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        let handler = ClusterMsgHandler::new(config.packet_start, "renderer");
        Self {
            config,
            handler,
            scene: SceneState::default(),
        }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn scene(&self) -> &SceneState {
        &self.scene
    }

    /// Bind the control-channel listener
    pub async fn bind(&self) -> RendererResult<TcpListener> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            RendererError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        tracing::info!("Renderer listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Drive one controller session until EXIT, disconnect or cancellation.
    ///
    /// Blocks the calling thread; run it off the async runtime.
    pub fn run_session(&mut self, connection: Connection) -> RendererResult<SessionEnd> {
        let peer = connection.remote_addr();
        let (mut reader, sender, _writer) = connection.into_parts();
        // One handler per connection: numbering restarts for every controller
        self.handler = ClusterMsgHandler::new(self.config.packet_start, "renderer");
        let mut monitor = SequenceMonitor::new(peer.to_string());

        tracing::info!(
            "Controller {} connected ({} mode)",
            peer,
            if self.config.sync { "sync" } else { "free-run" }
        );

        let end = loop {
            let frame = if self.config.sync {
                self.sync_frame(&mut reader, &sender, &mut monitor)
            } else {
                self.free_frame(&mut reader, &mut monitor)
            };

            match frame {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break Ok(SessionEnd::Exit),
                Err(RendererError::Read(ReadError::Closed))
                | Err(RendererError::Connection(ConnectionError::Closed))
                | Err(RendererError::Connection(ConnectionError::SendChannelClosed)) => {
                    break Ok(SessionEnd::Disconnected)
                }
                Err(RendererError::Read(ReadError::Cancelled)) => break Ok(SessionEnd::Cancelled),
                Err(e) => break Err(e),
            }
        };

        tracing::info!(
            "Session with {} ended: {} packets, {} gaps, {} reordered, {} swaps",
            peer,
            monitor.received(),
            monitor.gaps(),
            monitor.reordered(),
            self.scene.swaps
        );
        end
    }

    /// Turn a read outcome into a message, logging anything unusable
    fn receive(&self, received: Received, monitor: &mut SequenceMonitor) -> Option<ClusterMessage> {
        match received {
            Received::Datagram {
                header,
                mut payload,
                ..
            } => {
                monitor.observe(header.sequence);
                match self.handler.parse_message(header.msg_type, &mut payload) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        tracing::warn!("Dropping packet {}: {}", header.sequence, e);
                        None
                    }
                }
            }
            // Fetch failures and corrupt headers were already logged by the handler
            Received::Empty | Received::FetchFailed { .. } | Received::Corrupt { .. } => None,
        }
    }

    /// Block until the next message arrives and apply it
    fn next_message(
        &mut self,
        reader: &mut QueuedReader,
        monitor: &mut SequenceMonitor,
    ) -> RendererResult<(ClusterMessage, Flow)> {
        loop {
            let received = self.handler.blocking_read(reader, &self.config.read)?;
            if let Some(message) = self.receive(received, monitor) {
                let flow = self.scene.apply(&message);
                return Ok((message, flow));
            }
        }
    }

    fn sync_frame(
        &mut self,
        reader: &mut QueuedReader,
        sender: &DatagramSender,
        monitor: &mut SequenceMonitor,
    ) -> RendererResult<Flow> {
        loop {
            match self.next_message(reader, monitor)? {
                (_, Flow::Exit) => return Ok(Flow::Exit),
                (ClusterMessage::CamMovement(_), _) => break,
                _ => {}
            }
        }

        sender.blocking_send(self.handler.make_swap_ready_datagram())?;

        loop {
            match self.next_message(reader, monitor)? {
                (_, Flow::Exit) => return Ok(Flow::Exit),
                (ClusterMessage::SwapNow, _) => return Ok(Flow::Continue),
                _ => {}
            }
        }
    }

    fn free_frame(
        &mut self,
        reader: &mut QueuedReader,
        monitor: &mut SequenceMonitor,
    ) -> RendererResult<Flow> {
        loop {
            let received = self.handler.non_blocking_read(reader);
            if received.is_empty() {
                break;
            }
            if let Some(message) = self.receive(received, monitor) {
                if self.scene.apply(&message) == Flow::Exit {
                    return Ok(Flow::Exit);
                }
            }
        }

        if reader.is_closed() {
            return Err(ReadError::Closed.into());
        }
        if self.config.read.is_cancelled() {
            return Err(ReadError::Cancelled.into());
        }
        std::thread::sleep(self.config.frame_interval);
        Ok(Flow::Continue)
    }
}

async fn wait_for_cancel(cancel: Option<Arc<AtomicBool>>) {
    match cancel {
        Some(flag) => {
            while !flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Accept controllers one after another until EXIT or cancellation.
///
/// Returns the renderer so its final scene state can be inspected.
pub async fn serve(mut renderer: Renderer, listener: TcpListener) -> RendererResult<Renderer> {
    loop {
        let connection = tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                Connection::new(stream, addr)
            }
            _ = wait_for_cancel(renderer.config.read.cancel.clone()) => {
                tracing::info!("Renderer shutdown requested");
                return Ok(renderer);
            }
        };

        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = renderer.run_session(connection);
            (renderer, result)
        })
        .await?;
        renderer = returned;

        match result {
            Ok(SessionEnd::Exit) => {
                tracing::info!("Exit requested by controller");
                return Ok(renderer);
            }
            Ok(SessionEnd::Cancelled) => return Ok(renderer),
            Ok(SessionEnd::Disconnected) => {
                tracing::info!("Controller disconnected, waiting for the next one");
            }
            Err(e) => tracing::error!("Controller session failed: {}", e),
        }
    }
}
