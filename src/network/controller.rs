//! Cluster controller
//!
//! Connects to every renderer, hands each one its camera offset and lens,
//! then drives the shared camera frame by frame. In sync mode every frame
//! ends with a swap barrier: wait for SWAP_READY from all renderers, then
//! broadcast SWAP_NOW.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionError, DatagramSender, QueuedReader};
use crate::protocol::{
    ClusterMessage, ClusterMsgHandler, CodecError, Frustum, Pose, ReadError, ReadOptions,
    Received, SelectedMovement, SequenceMonitor, CONTROLLER_PACKET_START,
};

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("No renderers configured")]
    NoRenderers,

    #[error("Renderer {name} lost: {reason}")]
    RendererLost { name: String, reason: String },

    #[error("Controller task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Run the swap barrier every frame
    pub sync: bool,
    /// Blocking read tuning for SWAP_READY waits
    pub read: ReadOptions,
    pub connect_timeout: Duration,
    /// First packet number of the controller's datagrams
    pub packet_start: u32,
    /// Target frame period
    pub frame_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync: true,
            read: ReadOptions::default(),
            connect_timeout: Duration::from_millis(5000),
            packet_start: CONTROLLER_PACKET_START,
            frame_interval: Duration::from_micros(16_667),
        }
    }
}

/// One renderer the controller drives
#[derive(Debug, Clone)]
pub struct RendererTarget {
    pub name: String,
    pub addr: SocketAddr,
    /// Offset of this display from the shared camera
    pub offset: Pose,
    /// Lens override for this display
    pub frustum: Option<Frustum>,
}

struct RendererLink {
    name: String,
    reader: QueuedReader,
    sender: DatagramSender,
    writer: JoinHandle<()>,
    monitor: SequenceMonitor,
}

impl RendererLink {
    fn lost(&self, reason: impl ToString) -> ControllerError {
        ControllerError::RendererLost {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Controller endpoint
pub struct Controller {
    config: ControllerConfig,
    handler: ClusterMsgHandler,
    links: Vec<RendererLink>,
    frames: u64,
}

impl Controller {
    /// Connect to every renderer and send its camera setup
    pub async fn connect(
        config: ControllerConfig,
        targets: &[RendererTarget],
    ) -> ControllerResult<Self> {
        if targets.is_empty() {
            return Err(ControllerError::NoRenderers);
        }

        let mut handler = ClusterMsgHandler::new(config.packet_start, "controller");
        let mut links = Vec::with_capacity(targets.len());

        for target in targets {
            tracing::info!("Connecting to renderer {} at {}", target.name, target.addr);
            let connection = Connection::connect(target.addr, config.connect_timeout).await?;
            let (reader, sender, writer) = connection.into_parts();

            sender
                .send(handler.make_cam_offset_datagram(target.offset.xyz, target.offset.hpr))
                .await?;
            if let Some(frustum) = target.frustum {
                sender
                    .send(handler.make_cam_frustum_datagram(
                        frustum.focal_length,
                        frustum.film_size,
                        frustum.film_offset,
                    ))
                    .await?;
            }

            links.push(RendererLink {
                name: target.name.clone(),
                reader,
                sender,
                writer,
                monitor: SequenceMonitor::new(target.name.clone()),
            });
        }

        tracing::info!("Controller connected to {} renderer(s)", links.len());
        Ok(Self {
            config,
            handler,
            links,
            frames: 0,
        })
    }

    pub fn renderer_count(&self) -> usize {
        self.links.len()
    }

    /// Frames completed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Queue one datagram to every renderer (blocking)
    fn broadcast(&self, datagram: Bytes) -> ControllerResult<()> {
        for link in &self.links {
            link.sender
                .blocking_send(datagram.clone())
                .map_err(|e| match e {
                    // Rejected before queueing; the link itself is fine
                    ConnectionError::DatagramTooLarge(..) => ControllerError::Connection(e),
                    e => link.lost(e),
                })?;
        }
        Ok(())
    }

    pub fn move_camera(&mut self, pose: Pose) -> ControllerResult<()> {
        let datagram = self.handler.make_cam_movement_datagram(pose.xyz, pose.hpr);
        self.broadcast(datagram)
    }

    pub fn move_selected(&mut self, selected: SelectedMovement) -> ControllerResult<()> {
        let datagram =
            self.handler
                .make_selected_movement_datagram(selected.xyz, selected.hpr, selected.scale);
        self.broadcast(datagram)
    }

    pub fn send_command(&mut self, command: &str) -> ControllerResult<()> {
        let datagram = self.handler.make_command_string_datagram(command)?;
        self.broadcast(datagram)
    }

    /// Block until every renderer reported SWAP_READY
    pub fn wait_for_swap_ready(&mut self) -> ControllerResult<()> {
        for link in self.links.iter_mut() {
            loop {
                let received = match self.handler.blocking_read(&mut link.reader, &self.config.read)
                {
                    Ok(received) => received,
                    Err(ReadError::Closed) => return Err(link.lost("connection closed")),
                    Err(e) => return Err(e.into()),
                };

                let Received::Datagram {
                    header,
                    mut payload,
                    ..
                } = received
                else {
                    continue;
                };
                link.monitor.observe(header.sequence);

                match self.handler.parse_message(header.msg_type, &mut payload) {
                    Ok(ClusterMessage::SwapReady) => break,
                    Ok(other) => {
                        tracing::debug!("Ignoring {} from {}", other.msg_type(), link.name)
                    }
                    Err(e) => tracing::warn!("Bad packet from {}: {}", link.name, e),
                }
            }
        }
        Ok(())
    }

    /// Release every renderer's buffer swap
    pub fn swap_now(&mut self) -> ControllerResult<()> {
        let datagram = self.handler.make_swap_now_datagram();
        self.broadcast(datagram)
    }

    /// Move the camera and, in sync mode, run the swap barrier
    pub fn frame(&mut self, pose: Pose) -> ControllerResult<()> {
        self.move_camera(pose)?;
        if self.config.sync {
            self.wait_for_swap_ready()?;
            self.swap_now()?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Run frames along `path` until `limit` frames or cancellation.
    ///
    /// Returns the number of frames run.
    pub fn run(
        &mut self,
        limit: Option<u64>,
        mut path: impl FnMut(u64) -> Pose,
    ) -> ControllerResult<u64> {
        let mut count = 0;
        while limit.map_or(true, |limit| count < limit) && !self.config.read.is_cancelled() {
            let started = Instant::now();
            self.frame(path(self.frames))?;
            count += 1;

            if let Some(rest) = self.config.frame_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        Ok(count)
    }

    /// Tell every renderer to shut down
    pub fn exit(&mut self) -> ControllerResult<()> {
        let datagram = self.handler.make_exit_datagram();
        self.broadcast(datagram)
    }

    /// Flush queued datagrams and close every link
    pub async fn close(self) {
        for link in self.links {
            let RendererLink {
                name,
                reader,
                sender,
                writer,
                monitor,
            } = link;
            drop(sender);
            drop(reader);
            if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
                tracing::warn!("Timed out flushing datagrams to {}", name);
            }
            tracing::debug!(
                "Link to {} closed: {} packets received, {} gaps",
                name,
                monitor.received(),
                monitor.gaps()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{serve, Renderer, RendererConfig};
    use crate::protocol::{MAX_COMMAND_LEN, MAX_DATAGRAM_SIZE};

    async fn spawn_renderer(
        sync: bool,
    ) -> (SocketAddr, JoinHandle<crate::network::RendererResult<Renderer>>) {
        let renderer = Renderer::new(RendererConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            sync,
            read: ReadOptions::default().with_timeout(Duration::from_secs(5)),
            frame_interval: Duration::from_millis(2),
            ..Default::default()
        });
        let listener = renderer.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        (addr, tokio::spawn(serve(renderer, listener)))
    }

    fn test_config(sync: bool) -> ControllerConfig {
        ControllerConfig {
            sync,
            read: ReadOptions::default().with_timeout(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(2),
            frame_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn orbit(frame: u64) -> Pose {
        Pose::new([0.0, -10.0, 2.0], [frame as f32 * 5.0, 0.0, 0.0])
    }

    #[tokio::test]
    async fn test_no_renderers() {
        let result = Controller::connect(test_config(true), &[]).await;
        assert!(matches!(result, Err(ControllerError::NoRenderers)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = RendererTarget {
            name: "gone".to_string(),
            addr,
            offset: Pose::default(),
            frustum: None,
        };
        let result = Controller::connect(test_config(true), &[target]).await;
        assert!(matches!(result, Err(ControllerError::Connection(_))));
    }

    #[tokio::test]
    async fn test_sync_frames_across_two_renderers() {
        let (left_addr, left) = spawn_renderer(true).await;
        let (right_addr, right) = spawn_renderer(true).await;

        let frustum = Frustum::new(1.2, [1.0, 0.75], [0.5, 0.0]);
        let targets = vec![
            RendererTarget {
                name: "left".to_string(),
                addr: left_addr,
                offset: Pose::new([0.0; 3], [30.0, 0.0, 0.0]),
                frustum: None,
            },
            RendererTarget {
                name: "right".to_string(),
                addr: right_addr,
                offset: Pose::new([0.0; 3], [-30.0, 0.0, 0.0]),
                frustum: Some(frustum),
            },
        ];

        let controller = Controller::connect(test_config(true), &targets).await.unwrap();
        assert_eq!(controller.renderer_count(), 2);

        let controller = tokio::task::spawn_blocking(move || {
            let mut controller = controller;
            assert_eq!(controller.run(Some(3), orbit).unwrap(), 3);
            controller.send_command("reload").unwrap();
            controller
                .move_selected(SelectedMovement::new([1.0; 3], [0.0; 3], [2.0; 3]))
                .unwrap();
            controller.frame(orbit(3)).unwrap();
            controller.exit().unwrap();
            controller
        })
        .await
        .unwrap();
        assert_eq!(controller.frames(), 4);
        controller.close().await;

        let left = left.await.unwrap().unwrap();
        let right = right.await.unwrap().unwrap();

        for renderer in [&left, &right] {
            let scene = renderer.scene();
            assert_eq!(scene.swaps, 4);
            assert_eq!(scene.camera, orbit(3));
            assert_eq!(scene.commands, vec!["reload".to_string()]);
            assert_eq!(scene.selected.unwrap().scale, [2.0; 3]);
        }
        assert_eq!(left.scene().camera_offset.hpr[0], 30.0);
        assert_eq!(right.scene().camera_offset.hpr[0], -30.0);
        assert_eq!(left.scene().frustum, None);
        assert_eq!(right.scene().frustum, Some(frustum));
    }

    #[tokio::test]
    async fn test_oversized_command_keeps_link() {
        let (addr, renderer) = spawn_renderer(false).await;
        let target = RendererTarget {
            name: "wall".to_string(),
            addr,
            offset: Pose::default(),
            frustum: None,
        };

        let controller = Controller::connect(test_config(false), &[target]).await.unwrap();
        let controller = tokio::task::spawn_blocking(move || {
            let mut controller = controller;
            let before = controller.handler.packet_number();

            let err = controller.send_command(&"x".repeat(MAX_COMMAND_LEN + 1)).unwrap_err();
            assert!(matches!(err, ControllerError::Codec(CodecError::StringTooLong(..))));
            assert_eq!(controller.handler.packet_number(), before);

            let err = controller
                .broadcast(Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]))
                .unwrap_err();
            assert!(matches!(
                err,
                ControllerError::Connection(ConnectionError::DatagramTooLarge(..))
            ));

            controller.send_command(&"x".repeat(MAX_COMMAND_LEN)).unwrap();
            controller.exit().unwrap();
            controller
        })
        .await
        .unwrap();
        controller.close().await;

        let renderer = renderer.await.unwrap().unwrap();
        assert_eq!(renderer.scene().commands.len(), 1);
        assert_eq!(renderer.scene().commands[0].len(), MAX_COMMAND_LEN);
    }

    #[tokio::test]
    async fn test_free_run_skips_barrier() {
        let (addr, renderer) = spawn_renderer(false).await;
        let target = RendererTarget {
            name: "solo".to_string(),
            addr,
            offset: Pose::default(),
            frustum: None,
        };

        let controller = Controller::connect(test_config(false), &[target]).await.unwrap();
        let controller = tokio::task::spawn_blocking(move || {
            let mut controller = controller;
            controller.run(Some(5), orbit).unwrap();
            controller.exit().unwrap();
            controller
        })
        .await
        .unwrap();
        controller.close().await;

        let renderer = renderer.await.unwrap().unwrap();
        assert_eq!(renderer.scene().swaps, 0);
        assert_eq!(renderer.scene().camera, orbit(4));
    }
}
