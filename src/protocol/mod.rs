//! Protocol module - Defines the cluster synchronization wire protocol
//!
//! Every datagram uses a compact fixed-width little-endian layout:
//! - 4 bytes sequence number
//! - 1 byte message type
//! - Fixed-layout payload (type dependent, may be empty)
//!
//! The sequence number is diagnostic only. Ordering and delivery are the
//! transport's job.

mod codec;
mod message;
mod reader;
mod sequence;

pub use codec::*;
pub use message::*;
pub use reader::*;
pub use sequence::*;

/// Default port for the render-cluster control channel
pub const CLUSTER_SERVER_PORT: u16 = 1970;

/// Port used by the renderer launch daemon (not part of this protocol)
pub const CLUSTER_DAEMON_PORT: u16 = 8001;

/// Header size: sequence(4) + type(1) = 5 bytes
pub const HEADER_SIZE: usize = 5;

/// Default first packet number for a controller handler
pub const CONTROLLER_PACKET_START: u32 = 1_000_000;

/// Default first packet number for a renderer handler
pub const RENDERER_PACKET_START: u32 = 2_000_000;
