//! Protocol message definitions
//!
//! Defines the closed set of message kinds exchanged between a cluster
//! controller and its renderers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CodecError;

/// Message type tag carried in byte 4 of every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Sentinel for "no message"
    None = 0,
    CamOffset = 1,
    CamFrustum = 2,
    CamMovement = 3,
    SwapReady = 4,
    SwapNow = 5,
    CommandString = 6,
    SelectedMovement = 7,
    Exit = 100,
}

impl MessageType {
    /// Fixed payload width in bytes, or `None` for the variable-length command string
    pub fn payload_len(self) -> Option<usize> {
        match self {
            MessageType::None
            | MessageType::SwapReady
            | MessageType::SwapNow
            | MessageType::Exit => Some(0),
            MessageType::CamOffset | MessageType::CamMovement => Some(24),
            MessageType::CamFrustum => Some(20),
            MessageType::SelectedMovement => Some(36),
            MessageType::CommandString => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::None => "NONE",
            MessageType::CamOffset => "CAM_OFFSET",
            MessageType::CamFrustum => "CAM_FRUSTUM",
            MessageType::CamMovement => "CAM_MOVEMENT",
            MessageType::SwapReady => "SWAP_READY",
            MessageType::SwapNow => "SWAP_NOW",
            MessageType::CommandString => "COMMAND_STRING",
            MessageType::SelectedMovement => "SELECTED_MOVEMENT",
            MessageType::Exit => "EXIT",
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageType::None),
            1 => Ok(MessageType::CamOffset),
            2 => Ok(MessageType::CamFrustum),
            3 => Ok(MessageType::CamMovement),
            4 => Ok(MessageType::SwapReady),
            5 => Ok(MessageType::SwapNow),
            6 => Ok(MessageType::CommandString),
            7 => Ok(MessageType::SelectedMovement),
            100 => Ok(MessageType::Exit),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Position plus heading/pitch/roll orientation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position (x, y, z)
    pub xyz: [f32; 3],
    /// Orientation in degrees (heading, pitch, roll)
    pub hpr: [f32; 3],
}

impl Pose {
    pub fn new(xyz: [f32; 3], hpr: [f32; 3]) -> Self {
        Self { xyz, hpr }
    }
}

/// Lens parameters for a renderer's view frustum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    pub focal_length: f32,
    /// Film width and height
    pub film_size: [f32; 2],
    /// Film offset (x, y) from the optical axis
    pub film_offset: [f32; 2],
}

impl Frustum {
    pub fn new(focal_length: f32, film_size: [f32; 2], film_offset: [f32; 2]) -> Self {
        Self {
            focal_length,
            film_size,
            film_offset,
        }
    }
}

/// Transform of the currently selected scene object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectedMovement {
    pub xyz: [f32; 3],
    pub hpr: [f32; 3],
    pub scale: [f32; 3],
}

impl SelectedMovement {
    pub fn new(xyz: [f32; 3], hpr: [f32; 3], scale: [f32; 3]) -> Self {
        Self { xyz, hpr, scale }
    }
}

/// All cluster protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    /// Nothing to act on
    None,

    /// Fixed camera offset of one renderer relative to the shared camera
    CamOffset(Pose),

    /// Lens setup for one renderer
    CamFrustum(Frustum),

    /// Shared camera moved
    CamMovement(Pose),

    /// Renderer finished its frame and waits for the swap
    SwapReady,

    /// All renderers flip their buffers now
    SwapNow,

    /// Free-form command text
    CommandString(String),

    /// Selected object moved
    SelectedMovement(SelectedMovement),

    /// Renderer should shut down
    Exit,
}

impl ClusterMessage {
    /// Get the message type tag
    pub fn msg_type(&self) -> MessageType {
        match self {
            ClusterMessage::None => MessageType::None,
            ClusterMessage::CamOffset(_) => MessageType::CamOffset,
            ClusterMessage::CamFrustum(_) => MessageType::CamFrustum,
            ClusterMessage::CamMovement(_) => MessageType::CamMovement,
            ClusterMessage::SwapReady => MessageType::SwapReady,
            ClusterMessage::SwapNow => MessageType::SwapNow,
            ClusterMessage::CommandString(_) => MessageType::CommandString,
            ClusterMessage::SelectedMovement(_) => MessageType::SelectedMovement,
            ClusterMessage::Exit => MessageType::Exit,
        }
    }

    /// Check if this message is part of the swap barrier
    pub fn is_swap_control(&self) -> bool {
        matches!(self, ClusterMessage::SwapReady | ClusterMessage::SwapNow)
    }
}

/// Decoded 5-byte datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sequence: u32,
    pub msg_type: MessageType,
}
