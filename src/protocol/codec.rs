//! Protocol codec for encoding/decoding cluster datagrams
//!
//! `ClusterMsgHandler` owns the outgoing sequence counter of one connection
//! endpoint and knows the fixed payload layout of every message kind.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{
    ClusterMessage, Frustum, Header, MessageType, Pose, SelectedMovement, HEADER_SIZE,
};

/// Largest whole datagram a u16-length transport frame can carry
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Longest command string whose datagram still fits one transport frame
pub const MAX_COMMAND_LEN: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE - 2;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated datagram: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Command string too long: {0} bytes (max: {1})")]
    StringTooLong(usize, usize),

    #[error("Command string is not valid UTF-8")]
    InvalidString,

    #[error("Message type {0} cannot be sent")]
    Unsendable(MessageType),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Decoded datagram with its sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sender's packet number, for diagnostics
    pub sequence: u32,
    /// The actual message
    pub message: ClusterMessage,
}

impl Frame {
    pub fn new(sequence: u32, message: ClusterMessage) -> Self {
        Self { sequence, message }
    }
}

/// Read cursor over a received datagram
///
/// Every getter checks the remaining length first, so a short datagram
/// yields `CodecError::Truncated` instead of garbage values.
#[derive(Debug, Clone)]
pub struct DatagramIterator {
    buf: Bytes,
}

impl DatagramIterator {
    pub fn new(datagram: Bytes) -> Self {
        Self { buf: datagram }
    }

    /// Bytes left after the cursor
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> CodecResult<()> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> CodecResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> CodecResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_f32(&mut self) -> CodecResult<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    /// Read `N` consecutive floats
    pub fn get_f32_array<const N: usize>(&mut self) -> CodecResult<[f32; N]> {
        self.ensure(N * 4)?;
        let mut values = [0.0f32; N];
        for value in values.iter_mut() {
            *value = self.buf.get_f32_le();
        }
        Ok(values)
    }

    /// Read a u16 length-prefixed UTF-8 string
    pub fn get_string(&mut self) -> CodecResult<String> {
        let len = self.get_u16()? as usize;
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidString)
    }
}

/// Decode only the 5-byte header of a datagram
pub fn peek_header(datagram: &[u8]) -> CodecResult<Header> {
    if datagram.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            remaining: datagram.len(),
        });
    }
    let sequence = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    let msg_type = MessageType::try_from(datagram[4])?;
    Ok(Header { sequence, msg_type })
}

fn put_floats(buf: &mut BytesMut, values: &[f32]) {
    for value in values {
        buf.put_f32_le(*value);
    }
}

/// Codec and packet sequencer for one connection endpoint
///
/// Not thread-safe: the counter increment is a plain `&mut self` update, so
/// one handler is driven by one loop.
#[derive(Debug)]
pub struct ClusterMsgHandler {
    packet_number: u32,
    name: String,
}

impl ClusterMsgHandler {
    /// Create a handler whose first outgoing datagram carries `packet_start`.
    ///
    /// `name` is attached to every log event this handler emits.
    pub fn new(packet_start: u32, name: impl Into<String>) -> Self {
        Self {
            packet_number: packet_start,
            name: name.into(),
        }
    }

    /// Sequence number the next datagram will carry
    pub fn packet_number(&self) -> u32 {
        self.packet_number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a datagram: sequence number (post-increment) then type tag
    fn begin(&mut self, msg_type: MessageType) -> BytesMut {
        let payload_len = msg_type.payload_len().unwrap_or(0);
        let mut datagram = BytesMut::with_capacity(HEADER_SIZE + payload_len);
        datagram.put_u32_le(self.packet_number);
        self.packet_number = self.packet_number.wrapping_add(1);
        datagram.put_u8(msg_type.into());
        datagram
    }

    fn make_pose_datagram(&mut self, msg_type: MessageType, xyz: [f32; 3], hpr: [f32; 3]) -> Bytes {
        let mut datagram = self.begin(msg_type);
        put_floats(&mut datagram, &xyz);
        put_floats(&mut datagram, &hpr);
        datagram.freeze()
    }

    pub fn make_cam_offset_datagram(&mut self, xyz: [f32; 3], hpr: [f32; 3]) -> Bytes {
        self.make_pose_datagram(MessageType::CamOffset, xyz, hpr)
    }

    pub fn make_cam_frustum_datagram(
        &mut self,
        focal_length: f32,
        film_size: [f32; 2],
        film_offset: [f32; 2],
    ) -> Bytes {
        let mut datagram = self.begin(MessageType::CamFrustum);
        datagram.put_f32_le(focal_length);
        put_floats(&mut datagram, &film_size);
        put_floats(&mut datagram, &film_offset);
        datagram.freeze()
    }

    pub fn make_cam_movement_datagram(&mut self, xyz: [f32; 3], hpr: [f32; 3]) -> Bytes {
        self.make_pose_datagram(MessageType::CamMovement, xyz, hpr)
    }

    pub fn make_selected_movement_datagram(
        &mut self,
        xyz: [f32; 3],
        hpr: [f32; 3],
        scale: [f32; 3],
    ) -> Bytes {
        let mut datagram = self.begin(MessageType::SelectedMovement);
        put_floats(&mut datagram, &xyz);
        put_floats(&mut datagram, &hpr);
        put_floats(&mut datagram, &scale);
        datagram.freeze()
    }

    /// Encode a command string.
    ///
    /// Fails before touching the sequence counter if the string does not fit
    /// the u16 length prefix.
    pub fn make_command_string_datagram(&mut self, command: &str) -> CodecResult<Bytes> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(CodecError::StringTooLong(command.len(), MAX_COMMAND_LEN));
        }
        let mut datagram = self.begin(MessageType::CommandString);
        datagram.reserve(2 + command.len());
        datagram.put_u16_le(command.len() as u16);
        datagram.put_slice(command.as_bytes());
        Ok(datagram.freeze())
    }

    pub fn make_swap_ready_datagram(&mut self) -> Bytes {
        self.begin(MessageType::SwapReady).freeze()
    }

    pub fn make_swap_now_datagram(&mut self) -> Bytes {
        self.begin(MessageType::SwapNow).freeze()
    }

    pub fn make_exit_datagram(&mut self) -> Bytes {
        self.begin(MessageType::Exit).freeze()
    }

    /// Encode any sendable message
    pub fn make_datagram(&mut self, message: &ClusterMessage) -> CodecResult<Bytes> {
        let datagram = match message {
            ClusterMessage::None => return Err(CodecError::Unsendable(MessageType::None)),
            ClusterMessage::CamOffset(pose) => self.make_cam_offset_datagram(pose.xyz, pose.hpr),
            ClusterMessage::CamFrustum(frustum) => self.make_cam_frustum_datagram(
                frustum.focal_length,
                frustum.film_size,
                frustum.film_offset,
            ),
            ClusterMessage::CamMovement(pose) => {
                self.make_cam_movement_datagram(pose.xyz, pose.hpr)
            }
            ClusterMessage::SwapReady => self.make_swap_ready_datagram(),
            ClusterMessage::SwapNow => self.make_swap_now_datagram(),
            ClusterMessage::CommandString(command) => {
                self.make_command_string_datagram(command)?
            }
            ClusterMessage::SelectedMovement(sel) => {
                self.make_selected_movement_datagram(sel.xyz, sel.hpr, sel.scale)
            }
            ClusterMessage::Exit => self.make_exit_datagram(),
        };
        Ok(datagram)
    }

    /// Decode the header and return a cursor positioned at the payload
    pub fn read_header(&self, datagram: &Bytes) -> CodecResult<(DatagramIterator, Header)> {
        let mut dgi = DatagramIterator::new(datagram.clone());
        let sequence = dgi.get_u32()?;
        let tag = dgi.get_u8()?;
        let msg_type = MessageType::try_from(tag).map_err(|e| {
            tracing::debug!(handler = %self.name, "Packet {} has unknown type {}", sequence, tag);
            e
        })?;
        tracing::debug!(handler = %self.name, "Packet {} type {} received", sequence, msg_type);
        Ok((dgi, Header { sequence, msg_type }))
    }

    pub fn parse_cam_offset_datagram(&self, dgi: &mut DatagramIterator) -> CodecResult<Pose> {
        let [x, y, z, h, p, r] = dgi.get_f32_array::<6>()?;
        tracing::debug!(
            handler = %self.name,
            "new offset={} {} {}  {} {} {}", x, y, z, h, p, r
        );
        Ok(Pose::new([x, y, z], [h, p, r]))
    }

    pub fn parse_cam_frustum_datagram(&self, dgi: &mut DatagramIterator) -> CodecResult<Frustum> {
        let focal_length = dgi.get_f32()?;
        let film_size = dgi.get_f32_array::<2>()?;
        let film_offset = dgi.get_f32_array::<2>()?;
        tracing::debug!(
            handler = %self.name,
            "fl, fs, fo={}, ({}, {}), ({}, {})",
            focal_length, film_size[0], film_size[1], film_offset[0], film_offset[1]
        );
        Ok(Frustum::new(focal_length, film_size, film_offset))
    }

    pub fn parse_cam_movement_datagram(&self, dgi: &mut DatagramIterator) -> CodecResult<Pose> {
        let [x, y, z, h, p, r] = dgi.get_f32_array::<6>()?;
        tracing::debug!(
            handler = %self.name,
            "new position={} {} {}  {} {} {}", x, y, z, h, p, r
        );
        Ok(Pose::new([x, y, z], [h, p, r]))
    }

    pub fn parse_selected_movement_datagram(
        &self,
        dgi: &mut DatagramIterator,
    ) -> CodecResult<SelectedMovement> {
        let xyz = dgi.get_f32_array::<3>()?;
        let hpr = dgi.get_f32_array::<3>()?;
        let scale = dgi.get_f32_array::<3>()?;
        tracing::debug!(
            handler = %self.name,
            "selected position={:?} hpr={:?} scale={:?}", xyz, hpr, scale
        );
        Ok(SelectedMovement::new(xyz, hpr, scale))
    }

    pub fn parse_command_string_datagram(&self, dgi: &mut DatagramIterator) -> CodecResult<String> {
        let command = dgi.get_string()?;
        tracing::debug!(handler = %self.name, "command string={:?}", command);
        Ok(command)
    }

    /// Parse the payload that follows a header of type `msg_type`
    pub fn parse_message(
        &self,
        msg_type: MessageType,
        dgi: &mut DatagramIterator,
    ) -> CodecResult<ClusterMessage> {
        let message = match msg_type {
            MessageType::None => ClusterMessage::None,
            MessageType::CamOffset => ClusterMessage::CamOffset(self.parse_cam_offset_datagram(dgi)?),
            MessageType::CamFrustum => {
                ClusterMessage::CamFrustum(self.parse_cam_frustum_datagram(dgi)?)
            }
            MessageType::CamMovement => {
                ClusterMessage::CamMovement(self.parse_cam_movement_datagram(dgi)?)
            }
            MessageType::SwapReady => ClusterMessage::SwapReady,
            MessageType::SwapNow => ClusterMessage::SwapNow,
            MessageType::CommandString => {
                ClusterMessage::CommandString(self.parse_command_string_datagram(dgi)?)
            }
            MessageType::SelectedMovement => {
                ClusterMessage::SelectedMovement(self.parse_selected_movement_datagram(dgi)?)
            }
            MessageType::Exit => ClusterMessage::Exit,
        };
        Ok(message)
    }

    /// Decode a complete datagram
    pub fn decode(&self, datagram: &Bytes) -> CodecResult<Frame> {
        let (mut dgi, header) = self.read_header(datagram)?;
        let message = self.parse_message(header.msg_type, &mut dgi)?;
        Ok(Frame::new(header.sequence, message))
    }
}
