//! SPDY/3.1 framing
//!
//! Control frame:
//!
//! ```text
//! +----------------------------------+
//! |C| Version(15bits) | Type(16bits) |
//! +----------------------------------+
//! | Flags (8)  |  Length (24 bits)   |
//! +----------------------------------+
//! |               Data               |
//! +----------------------------------+
//! ```
//!
//! Data frame:
//!
//! ```text
//! +----------------------------------+
//! |C|       Stream-ID (31bits)       |
//! +----------------------------------+
//! | Flags (8)  |  Length (24 bits)   |
//! +----------------------------------+
//! |               Data               |
//! +----------------------------------+
//! ```

use crate::headers::{HeaderBlock, HeaderCompressor, HeaderDecompressor};
use crate::{ProtoError, ProtoResult, MAX_FRAME_LENGTH, SPDY_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Stream identifier (31 bits on the wire)
pub type StreamId = u32;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;
const CONTROL_BIT: u32 = 0x8000_0000;

/// Frame header size shared by control and data frames
pub const HEADER_SIZE: usize = 8;

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0x01;
    /// Only meaningful on SYN_STREAM
    pub const UNIDIRECTIONAL: u8 = 0x02;
    /// Only meaningful on SETTINGS
    pub const CLEAR_SETTINGS: u8 = 0x01;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_unidirectional(mut self) -> Self {
        self.0 |= Self::UNIDIRECTIONAL;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_unidirectional(&self) -> bool {
        self.0 & Self::UNIDIRECTIONAL != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Control frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlType {
    SynStream = 1,
    SynReply = 2,
    RstStream = 3,
    Settings = 4,
    Ping = 6,
    GoAway = 7,
    Headers = 8,
    WindowUpdate = 9,
}

impl ControlType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::SynStream),
            2 => Some(Self::SynReply),
            3 => Some(Self::RstStream),
            4 => Some(Self::Settings),
            6 => Some(Self::Ping),
            7 => Some(Self::GoAway),
            8 => Some(Self::Headers),
            9 => Some(Self::WindowUpdate),
            _ => None,
        }
    }
}

/// RST_STREAM status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RstStatus {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    StreamInUse,
    StreamAlreadyClosed,
    FrameTooLarge,
    Unknown(u32),
}

impl RstStatus {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::ProtocolError,
            2 => Self::InvalidStream,
            3 => Self::RefusedStream,
            4 => Self::UnsupportedVersion,
            5 => Self::Cancel,
            6 => Self::InternalError,
            7 => Self::FlowControlError,
            8 => Self::StreamInUse,
            9 => Self::StreamAlreadyClosed,
            11 => Self::FrameTooLarge,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Self::ProtocolError => 1,
            Self::InvalidStream => 2,
            Self::RefusedStream => 3,
            Self::UnsupportedVersion => 4,
            Self::Cancel => 5,
            Self::InternalError => 6,
            Self::FlowControlError => 7,
            Self::StreamInUse => 8,
            Self::StreamAlreadyClosed => 9,
            Self::FrameTooLarge => 11,
            Self::Unknown(other) => *other,
        }
    }
}

impl std::fmt::Display for RstStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            Self::InvalidStream => write!(f, "INVALID_STREAM"),
            Self::RefusedStream => write!(f, "REFUSED_STREAM"),
            Self::UnsupportedVersion => write!(f, "UNSUPPORTED_VERSION"),
            Self::Cancel => write!(f, "CANCEL"),
            Self::InternalError => write!(f, "INTERNAL_ERROR"),
            Self::FlowControlError => write!(f, "FLOW_CONTROL_ERROR"),
            Self::StreamInUse => write!(f, "STREAM_IN_USE"),
            Self::StreamAlreadyClosed => write!(f, "STREAM_ALREADY_CLOSED"),
            Self::FrameTooLarge => write!(f, "FRAME_TOO_LARGE"),
            Self::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// GOAWAY status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayStatus {
    Ok,
    ProtocolError,
    InternalError,
    Unknown(u32),
}

impl GoAwayStatus {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::ProtocolError,
            2 => Self::InternalError,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::ProtocolError => 1,
            Self::InternalError => 2,
            Self::Unknown(other) => *other,
        }
    }
}

/// One SETTINGS entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    /// 24-bit identifier
    pub id: u32,
    pub value: u32,
}

/// A decoded SPDY/3.1 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        flags: FrameFlags,
        payload: Bytes,
    },
    SynStream {
        stream_id: StreamId,
        associated_to: StreamId,
        priority: u8,
        flags: FrameFlags,
        headers: HeaderBlock,
    },
    SynReply {
        stream_id: StreamId,
        flags: FrameFlags,
        headers: HeaderBlock,
    },
    RstStream {
        stream_id: StreamId,
        status: RstStatus,
    },
    Settings {
        flags: FrameFlags,
        entries: Vec<Setting>,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: StreamId,
        status: GoAwayStatus,
    },
    Headers {
        stream_id: StreamId,
        flags: FrameFlags,
        headers: HeaderBlock,
    },
    WindowUpdate {
        stream_id: StreamId,
        delta: u32,
    },
}

impl Frame {
    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Frame::Data {
            stream_id,
            flags: FrameFlags::new(),
            payload,
        }
    }

    /// Empty data frame carrying FIN (half-close)
    pub fn fin(stream_id: StreamId) -> Self {
        Frame::Data {
            stream_id,
            flags: FrameFlags::new().with_fin(),
            payload: Bytes::new(),
        }
    }

    pub fn syn_stream(stream_id: StreamId, headers: HeaderBlock) -> Self {
        Frame::SynStream {
            stream_id,
            associated_to: 0,
            priority: 0,
            flags: FrameFlags::new(),
            headers,
        }
    }

    pub fn syn_reply(stream_id: StreamId, headers: HeaderBlock) -> Self {
        Frame::SynReply {
            stream_id,
            flags: FrameFlags::new(),
            headers,
        }
    }

    pub fn rst(stream_id: StreamId, status: RstStatus) -> Self {
        Frame::RstStream { stream_id, status }
    }

    pub fn goaway(last_good_stream_id: StreamId) -> Self {
        Frame::GoAway {
            last_good_stream_id,
            status: GoAwayStatus::Ok,
        }
    }

    /// Stream the frame belongs to, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::SynStream { stream_id, .. }
            | Frame::SynReply { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => Some(*stream_id),
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => None,
        }
    }

    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::SynStream { .. } => "SYN_STREAM",
            Frame::SynReply { .. } => "SYN_REPLY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::Headers { .. } => "HEADERS",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
        }
    }
}

fn put_control_header(dst: &mut BytesMut, kind: ControlType, flags: u8, length: usize) {
    dst.put_u16(0x8000 | SPDY_VERSION);
    dst.put_u16(kind as u16);
    dst.put_u32(((flags as u32) << 24) | length as u32);
}

fn check_length(length: usize) -> ProtoResult<()> {
    if length > MAX_FRAME_LENGTH {
        return Err(ProtoError::FrameTooLarge(length));
    }
    Ok(())
}

/// Frame encoder owning the outbound header compression context
#[derive(Debug)]
pub struct FrameEncoder {
    compressor: HeaderCompressor,
}

impl FrameEncoder {
    pub fn new() -> ProtoResult<Self> {
        Ok(Self {
            compressor: HeaderCompressor::new()?,
        })
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Data {
                stream_id,
                flags,
                payload,
            } => {
                check_length(payload.len())?;
                dst.reserve(HEADER_SIZE + payload.len());
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(((flags.as_u8() as u32) << 24) | payload.len() as u32);
                dst.put(payload);
            }
            Frame::SynStream {
                stream_id,
                associated_to,
                priority,
                flags,
                headers,
            } => {
                let block = self.compressor.compress(&headers)?;
                let length = 10 + block.len();
                check_length(length)?;
                dst.reserve(HEADER_SIZE + length);
                put_control_header(dst, ControlType::SynStream, flags.as_u8(), length);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(associated_to & STREAM_ID_MASK);
                dst.put_u8((priority & 0x07) << 5);
                dst.put_u8(0); // slot
                dst.put(block);
            }
            Frame::SynReply {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.compressor.compress(&headers)?;
                let length = 4 + block.len();
                check_length(length)?;
                dst.reserve(HEADER_SIZE + length);
                put_control_header(dst, ControlType::SynReply, flags.as_u8(), length);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put(block);
            }
            Frame::Headers {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.compressor.compress(&headers)?;
                let length = 4 + block.len();
                check_length(length)?;
                dst.reserve(HEADER_SIZE + length);
                put_control_header(dst, ControlType::Headers, flags.as_u8(), length);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put(block);
            }
            Frame::RstStream { stream_id, status } => {
                put_control_header(dst, ControlType::RstStream, 0, 8);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(status.as_u32());
            }
            Frame::Settings { flags, entries } => {
                let length = 4 + entries.len() * 8;
                check_length(length)?;
                dst.reserve(HEADER_SIZE + length);
                put_control_header(dst, ControlType::Settings, flags.as_u8(), length);
                dst.put_u32(entries.len() as u32);
                for entry in entries {
                    dst.put_u32(((entry.flags as u32) << 24) | (entry.id & 0x00ff_ffff));
                    dst.put_u32(entry.value);
                }
            }
            Frame::Ping { id } => {
                put_control_header(dst, ControlType::Ping, 0, 4);
                dst.put_u32(id);
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                put_control_header(dst, ControlType::GoAway, 0, 8);
                dst.put_u32(last_good_stream_id & STREAM_ID_MASK);
                dst.put_u32(status.as_u32());
            }
            Frame::WindowUpdate { stream_id, delta } => {
                put_control_header(dst, ControlType::WindowUpdate, 0, 8);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(delta & STREAM_ID_MASK);
            }
        }
        Ok(())
    }
}

/// Frame decoder owning the inbound header compression context
#[derive(Debug, Default)]
pub struct FrameDecoder {
    decompressor: HeaderDecompressor,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_control(
        &mut self,
        version: u16,
        kind: u16,
        flags: FrameFlags,
        mut payload: Bytes,
    ) -> ProtoResult<Option<Frame>> {
        if version != SPDY_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let Some(kind) = ControlType::from_u16(kind) else {
            trace!("Skipping unknown control frame type {}", kind);
            return Ok(None);
        };

        let frame = match kind {
            ControlType::SynStream => {
                require_min(&payload, 10, "SYN_STREAM")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let associated_to = payload.get_u32() & STREAM_ID_MASK;
                let priority = payload.get_u8() >> 5;
                let _slot = payload.get_u8();
                require_stream_id(stream_id, "SYN_STREAM")?;
                Frame::SynStream {
                    stream_id,
                    associated_to,
                    priority,
                    flags,
                    headers: self.decompressor.decompress(&payload)?,
                }
            }
            ControlType::SynReply => {
                require_min(&payload, 4, "SYN_REPLY")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                require_stream_id(stream_id, "SYN_REPLY")?;
                Frame::SynReply {
                    stream_id,
                    flags,
                    headers: self.decompressor.decompress(&payload)?,
                }
            }
            ControlType::Headers => {
                require_min(&payload, 4, "HEADERS")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                require_stream_id(stream_id, "HEADERS")?;
                Frame::Headers {
                    stream_id,
                    flags,
                    headers: self.decompressor.decompress(&payload)?,
                }
            }
            ControlType::RstStream => {
                require_exact(&payload, 8, "RST_STREAM")?;
                Frame::RstStream {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: RstStatus::from_u32(payload.get_u32()),
                }
            }
            ControlType::Settings => {
                require_min(&payload, 4, "SETTINGS")?;
                let count = payload.get_u32() as usize;
                if payload.remaining() != count.saturating_mul(8) {
                    return Err(ProtoError::InvalidFrame {
                        frame: "SETTINGS",
                        reason: format!(
                            "{} entries do not match {} payload bytes",
                            count,
                            payload.remaining()
                        ),
                    });
                }
                let entries = (0..count)
                    .map(|_| {
                        let head = payload.get_u32();
                        Setting {
                            flags: (head >> 24) as u8,
                            id: head & 0x00ff_ffff,
                            value: payload.get_u32(),
                        }
                    })
                    .collect();
                Frame::Settings { flags, entries }
            }
            ControlType::Ping => {
                require_exact(&payload, 4, "PING")?;
                Frame::Ping {
                    id: payload.get_u32(),
                }
            }
            ControlType::GoAway => {
                require_exact(&payload, 8, "GOAWAY")?;
                Frame::GoAway {
                    last_good_stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: GoAwayStatus::from_u32(payload.get_u32()),
                }
            }
            ControlType::WindowUpdate => {
                require_exact(&payload, 8, "WINDOW_UPDATE")?;
                Frame::WindowUpdate {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    delta: payload.get_u32() & STREAM_ID_MASK,
                }
            }
        };

        Ok(Some(frame))
    }
}

fn require_min(payload: &Bytes, min: usize, frame: &'static str) -> ProtoResult<()> {
    if payload.len() < min {
        return Err(ProtoError::InvalidFrame {
            frame,
            reason: format!("payload of {} bytes is shorter than {}", payload.len(), min),
        });
    }
    Ok(())
}

fn require_exact(payload: &Bytes, len: usize, frame: &'static str) -> ProtoResult<()> {
    if payload.len() != len {
        return Err(ProtoError::InvalidFrame {
            frame,
            reason: format!("expected {} payload bytes, got {}", len, payload.len()),
        });
    }
    Ok(())
}

fn require_stream_id(stream_id: StreamId, frame: &'static str) -> ProtoResult<()> {
    if stream_id == 0 {
        return Err(ProtoError::InvalidFrame {
            frame,
            reason: "stream id 0".to_string(),
        });
    }
    Ok(())
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let first = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let second = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
            let flags = FrameFlags::from_u8((second >> 24) as u8);
            let length = (second & 0x00ff_ffff) as usize;

            if src.len() < HEADER_SIZE + length {
                src.reserve(HEADER_SIZE + length - src.len());
                return Ok(None);
            }

            src.advance(HEADER_SIZE);
            let payload = src.split_to(length).freeze();

            if first & CONTROL_BIT == 0 {
                let stream_id = first & STREAM_ID_MASK;
                require_stream_id(stream_id, "DATA")?;
                return Ok(Some(Frame::Data {
                    stream_id,
                    flags,
                    payload,
                }));
            }

            let version = ((first >> 16) & 0x7fff) as u16;
            let kind = (first & 0xffff) as u16;
            if let Some(frame) = self.decode_control(version, kind, flags, payload)? {
                return Ok(Some(frame));
            }
        }
    }
}
