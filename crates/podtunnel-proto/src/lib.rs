//! Port-forward protocol definitions
//!
//! This crate defines the wire format spoken between the tunnel client and the
//! control plane once the HTTP connection has been upgraded:
//!
//! - SPDY/3.1 control and data frames ([`frame`])
//! - zlib-compressed header blocks primed with the SPDY dictionary ([`headers`])
//! - the port-forward sub-protocol: upgrade tokens, request path and the
//!   headers that tag every sub-stream ([`portforward`])

pub mod frame;
pub mod headers;
pub mod portforward;

pub use frame::{
    ControlType, Frame, FrameDecoder, FrameEncoder, FrameFlags, GoAwayStatus, RstStatus,
    Setting, StreamId,
};
pub use headers::{HeaderBlock, HeaderCompressor, HeaderDecompressor};
pub use portforward::{StreamTag, StreamType};

use thiserror::Error;

/// SPDY protocol version carried in every control frame
pub const SPDY_VERSION: u16 = 3;

/// Largest payload a SPDY frame can describe (24-bit length field)
pub const MAX_FRAME_LENGTH: usize = 0x00ff_ffff;

/// Upper bound for a decompressed header block
pub const MAX_HEADER_BLOCK_SIZE: usize = 1024 * 1024;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SPDY version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid {frame} frame: {reason}")]
    InvalidFrame { frame: &'static str, reason: String },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Header compression error: {0}")]
    Compression(String),

    #[error("Header block too large: {0} bytes")]
    HeaderBlockTooLarge(usize),

    #[error("Malformed header block: {0}")]
    MalformedHeaders(String),

    #[error("Invalid header {name}: {value:?}")]
    InvalidHeader { name: String, value: String },
}

/// Result alias for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;
