//! SPDY/3.1 upgrade transport
//!
//! This crate turns an HTTP/1.1 connection into a multiplexed SPDY session
//! the way the Kubernetes API server expects for `pods/portforward`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   POST .../portforward     ┌──────────────────┐
//! │   UpgradeDialer  │ ─────────────────────────► │  control plane   │
//! │  (TCP or rustls) │ ◄───────────────────────── │ (accept_upgrade) │
//! └──────────────────┘   101 Switching Protocols  └──────────────────┘
//!          │
//!          ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │                      MuxSession                         │
//! │   writer task: FrameEncoder  │  reader task: FrameDecoder│
//! └─────────────────────────────────────────────────────────┘
//!          │ open_stream / accept_stream
//!          ↓
//!   MuxStream (AsyncRead + AsyncWrite) + StreamHandle
//! ```
//!
//! # Flow control
//!
//! SETTINGS and WINDOW_UPDATE frames are accepted and ignored. The peers this
//! talks to never exchange window updates, so windows are not enforced.

pub mod config;
pub mod dialer;
pub mod session;
pub mod stream;
pub mod tls;
pub mod upgrade;

pub use config::SessionConfig;
pub use dialer::{Endpoint, SessionDialer, UpgradeDialer};
pub use session::{MuxSession, PendingStream, Role, SessionStats};
pub use stream::{MuxStream, StreamHandle};
pub use tls::TlsSettings;
pub use upgrade::{accept_upgrade, UpgradedRequest};

use podtunnel_proto::{ProtoError, RstStatus, StreamId};
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Frame error: {0}")]
    Frame(#[from] ProtoError),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Upgrade rejected with status {status}: {body}")]
    UpgradeRejected { status: u16, body: String },

    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Stream {stream_id} refused by peer: {status}")]
    StreamRefused { stream_id: StreamId, status: RstStatus },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
