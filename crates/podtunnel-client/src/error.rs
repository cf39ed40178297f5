//! Tunnel outcome and error types

use crate::kubeconfig::ConfigError;
use crate::locator::LocateError;
use podtunnel_proto::StreamType;
use podtunnel_transport::TransportError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Direction of a byte copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "local->remote"),
            Direction::RemoteToLocal => write!(f, "remote->local"),
        }
    }
}

/// Why a tunnel invocation failed
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Failed to locate target: {0}")]
    Locate(LocateError),

    #[error("Failed to dial {url}: {source}")]
    Dial {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to create {stream_type} stream for port {port}: {source}")]
    StreamCreate {
        stream_type: StreamType,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept local connection: {0}")]
    Accept(#[source] io::Error),

    #[error("No local connection within {0:?}")]
    AcceptTimeout(Duration),

    #[error("Copy {direction} failed: {source}")]
    Copy {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read error stream: {0}")]
    ErrorStream(#[source] io::Error),

    #[error("an error occurred forwarding {local_port} -> {remote_port}: {message}")]
    RemoteReported {
        local_port: u16,
        remote_port: u16,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TunnelError {
    /// Name of the component that failed
    pub fn component(&self) -> &'static str {
        match self {
            TunnelError::Precondition(_) => "precondition",
            TunnelError::Locate(_) => "locate",
            TunnelError::Dial { .. } => "dial",
            TunnelError::StreamCreate { .. } => "stream-create",
            TunnelError::Listen { .. } => "listen",
            TunnelError::Accept(_) | TunnelError::AcceptTimeout(_) => "accept",
            TunnelError::Copy {
                direction: Direction::LocalToRemote,
                ..
            } => "copy-local-to-remote",
            TunnelError::Copy {
                direction: Direction::RemoteToLocal,
                ..
            } => "copy-remote-to-local",
            TunnelError::ErrorStream(_) => "error-stream",
            TunnelError::RemoteReported { .. } => "remote",
            TunnelError::Config(_) => "config",
        }
    }
}

impl From<LocateError> for TunnelError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::NoPods { .. } => TunnelError::Precondition(err.to_string()),
            other => TunnelError::Locate(other),
        }
    }
}

/// Bytes relayed by a successful invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Address the local listener was bound to
    pub local_addr: SocketAddr,
    pub local_to_remote: u64,
    pub remote_to_local: u64,
}

/// Result of one tunnel invocation
pub type TunnelOutcome = Result<TunnelStats, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pods_is_precondition() {
        let err: TunnelError = LocateError::NoPods {
            namespace: "default".to_string(),
            selector: Some("app=web".to_string()),
        }
        .into();

        assert_eq!(err.component(), "precondition");
        assert!(err.to_string().contains("app=web"));
    }

    #[test]
    fn test_remote_reported_message() {
        let err = TunnelError::RemoteReported {
            local_port: 3000,
            remote_port: 8080,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "an error occurred forwarding 3000 -> 8080: connection refused"
        );
        assert_eq!(err.component(), "remote");
    }
}
