//! Error and data sub-stream creation

use crate::error::TunnelError;
use podtunnel_proto::portforward::{StreamTag, StreamType};
use podtunnel_transport::{MuxSession, MuxStream};
use tracing::debug;

/// Fresh request id shared by one error/data pair
pub fn next_request_id() -> u32 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// The two sub-streams of one forwarded connection
#[derive(Debug)]
pub struct StreamPair {
    pub request_id: u32,
    /// Write side already closed; read until EOF for remote failures
    pub error: MuxStream,
    pub data: MuxStream,
}

async fn open(
    session: &MuxSession,
    stream_type: StreamType,
    port: u16,
    request_id: u32,
) -> Result<MuxStream, TunnelError> {
    let tag = StreamTag::new(stream_type, port, request_id);
    session
        .open_stream(tag.to_headers())
        .await
        .map_err(|source| TunnelError::StreamCreate {
            stream_type,
            port,
            source,
        })
}

/// Open the error stream, half-close it, then open the data stream
///
/// The data stream is not attempted when the error stream fails.
pub async fn open_stream_pair(
    session: &MuxSession,
    port: u16,
    request_id: u32,
) -> Result<StreamPair, TunnelError> {
    let error = open(session, StreamType::Error, port, request_id).await?;
    error
        .handle()
        .close_write()
        .await
        .map_err(|source| TunnelError::StreamCreate {
            stream_type: StreamType::Error,
            port,
            source,
        })?;
    debug!(
        "[{}] Error stream {} ready for request {}",
        session.connection_id(),
        error.stream_id(),
        request_id
    );

    let data = open(session, StreamType::Data, port, request_id).await?;
    debug!(
        "[{}] Data stream {} ready for request {}",
        session.connection_id(),
        data.stream_id(),
        request_id
    );

    Ok(StreamPair {
        request_id,
        error,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_vary() {
        let ids: std::collections::HashSet<u32> = (0..32).map(|_| next_request_id()).collect();
        assert!(ids.len() > 1);
    }
}
