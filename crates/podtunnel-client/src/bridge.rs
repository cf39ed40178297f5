//! Byte relays between the local connection and the data stream

use crate::error::{Direction, TunnelError};
use podtunnel_transport::{MuxStream, StreamHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

pub const COPY_BUFFER_SIZE: usize = 8192;

/// Relay `reader` into `writer` until EOF
///
/// Returns the number of bytes relayed or the first I/O failure tagged with
/// `direction`.
pub async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
) -> Result<u64, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|source| TunnelError::Copy { direction, source })?;
        if n == 0 {
            debug!("{} reached EOF after {} bytes", direction, total);
            return Ok(total);
        }

        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|source| TunnelError::Copy { direction, source })?;
        total += n as u64;
    }
}

/// Local connection into the data stream
///
/// Half-closes the data stream when done, whatever the result.
pub async fn local_to_remote(
    mut local: OwnedReadHalf,
    mut remote: WriteHalf<MuxStream>,
    data: StreamHandle,
) -> Result<u64, TunnelError> {
    let result = copy_direction(&mut local, &mut remote, Direction::LocalToRemote).await;

    if let Err(e) = data.close_write().await {
        debug!("Half-close of data stream {} failed: {}", data.stream_id(), e);
    }
    result
}

/// Data stream into the local connection
pub async fn remote_to_local(
    mut remote: ReadHalf<MuxStream>,
    mut local: OwnedWriteHalf,
) -> Result<u64, TunnelError> {
    let result = copy_direction(&mut remote, &mut local, Direction::RemoteToLocal).await;

    if result.is_ok() {
        if let Err(e) = local.shutdown().await {
            warn!("Failed to shut down local write side: {}", e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_larger_than_buffer() {
        let payload: Vec<u8> = (0..3 * COPY_BUFFER_SIZE + 17).map(|i| (i % 253) as u8).collect();
        let mut reader = &payload[..];
        let mut sink = Vec::new();

        let copied = copy_direction(&mut reader, &mut sink, Direction::LocalToRemote)
            .await
            .unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink, payload);
    }

    #[tokio::test]
    async fn test_copy_failure_names_direction() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let (_read, mut write) = tokio::io::split(client);
        let mut reader: &[u8] = b"payload";

        let err = copy_direction(&mut reader, &mut write, Direction::RemoteToLocal)
            .await
            .unwrap_err();
        assert_eq!(err.component(), "copy-remote-to-local");
    }
}
