//! SPDY stream implementation

use crate::session::SessionShared;
use crate::{TransportError, TransportResult};
use bytes::{Buf, Bytes};
use podtunnel_proto::{Frame, HeaderBlock, RstStatus, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

/// What the session reader hands to a stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset(RstStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    Eof,
    Reset(RstStatus),
    Aborted,
}

/// Cloneable control handle for a stream
///
/// Lets one task half-close or reset a stream while another task is blocked
/// reading or writing it.
#[derive(Clone)]
pub struct StreamHandle {
    stream_id: StreamId,
    frames: mpsc::Sender<Frame>,
    shared: Arc<SessionShared>,
    write_closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .field("write_closed", &self.write_closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl StreamHandle {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed.load(Ordering::SeqCst)
    }

    /// Send FIN; later calls are no-ops
    pub async fn close_write(&self) -> TransportResult<()> {
        if self.write_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(
            "[{}] Half-closing stream {}",
            self.shared.connection_id, self.stream_id
        );
        self.frames
            .send(Frame::fin(self.stream_id))
            .await
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Half-close and stop receiving
    ///
    /// Readers still waiting on the stream wake up with an error unless the
    /// peer already finished its side.
    pub async fn close(&self) -> TransportResult<()> {
        let result = if self.shared.is_closed() {
            self.write_closed.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            self.close_write().await
        };
        self.shared.release(self.stream_id);
        result
    }

    /// Abort the stream with RST_STREAM
    pub async fn reset(&self, status: RstStatus) -> TransportResult<()> {
        self.write_closed.store(true, Ordering::SeqCst);
        self.shared.release(self.stream_id);
        self.frames
            .send(Frame::rst(self.stream_id, status))
            .await
            .map_err(|_| TransportError::SessionClosed)
    }
}

/// One logical duplex channel of a [`MuxSession`](crate::MuxSession)
pub struct MuxStream {
    stream_id: StreamId,
    headers: HeaderBlock,
    inbound: mpsc::Receiver<StreamEvent>,
    pending: Bytes,
    read_state: ReadState,
    writer: PollSender<Frame>,
    handle: StreamHandle,
    max_data_frame_size: usize,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .field("headers", &self.headers)
            .field("read_state", &self.read_state)
            .finish()
    }
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: StreamId,
        headers: HeaderBlock,
        inbound: mpsc::Receiver<StreamEvent>,
        frames: mpsc::Sender<Frame>,
        shared: Arc<SessionShared>,
        max_data_frame_size: usize,
    ) -> Self {
        let handle = StreamHandle {
            stream_id,
            frames: frames.clone(),
            shared,
            write_closed: Arc::new(AtomicBool::new(false)),
        };

        Self {
            stream_id,
            headers,
            inbound,
            pending: Bytes::new(),
            read_state: ReadState::Open,
            writer: PollSender::new(frames),
            handle,
            max_data_frame_size,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Headers the stream was created with
    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match this.read_state {
                ReadState::Open => {}
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Reset(status) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("stream {} reset: {}", this.stream_id, status),
                    )))
                }
                ReadState::Aborted => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("stream {} closed before FIN", this.stream_id),
                    )))
                }
            }

            this.read_state = match ready!(this.inbound.poll_recv(cx)) {
                Some(StreamEvent::Data(data)) => {
                    this.pending = data;
                    ReadState::Open
                }
                Some(StreamEvent::Fin) => ReadState::Eof,
                Some(StreamEvent::Reset(status)) => ReadState::Reset(status),
                None => ReadState::Aborted,
            };
        }
    }
}

fn broken_pipe(stream_id: StreamId) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("stream {} is closed for writing", stream_id),
    )
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.handle.is_write_closed() {
            return Poll::Ready(Err(broken_pipe(this.stream_id)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe(this.stream_id)));
        }

        // A concurrent close_write may have won while we waited
        if this.handle.is_write_closed() {
            this.writer.abort_send();
            return Poll::Ready(Err(broken_pipe(this.stream_id)));
        }

        let n = buf.len().min(this.max_data_frame_size);
        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n]));
        if this.writer.send_item(frame).is_err() {
            return Poll::Ready(Err(broken_pipe(this.stream_id)));
        }

        this.handle
            .shared
            .bytes_sent
            .fetch_add(n as u64, Ordering::Relaxed);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are queued in order; the session writer flushes them
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.handle.is_write_closed() {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.writer.poll_reserve(cx)).is_err() {
            // Session is gone; nothing left to finish
            this.handle.write_closed.store(true, Ordering::SeqCst);
            return Poll::Ready(Ok(()));
        }

        if this.handle.write_closed.swap(true, Ordering::SeqCst) {
            this.writer.abort_send();
            return Poll::Ready(Ok(()));
        }

        debug!(
            "[{}] Half-closing stream {}",
            this.handle.shared.connection_id, this.stream_id
        );
        let _ = this.writer.send_item(Frame::fin(this.stream_id));
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.handle.shared.release(self.stream_id);
    }
}
