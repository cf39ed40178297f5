//! Multiplexed SPDY session
//!
//! A session owns two driver tasks. The writer task owns the outbound
//! compression context and drains a frame queue shared by every stream. The
//! reader task owns the inbound context and routes frames to streams, pending
//! opens and the accept queue.

use crate::config::SessionConfig;
use crate::stream::{MuxStream, StreamEvent};
use crate::{TransportError, TransportResult};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use podtunnel_proto::{Frame, FrameDecoder, FrameEncoder, HeaderBlock, RstStatus, StreamId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Which end of the upgrade this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd-numbered streams
    Client,
    /// Opens even-numbered streams
    Server,
}

impl Role {
    fn first_stream_id(&self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` was opened by this side
    fn is_local(&self, stream_id: StreamId) -> bool {
        stream_id % 2 == self.first_stream_id() % 2
    }
}

type OpenReply = Result<(), RstStatus>;

/// State shared between the session, its streams and the driver tasks
pub(crate) struct SessionShared {
    pub(crate) connection_id: String,
    streams: Mutex<HashMap<StreamId, mpsc::Sender<StreamEvent>>>,
    pending_opens: Mutex<HashMap<StreamId, oneshot::Sender<OpenReply>>>,
    closed: AtomicBool,
    pub(crate) bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl SessionShared {
    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, mpsc::Sender<StreamEvent>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_opens(&self) -> MutexGuard<'_, HashMap<StreamId, oneshot::Sender<OpenReply>>> {
        self.pending_opens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, stream_id: StreamId, inbound: mpsc::Sender<StreamEvent>) {
        self.streams().insert(stream_id, inbound);
    }

    /// Stop routing inbound frames to a stream
    pub(crate) fn release(&self, stream_id: StreamId) {
        self.streams().remove(&stream_id);
    }

    fn inbound(&self, stream_id: StreamId) -> Option<mpsc::Sender<StreamEvent>> {
        self.streams().get(&stream_id).cloned()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Drop every route so blocked readers and openers wake up
    fn clear(&self) {
        self.streams().clear();
        self.pending_opens().clear();
    }
}

/// Session statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_streams: usize,
}

/// A live SPDY/3.1 session over an upgraded connection
pub struct MuxSession {
    shared: Arc<SessionShared>,
    role: Role,
    config: SessionConfig,
    frames: mpsc::Sender<Frame>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<PendingStream>>,
    next_stream_id: AtomicU32,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("connection_id", &self.shared.connection_id)
            .field("role", &self.role)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl MuxSession {
    /// Start a session over `io`
    ///
    /// `leftover` holds bytes read past the HTTP head during the upgrade.
    pub fn new<T>(
        io: T,
        leftover: BytesMut,
        role: Role,
        config: SessionConfig,
    ) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let connection_id = match role {
            Role::Client => format!("spdy-client-{}", uuid::Uuid::new_v4()),
            Role::Server => format!("spdy-server-{}", uuid::Uuid::new_v4()),
        };

        let shared = Arc::new(SessionShared {
            connection_id,
            streams: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });

        let (read_half, write_half) = tokio::io::split(io);
        let (frames_tx, frames_rx) = mpsc::channel(config.outbound_queue);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue);
        let shutdown = CancellationToken::new();

        let writer = FramedWrite::new(write_half, FrameEncoder::new()?);
        let mut reader = FramedRead::new(read_half, FrameDecoder::new());
        reader.read_buffer_mut().extend_from_slice(&leftover);

        let writer_task = tokio::spawn(run_writer(
            shared.clone(),
            writer,
            frames_rx,
            shutdown.clone(),
        ));
        let reader_task = tokio::spawn(run_reader(
            ReaderContext {
                shared: shared.clone(),
                role,
                frames: frames_tx.clone(),
                accept_tx,
                inbound_queue: config.inbound_queue,
                max_data_frame_size: config.max_data_frame_size,
            },
            reader,
            shutdown.clone(),
        ));

        debug!("[{}] Session started", shared.connection_id);

        Ok(Self {
            shared,
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            config,
            frames: frames_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            active_streams: self.shared.streams().len(),
        }
    }

    /// Open a stream and wait until the peer acknowledges it with SYN_REPLY
    pub async fn open_stream(&self, headers: HeaderBlock) -> TransportResult<MuxStream> {
        if self.shared.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        if stream_id > MAX_STREAM_ID {
            return Err(TransportError::ProtocolError(
                "Stream ids exhausted".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.register(stream_id, inbound_tx);
        self.shared.pending_opens().insert(stream_id, reply_tx);

        debug!(
            "[{}] Opening stream {} {:?}",
            self.shared.connection_id, stream_id, headers
        );

        if self
            .frames
            .send(Frame::syn_stream(stream_id, headers.clone()))
            .await
            .is_err()
        {
            self.forget(stream_id);
            return Err(TransportError::SessionClosed);
        }

        let reply = match self.config.stream_create_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(stream_id);
                    let _ = self.frames.try_send(Frame::rst(stream_id, RstStatus::Cancel));
                    warn!(
                        "[{}] Stream {} not acknowledged within {:?}",
                        self.shared.connection_id, stream_id, limit
                    );
                    return Err(TransportError::Timeout);
                }
            },
            None => reply_rx.await,
        };

        match reply {
            Ok(Ok(())) => {
                debug!(
                    "[{}] Stream {} acknowledged",
                    self.shared.connection_id, stream_id
                );
                Ok(MuxStream::new(
                    stream_id,
                    headers,
                    inbound_rx,
                    self.frames.clone(),
                    self.shared.clone(),
                    self.config.max_data_frame_size,
                ))
            }
            Ok(Err(status)) => {
                self.forget(stream_id);
                Err(TransportError::StreamRefused { stream_id, status })
            }
            Err(_) => {
                self.forget(stream_id);
                Err(TransportError::SessionClosed)
            }
        }
    }

    fn forget(&self, stream_id: StreamId) {
        self.shared.release(stream_id);
        self.shared.pending_opens().remove(&stream_id);
    }

    /// Wait for the peer to open a stream
    ///
    /// Returns `None` once the session has closed.
    pub async fn accept_stream(&self) -> Option<PendingStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await
    }

    /// Send GOAWAY and stop both driver tasks
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        if tasks.is_empty() {
            return;
        }

        debug!("[{}] Closing session", self.shared.connection_id);

        if !self.shared.is_closed() {
            let last_good = self
                .next_stream_id
                .load(Ordering::SeqCst)
                .saturating_sub(2)
                .min(MAX_STREAM_ID);
            let _ = self.frames.try_send(Frame::goaway(last_good));
        }
        self.shared.mark_closed();
        self.shutdown.cancel();

        for mut task in tasks {
            if tokio::time::timeout(self.config.close_grace, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "[{}] Session task did not stop within {:?}, aborting",
                    self.shared.connection_id, self.config.close_grace
                );
                task.abort();
            }
        }

        self.shared.clear();
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.mark_closed();
        self.shutdown.cancel();
    }
}

async fn run_writer<W>(
    shared: Arc<SessionShared>,
    mut writer: FramedWrite<W, FrameEncoder>,
    mut frames: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let conn_id = shared.connection_id.clone();

    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = shutdown.cancelled() => {
                // Flush whatever was queued before the close, GOAWAY included
                while let Ok(frame) = frames.try_recv() {
                    if writer.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = writer.flush().await;
                break;
            }
        };

        let Some(frame) = frame else {
            break;
        };

        trace!("[{}] -> {} {:?}", conn_id, frame.kind(), frame.stream_id());
        if let Err(e) = writer.feed(frame).await {
            error!("[{}] Failed to write frame: {}", conn_id, e);
            break;
        }

        // Batch whatever is already queued into one flush
        let mut failed = false;
        while let Ok(frame) = frames.try_recv() {
            trace!("[{}] -> {} {:?}", conn_id, frame.kind(), frame.stream_id());
            if let Err(e) = writer.feed(frame).await {
                error!("[{}] Failed to write frame: {}", conn_id, e);
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }

        if let Err(e) = writer.flush().await {
            debug!("[{}] Flush failed: {}", conn_id, e);
            break;
        }
    }

    shared.mark_closed();
    shutdown.cancel();
    if let Err(e) = writer.get_mut().shutdown().await {
        trace!("[{}] Write shutdown: {}", conn_id, e);
    }
    debug!("[{}] Writer stopped", conn_id);
}

struct ReaderContext {
    shared: Arc<SessionShared>,
    role: Role,
    frames: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<PendingStream>,
    inbound_queue: usize,
    max_data_frame_size: usize,
}

async fn run_reader<R>(
    ctx: ReaderContext,
    mut reader: FramedRead<R, FrameDecoder>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let conn_id = ctx.shared.connection_id.clone();

    loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = shutdown.cancelled() => break,
        };

        match next {
            Some(Ok(frame)) => {
                trace!("[{}] <- {} {:?}", conn_id, frame.kind(), frame.stream_id());
                ctx.dispatch(frame).await;
            }
            Some(Err(e)) => {
                error!("[{}] Failed to read frame: {}", conn_id, e);
                break;
            }
            None => {
                debug!("[{}] Peer closed the connection", conn_id);
                break;
            }
        }
    }

    ctx.shared.mark_closed();
    ctx.shared.clear();
    shutdown.cancel();
    debug!("[{}] Reader stopped", conn_id);
}

impl ReaderContext {
    async fn deliver(&self, stream_id: StreamId, event: StreamEvent) {
        let Some(inbound) = self.shared.inbound(stream_id) else {
            trace!(
                "[{}] Dropping {:?} for unknown stream {}",
                self.shared.connection_id,
                event,
                stream_id
            );
            return;
        };

        // A dropped receiver means nobody reads this stream any more
        if inbound.send(event).await.is_err() {
            self.shared.release(stream_id);
        }
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Data {
                stream_id,
                flags,
                payload,
            } => {
                self.shared
                    .bytes_received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                if !payload.is_empty() {
                    self.deliver(stream_id, StreamEvent::Data(payload)).await;
                }
                if flags.has_fin() {
                    self.deliver(stream_id, StreamEvent::Fin).await;
                    self.shared.release(stream_id);
                }
            }
            Frame::SynReply {
                stream_id, flags, ..
            } => {
                match self.shared.pending_opens().remove(&stream_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(()));
                    }
                    None => debug!(
                        "[{}] SYN_REPLY for stream {} that is not opening",
                        self.shared.connection_id, stream_id
                    ),
                }
                if flags.has_fin() {
                    self.deliver(stream_id, StreamEvent::Fin).await;
                    self.shared.release(stream_id);
                }
            }
            Frame::RstStream { stream_id, status } => {
                debug!(
                    "[{}] Stream {} reset by peer: {}",
                    self.shared.connection_id, stream_id, status
                );
                let pending = self.shared.pending_opens().remove(&stream_id);
                match pending {
                    Some(reply) => {
                        let _ = reply.send(Err(status));
                    }
                    None => {
                        if let Some(inbound) = self.shared.inbound(stream_id) {
                            let _ = inbound.try_send(StreamEvent::Reset(status));
                        }
                    }
                }
                self.shared.release(stream_id);
            }
            Frame::SynStream {
                stream_id,
                flags,
                headers,
                ..
            } => self.incoming_stream(stream_id, flags.has_fin(), headers).await,
            Frame::Headers {
                stream_id, flags, ..
            } => {
                if flags.has_fin() {
                    self.deliver(stream_id, StreamEvent::Fin).await;
                    self.shared.release(stream_id);
                }
            }
            Frame::Ping { id } => {
                // Even ids come from servers, odd ids from clients
                let from_peer = match self.role {
                    Role::Client => id % 2 == 0,
                    Role::Server => id % 2 == 1,
                };
                if from_peer {
                    let _ = self.frames.send(Frame::Ping { id }).await;
                }
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                debug!(
                    "[{}] GOAWAY from peer (last stream {}, status {:?})",
                    self.shared.connection_id, last_good_stream_id, status
                );
                self.shared.mark_closed();
            }
            Frame::Settings { .. } | Frame::WindowUpdate { .. } => {}
        }
    }

    async fn incoming_stream(&self, stream_id: StreamId, fin: bool, headers: HeaderBlock) {
        if self.role.is_local(stream_id) {
            warn!(
                "[{}] Peer opened stream {} with our parity",
                self.shared.connection_id, stream_id
            );
            let _ = self
                .frames
                .send(Frame::rst(stream_id, RstStatus::ProtocolError))
                .await;
            return;
        }

        if self.shared.is_closed() || self.shared.inbound(stream_id).is_some() {
            let status = if self.shared.is_closed() {
                RstStatus::RefusedStream
            } else {
                RstStatus::StreamInUse
            };
            let _ = self.frames.send(Frame::rst(stream_id, status)).await;
            return;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_queue);
        if fin {
            let _ = inbound_tx.try_send(StreamEvent::Fin);
        } else {
            self.shared.register(stream_id, inbound_tx);
        }

        let pending = PendingStream {
            stream_id,
            headers,
            inbound: inbound_rx,
            frames: self.frames.clone(),
            shared: self.shared.clone(),
            max_data_frame_size: self.max_data_frame_size,
        };

        debug!(
            "[{}] Incoming stream {} {:?}",
            self.shared.connection_id, stream_id, pending.headers
        );

        if let Err(e) = self.accept_tx.try_send(pending) {
            warn!(
                "[{}] Refusing stream {}: accept queue unavailable",
                self.shared.connection_id, stream_id
            );
            let pending = match e {
                mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
            };
            pending.refuse(RstStatus::RefusedStream);
        }
    }
}

/// A stream opened by the peer, waiting to be accepted or rejected
pub struct PendingStream {
    stream_id: StreamId,
    headers: HeaderBlock,
    inbound: mpsc::Receiver<StreamEvent>,
    frames: mpsc::Sender<Frame>,
    shared: Arc<SessionShared>,
    max_data_frame_size: usize,
}

impl std::fmt::Debug for PendingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingStream")
            .field("stream_id", &self.stream_id)
            .field("headers", &self.headers)
            .finish()
    }
}

impl PendingStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }

    /// Acknowledge with SYN_REPLY
    pub async fn accept(self) -> TransportResult<MuxStream> {
        self.frames
            .send(Frame::syn_reply(self.stream_id, HeaderBlock::new()))
            .await
            .map_err(|_| TransportError::SessionClosed)?;

        Ok(MuxStream::new(
            self.stream_id,
            self.headers,
            self.inbound,
            self.frames,
            self.shared,
            self.max_data_frame_size,
        ))
    }

    /// Refuse with RST_STREAM
    pub async fn reject(self, status: RstStatus) -> TransportResult<()> {
        self.shared.release(self.stream_id);
        self.frames
            .send(Frame::rst(self.stream_id, status))
            .await
            .map_err(|_| TransportError::SessionClosed)
    }

    // Used from the reader task, which must not wait on its own queue
    fn refuse(self, status: RstStatus) {
        self.shared.release(self.stream_id);
        let _ = self.frames.try_send(Frame::rst(self.stream_id, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_parity() {
        assert_eq!(Role::Client.first_stream_id(), 1);
        assert_eq!(Role::Server.first_stream_id(), 2);
        assert!(Role::Client.is_local(3));
        assert!(!Role::Client.is_local(4));
        assert!(Role::Server.is_local(4));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let session =
            MuxSession::new(client_io, BytesMut::new(), Role::Client, SessionConfig::default())
                .unwrap();

        session.close().await;
        session.close().await;

        assert!(session.is_closed());
        assert!(matches!(
            session.open_stream(HeaderBlock::new()).await,
            Err(TransportError::SessionClosed)
        ));
    }
}
