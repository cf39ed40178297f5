//! Tunnel coordinator
//!
//! One [`PortForward::run`] call is one invocation: dial a session for the
//! target pod, open the error and data streams, bind the local listener,
//! bridge exactly one accepted connection, and reconcile the copy tasks and
//! the error stream into a single [`TunnelOutcome`].
//!
//! ```text
//!  dial -> open error+data -> bind -> accept one -> copy x2 ---+
//!                                  \-> error monitor ----------+-> verdict
//!                                                                   |
//!                                  teardown: local, data stream, session
//! ```
//!
//! Teardown runs on every exit after the session exists. Copy tasks still
//! running when the verdict is reached are unblocked by teardown and joined
//! before `run` returns, so nothing outlives the invocation.

use crate::bridge::{local_to_remote, remote_to_local};
use crate::config::TunnelConfig;
use crate::error::{Direction, TunnelError, TunnelOutcome, TunnelStats};
use crate::locator::{TargetIdentity, WorkloadLocator};
use crate::streams::{next_request_id, open_stream_pair};
use podtunnel_proto::portforward::portforward_path;
use podtunnel_transport::{MuxSession, MuxStream, SessionDialer, StreamHandle, TransportError};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type CopyTask = JoinHandle<Result<u64, TunnelError>>;

/// Forwards one local port to one pod port
pub struct PortForward {
    dialer: Arc<dyn SessionDialer>,
    config: TunnelConfig,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl std::fmt::Debug for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForward")
            .field("dialer", &self.dialer)
            .field("mapping", &self.config.mapping)
            .finish()
    }
}

impl PortForward {
    pub fn new(dialer: Arc<dyn SessionDialer>, config: TunnelConfig) -> Self {
        Self {
            dialer,
            config,
            ready: None,
        }
    }

    /// Receive the bound local address once the listener is up
    pub fn with_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Resolve the target with `locator`, then run
    ///
    /// Nothing is dialed when the lookup fails.
    pub async fn locate_and_run(
        self,
        locator: &dyn WorkloadLocator,
        namespace: &str,
    ) -> TunnelOutcome {
        let target = locator.locate(namespace).await?;
        self.run(&target).await
    }

    pub async fn run(mut self, target: &TargetIdentity) -> TunnelOutcome {
        target
            .validate()
            .map_err(|e| TunnelError::Precondition(e.to_string()))?;

        let mapping = self.config.mapping;
        let session = self.dial(target).await?;

        let mut teardown = Teardown::default();
        let result = self.forward(&session, &mut teardown).await;
        let late = teardown.run(&session).await;

        match result {
            Ok(mut stats) => {
                if let Some(bytes) = late.local_to_remote {
                    stats.local_to_remote = bytes;
                }
                if let Some(bytes) = late.remote_to_local {
                    stats.remote_to_local = bytes;
                }
                info!(
                    "Forwarding {} -> {} finished ({} bytes sent, {} bytes received)",
                    stats.local_addr, mapping.remote_port, stats.local_to_remote, stats.remote_to_local
                );
                Ok(stats)
            }
            Err(e) => {
                error!("Forwarding {} to {} failed: {}", mapping, target, e);
                Err(e)
            }
        }
    }

    async fn dial(&self, target: &TargetIdentity) -> Result<MuxSession, TunnelError> {
        let path = portforward_path(&target.namespace, &target.pod);
        debug!("Dialing {} for {}", self.dialer.describe(&path), target);

        let dial = self.dialer.dial(&path);
        let result = match self.config.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .unwrap_or_else(|_| Err(TransportError::Timeout)),
            None => dial.await,
        };

        result.map_err(|source| TunnelError::Dial {
            url: self.dialer.describe(&path),
            source,
        })
    }

    async fn forward(
        &mut self,
        session: &MuxSession,
        teardown: &mut Teardown,
    ) -> Result<TunnelStats, TunnelError> {
        let mapping = self.config.mapping;
        let request_id = next_request_id();

        let pair = open_stream_pair(session, mapping.remote_port, request_id).await?;
        let data_handle = pair.data.handle();
        teardown.data = Some(data_handle.clone());

        let bind_addr = SocketAddr::new(self.config.bind_address, mapping.local_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| TunnelError::Listen {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Listen {
            addr: bind_addr,
            source,
        })?;

        info!("Forwarding from {} -> {}", local_addr, mapping.remote_port);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(local_addr);
        }

        let monitor = tokio::spawn(read_error_stream(pair.error));

        let socket = match self.accept_one(&listener).await {
            Ok(socket) => socket,
            Err(e) => {
                teardown.monitor = Some(monitor);
                return Err(e);
            }
        };
        drop(listener);

        let (socket, closer) = match detach_closer(socket) {
            Ok(pair) => pair,
            Err(e) => {
                teardown.monitor = Some(monitor);
                return Err(TunnelError::Accept(e));
            }
        };
        teardown.local = Some(closer);

        let (local_read, local_write) = socket.into_split();
        let (remote_read, remote_write) = tokio::io::split(pair.data);

        let mut l2r: CopyTask = tokio::spawn(local_to_remote(
            local_read,
            remote_write,
            data_handle.clone(),
        ));
        let mut r2l: CopyTask = tokio::spawn(remote_to_local(remote_read, local_write));

        let mut local_to_remote_bytes: Option<u64> = None;
        let mut local_failed = false;
        let mut remote_to_local_bytes = 0u64;
        let mut remote_done = false;

        // Remote->local ending in any way, or local->remote failing, ends the race
        let race: Result<(), TunnelError> = loop {
            tokio::select! {
                result = &mut r2l => {
                    remote_done = true;
                    match joined(result, Direction::RemoteToLocal) {
                        Ok(n) => {
                            remote_to_local_bytes = n;
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
                result = &mut l2r, if local_to_remote_bytes.is_none() && !local_failed => {
                    match joined(result, Direction::LocalToRemote) {
                        Ok(n) => local_to_remote_bytes = Some(n),
                        Err(e) => {
                            local_failed = true;
                            break Err(e);
                        }
                    }
                }
            }
        };

        if local_to_remote_bytes.is_none() && !local_failed {
            teardown.copies.push((Direction::LocalToRemote, l2r));
        }
        if !remote_done {
            teardown.copies.push((Direction::RemoteToLocal, r2l));
        }

        if let Err(e) = data_handle.close_write().await {
            debug!("Half-close of data stream {} failed: {}", data_handle.stream_id(), e);
        }

        let remote_failure = match monitor.await {
            Ok(Ok(message)) if message.is_empty() => None,
            Ok(Ok(message)) => Some(TunnelError::RemoteReported {
                local_port: local_addr.port(),
                remote_port: mapping.remote_port,
                message: String::from_utf8_lossy(&message).into_owned(),
            }),
            Ok(Err(e)) => Some(TunnelError::ErrorStream(e)),
            Err(e) => Some(TunnelError::ErrorStream(io::Error::other(e))),
        };

        if let Some(failure) = remote_failure {
            if let Err(race_error) = race {
                debug!("Copy failure superseded by remote error: {}", race_error);
            }
            return Err(failure);
        }
        race?;

        Ok(TunnelStats {
            local_addr,
            local_to_remote: local_to_remote_bytes.unwrap_or(0),
            remote_to_local: remote_to_local_bytes,
        })
    }

    async fn accept_one(&self, listener: &TcpListener) -> Result<TcpStream, TunnelError> {
        let accept = listener.accept();
        let (socket, peer) = match self.config.accept_timeout {
            Some(limit) => tokio::time::timeout(limit, accept)
                .await
                .map_err(|_| TunnelError::AcceptTimeout(limit))?,
            None => accept.await,
        }
        .map_err(TunnelError::Accept)?;

        debug!("Accepted local connection from {}", peer);
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on local connection: {}", e);
        }
        Ok(socket)
    }
}

/// Keep a std handle on the socket so teardown can shut it down while the
/// copy tasks own both halves
fn detach_closer(socket: TcpStream) -> io::Result<(TcpStream, std::net::TcpStream)> {
    let std_socket = socket.into_std()?;
    let closer = std_socket.try_clone()?;
    Ok((TcpStream::from_std(std_socket)?, closer))
}

async fn read_error_stream(mut stream: MuxStream) -> io::Result<Vec<u8>> {
    let mut message = Vec::new();
    stream.read_to_end(&mut message).await?;
    debug!(
        "Error stream {} closed with {} bytes",
        stream.stream_id(),
        message.len()
    );
    Ok(message)
}

fn joined(
    result: Result<Result<u64, TunnelError>, tokio::task::JoinError>,
    direction: Direction,
) -> Result<u64, TunnelError> {
    result.unwrap_or_else(|e| {
        Err(TunnelError::Copy {
            direction,
            source: io::Error::other(e),
        })
    })
}

/// Byte counts from copy tasks that finished during teardown
#[derive(Debug, Default)]
struct LateCounts {
    local_to_remote: Option<u64>,
    remote_to_local: Option<u64>,
}

/// Resources released once per invocation, in order
#[derive(Default)]
struct Teardown {
    local: Option<std::net::TcpStream>,
    data: Option<StreamHandle>,
    monitor: Option<JoinHandle<io::Result<Vec<u8>>>>,
    copies: Vec<(Direction, CopyTask)>,
}

impl Teardown {
    async fn run(&mut self, session: &MuxSession) -> LateCounts {
        if let Some(local) = self.local.take() {
            if let Err(e) = local.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!("Failed to close local connection: {}", e);
                }
            }
        }

        if let Some(data) = self.data.take() {
            if let Err(e) = data.close().await {
                debug!("Closing data stream {}: {}", data.stream_id(), e);
            }
        }

        session.close().await;

        let mut late = LateCounts::default();
        for (direction, task) in self.copies.drain(..) {
            match joined(task.await, direction) {
                Ok(bytes) => {
                    debug!("{} finished during teardown ({} bytes)", direction, bytes);
                    match direction {
                        Direction::LocalToRemote => late.local_to_remote = Some(bytes),
                        Direction::RemoteToLocal => late.remote_to_local = Some(bytes),
                    }
                }
                Err(e) => warn!("{} ended during teardown: {}", direction, e),
            }
        }

        if let Some(monitor) = self.monitor.take() {
            match monitor.await {
                Ok(Ok(message)) if !message.is_empty() => warn!(
                    "Remote error after teardown: {}",
                    String::from_utf8_lossy(&message)
                ),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Error stream ended during teardown: {}", e),
                Err(e) => warn!("Error monitor failed: {}", e),
            }
        }

        late
    }
}
