//! Unix socket listener feeding frames to the ingester.

pub mod frame;
pub mod worker;

use std::fs::Permissions;
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncRead;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;

pub use frame::{BufferPool, Frame, SEPARATOR};
pub use worker::{Worker, WorkerError};

/// Idle buffers kept around per expected concurrent connection.
const IDLE_BUFFERS: usize = 64;

/// Owner and group may write to the socket.
const SOCKET_MODE: u32 = 0o660;

/// Accepts connections on a Unix socket and runs a [`Worker`] per connection.
///
/// Every worker pushes frames into the same queue. The queue's sender is
/// dropped once the listener and all workers have stopped, which signals the
/// ingester that no more frames will arrive.
pub struct Reader {
    address: PathBuf,
    frames: mpsc::Sender<Frame>,
    pool: Arc<BufferPool>,
    health: Option<Arc<HealthMetrics>>,
}

impl Reader {
    pub fn new(
        address: impl Into<PathBuf>,
        max_buffer_size: usize,
        frames: mpsc::Sender<Frame>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            address: address.into(),
            frames,
            pool: BufferPool::new(max_buffer_size, IDLE_BUFFERS),
            health,
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Pool backing every frame produced by this reader.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Binds the socket and accepts connections until cancelled.
    ///
    /// A non-transient accept error stops every connection worker and is
    /// returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = bind(&self.address)?;
        tracing::info!(address = %self.address.display(), "listening for metrics");

        let result = self.serve(&listener, &cancel).await;

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.address) {
            tracing::debug!(error = %e, "removing socket file");
        }
        tracing::info!("reader stopped");

        result
    }

    async fn serve<L: Accept>(&self, listener: &L, cancel: &CancellationToken) -> Result<()> {
        let connections = cancel.child_token();
        let mut workers = JoinSet::new();

        let result: Result<()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                accepted = listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(e) if is_transient(&e) => {
                            tracing::warn!(error = %e, "accepting connection");
                            continue;
                        }
                        Err(e) => break Err(e).context("accepting connection"),
                    };

                    if let Some(ref h) = self.health {
                        h.connections_accepted.inc();
                    }
                    tracing::debug!("connection accepted");

                    let worker = Worker::new(
                        conn,
                        Arc::clone(&self.pool),
                        self.frames.clone(),
                        self.health.clone(),
                    );
                    workers.spawn(worker.run(connections.child_token()));
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.worker_finished(joined);
                }
            }
        };

        connections.cancel();
        while let Some(joined) = workers.join_next().await {
            self.worker_finished(joined);
        }

        result
    }

    fn worker_finished(&self, joined: Result<Result<(), WorkerError>, tokio::task::JoinError>) {
        let err = match joined {
            Ok(Ok(())) => {
                tracing::debug!("connection closed");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        tracing::warn!(error = %err, "connection worker failed");
        if let Some(ref h) = self.health {
            h.connection_errors.inc();
        }
    }
}

/// Source of inbound connections.
trait Accept {
    type Conn: AsyncRead + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

impl Accept for UnixListener {
    type Conn = UnixStream;

    async fn accept(&self) -> io::Result<UnixStream> {
        UnixListener::accept(self).await.map(|(stream, _)| stream)
    }
}

/// Errors that concern a single pending connection rather than the listener.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Binds `path`, replacing a stale socket file left by a previous run.
fn bind(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(address = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("removing stale socket {}", path.display()))
        }
    }

    let listener =
        UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;

    // Writers run as a different user than the agent.
    if let Err(e) = std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE)) {
        tracing::warn!(address = %path.display(), error = %e, "changing socket permissions");
    }

    Ok(listener)
}
