use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{BufferPool, Frame, SEPARATOR};
use crate::export::health::HealthMetrics;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("data exceeded buffer size: {max}")]
    BufferExceeded { max: usize },

    #[error("reading from connection: {0}")]
    Read(#[source] io::Error),
}

/// Reads one connection and cuts its byte stream into frames.
///
/// Each frame ends at the last separator seen so far; bytes after it are
/// carried over into the next buffer. A message that does not fit into a
/// single pooled buffer terminates the connection.
pub struct Worker<C> {
    conn: C,
    pool: Arc<BufferPool>,
    frames: mpsc::Sender<Frame>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C: AsyncRead + Unpin> Worker<C> {
    pub fn new(
        conn: C,
        pool: Arc<BufferPool>,
        frames: mpsc::Sender<Frame>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            conn,
            pool,
            frames,
            health,
        }
    }

    /// Runs until EOF, cancellation or an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let max = self.pool.buffer_size();
        let mut buf = self.pool.get();
        let mut filled = 0;

        loop {
            if filled == max {
                return Err(WorkerError::BufferExceeded { max });
            }

            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.conn.read(&mut buf.as_mut_slice()[filled..]) => res.map_err(WorkerError::Read)?,
            };

            if n == 0 {
                if filled > 0 {
                    tracing::debug!(bytes = filled, "connection closed mid-message, dropping partial data");
                }
                return Ok(());
            }

            let total = filled + n;
            let Some(last) = buf.as_slice()[filled..total]
                .iter()
                .rposition(|b| *b == SEPARATOR)
            else {
                filled = total;
                continue;
            };
            let end = filled + last + 1;

            let mut next = self.pool.get();
            let rest = total - end;
            next.as_mut_slice()[..rest].copy_from_slice(&buf.as_slice()[end..total]);
            filled = rest;

            let mut data = std::mem::replace(&mut buf, next);
            data.truncate(end);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.frames.send(Frame::new(data)) => {
                    if res.is_err() {
                        tracing::debug!("frame queue closed, stopping connection worker");
                        return Ok(());
                    }
                }
            }

            if let Some(ref h) = self.health {
                h.frames_received.inc();
            }
        }
    }
}
