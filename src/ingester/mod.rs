//! Worker pool turning frames into staging table inserts.

pub mod fields;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::reader::Frame;
use crate::tables::StagingTable;

pub use fields::Fields;

/// Outcome of ingesting a single frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub ingested: usize,
    pub dropped: usize,
}

pub struct Ingester {
    frames: Arc<Mutex<mpsc::Receiver<Frame>>>,
    table: Arc<StagingTable>,
    workers: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl Ingester {
    pub fn new(
        frames: mpsc::Receiver<Frame>,
        table: Arc<StagingTable>,
        workers: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            frames: Arc::new(Mutex::new(frames)),
            table,
            workers: workers.max(1),
            health,
        }
    }

    /// Runs the worker pool until cancelled or until the frame queue closes.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut set = JoinSet::new();

        for id in 0..self.workers {
            let frames = Arc::clone(&self.frames);
            let table = Arc::clone(&self.table);
            let health = self.health.clone();
            let cancel = cancel.clone();

            set.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        frame = async { frames.lock().await.recv().await } => frame,
                    };
                    let Some(frame) = next else {
                        break;
                    };

                    let stats = ingest_frame(&table, &frame);
                    frame.release();

                    if let Some(ref h) = health {
                        h.messages_ingested.inc_by(stats.ingested as f64);
                        h.messages_dropped.inc_by(stats.dropped as f64);
                    }
                }
                tracing::debug!(worker = id, "ingester worker stopped");
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "ingester worker panicked");
            }
        }

        Ok(())
    }
}

/// Adds every message of `frame` to `table`.
///
/// Malformed messages are logged and skipped; the rest of the frame is still
/// processed.
pub fn ingest_frame(table: &StagingTable, frame: &Frame) -> FrameStats {
    let mut stats = FrameStats::default();

    for message in frame.messages() {
        if message.iter().all(|b| matches!(b, b'\r' | b'\n')) {
            continue;
        }

        match table.add(Fields::new(message)) {
            Ok(()) => stats.ingested += 1,
            Err(e) => {
                stats.dropped += 1;
                tracing::warn!(
                    error = %e,
                    message = %String::from_utf8_lossy(message),
                    "dropping message",
                );
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::reader::BufferPool;
    use crate::tables::{Limits, ReadTable, Samples, Schema, SchemaBuilder};

    fn table() -> Arc<StagingTable> {
        let schema: Schema = SchemaBuilder::new()
            .dimension("dim1", 16)
            .metric("m1")
            .build()
            .expect("schema");
        Arc::new(StagingTable::new(
            Arc::new(schema),
            Limits::new(100, 100).expect("limits"),
        ))
    }

    fn frame(pool: &Arc<BufferPool>, data: &[u8]) -> Frame {
        let mut buf = pool.get();
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf.truncate(data.len());
        Frame::new(buf)
    }

    #[test]
    fn test_ingest_frame_skips_bad_messages() {
        let table = table();
        let pool = BufferPool::new(128, 2);
        let f = frame(&pool, b"\"A\" 1;bad;\"A\" zz;\"B\" 3;");

        let stats = ingest_frame(&table, &f);
        f.release();

        assert_eq!(
            stats,
            FrameStats {
                ingested: 2,
                dropped: 2
            }
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ingest_frame_ignores_blank_messages() {
        let table = table();
        let pool = BufferPool::new(64, 2);
        let f = frame(&pool, b";\n;\"A\" 1;");

        let stats = ingest_frame(&table, &f);
        assert_eq!(
            stats,
            FrameStats {
                ingested: 1,
                dropped: 0
            }
        );
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_release_frames() {
        let table = table();
        let pool = BufferPool::new(64, 8);
        let (tx, rx) = mpsc::channel(8);
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let ingester = Ingester::new(rx, Arc::clone(&table), 3, Some(Arc::clone(&health)));

        let batches: &[&[u8]] = &[b"\"A\" 1;\"A\" 2;", b"\"B\" 3;", b"x;"];
        for data in batches {
            tx.send(frame(&pool, data)).await.expect("send");
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), ingester.run(CancellationToken::new()))
            .await
            .expect("ingester finished")
            .expect("ingester result");

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(health.messages_ingested.get(), 3.0);
        assert_eq!(health.messages_dropped.get(), 1.0);

        let (snapshot, _) = table.read_snapshot(false);
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Ingester::new(rx, table(), 2, None).run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stopped in time")
            .expect("join")
            .expect("ingester result");
    }
}
