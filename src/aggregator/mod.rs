//! Timer-driven mover of samples from the staging table to the publisher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::publisher::PublishError;
use crate::tables::{Limits, LookupSet, PriorityTable, ReadTable, Samples, Schema};

/// Consumer of finished aggregation windows.
pub trait Publish: Send + Sync {
    /// Delivers `table`, decoded against `lookups`, downstream.
    fn publish(
        &self,
        cancel: &CancellationToken,
        lookups: Option<Arc<LookupSet>>,
        table: PriorityTable,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Owns the priority table and moves staging snapshots into it.
///
/// Aggregation ticks fold the staging table into the priority table and
/// collapse it back under its threshold. Publish ticks do the same with a
/// lookup reset, then hand the finished table to the publisher and start a
/// fresh one.
pub struct Aggregator<R, P> {
    staging: Arc<R>,
    publisher: P,
    schema: Arc<Schema>,
    limits: Limits,
    priority: PriorityTable,
    health: Option<Arc<HealthMetrics>>,
}

impl<R: ReadTable, P: Publish> Aggregator<R, P> {
    pub fn new(
        staging: Arc<R>,
        publisher: P,
        schema: Arc<Schema>,
        limits: Limits,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let priority = PriorityTable::new(Arc::clone(&schema), limits);
        Self {
            staging,
            publisher,
            schema,
            limits,
            priority,
            health,
        }
    }

    /// Live priority table.
    pub fn priority_table(&self) -> &PriorityTable {
        &self.priority
    }

    /// Folds a staging snapshot into the priority table and collapses it.
    ///
    /// Returns the lookup set that was live while the snapshot was written
    /// when `reset_lookups` is set.
    pub fn aggregate(&mut self, reset_lookups: bool) -> Option<Arc<LookupSet>> {
        let (snapshot, lookups) = self.staging.read_snapshot(reset_lookups);
        let snapshot_len = snapshot.len();

        snapshot.range(|sample| self.priority.add(sample.clone()));
        // Nothing else reads the swapped-out table; free it before the next swap.
        snapshot.clear();

        let collapsed = match self.priority.collapse_samples() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "collapsing priority table");
                0
            }
        };

        if collapsed > 0 {
            tracing::debug!(
                collapsed,
                remaining = self.priority.len(),
                "collapsed low priority samples"
            );
        }

        if let Some(ref h) = self.health {
            h.aggregations.inc();
            h.samples_collapsed.inc_by(collapsed as f64);
            h.staging_snapshot_samples.set(snapshot_len as f64);
            h.priority_table_samples.set(self.priority.len() as f64);
        }

        lookups
    }

    /// Aggregates with a lookup reset and publishes the finished window.
    pub async fn publish(&mut self, cancel: &CancellationToken) -> Result<(), PublishError> {
        let lookups = self.aggregate(true);
        let table = std::mem::replace(
            &mut self.priority,
            PriorityTable::new(Arc::clone(&self.schema), self.limits),
        );

        self.publisher.publish(cancel, lookups, table).await
    }

    /// Drives both timers until `cancel` fires.
    ///
    /// The first ticks fire one period after start.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        aggregation_period: Duration,
        publishing_period: Duration,
    ) {
        let start = Instant::now();
        let mut aggregation = interval_at(start + aggregation_period, aggregation_period);
        aggregation.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut publishing = interval_at(start + publishing_period, publishing_period);
        publishing.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = aggregation.tick() => {
                    self.aggregate(false);
                }

                _ = publishing.tick() => {
                    if let Err(e) = self.publish(&cancel).await {
                        tracing::warn!(error = %e, "dropping metrics batch");
                    }
                }
            }
        }

        tracing::info!("aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use crate::tables::{Sample, SampleTable};

    /// Read table returning prepared snapshots in order.
    struct ScriptedTable {
        snapshots: Mutex<Vec<Vec<Sample>>>,
        calls: Mutex<Vec<bool>>,
    }

    impl ScriptedTable {
        fn new(mut snapshots: Vec<Vec<Sample>>) -> Arc<Self> {
            snapshots.reverse();
            Arc::new(Self {
                snapshots: Mutex::new(snapshots),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl ReadTable for ScriptedTable {
        type Snapshot = SampleTable;

        fn read_snapshot(&self, reset_lookups: bool) -> (Arc<SampleTable>, Option<Arc<LookupSet>>) {
            self.calls.lock().push(reset_lookups);
            let table = SampleTable::new();
            for sample in self.snapshots.lock().pop().unwrap_or_default() {
                table.add(sample);
            }
            (Arc::new(table), None)
        }
    }

    /// Publisher recording the key of every published sample.
    #[derive(Clone, Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    }

    impl Publish for RecordingPublisher {
        async fn publish(
            &self,
            _cancel: &CancellationToken,
            _lookups: Option<Arc<LookupSet>>,
            table: PriorityTable,
        ) -> Result<(), PublishError> {
            let mut keys: Vec<Vec<u8>> = table.samples().keys().map(|k| k.to_vec()).collect();
            keys.sort();
            self.published.lock().push(keys);
            Ok(())
        }
    }

    fn sample(bits: usize, part: u32, value: f64) -> Sample {
        let mut s = Sample::new(bits, 1);
        s.set_metric(0, value).expect("metric");
        if part > 0 {
            s.key_mut().add_key_part(part, 1).expect("key");
        }
        s
    }

    fn aggregator(
        table: Arc<ScriptedTable>,
        publisher: RecordingPublisher,
    ) -> Aggregator<ScriptedTable, RecordingPublisher> {
        Aggregator::new(
            table,
            publisher,
            Arc::new(Schema::default()),
            Limits::new(1000, 100).expect("limits"),
            None,
        )
    }

    fn key(s: &Sample) -> Vec<u8> {
        s.key().as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_publish_includes_aggregated_samples() {
        let first = sample(11, 0, 12.0);
        let second = sample(12, 1, 13.0);
        let table = ScriptedTable::new(vec![vec![first.clone()], vec![second.clone()]]);
        let publisher = RecordingPublisher::default();
        let mut agg = aggregator(Arc::clone(&table), publisher.clone());

        assert!(agg.aggregate(false).is_none());
        agg.publish(&CancellationToken::new()).await.expect("publish");

        let mut expected = vec![key(&first), key(&second)];
        expected.sort();
        assert_eq!(*publisher.published.lock(), vec![expected]);
        assert_eq!(*table.calls.lock(), vec![false, true]);
        assert!(agg.priority_table().is_empty());
    }

    #[tokio::test]
    async fn test_publish_starts_fresh_priority_table() {
        let first = sample(11, 0, 12.0);
        let second = sample(12, 1, 13.0);
        let third = sample(24, 1, 14.0);
        let table = ScriptedTable::new(vec![
            vec![first.clone()],
            vec![second.clone()],
            vec![third.clone()],
        ]);
        let publisher = RecordingPublisher::default();
        let mut agg = aggregator(table, publisher.clone());
        let cancel = CancellationToken::new();

        agg.aggregate(false);
        agg.publish(&cancel).await.expect("publish");
        agg.publish(&cancel).await.expect("publish");

        let published = publisher.published.lock();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1], vec![key(&third)]);
    }

    #[tokio::test]
    async fn test_aggregate_merges_same_key() {
        let table = ScriptedTable::new(vec![vec![sample(8, 1, 1.0)], vec![sample(8, 1, 3.0)]]);
        let mut agg = aggregator(table, RecordingPublisher::default());

        agg.aggregate(false);
        agg.aggregate(false);

        let merged: Vec<_> = agg.priority_table().samples().values().collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].hit_count(), 2);
        assert_eq!(merged[0].metrics()[0].sum, 4.0);
        assert_eq!(merged[0].metrics()[0].last, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_follows_timers() {
        let table = ScriptedTable::new(Vec::new());
        let publisher = RecordingPublisher::default();
        let agg = aggregator(Arc::clone(&table), publisher.clone());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(agg.run(
            cancel.clone(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ));

        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        handle.await.expect("join");

        let calls = table.calls.lock();
        // Aggregation ticks at 10..60s, publish ticks at 30s and 60s.
        assert_eq!(calls.iter().filter(|reset| **reset).count(), 2);
        assert_eq!(calls.iter().filter(|reset| !**reset).count(), 6);
        assert_eq!(publisher.published.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let agg = aggregator(ScriptedTable::new(Vec::new()), RecordingPublisher::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            agg.run(cancel, Duration::from_secs(10), Duration::from_secs(30)),
        )
        .await
        .expect("stopped");
    }
}
