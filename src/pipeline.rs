//! Wires reader, ingester, aggregator and publisher into one runnable unit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::ingester::Ingester;
use crate::publisher::{MetricSet, Publisher};
use crate::reader::Reader;
use crate::tables::{Schema, StagingTable};

/// The complete advanced metrics pipeline.
///
/// Construct it with [`Pipeline::new`], take the output queue with
/// [`Pipeline::take_output`] and drive it with [`Pipeline::run`]. The output
/// queue closes once the pipeline has stopped.
pub struct Pipeline {
    reader: Reader,
    ingester: Ingester,
    aggregator: Aggregator<StagingTable, Publisher>,
    output: Option<mpsc::Receiver<Vec<MetricSet>>>,
    staging: Arc<StagingTable>,
    aggregation_period: Duration,
    publishing_period: Duration,
}

impl Pipeline {
    /// Builds every stage for `schema`. Fails on invalid table limits.
    pub fn new(cfg: &Config, schema: Schema, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let staging_limits = cfg
            .table_sizes_limits
            .staging_limits()
            .context("creating staging table")?;
        let priority_limits = cfg
            .table_sizes_limits
            .priority_limits()
            .context("creating aggregator")?;

        let schema = Arc::new(schema);
        let staging = Arc::new(StagingTable::new(Arc::clone(&schema), staging_limits));

        let (frames_tx, frames_rx) = mpsc::channel(cfg.reader.frame_queue_size.max(1));
        let (output_tx, output_rx) = mpsc::channel(cfg.output_queue_size.max(1));

        let reader = Reader::new(
            cfg.address.clone(),
            cfg.reader.max_buffer_size,
            frames_tx,
            health.clone(),
        );
        let ingester = Ingester::new(
            frames_rx,
            Arc::clone(&staging),
            cfg.ingester.workers,
            health.clone(),
        );
        let publisher = Publisher::new(output_tx, cfg.publish_timeout, health.clone());
        let aggregator = Aggregator::new(
            Arc::clone(&staging),
            publisher,
            schema,
            priority_limits,
            health,
        );

        Ok(Self {
            reader,
            ingester,
            aggregator,
            output: Some(output_rx),
            staging,
            aggregation_period: cfg.aggregation_period,
            publishing_period: cfg.publishing_period,
        })
    }

    /// Builds the pipeline with the schema declared in `cfg`.
    pub fn from_config(cfg: &Config, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let schema = cfg.build_schema()?;
        Self::new(cfg, schema, health)
    }

    /// Hands out the queue of published batches. Returns `None` after the
    /// first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<MetricSet>>> {
        self.output.take()
    }

    pub fn staging_table(&self) -> &Arc<StagingTable> {
        &self.staging
    }

    /// Runs every stage until `cancel` fires or a stage fails.
    ///
    /// The first failure cancels the remaining stages and is returned once
    /// all of them have stopped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let mut stages = JoinSet::new();

        let Self {
            reader,
            ingester,
            aggregator,
            aggregation_period,
            publishing_period,
            ..
        } = self;

        stages.spawn(reader.run(cancel.clone()));
        stages.spawn(ingester.run(cancel.clone()));
        {
            let cancel = cancel.clone();
            stages.spawn(async move {
                aggregator
                    .run(cancel, aggregation_period, publishing_period)
                    .await;
                Ok(())
            });
        }

        tracing::info!(
            aggregation_period = ?aggregation_period,
            publishing_period = ?publishing_period,
            "advanced metrics pipeline started"
        );

        let mut first_error = None;
        while let Some(joined) = stages.join_next().await {
            let result = joined
                .context("pipeline stage panicked")
                .and_then(|stage| stage);

            if let Err(e) = result {
                tracing::error!(error = %e, "pipeline stage failed");
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("advanced metrics pipeline stopped");
        first_error.map_or(Ok(()), Err)
    }
}
