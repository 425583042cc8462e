//! Decodes priority tables into metric sets and hands them downstream.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Publish;
use crate::export::health::HealthMetrics;
use crate::tables::lookup::LookupError;
use crate::tables::schema::TransformError;
use crate::tables::{LookupSet, Metric, PriorityTable, Sample, Schema, NA_CODE};

/// Dimension name and its decoded value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// Metric name and its aggregated values.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    pub name: String,
    pub values: Metric,
}

/// All observed metrics for one distinct combination of dimension values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricSet {
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<MetricValue>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publishing metrics timed out after {0:?}")]
    Timeout(Duration),

    #[error("publishing metrics cancelled")]
    Cancelled,

    #[error("output queue closed")]
    Closed,
}

#[derive(Debug, Error)]
enum DecodeError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("no lookup set available")]
    MissingLookups,
}

/// Publishes one batch of metric sets per call onto a bounded output queue.
pub struct Publisher {
    out: mpsc::Sender<Vec<MetricSet>>,
    timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl Publisher {
    pub fn new(
        out: mpsc::Sender<Vec<MetricSet>>,
        timeout: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            out,
            timeout,
            health,
        }
    }

    /// Decodes every sample of `table` into a metric set.
    ///
    /// `NA` dimensions are left out. A dimension whose code cannot be
    /// resolved is left out and logged; the rest of its sample is kept.
    /// Metrics never observed in the window are left out.
    pub fn metric_sets(lookups: Option<&LookupSet>, table: &PriorityTable) -> Vec<MetricSet> {
        let schema = table.schema();
        table
            .samples()
            .values()
            .map(|sample| metric_set(schema, lookups, sample))
            .collect()
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        sets: Vec<MetricSet>,
    ) -> Result<(), PublishError> {
        let send = tokio::time::timeout(self.timeout, self.out.send(sets));

        tokio::select! {
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            res = send => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(PublishError::Closed),
                Err(_) => Err(PublishError::Timeout(self.timeout)),
            },
        }
    }
}

impl Publish for Publisher {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        lookups: Option<Arc<LookupSet>>,
        table: PriorityTable,
    ) -> Result<(), PublishError> {
        let sets = Self::metric_sets(lookups.as_deref(), &table);
        drop(table);
        let count = sets.len();

        let result = self.send(cancel, sets).await;

        if let Some(ref h) = self.health {
            match result {
                Ok(()) => {
                    h.publishes.inc();
                    h.metric_sets_published.set(count as f64);
                }
                Err(_) => h.publish_errors.inc(),
            }
        }

        if result.is_ok() {
            tracing::debug!(metric_sets = count, "published metrics");
        }

        result
    }
}

fn metric_set(schema: &Schema, lookups: Option<&LookupSet>, sample: &Sample) -> MetricSet {
    let codes = sample.key().get_key_parts(schema.dimension_key_part_sizes());

    let dimensions = schema
        .dimensions()
        .zip(codes)
        .filter(|(_, code)| *code != NA_CODE)
        .filter_map(|(field, code)| {
            let decoded = match field.transform().and_then(|t| t.to_value.as_ref()) {
                Some(to_value) => to_value(code).map_err(DecodeError::from),
                None => lookups
                    .ok_or(DecodeError::MissingLookups)
                    .and_then(|l| l.lookup_code(field.index(), code).map_err(DecodeError::from)),
            };

            match decoded {
                Ok(value) => Some(Dimension {
                    name: field.name().to_string(),
                    value,
                }),
                Err(e) => {
                    tracing::warn!(dimension = field.name(), code, error = %e, "skipping dimension");
                    None
                }
            }
        })
        .collect();

    let metrics = schema
        .metrics()
        .zip(sample.metrics())
        .filter(|(_, m)| m.count != 0.0)
        .map(|(field, m)| MetricValue {
            name: field.name().to_string(),
            values: *m,
        })
        .collect();

    MetricSet {
        dimensions,
        metrics,
    }
}
