use thiserror::Error;

use super::sample_key::SampleKey;

/// Errors raised when addressing a sample's metrics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("metric index {index} out of range for sample with {len} metrics")]
    MetricIndexOutOfRange { index: usize, len: usize },
}

/// Running aggregate of a single metric field.
///
/// `count == 0` means the metric was never observed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metric {
    pub count: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

impl Metric {
    /// Metric holding a single observation.
    pub fn observed(value: f64) -> Self {
        Self {
            count: 1.0,
            sum: value,
            min: value,
            max: value,
            last: value,
        }
    }

    /// Returns true if the metric has never been observed.
    pub fn is_unset(&self) -> bool {
        self.count == 0.0
    }

    /// Folds `other` into this aggregate. `last` is taken from `other`.
    pub fn merge(&mut self, other: &Metric) {
        if other.is_unset() {
            return;
        }
        if self.is_unset() {
            *self = *other;
            return;
        }

        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.last = other.last;
    }
}

/// One dimension key, its metric aggregates and how many inbound
/// messages were folded into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    key: SampleKey,
    metrics: Vec<Metric>,
    hit_count: u64,
}

impl Sample {
    /// Creates an empty sample with a hit count of one.
    pub fn new(key_bits: usize, num_metrics: usize) -> Self {
        Self {
            key: SampleKey::new(key_bits),
            metrics: vec![Metric::default(); num_metrics],
            hit_count: 1,
        }
    }

    pub fn key(&self) -> &SampleKey {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut SampleKey {
        &mut self.key
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut [Metric] {
        &mut self.metrics
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    /// Records the first observation of metric `index`.
    pub fn set_metric(&mut self, index: usize, value: f64) -> Result<(), SampleError> {
        let len = self.metrics.len();
        let metric = self
            .metrics
            .get_mut(index)
            .ok_or(SampleError::MetricIndexOutOfRange { index, len })?;
        *metric = Metric::observed(value);
        Ok(())
    }

    pub fn add_hit_count(&mut self, n: u64) {
        self.hit_count += n;
    }

    /// Merges another sample with the same key into this one.
    pub fn add_sample(&mut self, other: &Sample) {
        for (metric, incoming) in self.metrics.iter_mut().zip(other.metrics.iter()) {
            metric.merge(incoming);
        }
        self.hit_count += other.hit_count;
    }
}
