//! Aggregation-side table bounded by hit-count priority.
//!
//! Samples are merged in freely between collapses. [`PriorityTable::collapse_samples`]
//! keeps the `threshold` samples with the highest hit counts untouched and
//! funnels every other sample into shared buckets by overwriting its
//! collapsible dimensions with `AGGR`. Metric mass is never dropped.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use super::limits::Limits;
use super::lookup::AGGR_CODE;
use super::sample::Sample;
use super::sample_key::KeyError;
use super::schema::Schema;

pub struct PriorityTable {
    samples: HashMap<Box<[u8]>, Sample>,
    schema: Arc<Schema>,
    limits: Limits,
}

impl PriorityTable {
    pub fn new(schema: Arc<Schema>, limits: Limits) -> Self {
        Self {
            samples: HashMap::new(),
            schema,
            limits,
        }
    }

    /// Merges `sample` into the sample with the same key, or stores it.
    pub fn add(&mut self, sample: Sample) {
        merge_into(&mut self.samples, sample);
    }

    pub fn samples(&self) -> &HashMap<Box<[u8]>, Sample> {
        &self.samples
    }

    pub fn into_samples(self) -> HashMap<Box<[u8]>, Sample> {
        self.samples
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Brings the table back within its threshold. Returns how many samples
    /// had their dimensions collapsed.
    pub fn collapse_samples(&mut self) -> Result<usize, KeyError> {
        let threshold = self.limits.threshold();
        if self.samples.len() <= threshold {
            return Ok(0);
        }
        let level = self.limits.collapsing_level(self.samples.len());

        let mut pending: Vec<Option<Sample>> =
            self.samples.drain().map(|(_, sample)| Some(sample)).collect();

        // Min-heap on hit count over indices into `pending`.
        let mut kept: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(threshold);
        let mut collapsed = Vec::with_capacity(pending.len().saturating_sub(threshold));

        for (i, sample) in pending.iter().enumerate() {
            let hits = sample.as_ref().map_or(0, Sample::hit_count);

            if kept.len() < threshold {
                kept.push(Reverse((hits, i)));
                continue;
            }

            match kept.peek() {
                Some(Reverse((min_hits, _))) if hits < *min_hits => collapsed.push(i),
                _ => {
                    if let Some(Reverse((_, evicted))) = kept.pop() {
                        collapsed.push(evicted);
                    }
                    kept.push(Reverse((hits, i)));
                }
            }
        }

        for Reverse((_, i)) in kept {
            if let Some(sample) = pending[i].take() {
                merge_into(&mut self.samples, sample);
            }
        }

        let count = collapsed.len();
        for i in collapsed {
            if let Some(mut sample) = pending[i].take() {
                self.collapse(&mut sample, level)?;
                merge_into(&mut self.samples, sample);
            }
        }

        Ok(count)
    }

    fn collapse(&self, sample: &mut Sample, level: u32) -> Result<(), KeyError> {
        for field in self.schema.dimensions() {
            if field.should_collapse(level) {
                sample.key_mut().set_key_part(
                    AGGR_CODE,
                    field.key_bit_size(),
                    field.key_bit_position(),
                )?;
            }
        }
        Ok(())
    }
}

fn merge_into(samples: &mut HashMap<Box<[u8]>, Sample>, sample: Sample) {
    match samples.entry(Box::from(sample.key().as_bytes())) {
        Entry::Occupied(mut existing) => existing.get_mut().add_sample(&sample),
        Entry::Vacant(slot) => {
            slot.insert(sample);
        }
    }
}
