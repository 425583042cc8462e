use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::sample::Sample;

/// Container of samples keyed by their packed key bytes.
pub trait Samples: Send + Sync {
    /// Inserts `sample`, merging it into an existing sample with the same key.
    fn add(&self, sample: Sample);

    /// Calls `f` for every stored sample.
    fn range<F: FnMut(&Sample)>(&self, f: F);

    /// Removes all samples, keeping allocated capacity.
    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe sample table.
///
/// Uses `DashMap` so that concurrent `add` calls lock only the shard that
/// owns the key. Upsert-or-merge happens under the shard lock, so two
/// writers hitting the same key never lose an update.
pub struct SampleTable {
    samples: DashMap<Box<[u8]>, Sample>,
}

impl SampleTable {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: DashMap::with_capacity(capacity),
        }
    }
}

impl Default for SampleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Samples for SampleTable {
    fn add(&self, sample: Sample) {
        match self.samples.entry(Box::from(sample.key().as_bytes())) {
            Entry::Occupied(mut existing) => existing.get_mut().add_sample(&sample),
            Entry::Vacant(slot) => {
                slot.insert(sample);
            }
        }
    }

    fn range<F: FnMut(&Sample)>(&self, mut f: F) {
        for entry in self.samples.iter() {
            f(entry.value());
        }
    }

    fn clear(&self) {
        self.samples.clear();
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
