use thiserror::Error;

/// Highest collapsing level a table can report.
pub const MAX_COLLAPSE_LEVEL: u32 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitsError {
    #[error("max size must be greater than 0")]
    ZeroMaxSize,

    #[error("threshold must be greater than 0")]
    ZeroThreshold,

    #[error("threshold {threshold} is greater than max size {max_size}")]
    ThresholdAboveMax { threshold: usize, max_size: usize },
}

/// Soft capacity of a table and the size at which collapsing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    max_size: usize,
    threshold: usize,
}

impl Limits {
    pub fn new(max_size: usize, threshold: usize) -> Result<Self, LimitsError> {
        if max_size == 0 {
            return Err(LimitsError::ZeroMaxSize);
        }
        if threshold == 0 {
            return Err(LimitsError::ZeroThreshold);
        }
        if threshold > max_size {
            return Err(LimitsError::ThresholdAboveMax {
                threshold,
                max_size,
            });
        }
        Ok(Self {
            max_size,
            threshold,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Collapsing level for a table currently holding `size` samples.
    ///
    /// Zero up to the threshold, then rising linearly to
    /// [`MAX_COLLAPSE_LEVEL`] at `max_size` and capped there.
    pub fn collapsing_level(&self, size: usize) -> u32 {
        if size <= self.threshold {
            return 0;
        }
        let span = self.max_size - self.threshold;
        if span == 0 {
            return MAX_COLLAPSE_LEVEL;
        }
        let level = (size - self.threshold) * MAX_COLLAPSE_LEVEL as usize / span;
        level.min(MAX_COLLAPSE_LEVEL as usize) as u32
    }
}
