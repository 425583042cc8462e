//! Ingestion-side, double-buffered sample accumulator.
//!
//! Writers insert into the live `write` table under a shared lock; the
//! aggregator periodically takes the exclusive lock just long enough to swap
//! `write` and `read` and, on publish ticks, to replace the lookup set.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use super::limits::Limits;
use super::lookup::{LookupError, LookupSet, AGGR_CODE, NA_CODE};
use super::sample::{Sample, SampleError};
use super::sample_key::KeyError;
use super::samples::{SampleTable, Samples};
use super::schema::{Field, FieldKind, Schema, TransformError};

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("number of fields differ from schema definition: expected {expected}, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("parsing metric {field} value {value:?} as hex")]
    InvalidMetric { field: String, value: String },

    #[error("transforming dimension {field}: {source}")]
    Transform {
        field: String,
        #[source]
        source: TransformError,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Sample(#[from] SampleError),
}

/// Source of table snapshots for the aggregator.
pub trait ReadTable: Send + Sync {
    type Snapshot: Samples;

    /// Swaps out the samples written since the previous call.
    ///
    /// With `reset_lookups` the live lookup set is replaced and the previous
    /// one is returned so the caller can decode the swapped-out samples.
    fn read_snapshot(&self, reset_lookups: bool)
        -> (Arc<Self::Snapshot>, Option<Arc<LookupSet>>);
}

struct Tables {
    write: Arc<SampleTable>,
    read: Arc<SampleTable>,
    lookups: Arc<LookupSet>,
}

pub struct StagingTable {
    tables: RwLock<Tables>,
    schema: Arc<Schema>,
    limits: Limits,
}

impl StagingTable {
    pub fn new(schema: Arc<Schema>, limits: Limits) -> Self {
        let lookups = Arc::new(LookupSet::from_schema(&schema));
        Self {
            tables: RwLock::new(Tables {
                write: Arc::new(SampleTable::new()),
                read: Arc::new(SampleTable::new()),
                lookups,
            }),
            schema,
            limits,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of samples in the live write table.
    pub fn len(&self) -> usize {
        self.tables.read().write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses one message worth of fields into a sample and merges it into
    /// the write table.
    ///
    /// Fields are consumed in schema order. Extra trailing fields are logged
    /// and ignored.
    pub fn add<'a, I>(&self, fields: I) -> Result<(), StagingError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let tables = self.tables.read();
        let level = self.limits.collapsing_level(tables.write.len());

        let mut sample = Sample::new(self.schema.key_size(), self.schema.num_metrics());
        let mut fields = fields.into_iter();

        for (position, field) in self.schema.fields().iter().enumerate() {
            let data = fields.next().ok_or(StagingError::MissingFields {
                expected: self.schema.fields().len(),
                got: position,
            })?;

            match field.kind() {
                FieldKind::Dimension(_) => {
                    let code = self.dimension_code(field, data, level, &tables.lookups)?;
                    sample.key_mut().add_key_part(code, field.key_bit_size())?;
                }
                FieldKind::Metric => {
                    if data.is_empty() {
                        continue;
                    }
                    let value = parse_hex(data).ok_or_else(|| StagingError::InvalidMetric {
                        field: field.name().to_string(),
                        value: String::from_utf8_lossy(data).into_owned(),
                    })?;
                    sample.set_metric(field.index(), value as f64)?;
                }
            }
        }

        let extra = fields.count();
        if extra > 0 {
            tracing::warn!(
                extra_fields = extra,
                expected = self.schema.fields().len(),
                "message has more fields than schema, ignoring the rest"
            );
        }

        tables.write.add(sample);
        Ok(())
    }

    fn dimension_code(
        &self,
        field: &Field,
        data: &[u8],
        level: u32,
        lookups: &LookupSet,
    ) -> Result<u32, StagingError> {
        let data = trim_quotes(data);
        if data.is_empty() {
            return Ok(NA_CODE);
        }
        if field.should_collapse(level) {
            return Ok(AGGR_CODE);
        }

        if let Some(from_data) = field.transform().and_then(|t| t.from_data.as_ref()) {
            return from_data(data).map_err(|source| StagingError::Transform {
                field: field.name().to_string(),
                source,
            });
        }

        Ok(lookups.lookup_bytes(field.index(), data)?)
    }
}

impl ReadTable for StagingTable {
    type Snapshot = SampleTable;

    fn read_snapshot(&self, reset_lookups: bool) -> (Arc<SampleTable>, Option<Arc<LookupSet>>) {
        let mut tables = self.tables.write();
        let tables = &mut *tables;

        std::mem::swap(&mut tables.write, &mut tables.read);
        tables.write.clear();

        let lookups = reset_lookups.then(|| {
            std::mem::replace(
                &mut tables.lookups,
                Arc::new(LookupSet::from_schema(&self.schema)),
            )
        });

        (Arc::clone(&tables.read), lookups)
    }
}

/// Strips one layer of enclosing double quotes. Inner and unmatched quotes
/// are left alone.
fn trim_quotes(data: &[u8]) -> &[u8] {
    match data {
        [b'"', inner @ .., b'"'] => inner,
        _ => data,
    }
}

fn parse_hex(data: &[u8]) -> Option<u64> {
    if data.first() == Some(&b'+') {
        return None;
    }
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
}
