//! Sample model and the two tables samples flow through.
//!
//! Inbound messages land in the [`staging::StagingTable`], are drained into a
//! [`priority::PriorityTable`] on every aggregation tick and are decoded back
//! to names and values with the [`lookup::LookupSet`] that was live while they
//! were written.

pub mod limits;
pub mod lookup;
pub mod priority;
pub mod sample;
pub mod sample_key;
pub mod samples;
pub mod schema;
pub mod staging;

pub use limits::Limits;
pub use lookup::{LookupSet, AGGR_CODE, NA_CODE};
pub use priority::PriorityTable;
pub use sample::{Metric, Sample};
pub use sample_key::SampleKey;
pub use samples::{SampleTable, Samples};
pub use schema::{Field, Schema, SchemaBuilder};
pub use staging::{ReadTable, StagingTable};
