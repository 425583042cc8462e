//! Aggregation pipeline for NGINX advanced metrics.
//!
//! NGINX writes one `;`-terminated message per request to a Unix socket.
//! Messages are folded into per-dimension-combination aggregates, kept
//! within configured cardinality limits by collapsing rare dimension values
//! into `AGGR`, and published as batches of [`publisher::MetricSet`].

pub mod aggregator;
pub mod config;
pub mod export;
pub mod ingester;
pub mod pipeline;
pub mod publisher;
pub mod reader;
pub mod tables;
