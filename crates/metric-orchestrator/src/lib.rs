//! Batch evaluation of metric bundles over stored events.
//!
//! Events are read from SQLite, grouped per ticker, evaluated against the
//! metric graph with a per-ticker response cache, optionally valued against
//! sector peers, and written back as one result row per event.

pub mod batch;
pub mod config;
pub mod store;

pub use batch::{BatchRequest, BatchRunner, BatchSummary, QualitativeBundle, QuantitativeBundle};
pub use config::RunnerConfig;
pub use store::{ResultStore, StoredResult};
