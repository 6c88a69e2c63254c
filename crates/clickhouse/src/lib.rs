//! ClickHouse mirror for the lead pipeline.
//!
//! Ledger entries and metric snapshots are copied here in batches when the
//! mirror is enabled. Nothing in the pipeline reads them back.

pub mod client;
pub mod config;
pub mod health;
pub mod insert;
pub mod schema;

pub use client::*;
pub use config::*;
pub use insert::{insert_ledger_entries, insert_metrics, LedgerRow, MetricsRow};
