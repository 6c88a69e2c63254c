//! Relational store for the lead pipeline.
//!
//! One SQLite database holds every layer (raw, normalized, feature,
//! aggregate, unified, insight) plus the work queue and processing ledger.
//! Queries live next to the layer they serve as `impl Store` blocks.

pub mod client;
pub mod config;
pub mod features;
pub mod health;
pub mod insights;
pub mod ledger;
pub mod normalized;
pub mod queue;
pub mod raw;
pub mod schema;
pub mod unified;

pub use client::Store;
pub use config::StoreConfig;
pub use queue::Completion;
pub use raw::SourceStatusCount;
pub use schema::init_schema;
