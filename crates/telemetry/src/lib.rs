//! Internal telemetry for the lead pipeline.
//!
//! Process-wide counters, component health, and tracing setup. Snapshots
//! can be mirrored to ClickHouse by the worker.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
