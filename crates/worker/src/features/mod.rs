//! Feature engine: behavioral signals, scores, segments and per-identity aggregates.

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod scoring;
pub mod segment;
pub mod signals;

pub use config::{KeyPageMatcher, KeyPagePattern, ScoringConfig};
pub use engine::{FeatureEngine, FeatureReport};
pub use scoring::{Scores, VisitHistory};
pub use signals::Signals;
