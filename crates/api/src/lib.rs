//! HTTP API layer for the lead pipeline.
//!
//! A thin axum surface over [`worker::Pipeline`]: raw intake, pipeline
//! triggers, queue status and the insight and hot lead read models.

pub mod extractors;
pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
