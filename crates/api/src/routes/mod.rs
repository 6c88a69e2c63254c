//! API routes.

pub mod health;
pub mod ingest;
pub mod insights;
pub mod pipeline;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use pipeline_core::limits::MAX_RAW_PAYLOAD_BYTES;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest/:source", post(ingest::ingest_handler))
        .route("/pipeline/trigger", post(pipeline::trigger_handler))
        .route("/pipeline/range", get(pipeline::range_handler))
        .route("/queue/status", get(pipeline::queue_status_handler))
        .route("/insights", get(insights::insights_handler))
        .route("/leads/hot", get(insights::hot_leads_handler))
        .route("/health", get(health::health_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/health/live", get(health::live_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(CompressionLayer::new())
                // Leave headroom so oversized bodies reach the coded size check
                .layer(DefaultBodyLimit::max(MAX_RAW_PAYLOAD_BYTES + 1024)),
        )
        .with_state(state)
}
