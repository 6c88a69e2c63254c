//! Tests for health check endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::setup::TestContext;
use telemetry::health;

/// /health reports every component and the queue depth
#[tokio::test]
async fn test_health_endpoint_structure() {
    let ctx = TestContext::builder().build().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in [
        "status",
        "store_connected",
        "clickhouse_connected",
        "providers_available",
    ] {
        assert!(body.get(field).is_some(), "Response should have '{field}' field");
    }
    assert!(
        body["queue_depth"].as_u64().is_some(),
        "queue_depth should be a valid u64 number"
    );

    let status = body["status"].as_str().unwrap_or("");
    assert!(
        matches!(status, "healthy" | "degraded" | "unhealthy"),
        "unexpected status '{status}'"
    );
}

/// Readiness follows the store, the only hard dependency
#[tokio::test]
async fn test_ready_once_store_is_healthy() {
    let ctx = TestContext::builder().build().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    health().store.set_healthy();
    server.get("/health/ready").await.assert_status_ok();

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["store_connected"], true);
    assert_ne!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::builder().build().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/health/live").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}
