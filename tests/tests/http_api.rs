//! HTTP surface tests: intake, triggers and read models through the router.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::{fixtures, mocks::ScriptedProvider, setup::TestContext};
use serde_json::{json, Value};
use uuid::Uuid;

fn server(ctx: &TestContext) -> TestServer {
    TestServer::new(ctx.router.clone()).expect("Failed to create test server")
}

#[tokio::test]
async fn test_ingest_archives_body_verbatim_with_metadata() {
    let ctx = TestContext::builder().build().await;
    let server = server(&ctx);

    let response = server
        .post("/ingest/tracker?date_from=2024-03-01")
        .add_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
        .add_header("X-Batch-Id", "batch-42")
        .add_header("User-Agent", "collector/1.0")
        .content_type("text/plain")
        .text("<<not json>>")
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["source"], "tracker");
    assert_eq!(body["received_bytes"], 12);

    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let raw = ctx.store.get_raw_event(id).await.unwrap().unwrap();
    assert_eq!(raw.raw_data, b"<<not json>>");
    assert_eq!(raw.request_metadata.ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(raw.request_metadata.user_agent.as_deref(), Some("collector/1.0"));
    assert_eq!(raw.request_metadata.content_type.as_deref(), Some("text/plain"));
    assert_eq!(raw.batch_id.as_deref(), Some("batch-42"));
    assert_eq!(
        raw.date_range.map(|r| r.date_from),
        Some(fixtures::date("2024-03-01"))
    );
}

#[tokio::test]
async fn test_ingest_keeps_non_utf8_bytes() {
    let ctx = TestContext::builder().build().await;
    let server = server(&ctx);
    let payload: Vec<u8> = vec![b'{', 0xff, 0xfe, b'"', 0xc3, 0x28, b'}'];

    let response = server
        .post("/ingest/tracker")
        .content_type("application/octet-stream")
        .bytes(payload.clone().into())
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["received_bytes"], payload.len());

    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let raw = ctx.store.get_raw_event(id).await.unwrap().unwrap();
    assert_eq!(raw.raw_data, payload);
}

#[tokio::test]
async fn test_ingest_rejects_bad_source_and_dates() {
    let ctx = TestContext::builder().build().await;
    let server = server(&ctx);

    let response = server.post("/ingest/bad$name").text("{}").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "VALID_001");

    let response = server
        .post("/ingest/ga4?date_from=2024-03-02&date_to=2024-03-01")
        .text("{}")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "VALID_002");
}

#[tokio::test]
async fn test_trigger_flow_over_http() {
    let day = fixtures::date("2024-03-07");
    let provider = ScriptedProvider::replying("primary", fixtures::insight_reply(day, 1.0));
    let ctx = TestContext::with_provider(provider).await;
    let server = server(&ctx);

    server
        .post("/ingest/ga4?date_from=2024-03-07&date_to=2024-03-07")
        .text(fixtures::ga4_session(0, day).to_string())
        .await
        .assert_status(StatusCode::ACCEPTED);

    let range: Value = server
        .get("/pipeline/range?date_from=2024-03-07&date_to=2024-03-07")
        .await
        .json();
    assert_eq!(range["status"]["state"], "awaiting_normalization");
    assert_eq!(range["status"]["pending"], 1);

    let response = server
        .post("/pipeline/trigger")
        .json(&json!({ "date_from": "2024-03-07", "date_to": "2024-03-07" }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let trigger: Value = response.json();
    assert_eq!(trigger["raw_events"], 1);
    assert_eq!(trigger["task_ids"].as_array().unwrap().len(), 1);

    let queue: Value = server.get("/queue/status").await.json();
    assert_eq!(queue["pending"], 1);

    ctx.drain().await.unwrap();

    let queue: Value = server.get("/queue/status").await.json();
    assert_eq!(queue["pending"], 0);
    assert_eq!(queue["completed_today"], 4);

    let insights: Value = server.get("/insights?limit=5").await.json();
    let insights = insights.as_array().unwrap();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0]["status"], "completed");
    assert_eq!(insights[0]["provider"], "primary");

    let range: Value = server
        .get("/pipeline/range?date_from=2024-03-07&date_to=2024-03-07")
        .await
        .json();
    assert_eq!(range["status"]["state"], "ready");
}

#[tokio::test]
async fn test_trigger_errors() {
    let ctx = TestContext::builder().build().await;
    let server = server(&ctx);

    let response = server
        .post("/pipeline/trigger")
        .json(&json!({ "date_from": "2024-03-02", "date_to": "2024-03-01" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "VALID_001");

    let response = server
        .post("/pipeline/trigger")
        .json(&json!({ "date_from": "2024-03-01", "date_to": "2024-03-01" }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["code"], "NO_DATA");
}

#[tokio::test]
async fn test_read_models_validate_query() {
    let ctx = TestContext::builder().build().await;
    let server = server(&ctx);

    server.get("/insights?limit=0").await.assert_status(StatusCode::BAD_REQUEST);
    server
        .get("/leads/hot?min_score=101")
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let insights: Value = server.get("/insights").await.json();
    assert_eq!(insights, json!([]));
    let leads: Value = server.get("/leads/hot").await.json();
    assert_eq!(leads, json!([]));

    let range: Value = server
        .get("/pipeline/range?date_from=2024-01-01&date_to=2024-01-31")
        .await
        .json();
    assert_eq!(range["status"]["state"], "no_data");
}
