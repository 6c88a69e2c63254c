//! End-to-end tests for the queue-driven pipeline.
//!
//! Payloads are archived through the control surface, a trigger enqueues the
//! first stage, and draining the queue runs every follow-up stage in order:
//! normalize → feature → reconcile (→ analysis when requested).

use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use integration_tests::{fixtures, mocks::ScriptedProvider, setup::TestContext};
use pipeline_core::{
    DateRange, Error, LedgerStatus, Operation, ProcessingStatus, RangeStatus, RequestMetadata,
    TaskStatus, TaskType,
};
use worker::TaskOutcome;

async fn ingest_sources(ctx: &TestContext, day: NaiveDate, ga4: usize, metrika: usize) {
    for i in 0..ga4 {
        let payload = fixtures::ga4_session(i, day).to_string();
        ctx.ingest_for_day("ga4", payload, day).await;
    }
    for i in 0..metrika {
        let payload = fixtures::metrika_visit(i, day).to_string();
        ctx.ingest_for_day("metrika", payload, day).await;
    }
}

#[tokio::test]
async fn test_unknown_source_short_visit_is_bounce() {
    let ctx = TestContext::builder().build().await;
    let today = Utc::now().date_naive();
    let raw = ctx
        .ingest_for_day("X", fixtures::short_single_page_visit(), today)
        .await;

    ctx.pipeline.trigger_pipeline(today, today, false).await.unwrap();
    ctx.drain().await.unwrap();

    let event = ctx.store.get_normalized_by_raw(raw.id).await.unwrap().unwrap();
    assert_eq!(event.session_id, "s1");
    assert_eq!(event.page_views, 1);
    assert!(event.is_bounce, "15s single page visit from an unknown source is a bounce");

    let raw = ctx.store.get_raw_event(raw.id).await.unwrap().unwrap();
    assert_eq!(raw.status, ProcessingStatus::Processed);
}

#[tokio::test]
async fn test_divergent_sources_reconcile_to_mean_with_lower_quality() {
    let ctx = TestContext::builder().build().await;
    let divergent = fixtures::date("2024-03-01");
    let agreeing = fixtures::date("2024-03-02");
    ingest_sources(&ctx, divergent, 100, 120).await;
    ingest_sources(&ctx, agreeing, 100, 100).await;

    ctx.pipeline
        .trigger_pipeline(divergent, agreeing, false)
        .await
        .unwrap();
    let runs = ctx.drain().await.unwrap();
    assert!(runs
        .iter()
        .all(|r| matches!(r.outcome, TaskOutcome::Completed { .. })));

    let unified = ctx.store.get_unified_metric(divergent).await.unwrap().unwrap();
    assert!(unified.ga4_available && unified.metrika_available);
    assert_eq!(unified.unified_sessions, 110);

    let clean = ctx.store.get_unified_metric(agreeing).await.unwrap().unwrap();
    assert_eq!(clean.unified_sessions, 100);
    assert_eq!(clean.data_quality_score, 100);
    assert!(unified.data_quality_score < clean.data_quality_score);

    let sessions = unified
        .discrepancies
        .iter()
        .find(|d| d.metric == "sessions")
        .unwrap();
    assert!(sessions.relative_divergence > 0.15);

    let warnings: Vec<_> = ctx
        .store
        .recent_ledger(Some(Operation::Reconcile), 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status == LedgerStatus::Warning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].scope, divergent.to_string());
}

#[tokio::test]
async fn test_trigger_on_empty_range_is_no_data() {
    let ctx = TestContext::builder().build().await;
    let day = fixtures::date("2024-05-01");

    let err = ctx.pipeline.trigger_pipeline(day, day, true).await.unwrap_err();
    assert!(matches!(err, Error::NoData(_)));
    assert_eq!(err.http_status(), 404);

    let status = ctx.pipeline.get_queue_status().await.unwrap();
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_range_status_distinguishes_pending_from_ready() {
    let ctx = TestContext::builder().build().await;
    let day = fixtures::date("2024-03-10");
    let range = DateRange::day(day);
    assert_eq!(ctx.pipeline.range_status(range).await.unwrap(), RangeStatus::NoData);

    ingest_sources(&ctx, day, 2, 0).await;
    assert_eq!(
        ctx.pipeline.range_status(range).await.unwrap(),
        RangeStatus::AwaitingNormalization {
            pending: 2,
            normalized: 0
        }
    );

    ctx.pipeline.trigger_pipeline(day, day, false).await.unwrap();
    ctx.drain().await.unwrap();
    assert_eq!(
        ctx.pipeline.range_status(range).await.unwrap(),
        RangeStatus::Ready { normalized: 2 }
    );
}

#[tokio::test]
async fn test_full_run_produces_insight() {
    let day = fixtures::date("2024-03-05");
    let provider = ScriptedProvider::replying("primary", fixtures::insight_reply(day, 10.0));
    let ctx = TestContext::with_provider(provider.clone()).await;
    ingest_sources(&ctx, day, 10, 10).await;

    let trigger = ctx.pipeline.trigger_pipeline(day, day, true).await.unwrap();
    assert_eq!(trigger.raw_events, 20);
    assert_eq!(trigger.task_ids.len(), 1);

    let runs = ctx.drain().await.unwrap();
    let types: Vec<TaskType> = runs.iter().map(|r| r.task_type).collect();
    assert_eq!(
        types,
        vec![
            TaskType::Normalize,
            TaskType::Feature,
            TaskType::Reconcile,
            TaskType::Analysis
        ]
    );

    let insights = ctx.pipeline.get_latest_insights(5).await.unwrap();
    assert_eq!(insights.len(), 1);
    let insight = &insights[0];
    assert_eq!(insight.provider.as_deref(), Some("primary"));
    assert!(insight.quality_flags.is_empty(), "{:?}", insight.quality_flags);
    assert!((insight.confidence_score - 0.8).abs() < 1e-9);
    assert_eq!(insight.date_range, DateRange::day(day));
    assert_eq!(provider.calls(), 1);
    assert!(provider.prompts()[0].contains(&day.to_string()));

    let status = ctx.pipeline.get_queue_status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.processing, 0);
    assert_eq!(status.completed_today, 4);
    assert_eq!(status.failed_today, 0);
}

#[tokio::test]
async fn test_bad_payload_fails_alone_and_can_be_requeued() {
    let ctx = TestContext::builder().build().await;
    let day = fixtures::date("2024-04-01");
    let bad = ctx.ingest_for_day("tracker", "not json at all".into(), day).await;
    let ping = ctx
        .ingest_for_day("tracker", r#"{"type":"ping"}"#.into(), day)
        .await;
    let good = ctx
        .ingest_for_day(
            "tracker",
            fixtures::tracker_session("t-1", "c-1", day).to_string(),
            day,
        )
        .await;

    ctx.pipeline.trigger_pipeline(day, day, false).await.unwrap();
    ctx.drain().await.unwrap();

    let bad_raw = ctx.store.get_raw_event(bad.id).await.unwrap().unwrap();
    assert_eq!(bad_raw.status, ProcessingStatus::Failed);
    assert!(bad_raw.error.unwrap().contains("NORM_"));
    // The archived payload is untouched
    assert_eq!(bad_raw.raw_data, b"not json at all");

    let ping_raw = ctx.store.get_raw_event(ping.id).await.unwrap().unwrap();
    assert_eq!(ping_raw.status, ProcessingStatus::Skipped);

    let good_raw = ctx.store.get_raw_event(good.id).await.unwrap().unwrap();
    assert_eq!(good_raw.status, ProcessingStatus::Processed);

    let requeued = ctx.pipeline.requeue_raw(&[bad.id, good.id]).await.unwrap();
    assert_eq!(requeued, vec![bad.id]);
    let bad_raw = ctx.store.get_raw_event(bad.id).await.unwrap().unwrap();
    assert_eq!(bad_raw.status, ProcessingStatus::Pending);
}

#[tokio::test]
async fn test_hot_leads_after_run() {
    let ctx = TestContext::builder().build().await;
    let day = fixtures::date("2024-04-02");
    ctx.ingest_for_day(
        "tracker",
        fixtures::tracker_session("t-1", "lead-1", day).to_string(),
        day,
    )
    .await;
    ctx.ingest_for_day(
        "tracker",
        fixtures::tracker_session("t-2", "lead-2", day).to_string(),
        day,
    )
    .await;

    ctx.pipeline.trigger_pipeline(day, day, false).await.unwrap();
    ctx.drain().await.unwrap();

    let leads = ctx.pipeline.get_hot_leads(0, 10).await.unwrap();
    assert_eq!(leads.len(), 2);
    assert!(leads.windows(2).all(|w| w[0].hot_score >= w[1].hot_score));
    assert!(leads.iter().all(|l| l.total_sessions == 1));

    let none = ctx.pipeline.get_hot_leads(100, 10).await.unwrap();
    assert!(none.iter().all(|l| l.hot_score == 100));
}

#[tokio::test]
async fn test_geo_lookup_fills_missing_location() {
    let geo = integration_tests::mocks::StaticGeoResolver::new("DE", "Berlin");
    let ctx = TestContext::builder().geo_resolver(geo.clone()).build().await;
    let day = fixtures::date("2024-04-03");

    let meta = RequestMetadata {
        ip: Some("203.0.113.7".into()),
        ..Default::default()
    };
    let raw = ctx
        .pipeline
        .ingest(
            "tracker",
            fixtures::tracker_session("t-geo", "c-geo", day).to_string(),
            meta,
            Some(DateRange::day(day)),
        )
        .await
        .unwrap();

    ctx.pipeline.trigger_pipeline(day, day, false).await.unwrap();
    ctx.drain().await.unwrap();

    let event = ctx.store.get_normalized_by_raw(raw.id).await.unwrap().unwrap();
    assert_eq!(event.geo.country.as_deref(), Some("DE"));
    assert_eq!(event.geo.city.as_deref(), Some("Berlin"));
    assert_eq!(geo.lookups(), 1);
}

#[tokio::test]
async fn test_replay_reconcile_is_idempotent() {
    let ctx = TestContext::builder().build().await;
    let day = fixtures::date("2024-04-04");
    ingest_sources(&ctx, day, 3, 3).await;
    ctx.pipeline.trigger_pipeline(day, day, false).await.unwrap();
    ctx.drain().await.unwrap();
    let before = ctx.store.get_unified_metric(day).await.unwrap().unwrap();

    let task = ctx
        .pipeline
        .replay(TaskType::Reconcile, vec![day.to_string()])
        .await
        .unwrap();
    ctx.drain().await.unwrap();

    let replayed = ctx.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(replayed.status, TaskStatus::Completed);
    let after = ctx.store.get_unified_metric(day).await.unwrap().unwrap();
    assert!(after.same_content(&before));
    assert_eq!(after.updated_at, before.updated_at);

    let err = ctx.pipeline.replay(TaskType::Reconcile, vec![]).await.unwrap_err();
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn test_session_dated_before_fetch_day_is_reconciled() {
    let ctx = TestContext::builder().build().await;
    let today = Utc::now().date_naive();
    let yesterday = today - Days::new(1);
    // No declared range: the raw is filed under today, its session under yesterday.
    ctx.pipeline
        .ingest(
            "tracker",
            fixtures::tracker_session("s1", "c1", yesterday).to_string(),
            RequestMetadata::default(),
            None,
        )
        .await
        .unwrap();

    ctx.pipeline.trigger_pipeline(today, today, false).await.unwrap();
    ctx.drain().await.unwrap();

    assert_eq!(ctx.store.features_for_date(yesterday).await.unwrap().len(), 1);
    assert!(ctx.store.get_unified_metric(yesterday).await.unwrap().is_some());
    assert_eq!(
        ctx.pipeline
            .range_status(DateRange::day(yesterday))
            .await
            .unwrap(),
        RangeStatus::Ready { normalized: 1 }
    );

    ctx.pipeline
        .trigger_pipeline(yesterday, yesterday, false)
        .await
        .unwrap();
    let runs = ctx.drain().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].task_type, TaskType::Reconcile);
    assert!(matches!(runs[0].outcome, TaskOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_batched_run_reconciles_once_after_every_batch() {
    let day = fixtures::date("2024-03-12");
    let provider = ScriptedProvider::replying("primary", fixtures::insight_reply(day, 5.0));
    let ctx = TestContext::builder()
        .provider(provider.clone())
        .config(|c| c.normalizer.batch_size = 2)
        .build()
        .await;
    ingest_sources(&ctx, day, 5, 0).await;

    let trigger = ctx.pipeline.trigger_pipeline(day, day, true).await.unwrap();
    assert_eq!(trigger.task_ids.len(), 3);

    let orchestrator = ctx.pipeline.orchestrator();
    for _ in 0..3 {
        let run = orchestrator.process_next().await.unwrap().unwrap();
        assert_eq!(run.task_type, TaskType::Normalize);
    }
    // A second worker holds the first feature batch while the others finish.
    let held = ctx.store.claim_next_task(Utc::now()).await.unwrap().unwrap();
    assert_eq!(held.task_type, TaskType::Feature);
    for _ in 0..2 {
        let run = orchestrator.process_next().await.unwrap().unwrap();
        assert_eq!(run.task_type, TaskType::Feature);
    }
    assert!(orchestrator.process_next().await.unwrap().is_none());
    assert!(ctx.store.get_unified_metric(day).await.unwrap().is_none());

    // The held batch is abandoned and picked up again.
    ctx.store
        .reclaim_stale_tasks(Duration::ZERO, Utc::now())
        .await
        .unwrap();
    let runs = ctx.drain().await.unwrap();
    let types: Vec<TaskType> = runs.iter().map(|r| r.task_type).collect();
    assert_eq!(
        types,
        vec![TaskType::Feature, TaskType::Reconcile, TaskType::Analysis]
    );

    let unified = ctx.store.get_unified_metric(day).await.unwrap().unwrap();
    assert_eq!(unified.unified_sessions, 5);
    assert_eq!(ctx.pipeline.get_latest_insights(5).await.unwrap().len(), 1);
    assert_eq!(provider.calls(), 1);
}
