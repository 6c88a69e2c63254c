//! Insight generation through the queue: provider fallback, retries and
//! output checks.

use integration_tests::{
    fixtures,
    mocks::{Reply, ScriptedProvider},
    setup::TestContext,
};
use pipeline_core::{InsightStatus, ProviderErrorCode, QualityFlag, TaskStatus, TaskType};

async fn run_day(ctx: &TestContext, day: chrono::NaiveDate) {
    for i in 0..4 {
        ctx.ingest_for_day("ga4", fixtures::ga4_session(i, day).to_string(), day)
            .await;
        ctx.ingest_for_day("metrika", fixtures::metrika_visit(i, day).to_string(), day)
            .await;
    }
    ctx.pipeline.trigger_pipeline(day, day, true).await.unwrap();
    ctx.drain().await.unwrap();
}

#[tokio::test]
async fn test_three_provider_failures_fail_task_and_record_failed_insight() {
    let provider = ScriptedProvider::failing("primary");
    let ctx = TestContext::with_provider(provider.clone()).await;
    let day = fixtures::date("2024-06-01");

    run_day(&ctx, day).await;

    let failed = ctx.store.tasks_with_status(TaskStatus::Failed, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    let task = &failed[0];
    assert_eq!(task.task_type, TaskType::Analysis);
    assert_eq!(task.attempts, 3);
    let last_error = task.last_error.as_deref().unwrap();
    assert!(last_error.contains("LLM_005"), "{last_error}");
    assert_eq!(provider.calls(), 3);

    let insights = ctx.pipeline.get_latest_insights(10).await.unwrap();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].status, InsightStatus::Failed);
    assert_eq!(insights[0].task_id, Some(task.id));
    assert!(insights[0].error.as_deref().unwrap().contains("LLM_005"));

    let status = ctx.pipeline.get_queue_status().await.unwrap();
    assert_eq!(status.failed_today, 1);
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let day = fixtures::date("2024-06-02");
    let provider = ScriptedProvider::new(
        "primary",
        vec![
            Reply::Fail(ProviderErrorCode::Timeout),
            Reply::Text(fixtures::insight_reply(day, 4.0)),
        ],
    );
    let ctx = TestContext::with_provider(provider.clone()).await;

    run_day(&ctx, day).await;

    let insights = ctx.pipeline.get_latest_insights(10).await.unwrap();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].status, InsightStatus::Completed);
    assert_eq!(provider.calls(), 2);

    let task = ctx
        .store
        .get_task(insights[0].task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
}

#[tokio::test]
async fn test_missing_credentials_fall_back_to_next_provider() {
    let day = fixtures::date("2024-06-03");
    let primary = ScriptedProvider::without_credentials("primary");
    let backup = ScriptedProvider::replying("backup", fixtures::insight_reply(day, 4.0));
    let ctx = TestContext::builder()
        .provider(primary.clone())
        .provider(backup.clone())
        .build()
        .await;

    run_day(&ctx, day).await;

    let insight = &ctx.pipeline.get_latest_insights(1).await.unwrap()[0];
    assert_eq!(insight.status, InsightStatus::Completed);
    assert_eq!(insight.provider.as_deref(), Some("backup"));
    assert_eq!(insight.model_used.as_deref(), Some("scripted-1"));
    assert_eq!(primary.calls(), 0);
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn test_unparseable_output_falls_through() {
    let day = fixtures::date("2024-06-04");
    let primary = ScriptedProvider::replying("primary", "I cannot help with that.");
    let backup = ScriptedProvider::replying(
        "backup",
        fixtures::fenced_reply(&fixtures::insight_reply(day, 4.0)),
    );
    let ctx = TestContext::builder()
        .provider(primary.clone())
        .provider(backup.clone())
        .build()
        .await;

    run_day(&ctx, day).await;

    let insight = &ctx.pipeline.get_latest_insights(1).await.unwrap()[0];
    assert_eq!(insight.provider.as_deref(), Some("backup"));
    assert_eq!(insight.key_findings.len(), 1);
    assert_eq!(insight.recommendations.len(), 1);
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn test_wrong_citation_is_flagged_and_lowers_confidence() {
    let day = fixtures::date("2024-06-05");
    // Four sessions per source were ingested, the model claims 999
    let provider = ScriptedProvider::replying("primary", fixtures::insight_reply(day, 999.0));
    let ctx = TestContext::with_provider(provider).await;

    run_day(&ctx, day).await;

    let insight = &ctx.pipeline.get_latest_insights(1).await.unwrap()[0];
    assert_eq!(insight.status, InsightStatus::Completed);
    assert_eq!(insight.quality_flags.len(), 1);
    match &insight.quality_flags[0] {
        QualityFlag::CitationMismatch {
            metric,
            cited,
            actual,
            ..
        } => {
            assert_eq!(metric, "sessions");
            assert_eq!(*cited, 999.0);
            assert_eq!(*actual, 4.0);
        }
        other => panic!("unexpected flag {other:?}"),
    }
    assert!((insight.confidence_score - 0.7).abs() < 1e-9);

    let ledger = ctx
        .store
        .ledger_for_task(insight.task_id.unwrap())
        .await
        .unwrap();
    assert!(ledger
        .iter()
        .any(|e| e.status == pipeline_core::LedgerStatus::Warning));
}

#[tokio::test]
async fn test_analysis_without_unified_metrics_fails_once() {
    let provider = ScriptedProvider::replying("primary", "{}");
    let ctx = TestContext::with_provider(provider.clone()).await;

    let task = ctx
        .pipeline
        .replay(
            TaskType::Analysis,
            vec!["2030-01-01".to_string(), "2030-01-02".to_string()],
        )
        .await
        .unwrap();
    ctx.drain().await.unwrap();

    let task = ctx.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1, "no data is not retried");
    assert_eq!(provider.calls(), 0);
}
