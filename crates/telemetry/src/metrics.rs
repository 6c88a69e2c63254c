//! Internal metrics collection.
//!
//! Counters live in-process. The worker periodically mirrors a snapshot
//! to ClickHouse when the mirror is enabled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the lead pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    // Intake
    pub raw_events_received: Counter,
    pub raw_events_rejected: Counter,

    // Normalizer
    pub events_normalized: Counter,
    pub events_skipped: Counter,
    pub normalization_failures: Counter,

    // Feature engine
    pub features_computed: Counter,
    pub feature_failures: Counter,
    pub aggregate_conflicts: Counter,
    pub score_clamps: Counter,

    // Reconciler
    pub days_reconciled: Counter,
    pub reconcile_unchanged: Counter,
    pub divergence_warnings: Counter,

    // Insight orchestrator
    pub insights_generated: Counter,
    pub insights_failed: Counter,
    pub provider_calls: Counter,
    pub provider_errors: Counter,
    pub tokens_used: Counter,

    // Queue
    pub tasks_claimed: Counter,
    pub tasks_completed: Counter,
    pub tasks_retried: Counter,
    pub tasks_failed: Counter,
    pub tasks_reclaimed: Counter,

    // Stores
    pub store_errors: Counter,
    pub ledger_write_errors: Counter,
    pub clickhouse_inserts: Counter,
    pub clickhouse_insert_errors: Counter,

    // Latency histograms
    pub ingest_latency_ms: Histogram,
    pub task_latency_ms: Histogram,
    pub provider_latency_ms: Histogram,
    pub clickhouse_latency_ms: Histogram,

    // Gauges
    pub active_connections: Gauge,
    pub queue_depth: Gauge,
    pub workers_busy: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub raw_events_received: u64,
    pub raw_events_rejected: u64,
    pub events_normalized: u64,
    pub events_skipped: u64,
    pub normalization_failures: u64,
    pub features_computed: u64,
    pub feature_failures: u64,
    pub aggregate_conflicts: u64,
    pub score_clamps: u64,
    pub days_reconciled: u64,
    pub divergence_warnings: u64,
    pub insights_generated: u64,
    pub insights_failed: u64,
    pub provider_calls: u64,
    pub provider_errors: u64,
    pub tokens_used: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_reclaimed: u64,
    pub store_errors: u64,
    pub ingest_latency_mean_ms: f64,
    pub task_latency_mean_ms: f64,
    pub provider_latency_mean_ms: f64,
    pub active_connections: u64,
    pub queue_depth: u64,
    pub workers_busy: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            raw_events_received: self.raw_events_received.get(),
            raw_events_rejected: self.raw_events_rejected.get(),
            events_normalized: self.events_normalized.get(),
            events_skipped: self.events_skipped.get(),
            normalization_failures: self.normalization_failures.get(),
            features_computed: self.features_computed.get(),
            feature_failures: self.feature_failures.get(),
            aggregate_conflicts: self.aggregate_conflicts.get(),
            score_clamps: self.score_clamps.get(),
            days_reconciled: self.days_reconciled.get(),
            divergence_warnings: self.divergence_warnings.get(),
            insights_generated: self.insights_generated.get(),
            insights_failed: self.insights_failed.get(),
            provider_calls: self.provider_calls.get(),
            provider_errors: self.provider_errors.get(),
            tokens_used: self.tokens_used.get(),
            tasks_completed: self.tasks_completed.get(),
            tasks_failed: self.tasks_failed.get(),
            tasks_reclaimed: self.tasks_reclaimed.get(),
            store_errors: self.store_errors.get(),
            ingest_latency_mean_ms: self.ingest_latency_ms.mean(),
            task_latency_mean_ms: self.task_latency_ms.mean(),
            provider_latency_mean_ms: self.provider_latency_ms.mean(),
            active_connections: self.active_connections.get(),
            queue_depth: self.queue_depth.get(),
            workers_busy: self.workers_busy.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
