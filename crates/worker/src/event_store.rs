//! Raw event intake.
//!
//! Payloads are archived verbatim before anything looks at their content,
//! so a payload that later fails normalization is still replayable.

use std::time::Instant;

use chrono::Utc;
use pipeline_core::schema::{validate_request_metadata, validate_source_name};
use pipeline_core::{
    DateRange, Error, LedgerEntry, Operation, ProcessingStatus, RawEvent, RequestMetadata, Result,
};
use store::{SourceStatusCount, Store};
use telemetry::metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::LedgerSink;

/// Append-only archive of raw payloads.
#[derive(Clone)]
pub struct EventStore {
    store: Store,
    ledger: LedgerSink,
}

impl EventStore {
    pub fn new(store: Store, ledger: LedgerSink) -> Self {
        Self { store, ledger }
    }

    /// Persist a payload as received.
    ///
    /// Only the source name and request metadata are validated. The payload
    /// itself is stored even when it is not JSON.
    pub async fn ingest(
        &self,
        source: &str,
        payload: impl Into<Vec<u8>>,
        request_metadata: RequestMetadata,
        date_range: Option<DateRange>,
    ) -> Result<RawEvent> {
        let start = Instant::now();
        metrics().raw_events_received.inc();

        if let Err(e) = validate_source_name(source).and_then(|_| validate_request_metadata(&request_metadata)) {
            metrics().raw_events_rejected.inc();
            return Err(e);
        }

        let raw = RawEvent {
            id: Uuid::new_v4(),
            source: source.to_string(),
            raw_data: payload.into(),
            batch_id: request_metadata.batch_id.clone(),
            request_metadata,
            status: ProcessingStatus::Pending,
            date_range,
            fetched_at: Utc::now(),
            error: None,
            processed_at: None,
        };

        let stored = self.store.insert_raw_event(&raw).await;
        let elapsed = start.elapsed();
        metrics().ingest_latency_ms.observe(elapsed.as_millis() as u64);

        let entry = LedgerEntry::new(Operation::Ingest, source).elapsed(elapsed);
        match stored {
            Ok(()) => {
                debug!(id = %raw.id, source = %raw.source, bytes = raw.raw_data.len(), "Raw event archived");
                self.ledger.record(entry.counts(1, 0)).await;
                Ok(raw)
            }
            Err(e) => {
                self.ledger
                    .record(entry.counts(0, 1).error(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Set the processing status of a raw event.
    pub async fn mark_processed(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if self
            .store
            .mark_raw_processed(id, status, error, Utc::now())
            .await?
        {
            Ok(())
        } else {
            Err(Error::not_found(format!("raw event {id}")))
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<RawEvent> {
        self.store
            .get_raw_event(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("raw event {id}")))
    }

    /// Reset failed or skipped raw events to pending.
    ///
    /// Returns the ids that were reset. Pending and processed events are left alone.
    pub async fn requeue(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut requeued = Vec::new();
        for &id in ids {
            let Some(raw) = self.store.get_raw_event(id).await? else {
                warn!(id = %id, "Requeue skipped unknown raw event");
                continue;
            };
            if matches!(raw.status, ProcessingStatus::Failed | ProcessingStatus::Skipped) {
                self.store
                    .mark_raw_processed(id, ProcessingStatus::Pending, None, Utc::now())
                    .await?;
                requeued.push(id);
            }
        }

        if !requeued.is_empty() {
            info!(count = requeued.len(), "Raw events requeued");
        }
        Ok(requeued)
    }

    /// Oldest pending raw events.
    pub async fn pending(&self, limit: u32) -> Result<Vec<Uuid>> {
        self.store.pending_raw_ids(limit).await
    }

    pub async fn pending_in_range(&self, range: DateRange) -> Result<Vec<Uuid>> {
        self.store
            .raw_ids_in_range(range, ProcessingStatus::Pending)
            .await
    }

    pub async fn status_counts_in_range(&self, range: DateRange) -> Result<Vec<SourceStatusCount>> {
        self.store.raw_status_by_source(range).await
    }
}
