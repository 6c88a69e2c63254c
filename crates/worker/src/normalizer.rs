//! Raw payload normalization.
//!
//! Turns one pending raw event into at most one normalized session. Field
//! extraction is delegated to the source's [`SessionFields`] implementation;
//! this module owns the derived fields (bounce, traffic type, fallbacks) and
//! the raw event's status transition.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use pipeline_core::{
    Device, Error, LedgerEntry, NormalizationErrorCode, NormalizedEvent, Operation, ParsedPayload,
    ProcessingStatus, RawEvent, Result, SessionFields, SourceKind, SourcePayload,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use store::Store;
use telemetry::metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::classify_traffic;
use crate::enrichment::{EnrichmentWorker, GeoResolver, NoopGeoResolver};
use crate::event_store::EventStore;
use crate::ledger::LedgerSink;

/// Normalizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Bounce threshold for Yandex Metrika visits
    #[serde(default = "default_metrika_bounce")]
    pub metrika_bounce_threshold_secs: f64,
    /// Bounce threshold for GA4 sessions
    #[serde(default = "default_ga4_bounce")]
    pub ga4_bounce_threshold_secs: f64,
    /// Bounce threshold for site trackers and unknown sources
    #[serde(default = "default_tracker_bounce")]
    pub tracker_bounce_threshold_secs: f64,
    /// Raw events per normalize task
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Resolve geo from the client IP when the source gives none
    #[serde(default)]
    pub geo_lookup: bool,
}

fn default_metrika_bounce() -> f64 {
    SourceKind::Metrika.default_bounce_threshold_secs()
}

fn default_ga4_bounce() -> f64 {
    SourceKind::Ga4.default_bounce_threshold_secs()
}

fn default_tracker_bounce() -> f64 {
    SourceKind::Tracker.default_bounce_threshold_secs()
}

fn default_batch_size() -> u32 {
    500
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            metrika_bounce_threshold_secs: default_metrika_bounce(),
            ga4_bounce_threshold_secs: default_ga4_bounce(),
            tracker_bounce_threshold_secs: default_tracker_bounce(),
            batch_size: default_batch_size(),
            geo_lookup: false,
        }
    }
}

impl NormalizerConfig {
    pub fn bounce_threshold(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Metrika => self.metrika_bounce_threshold_secs,
            SourceKind::Ga4 => self.ga4_bounce_threshold_secs,
            SourceKind::Tracker => self.tracker_bounce_threshold_secs,
        }
    }
}

/// What happened to one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    /// A session exists for the raw event. `created` is false on re-normalization.
    Normalized { event_id: Uuid, created: bool },
    /// The payload carried no session.
    Skipped { marker: String },
    /// The payload could not be mapped; the raw event is marked failed.
    Failed { error: String },
}

/// Totals for a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub normalized: u32,
    pub created: u32,
    pub skipped: u32,
    pub failed: u32,
    /// Normalized event ids, in input order
    pub event_ids: Vec<Uuid>,
}

/// Outcome of the pure derivation step.
enum Derived {
    Session {
        event: NormalizedEvent,
        client_ip: Option<IpAddr>,
    },
    NonSession(String),
}

/// Maps raw events onto the canonical session schema.
#[derive(Clone)]
pub struct Normalizer {
    store: Store,
    events: EventStore,
    ledger: LedgerSink,
    enricher: Arc<EnrichmentWorker>,
    geo: Arc<dyn GeoResolver>,
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(store: Store, ledger: LedgerSink, config: NormalizerConfig) -> Self {
        Self {
            events: EventStore::new(store.clone(), ledger.clone()),
            store,
            ledger,
            enricher: Arc::new(EnrichmentWorker::new()),
            geo: Arc::new(NoopGeoResolver),
            config,
        }
    }

    pub fn with_geo_resolver(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = geo;
        self
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize one raw event and settle its status.
    ///
    /// Payload problems end as [`NormalizeOutcome::Failed`]; only store
    /// failures are returned as errors.
    pub async fn normalize(&self, raw_id: Uuid) -> Result<NormalizeOutcome> {
        let raw = self.events.get(raw_id).await?;

        let derived = match self.derive(&raw) {
            Ok(derived) => derived,
            Err(e) => {
                metrics().normalization_failures.inc();
                warn!(raw_id = %raw.id, source = %raw.source, error = %e, "Normalization failed");
                let error = e.to_string();
                self.events
                    .mark_processed(raw.id, ProcessingStatus::Failed, Some(&error))
                    .await?;
                return Ok(NormalizeOutcome::Failed { error });
            }
        };

        let (mut event, client_ip) = match derived {
            Derived::NonSession(marker) => {
                metrics().events_skipped.inc();
                debug!(raw_id = %raw.id, marker = %marker, "Skipping non-session payload");
                self.events
                    .mark_processed(raw.id, ProcessingStatus::Skipped, None)
                    .await?;
                return Ok(NormalizeOutcome::Skipped { marker });
            }
            Derived::Session { event, client_ip } => (event, client_ip),
        };

        if self.config.geo_lookup && event.geo.is_empty() {
            if let Some(ip) = client_ip {
                match self.geo.resolve(ip).await {
                    Ok(Some(geo)) => event.geo = geo,
                    Ok(None) => {}
                    Err(e) => warn!(raw_id = %raw.id, error = %e, "Geo resolution failed"),
                }
            }
        }

        let (stored, created) = self.store.insert_normalized_event(&event).await?;
        if !created {
            let attached = self
                .store
                .attach_identifiers(stored.id, event.user_id.as_deref(), event.client_id.as_deref())
                .await?;
            if attached {
                debug!(event_id = %stored.id, "Attached newly discovered identifiers");
            }
        }

        self.events
            .mark_processed(raw.id, ProcessingStatus::Processed, None)
            .await?;
        metrics().events_normalized.inc();

        Ok(NormalizeOutcome::Normalized {
            event_id: stored.id,
            created,
        })
    }

    /// Normalize a batch. One record's failure never stops the others.
    pub async fn normalize_batch(&self, raw_ids: &[Uuid], task_id: Option<Uuid>) -> NormalizeReport {
        let start = Instant::now();
        let mut report = NormalizeReport::default();
        let mut last_error = None;

        for &raw_id in raw_ids {
            match self.normalize(raw_id).await {
                Ok(NormalizeOutcome::Normalized { event_id, created }) => {
                    report.normalized += 1;
                    if created {
                        report.created += 1;
                    }
                    report.event_ids.push(event_id);
                }
                Ok(NormalizeOutcome::Skipped { .. }) => report.skipped += 1,
                Ok(NormalizeOutcome::Failed { error }) => {
                    report.failed += 1;
                    last_error = Some(error);
                }
                Err(e) => {
                    warn!(raw_id = %raw_id, error = %e, "Normalization aborted for record");
                    report.failed += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        info!(
            total = raw_ids.len(),
            normalized = report.normalized,
            skipped = report.skipped,
            failed = report.failed,
            "Normalized batch"
        );

        let mut entry = LedgerEntry::new(Operation::Normalize, "raw_events")
            .counts(report.normalized + report.skipped, report.failed)
            .elapsed(start.elapsed())
            .details(json!({
                "created": report.created,
                "skipped": report.skipped,
            }));
        if let Some(error) = last_error {
            entry = entry.error(error);
        }
        if let Some(task_id) = task_id {
            entry = entry.task(task_id);
        }
        self.ledger.record(entry).await;

        report
    }

    /// Derive the normalized session. A pure function of the raw event,
    /// except for the fresh row id and creation time.
    fn derive(&self, raw: &RawEvent) -> Result<Derived> {
        let kind = SourceKind::from_source(&raw.source);
        let payload = match SourcePayload::parse(kind, &raw.raw_data)? {
            ParsedPayload::NonSession(marker) => return Ok(Derived::NonSession(marker)),
            ParsedPayload::Session(payload) => payload,
        };
        let fields = payload.fields();

        let session_id = fields
            .session_id()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::normalization(
                    NormalizationErrorCode::MissingSessionId,
                    format!("{} payload has no session id", kind.as_str()),
                )
            })?
            .to_string();

        let hits = fields.hits();
        let occurred_at = fields
            .occurred_at()
            .or_else(|| hits.iter().filter_map(|h| h.timestamp).min())
            .unwrap_or(raw.fetched_at);

        let pageview_hits = hits
            .iter()
            .filter(|h| h.kind == pipeline_core::HitKind::Pageview)
            .count() as u32;
        let page_views = fields.page_views().unwrap_or(pageview_hits.max(1));

        let duration = fields
            .duration_secs()
            .filter(|d| d.is_finite() && *d >= 0.0)
            .or_else(|| hit_span_secs(&hits));

        let is_bounce = page_views == 1
            && duration.is_some_and(|d| d < self.config.bounce_threshold(kind));

        let url = fields.url().map(str::to_string);
        let referrer = fields.referrer().map(str::to_string);
        let utm = fields.utm();
        let traffic_source_type = classify_traffic(&utm, referrer.as_deref(), url.as_deref());

        let device = self.device(fields, raw);
        let client_ip = fields
            .ip()
            .or(raw.request_metadata.ip.as_deref())
            .and_then(|ip| ip.trim().parse().ok());

        let event = NormalizedEvent {
            id: Uuid::new_v4(),
            raw_event_id: raw.id,
            source: raw.source.clone(),
            session_id,
            user_id: clean_id(fields.user_id()),
            client_id: clean_id(fields.client_id()),
            occurred_at,
            event_date: occurred_at.date_naive(),
            url,
            referrer,
            utm,
            traffic_source_type,
            device,
            geo: fields.geo(),
            page_views,
            raw_visit_duration: duration,
            is_bounce,
            hits,
            goals: fields.goals(),
            created_at: Utc::now(),
        };
        Ok(Derived::Session { event, client_ip })
    }

    fn device(&self, fields: &dyn SessionFields, raw: &RawEvent) -> Device {
        let mut device = Device {
            device_type: fields.device_category(),
            browser: fields.browser().map(str::to_string),
            os: fields.os().map(str::to_string),
        };
        let user_agent = fields
            .user_agent()
            .or(raw.request_metadata.user_agent.as_deref());
        if let Some(user_agent) = user_agent {
            self.enricher.enrich_device(&mut device, user_agent);
        }
        device
    }
}

/// Seconds between the first and last timestamped hit. Needs two timestamps.
fn hit_span_secs(hits: &[pipeline_core::Hit]) -> Option<f64> {
    let mut stamps = hits.iter().filter_map(|h| h.timestamp);
    let first = stamps.next()?;
    let (min, max, count) = stamps.fold((first, first, 1), |(min, max, n), ts| {
        (min.min(ts), max.max(ts), n + 1)
    });
    (count >= 2).then(|| (max - min).num_milliseconds() as f64 / 1000.0)
}

fn clean_id(id: Option<&str>) -> Option<String> {
    id.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
