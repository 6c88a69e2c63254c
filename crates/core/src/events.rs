//! Raw and normalized event types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{Error, Result, ValidationErrorCode};
use crate::limits::MAX_TRIGGER_RANGE_DAYS;

/// Processing status of a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(Error::validation(format!("unknown processing status: {other}"))),
        }
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

impl DateRange {
    /// Build a range, rejecting inverted or oversized spans.
    pub fn new(date_from: NaiveDate, date_to: NaiveDate) -> Result<Self> {
        if date_to < date_from {
            return Err(Error::validation_code(
                ValidationErrorCode::InvalidDateRange,
                format!("date_to {date_to} is before date_from {date_from}"),
            ));
        }
        let range = Self { date_from, date_to };
        if range.num_days() > MAX_TRIGGER_RANGE_DAYS {
            return Err(Error::validation_code(
                ValidationErrorCode::InvalidDateRange,
                format!(
                    "range of {} days exceeds {} day limit",
                    range.num_days(),
                    MAX_TRIGGER_RANGE_DAYS
                ),
            ));
        }
        Ok(range)
    }

    /// Single-day range.
    pub fn day(date: NaiveDate) -> Self {
        Self {
            date_from: date,
            date_to: date,
        }
    }

    /// Number of days covered, inclusive.
    pub fn num_days(&self) -> i64 {
        (self.date_to - self.date_from).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.date_from && date <= self.date_to
    }

    /// Every date in the range, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut out = Vec::with_capacity(self.num_days().max(0) as usize);
        let mut current = self.date_from;
        while current <= self.date_to {
            out.push(current);
            match current.checked_add_days(Days::new(1)) {
                Some(next) => current = next,
                None => break,
            }
        }
        out
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.date_from, self.date_to)
    }
}

/// Transport metadata captured at intake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct RequestMetadata {
    /// Client IP as seen by the intake
    #[validate(length(max = 64))]
    pub ip: Option<String>,
    #[validate(length(max = 1024))]
    pub user_agent: Option<String>,
    #[validate(length(max = 256))]
    pub batch_id: Option<String>,
    /// Content type of the original request
    #[validate(length(max = 128))]
    pub content_type: Option<String>,
}

/// A payload exactly as received from one source call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Uuid,
    pub source: String,
    /// Verbatim payload bytes; not guaranteed to be UTF-8 or JSON
    pub raw_data: Vec<u8>,
    pub request_metadata: RequestMetadata,
    pub status: ProcessingStatus,
    pub date_range: Option<DateRange>,
    pub batch_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// UTM campaign parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utm {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub content: Option<String>,
    pub term: Option<String>,
}

impl Utm {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.content.is_none()
            && self.term.is_none()
    }

    /// Fill fields that are still empty from another set of parameters.
    pub fn or(self, other: Utm) -> Utm {
        Utm {
            source: self.source.or(other.source),
            medium: self.medium.or(other.medium),
            campaign: self.campaign.or(other.campaign),
            content: self.content.or(other.content),
            term: self.term.or(other.term),
        }
    }
}

/// Traffic source classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficSourceType {
    Organic,
    Paid,
    Social,
    Direct,
    Referral,
}

impl TrafficSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organic => "organic",
            Self::Paid => "paid",
            Self::Social => "social",
            Self::Direct => "direct",
            Self::Referral => "referral",
        }
    }
}

impl FromStr for TrafficSourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "organic" => Ok(Self::Organic),
            "paid" => Ok(Self::Paid),
            "social" => Ok(Self::Social),
            "direct" => Ok(Self::Direct),
            "referral" => Ok(Self::Referral),
            other => Err(Error::validation(format!("unknown traffic source type: {other}"))),
        }
    }
}

/// Device details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// desktop, mobile, tablet, bot
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
}

/// Geographic location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl Geo {
    pub fn is_empty(&self) -> bool {
        self.country.is_none() && self.region.is_none() && self.city.is_none()
    }
}

/// Kind of an in-session interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitKind {
    Pageview,
    Click,
    Scroll,
    FormInteraction,
    FormSubmit,
    CtaClick,
    Search,
    Other,
}

impl HitKind {
    /// Map a tracker or GA4 event name onto a hit kind.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pageview" | "page_view" | "view" | "page" => Self::Pageview,
            "click" | "link_click" | "outbound_click" => Self::Click,
            "scroll" | "scroll_depth" => Self::Scroll,
            "form_interaction" | "form_start" | "form_focus" | "input" | "form_change" => {
                Self::FormInteraction
            }
            "form_submit" | "submit" | "generate_lead" | "lead" => Self::FormSubmit,
            "cta_click" | "cta" | "button_click" => Self::CtaClick,
            "search" | "view_search_results" | "site_search" => Self::Search,
            _ => Self::Other,
        }
    }
}

/// One interaction inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub kind: HitKind,
    pub url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Scroll depth percent for scroll hits
    pub scroll_depth: Option<f64>,
    /// Query text for search hits
    pub query: Option<String>,
}

/// One canonical session derived from exactly one raw event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: Uuid,
    pub raw_event_id: Uuid,
    pub source: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub event_date: NaiveDate,
    pub url: Option<String>,
    pub referrer: Option<String>,
    pub utm: Utm,
    pub traffic_source_type: TrafficSourceType,
    pub device: Device,
    pub geo: Geo,
    pub page_views: u32,
    /// Visit duration in seconds; `None` when the source did not report timing
    pub raw_visit_duration: Option<f64>,
    pub is_bounce: bool,
    pub hits: Vec<Hit>,
    pub goals: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NormalizedEvent {
    /// Compare the fields derived from the raw payload, ignoring record identity.
    pub fn same_derivation(&self, other: &NormalizedEvent) -> bool {
        self.raw_event_id == other.raw_event_id
            && self.source == other.source
            && self.session_id == other.session_id
            && self.occurred_at == other.occurred_at
            && self.event_date == other.event_date
            && self.url == other.url
            && self.referrer == other.referrer
            && self.utm == other.utm
            && self.traffic_source_type == other.traffic_source_type
            && self.page_views == other.page_views
            && self.raw_visit_duration == other.raw_visit_duration
            && self.is_bounce == other.is_bounce
            && self.hits == other.hits
            && self.goals == other.goals
    }
}

/// Readiness of a date range for downstream stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RangeStatus {
    /// No raw events were ever received for the range.
    NoData,
    /// Raw events exist but some are still waiting for normalization.
    AwaitingNormalization { pending: u64, normalized: u64 },
    /// Everything received has been normalized or settled.
    Ready { normalized: u64 },
}
