//! Feature layer types: per-session features and per-identity aggregates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result, ValidationErrorCode};
use crate::events::TrafficSourceType;

/// Behavioral segment. Variants are declared in rule evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Segment {
    Urgency,
    Decision,
    Problem,
    Brand,
    Info,
}

impl Segment {
    pub const ALL: [Segment; 5] = [
        Segment::Urgency,
        Segment::Decision,
        Segment::Problem,
        Segment::Brand,
        Segment::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgency => "URGENCY",
            Self::Decision => "DECISION",
            Self::Problem => "PROBLEM",
            Self::Brand => "BRAND",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Segment::ALL
            .into_iter()
            .find(|seg| seg.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown segment: {s}")))
    }
}

/// Buyer journey stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStage {
    Awareness,
    Consideration,
    Decision,
    Purchase,
}

impl DecisionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Awareness => "awareness",
            Self::Consideration => "consideration",
            Self::Decision => "decision",
            Self::Purchase => "purchase",
        }
    }
}

impl FromStr for DecisionStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "awareness" => Ok(Self::Awareness),
            "consideration" => Ok(Self::Consideration),
            "decision" => Ok(Self::Decision),
            "purchase" => Ok(Self::Purchase),
            other => Err(Error::validation(format!("unknown decision stage: {other}"))),
        }
    }
}

/// Identity a session is attributed to. `user_id` wins over `client_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Identity {
    User(String),
    Client(String),
}

impl Identity {
    /// Resolve identity from optional identifiers.
    pub fn resolve(user_id: Option<&str>, client_id: Option<&str>) -> Result<Self> {
        fn clean(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|s| !s.is_empty())
        }
        match (clean(user_id), clean(client_id)) {
            (Some(user), _) => Ok(Self::User(user.to_string())),
            (None, Some(client)) => Ok(Self::Client(client.to_string())),
            (None, None) => Err(Error::validation_code(
                ValidationErrorCode::MissingIdentity,
                "neither user_id nor client_id present",
            )),
        }
    }

    /// Unique aggregate key, e.g. `user:42` or `client:abc`.
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Client(id) => format!("client:{id}"),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            Self::Client(_) => None,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::Client(id) => Some(id),
            Self::User(_) => None,
        }
    }
}

/// Component values behind the three scores, kept for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub depth_component: f64,
    pub scroll_component: f64,
    pub click_component: f64,
    /// `None` when active time was unknown and its weight was redistributed
    pub time_component: Option<f64>,
    pub key_page_points: f64,
    pub form_points: f64,
    pub cta_points: f64,
    pub frequency_score: f64,
    pub recency_score: f64,
    pub recency_decay: f64,
    /// Raw values before clamping to [0,100]
    pub raw_engagement: f64,
    pub raw_intent: f64,
    pub raw_hot: f64,
}

/// Behavioral signals and scores for one normalized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub normalized_event_id: Uuid,
    pub feature_version: u32,
    pub event_date: NaiveDate,
    pub occurred_at: DateTime<Utc>,
    pub identity: Identity,
    pub source: String,
    pub device_type: Option<String>,
    pub traffic_source_type: TrafficSourceType,
    pub active_time_sec: Option<f64>,
    pub idle_time_sec: Option<f64>,
    pub page_depth: u32,
    pub distinct_pages: u32,
    pub max_scroll_depth: Option<f64>,
    pub click_count: u32,
    pub form_interactions: u32,
    pub form_submits: u32,
    pub cta_clicks: u32,
    pub search_queries: u32,
    pub goals_count: u32,
    /// Key-page category to visit count
    pub key_pages: BTreeMap<String, u32>,
    pub is_bounce: bool,
    pub is_return: bool,
    pub conversion_rate_proxy: f64,
    pub engagement_ratio: Option<f64>,
    pub engagement_score: u8,
    pub intent_score: u8,
    pub hot_score_base: u8,
    pub score_breakdown: ScoreBreakdown,
    pub segment: Segment,
    pub decision_stage: DecisionStage,
    pub computed_at: DateTime<Utc>,
}

impl Feature {
    /// Actions counted by the DECISION rule.
    pub fn action_count(&self) -> u32 {
        self.click_count + self.form_interactions + self.form_submits + self.cta_clicks
    }
}

/// Rolling per-identity summary. One row per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub id: Uuid,
    pub identity: Identity,
    pub total_sessions: u32,
    pub total_active_time_sec: f64,
    pub first_visit_at: DateTime<Utc>,
    pub last_visit_at: DateTime<Utc>,
    pub device_counts: BTreeMap<String, u32>,
    pub source_counts: BTreeMap<String, u32>,
    pub preferred_device: Option<String>,
    pub preferred_source: Option<String>,
    pub key_pages: BTreeMap<String, u32>,
    pub current_hot_score: u8,
    pub current_segment: Segment,
    /// Optimistic concurrency version; bumped on every write
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Hot lead view returned to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotLead {
    pub identity: Identity,
    pub hot_score: u8,
    pub segment: Segment,
    pub total_sessions: u32,
    pub last_visit_at: DateTime<Utc>,
    pub preferred_device: Option<String>,
    pub preferred_source: Option<String>,
}

impl From<&UserAggregate> for HotLead {
    fn from(agg: &UserAggregate) -> Self {
        Self {
            identity: agg.identity.clone(),
            hot_score: agg.current_hot_score,
            segment: agg.current_segment,
            total_sessions: agg.total_sessions,
            last_visit_at: agg.last_visit_at,
            preferred_device: agg.preferred_device.clone(),
            preferred_source: agg.preferred_source.clone(),
        }
    }
}
