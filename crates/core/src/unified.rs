//! Reconciled daily metrics.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::events::TrafficSourceType;
use crate::features::Segment;

/// Analytics sources that take part in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsSource {
    Ga4,
    Metrika,
}

impl AnalyticsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ga4 => "ga4",
            Self::Metrika => "metrika",
        }
    }
}

/// How to combine a metric both sources report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    Mean,
    PreferGa4,
    PreferMetrika,
    Max,
    Min,
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::PreferGa4 => "prefer_ga4",
            Self::PreferMetrika => "prefer_metrika",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    pub fn merge(&self, ga4: f64, metrika: f64) -> f64 {
        match self {
            Self::Mean => (ga4 + metrika) / 2.0,
            Self::PreferGa4 => ga4,
            Self::PreferMetrika => metrika,
            Self::Max => ga4.max(metrika),
            Self::Min => ga4.min(metrika),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "mean" => Ok(Self::Mean),
            "prefer_ga4" => Ok(Self::PreferGa4),
            "prefer_metrika" => Ok(Self::PreferMetrika),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(Error::config(format!("unknown merge policy: {other}"))),
        }
    }
}

/// Session counts per traffic type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficBreakdown {
    pub organic: u64,
    pub paid: u64,
    pub social: u64,
    pub direct: u64,
    pub referral: u64,
}

impl TrafficBreakdown {
    fn slot_mut(&mut self, kind: TrafficSourceType) -> &mut u64 {
        match kind {
            TrafficSourceType::Organic => &mut self.organic,
            TrafficSourceType::Paid => &mut self.paid,
            TrafficSourceType::Social => &mut self.social,
            TrafficSourceType::Direct => &mut self.direct,
            TrafficSourceType::Referral => &mut self.referral,
        }
    }

    pub fn add(&mut self, kind: TrafficSourceType) {
        *self.slot_mut(kind) += 1;
    }

    pub fn set(&mut self, kind: TrafficSourceType, sessions: u64) {
        *self.slot_mut(kind) = sessions;
    }

    pub fn get(&self, kind: TrafficSourceType) -> u64 {
        match kind {
            TrafficSourceType::Organic => self.organic,
            TrafficSourceType::Paid => self.paid,
            TrafficSourceType::Social => self.social,
            TrafficSourceType::Direct => self.direct,
            TrafficSourceType::Referral => self.referral,
        }
    }

    pub fn total(&self) -> u64 {
        self.organic + self.paid + self.social + self.direct + self.referral
    }
}

/// One source's totals for one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetrics {
    pub sessions: u64,
    pub users: u64,
    pub pageviews: u64,
    pub bounces: u64,
    /// Mean duration over sessions with known timing
    pub avg_duration_sec: Option<f64>,
    pub traffic: TrafficBreakdown,
}

/// Per-source input to reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "metrics", rename_all = "snake_case")]
pub enum SourceAvailability {
    Available(SourceMetrics),
    Unavailable,
}

impl SourceAvailability {
    pub fn metrics(&self) -> Option<&SourceMetrics> {
        match self {
            Self::Available(m) => Some(m),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Day summary of the feature layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub feature_count: u64,
    pub avg_hot_score: f64,
    pub avg_engagement_score: f64,
    pub avg_intent_score: f64,
    /// Sessions with known active time
    pub engaged_sessions: u64,
    pub segment_distribution: BTreeMap<Segment, u64>,
}

/// Side-by-side record of a metric both sources reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub metric: String,
    pub ga4: f64,
    pub metrika: f64,
    pub unified: f64,
    /// |a - b| / max(a, b)
    pub relative_divergence: f64,
}

/// One calendar day's reconciled summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMetric {
    pub date: NaiveDate,
    pub ga4: Option<SourceMetrics>,
    pub metrika: Option<SourceMetrics>,
    pub ga4_available: bool,
    pub metrika_available: bool,
    pub merge_policy: MergePolicy,
    pub unified_sessions: u64,
    pub unified_users: u64,
    pub unified_pageviews: u64,
    pub unified_bounces: u64,
    pub traffic_breakdown: TrafficBreakdown,
    pub engagement_rate: f64,
    pub bounce_rate: f64,
    pub avg_session_duration: Option<f64>,
    pub avg_hot_score: f64,
    pub avg_engagement_score: f64,
    pub avg_intent_score: f64,
    pub dominant_segment: Option<Segment>,
    pub segment_distribution: BTreeMap<Segment, u64>,
    pub discrepancies: Vec<Discrepancy>,
    pub data_quality_score: u8,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedMetric {
    /// Equality of reconciled content, ignoring the write timestamp.
    pub fn same_content(&self, other: &UnifiedMetric) -> bool {
        let mut other = other.clone();
        other.updated_at = self.updated_at;
        *self == other
    }

    /// Value of a named metric, used to check citations.
    pub fn metric_value(&self, name: &str) -> Option<f64> {
        let value = match name {
            "sessions" | "unified_sessions" => self.unified_sessions as f64,
            "users" | "unified_users" => self.unified_users as f64,
            "pageviews" | "unified_pageviews" => self.unified_pageviews as f64,
            "bounces" | "unified_bounces" => self.unified_bounces as f64,
            "bounce_rate" => self.bounce_rate,
            "engagement_rate" => self.engagement_rate,
            "avg_session_duration" => self.avg_session_duration?,
            "avg_hot_score" => self.avg_hot_score,
            "avg_engagement_score" => self.avg_engagement_score,
            "avg_intent_score" => self.avg_intent_score,
            "data_quality_score" => self.data_quality_score as f64,
            "organic" => self.traffic_breakdown.organic as f64,
            "paid" => self.traffic_breakdown.paid as f64,
            "social" => self.traffic_breakdown.social as f64,
            "direct" => self.traffic_breakdown.direct as f64,
            "referral" => self.traffic_breakdown.referral as f64,
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_policies() {
        assert_eq!(MergePolicy::Mean.merge(100.0, 120.0), 110.0);
        assert_eq!(MergePolicy::PreferMetrika.merge(100.0, 120.0), 120.0);
        assert_eq!(MergePolicy::Max.merge(100.0, 120.0), 120.0);
        assert_eq!(MergePolicy::Min.merge(100.0, 120.0), 100.0);
        assert_eq!("prefer_ga4".parse::<MergePolicy>().unwrap(), MergePolicy::PreferGa4);
    }

    #[test]
    fn test_traffic_breakdown_set_and_add() {
        let mut traffic = TrafficBreakdown::default();
        traffic.set(TrafficSourceType::Paid, 7);
        traffic.add(TrafficSourceType::Paid);
        traffic.add(TrafficSourceType::Direct);
        assert_eq!(traffic.get(TrafficSourceType::Paid), 8);
        assert_eq!(traffic.total(), 9);
        traffic.set(TrafficSourceType::Paid, 0);
        assert_eq!(traffic.total(), 1);
    }

    #[test]
    fn test_source_availability_serializes_tagged() {
        let json = serde_json::to_value(SourceAvailability::Unavailable).unwrap();
        assert_eq!(json["state"], "unavailable");
    }
}
