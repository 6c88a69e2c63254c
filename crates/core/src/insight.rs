//! AI-generated analysis over a date range.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::DateRange;
use crate::features::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightType {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl InsightType {
    /// Pick the type that matches a range length.
    pub fn for_range(range: &DateRange) -> Self {
        match range.num_days() {
            1 => Self::Daily,
            7 => Self::Weekly,
            28..=31 => Self::Monthly,
            _ => Self::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for InsightType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "custom" => Ok(Self::Custom),
            other => Err(Error::validation(format!("unknown insight type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightStatus {
    Completed,
    Failed,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InsightStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!("unknown insight status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFinding {
    pub title: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub priority: Option<String>,
}

/// A data point the model claims to rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub date: NaiveDate,
    pub metric: String,
    pub value: f64,
}

/// Per-segment numbers computed from stored features, not from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPerformance {
    pub segment: Segment,
    pub sessions: u64,
    pub share: f64,
    pub avg_hot_score: f64,
}

/// Problems detected in model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum QualityFlag {
    MissingSection {
        section: String,
    },
    CitationOutOfRange {
        date: NaiveDate,
        metric: String,
    },
    CitationMismatch {
        date: NaiveDate,
        metric: String,
        cited: f64,
        actual: f64,
    },
    UnknownMetric {
        date: NaiveDate,
        metric: String,
    },
}

/// One analysis row. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    pub date_range: DateRange,
    pub insight_type: InsightType,
    pub executive_summary: Option<String>,
    pub key_findings: Vec<KeyFinding>,
    pub segment_performance: Vec<SegmentPerformance>,
    pub recommendations: Vec<Recommendation>,
    pub citations: Vec<Citation>,
    pub quality_flags: Vec<QualityFlag>,
    pub model_used: Option<String>,
    pub provider: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    /// 0.0 to 1.0
    pub confidence_score: f64,
    pub status: InsightStatus,
    pub error: Option<String>,
    pub task_id: Option<Uuid>,
    pub generated_at: DateTime<Utc>,
}

impl Insight {
    /// Row recorded when every attempt for a range failed.
    pub fn failed(
        date_range: DateRange,
        task_id: Option<Uuid>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            date_range,
            insight_type: InsightType::for_range(&date_range),
            executive_summary: None,
            key_findings: Vec::new(),
            segment_performance: Vec::new(),
            recommendations: Vec::new(),
            citations: Vec::new(),
            quality_flags: Vec::new(),
            model_used: None,
            provider: None,
            prompt_tokens: None,
            completion_tokens: None,
            confidence_score: 0.0,
            status: InsightStatus::Failed,
            error: Some(error.into()),
            task_id,
            generated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_insight_type_for_range() {
        let day = DateRange::day(date("2024-03-01"));
        assert_eq!(InsightType::for_range(&day), InsightType::Daily);
        let week = DateRange::new(date("2024-03-01"), date("2024-03-07")).unwrap();
        assert_eq!(InsightType::for_range(&week), InsightType::Weekly);
        let odd = DateRange::new(date("2024-03-01"), date("2024-03-03")).unwrap();
        assert_eq!(InsightType::for_range(&odd), InsightType::Custom);
    }

    #[test]
    fn test_failed_insight_keeps_error() {
        let insight = Insight::failed(DateRange::day(date("2024-03-01")), None, "boom", Utc::now());
        assert_eq!(insight.status, InsightStatus::Failed);
        assert_eq!(insight.error.as_deref(), Some("boom"));
        assert_eq!(insight.confidence_score, 0.0);
    }
}
