//! Scoring thresholds, weights and key-page patterns.

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use pipeline_core::{Error, Result};

/// URL pattern that marks a page as belonging to a key-page category.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KeyPagePattern {
    #[validate(length(min = 1, max = 64))]
    pub category: String,
    /// Regular expression matched against the URL path
    #[validate(length(min = 1))]
    pub pattern: String,
}

impl KeyPagePattern {
    fn new(category: &str, pattern: &str) -> Self {
        Self {
            category: category.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

/// Rule thresholds for segment classification. Comparisons are strict.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SegmentThresholds {
    #[validate(range(min = 0.0, max = 1.0))]
    pub urgency_min_conversion: f64,
    #[validate(range(min = 0.0))]
    pub urgency_min_active_secs: f64,
    pub decision_min_actions: u32,
    pub decision_min_distinct_pages: u32,
    pub problem_min_searches: u32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub brand_min_engagement_ratio: f64,
    #[validate(range(min = 0.0))]
    pub brand_min_active_secs: f64,
    /// Intent at which an otherwise informational visitor is considering
    #[validate(range(max = 100))]
    pub consideration_min_intent: u8,
}

impl Default for SegmentThresholds {
    fn default() -> Self {
        Self {
            urgency_min_conversion: 0.05,
            urgency_min_active_secs: 180.0,
            decision_min_actions: 5,
            decision_min_distinct_pages: 4,
            problem_min_searches: 3,
            brand_min_engagement_ratio: 0.7,
            brand_min_active_secs: 120.0,
            consideration_min_intent: 50,
        }
    }
}

/// Every threshold and weight the feature engine uses.
///
/// Baselines are the values at which a signal counts as full engagement.
/// Weights inside one score need not sum to one; they are normalized.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ScoringConfig {
    /// Page views for full depth engagement
    #[validate(range(min = 1.0))]
    pub full_page_depth: f64,
    /// Scroll percent for full scroll engagement
    #[validate(range(min = 1.0, max = 100.0))]
    pub full_scroll_depth: f64,
    /// Clicks for full click engagement
    #[validate(range(min = 1.0))]
    pub full_click_count: f64,
    /// Active seconds for full time engagement
    #[validate(range(min = 1.0))]
    pub full_active_time_secs: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub depth_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub scroll_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub click_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub time_weight: f64,

    /// Points for the first visit to a key-page category
    #[validate(range(min = 0.0, max = 100.0))]
    pub key_page_points: f64,
    /// Factor applied to each repeat visit within one category
    #[validate(range(min = 0.0, max = 1.0))]
    pub key_page_repeat_decay: f64,
    /// Points per submitted form
    #[validate(range(min = 0.0, max = 100.0))]
    pub form_submit_points: f64,
    /// Points per form interaction short of a submit
    #[validate(range(min = 0.0, max = 100.0))]
    pub form_interaction_points: f64,
    /// Points per CTA click
    #[validate(range(min = 0.0, max = 100.0))]
    pub cta_points: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub hot_engagement_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub hot_intent_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub hot_recency_frequency_weight: f64,

    /// Sessions at which frequency scores 100
    #[validate(range(min = 1))]
    pub frequency_full_sessions: u32,
    /// A visit within this many days of the previous one is a return visit
    #[validate(range(min = 1))]
    pub return_window_days: u32,
    /// Visits older than this many days have their hot score decayed
    #[validate(range(min = 1))]
    pub recency_window_days: u32,
    /// Half-life, in days, of both recency and old-visit decay
    #[validate(range(min = 0.5))]
    pub recency_half_life_days: f64,
    /// Recency score for a first visit
    #[validate(range(min = 0.0, max = 100.0))]
    pub first_visit_recency: f64,

    /// Gaps between hits longer than this count as idle time
    #[validate(range(min = 1.0))]
    pub idle_threshold_secs: f64,
    /// Attempts for the aggregate conditional write
    #[validate(range(min = 1, max = 50))]
    pub max_cas_retries: u32,

    #[validate(nested)]
    pub segments: SegmentThresholds,
    #[validate(nested)]
    pub key_pages: Vec<KeyPagePattern>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            full_page_depth: 10.0,
            full_scroll_depth: 100.0,
            full_click_count: 10.0,
            full_active_time_secs: 300.0,
            depth_weight: 0.25,
            scroll_weight: 0.20,
            click_weight: 0.20,
            time_weight: 0.35,
            key_page_points: 20.0,
            key_page_repeat_decay: 0.5,
            form_submit_points: 15.0,
            form_interaction_points: 5.0,
            cta_points: 10.0,
            hot_engagement_weight: 0.35,
            hot_intent_weight: 0.45,
            hot_recency_frequency_weight: 0.20,
            frequency_full_sessions: 5,
            return_window_days: 7,
            recency_window_days: 14,
            recency_half_life_days: 7.0,
            first_visit_recency: 50.0,
            idle_threshold_secs: 30.0,
            max_cas_retries: 5,
            segments: SegmentThresholds::default(),
            key_pages: vec![
                KeyPagePattern::new("pricing", r"(?i)/(pricing|prices?|tariffs?|cost|ceny|stoimost)"),
                KeyPagePattern::new("guarantee", r"(?i)/(guarantees?|warranty|garantiya)"),
                KeyPagePattern::new("portfolio", r"(?i)/(portfolio|cases?|works|projects)"),
                KeyPagePattern::new("contacts", r"(?i)/(contacts?|kontakty)"),
                KeyPagePattern::new("reviews", r"(?i)/(reviews?|testimonials|otzyvy)"),
            ],
        }
    }
}

impl ScoringConfig {
    /// Check ranges and that every weight group has a positive total.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("scoring config: {e}")))?;

        let engagement = self.depth_weight + self.scroll_weight + self.click_weight + self.time_weight;
        let hot = self.hot_engagement_weight
            + self.hot_intent_weight
            + self.hot_recency_frequency_weight;
        if engagement <= 0.0 || hot <= 0.0 {
            return Err(Error::config("scoring weights must not all be zero"));
        }
        Ok(())
    }
}

/// Compiled key-page patterns.
#[derive(Debug, Clone)]
pub struct KeyPageMatcher {
    patterns: Vec<(String, Regex)>,
}

impl KeyPageMatcher {
    pub fn new(patterns: &[KeyPagePattern]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|re| (p.category.clone(), re))
                    .map_err(|e| {
                        Error::config(format!("key page pattern for {}: {e}", p.category))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Categories whose pattern matches the path.
    pub fn categories<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.patterns
            .iter()
            .filter(move |(_, re)| re.is_match(path))
            .map(|(category, _)| category.as_str())
    }
}
