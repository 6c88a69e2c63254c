//! Engagement, intent and hot scores.
//!
//! Each score is computed as a float, then rounded and clamped into [0,100].
//! The unclamped values are kept in the [`ScoreBreakdown`] for audit.

use chrono::{DateTime, Utc};
use pipeline_core::schema::{clamp_score, ClampedScore};
use pipeline_core::ScoreBreakdown;

use super::config::ScoringConfig;
use super::signals::Signals;

/// Prior visits of the identity, excluding the session being scored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VisitHistory {
    pub previous_sessions: u32,
    /// Latest earlier visit, if any
    pub previous_visit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    pub engagement: ClampedScore,
    pub intent: ClampedScore,
    pub hot: ClampedScore,
    pub is_return: bool,
    pub breakdown: ScoreBreakdown,
}

impl Scores {
    /// Names of scores whose raw value was out of range.
    pub fn violations(&self) -> Vec<(&'static str, f64)> {
        [
            ("engagement", self.engagement),
            ("intent", self.intent),
            ("hot", self.hot),
        ]
        .into_iter()
        .filter(|(_, s)| s.violated)
        .map(|(name, s)| (name, s.raw))
        .collect()
    }
}

pub fn score(
    signals: &Signals,
    history: VisitHistory,
    occurred_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &ScoringConfig,
) -> Scores {
    let mut breakdown = ScoreBreakdown::default();

    let raw_engagement = engagement(signals, config, &mut breakdown);
    let raw_intent = intent(signals, config, &mut breakdown);
    let engagement = clamp_score(raw_engagement);
    let intent = clamp_score(raw_intent);

    let (rf, is_return) = recency_frequency(history, occurred_at, config, &mut breakdown);
    let decay = age_decay(occurred_at, now, config);
    breakdown.recency_decay = decay;

    let weights = config.hot_engagement_weight
        + config.hot_intent_weight
        + config.hot_recency_frequency_weight;
    let raw_hot = (config.hot_engagement_weight * f64::from(engagement.value)
        + config.hot_intent_weight * f64::from(intent.value)
        + config.hot_recency_frequency_weight * rf)
        / weights
        * decay;

    breakdown.raw_engagement = raw_engagement;
    breakdown.raw_intent = raw_intent;
    breakdown.raw_hot = raw_hot;

    Scores {
        engagement,
        intent,
        hot: clamp_score(raw_hot),
        is_return,
        breakdown,
    }
}

/// Weighted share of full engagement, 0 to 100.
///
/// Unknown active time drops out and the other weights are renormalized.
fn engagement(signals: &Signals, config: &ScoringConfig, breakdown: &mut ScoreBreakdown) -> f64 {
    let ratio = |value: f64, full: f64| (value / full).clamp(0.0, 1.0) * 100.0;

    breakdown.depth_component = ratio(f64::from(signals.page_depth), config.full_page_depth);
    breakdown.scroll_component = ratio(
        signals.max_scroll_depth.unwrap_or(0.0),
        config.full_scroll_depth,
    );
    breakdown.click_component = ratio(
        f64::from(signals.click_count + signals.cta_clicks),
        config.full_click_count,
    );
    breakdown.time_component = signals
        .active_time_sec
        .map(|t| ratio(t, config.full_active_time_secs));

    let mut weighted = config.depth_weight * breakdown.depth_component
        + config.scroll_weight * breakdown.scroll_component
        + config.click_weight * breakdown.click_component;
    let mut total_weight = config.depth_weight + config.scroll_weight + config.click_weight;

    if let Some(time) = breakdown.time_component {
        weighted += config.time_weight * time;
        total_weight += config.time_weight;
    }

    if total_weight <= 0.0 {
        return 0.0;
    }
    weighted / total_weight
}

/// Key pages, forms and CTAs. Repeat visits to one category decay geometrically.
fn intent(signals: &Signals, config: &ScoringConfig, breakdown: &mut ScoreBreakdown) -> f64 {
    let decay = config.key_page_repeat_decay;
    breakdown.key_page_points = signals
        .key_pages
        .values()
        .map(|&visits| {
            (0..visits)
                .map(|k| config.key_page_points * decay.powi(k as i32))
                .sum::<f64>()
        })
        .sum();
    breakdown.form_points = config.form_submit_points * f64::from(signals.form_submits)
        + config.form_interaction_points * f64::from(signals.form_interactions);
    breakdown.cta_points = config.cta_points * f64::from(signals.cta_clicks);

    breakdown.key_page_points + breakdown.form_points + breakdown.cta_points
}

/// Mean of frequency and recency, plus the return-visit flag.
fn recency_frequency(
    history: VisitHistory,
    occurred_at: DateTime<Utc>,
    config: &ScoringConfig,
    breakdown: &mut ScoreBreakdown,
) -> (f64, bool) {
    let sessions = history.previous_sessions + 1;
    breakdown.frequency_score =
        (f64::from(sessions) / f64::from(config.frequency_full_sessions)).min(1.0) * 100.0;

    let (recency, is_return) = match history.previous_visit_at {
        Some(previous) if history.previous_sessions > 0 => {
            let gap_days = days_between(previous, occurred_at).max(0.0);
            let recency = 100.0 * 0.5f64.powf(gap_days / config.recency_half_life_days);
            (recency, gap_days <= f64::from(config.return_window_days))
        }
        _ => (config.first_visit_recency, false),
    };
    breakdown.recency_score = recency;

    ((breakdown.frequency_score + recency) / 2.0, is_return)
}

/// 1.0 inside the recency window, halving every half-life beyond it.
fn age_decay(occurred_at: DateTime<Utc>, now: DateTime<Utc>, config: &ScoringConfig) -> f64 {
    let age = days_between(occurred_at, now);
    let window = f64::from(config.recency_window_days);
    if age <= window {
        1.0
    } else {
        0.5f64.powf((age - window) / config.recency_half_life_days)
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 86_400.0
}
