//! Behavioral signals extracted from one normalized session.

use std::collections::{BTreeMap, BTreeSet};

use pipeline_core::{HitKind, NormalizedEvent};
use url::Url;

use super::config::{KeyPageMatcher, ScoringConfig};

/// Raw behavioral measurements before scoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signals {
    /// `None` when the session has neither hit timing nor a reported duration
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
    pub key_pages: BTreeMap<String, u32>,
    /// (goals + form submits) / page depth
    pub conversion_rate_proxy: f64,
    /// active / (active + idle)
    pub engagement_ratio: Option<f64>,
}

impl Signals {
    /// Clicks, form interactions, submits and CTA clicks.
    pub fn action_count(&self) -> u32 {
        self.click_count + self.form_interactions + self.form_submits + self.cta_clicks
    }
}

pub fn extract(event: &NormalizedEvent, config: &ScoringConfig, matcher: &KeyPageMatcher) -> Signals {
    let mut signals = Signals {
        page_depth: event.page_views,
        goals_count: event.goals.len() as u32,
        ..Default::default()
    };

    let mut pages = BTreeSet::new();
    let mut viewed = Vec::new();
    let landing = event.url.as_deref().map(url_path);
    if let Some(ref path) = landing {
        pages.insert(path.clone());
    }

    for hit in &event.hits {
        match hit.kind {
            HitKind::Pageview => {
                if let Some(ref url) = hit.url {
                    let path = url_path(url);
                    pages.insert(path.clone());
                    viewed.push(path);
                }
            }
            HitKind::Click => signals.click_count += 1,
            HitKind::CtaClick => signals.cta_clicks += 1,
            HitKind::FormInteraction => signals.form_interactions += 1,
            HitKind::FormSubmit => signals.form_submits += 1,
            HitKind::Search => signals.search_queries += 1,
            HitKind::Scroll => {
                if let Some(depth) = hit.scroll_depth.filter(|d| d.is_finite()) {
                    let depth = depth.clamp(0.0, 100.0);
                    signals.max_scroll_depth =
                        Some(signals.max_scroll_depth.map_or(depth, |m: f64| m.max(depth)));
                }
            }
            HitKind::Other => {}
        }
    }

    signals.distinct_pages = (pages.len() as u32).max(u32::from(signals.page_depth > 0));

    // Sessions without pageview urls only tell us the landing page.
    if viewed.is_empty() {
        viewed.extend(landing);
    }

    for path in &viewed {
        for category in matcher.categories(path) {
            *signals.key_pages.entry(category.to_string()).or_insert(0) += 1;
        }
    }

    let (active, idle) = timing(event, config.idle_threshold_secs);
    signals.active_time_sec = active;
    signals.idle_time_sec = idle;
    signals.engagement_ratio = match (active, idle) {
        (Some(a), Some(i)) if a + i > 0.0 => Some(a / (a + i)),
        _ => None,
    };

    signals.conversion_rate_proxy = if signals.page_depth > 0 {
        f64::from(signals.goals_count + signals.form_submits) / f64::from(signals.page_depth)
    } else {
        0.0
    };

    signals
}

/// Active and idle seconds.
///
/// With two or more timestamped hits, gaps up to the idle threshold are
/// active and longer gaps are idle. Reported duration past the last hit
/// counts as active. Without hit timing the reported duration is all active.
fn timing(event: &NormalizedEvent, idle_threshold: f64) -> (Option<f64>, Option<f64>) {
    let mut stamps: Vec<_> = event.hits.iter().filter_map(|h| h.timestamp).collect();
    stamps.sort();

    if stamps.len() < 2 {
        return match event.raw_visit_duration {
            Some(d) => (Some(d.max(0.0)), Some(0.0)),
            None => (None, None),
        };
    }

    let (mut active, mut idle) = (0.0, 0.0);
    for pair in stamps.windows(2) {
        let gap = (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0;
        if gap > idle_threshold {
            idle += gap;
        } else {
            active += gap;
        }
    }

    let span = active + idle;
    if let Some(duration) = event.raw_visit_duration {
        if duration > span {
            active += duration - span;
        }
    }
    (Some(active), Some(idle))
}

fn url_path(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or(raw)
            .to_string(),
    }
}
