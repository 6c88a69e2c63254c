//! Per-identity aggregate merge.
//!
//! Sums, min/max and latest-visit-wins only, so applying the same set of
//! features in any order yields the same aggregate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pipeline_core::{Feature, UserAggregate};
use uuid::Uuid;

/// Fold one feature into the identity's aggregate.
///
/// `previous` is the prior version of the same session's feature, if this is
/// a recompute. Recomputes adjust totals by the delta and never count the
/// session twice.
pub fn merge(
    prior: Option<&UserAggregate>,
    feature: &Feature,
    previous: Option<&Feature>,
    now: DateTime<Utc>,
) -> UserAggregate {
    let active = feature.active_time_sec.unwrap_or(0.0);

    let Some(prior) = prior else {
        let mut agg = UserAggregate {
            id: Uuid::new_v4(),
            identity: feature.identity.clone(),
            total_sessions: 1,
            total_active_time_sec: active,
            first_visit_at: feature.occurred_at,
            last_visit_at: feature.occurred_at,
            device_counts: BTreeMap::new(),
            source_counts: BTreeMap::new(),
            preferred_device: None,
            preferred_source: None,
            key_pages: feature.key_pages.clone(),
            current_hot_score: feature.hot_score_base,
            current_segment: feature.segment,
            version: 1,
            updated_at: now,
        };
        count_session(&mut agg, feature);
        return agg;
    };

    let mut agg = prior.clone();
    match previous {
        None => {
            agg.total_sessions += 1;
            agg.total_active_time_sec += active;
            for (category, visits) in &feature.key_pages {
                *agg.key_pages.entry(category.clone()).or_insert(0) += visits;
            }
            count_session(&mut agg, feature);
        }
        Some(previous) => {
            let delta = active - previous.active_time_sec.unwrap_or(0.0);
            agg.total_active_time_sec = (agg.total_active_time_sec + delta).max(0.0);
            adjust_key_pages(&mut agg.key_pages, &previous.key_pages, &feature.key_pages);
        }
    }

    agg.first_visit_at = agg.first_visit_at.min(feature.occurred_at);
    if feature.occurred_at >= agg.last_visit_at {
        agg.last_visit_at = feature.occurred_at;
        agg.current_hot_score = feature.hot_score_base;
        agg.current_segment = feature.segment;
    }

    agg.version = prior.version + 1;
    agg.updated_at = now;
    agg
}

fn count_session(agg: &mut UserAggregate, feature: &Feature) {
    if let Some(ref device) = feature.device_type {
        *agg.device_counts.entry(device.clone()).or_insert(0) += 1;
    }
    *agg.source_counts
        .entry(feature.traffic_source_type.as_str().to_string())
        .or_insert(0) += 1;
    agg.preferred_device = most_frequent(&agg.device_counts);
    agg.preferred_source = most_frequent(&agg.source_counts);
}

fn adjust_key_pages(
    totals: &mut BTreeMap<String, u32>,
    before: &BTreeMap<String, u32>,
    after: &BTreeMap<String, u32>,
) {
    for (category, visits) in before {
        if let Some(total) = totals.get_mut(category) {
            *total = total.saturating_sub(*visits);
        }
    }
    for (category, visits) in after {
        *totals.entry(category.clone()).or_insert(0) += visits;
    }
    totals.retain(|_, visits| *visits > 0);
}

/// Highest count; ties go to the alphabetically first key.
fn most_frequent(counts: &BTreeMap<String, u32>) -> Option<String> {
    counts
        .iter()
        .fold(None, |best: Option<(&String, u32)>, (key, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((key, count)),
        })
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pipeline_core::{
        DecisionStage, Identity, ScoreBreakdown, Segment, TrafficSourceType,
    };

    fn at(hours: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::hours(hours)
    }

    fn feature(hours: i64, active: Option<f64>, hot: u8, segment: Segment) -> Feature {
        Feature {
            id: Uuid::new_v4(),
            normalized_event_id: Uuid::new_v4(),
            feature_version: 1,
            event_date: at(hours).date_naive(),
            occurred_at: at(hours),
            identity: Identity::User("u1".into()),
            source: "tracker".into(),
            device_type: Some("mobile".into()),
            traffic_source_type: TrafficSourceType::Organic,
            active_time_sec: active,
            idle_time_sec: None,
            page_depth: 1,
            distinct_pages: 1,
            max_scroll_depth: None,
            click_count: 0,
            form_interactions: 0,
            form_submits: 0,
            cta_clicks: 0,
            search_queries: 0,
            goals_count: 0,
            key_pages: BTreeMap::from([("pricing".to_string(), 1)]),
            is_bounce: false,
            is_return: false,
            conversion_rate_proxy: 0.0,
            engagement_ratio: None,
            engagement_score: 0,
            intent_score: 0,
            hot_score_base: hot,
            score_breakdown: ScoreBreakdown::default(),
            segment,
            decision_stage: DecisionStage::Awareness,
            computed_at: at(hours),
        }
    }

    fn fold(features: &[&Feature]) -> UserAggregate {
        features.iter().fold(None::<UserAggregate>, |agg, f| {
            Some(merge(agg.as_ref(), f, None, at(100)))
        })
        .unwrap()
    }

    #[test]
    fn test_first_feature_creates_aggregate() {
        let f = feature(1, Some(60.0), 40, Segment::Info);
        let agg = merge(None, &f, None, at(2));
        assert_eq!(agg.total_sessions, 1);
        assert_eq!(agg.version, 1);
        assert_eq!(agg.preferred_device.as_deref(), Some("mobile"));
        assert_eq!(agg.preferred_source.as_deref(), Some("organic"));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let early = feature(1, Some(60.0), 40, Segment::Info);
        let late = feature(5, None, 80, Segment::Urgency);

        let a = fold(&[&early, &late]);
        let b = fold(&[&late, &early]);

        assert_eq!(a.total_sessions, 2);
        assert_eq!(a.total_sessions, b.total_sessions);
        assert_eq!(a.total_active_time_sec, b.total_active_time_sec);
        assert_eq!(a.first_visit_at, b.first_visit_at);
        assert_eq!(a.last_visit_at, b.last_visit_at);
        assert_eq!(a.key_pages, b.key_pages);
        assert_eq!(a.current_hot_score, 80);
        assert_eq!(b.current_hot_score, 80);
        assert_eq!(b.current_segment, Segment::Urgency);
    }

    #[test]
    fn test_recompute_adjusts_by_delta() {
        let v1 = feature(1, Some(60.0), 40, Segment::Info);
        let agg = merge(None, &v1, None, at(2));

        let mut v2 = v1.clone();
        v2.feature_version = 2;
        v2.active_time_sec = Some(90.0);
        v2.key_pages = BTreeMap::from([("reviews".to_string(), 2)]);
        v2.hot_score_base = 55;

        let updated = merge(Some(&agg), &v2, Some(&v1), at(3));
        assert_eq!(updated.total_sessions, 1);
        assert_eq!(updated.total_active_time_sec, 90.0);
        assert_eq!(updated.key_pages, BTreeMap::from([("reviews".to_string(), 2)]));
        assert_eq!(updated.current_hot_score, 55);
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn test_most_frequent_tie_breaks_alphabetically() {
        let counts = BTreeMap::from([("mobile".to_string(), 2), ("desktop".to_string(), 2)]);
        assert_eq!(most_frequent(&counts).as_deref(), Some("desktop"));
        assert_eq!(most_frequent(&BTreeMap::new()), None);
    }
}
