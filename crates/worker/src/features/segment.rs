//! Segment rules and decision stage.
//!
//! Rules are evaluated in [`Segment::ALL`] order; the first match wins.

use pipeline_core::{DecisionStage, Segment};

use super::config::SegmentThresholds;
use super::signals::Signals;

pub fn classify(signals: &Signals, thresholds: &SegmentThresholds) -> Segment {
    Segment::ALL
        .into_iter()
        .find(|segment| matches(*segment, signals, thresholds))
        .unwrap_or(Segment::Info)
}

fn matches(segment: Segment, s: &Signals, t: &SegmentThresholds) -> bool {
    // Unknown active time never satisfies a time threshold.
    let active_over = |secs: f64| s.active_time_sec.is_some_and(|time| time > secs);
    match segment {
        Segment::Urgency => {
            s.conversion_rate_proxy > t.urgency_min_conversion
                && active_over(t.urgency_min_active_secs)
        }
        Segment::Decision => {
            s.action_count() > t.decision_min_actions
                && s.distinct_pages > t.decision_min_distinct_pages
        }
        Segment::Problem => s.search_queries > t.problem_min_searches,
        Segment::Brand => {
            s.engagement_ratio
                .is_some_and(|r| r > t.brand_min_engagement_ratio)
                && active_over(t.brand_min_active_secs)
        }
        Segment::Info => true,
    }
}

pub fn decision_stage(
    segment: Segment,
    intent_score: u8,
    thresholds: &SegmentThresholds,
) -> DecisionStage {
    match segment {
        Segment::Urgency => DecisionStage::Purchase,
        Segment::Decision => DecisionStage::Decision,
        Segment::Problem | Segment::Brand => DecisionStage::Consideration,
        Segment::Info if intent_score >= thresholds.consideration_min_intent => {
            DecisionStage::Consideration
        }
        Segment::Info => DecisionStage::Awareness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SegmentThresholds {
        SegmentThresholds::default()
    }

    #[test]
    fn test_urgency() {
        let s = Signals {
            conversion_rate_proxy: 0.08,
            active_time_sec: Some(200.0),
            ..Default::default()
        };
        assert_eq!(classify(&s, &defaults()), Segment::Urgency);
        assert_eq!(decision_stage(Segment::Urgency, 0, &defaults()), DecisionStage::Purchase);
    }

    #[test]
    fn test_urgency_needs_known_time() {
        let s = Signals {
            conversion_rate_proxy: 0.08,
            active_time_sec: None,
            ..Default::default()
        };
        assert_eq!(classify(&s, &defaults()), Segment::Info);
    }

    #[test]
    fn test_earlier_rule_wins() {
        // Matches DECISION, PROBLEM and BRAND at once.
        let s = Signals {
            click_count: 6,
            distinct_pages: 5,
            search_queries: 4,
            engagement_ratio: Some(0.9),
            active_time_sec: Some(150.0),
            ..Default::default()
        };
        assert_eq!(classify(&s, &defaults()), Segment::Decision);
    }

    #[test]
    fn test_problem_and_brand() {
        let problem = Signals {
            search_queries: 4,
            ..Default::default()
        };
        assert_eq!(classify(&problem, &defaults()), Segment::Problem);

        let brand = Signals {
            engagement_ratio: Some(0.8),
            active_time_sec: Some(130.0),
            ..Default::default()
        };
        assert_eq!(classify(&brand, &defaults()), Segment::Brand);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let s = Signals {
            search_queries: 3,
            click_count: 5,
            distinct_pages: 10,
            ..Default::default()
        };
        assert_eq!(classify(&s, &defaults()), Segment::Info);
    }

    #[test]
    fn test_info_stage_follows_intent() {
        assert_eq!(decision_stage(Segment::Info, 10, &defaults()), DecisionStage::Awareness);
        assert_eq!(decision_stage(Segment::Info, 60, &defaults()), DecisionStage::Consideration);
    }

    #[test]
    fn test_thresholds_come_from_config() {
        let s = Signals {
            search_queries: 2,
            ..Default::default()
        };
        assert_eq!(classify(&s, &defaults()), Segment::Info);

        let lenient = SegmentThresholds {
            problem_min_searches: 1,
            consideration_min_intent: 20,
            ..Default::default()
        };
        assert_eq!(classify(&s, &lenient), Segment::Problem);
        assert_eq!(
            decision_stage(Segment::Info, 30, &lenient),
            DecisionStage::Consideration
        );
        assert_eq!(
            decision_stage(Segment::Info, 30, &defaults()),
            DecisionStage::Awareness
        );
    }
}
