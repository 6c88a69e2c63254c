//! Traffic source classification.
//!
//! Explicit UTM parameters win over referrer heuristics. Ad click ids in the
//! landing URL mark a visit as paid even when UTM tagging is missing.

use pipeline_core::{TrafficSourceType, Utm};
use url::Url;

const PAID_MEDIUMS: &[&str] = &["cpc", "ppc", "paid", "cpm", "cpa", "display", "ads"];
const SOCIAL_MEDIUMS: &[&str] = &["social", "social-network", "social_network", "sm", "smm"];
const ORGANIC_MEDIUMS: &[&str] = &["organic", "seo"];
const AD_CLICK_IDS: &[&str] = &["gclid", "yclid", "fbclid", "msclkid", "dclid"];

const SEARCH_ENGINES: &[&str] = &[
    "google", "yandex", "bing", "yahoo", "duckduckgo", "baidu", "mail.ru", "rambler", "ecosia",
    "startpage",
];
const SOCIAL_NETWORKS: &[&str] = &[
    "facebook", "fb.com", "instagram", "vk.com", "vkontakte", "ok.ru", "t.me", "telegram",
    "twitter", "x.com", "t.co", "linkedin", "youtube", "tiktok", "pinterest", "reddit",
    "whatsapp",
];

/// Classify a session's traffic source.
pub fn classify_traffic(
    utm: &Utm,
    referrer: Option<&str>,
    landing_url: Option<&str>,
) -> TrafficSourceType {
    if let Some(kind) = classify_utm(utm) {
        return kind;
    }

    let landing = landing_url.and_then(parse_url);
    if let Some(ref landing) = landing {
        let has_click_id = landing
            .query_pairs()
            .any(|(key, _)| AD_CLICK_IDS.contains(&key.as_ref()));
        if has_click_id {
            return TrafficSourceType::Paid;
        }
    }

    let Some(referrer_host) = referrer.and_then(parse_url).and_then(|u| host_of(&u)) else {
        return TrafficSourceType::Direct;
    };

    let landing_host = landing.as_ref().and_then(host_of);
    if landing_host.as_deref() == Some(referrer_host.as_str()) {
        return TrafficSourceType::Direct;
    }

    classify_name(&referrer_host).unwrap_or(TrafficSourceType::Referral)
}

fn classify_utm(utm: &Utm) -> Option<TrafficSourceType> {
    let medium = utm.medium.as_deref().map(normalize_token);
    let source = utm.source.as_deref().map(normalize_token);

    if let Some(ref medium) = medium {
        if PAID_MEDIUMS.contains(&medium.as_str()) {
            return Some(TrafficSourceType::Paid);
        }
        if SOCIAL_MEDIUMS.contains(&medium.as_str()) {
            return Some(TrafficSourceType::Social);
        }
        if ORGANIC_MEDIUMS.contains(&medium.as_str()) {
            return Some(TrafficSourceType::Organic);
        }
    }

    match source {
        Some(source) if !source.is_empty() => {
            // An engine name is organic only when no other medium was given.
            match classify_name(&source) {
                Some(TrafficSourceType::Social) => Some(TrafficSourceType::Social),
                Some(TrafficSourceType::Organic) if medium.is_none() => {
                    Some(TrafficSourceType::Organic)
                }
                _ => Some(TrafficSourceType::Referral),
            }
        }
        _ if medium.is_some() => Some(TrafficSourceType::Referral),
        _ => None,
    }
}

/// Search engine or social network named by a host or source token.
fn classify_name(name: &str) -> Option<TrafficSourceType> {
    let matches = |needle: &&str| {
        name == *needle
            || name.ends_with(&format!(".{needle}"))
            || name
                .split('.')
                .any(|label| label == *needle)
    };
    if SOCIAL_NETWORKS.iter().any(matches) {
        Some(TrafficSourceType::Social)
    } else if SEARCH_ENGINES.iter().any(matches) {
        Some(TrafficSourceType::Organic)
    } else {
        None
    }
}

fn normalize_token(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn parse_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Url::parse(raw)
        .or_else(|_| Url::parse(&format!("https://{raw}")))
        .ok()
}

fn host_of(url: &Url) -> Option<String> {
    url.host_str().map(|h| {
        let h = h.to_ascii_lowercase();
        h.strip_prefix("www.").map(str::to_string).unwrap_or(h)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utm(source: Option<&str>, medium: Option<&str>) -> Utm {
        Utm {
            source: source.map(String::from),
            medium: medium.map(String::from),
            ..Utm::default()
        }
    }

    #[test]
    fn test_utm_wins_over_referrer() {
        let kind = classify_traffic(
            &utm(Some("yandex"), Some("cpc")),
            Some("https://www.google.com/"),
            Some("https://shop.example/"),
        );
        assert_eq!(kind, TrafficSourceType::Paid);
    }

    #[test]
    fn test_social_medium_and_source() {
        assert_eq!(
            classify_traffic(&utm(Some("newsletter"), Some("social")), None, None),
            TrafficSourceType::Social
        );
        assert_eq!(
            classify_traffic(&utm(Some("vk.com"), Some("post")), None, None),
            TrafficSourceType::Social
        );
    }

    #[test]
    fn test_other_utm_source_is_referral() {
        assert_eq!(
            classify_traffic(&utm(Some("partner-blog"), None), None, None),
            TrafficSourceType::Referral
        );
    }

    #[test]
    fn test_click_id_is_paid() {
        let kind = classify_traffic(
            &Utm::default(),
            Some("https://www.google.com/"),
            Some("https://shop.example/pricing?gclid=abc"),
        );
        assert_eq!(kind, TrafficSourceType::Paid);
    }

    #[test]
    fn test_referrer_heuristics() {
        let landing = Some("https://shop.example/");
        assert_eq!(
            classify_traffic(&Utm::default(), None, landing),
            TrafficSourceType::Direct
        );
        assert_eq!(
            classify_traffic(&Utm::default(), Some("https://shop.example/blog"), landing),
            TrafficSourceType::Direct
        );
        assert_eq!(
            classify_traffic(&Utm::default(), Some("https://yandex.ru/search?text=x"), landing),
            TrafficSourceType::Organic
        );
        assert_eq!(
            classify_traffic(&Utm::default(), Some("https://m.facebook.com/"), landing),
            TrafficSourceType::Social
        );
        assert_eq!(
            classify_traffic(&Utm::default(), Some("https://partner.io/review"), landing),
            TrafficSourceType::Referral
        );
    }
}
