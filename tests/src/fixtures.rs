//! Test fixtures and payload generators.

use chrono::NaiveDate;
use serde_json::{json, Value};

/// Parse a `YYYY-MM-DD` literal.
pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
}

/// The single-page, 15 second visit every source threshold but Metrika's treats as a bounce.
pub fn short_single_page_visit() -> String {
    r#"{"sessionId":"s1","pageViews":1,"duration":15}"#.to_string()
}

/// A site tracker session with a client id.
pub fn tracker_session(session_id: &str, client_id: &str, day: NaiveDate) -> Value {
    json!({
        "sessionId": session_id,
        "clientId": client_id,
        "startedAt": format!("{day}T09:30:00Z"),
        "url": "https://shop.example/pricing?utm_source=google&utm_medium=cpc",
        "pageViews": 3,
        "duration": 140,
        "userAgent": "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
    })
}

/// One GA4 session for `day`.
pub fn ga4_session(index: usize, day: NaiveDate) -> Value {
    json!({
        "ga_session_id": format!("ga-{day}-{index}"),
        "user_pseudo_id": format!("ga-client-{index}"),
        "session_start": format!("{day}T10:00:00Z"),
        "page_location": "https://shop.example/catalog",
        "page_views": 2,
        "session_duration": 95,
        "traffic_source": { "source": "google", "medium": "organic" }
    })
}

/// One Metrika Logs API visit for `day`.
pub fn metrika_visit(index: usize, day: NaiveDate) -> Value {
    json!({
        "ym:s:visitID": format!("ym-{day}-{index}"),
        "ym:s:clientID": format!("{}", 1_000_000 + index),
        "ym:s:dateTime": format!("{day} 11:15:00"),
        "ym:s:startURL": "https://shop.example/",
        "ym:s:referer": "https://yandex.ru/search/?text=shop",
        "ym:s:pageViews": 2,
        "ym:s:visitDuration": 95,
        "ym:s:deviceCategory": "1"
    })
}

/// A well-formed model answer citing `sessions` for `day`.
pub fn insight_reply(day: NaiveDate, sessions: f64) -> String {
    json!({
        "executive_summary": "Traffic was steady and organic search led acquisition.",
        "key_findings": [
            { "title": "Organic search leads", "detail": "Most sessions came from search." }
        ],
        "recommendations": [
            { "title": "Expand landing pages", "detail": "Add category pages for top queries.", "priority": "high" }
        ],
        "citations": [
            { "date": day.to_string(), "metric": "sessions", "value": sessions }
        ],
        "confidence": 0.8
    })
    .to_string()
}

/// A model answer wrapped in a fenced block with prose around it.
pub fn fenced_reply(inner: &str) -> String {
    format!("Here is the analysis you asked for:\n```json\n{inner}\n```\nLet me know if you need more.")
}
