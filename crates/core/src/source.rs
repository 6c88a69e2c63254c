//! Source payload variants and per-source field extraction.
//!
//! Every analytics source delivers its own JSON shape. The source name picks
//! a [`SourceKind`], the kind picks a payload struct, and each payload struct
//! implements [`SessionFields`] so the normalizer never touches raw JSON keys.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{Error, NormalizationErrorCode, Result};
use crate::events::{Geo, Hit, HitKind, Utm};
use crate::limits::{
    GA4_BOUNCE_THRESHOLD_SECS, METRIKA_BOUNCE_THRESHOLD_SECS, TRACKER_BOUNCE_THRESHOLD_SECS,
};

/// Payload `type`/`event` values that carry no session.
const NON_SESSION_TYPES: &[&str] = &["ping", "health", "heartbeat", "test"];

/// Which field map applies to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Site trackers and any unrecognized source name.
    Tracker,
    Metrika,
    Ga4,
}

impl SourceKind {
    /// Resolve a source name. Unknown names use the tracker field map.
    pub fn from_source(source: &str) -> Self {
        match source.trim().to_ascii_lowercase().as_str() {
            "metrika" | "yandex_metrika" | "yandex-metrika" | "ym" => Self::Metrika,
            "ga4" | "google_analytics" | "google-analytics" | "ga" => Self::Ga4,
            _ => Self::Tracker,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tracker => "tracker",
            Self::Metrika => "metrika",
            Self::Ga4 => "ga4",
        }
    }

    /// Default bounce threshold in seconds.
    pub fn default_bounce_threshold_secs(&self) -> f64 {
        match self {
            Self::Tracker => TRACKER_BOUNCE_THRESHOLD_SECS,
            Self::Metrika => METRIKA_BOUNCE_THRESHOLD_SECS,
            Self::Ga4 => GA4_BOUNCE_THRESHOLD_SECS,
        }
    }
}

/// Field extraction shared by all source payloads.
pub trait SessionFields {
    fn session_id(&self) -> Option<&str>;
    fn user_id(&self) -> Option<&str>;
    fn client_id(&self) -> Option<&str>;
    fn occurred_at(&self) -> Option<DateTime<Utc>>;
    fn url(&self) -> Option<&str>;
    fn referrer(&self) -> Option<&str>;
    fn utm(&self) -> Utm;
    /// Reported page views, if the source reports them.
    fn page_views(&self) -> Option<u32>;
    /// Visit duration in seconds.
    fn duration_secs(&self) -> Option<f64>;
    /// Device category as reported by the source.
    fn device_category(&self) -> Option<String>;
    fn browser(&self) -> Option<&str>;
    fn os(&self) -> Option<&str>;
    fn user_agent(&self) -> Option<&str>;
    fn ip(&self) -> Option<&str>;
    fn geo(&self) -> Geo;
    fn hits(&self) -> Vec<Hit>;
    fn goals(&self) -> Vec<String>;
}

/// A parsed source payload, one variant per field map.
#[derive(Debug, Clone)]
pub enum SourcePayload {
    Tracker(TrackerSession),
    Metrika(MetrikaVisit),
    Ga4(Ga4Session),
}

/// Result of parsing raw text.
#[derive(Debug, Clone)]
pub enum ParsedPayload {
    Session(Box<SourcePayload>),
    /// Not session-like; carries the marker that identified it.
    NonSession(String),
}

impl SourcePayload {
    /// Parse verbatim raw bytes for a source. Bytes that are not UTF-8 JSON are invalid.
    pub fn parse(kind: SourceKind, raw: &[u8]) -> Result<ParsedPayload> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| {
            Error::normalization(
                NormalizationErrorCode::InvalidPayload,
                format!("payload is not JSON: {e}"),
            )
        })?;

        let Value::Object(ref map) = value else {
            return Err(Error::normalization(
                NormalizationErrorCode::InvalidPayload,
                "payload is not a JSON object",
            ));
        };

        for key in ["type", "event"] {
            if let Some(Value::String(marker)) = map.get(key) {
                let marker = marker.to_ascii_lowercase();
                if NON_SESSION_TYPES.contains(&marker.as_str()) {
                    return Ok(ParsedPayload::NonSession(marker));
                }
            }
        }

        let shape = |e: serde_json::Error| {
            Error::normalization(
                NormalizationErrorCode::UnsupportedShape,
                format!("{} payload: {e}", kind.as_str()),
            )
        };

        let payload = match kind {
            SourceKind::Tracker => Self::Tracker(serde_json::from_value(value).map_err(shape)?),
            SourceKind::Metrika => Self::Metrika(serde_json::from_value(value).map_err(shape)?),
            SourceKind::Ga4 => Self::Ga4(serde_json::from_value(value).map_err(shape)?),
        };
        Ok(ParsedPayload::Session(Box::new(payload)))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Tracker(_) => SourceKind::Tracker,
            Self::Metrika(_) => SourceKind::Metrika,
            Self::Ga4(_) => SourceKind::Ga4,
        }
    }

    /// Field extraction strategy for this variant.
    pub fn fields(&self) -> &dyn SessionFields {
        match self {
            Self::Tracker(p) => p,
            Self::Metrika(p) => p,
            Self::Ga4(p) => p,
        }
    }
}

// =============================================================================
// Site tracker
// =============================================================================

/// Hit reported by a site tracker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerHit {
    #[serde(default, alias = "event", alias = "name", deserialize_with = "de::opt_string")]
    pub r#type: Option<String>,
    #[serde(default, alias = "page", alias = "path", deserialize_with = "de::opt_string")]
    pub url: Option<String>,
    #[serde(default, alias = "ts", alias = "time", deserialize_with = "de::opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "scrollDepth",
        alias = "depth",
        deserialize_with = "de::opt_f64"
    )]
    pub scroll_depth: Option<f64>,
    #[serde(default, alias = "q", alias = "searchTerm", deserialize_with = "de::opt_string")]
    pub query: Option<String>,
}

/// Session reported by a site tracker or unknown source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerSession {
    #[serde(default, alias = "sessionId", alias = "sid", deserialize_with = "de::opt_string")]
    pub session_id: Option<String>,
    #[serde(default, alias = "userId", deserialize_with = "de::opt_string")]
    pub user_id: Option<String>,
    #[serde(
        default,
        alias = "clientId",
        alias = "visitorId",
        alias = "visitor_id",
        deserialize_with = "de::opt_string"
    )]
    pub client_id: Option<String>,
    #[serde(
        default,
        alias = "startedAt",
        alias = "occurredAt",
        alias = "started_at",
        deserialize_with = "de::opt_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "pageUrl",
        alias = "landingPage",
        alias = "landing_page",
        deserialize_with = "de::opt_string"
    )]
    pub url: Option<String>,
    #[serde(default, alias = "referer", deserialize_with = "de::opt_string")]
    pub referrer: Option<String>,
    #[serde(default, alias = "utmSource", deserialize_with = "de::opt_string")]
    pub utm_source: Option<String>,
    #[serde(default, alias = "utmMedium", deserialize_with = "de::opt_string")]
    pub utm_medium: Option<String>,
    #[serde(default, alias = "utmCampaign", deserialize_with = "de::opt_string")]
    pub utm_campaign: Option<String>,
    #[serde(default, alias = "utmContent", deserialize_with = "de::opt_string")]
    pub utm_content: Option<String>,
    #[serde(default, alias = "utmTerm", deserialize_with = "de::opt_string")]
    pub utm_term: Option<String>,
    #[serde(
        default,
        alias = "pageViews",
        alias = "pageviews",
        deserialize_with = "de::opt_u32"
    )]
    pub page_views: Option<u32>,
    #[serde(
        default,
        alias = "visitDuration",
        alias = "duration_sec",
        deserialize_with = "de::opt_f64"
    )]
    pub duration: Option<f64>,
    #[serde(default, alias = "deviceType", alias = "device", deserialize_with = "de::opt_string")]
    pub device_type: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub browser: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub os: Option<String>,
    #[serde(default, alias = "userAgent", alias = "ua", deserialize_with = "de::opt_string")]
    pub user_agent: Option<String>,
    #[serde(default, alias = "ipAddress", alias = "ip_address", deserialize_with = "de::opt_string")]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub region: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub city: Option<String>,
    #[serde(default, alias = "hits")]
    pub events: Vec<TrackerHit>,
    #[serde(default, deserialize_with = "de::string_list")]
    pub goals: Vec<String>,
}

impl SessionFields for TrackerSession {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .or_else(|| self.events.iter().filter_map(|h| h.timestamp).min())
    }

    fn url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or_else(|| self.events.iter().find_map(|h| h.url.as_deref()))
    }

    fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    fn utm(&self) -> Utm {
        Utm {
            source: self.utm_source.clone(),
            medium: self.utm_medium.clone(),
            campaign: self.utm_campaign.clone(),
            content: self.utm_content.clone(),
            term: self.utm_term.clone(),
        }
    }

    fn page_views(&self) -> Option<u32> {
        self.page_views.or_else(|| {
            let count = self
                .events
                .iter()
                .filter(|h| h.r#type.as_deref().map(HitKind::from_name) == Some(HitKind::Pageview))
                .count() as u32;
            (count > 0).then_some(count)
        })
    }

    fn duration_secs(&self) -> Option<f64> {
        self.duration
    }

    fn device_category(&self) -> Option<String> {
        self.device_type.as_ref().map(|d| d.to_ascii_lowercase())
    }

    fn browser(&self) -> Option<&str> {
        self.browser.as_deref()
    }

    fn os(&self) -> Option<&str> {
        self.os.as_deref()
    }

    fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    fn geo(&self) -> Geo {
        Geo {
            country: self.country.clone(),
            region: self.region.clone(),
            city: self.city.clone(),
        }
    }

    fn hits(&self) -> Vec<Hit> {
        self.events
            .iter()
            .map(|h| Hit {
                kind: h
                    .r#type
                    .as_deref()
                    .map(HitKind::from_name)
                    .unwrap_or(HitKind::Other),
                url: h.url.clone(),
                timestamp: h.timestamp,
                scroll_depth: h.scroll_depth,
                query: h.query.clone(),
            })
            .collect()
    }

    fn goals(&self) -> Vec<String> {
        self.goals.clone()
    }
}

// =============================================================================
// Yandex Metrika (Logs API visit)
// =============================================================================

/// One visit row from the Metrika Logs API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetrikaVisit {
    #[serde(
        default,
        rename = "ym:s:visitID",
        alias = "visitID",
        alias = "visit_id",
        deserialize_with = "de::opt_string"
    )]
    pub visit_id: Option<String>,
    #[serde(
        default,
        rename = "ym:s:clientID",
        alias = "clientID",
        alias = "client_id",
        deserialize_with = "de::opt_string"
    )]
    pub client_id: Option<String>,
    #[serde(
        default,
        rename = "ym:s:userID",
        alias = "userID",
        alias = "user_id",
        deserialize_with = "de::opt_string"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        rename = "ym:s:dateTime",
        alias = "dateTime",
        deserialize_with = "de::opt_timestamp"
    )]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "ym:s:startURL",
        alias = "startURL",
        deserialize_with = "de::opt_string"
    )]
    pub start_url: Option<String>,
    #[serde(
        default,
        rename = "ym:s:referer",
        alias = "referer",
        deserialize_with = "de::opt_string"
    )]
    pub referer: Option<String>,
    #[serde(default, rename = "ym:s:UTMSource", deserialize_with = "de::opt_string")]
    pub utm_source: Option<String>,
    #[serde(default, rename = "ym:s:UTMMedium", deserialize_with = "de::opt_string")]
    pub utm_medium: Option<String>,
    #[serde(default, rename = "ym:s:UTMCampaign", deserialize_with = "de::opt_string")]
    pub utm_campaign: Option<String>,
    #[serde(default, rename = "ym:s:UTMContent", deserialize_with = "de::opt_string")]
    pub utm_content: Option<String>,
    #[serde(default, rename = "ym:s:UTMTerm", deserialize_with = "de::opt_string")]
    pub utm_term: Option<String>,
    #[serde(
        default,
        rename = "ym:s:pageViews",
        alias = "pageViews",
        deserialize_with = "de::opt_u32"
    )]
    pub page_views: Option<u32>,
    #[serde(
        default,
        rename = "ym:s:visitDuration",
        alias = "visitDuration",
        deserialize_with = "de::opt_f64"
    )]
    pub visit_duration: Option<f64>,
    /// 1 desktop, 2 mobile, 3 tablet, 4 TV, or a name
    #[serde(
        default,
        rename = "ym:s:deviceCategory",
        alias = "deviceCategory",
        deserialize_with = "de::opt_string"
    )]
    pub device_category: Option<String>,
    #[serde(default, rename = "ym:s:browser", deserialize_with = "de::opt_string")]
    pub browser: Option<String>,
    #[serde(default, rename = "ym:s:operatingSystem", deserialize_with = "de::opt_string")]
    pub operating_system: Option<String>,
    #[serde(default, rename = "ym:s:ipAddress", deserialize_with = "de::opt_string")]
    pub ip_address: Option<String>,
    #[serde(default, rename = "ym:s:regionCountry", deserialize_with = "de::opt_string")]
    pub region_country: Option<String>,
    #[serde(default, rename = "ym:s:regionArea", deserialize_with = "de::opt_string")]
    pub region_area: Option<String>,
    #[serde(default, rename = "ym:s:regionCity", deserialize_with = "de::opt_string")]
    pub region_city: Option<String>,
    #[serde(
        default,
        rename = "ym:s:goalsID",
        alias = "goalsID",
        deserialize_with = "de::string_list"
    )]
    pub goals_id: Vec<String>,
}

impl SessionFields for MetrikaVisit {
    fn session_id(&self) -> Option<&str> {
        self.visit_id.as_deref()
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.date_time
    }

    fn url(&self) -> Option<&str> {
        self.start_url.as_deref()
    }

    fn referrer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    fn utm(&self) -> Utm {
        Utm {
            source: self.utm_source.clone(),
            medium: self.utm_medium.clone(),
            campaign: self.utm_campaign.clone(),
            content: self.utm_content.clone(),
            term: self.utm_term.clone(),
        }
    }

    fn page_views(&self) -> Option<u32> {
        self.page_views
    }

    fn duration_secs(&self) -> Option<f64> {
        self.visit_duration
    }

    fn device_category(&self) -> Option<String> {
        self.device_category
            .as_deref()
            .map(|c| match c {
                "1" => "desktop".to_string(),
                "2" => "mobile".to_string(),
                "3" => "tablet".to_string(),
                "4" => "tv".to_string(),
                other => other.to_ascii_lowercase(),
            })
    }

    fn browser(&self) -> Option<&str> {
        self.browser.as_deref()
    }

    fn os(&self) -> Option<&str> {
        self.operating_system.as_deref()
    }

    fn user_agent(&self) -> Option<&str> {
        None
    }

    fn ip(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    fn geo(&self) -> Geo {
        Geo {
            country: self.region_country.clone(),
            region: self.region_area.clone(),
            city: self.region_city.clone(),
        }
    }

    fn hits(&self) -> Vec<Hit> {
        Vec::new()
    }

    fn goals(&self) -> Vec<String> {
        self.goals_id.clone()
    }
}

// =============================================================================
// Google Analytics 4
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ga4TrafficSource {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub medium: Option<String>,
    #[serde(default, alias = "campaign", deserialize_with = "de::opt_string")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ga4Device {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub operating_system: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ga4Geo {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub region: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub city: Option<String>,
}

/// Event inside a GA4 session export.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ga4Event {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub event_name: Option<String>,
    #[serde(default, deserialize_with = "de::opt_timestamp")]
    pub event_timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub page_location: Option<String>,
    #[serde(default, deserialize_with = "de::opt_f64")]
    pub percent_scrolled: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub search_term: Option<String>,
}

/// One GA4 session, flattened from the export.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ga4Session {
    #[serde(
        default,
        alias = "ga_session_id",
        alias = "sessionId",
        deserialize_with = "de::opt_string"
    )]
    pub session_id: Option<String>,
    #[serde(default, alias = "client_id", deserialize_with = "de::opt_string")]
    pub user_pseudo_id: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub user_id: Option<String>,
    #[serde(
        default,
        alias = "event_timestamp",
        alias = "session_start",
        deserialize_with = "de::opt_timestamp"
    )]
    pub session_start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "landing_page", deserialize_with = "de::opt_string")]
    pub page_location: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub page_referrer: Option<String>,
    #[serde(default)]
    pub traffic_source: Option<Ga4TrafficSource>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub session_source: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub session_medium: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub session_campaign: Option<String>,
    #[serde(
        default,
        alias = "screen_page_views",
        alias = "screenPageViews",
        deserialize_with = "de::opt_u32"
    )]
    pub page_views: Option<u32>,
    /// Engagement time in milliseconds
    #[serde(default, alias = "engagementTimeMsec", deserialize_with = "de::opt_f64")]
    pub engagement_time_msec: Option<f64>,
    /// Session duration in seconds
    #[serde(default, alias = "sessionDuration", deserialize_with = "de::opt_f64")]
    pub session_duration: Option<f64>,
    #[serde(default)]
    pub device: Option<Ga4Device>,
    #[serde(default)]
    pub geo: Option<Ga4Geo>,
    #[serde(default)]
    pub events: Vec<Ga4Event>,
    #[serde(default, alias = "key_events", deserialize_with = "de::string_list")]
    pub conversions: Vec<String>,
}

impl SessionFields for Ga4Session {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn client_id(&self) -> Option<&str> {
        self.user_pseudo_id.as_deref()
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.session_start_timestamp
            .or_else(|| self.events.iter().filter_map(|e| e.event_timestamp).min())
    }

    fn url(&self) -> Option<&str> {
        self.page_location
            .as_deref()
            .or_else(|| self.events.iter().find_map(|e| e.page_location.as_deref()))
    }

    fn referrer(&self) -> Option<&str> {
        self.page_referrer.as_deref()
    }

    fn utm(&self) -> Utm {
        let nested = self.traffic_source.clone().unwrap_or_default();
        Utm {
            source: self.session_source.clone().or(nested.source),
            medium: self.session_medium.clone().or(nested.medium),
            campaign: self.session_campaign.clone().or(nested.name),
            content: None,
            term: None,
        }
        .without_placeholders()
    }

    fn page_views(&self) -> Option<u32> {
        self.page_views.or_else(|| {
            let count = self
                .events
                .iter()
                .filter(|e| {
                    e.event_name.as_deref().map(HitKind::from_name) == Some(HitKind::Pageview)
                })
                .count() as u32;
            (count > 0).then_some(count)
        })
    }

    fn duration_secs(&self) -> Option<f64> {
        self.session_duration
            .or_else(|| self.engagement_time_msec.map(|ms| ms / 1000.0))
    }

    fn device_category(&self) -> Option<String> {
        self.device
            .as_ref()
            .and_then(|d| d.category.as_ref())
            .map(|c| c.to_ascii_lowercase())
    }

    fn browser(&self) -> Option<&str> {
        self.device.as_ref().and_then(|d| d.browser.as_deref())
    }

    fn os(&self) -> Option<&str> {
        self.device.as_ref().and_then(|d| d.operating_system.as_deref())
    }

    fn user_agent(&self) -> Option<&str> {
        None
    }

    fn ip(&self) -> Option<&str> {
        None
    }

    fn geo(&self) -> Geo {
        let geo = self.geo.clone().unwrap_or_default();
        Geo {
            country: geo.country,
            region: geo.region,
            city: geo.city,
        }
    }

    fn hits(&self) -> Vec<Hit> {
        self.events
            .iter()
            .map(|e| Hit {
                kind: e
                    .event_name
                    .as_deref()
                    .map(HitKind::from_name)
                    .unwrap_or(HitKind::Other),
                url: e.page_location.clone(),
                timestamp: e.event_timestamp,
                scroll_depth: e.percent_scrolled,
                query: e.search_term.clone(),
            })
            .collect()
    }

    fn goals(&self) -> Vec<String> {
        self.conversions.clone()
    }
}

impl Utm {
    /// GA4 reports "(direct)" / "(none)" / "(not set)" instead of omitting fields.
    fn without_placeholders(self) -> Utm {
        let clean = |v: Option<String>| v.filter(|s| !(s.starts_with('(') && s.ends_with(')')));
        Utm {
            source: clean(self.source),
            medium: clean(self.medium),
            campaign: clean(self.campaign),
            content: clean(self.content),
            term: clean(self.term),
        }
    }
}

/// Lenient deserializers for loosely typed analytics exports.
mod de {
    use super::*;

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite() && *v >= 0.0))
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
        Ok(opt_f64(d)?.map(|v| v.min(u32::MAX as f64) as u32))
    }

    pub fn opt_timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64().and_then(from_epoch),
            Some(Value::String(s)) => parse_timestamp(s.trim()),
            _ => None,
        })
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
        let items = match Option::<Value>::deserialize(d)? {
            Some(Value::Array(items)) => items,
            Some(Value::String(s)) => {
                let inner = s.trim().trim_start_matches('[').trim_end_matches(']');
                return Ok(inner
                    .split(',')
                    .map(|part| part.trim().trim_matches('"').to_string())
                    .filter(|part| !part.is_empty())
                    .collect());
            }
            Some(Value::Number(n)) => vec![Value::Number(n)],
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                Value::Object(map) => map.get("id").or_else(|| map.get("name")).map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
                _ => None,
            })
            .collect())
    }

    /// Seconds, milliseconds, or microseconds since the epoch, by magnitude.
    fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
        let micros = if value >= 1e14 {
            value
        } else if value >= 1e11 {
            value * 1_000.0
        } else {
            value * 1_000_000.0
        };
        DateTime::from_timestamp_micros(micros as i64)
    }

    fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        if s.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
        s.parse::<f64>().ok().and_then(from_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(kind: SourceKind, raw: &str) -> SourcePayload {
        match SourcePayload::parse(kind, raw.as_bytes()).unwrap() {
            ParsedPayload::Session(p) => *p,
            ParsedPayload::NonSession(m) => panic!("unexpected non-session {m}"),
        }
    }

    #[test]
    fn test_unknown_source_uses_tracker_map() {
        assert_eq!(SourceKind::from_source("X"), SourceKind::Tracker);
        assert_eq!(SourceKind::from_source("Yandex_Metrika"), SourceKind::Metrika);
        assert_eq!(SourceKind::from_source("ga4"), SourceKind::Ga4);
    }

    #[test]
    fn test_tracker_camel_case_fields() {
        let payload = session(
            SourceKind::Tracker,
            r#"{"sessionId":"s1","pageViews":1,"duration":15}"#,
        );
        let fields = payload.fields();
        assert_eq!(fields.session_id(), Some("s1"));
        assert_eq!(fields.page_views(), Some(1));
        assert_eq!(fields.duration_secs(), Some(15.0));
        assert!(fields.occurred_at().is_none());
    }

    #[test]
    fn test_metrika_prefixed_fields() {
        let payload = session(
            SourceKind::Metrika,
            r#"{"ym:s:visitID": 1234567890123, "ym:s:clientID": "1700000000123",
                "ym:s:dateTime": "2024-03-01 10:15:00", "ym:s:pageViews": "3",
                "ym:s:visitDuration": 95, "ym:s:deviceCategory": "2",
                "ym:s:goalsID": [111, 222], "ym:s:UTMSource": "yandex", "ym:s:UTMMedium": "cpc"}"#,
        );
        let fields = payload.fields();
        assert_eq!(fields.session_id(), Some("1234567890123"));
        assert_eq!(fields.page_views(), Some(3));
        assert_eq!(fields.device_category().as_deref(), Some("mobile"));
        assert_eq!(fields.goals(), vec!["111".to_string(), "222".to_string()]);
        assert_eq!(fields.utm().medium.as_deref(), Some("cpc"));
        assert_eq!(
            fields.occurred_at().unwrap().to_rfc3339(),
            "2024-03-01T10:15:00+00:00"
        );
    }

    #[test]
    fn test_ga4_nested_and_micros_timestamp() {
        let payload = session(
            SourceKind::Ga4,
            r#"{"ga_session_id": 1709280000, "user_pseudo_id": "123.456",
                "event_timestamp": 1709287200000000,
                "traffic_source": {"source": "(direct)", "medium": "(none)"},
                "engagement_time_msec": 42000,
                "events": [{"event_name": "page_view"}, {"event_name": "page_view"},
                           {"event_name": "scroll", "percent_scrolled": 90}]}"#,
        );
        let fields = payload.fields();
        assert_eq!(fields.client_id(), Some("123.456"));
        assert_eq!(fields.page_views(), Some(2));
        assert_eq!(fields.duration_secs(), Some(42.0));
        assert!(fields.utm().is_empty());
        assert_eq!(fields.hits()[2].scroll_depth, Some(90.0));
        assert_eq!(
            fields.occurred_at().unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_non_session_payloads() {
        for raw in [r#"{"type":"ping"}"#, r#"{"event":"Heartbeat"}"#] {
            assert!(matches!(
                SourcePayload::parse(SourceKind::Tracker, raw.as_bytes()).unwrap(),
                ParsedPayload::NonSession(_)
            ));
        }
    }

    #[test]
    fn test_invalid_payloads() {
        let err = SourcePayload::parse(SourceKind::Tracker, b"not json").unwrap_err();
        assert_eq!(err.error_code(), Some("NORM_001"));
        let err = SourcePayload::parse(SourceKind::Tracker, b"[1,2]").unwrap_err();
        assert_eq!(err.error_code(), Some("NORM_001"));
        let err = SourcePayload::parse(SourceKind::Tracker, br#"{"events": 5}"#).unwrap_err();
        assert_eq!(err.error_code(), Some("NORM_003"));
        let err = SourcePayload::parse(SourceKind::Tracker, b"{\"sessionId\":\"\xff\"}").unwrap_err();
        assert_eq!(err.error_code(), Some("NORM_001"));
    }
}
