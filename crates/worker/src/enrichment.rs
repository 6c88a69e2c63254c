//! Session enrichment: device details from the user agent and geo from the client IP.
//!
//! User agent parsing runs in the normalizer when the source did not report
//! a device category. Geo lookup goes through an injected [`GeoResolver`] so
//! tests and offline deployments never touch the network.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use pipeline_core::{Device, Geo, Result};
use serde::Deserialize;
use tracing::{debug, warn};
use woothee::parser::Parser;

/// Enrichment worker for parsing user agents.
///
/// Uses the woothee library for fast UA parsing (~6.8us/parse).
/// Extracts: browser name, OS, device category.
pub struct EnrichmentWorker {
    parser: Parser,
}

impl EnrichmentWorker {
    /// Creates a new enrichment worker.
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
        }
    }

    /// Fill empty device fields from a user agent string.
    ///
    /// Source-reported values are kept; the user agent only fills gaps.
    pub fn enrich_device(&self, device: &mut Device, user_agent: &str) {
        if user_agent.is_empty() {
            return;
        }

        let Some(result) = self.parser.parse(user_agent) else {
            return;
        };

        if device.browser.is_none() && !result.name.is_empty() && result.name != "UNKNOWN" {
            device.browser = Some(result.name.to_string());
        }

        if device.os.is_none() && !result.os.is_empty() && result.os != "UNKNOWN" {
            device.os = Some(result.os.to_string());
        }

        // woothee categories: pc, smartphone, mobilephone, crawler, appliance, misc
        if device.device_type.is_none() {
            let device_type = match result.category {
                "pc" => Some("desktop"),
                "smartphone" | "mobilephone" => Some("mobile"),
                "crawler" => Some("bot"),
                "appliance" => Some("other"),
                _ => None,
            };
            device.device_type = device_type.map(str::to_string);
        }
    }
}

impl Default for EnrichmentWorker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a client IP to a location.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// `Ok(None)` when the address is unknown or private.
    async fn resolve(&self, ip: IpAddr) -> Result<Option<Geo>>;
}

/// Resolver that never knows anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeoResolver;

#[async_trait]
impl GeoResolver for NoopGeoResolver {
    async fn resolve(&self, _ip: IpAddr) -> Result<Option<Geo>> {
        Ok(None)
    }
}

/// Cache TTL for geo lookups.
const GEO_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Maximum cached addresses.
const GEO_CACHE_MAX_CAPACITY: u64 = 100_000;

/// Caching wrapper around another resolver.
///
/// Misses are cached as well, so a dead upstream is asked once per address.
pub struct CachedGeoResolver {
    inner: Arc<dyn GeoResolver>,
    cache: Cache<IpAddr, Option<Geo>>,
}

impl CachedGeoResolver {
    pub fn new(inner: Arc<dyn GeoResolver>) -> Self {
        Self::with_ttl(inner, GEO_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn GeoResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(GEO_CACHE_MAX_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl GeoResolver for CachedGeoResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Option<Geo>> {
        if let Some(cached) = self.cache.get(&ip).await {
            return Ok(cached);
        }

        let resolved = match self.inner.resolve(ip).await {
            Ok(geo) => geo,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Geo lookup failed");
                None
            }
        };
        self.cache.insert(ip, resolved.clone()).await;
        Ok(resolved)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    country_code: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
}

/// ip-api.com compatible HTTP resolver.
pub struct IpApiResolver {
    http_client: reqwest::Client,
    base_url: String,
}

impl IpApiResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| pipeline_core::Error::config(format!("geo http client: {e}")))?;
        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl GeoResolver for IpApiResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Option<Geo>> {
        if is_private(ip) {
            return Ok(None);
        }

        let url = format!("{}/json/{}", self.base_url.trim_end_matches('/'), ip);
        debug!(ip = %ip, "Querying geo resolver");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| pipeline_core::Error::internal(format!("geo request failed: {e}")))?;

        let body: IpApiResponse = response
            .json()
            .await
            .map_err(|e| pipeline_core::Error::internal(format!("geo response: {e}")))?;

        if body.status != "success" {
            return Ok(None);
        }

        let geo = Geo {
            country: body.country_code,
            region: body.region_name,
            city: body.city,
        };
        Ok((!geo.is_empty()).then_some(geo))
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
