//! Store handle and column conversions.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use pipeline_core::{DbErrorCode, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use telemetry::metrics;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::StoreConfig;

/// Handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    config: StoreConfig,
}

impl Store {
    /// Opens the pool. Does not create tables; call [`crate::init_schema`].
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| Error::config(format!("invalid store url {}: {}", config.url, e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let mut pool_options = SqlitePoolOptions::new();
        if config.is_memory() {
            // Every connection to :memory: is a separate database.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            pool_options = pool_options.max_connections(config.max_connections.max(1));
        }

        let pool = pool_options.connect_with(options).await.map_err(db_err)?;

        info!(
            url = %config.url,
            max_connections = config.max_connections,
            "Opened relational store"
        );

        Ok(Self { pool, config })
    }

    /// In-memory store with schema applied.
    pub async fn in_memory() -> Result<Self> {
        let store = Self::connect(StoreConfig::in_memory()).await?;
        crate::schema::init_schema(&store).await?;
        Ok(store)
    }

    /// Returns the inner sqlx pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map a sqlx failure onto the pipeline error.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    metrics().store_errors.inc();
    error!(error = %e, "Store query failed");
    Error::database(DbErrorCode::QueryFailed, e.to_string())
}

pub(crate) fn corrupt(what: &str, detail: impl std::fmt::Display) -> Error {
    Error::database(DbErrorCode::CorruptRow, format!("{what}: {detail}"))
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt("timestamp", ms))
}

pub(crate) fn opt_from_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

pub(crate) fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| corrupt("date", format!("{s}: {e}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| corrupt("uuid", format!("{s}: {e}")))
}

pub(crate) fn parse_enum<T: FromStr<Err = Error>>(s: &str) -> Result<T> {
    s.parse::<T>().map_err(|e| corrupt("enum", e))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(what: &str, s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| corrupt(what, e))
}

pub(crate) fn u32_col(v: i64) -> u32 {
    v.clamp(0, u32::MAX as i64) as u32
}

pub(crate) fn u8_col(v: i64) -> u8 {
    v.clamp(0, u8::MAX as i64) as u8
}

/// Start of the UTC day containing `now`.
pub(crate) fn day_start_ms(now: DateTime<Utc>) -> i64 {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc().timestamp_millis())
        .unwrap_or_else(|| to_ms(now))
}
