//! Normalized event queries.

use chrono::NaiveDate;
use pipeline_core::{DateRange, Device, Geo, Hit, NormalizedEvent, Result, Utm};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use uuid::Uuid;

use crate::client::{
    date_str, db_err, from_json, from_ms, parse_date, parse_enum, parse_uuid, to_json, to_ms,
    u32_col, Store,
};

const NORMALIZED_COLUMNS: &str = "id, raw_event_id, source, session_id, user_id, client_id, \
     occurred_at, event_date, url, referrer, utm_source, utm_medium, utm_campaign, utm_content, \
     utm_term, traffic_source_type, device_type, browser, os, country, region, city, page_views, \
     raw_visit_duration, is_bounce, hits, goals_reached, created_at";

#[derive(Debug, FromRow)]
struct NormalizedRow {
    id: String,
    raw_event_id: String,
    source: String,
    session_id: String,
    user_id: Option<String>,
    client_id: Option<String>,
    occurred_at: i64,
    event_date: String,
    url: Option<String>,
    referrer: Option<String>,
    utm_source: Option<String>,
    utm_medium: Option<String>,
    utm_campaign: Option<String>,
    utm_content: Option<String>,
    utm_term: Option<String>,
    traffic_source_type: String,
    device_type: Option<String>,
    browser: Option<String>,
    os: Option<String>,
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    page_views: i64,
    raw_visit_duration: Option<f64>,
    is_bounce: bool,
    hits: String,
    goals_reached: String,
    created_at: i64,
}

impl TryFrom<NormalizedRow> for NormalizedEvent {
    type Error = pipeline_core::Error;

    fn try_from(row: NormalizedRow) -> Result<Self> {
        Ok(NormalizedEvent {
            id: parse_uuid(&row.id)?,
            raw_event_id: parse_uuid(&row.raw_event_id)?,
            source: row.source,
            session_id: row.session_id,
            user_id: row.user_id,
            client_id: row.client_id,
            occurred_at: from_ms(row.occurred_at)?,
            event_date: parse_date(&row.event_date)?,
            url: row.url,
            referrer: row.referrer,
            utm: Utm {
                source: row.utm_source,
                medium: row.utm_medium,
                campaign: row.utm_campaign,
                content: row.utm_content,
                term: row.utm_term,
            },
            traffic_source_type: parse_enum(&row.traffic_source_type)?,
            device: Device {
                device_type: row.device_type,
                browser: row.browser,
                os: row.os,
            },
            geo: Geo {
                country: row.country,
                region: row.region,
                city: row.city,
            },
            page_views: u32_col(row.page_views),
            raw_visit_duration: row.raw_visit_duration,
            is_bounce: row.is_bounce,
            hits: from_json::<Vec<Hit>>("hits", &row.hits)?,
            goals: from_json::<Vec<String>>("goals_reached", &row.goals_reached)?,
            created_at: from_ms(row.created_at)?,
        })
    }
}

impl Store {
    /// Insert a normalized event unless one already exists for its raw event.
    ///
    /// Returns the stored row and whether it was created by this call.
    pub async fn insert_normalized_event(
        &self,
        event: &NormalizedEvent,
    ) -> Result<(NormalizedEvent, bool)> {
        let result = sqlx::query(&format!(
            "INSERT INTO normalized_events ({NORMALIZED_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (raw_event_id) DO NOTHING"
        ))
        .bind(event.id.to_string())
        .bind(event.raw_event_id.to_string())
        .bind(&event.source)
        .bind(&event.session_id)
        .bind(&event.user_id)
        .bind(&event.client_id)
        .bind(to_ms(event.occurred_at))
        .bind(date_str(event.event_date))
        .bind(&event.url)
        .bind(&event.referrer)
        .bind(&event.utm.source)
        .bind(&event.utm.medium)
        .bind(&event.utm.campaign)
        .bind(&event.utm.content)
        .bind(&event.utm.term)
        .bind(event.traffic_source_type.as_str())
        .bind(&event.device.device_type)
        .bind(&event.device.browser)
        .bind(&event.device.os)
        .bind(&event.geo.country)
        .bind(&event.geo.region)
        .bind(&event.geo.city)
        .bind(event.page_views as i64)
        .bind(event.raw_visit_duration)
        .bind(event.is_bounce)
        .bind(to_json(&event.hits)?)
        .bind(to_json(&event.goals)?)
        .bind(to_ms(event.created_at))
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok((event.clone(), true));
        }

        let existing = self
            .get_normalized_by_raw(event.raw_event_id)
            .await?
            .ok_or_else(|| {
                pipeline_core::Error::internal(format!(
                    "normalized event for raw {} vanished after conflict",
                    event.raw_event_id
                ))
            })?;
        Ok((existing, false))
    }

    /// Fill identifiers that are still NULL. Never overwrites a known identifier.
    ///
    /// Returns true when a column changed.
    pub async fn attach_identifiers(
        &self,
        id: Uuid,
        user_id: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE normalized_events
            SET user_id = COALESCE(user_id, ?1),
                client_id = COALESCE(client_id, ?2)
            WHERE id = ?3
              AND ((user_id IS NULL AND ?1 IS NOT NULL) OR (client_id IS NULL AND ?2 IS NOT NULL))
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .bind(id.to_string())
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_normalized_event(&self, id: Uuid) -> Result<Option<NormalizedEvent>> {
        let row = sqlx::query_as::<_, NormalizedRow>(&format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_events WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(NormalizedEvent::try_from).transpose()
    }

    pub async fn get_normalized_by_raw(&self, raw_event_id: Uuid) -> Result<Option<NormalizedEvent>> {
        let row = sqlx::query_as::<_, NormalizedRow>(&format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_events WHERE raw_event_id = ?"
        ))
        .bind(raw_event_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(NormalizedEvent::try_from).transpose()
    }

    /// Load events by id, ordered by (occurred_at, id). Unknown ids are skipped.
    pub async fn normalized_events_by_ids(&self, ids: &[Uuid]) -> Result<Vec<NormalizedEvent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_events WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(") ORDER BY occurred_at ASC, id ASC");

        let rows = builder
            .build_query_as::<NormalizedRow>()
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.into_iter().map(NormalizedEvent::try_from).collect()
    }

    /// All events of one date, optionally restricted to a set of source names.
    pub async fn normalized_events_for_date(
        &self,
        date: NaiveDate,
        sources: Option<&[String]>,
    ) -> Result<Vec<NormalizedEvent>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_events WHERE event_date = "
        ));
        builder.push_bind(date_str(date));
        if let Some(sources) = sources {
            if sources.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND source IN (");
            let mut separated = builder.separated(", ");
            for source in sources {
                separated.push_bind(source.clone());
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY occurred_at ASC, id ASC");

        let rows = builder
            .build_query_as::<NormalizedRow>()
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.into_iter().map(NormalizedEvent::try_from).collect()
    }

    /// Ids of events whose event_date falls in the range.
    pub async fn normalized_ids_in_range(&self, range: DateRange) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM normalized_events WHERE event_date BETWEEN ? AND ? \
             ORDER BY occurred_at ASC, id ASC",
        )
        .bind(date_str(range.date_from))
        .bind(date_str(range.date_to))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    /// Normalized event ids produced from the given raw events.
    pub async fn normalized_ids_for_raw(&self, raw_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        if raw_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM normalized_events WHERE raw_event_id IN (");
        let mut separated = builder.separated(", ");
        for id in raw_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(") ORDER BY occurred_at ASC, id ASC");

        let ids: Vec<String> = builder
            .build_query_scalar::<String>()
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    /// Distinct event dates among the given normalized events.
    pub async fn event_dates_for(&self, ids: &[Uuid]) -> Result<Vec<NaiveDate>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT DISTINCT event_date FROM normalized_events WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(") ORDER BY event_date ASC");

        let dates: Vec<String> = builder
            .build_query_scalar::<String>()
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        dates.iter().map(|d| parse_date(d)).collect()
    }
}
