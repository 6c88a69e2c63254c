//! Raw event archive queries.

use chrono::{DateTime, Utc};
use pipeline_core::{DateRange, ProcessingStatus, RawEvent, RequestMetadata, Result};
use sqlx::FromRow;
use uuid::Uuid;

use crate::client::{
    date_str, db_err, from_json, from_ms, opt_from_ms, parse_date, parse_enum, parse_uuid, to_json,
    to_ms, Store,
};

const RAW_COLUMNS: &str = "id, source, raw_data, request_metadata, processing_status, \
     date_from, date_to, batch_id, fetched_at, error, processed_at";

/// Raw events overlapping a date range: by declared range when present, else by
/// fetch date, plus any raw whose normalized session falls in the range.
const RANGE_FILTER: &str = "((date_from IS NOT NULL AND date_from <= ?2 AND date_to >= ?1) \
     OR (date_from IS NULL AND fetched_date BETWEEN ?1 AND ?2) \
     OR id IN (SELECT raw_event_id FROM normalized_events WHERE event_date BETWEEN ?1 AND ?2))";

#[derive(Debug, FromRow)]
struct RawEventRow {
    id: String,
    source: String,
    raw_data: Vec<u8>,
    request_metadata: String,
    processing_status: String,
    date_from: Option<String>,
    date_to: Option<String>,
    batch_id: Option<String>,
    fetched_at: i64,
    error: Option<String>,
    processed_at: Option<i64>,
}

impl TryFrom<RawEventRow> for RawEvent {
    type Error = pipeline_core::Error;

    fn try_from(row: RawEventRow) -> Result<Self> {
        let date_range = match (row.date_from, row.date_to) {
            (Some(from), Some(to)) => Some(DateRange {
                date_from: parse_date(&from)?,
                date_to: parse_date(&to)?,
            }),
            _ => None,
        };
        Ok(RawEvent {
            id: parse_uuid(&row.id)?,
            source: row.source,
            raw_data: row.raw_data,
            request_metadata: from_json::<RequestMetadata>("request_metadata", &row.request_metadata)?,
            status: parse_enum(&row.processing_status)?,
            date_range,
            batch_id: row.batch_id,
            fetched_at: from_ms(row.fetched_at)?,
            error: row.error,
            processed_at: opt_from_ms(row.processed_at)?,
        })
    }
}

/// Raw event counts per source and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatusCount {
    pub source: String,
    pub status: ProcessingStatus,
    pub count: u64,
}

impl Store {
    /// Append a raw event. The payload text is stored as given.
    pub async fn insert_raw_event(&self, event: &RawEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_events
                (id, source, raw_data, request_metadata, processing_status,
                 date_from, date_to, batch_id, fetched_at, fetched_date, error, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.source)
        .bind(&event.raw_data)
        .bind(to_json(&event.request_metadata)?)
        .bind(event.status.as_str())
        .bind(event.date_range.map(|r| date_str(r.date_from)))
        .bind(event.date_range.map(|r| date_str(r.date_to)))
        .bind(&event.batch_id)
        .bind(to_ms(event.fetched_at))
        .bind(date_str(event.fetched_at.date_naive()))
        .bind(&event.error)
        .bind(event.processed_at.map(to_ms))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_raw_event(&self, id: Uuid) -> Result<Option<RawEvent>> {
        let row = sqlx::query_as::<_, RawEventRow>(&format!(
            "SELECT {RAW_COLUMNS} FROM raw_events WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(RawEvent::try_from).transpose()
    }

    /// The only mutation on a raw event: status, error and processed_at.
    ///
    /// Returns false when the id does not exist.
    pub async fn mark_raw_processed(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let processed_at = (status != ProcessingStatus::Pending).then(|| to_ms(now));
        let result = sqlx::query(
            "UPDATE raw_events SET processing_status = ?, error = ?, processed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(processed_at)
        .bind(id.to_string())
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Oldest pending raw events first.
    pub async fn pending_raw_ids(&self, limit: u32) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM raw_events WHERE processing_status = 'pending' \
             ORDER BY fetched_at ASC, rowid ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    /// Raw events in a range with one of the given statuses.
    pub async fn raw_ids_in_range(
        &self,
        range: DateRange,
        status: ProcessingStatus,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT id FROM raw_events WHERE {RANGE_FILTER} AND processing_status = ?3 \
             ORDER BY fetched_at ASC, rowid ASC"
        ))
        .bind(date_str(range.date_from))
        .bind(date_str(range.date_to))
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    /// Status counts per source for a range.
    pub async fn raw_status_by_source(&self, range: DateRange) -> Result<Vec<SourceStatusCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(&format!(
            "SELECT source, processing_status, COUNT(*) FROM raw_events WHERE {RANGE_FILTER} \
             GROUP BY source, processing_status ORDER BY source, processing_status"
        ))
        .bind(date_str(range.date_from))
        .bind(date_str(range.date_to))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(source, status, count)| {
                Ok(SourceStatusCount {
                    source,
                    status: parse_enum(&status)?,
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw(source: &str, payload: &str, fetched_at: DateTime<Utc>) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            source: source.into(),
            raw_data: payload.into(),
            request_metadata: RequestMetadata::default(),
            status: ProcessingStatus::Pending,
            date_range: None,
            batch_id: None,
            fetched_at,
            error: None,
            processed_at: None,
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_insert_and_mark_processed() {
        let store = Store::in_memory().await.unwrap();
        let event = raw("X", "not even json", ts("2024-03-01T10:00:00Z"));
        store.insert_raw_event(&event).await.unwrap();

        let loaded = store.get_raw_event(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.raw_data, b"not even json");
        assert_eq!(loaded.status, ProcessingStatus::Pending);
        assert_eq!(store.pending_raw_ids(10).await.unwrap(), vec![event.id]);

        let now = ts("2024-03-01T10:05:00Z");
        assert!(store
            .mark_raw_processed(event.id, ProcessingStatus::Failed, Some("[NORM_001] bad"), now)
            .await
            .unwrap());
        let loaded = store.get_raw_event(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ProcessingStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("[NORM_001] bad"));
        assert_eq!(loaded.processed_at, Some(now));
        assert!(store.pending_raw_ids(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_bytes_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let mut event = raw("X", "", ts("2024-03-01T10:00:00Z"));
        event.raw_data = vec![0xff, 0xfe, b'{', 0x00, 0xc3, 0x28];
        store.insert_raw_event(&event).await.unwrap();

        let loaded = store.get_raw_event(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.raw_data, vec![0xff, 0xfe, b'{', 0x00, 0xc3, 0x28]);
    }

    #[tokio::test]
    async fn test_payload_is_immutable_and_undeletable() {
        let store = Store::in_memory().await.unwrap();
        let event = raw("X", "{}", ts("2024-03-01T10:00:00Z"));
        store.insert_raw_event(&event).await.unwrap();

        let update = sqlx::query("UPDATE raw_events SET raw_data = 'x' WHERE id = ?")
            .bind(event.id.to_string())
            .execute(store.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM raw_events")
            .execute(store.pool())
            .await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn test_range_queries_use_declared_range_or_fetch_date() {
        let store = Store::in_memory().await.unwrap();
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();

        let by_fetch = raw("metrika", "{}", ts("2024-03-02T08:00:00Z"));
        let mut declared = raw("ga4", "{}", ts("2024-03-10T08:00:00Z"));
        declared.date_range = Some(DateRange::new(d("2024-03-01"), d("2024-03-03")).unwrap());
        let outside = raw("ga4", "{}", ts("2024-03-20T08:00:00Z"));
        for e in [&by_fetch, &declared, &outside] {
            store.insert_raw_event(e).await.unwrap();
        }

        let range = DateRange::day(d("2024-03-02"));
        let pending = store
            .raw_ids_in_range(range, ProcessingStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending, vec![by_fetch.id, declared.id]);

        let counts = store.raw_status_by_source(range).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert!(counts.iter().all(|c| c.count == 1));
    }
}
