use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalization::fields::basic_subset;
use crate::normalization::{FacilityRecord, FieldMap};

#[derive(Error, Debug)]
pub enum StoreError {
    /// The destination table lacks a column the write referenced.
    #[error("column \"{column}\" does not exist on the destination table")]
    MissingColumn { column: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Which column set a single-facility write ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Full,
    Basic,
}

/// Persistence for facility rows, keyed by `location_id`.
#[async_trait]
pub trait FacilityStore: Send + Sync {
    /// Insert-or-update every row; each row must carry `location_id` and at
    /// most one row per `location_id` may appear. Returns affected rows.
    async fn upsert_chunk(&self, rows: &[FieldMap]) -> Result<u64, StoreError>;

    async fn location_exists(&self, location_id: &str) -> Result<bool, StoreError>;

    /// Newest `updated_at` in the table, `None` when empty.
    async fn latest_update_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn upsert_record(&self, record: FacilityRecord) -> Result<u64, StoreError> {
        self.upsert_chunk(&[record.into_fields()]).await
    }

    async fn bulk_upsert_records(
        &self,
        records: Vec<FacilityRecord>,
        chunk_size: usize,
    ) -> Result<u64, StoreError> {
        let rows: Vec<FieldMap> = records
            .into_iter()
            .map(FacilityRecord::into_fields)
            .collect();
        let mut total = 0;
        for chunk in rows.chunks(chunk_size.max(1)) {
            let unique = dedupe_by_location(chunk);
            total += self.upsert_chunk(&unique).await?;
        }
        Ok(total)
    }

    async fn upsert_fields(&self, fields: &FieldMap) -> Result<u64, StoreError> {
        self.upsert_chunk(std::slice::from_ref(fields)).await
    }
}

/// Last row wins for a repeated `location_id`; first-seen order is kept.
fn dedupe_by_location(rows: &[FieldMap]) -> Vec<FieldMap> {
    let mut by_id: IndexMap<String, FieldMap> = IndexMap::new();
    for row in rows {
        let id = row
            .get("location_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        by_id.insert(id, row.clone());
    }
    by_id.into_values().collect()
}

/// Write `full`; if the table is missing one of its columns and fallback is
/// allowed, retry with the basic column subset minus every column the table
/// reports as missing.
pub async fn write_with_fallback(
    store: &dyn FacilityStore,
    full: &FieldMap,
    allow_fallback: bool,
) -> Result<UpdateType, StoreError> {
    let mut missing = match store.upsert_fields(full).await {
        Ok(_) => return Ok(UpdateType::Full),
        Err(StoreError::MissingColumn { column }) if allow_fallback => column,
        Err(e) => return Err(e),
    };
    warn!(column = %missing, "full write rejected; retrying with basic columns");

    let mut basic = basic_subset(full);
    loop {
        if missing != "location_id" {
            basic.remove(&missing);
        }
        match store.upsert_fields(&basic).await {
            Ok(_) => return Ok(UpdateType::Basic),
            // Each round removes a present column, so this terminates.
            Err(StoreError::MissingColumn { column })
                if column != "location_id" && basic.contains_key(&column) =>
            {
                warn!(column = %column, "basic write rejected; dropping column");
                missing = column;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Postgres-backed store writing through `jsonb_populate_recordset` so one
/// statement handles any column subset.
#[derive(Clone)]
pub struct PgFacilityStore {
    pool: PgPool,
    table: String,
}

impl PgFacilityStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl FacilityStore for PgFacilityStore {
    async fn upsert_chunk(&self, rows: &[FieldMap]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: IndexSet<&str> = rows
            .iter()
            .flat_map(|r| r.keys().map(String::as_str))
            .collect();
        let sql = build_upsert_sql(&self.table, &columns);
        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());

        let res = sqlx::query(&sql)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        debug!(rows = rows.len(), affected = res.rows_affected(), "upserted chunk");
        Ok(res.rows_affected())
    }

    async fn location_exists(&self, location_id: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE location_id = $1)",
            quote_ident(&self.table)
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(location_id)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(exists)
    }

    async fn latest_update_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!("SELECT max(updated_at) FROM {}", quote_ident(&self.table));
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        info!(latest = ?latest, "freshness watermark");
        Ok(latest)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn build_upsert_sql(table: &str, columns: &IndexSet<&str>) -> String {
    let table = quote_ident(table);
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sets = columns
        .iter()
        .filter(|c| **c != "location_id")
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let on_conflict = if sets.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {sets}")
    };
    format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT (location_id) {on_conflict}"
    )
}

fn classify(err: sqlx::Error) -> StoreError {
    let missing = err
        .as_database_error()
        .and_then(|db| missing_column(db.code().as_deref(), db.message()));
    match missing {
        Some(column) => StoreError::MissingColumn { column },
        None => StoreError::Database(err),
    }
}

/// Column named by an undefined-column rejection (SQLSTATE 42703 or the
/// equivalent message). Falls back to the raw message when no name is quoted.
fn missing_column(code: Option<&str>, message: &str) -> Option<String> {
    if code == Some("42703") || is_missing_column_message(message) {
        Some(extract_column(message).unwrap_or_else(|| message.to_string()))
    } else {
        None
    }
}

fn is_missing_column_message(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("column") && m.contains("does not exist")
}

fn extract_column(msg: &str) -> Option<String> {
    static COLUMN_RE: OnceLock<Option<Regex>> = OnceLock::new();
    COLUMN_RE
        .get_or_init(|| Regex::new(r#"column "?([^"\s]+)"?"#).ok())
        .as_ref()?
        .captures(msg)
        .map(|c| c[1].to_string())
}

/// In-process store used by tests and dry runs. Optionally restricted to a
/// known column set so schema drift can be reproduced.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<IndexMap<String, FieldMap>>,
    columns: Option<HashSet<String>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: &[&str]) -> Self {
        Self {
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn get(&self, location_id: &str) -> Option<FieldMap> {
        self.lock_rows().get(location_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of accepted `upsert_chunk` calls.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, IndexMap<String, FieldMap>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FacilityStore for MemoryStore {
    async fn upsert_chunk(&self, rows: &[FieldMap]) -> Result<u64, StoreError> {
        if let Some(known) = &self.columns {
            if let Some(col) = rows
                .iter()
                .flat_map(|r| r.keys())
                .find(|k| !known.contains(k.as_str()))
            {
                return Err(StoreError::MissingColumn {
                    column: col.clone(),
                });
            }
        }
        let mut table = self.lock_rows();
        for row in rows {
            let id = row
                .get("location_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            table.entry(id).or_default().extend(row.clone());
        }
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(rows.len() as u64)
    }

    async fn location_exists(&self, location_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock_rows().contains_key(location_id))
    }

    async fn latest_update_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock_rows()
            .values()
            .filter_map(|r| r.get("updated_at").and_then(Value::as_str))
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cqc::CqcLocation;
    use crate::normalization::DataProcessor;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(id: &str, name: &str) -> FacilityRecord {
        let loc: CqcLocation =
            serde_json::from_value(json!({"locationId": id, "name": name})).unwrap();
        DataProcessor::new().process_location(&loc, None, &[])
    }

    fn fields(v: Value) -> FieldMap {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn upsert_sql_targets_location_id() {
        let cols: IndexSet<&str> = ["location_id", "location_name"].into_iter().collect();
        let sql = build_upsert_sql("CQC All GPs", &cols);
        assert!(sql.starts_with(r#"INSERT INTO "CQC All GPs" ("location_id", "location_name")"#));
        assert!(sql.contains(r#"jsonb_populate_recordset(NULL::"CQC All GPs", $1)"#));
        assert!(sql.ends_with(
            r#"ON CONFLICT (location_id) DO UPDATE SET "location_name" = EXCLUDED."location_name""#
        ));

        let only_key: IndexSet<&str> = ["location_id"].into_iter().collect();
        assert!(build_upsert_sql("t", &only_key).ends_with("DO NOTHING"));
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn recognises_missing_column_messages() {
        let msg = r#"column "brand_id" of relation "CQC All GPs" does not exist"#;
        assert!(is_missing_column_message(msg));
        assert_eq!(extract_column(msg).as_deref(), Some("brand_id"));
        assert!(!is_missing_column_message("relation \"x\" does not exist"));
    }

    #[test]
    fn undefined_column_without_a_name_keeps_the_message() {
        assert_eq!(
            missing_column(Some("42703"), "undefined column in target list").as_deref(),
            Some("undefined column in target list")
        );
        assert_eq!(
            missing_column(None, r#"column "brand_id" does not exist"#).as_deref(),
            Some("brand_id")
        );
        assert_eq!(missing_column(Some("23505"), "duplicate key value"), None);
    }

    #[tokio::test]
    async fn upserting_the_same_record_twice_leaves_one_row() {
        let store = MemoryStore::new();
        store.upsert_record(record("1-1", "First")).await.unwrap();
        store.upsert_record(record("1-1", "Renamed")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("1-1").unwrap()["location_name"], "Renamed");
        assert!(store.location_exists("1-1").await.unwrap());
        assert!(!store.location_exists("1-2").await.unwrap());
    }

    #[tokio::test]
    async fn bulk_upsert_chunks_and_dedupes() {
        let store = MemoryStore::new();
        let records = vec![
            record("1-1", "a"),
            record("1-2", "b"),
            record("1-1", "a2"),
            record("1-3", "c"),
            record("1-4", "d"),
        ];
        let affected = store.bulk_upsert_records(records, 3).await.unwrap();
        // Chunk one holds 1-1 twice, collapsed to a single row.
        assert_eq!(affected, 4);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.len(), 4);
        assert_eq!(store.get("1-1").unwrap()["location_name"], "a2");
    }

    #[tokio::test]
    async fn latest_update_timestamp_is_the_max() {
        let store = MemoryStore::new();
        assert_eq!(store.latest_update_timestamp().await.unwrap(), None);
        for (id, ts) in [("1-1", "2024-01-01T00:00:00Z"), ("1-2", "2024-02-01T08:30:00Z")] {
            store
                .upsert_fields(&fields(json!({"location_id": id, "updated_at": ts})))
                .await
                .unwrap();
        }
        assert_eq!(
            store.latest_update_timestamp().await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn falls_back_to_basic_columns_when_a_column_is_missing() {
        let store = MemoryStore::with_columns(crate::normalization::fields::BASIC_COLUMNS);
        let full = fields(json!({
            "location_id": "1-9",
            "location_name": "Surgery",
            "brand_id": "BD001",
        }));

        let kind = write_with_fallback(&store, &full, true).await.unwrap();
        assert_eq!(kind, UpdateType::Basic);
        let row = store.get("1-9").unwrap();
        assert_eq!(row["location_name"], "Surgery");
        assert!(!row.contains_key("brand_id"));

        let err = write_with_fallback(&store, &full, false).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { column } if column == "brand_id"));
    }

    #[tokio::test]
    async fn basic_retry_drops_a_missing_basic_column() {
        let columns: Vec<&str> = crate::normalization::fields::BASIC_COLUMNS
            .iter()
            .copied()
            .filter(|c| *c != "overall_rating")
            .collect();
        let store = MemoryStore::with_columns(&columns);
        let full = fields(json!({
            "location_id": "1-7",
            "location_name": "Hill Surgery",
            "overall_rating": "Good",
            "provider_source": {"providerId": "1-P"},
        }));

        let kind = write_with_fallback(&store, &full, true).await.unwrap();
        assert_eq!(kind, UpdateType::Basic);
        let row = store.get("1-7").unwrap();
        assert_eq!(row["location_name"], "Hill Surgery");
        assert!(!row.contains_key("overall_rating"));
        assert_eq!(row["provider_source"]["providerId"], "1-P");
    }

    #[tokio::test]
    async fn basic_retry_peels_off_several_missing_columns() {
        let store = MemoryStore::with_columns(&["location_id", "location_name"]);
        let full = fields(json!({
            "location_id": "1-8",
            "location_name": "Dale Practice",
            "postcode": "AB1 2CD",
            "overall_rating": "Good",
        }));
        assert_eq!(
            write_with_fallback(&store, &full, true).await.unwrap(),
            UpdateType::Basic
        );
        assert_eq!(store.get("1-8").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn full_write_when_schema_has_every_column() {
        let store = MemoryStore::new();
        let full = fields(json!({"location_id": "1-9", "brand_id": "BD001"}));
        assert_eq!(
            write_with_fallback(&store, &full, true).await.unwrap(),
            UpdateType::Full
        );
        assert_eq!(serde_json::to_value(UpdateType::Basic).unwrap(), "basic");
    }
}
