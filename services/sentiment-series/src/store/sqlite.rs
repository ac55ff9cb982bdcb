//! SQLite bucket store
//!
//! Durable backend. One connection behind a mutex serves every read and
//! write of this process, so calls are serialized in-process and run on
//! tokio's blocking pool. Each upsert runs in a `BEGIN IMMEDIATE`
//! transaction, which takes the database write lock up front, so another
//! process writing the same file cannot interleave with a fold either.
//!
//! # Schema
//! ```text
//! buckets(partition, sort_key, resolution, bucket_start, open, high, low,
//!         close, count, sum, label_counts, earliest_ts, latest_ts, expires_at)
//! applied_measurements(partition, sort_key, measurement_id)
//! ```
//! Decimals are stored as TEXT to keep them exact. Applied measurement ids
//! are kept for as long as their bucket row exists. `expires_at` is Unix
//! seconds; [`SqliteBucketStore::purge_expired`] plays the role of the
//! native TTL sweeper.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, info};
use types::ids::MeasurementId;
use types::measurement::{Label, Measurement};
use types::resolution::Resolution;

use super::{
    apply_upsert, BucketItem, BucketKey, BucketStore, BucketUpsert, StoreError, UpsertOutcome,
};
use crate::bucket::Bucket;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS buckets (
    partition     TEXT NOT NULL,
    sort_key      TEXT NOT NULL,
    resolution    TEXT NOT NULL,
    bucket_start  INTEGER NOT NULL,
    open          TEXT NOT NULL,
    high          TEXT NOT NULL,
    low           TEXT NOT NULL,
    close         TEXT NOT NULL,
    count         INTEGER NOT NULL,
    sum           TEXT NOT NULL,
    label_counts  TEXT NOT NULL,
    earliest_ts   TEXT NOT NULL,
    latest_ts     TEXT NOT NULL,
    expires_at    INTEGER NOT NULL,
    PRIMARY KEY (partition, sort_key)
);
CREATE INDEX IF NOT EXISTS idx_buckets_expires_at ON buckets(expires_at);
CREATE TABLE IF NOT EXISTS applied_measurements (
    partition      TEXT NOT NULL,
    sort_key       TEXT NOT NULL,
    measurement_id TEXT NOT NULL,
    PRIMARY KEY (partition, sort_key, measurement_id)
);
";

/// SQLite backend.
pub struct SqliteBucketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBucketStore {
    /// Open (or create) a database file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(db_path.as_ref()).map_err(backend_error)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(backend_error)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(backend_error)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(backend_error)?;
        Self::init(conn, &db_path.as_ref().display().to_string())
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend_error)?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, location: &str) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend_error)?;
        info!(location, "SQLite bucket store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of measurement ids recorded against one item.
    pub async fn applied_count(&self, partition: &str, sort: &str) -> Result<usize, StoreError> {
        let partition = partition.to_string();
        let sort = sort.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM applied_measurements
                     WHERE partition = ?1 AND sort_key = ?2",
                    params![partition, sort],
                    |row| row.get(0),
                )
                .map_err(backend_error)?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    /// Delete items (and their dedup records) whose `expires_at` has passed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_secs = now.timestamp();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(backend_error)?;
            tx.execute(
                "DELETE FROM applied_measurements WHERE (partition, sort_key) IN
                 (SELECT partition, sort_key FROM buckets WHERE expires_at <= ?1)",
                params![now_secs],
            )
            .map_err(backend_error)?;
            let removed = tx
                .execute("DELETE FROM buckets WHERE expires_at <= ?1", params![now_secs])
                .map_err(backend_error)?;
            tx.commit().map_err(backend_error)?;
            if removed > 0 {
                debug!(removed, "Purged expired bucket rows");
            }
            Ok(removed)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn upsert(
        &self,
        op: &BucketUpsert,
        measurement: &Measurement,
    ) -> Result<UpsertOutcome, StoreError> {
        let op = op.clone();
        let measurement = measurement.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(backend_error)?;

            let existing = load_item(&tx, &op.key.partition, &op.key.sort)?;
            let seen = is_applied(&tx, &op.key, &op.measurement_id)?;
            let (item, outcome) = apply_upsert(existing, seen, &op, &measurement);

            if outcome != UpsertOutcome::Duplicate {
                if outcome == UpsertOutcome::Created {
                    // Replacing an expired row: its dedup records belong to the old bucket.
                    tx.execute(
                        "DELETE FROM applied_measurements WHERE partition = ?1 AND sort_key = ?2",
                        params![op.key.partition, op.key.sort],
                    )
                    .map_err(backend_error)?;
                }
                save_item(&tx, &item, &op.measurement_id)?;
            }

            tx.commit().map_err(backend_error)?;
            Ok(outcome)
        })
        .await
    }

    async fn range(
        &self,
        partition: &str,
        start_sort: &str,
        end_sort: &str,
    ) -> Result<Vec<BucketItem>, StoreError> {
        let partition = partition.to_string();
        let start_sort = start_sort.to_string();
        let end_sort = end_sort.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT sort_key FROM buckets
                     WHERE partition = ?1 AND sort_key >= ?2 AND sort_key <= ?3",
                )
                .map_err(backend_error)?;
            let keys = stmt
                .query_map(params![partition, start_sort, end_sort], |row| row.get::<_, String>(0))
                .map_err(backend_error)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(backend_error)?;

            let mut items = Vec::with_capacity(keys.len());
            for sort in keys {
                if let Some(item) = load_item(conn, &partition, &sort)? {
                    items.push(item);
                }
            }
            Ok(items)
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "SQLite"
    }
}

fn backend_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Throttled
        }
        other => StoreError::Backend(other.to_string()),
    }
}

/// Raw column values of one `buckets` row.
struct BucketRow {
    resolution: String,
    bucket_start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    count: i64,
    sum: String,
    label_counts: String,
    earliest_ts: String,
    latest_ts: String,
    expires_at: i64,
}

fn load_item(conn: &Connection, partition: &str, sort: &str) -> Result<Option<BucketItem>, StoreError> {
    let row = conn
        .query_row(
            "SELECT resolution, bucket_start, open, high, low, close, count, sum,
                    label_counts, earliest_ts, latest_ts, expires_at
             FROM buckets WHERE partition = ?1 AND sort_key = ?2",
            params![partition, sort],
            |row| {
                Ok(BucketRow {
                    resolution: row.get(0)?,
                    bucket_start: row.get(1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    count: row.get(6)?,
                    sum: row.get(7)?,
                    label_counts: row.get(8)?,
                    earliest_ts: row.get(9)?,
                    latest_ts: row.get(10)?,
                    expires_at: row.get(11)?,
                })
            },
        )
        .optional()
        .map_err(backend_error)?;

    let Some(row) = row else {
        return Ok(None);
    };
    decode_row(partition, sort, row).map(Some)
}

fn is_applied(conn: &Connection, key: &BucketKey, id: &MeasurementId) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT 1 FROM applied_measurements
         WHERE partition = ?1 AND sort_key = ?2 AND measurement_id = ?3",
        params![key.partition, key.sort, id.to_string()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(backend_error)
}

fn decode_row(
    partition: &str,
    sort: &str,
    row: BucketRow,
) -> Result<BucketItem, StoreError> {
    let decimal = |field: &str, raw: &str| {
        Decimal::from_str(raw).map_err(|e| corrupt(partition, sort, &format!("{field}: {e}")))
    };
    let instant = |field: &str, raw: &str| {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(partition, sort, &format!("{field}: {e}")))
    };
    let unix = |field: &str, secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| corrupt(partition, sort, &format!("{field} out of range: {secs}")))
    };

    let resolution = Resolution::from_str(&row.resolution)
        .map_err(|e| corrupt(partition, sort, &e.to_string()))?;
    let label_counts: BTreeMap<Label, u64> = serde_json::from_str(&row.label_counts)
        .map_err(|e| corrupt(partition, sort, &format!("label_counts: {e}")))?;
    let count = u64::try_from(row.count)
        .map_err(|_| corrupt(partition, sort, &format!("negative count {}", row.count)))?;

    Ok(BucketItem {
        key: BucketKey {
            partition: partition.to_string(),
            sort: sort.to_string(),
        },
        resolution,
        bucket_start: unix("bucket_start", row.bucket_start)?,
        bucket: Bucket {
            open: decimal("open", &row.open)?,
            high: decimal("high", &row.high)?,
            low: decimal("low", &row.low)?,
            close: decimal("close", &row.close)?,
            count,
            sum: decimal("sum", &row.sum)?,
            label_counts,
            earliest_timestamp_seen: instant("earliest_ts", &row.earliest_ts)?,
            latest_timestamp_seen: instant("latest_ts", &row.latest_ts)?,
        },
        expires_at: unix("expires_at", row.expires_at)?,
    })
}

fn save_item(
    conn: &Connection,
    item: &BucketItem,
    applied_id: &MeasurementId,
) -> Result<(), StoreError> {
    let b = &item.bucket;
    let label_counts = serde_json::to_string(&b.label_counts)
        .map_err(|e| StoreError::Backend(format!("label_counts encode: {e}")))?;
    let count = i64::try_from(b.count)
        .map_err(|_| StoreError::Backend(format!("count overflow: {}", b.count)))?;

    conn.execute(
        "INSERT INTO buckets (partition, sort_key, resolution, bucket_start, open, high, low,
                              close, count, sum, label_counts, earliest_ts, latest_ts, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT (partition, sort_key) DO UPDATE SET
             open = excluded.open, high = excluded.high, low = excluded.low,
             close = excluded.close, count = excluded.count, sum = excluded.sum,
             label_counts = excluded.label_counts, earliest_ts = excluded.earliest_ts,
             latest_ts = excluded.latest_ts, expires_at = excluded.expires_at",
        params![
            item.key.partition,
            item.key.sort,
            item.resolution.as_str(),
            item.bucket_start.timestamp(),
            b.open.to_string(),
            b.high.to_string(),
            b.low.to_string(),
            b.close.to_string(),
            count,
            b.sum.to_string(),
            label_counts,
            b.earliest_timestamp_seen.to_rfc3339_opts(SecondsFormat::Nanos, true),
            b.latest_timestamp_seen.to_rfc3339_opts(SecondsFormat::Nanos, true),
            item.expires_at.timestamp(),
        ],
    )
    .map_err(backend_error)?;

    conn.execute(
        "INSERT OR IGNORE INTO applied_measurements (partition, sort_key, measurement_id)
         VALUES (?1, ?2, ?3)",
        params![item.key.partition, item.key.sort, applied_id.to_string()],
    )
    .map_err(backend_error)?;

    Ok(())
}

fn corrupt(partition: &str, sort: &str, detail: &str) -> StoreError {
    StoreError::Corrupt(format!("{partition}/{sort}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use types::ids::Ticker;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    fn upsert_op(value: Decimal, ts: DateTime<Utc>, written_at: DateTime<Utc>) -> (BucketUpsert, Measurement) {
        let m = Measurement::from_decimal(Ticker::new("AAPL"), value, Label::Positive, ts, "sqlite").unwrap();
        let start = align::floor_to_bucket(ts, Resolution::H1);
        let op = BucketUpsert {
            key: BucketKey::new(m.ticker(), Resolution::H1, start),
            resolution: Resolution::H1,
            bucket_start: start,
            measurement_id: m.id(),
            written_at,
            expires_at: written_at + Duration::days(7),
        };
        (op, m)
    }

    #[tokio::test]
    async fn test_sqlite_upsert_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SqliteBucketStore::open(dir.path().join("buckets.db")).unwrap();

        for (minute, value) in [(5, dec!(0.6)), (10, dec!(0.9)), (15, dec!(0.3)), (20, dec!(0.7))] {
            let (op, m) = upsert_op(value, at(10, minute), at(10, minute));
            store.upsert(&op, &m).await.unwrap();
        }

        let items = store
            .range("AAPL#1h", "2024-01-02T10:00:00Z", "2024-01-02T10:00:00Z")
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        let b = &items[0].bucket;
        assert_eq!(b.open, dec!(0.6));
        assert_eq!(b.high, dec!(0.9));
        assert_eq!(b.low, dec!(0.3));
        assert_eq!(b.close, dec!(0.7));
        assert_eq!(b.avg(), dec!(0.625));
        assert_eq!(b.label_count(Label::Positive), 4);
        assert_eq!(
            store.applied_count("AAPL#1h", "2024-01-02T10:00:00Z").await.unwrap(),
            4
        );
        assert_eq!(items[0].bucket_start, at(10, 0));
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_is_noop() {
        let store = SqliteBucketStore::open_in_memory().unwrap();
        let (op, m) = upsert_op(dec!(0.4), at(10, 5), at(10, 5));

        assert_eq!(store.upsert(&op, &m).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert(&op, &m).await.unwrap(), UpsertOutcome::Duplicate);

        let items = store.range("AAPL#1h", "0", "9").await.unwrap();
        assert_eq!(items[0].bucket.count, 1);
    }

    #[tokio::test]
    async fn test_sqlite_redelivery_detected_after_many_writes() {
        let store = SqliteBucketStore::open_in_memory().unwrap();
        let (first_op, first) = upsert_op(dec!(0.5), at(10, 0), at(10, 0));
        store.upsert(&first_op, &first).await.unwrap();
        for second in 1..=300i64 {
            let ts = at(10, 0) + Duration::seconds(second * 10);
            let (op, m) = upsert_op(dec!(0.25), ts, ts);
            assert_eq!(store.upsert(&op, &m).await.unwrap(), UpsertOutcome::Updated);
        }

        assert_eq!(store.upsert(&first_op, &first).await.unwrap(), UpsertOutcome::Duplicate);
        let items = store.range("AAPL#1h", "0", "9").await.unwrap();
        assert_eq!(items[0].bucket.count, 301);
        assert_eq!(
            store.applied_count("AAPL#1h", "2024-01-02T10:00:00Z").await.unwrap(),
            301
        );
    }

    #[tokio::test]
    async fn test_sqlite_expired_replacement_resets_applied_ids() {
        let store = SqliteBucketStore::open_in_memory().unwrap();
        let (op, m) = upsert_op(dec!(0.5), at(10, 0), at(10, 0));
        store.upsert(&op, &m).await.unwrap();

        let (late_op, late) = upsert_op(dec!(0.1), at(10, 50), at(10, 0) + Duration::days(8));
        assert_eq!(store.upsert(&late_op, &late).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(
            store.applied_count("AAPL#1h", "2024-01-02T10:00:00Z").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_sqlite_purge_expired() {
        let store = SqliteBucketStore::open_in_memory().unwrap();
        let (op, m) = upsert_op(dec!(0.5), at(10, 0), at(10, 0));
        store.upsert(&op, &m).await.unwrap();

        assert_eq!(store.purge_expired(at(10, 0) + Duration::days(6)).await.unwrap(), 0);
        assert_eq!(store.purge_expired(at(10, 0) + Duration::days(7)).await.unwrap(), 1);
        assert!(store.range("AAPL#1h", "0", "9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_writers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteBucketStore::open(dir.path().join("c.db")).unwrap());

        let mut handles = Vec::new();
        for minute in 0..20u32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let (op, m) = upsert_op(Decimal::new(i64::from(minute), 2), at(10, minute), at(10, 30));
                store.upsert(&op, &m).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let items = store.range("AAPL#1h", "0", "9").await.unwrap();
        let b = &items[0].bucket;
        assert_eq!(b.count, 20);
        assert_eq!(b.open, dec!(0.00));
        assert_eq!(b.close, dec!(0.19));
        assert!(b.is_valid());
    }
}
