//! Partitioned bucket storage
//!
//! Items are addressed by a partition key `"{ticker}#{resolution}"` and a
//! sort key (the bucket start as fixed-width ISO-8601). Every item carries
//! an `expires_at` consumed by the backend's expiry mechanism.
//!
//! A backend must apply each upsert atomically per key: concurrent
//! upserts into the same bucket are serialized by the store, never by
//! the caller.

pub mod memory;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use types::ids::{MeasurementId, Ticker};
use types::measurement::Measurement;
use types::resolution::Resolution;

use crate::align;
use crate::bucket::{fold, Bucket};

pub use memory::MemoryBucketStore;
pub use sqlite::SqliteBucketStore;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store throttled the request")]
    Throttled,

    #[error("store request timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt item: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Throttled | StoreError::Timeout | StoreError::Unavailable(_)
        )
    }
}

/// Primary key of a bucket item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    /// `"{ticker}#{resolution}"`
    pub partition: String,
    /// ISO-8601 bucket start
    pub sort: String,
}

impl BucketKey {
    pub fn new(ticker: &Ticker, resolution: Resolution, bucket_start: DateTime<Utc>) -> Self {
        Self {
            partition: partition_key(ticker, resolution),
            sort: align::sort_key(bucket_start),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort)
    }
}

/// Partition key for one ticker at one resolution.
pub fn partition_key(ticker: &Ticker, resolution: Resolution) -> String {
    format!("{ticker}#{resolution}")
}

/// One resolution-scoped write derived from a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketUpsert {
    pub key: BucketKey,
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
    /// Idempotency key of the measurement being folded
    pub measurement_id: MeasurementId,
    /// Wall-clock time of the write
    pub written_at: DateTime<Utc>,
    /// `written_at` plus the resolution's retention
    pub expires_at: DateTime<Utc>,
}

/// What an upsert did to the stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No live item existed; a new bucket was written.
    Created,
    /// The measurement was folded into an existing bucket.
    Updated,
    /// The measurement had already been applied; nothing changed.
    Duplicate,
}

/// A stored bucket with its storage metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketItem {
    pub key: BucketKey,
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
    pub bucket: Bucket,
    pub expires_at: DateTime<Utc>,
}

impl BucketItem {
    /// Whether the item is past its logical expiration at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fold an upsert into the current item under the caller's per-key lock.
///
/// `already_applied` tells whether `op.measurement_id` is recorded against
/// `existing`. Backends keep that record for the whole life of the item,
/// so a redelivery is recognised no matter how many writes came between.
///
/// An item that is already logically expired is replaced rather than
/// extended, so stale data never leaks into a fresh bucket. On
/// [`UpsertOutcome::Created`] the caller must drop the old item's applied
/// ids before recording the new one.
pub(crate) fn apply_upsert(
    existing: Option<BucketItem>,
    already_applied: bool,
    op: &BucketUpsert,
    measurement: &Measurement,
) -> (BucketItem, UpsertOutcome) {
    let live = existing.filter(|item| !item.is_expired(op.written_at));

    match live {
        Some(item) if already_applied => (item, UpsertOutcome::Duplicate),
        Some(mut item) => {
            item.bucket.update(measurement);
            item.expires_at = op.expires_at;
            (item, UpsertOutcome::Updated)
        }
        None => {
            let item = BucketItem {
                key: op.key.clone(),
                resolution: op.resolution,
                bucket_start: op.bucket_start,
                bucket: fold(None, measurement),
                expires_at: op.expires_at,
            };
            (item, UpsertOutcome::Created)
        }
    }
}

/// Backend trait for partitioned bucket storage.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically fold `measurement` into the bucket addressed by `op.key`.
    async fn upsert(
        &self,
        op: &BucketUpsert,
        measurement: &Measurement,
    ) -> Result<UpsertOutcome, StoreError>;

    /// All items of `partition` whose sort key lies in `[start_sort, end_sort]`.
    ///
    /// Order is unspecified.
    async fn range(
        &self,
        partition: &str,
        start_sort: &str,
        end_sort: &str,
    ) -> Result<Vec<BucketItem>, StoreError>;

    /// Backend type for logging
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use types::measurement::Label;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    fn measurement(value: f64, ts: DateTime<Utc>) -> Measurement {
        Measurement::new(Ticker::new("AAPL"), value, Label::Positive, ts, "unit").unwrap()
    }

    fn op_for(m: &Measurement, written_at: DateTime<Utc>) -> BucketUpsert {
        let start = align::floor_to_bucket(m.timestamp(), Resolution::H1);
        BucketUpsert {
            key: BucketKey::new(m.ticker(), Resolution::H1, start),
            resolution: Resolution::H1,
            bucket_start: start,
            measurement_id: m.id(),
            written_at,
            expires_at: written_at + Duration::days(7),
        }
    }

    #[test]
    fn test_partition_key_format() {
        assert_eq!(partition_key(&Ticker::new("AAPL"), Resolution::M5), "AAPL#5m");
        let key = BucketKey::new(&Ticker::new("AAPL"), Resolution::H1, at(10, 0));
        assert_eq!(key.to_string(), "AAPL#1h/2024-01-02T10:00:00Z");
    }

    #[test]
    fn test_apply_upsert_create_update_duplicate() {
        let first = measurement(0.4, at(10, 5));
        let second = measurement(0.6, at(10, 10));

        let (item, outcome) = apply_upsert(None, false, &op_for(&first, at(10, 5)), &first);
        assert_eq!(outcome, UpsertOutcome::Created);

        let (item, outcome) =
            apply_upsert(Some(item), false, &op_for(&second, at(10, 10)), &second);
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(item.bucket.count, 2);
        assert_eq!(item.expires_at, at(10, 10) + Duration::days(7));

        let (item, outcome) = apply_upsert(Some(item), true, &op_for(&second, at(10, 11)), &second);
        assert_eq!(outcome, UpsertOutcome::Duplicate);
        assert_eq!(item.bucket.count, 2);
        assert_eq!(item.expires_at, at(10, 10) + Duration::days(7));
    }

    #[test]
    fn test_apply_upsert_replaces_expired_item() {
        let old = measurement(0.9, at(10, 5));
        let (mut item, _) = apply_upsert(None, false, &op_for(&old, at(10, 5)), &old);
        item.expires_at = at(10, 6);

        // Even a recorded id does not resurrect an expired bucket.
        let late = measurement(0.1, at(10, 30));
        let (item, outcome) = apply_upsert(Some(item), true, &op_for(&late, at(10, 30)), &late);
        assert_eq!(outcome, UpsertOutcome::Created);
        assert_eq!(item.bucket.count, 1);
        assert_eq!(item.bucket.high, late.value());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Throttled.is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::Backend("constraint".into()).is_transient());
        assert!(!StoreError::Corrupt("bad".into()).is_transient());
    }
}
