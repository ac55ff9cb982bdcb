//! Range query service
//!
//! Reads one `(ticker, resolution)` partition over a time range and
//! returns the buckets in ascending `bucket_start` order whatever order
//! the store produced them in. "Live" is computed at read time from the
//! caller's clock; it is never stored.
//!
//! Items past their logical `expires_at` are dropped here even when the
//! backend has not physically removed them yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;
use types::ids::Ticker;
use types::measurement::Label;
use types::resolution::Resolution;

use crate::align;
use crate::config::EngineConfig;
use crate::metrics::FanoutMetrics;
use crate::retry::retry;
use crate::store::{partition_key, BucketItem, BucketStore, StoreError};

/// Query errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One bucket as returned to dashboard consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketView {
    #[serde(serialize_with = "serialize_bucket_start")]
    pub bucket_start: DateTime<Utc>,
    pub resolution: Resolution,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg: Decimal,
    pub count: u64,
    pub label_counts: BTreeMap<Label, u64>,
    /// Whether the window contains the query's "now"
    pub is_partial: bool,
    /// Elapsed share of the window; 100 for closed buckets
    pub progress_pct: f64,
}

impl BucketView {
    fn from_item(item: BucketItem, now: DateTime<Utc>) -> Self {
        let is_partial = align::contains(item.bucket_start, item.resolution, now);
        let progress_pct = if is_partial {
            align::progress(now, item.bucket_start, item.resolution)
        } else {
            100.0
        };
        let avg = item.bucket.avg();
        Self {
            bucket_start: item.bucket_start,
            resolution: item.resolution,
            open: item.bucket.open,
            high: item.bucket.high,
            low: item.bucket.low,
            close: item.bucket.close,
            avg,
            count: item.bucket.count,
            label_counts: item.bucket.label_counts,
            is_partial,
            progress_pct,
        }
    }
}

fn serialize_bucket_start<S: Serializer>(start: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&align::sort_key(*start))
}

/// Serves ordered bucket ranges from a [`BucketStore`].
pub struct RangeQueryService<S> {
    store: Arc<S>,
    config: EngineConfig,
    metrics: Arc<FanoutMetrics>,
}

impl<S: BucketStore> RangeQueryService<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(FanoutMetrics::new()))
    }

    pub fn with_metrics(store: Arc<S>, config: EngineConfig, metrics: Arc<FanoutMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<FanoutMetrics> {
        &self.metrics
    }

    /// Buckets of `(ticker, resolution)` starting within `[start, end]`,
    /// annotated against the current wall clock.
    pub async fn query(
        &self,
        ticker: &Ticker,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BucketView>, QueryError> {
        self.query_at(ticker, resolution, start, end, Utc::now()).await
    }

    /// Same as [`Self::query`] with an explicit "now".
    ///
    /// An empty range is a normal result. `start > end` is rejected.
    pub async fn query_at(
        &self,
        ticker: &Ticker,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BucketView>, QueryError> {
        if start > end {
            return Err(QueryError::InvalidRange { start, end });
        }

        let partition = partition_key(ticker, resolution);
        let start_sort = align::clamped_sort_key(start);
        let end_sort = align::clamped_sort_key(end);

        let (partition_ref, start_ref, end_ref) = (&partition, &start_sort, &end_sort);
        let retried = retry(&self.config.retry, &partition, move || {
            self.store.range(partition_ref, start_ref, end_ref)
        })
        .await;
        let read_retries = u64::from(retried.retries());
        let items = match retried.result {
            Ok(items) => items,
            Err(err) => {
                self.metrics.record_query(read_retries, 0);
                return Err(err.into());
            }
        };

        let scanned = items.len();
        let mut expired = 0u64;
        let mut live: Vec<BucketItem> = Vec::with_capacity(scanned);
        for item in items {
            // Sort keys drop sub-seconds, so re-check the exact bounds.
            if item.bucket_start < start || item.bucket_start > end {
                continue;
            }
            if item.is_expired(now) {
                expired += 1;
                continue;
            }
            live.push(item);
        }
        live.sort_by_key(|item| item.bucket_start);
        live.dedup_by_key(|item| item.bucket_start);

        self.metrics.record_query(read_retries, expired);
        debug!(
            partition = %partition,
            scanned,
            expired,
            returned = live.len(),
            "Range query served"
        );

        Ok(live
            .into_iter()
            .map(|item| BucketView::from_item(item, now))
            .collect())
    }

    /// The live bucket of `(ticker, resolution)` at `now`, if any
    /// measurement has landed in it yet.
    pub async fn latest_at(
        &self,
        ticker: &Ticker,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<BucketView>, QueryError> {
        let current = align::floor_to_bucket(now, resolution);
        let mut views = self
            .query_at(ticker, resolution, current, now, now)
            .await?;
        Ok(views.pop().filter(|view| view.is_partial))
    }
}
