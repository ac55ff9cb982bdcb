//! Fanout writer
//!
//! Turns one measurement into eight resolution-scoped bucket upserts and
//! applies them concurrently. Each upsert runs under its own retry budget;
//! a slow or failing resolution never cancels or blocks the others.
//!
//! # Flow
//! ```text
//!            Measurement
//!                 │
//!           plan(m, now)          8 × BucketUpsert (key, start, expires_at)
//!                 │
//!   ┌────┬────┬───┴┬────┬────┬────┬────┐
//!  1m   5m  10m   1h   3h   6h  12h  24h   retry(upsert) each, joined
//!   └────┴────┴───┬┴────┴────┴────┴────┘
//!                 │
//!      FanoutReport | FanoutError::{Partial, Unavailable}
//! ```
//!
//! Redelivering a measurement is safe: its [`MeasurementId`] is recorded
//! inside each bucket by the atomic upsert, so resolutions that already
//! applied it report [`UpsertOutcome::Duplicate`] and stay unchanged.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use types::ids::MeasurementId;
use types::measurement::Measurement;
use types::resolution::Resolution;

use crate::align;
use crate::config::EngineConfig;
use crate::metrics::FanoutMetrics;
use crate::retry::retry;
use crate::store::{BucketKey, BucketStore, BucketUpsert, StoreError, UpsertOutcome};

/// One resolution that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    pub resolution: Resolution,
    pub key: BucketKey,
    pub error: StoreError,
    pub attempts: u32,
}

/// Fanout failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    /// Some resolutions were written, others exhausted their retries.
    #[error("partial fanout for {measurement_id}: {} resolution(s) failed", .failed.len())]
    Partial {
        measurement_id: MeasurementId,
        failed: Vec<ResolutionFailure>,
        succeeded: Vec<Resolution>,
    },

    /// No resolution could be written.
    #[error("fanout for {measurement_id} failed on every resolution")]
    Unavailable {
        measurement_id: MeasurementId,
        failed: Vec<ResolutionFailure>,
    },
}

impl FanoutError {
    pub fn measurement_id(&self) -> MeasurementId {
        match self {
            FanoutError::Partial { measurement_id, .. }
            | FanoutError::Unavailable { measurement_id, .. } => *measurement_id,
        }
    }

    /// Resolutions that need resubmission.
    pub fn failed_resolutions(&self) -> Vec<Resolution> {
        let failed = match self {
            FanoutError::Partial { failed, .. } | FanoutError::Unavailable { failed, .. } => failed,
        };
        failed.iter().map(|f| f.resolution).collect()
    }
}

/// Outcome of a fully successful fanout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub measurement_id: MeasurementId,
    /// One entry per resolution, in `Resolution::ALL` order
    pub outcomes: Vec<(Resolution, UpsertOutcome)>,
    /// Retries spent across all resolutions
    pub retries: u32,
}

impl FanoutReport {
    /// True when every resolution had already applied this measurement.
    pub fn is_duplicate(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| *outcome == UpsertOutcome::Duplicate)
    }
}

/// Writes measurements into all eight resolutions of a [`BucketStore`].
pub struct FanoutWriter<S> {
    store: Arc<S>,
    config: EngineConfig,
    metrics: Arc<FanoutMetrics>,
}

impl<S: BucketStore> FanoutWriter<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(FanoutMetrics::new()))
    }

    /// Share a metrics instance with other components.
    pub fn with_metrics(store: Arc<S>, config: EngineConfig, metrics: Arc<FanoutMetrics>) -> Self {
        info!(
            backend = store.backend_name(),
            max_attempts = config.retry.max_attempts,
            "FanoutWriter initialized"
        );
        Self {
            store,
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<FanoutMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Derive the eight upserts for `measurement` written at `write_time`.
    ///
    /// `expires_at` is anchored to `write_time`, not to the measurement's
    /// own (possibly backdated) timestamp.
    pub fn plan(&self, measurement: &Measurement, write_time: DateTime<Utc>) -> Vec<BucketUpsert> {
        let measurement_id = measurement.id();
        Resolution::ALL
            .iter()
            .map(|&resolution| {
                let bucket_start = align::floor_to_bucket(measurement.timestamp(), resolution);
                BucketUpsert {
                    key: BucketKey::new(measurement.ticker(), resolution, bucket_start),
                    resolution,
                    bucket_start,
                    measurement_id,
                    written_at: write_time,
                    expires_at: write_time + self.config.retention_for(resolution),
                }
            })
            .collect()
    }

    /// Fan `measurement` out using the current wall clock as write time.
    pub async fn write(&self, measurement: &Measurement) -> Result<FanoutReport, FanoutError> {
        self.write_at(measurement, Utc::now()).await
    }

    /// Fan `measurement` out with an explicit write time.
    pub async fn write_at(
        &self,
        measurement: &Measurement,
        write_time: DateTime<Utc>,
    ) -> Result<FanoutReport, FanoutError> {
        let started = Instant::now();
        let measurement_id = measurement.id();
        self.metrics.record_measurement();

        let plan = self.plan(measurement, write_time);
        let results = join_all(plan.iter().map(|op| async move {
            let target = op.key.to_string();
            let retried = retry(&self.config.retry, &target, move || {
                self.store.upsert(op, measurement)
            })
            .await;
            (op, retried)
        }))
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        let mut retries = 0;

        for (op, retried) in results {
            retries += retried.retries();
            match retried.result {
                Ok(outcome) => {
                    self.metrics
                        .record_bucket_write(outcome == UpsertOutcome::Duplicate);
                    outcomes.push((op.resolution, outcome));
                }
                Err(err) => {
                    warn!(
                        ticker = %measurement.ticker(),
                        resolution = %op.resolution,
                        bucket_start = %op.key.sort,
                        attempts = retried.attempts,
                        error = %err,
                        "Bucket upsert failed"
                    );
                    failed.push(ResolutionFailure {
                        resolution: op.resolution,
                        key: op.key.clone(),
                        error: err,
                        attempts: retried.attempts,
                    });
                }
            }
        }

        self.metrics.record_write_retries(u64::from(retries));
        self.metrics
            .record_fanout(failed.len() as u64, started.elapsed().as_micros() as u64);

        if failed.is_empty() {
            debug!(
                ticker = %measurement.ticker(),
                measurement_id = %measurement_id,
                retries,
                "Fanout complete"
            );
            return Ok(FanoutReport {
                measurement_id,
                outcomes,
                retries,
            });
        }

        if outcomes.is_empty() {
            error!(
                ticker = %measurement.ticker(),
                measurement_id = %measurement_id,
                backend = self.store.backend_name(),
                "Fanout failed on every resolution"
            );
            return Err(FanoutError::Unavailable {
                measurement_id,
                failed,
            });
        }

        warn!(
            ticker = %measurement.ticker(),
            measurement_id = %measurement_id,
            failed = failed.len(),
            "Partial fanout"
        );
        Err(FanoutError::Partial {
            measurement_id,
            failed,
            succeeded: outcomes.into_iter().map(|(r, _)| r).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryBucketStore;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;
    use types::ids::Ticker;
    use types::measurement::Label;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: StdDuration::from_millis(1),
                max_backoff: StdDuration::from_millis(4),
                attempt_timeout: StdDuration::from_millis(200),
            },
            ..EngineConfig::default()
        }
    }

    fn measurement() -> Measurement {
        Measurement::new(
            Ticker::new("AAPL"),
            0.75,
            Label::Positive,
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 35, 47).unwrap(),
            "unit",
        )
        .unwrap()
    }

    fn writer() -> (Arc<MemoryBucketStore>, FanoutWriter<MemoryBucketStore>) {
        let store = Arc::new(MemoryBucketStore::default());
        let writer = FanoutWriter::new(Arc::clone(&store), fast_config());
        (store, writer)
    }

    #[test]
    fn test_plan_has_one_upsert_per_resolution() {
        let (_, writer) = writer();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        let plan = writer.plan(&measurement(), now);

        assert_eq!(plan.len(), 8);
        let partitions: Vec<&str> = plan.iter().map(|op| op.key.partition.as_str()).collect();
        assert_eq!(
            partitions,
            ["AAPL#1m", "AAPL#5m", "AAPL#10m", "AAPL#1h", "AAPL#3h", "AAPL#6h", "AAPL#12h", "AAPL#24h"]
        );
        assert_eq!(plan[2].key.sort, "2024-01-02T10:30:00Z");
        assert_eq!(plan[4].key.sort, "2024-01-02T09:00:00Z");
    }

    #[test]
    fn test_plan_expiry_anchored_to_write_time() {
        let (_, writer) = writer();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let plan = writer.plan(&measurement(), now);

        assert_eq!(plan[0].expires_at, now + Duration::hours(6));
        assert_eq!(plan[7].expires_at, now + Duration::days(90));
        assert!(plan.iter().all(|op| op.written_at == now));
    }

    #[tokio::test]
    async fn test_write_creates_all_buckets() {
        let (store, writer) = writer();
        let report = writer.write(&measurement()).await.unwrap();

        assert_eq!(report.outcomes.len(), 8);
        assert!(report
            .outcomes
            .iter()
            .all(|(_, o)| *o == UpsertOutcome::Created));
        assert_eq!(store.len(), 8);
        assert_eq!(writer.metrics().export()["bucket_writes"], 8);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let (store, writer) = writer();
        let m = measurement();
        writer.write(&m).await.unwrap();
        let again = writer.write(&m).await.unwrap();

        assert!(again.is_duplicate());
        let item = store.get("AAPL#1h", "2024-01-02T10:00:00Z").unwrap();
        assert_eq!(item.bucket.count, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let (_, writer) = writer();
        writer.store.fail_next("AAPL#3h", 2, StoreError::Throttled);

        let report = writer.write(&measurement()).await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(writer.metrics().export()["write_retries"], 2);
    }

    #[tokio::test]
    async fn test_exhausted_resolution_reported_as_partial() {
        let (store, writer) = writer();
        store.fail_next("AAPL#6h", 10, StoreError::Throttled);

        let err = writer.write(&measurement()).await.unwrap_err();
        match &err {
            FanoutError::Partial {
                failed, succeeded, ..
            } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].resolution, Resolution::H6);
                assert_eq!(failed[0].attempts, 3);
                assert_eq!(succeeded.len(), 7);
            }
            other => panic!("expected partial fanout, got {other:?}"),
        }
        assert_eq!(err.failed_resolutions(), vec![Resolution::H6]);
        assert_eq!(store.len(), 7);
    }

    #[tokio::test]
    async fn test_all_failed_is_unavailable() {
        let (store, writer) = writer();
        for r in Resolution::ALL {
            store.fail_next(&format!("AAPL#{r}"), 1, StoreError::Backend("read-only".into()));
        }

        let err = writer.write(&measurement()).await.unwrap_err();
        assert!(matches!(err, FanoutError::Unavailable { ref failed, .. } if failed.len() == 8));
        assert_eq!(err.measurement_id(), measurement().id());
    }
}
