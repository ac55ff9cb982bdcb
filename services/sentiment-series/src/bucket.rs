//! Sentiment bucket aggregation
//!
//! Folds measurements into OHLC + label-distribution buckets, one
//! measurement at a time. `open` and `close` follow measurement
//! *timestamps*, not arrival order: a late measurement still moves
//! `high`/`low`/`count`/`sum`/`label_counts` but only moves `open`/`close`
//! when it is the earliest/latest observation seen so far. Ties on
//! timestamp go to the most recent arrival.
//!
//! Uses `Decimal` so `sum` is identical for any permutation of inputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::measurement::{Label, Measurement};

/// Aggregated sentiment for one ticker, one resolution, one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub count: u64,
    pub sum: Decimal,
    pub label_counts: BTreeMap<Label, u64>,
    /// Timestamp of the chronologically-earliest measurement folded in;
    /// guards `open`.
    pub earliest_timestamp_seen: DateTime<Utc>,
    /// Timestamp of the chronologically-latest measurement folded in;
    /// guards `close`.
    pub latest_timestamp_seen: DateTime<Utc>,
}

impl Bucket {
    /// Create a bucket from the first measurement in its window.
    pub fn new(measurement: &Measurement) -> Self {
        let value = measurement.value();
        let mut label_counts = BTreeMap::new();
        label_counts.insert(measurement.label(), 1);
        Self {
            open: value,
            high: value,
            low: value,
            close: value,
            count: 1,
            sum: value,
            label_counts,
            earliest_timestamp_seen: measurement.timestamp(),
            latest_timestamp_seen: measurement.timestamp(),
        }
    }

    /// Fold one more measurement into the bucket.
    pub fn update(&mut self, measurement: &Measurement) {
        let value = measurement.value();
        let ts = measurement.timestamp();

        if value > self.high {
            self.high = value;
        }
        if value < self.low {
            self.low = value;
        }
        self.count += 1;
        self.sum += value;
        *self.label_counts.entry(measurement.label()).or_insert(0) += 1;

        if ts >= self.latest_timestamp_seen {
            self.close = value;
            self.latest_timestamp_seen = ts;
        }
        if ts <= self.earliest_timestamp_seen {
            self.open = value;
            self.earliest_timestamp_seen = ts;
        }
    }

    /// Mean measurement value.
    pub fn avg(&self) -> Decimal {
        if self.count == 0 {
            return Decimal::ZERO;
        }
        self.sum / Decimal::from(self.count)
    }

    /// Count for one label (zero when never seen).
    pub fn label_count(&self, label: Label) -> u64 {
        self.label_counts.get(&label).copied().unwrap_or(0)
    }

    /// Validate bucket integrity (OHLC and count invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.count > 0
            && self.label_counts.values().sum::<u64>() == self.count
            && self.earliest_timestamp_seen <= self.latest_timestamp_seen
    }
}

/// Pure reducer: fold a measurement into an existing bucket, or start one.
pub fn fold(existing: Option<Bucket>, measurement: &Measurement) -> Bucket {
    match existing {
        Some(mut bucket) => {
            bucket.update(measurement);
            bucket
        }
        None => Bucket::new(measurement),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use types::ids::Ticker;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()
    }

    fn m(minute: i64, value: Decimal, label: Label) -> Measurement {
        Measurement::from_decimal(
            Ticker::new("AAPL"),
            value,
            label,
            base() + Duration::minutes(minute),
            "test",
        )
        .unwrap()
    }

    #[test]
    fn test_bucket_creation() {
        let b = fold(None, &m(0, dec!(0.75), Label::Positive));
        assert_eq!(b.open, dec!(0.75));
        assert_eq!(b.high, dec!(0.75));
        assert_eq!(b.low, dec!(0.75));
        assert_eq!(b.close, dec!(0.75));
        assert_eq!(b.count, 1);
        assert_eq!(b.sum, dec!(0.75));
        assert_eq!(b.label_count(Label::Positive), 1);
        assert_eq!(b.earliest_timestamp_seen, b.latest_timestamp_seen);
        assert!(b.is_valid());
    }

    #[test]
    fn test_ohlc_scenario() {
        let inputs = [dec!(0.6), dec!(0.9), dec!(0.3), dec!(0.7)];
        let mut bucket = None;
        for (i, v) in inputs.into_iter().enumerate() {
            bucket = Some(fold(bucket, &m(i as i64, v, Label::Neutral)));
        }
        let b = bucket.unwrap();

        assert_eq!(b.open, dec!(0.6));
        assert_eq!(b.high, dec!(0.9));
        assert_eq!(b.low, dec!(0.3));
        assert_eq!(b.close, dec!(0.7));
        assert_eq!(b.avg(), dec!(0.625));
        assert_eq!(b.count, 4);
        assert!(b.is_valid());
    }

    #[test]
    fn test_late_arrival_keeps_close() {
        // 10:00 arrives first, 09:00 arrives late
        let b = fold(None, &m(60, dec!(0.5), Label::Neutral));
        let b = fold(Some(b), &m(0, dec!(0.9), Label::Positive));

        assert_eq!(b.close, dec!(0.5));
        assert_eq!(b.open, dec!(0.9));
        assert_eq!(b.high, dec!(0.9));
        assert_eq!(b.low, dec!(0.5));
        assert_eq!(b.count, 2);
        assert_eq!(b.latest_timestamp_seen, base() + Duration::minutes(60));
        assert_eq!(b.earliest_timestamp_seen, base());
        assert!(b.is_valid());
    }

    #[test]
    fn test_label_counts_sum_to_count() {
        let mut b = fold(None, &m(0, dec!(0.2), Label::Negative));
        for (i, label) in [Label::Positive, Label::Negative, Label::Neutral].into_iter().enumerate() {
            b.update(&m(i as i64 + 1, dec!(0.5), label));
        }
        assert_eq!(b.label_count(Label::Negative), 2);
        assert_eq!(b.label_count(Label::Positive), 1);
        assert_eq!(b.label_count(Label::Neutral), 1);
        assert_eq!(b.label_counts.values().sum::<u64>(), b.count);
    }

    #[test]
    fn test_integrity_validation() {
        let mut invalid = fold(None, &m(0, dec!(0.5), Label::Neutral));
        invalid.high = dec!(0.4); // High < Open → invalid
        assert!(!invalid.is_valid());

        let mut miscounted = fold(None, &m(0, dec!(0.5), Label::Neutral));
        miscounted.count = 2;
        assert!(!miscounted.is_valid());
    }
}

// ── Property-Based Tests ────────────────────────────────────────────

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use types::ids::Ticker;

    fn fold_all(measurements: &[Measurement]) -> Bucket {
        let mut bucket = None;
        for m in measurements {
            bucket = Some(fold(bucket, m));
        }
        bucket.unwrap()
    }

    fn measurements() -> impl Strategy<Value = Vec<Measurement>> {
        // Distinct timestamps so open/close are uniquely determined
        prop::collection::vec((0u32..=1_000, 0usize..3), 1..24).prop_map(|raw| {
            let base = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
            raw.into_iter()
                .enumerate()
                .map(|(i, (milli, label))| {
                    Measurement::from_decimal(
                        Ticker::new("NVDA"),
                        Decimal::new(i64::from(milli), 3),
                        Label::ALL[label],
                        base + Duration::seconds(i as i64),
                        "prop",
                    )
                    .unwrap()
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_fold_order_independent(
            (original, shuffled) in measurements().prop_flat_map(|ms| {
                let shuffled = Just(ms.clone()).prop_shuffle();
                (Just(ms), shuffled)
            })
        ) {
            let a = fold_all(&original);
            let b = fold_all(&shuffled);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_fold_preserves_invariants(ms in measurements()) {
            let b = fold_all(&ms);
            prop_assert!(b.is_valid());
            prop_assert_eq!(b.count as usize, ms.len());
            prop_assert_eq!(b.open, ms.first().unwrap().value());
            prop_assert_eq!(b.close, ms.last().unwrap().value());
        }
    }
}
