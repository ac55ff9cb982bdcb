//! Sentiment measurements
//!
//! A `Measurement` is one scored observation for a ticker, produced by an
//! external scoring model. It is immutable once created and validated at
//! construction, including on deserialization.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;
use crate::ids::{MeasurementId, Ticker};

/// Sentiment classification attached to a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Positive,
    Neutral,
    Negative,
}

impl Label {
    /// All labels in a fixed order.
    pub const ALL: [Label; 3] = [Label::Positive, Label::Neutral, Label::Negative];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Label::Positive => "positive",
            Label::Neutral => "neutral",
            Label::Negative => "negative",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::UnknownLabel(s.to_string()))
    }
}

/// Wire shape of a measurement before validation.
#[derive(Deserialize)]
struct RawMeasurement {
    ticker: Ticker,
    #[serde(with = "rust_decimal::serde::float")]
    value: Decimal,
    label: Label,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    source: String,
}

impl TryFrom<RawMeasurement> for Measurement {
    type Error = ValidationError;

    fn try_from(raw: RawMeasurement) -> Result<Self, Self::Error> {
        Measurement::from_decimal(raw.ticker, raw.value, raw.label, raw.timestamp, raw.source)
    }
}

/// A single sentiment observation for one ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMeasurement")]
pub struct Measurement {
    ticker: Ticker,
    /// Score in [0, 1]
    #[serde(with = "rust_decimal::serde::float")]
    value: Decimal,
    label: Label,
    /// Event time, UTC
    timestamp: DateTime<Utc>,
    /// Free-form provenance tag
    source: String,
}

impl Measurement {
    /// Create a measurement from a floating-point score.
    ///
    /// Rejects NaN, infinities and values outside [0, 1].
    pub fn new(
        ticker: Ticker,
        value: f64,
        label: Label,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let decimal = Decimal::from_f64(value).ok_or_else(|| ValidationError::ValueOutOfRange {
            value: value.to_string(),
        })?;
        Self::from_decimal(ticker, decimal, label, timestamp, source)
    }

    /// Create a measurement from an exact decimal score.
    ///
    /// The timestamp must fall in years 0000 through 9999, the range whose
    /// bucket keys are fixed-width.
    pub fn from_decimal(
        ticker: Ticker,
        value: Decimal,
        label: Label,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        if value < Decimal::ZERO || value > Decimal::ONE {
            return Err(ValidationError::ValueOutOfRange {
                value: value.to_string(),
            });
        }
        if !(0..=9999).contains(&timestamp.year()) {
            return Err(ValidationError::TimestampOutOfRange {
                timestamp: timestamp.to_rfc3339(),
            });
        }
        Ok(Self {
            ticker,
            value: value.normalize(),
            label,
            timestamp,
            source: source.into(),
        })
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Deterministic idempotency key.
    ///
    /// Two deliveries of the same observation map to the same id, so a
    /// redelivered or retried measurement can be recognized downstream.
    pub fn id(&self) -> MeasurementId {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            self.ticker,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.value,
            self.label,
            self.source,
        );
        MeasurementId::from_content(canonical.as_bytes())
    }
}


// ── Property-Based Tests ────────────────────────────────────────────
