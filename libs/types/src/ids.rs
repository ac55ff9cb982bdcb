//! Identifier types for sentiment entities
//!
//! `Ticker` names the instrument a measurement is about. `MeasurementId`
//! is a deterministic UUID v5 derived from a measurement's content, so
//! redelivering the same measurement always yields the same id.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::ValidationError;

/// Instrument symbol (e.g., "AAPL", "BRK.B")
///
/// Must be non-empty and free of whitespace and `#`, which separates the
/// ticker from the resolution in storage partition keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    /// Create a ticker, validating its format
    pub fn try_new(symbol: impl Into<String>) -> Result<Self, ValidationError> {
        let s = symbol.into();
        if s.is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        if s.contains('#') {
            return Err(ValidationError::InvalidTicker {
                ticker: s,
                reason: "contains '#'",
            });
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidTicker {
                ticker: s,
                reason: "contains whitespace",
            });
        }
        Ok(Self(s))
    }

    /// Create a ticker from a known-good literal
    ///
    /// # Panics
    /// Panics if the symbol is not a valid ticker
    pub fn new(symbol: impl Into<String>) -> Self {
        match Self::try_new(symbol) {
            Ok(ticker) => ticker,
            Err(err) => panic!("{err}"),
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Ticker {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_new(s)
    }
}

impl From<Ticker> for String {
    fn from(ticker: Ticker) -> Self {
        ticker.0
    }
}

/// Namespace for measurement ids; fixed forever so ids stay stable
/// across releases.
const MEASUREMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_54a2_8d3e_4b7a_9e21_0c5d_7a3f_e418);

/// Idempotency key for a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementId(Uuid);

impl MeasurementId {
    /// Derive an id from the canonical byte encoding of a measurement
    pub fn from_content(content: &[u8]) -> Self {
        Self(Uuid::new_v5(&MEASUREMENT_NAMESPACE, content))
    }
}

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MeasurementId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
