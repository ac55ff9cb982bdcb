//! Error types for the sentiment domain types
//!
//! Validation failures are the only way the pure layer can fail.

use thiserror::Error;

/// Rejection of a malformed measurement or one of its fields
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Ticker must not be empty")]
    EmptyTicker,

    #[error("Invalid ticker {ticker:?}: {reason}")]
    InvalidTicker { ticker: String, reason: &'static str },

    #[error("Sentiment value {value} outside [0, 1]")]
    ValueOutOfRange { value: String },

    #[error("Unknown sentiment label: {0}")]
    UnknownLabel(String),

    #[error("Timestamp {timestamp} outside years 0000-9999")]
    TimestampOutOfRange { timestamp: String },
}

/// A resolution string that is not one of the eight supported windows
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown resolution {input:?}: expected one of 1m, 5m, 10m, 1h, 3h, 6h, 12h, 24h")]
pub struct ParseResolutionError {
    pub input: String,
}
