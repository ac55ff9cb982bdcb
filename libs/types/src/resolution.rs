//! Bucket resolutions and their retention windows
//!
//! Eight fixed window sizes from one minute to one day. Every resolution
//! divides 24 hours evenly, so buckets aligned to the Unix epoch are also
//! aligned to midnight UTC.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ParseResolutionError;

/// Supported bucket resolutions, ordered finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Resolution {
    /// 1 minute
    M1,
    /// 5 minutes
    M5,
    /// 10 minutes
    M10,
    /// 1 hour
    H1,
    /// 3 hours
    H3,
    /// 6 hours
    H6,
    /// 12 hours
    H12,
    /// 24 hours
    H24,
}

impl Resolution {
    /// All resolutions, ascending by window size.
    pub const ALL: [Resolution; 8] = [
        Resolution::M1,
        Resolution::M5,
        Resolution::M10,
        Resolution::H1,
        Resolution::H3,
        Resolution::H6,
        Resolution::H12,
        Resolution::H24,
    ];

    /// Window length in seconds.
    pub const fn seconds(&self) -> i64 {
        match self {
            Resolution::M1 => 60,
            Resolution::M5 => 5 * 60,
            Resolution::M10 => 10 * 60,
            Resolution::H1 => 3600,
            Resolution::H3 => 3 * 3600,
            Resolution::H6 => 6 * 3600,
            Resolution::H12 => 12 * 3600,
            Resolution::H24 => 24 * 3600,
        }
    }

    /// Window length.
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Statically configured retention window.
    ///
    /// Coarser buckets are kept longer.
    pub fn default_retention(&self) -> Duration {
        match self {
            Resolution::M1 => Duration::hours(6),
            Resolution::M5 => Duration::days(1),
            Resolution::M10 => Duration::days(2),
            Resolution::H1 => Duration::days(7),
            Resolution::H3 => Duration::days(14),
            Resolution::H6 => Duration::days(30),
            Resolution::H12 => Duration::days(60),
            Resolution::H24 => Duration::days(90),
        }
    }

    /// Wire name (`"1m"`, `"24h"`, ...).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Resolution::M1 => "1m",
            Resolution::M5 => "5m",
            Resolution::M10 => "10m",
            Resolution::H1 => "1h",
            Resolution::H3 => "3h",
            Resolution::H6 => "6h",
            Resolution::H12 => "12h",
            Resolution::H24 => "24h",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ParseResolutionError {
                input: s.to_string(),
            })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ParseResolutionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Resolution> for String {
    fn from(r: Resolution) -> Self {
        r.as_str().to_string()
    }
}
