//! Types library for the sentiment time-series engine
//!
//! Shared definitions consumed by every service that produces or reads
//! sentiment buckets, so that keys and wire formats agree without
//! coordination.
//!
//! # Modules
//! - `ids`: Identifiers (Ticker, MeasurementId)
//! - `measurement`: Scored observations and their labels
//! - `resolution`: The eight bucket window sizes and their retention
//! - `errors`: Validation error taxonomy

// Public modules
pub mod ids;
pub mod measurement;
pub mod resolution;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::measurement::*;
    pub use crate::resolution::*;
    pub use crate::errors::*;
}
