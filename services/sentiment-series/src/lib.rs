//! Sentiment Time-Series Service
//!
//! Aggregates a stream of per-ticker sentiment measurements into OHLC +
//! label-distribution buckets at eight resolutions (1m through 24h), and
//! serves ordered range queries with live-bucket progress.
//!
//! # Architecture
//!
//! ```text
//!  Measurement (at-least-once)
//!        │
//!   ┌────▼─────┐
//!   │ Fanout   │  ← plan 8 upserts, retry each, join
//!   └────┬─────┘
//!        │ align::floor_to_bucket × 8
//!   ┌────▼──────────────────────────┐
//!   │ BucketStore (atomic per key)  │  ← bucket::fold + dedup + expires_at
//!   │   Memory | SQLite             │
//!   └────┬──────────────────────────┘
//!        │ range(partition, start, end)
//!   ┌────▼─────┐
//!   │ Query    │  ← expiry filter, sort, is_partial / progress_pct
//!   └──────────┘
//! ```
//!
//! The store is the only shared mutable state; the engine itself holds no
//! locks around bucket updates.

pub mod align;
pub mod bucket;
pub mod config;
pub mod fanout;
pub mod metrics;
pub mod query;
pub mod retry;
pub mod store;

pub use config::{ConfigError, EngineConfig};
pub use fanout::{FanoutError, FanoutReport, FanoutWriter, ResolutionFailure};
pub use query::{BucketView, QueryError, RangeQueryService};
pub use store::{BucketStore, MemoryBucketStore, SqliteBucketStore, StoreError};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
