//! In-memory partitioned bucket store
//!
//! `DashMap` keyed by partition, each holding a `BTreeMap` keyed by sort
//! key. The shard write lock taken by `get_mut`/`entry` makes every upsert
//! atomic for its key. Each entry carries the set of measurement ids folded
//! into it, which lives and dies with the entry. Native TTL is emulated by [`MemoryBucketStore::sweep_expired`]
//! and the optional reaper task.
//!
//! Failure and latency injection hooks exist so retry and isolation paths
//! can be exercised without a real network store.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use types::ids::MeasurementId;
use types::measurement::Measurement;

use super::{apply_upsert, BucketItem, BucketStore, BucketUpsert, StoreError, UpsertOutcome};

/// A bucket item plus every measurement id applied to it.
struct StoredItem {
    item: BucketItem,
    applied: HashSet<MeasurementId>,
}

/// In-memory backend.
pub struct MemoryBucketStore {
    partitions: DashMap<String, BTreeMap<String, StoredItem>>,
    /// Queued failures per partition, consumed one per upsert.
    injected_failures: DashMap<String, VecDeque<StoreError>>,
    /// Artificial latency per partition.
    injected_latency: DashMap<String, Duration>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        info!("MemoryBucketStore initialized");
        Self {
            partitions: DashMap::new(),
            injected_failures: DashMap::new(),
            injected_latency: DashMap::new(),
        }
    }

    /// Make the next `count` upserts into `partition` fail with `error`.
    pub fn fail_next(&self, partition: &str, count: usize, error: StoreError) {
        let mut queue = self.injected_failures.entry(partition.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Delay every upsert into `partition` by `latency`.
    pub fn set_latency(&self, partition: &str, latency: Duration) {
        self.injected_latency.insert(partition.to_string(), latency);
    }

    /// Physically remove items whose `expires_at` has passed.
    ///
    /// Returns the number of items removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut partition in self.partitions.iter_mut() {
            let before = partition.len();
            partition.retain(|_, stored| !stored.item.is_expired(now));
            removed += before - partition.len();
        }
        self.partitions.retain(|_, items| !items.is_empty());
        if removed > 0 {
            debug!(removed, "Swept expired bucket items");
        }
        removed
    }

    /// Run [`Self::sweep_expired`] on a fixed interval until the handle is aborted.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep_expired(Utc::now());
            }
        })
    }

    /// Read one item regardless of expiry.
    pub fn get(&self, partition: &str, sort: &str) -> Option<BucketItem> {
        self.partitions
            .get(partition)
            .and_then(|items| items.get(sort).map(|stored| stored.item.clone()))
    }

    /// Number of measurement ids recorded against one item.
    pub fn applied_count(&self, partition: &str, sort: &str) -> usize {
        self.partitions
            .get(partition)
            .and_then(|items| items.get(sort).map(|stored| stored.applied.len()))
            .unwrap_or(0)
    }

    /// Total number of stored items.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected_failure(&self, partition: &str) -> Option<StoreError> {
        self.injected_failures
            .get_mut(partition)
            .and_then(|mut queue| queue.pop_front())
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn upsert(
        &self,
        op: &BucketUpsert,
        measurement: &Measurement,
    ) -> Result<UpsertOutcome, StoreError> {
        let latency = self.injected_latency.get(&op.key.partition).map(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.take_injected_failure(&op.key.partition) {
            return Err(err);
        }

        let mut partition = self.partitions.entry(op.key.partition.clone()).or_default();
        let (existing, mut applied) = match partition.remove(&op.key.sort) {
            Some(stored) => (Some(stored.item), stored.applied),
            None => (None, HashSet::new()),
        };
        let seen = applied.contains(&op.measurement_id);
        let (item, outcome) = apply_upsert(existing, seen, op, measurement);
        match outcome {
            UpsertOutcome::Created => {
                applied.clear();
                applied.insert(op.measurement_id);
            }
            UpsertOutcome::Updated => {
                applied.insert(op.measurement_id);
            }
            UpsertOutcome::Duplicate => {}
        }
        partition.insert(op.key.sort.clone(), StoredItem { item, applied });
        Ok(outcome)
    }

    async fn range(
        &self,
        partition: &str,
        start_sort: &str,
        end_sort: &str,
    ) -> Result<Vec<BucketItem>, StoreError> {
        if start_sort > end_sort {
            return Ok(Vec::new());
        }
        let items = match self.partitions.get(partition) {
            Some(items) => items
                .range(start_sort.to_string()..=end_sort.to_string())
                .map(|(_, stored)| stored.item.clone())
                .collect(),
            None => Vec::new(),
        };
        Ok(items)
    }

    fn backend_name(&self) -> &'static str {
        "Memory"
    }
}
