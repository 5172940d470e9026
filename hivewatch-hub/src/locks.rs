//! Per-sensor and per-tier async locks.
//!
//! Ingest takes only the sensor lock. Aggregation and pruning take the
//! tier locks they need first, then the lock of each sensor they touch.
//! Tier locks are always acquired finer tier first.

use std::sync::Arc;

use dashmap::DashMap;
use hivewatch_core::{SensorId, retention::RetentionTable};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct SensorLocks {
    locks: Arc<DashMap<SensorId, Arc<Mutex<()>>>>,
}

impl SensorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, sensor: SensorId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(sensor).or_default().value());
        lock.lock_owned().await
    }

    /// Drops the lock of a deleted sensor unless a task still holds or
    /// waits on it.
    pub fn forget(&self, sensor: SensorId) {
        self.locks
            .remove_if(&sensor, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Clone, Default)]
pub struct TierLocks {
    locks: Arc<DashMap<Box<str>, Arc<Mutex<()>>>>,
}

/// Guards held for the duration of one aggregation or prune run.
pub struct TierGuards {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl TierLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every named tier, in the order they appear in `table`.
    /// Names missing from the table are locked last, in the given order.
    pub async fn lock(&self, table: &RetentionTable, tiers: &[&str]) -> TierGuards {
        let mut ordered: Vec<&str> = tiers.to_vec();
        ordered.sort_by_key(|name| table.index_of(name).unwrap_or(usize::MAX));
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for name in ordered {
            let lock = Arc::clone(self.locks.entry(name.into()).or_default().value());
            guards.push(lock.lock_owned().await);
        }
        TierGuards { _guards: guards }
    }

    /// Whether `tier` is currently held by someone.
    pub fn is_locked(&self, tier: &str) -> bool {
        self.locks
            .get(tier)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
