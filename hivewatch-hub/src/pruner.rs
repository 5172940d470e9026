//! Deletion of rows that have aged out of their tier.
//!
//! A tier is pruned up to `now - age_to`, but never past the watermark of
//! the tier that rolls it up: rows are only deleted once the coarser
//! bucket covering them exists. The cutoff is aligned down to the coarser
//! tier's bucket width so a bucket's source rows are deleted all at once.

use std::sync::Arc;

use hivewatch_core::{SensorId, bucket::align_down, retention::RetentionTier};
use jiff::{SignedDuration, Timestamp};
use thiserror::Error;
use tracing::{debug, info};

use crate::locks::{SensorLocks, TierLocks};
use crate::retention::RetentionHandle;
use crate::store::{StoreError, TimeSeriesStore};

#[derive(Debug, Error)]
pub enum PruneError {
    #[error("unknown tier `{0}`")]
    UnknownTier(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub sensors: usize,
    pub rows: u64,
    /// Sensors held back because the coarser tier has not caught up.
    pub held_back: usize,
}

pub struct RetentionPruner {
    store: Arc<dyn TimeSeriesStore>,
    retention: Arc<RetentionHandle>,
    tier_locks: TierLocks,
    sensor_locks: SensorLocks,
}

impl RetentionPruner {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        retention: Arc<RetentionHandle>,
        tier_locks: TierLocks,
        sensor_locks: SensorLocks,
    ) -> Self {
        Self {
            store,
            retention,
            tier_locks,
            sensor_locks,
        }
    }

    /// Prunes `tier` for every sensor. The unbounded last tier is never pruned.
    pub async fn prune_tier(&self, tier: &str, now: Timestamp) -> Result<PruneReport, PruneError> {
        let table = self.retention.current();
        let target = table
            .get(tier)
            .ok_or_else(|| PruneError::UnknownTier(tier.to_string()))?;
        let (Some(age_to), Some(next)) = (target.age_to, table.successor(tier)) else {
            return Ok(PruneReport::default());
        };
        let Some(next_width) = next.bucket_width else {
            return Ok(PruneReport::default());
        };

        let _tiers = self
            .tier_locks
            .lock(&table, &[&*target.name, &*next.name])
            .await;

        let aged_out = align_down(now - age_to, next_width);
        let mut report = PruneReport::default();
        for sensor in self.store.sensor_ids().await? {
            let _sensor = self.sensor_locks.lock(sensor).await;
            match self
                .prune_sensor(target, &next.name, next_width, sensor, aged_out)
                .await?
            {
                Pruned::Rows(0) => {}
                Pruned::Rows(rows) => {
                    report.sensors += 1;
                    report.rows += rows;
                }
                Pruned::HeldBack => report.held_back += 1,
            }
        }

        if report.rows > 0 || report.held_back > 0 {
            info!(
                tier,
                sensors = report.sensors,
                rows = report.rows,
                held_back = report.held_back,
                "tier pruned"
            );
        }
        Ok(report)
    }

    async fn prune_sensor(
        &self,
        target: &RetentionTier,
        next: &str,
        next_width: SignedDuration,
        sensor: SensorId,
        aged_out: Timestamp,
    ) -> Result<Pruned, PruneError> {
        let has_old_rows = match self.earliest(target, sensor).await? {
            Some(earliest) => earliest < aged_out,
            None => false,
        };
        if !has_old_rows {
            return Ok(Pruned::Rows(0));
        }

        let Some(mark) = self.store.watermark(sensor, next).await? else {
            debug!(%sensor, tier = %target.name, "nothing rolled up yet, not pruning");
            return Ok(Pruned::HeldBack);
        };
        let cutoff = aged_out.min(align_down(mark, next_width));
        let held_back = cutoff < aged_out;

        let horizon = self.store.prune_horizon(sensor, &target.name).await?;
        if horizon.is_some_and(|h| cutoff <= h) {
            return Ok(if held_back { Pruned::HeldBack } else { Pruned::Rows(0) });
        }

        let rows = if target.is_native() {
            self.store.delete_readings_before(sensor, cutoff).await?
        } else {
            self.store
                .delete_aggregates_before(sensor, &target.name, cutoff)
                .await?
        };
        self.store.set_prune_horizon(sensor, &target.name, cutoff).await?;

        debug!(%sensor, tier = %target.name, %cutoff, rows, held_back, "pruned rows");
        Ok(if held_back && rows == 0 {
            Pruned::HeldBack
        } else {
            Pruned::Rows(rows)
        })
    }

    async fn earliest(
        &self,
        target: &RetentionTier,
        sensor: SensorId,
    ) -> Result<Option<Timestamp>, StoreError> {
        if target.is_native() {
            self.store.earliest_reading(sensor).await
        } else {
            self.store.earliest_aggregate(sensor, &target.name).await
        }
    }
}

enum Pruned {
    Rows(u64),
    HeldBack,
}
