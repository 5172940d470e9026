//! Rollup of one retention tier into the next.
//!
//! Each `(sensor, tier)` has a watermark: buckets ending at or before it
//! are materialized. A run extends the watermark up to the last bucket
//! that ended at least `settle_delay` ago and that the source tier itself
//! has fully materialized. Recomputing a bucket overwrites it with the
//! same values, so runs are safe to repeat.

use std::sync::Arc;

use hivewatch_core::{
    Aggregate, SensorId,
    bucket::{align_down, summarize_aggregates, summarize_readings},
    retention::{RetentionTable, RetentionTier},
};
use jiff::{SignedDuration, Timestamp};
use thiserror::Error;
use tracing::{debug, info};

use crate::locks::{SensorLocks, TierLocks};
use crate::retention::RetentionHandle;
use crate::store::{StoreError, TimeSeriesStore};

/// Upper bound on buckets computed per sensor per step, to keep reads bounded.
const MAX_BUCKETS_PER_STEP: i32 = 512;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("unknown tier `{0}`")]
    UnknownTier(String),
    #[error("tier `{0}` holds native readings and is not aggregated")]
    NotARollup(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub sensors: usize,
    pub buckets: usize,
}

pub struct TierAggregator {
    store: Arc<dyn TimeSeriesStore>,
    retention: Arc<RetentionHandle>,
    tier_locks: TierLocks,
    sensor_locks: SensorLocks,
    settle_delay: SignedDuration,
}

impl TierAggregator {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        retention: Arc<RetentionHandle>,
        tier_locks: TierLocks,
        sensor_locks: SensorLocks,
        settle_delay: SignedDuration,
    ) -> Self {
        Self {
            store,
            retention,
            tier_locks,
            sensor_locks,
            settle_delay,
        }
    }

    /// Materializes every settled bucket of `tier` for every sensor.
    pub async fn aggregate_tier(
        &self,
        tier: &str,
        now: Timestamp,
    ) -> Result<AggregationReport, AggregationError> {
        let table = self.retention.current();
        let target = table
            .get(tier)
            .ok_or_else(|| AggregationError::UnknownTier(tier.to_string()))?;
        let (Some(width), Some(source)) = (target.bucket_width, table.source_of(tier)) else {
            return Err(AggregationError::NotARollup(tier.to_string()));
        };

        let _tiers = self
            .tier_locks
            .lock(&table, &[&*source.name, &*target.name])
            .await;

        let settled_end = align_down(now - self.settle_delay, width);
        let mut report = AggregationReport::default();
        for sensor in self.store.sensor_ids().await? {
            let _sensor = self.sensor_locks.lock(sensor).await;
            let buckets = self
                .aggregate_sensor(&table, target, source, width, sensor, settled_end)
                .await?;
            if buckets > 0 {
                report.sensors += 1;
                report.buckets += buckets;
            }
        }

        if report.buckets > 0 {
            info!(
                tier,
                sensors = report.sensors,
                buckets = report.buckets,
                "tier aggregated"
            );
        }
        Ok(report)
    }

    async fn aggregate_sensor(
        &self,
        table: &RetentionTable,
        target: &RetentionTier,
        source: &RetentionTier,
        width: SignedDuration,
        sensor: SensorId,
        settled_end: Timestamp,
    ) -> Result<usize, AggregationError> {
        // a rollup of a rollup can only go as far as its source has
        let mut end = settled_end;
        if !source.is_native() {
            let Some(source_mark) = self.store.watermark(sensor, &source.name).await? else {
                return Ok(0);
            };
            end = end.min(align_down(source_mark, width));
        }

        let start = match self.store.watermark(sensor, &target.name).await? {
            Some(mark) => mark,
            None => {
                let earliest = if source.is_native() {
                    self.store.earliest_reading(sensor).await?
                } else {
                    self.store.earliest_aggregate(sensor, &source.name).await?
                };
                match earliest {
                    Some(ts) => align_down(ts, width),
                    None => return Ok(0),
                }
            }
        };
        if start >= end {
            return Ok(0);
        }

        let step = width * MAX_BUCKETS_PER_STEP;
        let mut from = start;
        let mut buckets = 0;
        while from < end {
            let to = end.min(from + step);
            let rows = self.materialize(target, source, width, sensor, from, to).await?;
            self.store.upsert_aggregates(&rows).await?;
            self.store.set_watermark(sensor, &target.name, to).await?;
            buckets += rows.len();
            from = to;
        }

        // coarser tiers built on buckets we just recomputed must redo them
        if let Some(next) = table.successor(&target.name)
            && let Some(next_width) = next.bucket_width
        {
            self.store
                .rewind_watermark(sensor, &next.name, align_down(start, next_width))
                .await?;
        }

        debug!(
            %sensor,
            tier = %target.name,
            %start,
            %end,
            buckets,
            "materialized buckets"
        );
        Ok(buckets)
    }

    async fn materialize(
        &self,
        target: &RetentionTier,
        source: &RetentionTier,
        width: SignedDuration,
        sensor: SensorId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Aggregate>, AggregationError> {
        let summaries = if source.is_native() {
            let readings = self.store.readings_in(sensor, from, to).await?;
            summarize_readings(&readings, width)
        } else {
            let aggregates = self
                .store
                .aggregates_in(sensor, &source.name, from, to)
                .await?;
            summarize_aggregates(&aggregates, width)
        };

        Ok(summaries
            .into_iter()
            .filter_map(|(bucket_start, summary)| {
                summary.to_aggregate(sensor, &target.name, bucket_start, bucket_start + width)
            })
            .collect())
    }
}
