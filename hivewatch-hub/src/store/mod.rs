//! Persistence for readings, rollups and the bookkeeping that keeps
//! aggregation and pruning in step.
//!
//! Readings are the native tier. Every rollup tier is stored as
//! [`Aggregate`] rows keyed by `(sensor, tier, bucket_start)`. Two
//! per-`(sensor, tier)` markers are kept alongside:
//!
//! - the *watermark*: every bucket of the tier that ends at or before it
//!   has been materialized from its source;
//! - the *prune horizon*: rows of the tier older than it were deleted.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use hivewatch_core::{Aggregate, SensorId, StoredReading, retention::TierConfig};
use jiff::Timestamp;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// Inserts readings; an existing `(sensor, timestamp)` row is overwritten.
    async fn upsert_readings(&self, readings: &[StoredReading]) -> Result<(), StoreError>;

    /// Readings with `start <= timestamp < end`, oldest first.
    async fn readings_in(
        &self,
        sensor: SensorId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StoredReading>, StoreError>;

    async fn latest_reading(&self, sensor: SensorId) -> Result<Option<StoredReading>, StoreError>;

    async fn earliest_reading(&self, sensor: SensorId) -> Result<Option<Timestamp>, StoreError>;

    /// Inserts aggregates; an existing `(sensor, tier, bucket_start)` row is overwritten.
    async fn upsert_aggregates(&self, aggregates: &[Aggregate]) -> Result<(), StoreError>;

    /// Aggregates with `start <= bucket_start < end`, oldest first.
    async fn aggregates_in(
        &self,
        sensor: SensorId,
        tier: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Aggregate>, StoreError>;

    async fn earliest_aggregate(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError>;

    async fn watermark(&self, sensor: SensorId, tier: &str)
    -> Result<Option<Timestamp>, StoreError>;

    async fn set_watermark(
        &self,
        sensor: SensorId,
        tier: &str,
        through: Timestamp,
    ) -> Result<(), StoreError>;

    /// Lowers an existing watermark to `to`. Missing or lower watermarks
    /// are left alone.
    async fn rewind_watermark(
        &self,
        sensor: SensorId,
        tier: &str,
        to: Timestamp,
    ) -> Result<(), StoreError>;

    async fn prune_horizon(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError>;

    async fn set_prune_horizon(
        &self,
        sensor: SensorId,
        tier: &str,
        cutoff: Timestamp,
    ) -> Result<(), StoreError>;

    /// Deletes readings with `timestamp < cutoff`, returning how many went.
    async fn delete_readings_before(
        &self,
        sensor: SensorId,
        cutoff: Timestamp,
    ) -> Result<u64, StoreError>;

    /// Deletes aggregates with `bucket_start < cutoff`, returning how many went.
    async fn delete_aggregates_before(
        &self,
        sensor: SensorId,
        tier: &str,
        cutoff: Timestamp,
    ) -> Result<u64, StoreError>;

    /// Whether any sensor has aggregates, a watermark or a prune horizon
    /// recorded under `tier`.
    async fn tier_has_data(&self, tier: &str) -> Result<bool, StoreError>;

    /// Sensors that have any readings or aggregates.
    async fn sensor_ids(&self) -> Result<Vec<SensorId>, StoreError>;

    /// Removes every row and marker of a sensor, returning the number of
    /// readings and aggregates deleted.
    async fn delete_sensor_data(&self, sensor: SensorId) -> Result<u64, StoreError>;

    async fn load_retention(&self) -> Result<Option<Vec<TierConfig>>, StoreError>;

    async fn save_retention(&self, tiers: &[TierConfig]) -> Result<(), StoreError>;
}
