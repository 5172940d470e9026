use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use hivewatch_core::{Aggregate, SensorId, StoredReading, retention::TierConfig};
use jiff::Timestamp;
use tokio::sync::RwLock;

use super::{StoreError, TimeSeriesStore};

type TierKey = (SensorId, Box<str>);

#[derive(Default)]
struct Inner {
    readings: HashMap<SensorId, BTreeMap<Timestamp, StoredReading>>,
    aggregates: HashMap<TierKey, BTreeMap<Timestamp, Aggregate>>,
    watermarks: HashMap<TierKey, Timestamp>,
    horizons: HashMap<TierKey, Timestamp>,
    retention: Option<Vec<TierConfig>>,
}

fn key(sensor: SensorId, tier: &str) -> TierKey {
    (sensor, tier.into())
}

/// In-memory store, used for tests and single-process deployments that
/// can afford to lose history on restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn upsert_readings(&self, readings: &[StoredReading]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for stored in readings {
            let _ = inner
                .readings
                .entry(stored.reading.sensor_id)
                .or_default()
                .insert(stored.reading.timestamp, *stored);
        }
        Ok(())
    }

    async fn readings_in(
        &self,
        sensor: SensorId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StoredReading>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .readings
            .get(&sensor)
            .map(|rows| rows.range(start..end).map(|(_, r)| *r).collect())
            .unwrap_or_default())
    }

    async fn latest_reading(&self, sensor: SensorId) -> Result<Option<StoredReading>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .readings
            .get(&sensor)
            .and_then(|rows| rows.last_key_value())
            .map(|(_, r)| *r))
    }

    async fn earliest_reading(&self, sensor: SensorId) -> Result<Option<Timestamp>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .readings
            .get(&sensor)
            .and_then(|rows| rows.first_key_value())
            .map(|(ts, _)| *ts))
    }

    async fn upsert_aggregates(&self, aggregates: &[Aggregate]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for aggregate in aggregates {
            let _ = inner
                .aggregates
                .entry(key(aggregate.sensor_id, &aggregate.tier))
                .or_default()
                .insert(aggregate.bucket_start, aggregate.clone());
        }
        Ok(())
    }

    async fn aggregates_in(
        &self,
        sensor: SensorId,
        tier: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Aggregate>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .aggregates
            .get(&key(sensor, tier))
            .map(|rows| rows.range(start..end).map(|(_, a)| a.clone()).collect())
            .unwrap_or_default())
    }

    async fn earliest_aggregate(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .aggregates
            .get(&key(sensor, tier))
            .and_then(|rows| rows.first_key_value())
            .map(|(ts, _)| *ts))
    }

    async fn watermark(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.watermarks.get(&key(sensor, tier)).copied())
    }

    async fn set_watermark(
        &self,
        sensor: SensorId,
        tier: &str,
        through: Timestamp,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let _ = inner.watermarks.insert(key(sensor, tier), through);
        Ok(())
    }

    async fn rewind_watermark(
        &self,
        sensor: SensorId,
        tier: &str,
        to: Timestamp,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(current) = inner.watermarks.get_mut(&key(sensor, tier))
            && *current > to
        {
            *current = to;
        }
        Ok(())
    }

    async fn prune_horizon(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.horizons.get(&key(sensor, tier)).copied())
    }

    async fn set_prune_horizon(
        &self,
        sensor: SensorId,
        tier: &str,
        cutoff: Timestamp,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let _ = inner.horizons.insert(key(sensor, tier), cutoff);
        Ok(())
    }

    async fn delete_readings_before(
        &self,
        sensor: SensorId,
        cutoff: Timestamp,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(rows) = inner.readings.get_mut(&sensor) else {
            return Ok(0);
        };
        let kept = rows.split_off(&cutoff);
        let deleted = rows.len() as u64;
        *rows = kept;
        Ok(deleted)
    }

    async fn delete_aggregates_before(
        &self,
        sensor: SensorId,
        tier: &str,
        cutoff: Timestamp,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(rows) = inner.aggregates.get_mut(&key(sensor, tier)) else {
            return Ok(0);
        };
        let kept = rows.split_off(&cutoff);
        let deleted = rows.len() as u64;
        *rows = kept;
        Ok(deleted)
    }

    async fn tier_has_data(&self, tier: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        let has_rows = inner
            .aggregates
            .iter()
            .any(|((_, t), rows)| &**t == tier && !rows.is_empty());
        Ok(has_rows
            || inner.watermarks.keys().any(|(_, t)| &**t == tier)
            || inner.horizons.keys().any(|(_, t)| &**t == tier))
    }

    async fn sensor_ids(&self) -> Result<Vec<SensorId>, StoreError> {
        let inner = self.inner.read().await;
        let ids: BTreeSet<SensorId> = inner
            .readings
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(id, _)| *id)
            .chain(
                inner
                    .aggregates
                    .iter()
                    .filter(|(_, rows)| !rows.is_empty())
                    .map(|((id, _), _)| *id),
            )
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn delete_sensor_data(&self, sensor: SensorId) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut deleted = inner
            .readings
            .remove(&sensor)
            .map_or(0, |rows| rows.len() as u64);

        inner.aggregates.retain(|(id, _), rows| {
            if *id == sensor {
                deleted += rows.len() as u64;
                false
            } else {
                true
            }
        });
        inner.watermarks.retain(|(id, _), _| *id != sensor);
        inner.horizons.retain(|(id, _), _| *id != sensor);
        Ok(deleted)
    }

    async fn load_retention(&self) -> Result<Option<Vec<TierConfig>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.retention.clone())
    }

    async fn save_retention(&self, tiers: &[TierConfig]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.retention = Some(tiers.to_vec());
        Ok(())
    }
}
