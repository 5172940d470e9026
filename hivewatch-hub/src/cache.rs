use dashmap::DashMap;
use hivewatch_core::{SensorId, StoredReading};
use jiff::{SignedDuration, Timestamp};
use serde::Serialize;

use crate::store::{StoreError, TimeSeriesStore};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastValue {
    pub value: f64,
    pub timestamp: Timestamp,
    /// The reading is older than the cache's staleness bound.
    pub stale: bool,
}

/// Latest reading per sensor.
///
/// Only the ingest path writes entries, and an entry only moves forward in
/// time. A miss falls through to the store once and fills the entry.
/// Values older than `staleness` are still returned, marked stale.
pub struct LastValueCache {
    entries: DashMap<SensorId, StoredReading>,
    staleness: SignedDuration,
}

impl LastValueCache {
    pub fn new(staleness: SignedDuration) -> Self {
        Self {
            entries: DashMap::new(),
            staleness,
        }
    }

    /// Records `stored` unless a newer reading is already cached.
    pub fn update(&self, stored: StoredReading) {
        self.entries
            .entry(stored.reading.sensor_id)
            .and_modify(|current| {
                if stored.reading.timestamp >= current.reading.timestamp {
                    *current = stored;
                }
            })
            .or_insert(stored);
    }

    pub fn get(&self, sensor: SensorId, now: Timestamp) -> Option<LastValue> {
        self.entries.get(&sensor).map(|stored| self.view(&stored, now))
    }

    pub async fn get_or_load(
        &self,
        sensor: SensorId,
        store: &dyn TimeSeriesStore,
        now: Timestamp,
    ) -> Result<Option<LastValue>, StoreError> {
        if let Some(value) = self.get(sensor, now) {
            return Ok(Some(value));
        }
        let Some(stored) = store.latest_reading(sensor).await? else {
            return Ok(None);
        };
        self.update(stored);
        Ok(self.get(sensor, now))
    }

    pub fn remove(&self, sensor: SensorId) {
        self.entries.remove(&sensor);
    }

    fn view(&self, stored: &StoredReading, now: Timestamp) -> LastValue {
        LastValue {
            value: stored.reading.value(),
            timestamp: stored.reading.timestamp,
            stale: now.duration_since(stored.reading.timestamp) > self.staleness,
        }
    }
}
