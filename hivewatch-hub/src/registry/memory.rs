use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use hivewatch_core::{Hive, HiveId, Sensor, SensorId};
use tokio::sync::RwLock;

use super::{RegistryError, SensorRegistry};

#[derive(Default)]
struct Inner {
    hives: HashMap<HiveId, Hive>,
    sensors: HashMap<SensorId, Sensor>,
}

#[derive(Clone, Default)]
pub struct InMemorySensorRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configured hives and sensors.
    pub async fn with_fleet(hives: Vec<Hive>, sensors: Vec<Sensor>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for hive in hives {
            registry.register_hive(hive).await?;
        }
        for sensor in sensors {
            registry.register_sensor(sensor).await?;
        }
        Ok(registry)
    }
}

#[async_trait]
impl SensorRegistry for InMemorySensorRegistry {
    async fn register_hive(&self, hive: Hive) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let _ = inner.hives.insert(hive.id, hive);
        Ok(())
    }

    async fn register_sensor(&self, sensor: Sensor) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        if !inner.hives.contains_key(&sensor.hive_id) {
            return Err(RegistryError::UnknownHive(sensor.hive_id));
        }
        let _ = inner.sensors.insert(sensor.id, sensor);
        Ok(())
    }

    async fn get_hive(&self, id: HiveId) -> Result<Option<Hive>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner.hives.get(&id).cloned())
    }

    async fn get_sensor(&self, id: SensorId) -> Result<Option<Sensor>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner.sensors.get(&id).cloned())
    }

    async fn sensors_of_hive(&self, id: HiveId) -> Result<Vec<Sensor>, RegistryError> {
        let inner = self.inner.read().await;
        let mut sensors: Vec<Sensor> = inner
            .sensors
            .values()
            .filter(|s| s.hive_id == id)
            .cloned()
            .collect();
        sensors.sort_by_key(|s| s.id);
        Ok(sensors)
    }

    async fn delete_sensor(&self, id: SensorId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().await;
        Ok(inner.sensors.remove(&id).is_some())
    }

    async fn delete_hive(&self, id: HiveId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.sensors.values().any(|s| s.hive_id == id) {
            return Err(RegistryError::HiveHasSensors(id));
        }
        Ok(inner.hives.remove(&id).is_some())
    }
}
