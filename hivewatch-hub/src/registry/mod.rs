pub mod memory;

use async_trait::async_trait;
use hivewatch_core::{Hive, HiveId, Sensor, SensorId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("hive {0} is not registered")]
    UnknownHive(HiveId),
    #[error("hive {0} still has sensors attached")]
    HiveHasSensors(HiveId),
}

/// Hives and the sensors mounted on them.
#[async_trait]
pub trait SensorRegistry: Send + Sync + 'static {
    async fn register_hive(&self, hive: Hive) -> Result<(), RegistryError>;

    /// Fails if the sensor's hive is not registered.
    async fn register_sensor(&self, sensor: Sensor) -> Result<(), RegistryError>;

    async fn get_hive(&self, id: HiveId) -> Result<Option<Hive>, RegistryError>;

    async fn get_sensor(&self, id: SensorId) -> Result<Option<Sensor>, RegistryError>;

    async fn sensors_of_hive(&self, id: HiveId) -> Result<Vec<Sensor>, RegistryError>;

    /// Returns whether the sensor existed.
    async fn delete_sensor(&self, id: SensorId) -> Result<bool, RegistryError>;

    /// Returns whether the hive existed. Sensors must be deleted first.
    async fn delete_hive(&self, id: HiveId) -> Result<bool, RegistryError>;
}
