pub mod retry;
pub mod simulated;

use async_trait::async_trait;
use hivewatch_core::Sensor;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("hardware read failed: {0}")]
    Hardware(String),
    #[error("hardware read timed out")]
    Timeout,
    #[error("circuit open")]
    CircuitOpen,
}

/// Raw access to sensor hardware.
#[async_trait]
pub trait SensorReader: Send + Sync + 'static {
    async fn read(&self, sensor: &Sensor) -> Result<f64, ReadError>;
}
