use async_trait::async_trait;
use hivewatch_core::{Sensor, SensorKind};
use rand::Rng;

use super::{ReadError, SensorReader};

/// Reader that generates plausible hive values instead of touching hardware.
pub struct SimulatedReader {
    /// Percentage of reads that fail.
    failure_percent: u32,
}

impl SimulatedReader {
    pub fn new(failure_percent: u32) -> Self {
        Self {
            failure_percent: failure_percent.min(100),
        }
    }
}

impl Default for SimulatedReader {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl SensorReader for SimulatedReader {
    async fn read(&self, sensor: &Sensor) -> Result<f64, ReadError> {
        let mut rng = rand::rng();

        if rng.random_ratio(self.failure_percent, 100) {
            return Err(ReadError::Hardware(format!(
                "simulated bus error on {}",
                sensor.name
            )));
        }

        let value = match sensor.kind {
            SensorKind::Temperature => rng.random_range(30.0..36.0),
            SensorKind::Humidity => rng.random_range(50.0..70.0),
            SensorKind::Weight => rng.random_range(35.0..60.0),
            SensorKind::Rain => {
                if rng.random_ratio(1, 20) {
                    rng.random_range(0.2..4.0)
                } else {
                    0.0
                }
            }
            SensorKind::Sound => rng.random_range(180.0..320.0),
        };

        Ok(value)
    }
}
