//! Hive and sensor definitions as they appear in configuration files.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{
    Hive, HiveId, Sensor, SensorId, SensorKind, ValidRange, calibration::CalibrationInfo,
    duration::HumanDuration,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveConfig {
    pub id: Ulid,
    pub name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl HiveConfig {
    pub fn to_hive(&self) -> Hive {
        Hive {
            id: HiveId(self.id),
            name: self.name.as_str().into(),
            timezone: self.timezone.as_str().into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: Ulid,
    pub hive_id: Ulid,
    pub name: String,
    pub kind: SensorKind,
    pub min_valid: Option<f64>,
    pub max_valid: Option<f64>,
    #[serde(default)]
    pub collection: CollectionConfig,
    pub calibration: Option<CalibrationInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub interval: Option<HumanDuration>,
}

impl SensorConfig {
    pub fn to_sensor(&self) -> Sensor {
        let valid_range = match (self.min_valid, self.max_valid) {
            (None, None) => None,
            (min, max) => Some(ValidRange {
                min: min.unwrap_or(f64::NEG_INFINITY),
                max: max.unwrap_or(f64::INFINITY),
            }),
        };

        Sensor {
            id: SensorId(self.id),
            hive_id: HiveId(self.hive_id),
            name: self.name.as_str().into(),
            kind: self.kind,
            valid_range,
            calibration: self.calibration.clone(),
            collection_interval: self.collection.interval.map(|d| d.get()),
        }
    }
}
