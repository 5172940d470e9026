use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use hivewatch_core::{
    Hive, Sensor,
    duration::HumanDuration,
    fleet::{HiveConfig, SensorConfig},
    retention::{RetentionError, TierConfig, table_from_configs},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::ingest::IngestConfig;
use crate::maintenance::MaintenanceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid retention table: {0}")]
    Retention(#[from] RetentionError),
    #[error("sensor `{sensor}` references unknown hive {hive}")]
    UnknownHive { sensor: String, hive: Ulid },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    #[serde(default)]
    pub hives: Vec<HiveConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(tiers) = &self.retention.tiers {
            table_from_configs(tiers)?;
        }
        for sensor in &self.sensors {
            if !self.hives.iter().any(|h| h.id == sensor.hive_id) {
                return Err(ConfigError::UnknownHive {
                    sensor: sensor.name.clone(),
                    hive: sensor.hive_id,
                });
            }
        }
        Ok(())
    }

    pub fn hives(&self) -> Vec<Hive> {
        self.hives.iter().map(HiveConfig::to_hive).collect()
    }

    pub fn sensors(&self) -> Vec<Sensor> {
        self.sensors.iter().map(SensorConfig::to_sensor).collect()
    }
}

/// Reads only the retention tiers from a config file, for live reloads.
///
/// Returns `None` when the file has no `[retention]` tiers.
pub fn load_retention_tiers(path: &Path) -> Result<Option<Vec<TierConfig>>, ConfigError> {
    #[derive(Deserialize)]
    struct RetentionOnly {
        #[serde(default)]
        retention: RetentionSection,
    }

    let content = std::fs::read_to_string(path)?;
    let parsed: RetentionOnly = toml::from_str(&content)?;
    if let Some(tiers) = &parsed.retention.tiers {
        table_from_configs(tiers)?;
    }
    Ok(parsed.retention.tiers)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    /// How far in the future a timestamp may be before it is rejected.
    pub clock_skew: HumanDuration,
    /// Age after which the latest value is reported as stale.
    pub last_value_staleness: HumanDuration,
    pub write_timeout: HumanDuration,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            clock_skew: HumanDuration::from_secs(30),
            last_value_staleness: HumanDuration::from_mins(15),
            write_timeout: HumanDuration::from_secs(5),
        }
    }
}

impl IngestSection {
    pub fn to_config(&self) -> IngestConfig {
        IngestConfig {
            clock_skew: self.clock_skew.get(),
            write_timeout: self.write_timeout.to_std(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionSection {
    /// `None` keeps whatever table the store already holds, or the defaults.
    pub tiers: Option<Vec<TierConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    /// How often the maintenance loop checks which jobs are due.
    pub tick: HumanDuration,
    pub prune_interval: HumanDuration,
    /// Extra time after a bucket ends before it is materialized.
    pub settle_delay: HumanDuration,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            tick: HumanDuration::from_mins(1),
            prune_interval: HumanDuration::from_hours(1),
            settle_delay: HumanDuration::from_mins(5),
        }
    }
}

impl MaintenanceSection {
    pub fn to_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            tick: self.tick.to_std(),
            prune_interval: self.prune_interval.to_std(),
        }
    }
}
