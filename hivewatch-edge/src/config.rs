use std::path::Path;

use hivewatch_core::{
    Hive, Sensor,
    anomaly::DetectorConfig,
    duration::HumanDuration,
    fleet::{HiveConfig, SensorConfig},
};
use jiff::civil::Time;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::{
    buffer::BufferConfig,
    forwarder::ForwarderConfig,
    reader::retry::{BreakerConfig, RetryBackoff, RetryPolicy},
    scheduler::ScheduleConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("sensor `{sensor}` references unknown hive {hive}")]
    UnknownHive { sensor: String, hive: Ulid },
    #[error("sensor `{0}` has min_valid greater than max_valid")]
    InvalidRange(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device_id: Ulid,
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub hives: Vec<HiveConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub reader: ReaderSection,
    #[serde(default)]
    pub forwarder: ForwarderSection,
}

fn default_hub_addr() -> String {
    "127.0.0.1:9100".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for sensor in &self.sensors {
            if !self.hives.iter().any(|h| h.id == sensor.hive_id) {
                return Err(ConfigError::UnknownHive {
                    sensor: sensor.name.clone(),
                    hive: sensor.hive_id,
                });
            }
            if let (Some(min), Some(max)) = (sensor.min_valid, sensor.max_valid)
                && min > max
            {
                return Err(ConfigError::InvalidRange(sensor.name.clone()));
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

/// How the device reaches the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkMode {
    Wifi { ssid: String },
    Sim { apn: String },
    Lan { interface: String },
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Lan {
            interface: "eth0".to_string(),
        }
    }
}

impl NetworkMode {
    pub fn label(&self) -> &'static str {
        match self {
            NetworkMode::Wifi { .. } => "wifi",
            NetworkMode::Sim { .. } => "sim",
            NetworkMode::Lan { .. } => "lan",
        }
    }

    /// Human-readable link description for logs.
    pub fn describe(&self) -> String {
        match self {
            NetworkMode::Wifi { ssid } => format!("wifi ssid={ssid}"),
            NetworkMode::Sim { apn } => format!("sim apn={apn}"),
            NetworkMode::Lan { interface } => format!("lan interface={interface}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub trigger_threshold: f64,
    /// Sampling interval while in high-frequency mode.
    pub high_frequency: HumanDuration,
    /// How long high-frequency mode lasts once triggered.
    pub duration: HumanDuration,
    pub rainfall_interval: HumanDuration,
    pub rain_threshold: f64,
    pub rain_hold: HumanDuration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 5.0,
            high_frequency: HumanDuration::from_mins(1),
            duration: HumanDuration::from_hours(1),
            rainfall_interval: HumanDuration::from_mins(5),
            rain_threshold: 0.0,
            rain_hold: HumanDuration::from_mins(30),
        }
    }
}

impl AdaptiveConfig {
    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            trigger_threshold: self.trigger_threshold,
            high_frequency_duration: self.duration.get(),
            rain_threshold: self.rain_threshold,
            rain_hold: self.rain_hold.get(),
            ..DetectorConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub day_interval: HumanDuration,
    pub night_interval: HumanDuration,
    pub day_start: Time,
    pub day_end: Time,
    pub user_triggered_interval: HumanDuration,
    pub user_triggered_duration: HumanDuration,
    /// Period of the collection loop.
    pub tick: HumanDuration,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        let defaults = ScheduleConfig::default();
        Self {
            day_interval: defaults.day_interval.into(),
            night_interval: defaults.night_interval.into(),
            day_start: defaults.day_start,
            day_end: defaults.day_end,
            user_triggered_interval: defaults.user_triggered_interval.into(),
            user_triggered_duration: defaults.user_triggered_duration.into(),
            tick: HumanDuration::from_secs(1),
        }
    }
}

impl Config {
    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            day_interval: self.schedule.day_interval.get(),
            night_interval: self.schedule.night_interval.get(),
            day_start: self.schedule.day_start,
            day_end: self.schedule.day_end,
            high_frequency_interval: self.adaptive.high_frequency.get(),
            rainfall_interval: self.adaptive.rainfall_interval.get(),
            user_triggered_interval: self.schedule.user_triggered_interval.get(),
            user_triggered_duration: self.schedule.user_triggered_duration.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub flush_size: usize,
    pub capacity: usize,
    pub flush_timeout: HumanDuration,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            flush_size: 100,
            capacity: 10_000,
            flush_timeout: HumanDuration::from_secs(30),
        }
    }
}

impl BufferSection {
    pub fn to_config(&self) -> BufferConfig {
        BufferConfig {
            flush_size: self.flush_size,
            capacity: self.capacity,
            flush_timeout: self.flush_timeout.to_std(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSection {
    pub max_retries: u32,
    pub retry_delay: HumanDuration,
    pub backoff: BackoffKind,
    pub failure_threshold: u32,
    pub cooldown: HumanDuration,
    pub max_cooldown: HumanDuration,
    pub read_timeout: HumanDuration,
}

impl Default for ReaderSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: HumanDuration::from_secs(1),
            backoff: BackoffKind::Exponential,
            failure_threshold: 5,
            cooldown: HumanDuration::from_secs(30),
            max_cooldown: HumanDuration::from_mins(10),
            read_timeout: HumanDuration::from_secs(5),
        }
    }
}

impl ReaderSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay.to_std(),
            backoff: match self.backoff {
                BackoffKind::Fixed => RetryBackoff::Fixed,
                BackoffKind::Exponential => RetryBackoff::Exponential,
            },
            read_timeout: self.read_timeout.to_std(),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            cooldown: self.cooldown.to_std(),
            max_cooldown: self.max_cooldown.to_std(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderSection {
    pub max_batch_bytes: usize,
    pub initial_backoff: HumanDuration,
    pub max_backoff: HumanDuration,
    pub max_consecutive_failures: u32,
    pub send_timeout: HumanDuration,
    pub bytes_per_second: Option<u64>,
}

impl Default for ForwarderSection {
    fn default() -> Self {
        let defaults = ForwarderConfig::default();
        Self {
            max_batch_bytes: defaults.max_batch_bytes,
            initial_backoff: HumanDuration::from_secs(1),
            max_backoff: HumanDuration::from_mins(5),
            max_consecutive_failures: defaults.max_consecutive_failures,
            send_timeout: HumanDuration::from_secs(10),
            bytes_per_second: None,
        }
    }
}

impl ForwarderSection {
    pub fn to_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            max_batch_bytes: self.max_batch_bytes,
            initial_backoff: self.initial_backoff.to_std(),
            max_backoff: self.max_backoff.to_std(),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
            send_timeout: self.send_timeout.to_std(),
            bytes_per_second: self.bytes_per_second,
        }
    }
}
