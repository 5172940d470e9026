pub mod anomaly;
pub mod bucket;
pub mod calibration;
pub mod duration;
pub mod fleet;
pub mod mode;
pub mod retention;

use std::fmt;

use jiff::SignedDuration;
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calibration::CalibrationInfo;

type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(pub Ulid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HiveId(pub Ulid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Ulid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Ulid);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for HiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target of a mode-change intent or an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Sensor(SensorId),
    Hive(HiveId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hive {
    pub id: HiveId,
    pub name: BoxStr,
    /// IANA time zone name, e.g. `Europe/Berlin`.
    pub timezone: BoxStr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Weight,
    Rain,
    Sound,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Weight => "weight",
            SensorKind::Rain => "rain",
            SensorKind::Sound => "sound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Active,
    Error,
}

/// A configured sensor. The current collection mode is owned by the edge
/// scheduler and the last value by the hub's last-value cache, so neither
/// is stored here.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub id: SensorId,
    pub hive_id: HiveId,
    pub name: BoxStr,
    pub kind: SensorKind,
    pub valid_range: Option<ValidRange>,
    pub calibration: Option<CalibrationInfo>,
    pub collection_interval: Option<SignedDuration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: SensorId,
    pub value: NotNan<f64>,
    pub timestamp: jiff::Timestamp,
}

impl Reading {
    /// Returns `None` for NaN values.
    pub fn new(sensor_id: SensorId, value: f64, timestamp: jiff::Timestamp) -> Option<Self> {
        Some(Self {
            sensor_id,
            value: NotNan::new(value).ok()?,
            timestamp,
        })
    }

    pub fn value(&self) -> f64 {
        self.value.into_inner()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingFlag {
    Valid,
    OutOfRange,
}

/// A reading as persisted by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredReading {
    pub reading: Reading,
    pub flag: ReadingFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub sensor_id: SensorId,
    pub tier: BoxStr,
    pub bucket_start: jiff::Timestamp,
    pub bucket_end: jiff::Timestamp,
    pub min: NotNan<f64>,
    pub max: NotNan<f64>,
    pub avg: NotNan<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestBatchRequest {
    pub id: BatchId,
    pub device_id: DeviceId,
    pub readings: BoxList<Reading>,
    pub sent_at: jiff::Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestBatchResponse {
    pub id: BatchId,
    /// One outcome per record, in request order.
    pub outcomes: BoxList<RecordOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordOutcome {
    Accepted,
    /// Persisted but outside the sensor's valid range.
    Flagged,
    Rejected(RejectReason),
}

impl RecordOutcome {
    /// Whether the sender should keep the record and try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecordOutcome::Rejected(RejectReason::Internal))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    UnknownSensor,
    FutureTimestamp,
    BeyondRetention,
    Internal,
}
