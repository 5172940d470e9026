use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hivewatch_core::{
    Hive, HiveId, Scope, Sensor, SensorId, SensorKind, ValidRange,
    anomaly::{AnomalyKind, DetectorConfig},
    calibration::{CalibrationInfo, CalibrationMethod},
    mode::{CollectionMode, HighFrequencyReason, ModePriority},
};
use hivewatch_edge::{
    buffer::{BufferConfig, LocalBuffer},
    collector::{Clock, Collector},
    reader::{
        ReadError, SensorReader,
        retry::{BreakerConfig, RetryPolicy, RetryingReader},
    },
    scheduler::{CollectionScheduler, ScheduleConfig},
};
use jiff::{SignedDuration, Timestamp};
use ulid::Ulid;

/// Returns queued values per sensor; an empty queue is a hardware error.
#[derive(Clone, Default)]
struct QueuedReader {
    values: Arc<Mutex<HashMap<SensorId, VecDeque<f64>>>>,
}

impl QueuedReader {
    fn push(&self, sensor: SensorId, value: f64) {
        self.values
            .lock()
            .unwrap()
            .entry(sensor)
            .or_default()
            .push_back(value);
    }
}

#[async_trait]
impl SensorReader for QueuedReader {
    async fn read(&self, sensor: &Sensor) -> Result<f64, ReadError> {
        self.values
            .lock()
            .unwrap()
            .get_mut(&sensor.id)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| ReadError::Hardware("no value queued".into()))
    }
}

struct ManualClock(Mutex<Timestamp>);

impl ManualClock {
    fn set(&self, ts: Timestamp) {
        *self.0.lock().unwrap() = ts;
    }
}

struct Rig {
    collector: Collector<QueuedReader>,
    reader: QueuedReader,
    clock: Arc<ManualClock>,
    buffer: Arc<LocalBuffer>,
    hive: HiveId,
    temp: SensorId,
    humidity: SensorId,
}

fn t0() -> Timestamp {
    "2024-06-01T10:00:00Z".parse().unwrap()
}

fn rig() -> Rig {
    let hive = HiveId(Ulid::new());
    let temp = SensorId(Ulid::new());
    let humidity = SensorId(Ulid::new());

    let sensors = vec![
        Sensor {
            id: temp,
            hive_id: hive,
            name: "temp_01".into(),
            kind: SensorKind::Temperature,
            valid_range: Some(ValidRange {
                min: -20.0,
                max: 60.0,
            }),
            calibration: None,
            collection_interval: None,
        },
        Sensor {
            id: humidity,
            hive_id: hive,
            name: "hum_01".into(),
            kind: SensorKind::Humidity,
            valid_range: Some(ValidRange {
                min: 0.0,
                max: 100.0,
            }),
            // method missing on purpose: the raw value must still be recorded
            calibration: Some(CalibrationInfo {
                method: None,
                offset: Some(1.0),
                ..Default::default()
            }),
            collection_interval: None,
        },
    ];

    let schedule = ScheduleConfig {
        day_interval: SignedDuration::from_mins(5),
        ..ScheduleConfig::default()
    };
    let scheduler = CollectionScheduler::new(
        schedule,
        &[Hive {
            id: hive,
            name: "north".into(),
            timezone: "UTC".into(),
        }],
        &sensors,
    )
    .unwrap();

    let reader = QueuedReader::default();
    let retrying = RetryingReader::new(
        reader.clone(),
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
        BreakerConfig::default(),
    );
    let buffer = Arc::new(LocalBuffer::new(BufferConfig::default()));
    let clock = Arc::new(ManualClock(Mutex::new(t0())));
    let clock_fn: Clock = {
        let clock = Arc::clone(&clock);
        Arc::new(move || *clock.0.lock().unwrap())
    };

    let (collector, _handle) = Collector::new(
        retrying,
        Arc::clone(&buffer),
        DetectorConfig::default(),
        scheduler,
        sensors,
        std::time::Duration::from_secs(1),
    );

    Rig {
        collector: collector.with_clock(clock_fn),
        reader,
        clock,
        buffer,
        hive,
        temp,
        humidity,
    }
}

#[tokio::test]
async fn temperature_spike_raises_sampling_rate_for_an_hour() {
    let mut rig = rig();

    rig.reader.push(rig.temp, 20.0);
    let first = rig.collector.sample_now(rig.temp).await.unwrap();
    assert!(first.detection.is_empty());

    rig.clock.set(t0() + SignedDuration::from_mins(30));
    rig.reader.push(rig.temp, 26.5);
    let second = rig.collector.sample_now(rig.temp).await.unwrap();
    assert_eq!(second.detection.events[0].kind, AnomalyKind::TemperatureSpike);

    let now = t0() + SignedDuration::from_mins(30);
    let scheduler = rig.collector.scheduler();
    assert_eq!(
        scheduler.mode(rig.temp, now),
        Some(CollectionMode::HighFrequency {
            reason: HighFrequencyReason::TemperatureSpike,
            expires_at: now + SignedDuration::from_hours(1),
        })
    );
    assert_eq!(
        scheduler.next_interval_for(rig.temp, now),
        Some(SignedDuration::from_secs(60))
    );
    // sensor-scoped: the other sensor of the hive is untouched
    assert_eq!(scheduler.mode(rig.humidity, now), Some(CollectionMode::Normal));

    let after = now + SignedDuration::from_hours(1);
    assert_eq!(scheduler.mode(rig.temp, after), Some(CollectionMode::Normal));
    assert_eq!(
        scheduler.next_interval_for(rig.temp, after),
        Some(SignedDuration::from_mins(5))
    );

    assert_eq!(rig.buffer.len().await, 2);
}

#[tokio::test]
async fn user_trigger_is_not_preempted_by_range_anomaly() {
    let mut rig = rig();

    rig.collector.user_trigger(Scope::Hive(rig.hive));
    assert_eq!(
        rig.collector
            .scheduler()
            .next_interval_for(rig.temp, t0()),
        Some(SignedDuration::from_secs(20))
    );

    let anomaly_at = t0() + SignedDuration::from_mins(5);
    rig.clock.set(anomaly_at);
    rig.reader.push(rig.humidity, 140.0);
    let outcome = rig.collector.sample_now(rig.humidity).await.unwrap();
    assert_eq!(outcome.detection.events[0].kind, AnomalyKind::RangeAnomaly);

    let scheduler = rig.collector.scheduler();
    for sensor in [rig.temp, rig.humidity] {
        for minute in [5, 10, 19] {
            let at = t0() + SignedDuration::from_mins(minute);
            assert_eq!(
                scheduler.mode(sensor, at).map(|m| m.priority()),
                Some(ModePriority::UserTriggered)
            );
        }
        let expired = t0() + SignedDuration::from_mins(20);
        assert_eq!(
            scheduler.mode(sensor, expired).map(|m| m.priority()),
            Some(ModePriority::HighFrequency)
        );
    }
}

#[tokio::test]
async fn calibration_failure_falls_back_to_raw_value() {
    let mut rig = rig();

    rig.reader.push(rig.humidity, 55.0);
    let outcome = rig.collector.sample_now(rig.humidity).await.unwrap();
    assert_eq!(outcome.reading.map(|r| r.value()), Some(55.0));

    let buffered = rig.buffer.flush().await;
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].timestamp, t0());
}

#[tokio::test]
async fn failed_reads_are_reported_through_sensor_health() {
    let mut rig = rig();

    let outcome = rig.collector.sample_now(rig.temp).await.unwrap();
    assert_eq!(outcome.reading, None);

    let health = rig.collector.health(rig.temp);
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(health.status, hivewatch_core::SensorStatus::Error);
    assert!(rig.buffer.is_empty().await);
}

#[test]
fn calibration_method_names_parse() {
    let info: CalibrationInfo =
        toml::from_str("method = \"polynomial\"\ncoefficients = [0.0, 1.0]").unwrap();
    assert_eq!(info.method, Some(CalibrationMethod::Polynomial));
}
