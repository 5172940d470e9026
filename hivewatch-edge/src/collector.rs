//! The device's collection loop.
//!
//! Each tick asks the scheduler which sensors are due and spawns one task
//! per due sensor: read, calibrate, detect, append to the buffer. Tasks
//! report detections back to the loop, which is the only owner of the
//! scheduler, so mode changes are applied one at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hivewatch_core::{
    HiveId, Reading, Scope, Sensor, SensorId, SensorKind,
    anomaly::{self, Detection, DetectorConfig, SensorContext},
    calibration,
};
use jiff::Timestamp;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::LocalBuffer;
use crate::reader::{SensorReader, retry::RetryingReader, retry::SensorHealth};
use crate::scheduler::{CollectionScheduler, ModeTransition};

const MAX_HISTORY: usize = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorCommand {
    UserTrigger { scope: Scope },
}

/// Sends operator commands into a running collector.
#[derive(Clone)]
pub struct CollectorHandle {
    commands: mpsc::Sender<CollectorCommand>,
}

impl CollectorHandle {
    /// Returns `false` when the collector has stopped.
    pub async fn user_trigger(&self, scope: Scope) -> bool {
        self.commands
            .send(CollectorCommand::UserTrigger { scope })
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub sensor_id: SensorId,
    pub reading: Option<Reading>,
    pub detection: Detection,
}

impl SampleOutcome {
    fn nothing(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            reading: None,
            detection: Detection::default(),
        }
    }
}

struct Shared<R> {
    reader: RetryingReader<R>,
    buffer: Arc<LocalBuffer>,
    detector: DetectorConfig,
    clock: Clock,
    /// Recent calibrated readings per sensor, oldest first.
    history: DashMap<SensorId, VecDeque<Reading>>,
    /// Latest hive temperature, used for temperature compensation.
    ambient: DashMap<HiveId, f64>,
}

impl<R: SensorReader> Shared<R> {
    fn calibrate(&self, sensor: &Sensor, raw: f64) -> f64 {
        let Some(info) = &sensor.calibration else {
            return raw;
        };
        let ambient = match sensor.kind {
            SensorKind::Temperature => None,
            _ => self.ambient.get(&sensor.hive_id).map(|v| *v),
        };

        match calibration::apply_compensated(raw, info, ambient) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    sensor_id = %sensor.id,
                    name = %sensor.name,
                    raw,
                    error = %e,
                    "calibration failed, recording raw value"
                );
                raw
            }
        }
    }

    /// Adds `reading` to the window and returns the window as it was before.
    fn remember(&self, reading: Reading) -> Vec<Reading> {
        let mut window = self.history.entry(reading.sensor_id).or_default();
        let cutoff = reading.timestamp - self.detector.spike_window;
        while window.front().is_some_and(|r| r.timestamp < cutoff) {
            window.pop_front();
        }

        let before = window.iter().copied().collect();
        window.push_back(reading);
        if window.len() > MAX_HISTORY {
            window.pop_front();
        }
        before
    }
}

async fn sample_sensor<R: SensorReader>(shared: Arc<Shared<R>>, sensor: Arc<Sensor>) -> SampleOutcome {
    let raw = match shared.reader.read(&sensor).await {
        Ok(raw) => raw,
        Err(e) => {
            let health = shared.reader.health(sensor.id);
            debug!(
                sensor_id = %sensor.id,
                error = %e,
                status = ?health.status,
                failures = health.consecutive_failures,
                circuit = ?health.circuit,
                "sensor read failed"
            );
            return SampleOutcome::nothing(sensor.id);
        }
    };

    let value = shared.calibrate(&sensor, raw);
    if sensor.kind == SensorKind::Temperature {
        shared.ambient.insert(sensor.hive_id, value);
    }

    let Some(reading) = Reading::new(sensor.id, value, (shared.clock)()) else {
        warn!(sensor_id = %sensor.id, raw, "sensor produced NaN, skipping");
        return SampleOutcome::nothing(sensor.id);
    };

    let history = shared.remember(reading);
    let detection = anomaly::evaluate(
        &shared.detector,
        &SensorContext::from(sensor.as_ref()),
        &reading,
        &history,
    );
    shared.buffer.append(reading).await;

    SampleOutcome {
        sensor_id: sensor.id,
        reading: Some(reading),
        detection,
    }
}

pub struct Collector<R> {
    shared: Arc<Shared<R>>,
    sensors: HashMap<SensorId, Arc<Sensor>>,
    scheduler: CollectionScheduler,
    tick: Duration,
    commands: mpsc::Receiver<CollectorCommand>,
}

impl<R: SensorReader> Collector<R> {
    pub fn new(
        reader: RetryingReader<R>,
        buffer: Arc<LocalBuffer>,
        detector: DetectorConfig,
        scheduler: CollectionScheduler,
        sensors: Vec<Sensor>,
        tick: Duration,
    ) -> (Self, CollectorHandle) {
        let (tx, rx) = mpsc::channel(16);
        let collector = Self {
            shared: Arc::new(Shared {
                reader,
                buffer,
                detector,
                clock: Arc::new(Timestamp::now),
                history: DashMap::new(),
                ambient: DashMap::new(),
            }),
            sensors: sensors.into_iter().map(|s| (s.id, Arc::new(s))).collect(),
            scheduler,
            tick,
            commands: rx,
        };
        (collector, CollectorHandle { commands: tx })
    }

    /// Replaces the wall clock, e.g. with a simulated one.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.clock = clock;
        }
        self
    }

    fn now(&self) -> Timestamp {
        (self.shared.clock)()
    }

    pub fn scheduler(&self) -> &CollectionScheduler {
        &self.scheduler
    }

    pub fn health(&self, sensor_id: SensorId) -> SensorHealth {
        self.shared.reader.health(sensor_id)
    }

    pub fn user_trigger(&mut self, scope: Scope) -> Vec<ModeTransition> {
        let now = self.now();
        info!(?scope, "user triggered high-resolution sampling");
        self.scheduler.user_trigger(scope, now)
    }

    /// Samples one sensor inline, outside of the tick loop.
    pub async fn sample_now(&mut self, sensor_id: SensorId) -> Option<SampleOutcome> {
        let sensor = Arc::clone(self.sensors.get(&sensor_id)?);
        self.scheduler.mark_sampled(sensor_id, self.now());
        let outcome = sample_sensor(Arc::clone(&self.shared), sensor).await;
        self.apply_detection(&outcome);
        Some(outcome)
    }

    fn apply_detection(&mut self, outcome: &SampleOutcome) {
        if outcome.detection.is_empty() {
            return;
        }
        for event in &outcome.detection.events {
            info!(
                sensor_id = %outcome.sensor_id,
                kind = ?event.kind,
                scope = ?event.scope,
                value = event.trigger_value,
                detected_at = %event.detected_at,
                "anomaly detected"
            );
        }
        let now = self.now();
        for intent in &outcome.detection.intents {
            self.scheduler.apply_intent(intent, now);
        }
    }

    fn dispatch_due(
        &mut self,
        tasks: &mut JoinSet<SampleOutcome>,
        in_flight: &mut HashMap<tokio::task::Id, SensorId>,
    ) {
        let now = self.now();
        for sensor_id in self.scheduler.due_sensors(now) {
            // a slow read must not pile up behind itself
            if in_flight.values().any(|id| *id == sensor_id) {
                continue;
            }
            let Some(sensor) = self.sensors.get(&sensor_id) else {
                continue;
            };
            self.scheduler.mark_sampled(sensor_id, now);
            let handle = tasks.spawn(sample_sensor(Arc::clone(&self.shared), Arc::clone(sensor)));
            in_flight.insert(handle.id(), sensor_id);
        }
    }

    fn on_joined(
        &mut self,
        joined: Result<(tokio::task::Id, SampleOutcome), tokio::task::JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, SensorId>,
    ) {
        match joined {
            Ok((task_id, outcome)) => {
                in_flight.remove(&task_id);
                self.apply_detection(&outcome);
            }
            Err(e) => {
                let sensor_id = in_flight.remove(&e.id());
                if e.is_panic() {
                    error!(?sensor_id, error = %e, "sampling task panicked");
                }
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            sensors = self.sensors.len(),
            tick = ?self.tick,
            "collector started"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.dispatch_due(&mut tasks, &mut in_flight),
                Some(command) = self.commands.recv() => match command {
                    CollectorCommand::UserTrigger { scope } => {
                        self.user_trigger(scope);
                    }
                },
                Some(joined) = tasks.join_next_with_id() => self.on_joined(joined, &mut in_flight),
            }
        }

        info!(in_flight = in_flight.len(), "collector stopping");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next_with_id().await {
                self.on_joined(joined, &mut in_flight);
            }
        })
        .await;
        if drained.is_err() {
            warn!(aborted = tasks.len(), "abandoning slow sensor reads");
            tasks.shutdown().await;
        }
        self.shared.buffer.nudge();
        info!("collector stopped");
    }
}
