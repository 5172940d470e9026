//! Per-sensor collection modes and sampling intervals.
//!
//! The scheduler is advisory: it answers which sensors are due and at what
//! interval, while the collection loop performs the reads.

use std::collections::{BTreeMap, HashMap};

use hivewatch_core::{
    Hive, HiveId, Scope, Sensor, SensorId,
    mode::{CollectionMode, ModeIntent, ModeRequest, ModeStack},
};
use jiff::{SignedDuration, Timestamp, civil::Time, tz::TimeZone};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("hive {hive} has unknown time zone `{timezone}`: {source}")]
    UnknownTimeZone {
        hive: HiveId,
        timezone: String,
        source: jiff::Error,
    },
    #[error("sensor {sensor} references unknown hive {hive}")]
    UnknownHive { sensor: SensorId, hive: HiveId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub day_interval: SignedDuration,
    pub night_interval: SignedDuration,
    /// Start of the hive-local day, inclusive.
    pub day_start: Time,
    /// End of the hive-local day, exclusive.
    pub day_end: Time,
    pub high_frequency_interval: SignedDuration,
    pub rainfall_interval: SignedDuration,
    pub user_triggered_interval: SignedDuration,
    pub user_triggered_duration: SignedDuration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            day_interval: SignedDuration::from_mins(1),
            night_interval: SignedDuration::from_mins(10),
            day_start: Time::constant(4, 0, 0, 0),
            day_end: Time::constant(22, 0, 0, 0),
            high_frequency_interval: SignedDuration::from_mins(1),
            rainfall_interval: SignedDuration::from_mins(5),
            user_triggered_interval: SignedDuration::from_secs(20),
            user_triggered_duration: SignedDuration::from_mins(20),
        }
    }
}

impl ScheduleConfig {
    fn is_day(&self, local: Time) -> bool {
        if self.day_start <= self.day_end {
            local >= self.day_start && local < self.day_end
        } else {
            // day window wraps past midnight
            local >= self.day_start || local < self.day_end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub sensor_id: SensorId,
    pub from: CollectionMode,
    pub to: CollectionMode,
    pub at: Timestamp,
}

#[derive(Debug)]
struct SensorSchedule {
    hive_id: HiveId,
    normal_interval: Option<SignedDuration>,
    requests: ModeStack,
    current: CollectionMode,
    last_sample: Option<Timestamp>,
}

#[derive(Debug)]
pub struct CollectionScheduler {
    config: ScheduleConfig,
    timezones: HashMap<HiveId, TimeZone>,
    sensors: BTreeMap<SensorId, SensorSchedule>,
}

impl CollectionScheduler {
    pub fn new(
        config: ScheduleConfig,
        hives: &[Hive],
        sensors: &[Sensor],
    ) -> Result<Self, SchedulerError> {
        let mut timezones = HashMap::new();
        for hive in hives {
            let tz = TimeZone::get(&hive.timezone).map_err(|source| {
                SchedulerError::UnknownTimeZone {
                    hive: hive.id,
                    timezone: hive.timezone.to_string(),
                    source,
                }
            })?;
            timezones.insert(hive.id, tz);
        }

        let mut schedules = BTreeMap::new();
        for sensor in sensors {
            if !timezones.contains_key(&sensor.hive_id) {
                return Err(SchedulerError::UnknownHive {
                    sensor: sensor.id,
                    hive: sensor.hive_id,
                });
            }
            schedules.insert(
                sensor.id,
                SensorSchedule {
                    hive_id: sensor.hive_id,
                    normal_interval: sensor.collection_interval,
                    requests: ModeStack::default(),
                    current: CollectionMode::Normal,
                    last_sample: None,
                },
            );
        }

        Ok(Self {
            config,
            timezones,
            sensors: schedules,
        })
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Effective mode of a sensor at `now`.
    pub fn mode(&self, sensor_id: SensorId, now: Timestamp) -> Option<CollectionMode> {
        let schedule = self.sensors.get(&sensor_id)?;
        Some(self.effective_mode(schedule, now))
    }

    fn effective_mode(&self, schedule: &SensorSchedule, now: Timestamp) -> CollectionMode {
        if let Some(mode) = schedule.requests.active(now) {
            return mode;
        }
        let is_day = self
            .timezones
            .get(&schedule.hive_id)
            .is_none_or(|tz| self.config.is_day(now.to_zoned(tz.clone()).time()));
        if is_day {
            CollectionMode::Normal
        } else {
            CollectionMode::NightReduced
        }
    }

    fn interval_for_mode(&self, schedule: &SensorSchedule, mode: &CollectionMode) -> SignedDuration {
        let normal = schedule.normal_interval.unwrap_or(self.config.day_interval);
        match mode {
            CollectionMode::Normal => normal,
            CollectionMode::NightReduced => self.config.night_interval.max(normal),
            CollectionMode::Rainfall { .. } => self.config.rainfall_interval,
            CollectionMode::HighFrequency { .. } => self.config.high_frequency_interval,
            CollectionMode::UserTriggered { .. } => self.config.user_triggered_interval,
        }
    }

    pub fn next_interval_for(&self, sensor_id: SensorId, now: Timestamp) -> Option<SignedDuration> {
        let schedule = self.sensors.get(&sensor_id)?;
        let mode = self.effective_mode(schedule, now);
        Some(self.interval_for_mode(schedule, &mode))
    }

    /// Sensors whose next sample is due at `now`, after applying any
    /// mode expirations.
    pub fn due_sensors(&mut self, now: Timestamp) -> Vec<SensorId> {
        self.refresh(now);
        self.sensors
            .iter()
            .filter(|(_, s)| {
                let interval = self.interval_for_mode(s, &s.current);
                s.last_sample.is_none_or(|last| now >= last + interval)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn mark_sampled(&mut self, sensor_id: SensorId, at: Timestamp) {
        if let Some(schedule) = self.sensors.get_mut(&sensor_id) {
            schedule.last_sample = Some(at);
        }
    }

    /// Records a mode request for every sensor the intent targets.
    pub fn apply_intent(&mut self, intent: &ModeIntent, now: Timestamp) -> Vec<ModeTransition> {
        for (id, schedule) in self.sensors.iter_mut() {
            let targeted = match intent.scope {
                Scope::Sensor(sensor_id) => *id == sensor_id,
                Scope::Hive(hive_id) => schedule.hive_id == hive_id,
            };
            if targeted {
                schedule.requests.apply(&intent.request, now);
            }
        }
        self.refresh(now)
    }

    /// Operator override: high-resolution sampling for the configured duration.
    pub fn user_trigger(&mut self, scope: Scope, now: Timestamp) -> Vec<ModeTransition> {
        let intent = ModeIntent {
            scope,
            request: ModeRequest::UserTriggered {
                expires_at: now + self.config.user_triggered_duration,
            },
        };
        self.apply_intent(&intent, now)
    }

    /// Drops expired requests and logs every change of effective mode.
    pub fn refresh(&mut self, now: Timestamp) -> Vec<ModeTransition> {
        let mut transitions = Vec::new();
        let ids: Vec<SensorId> = self.sensors.keys().copied().collect();

        for id in ids {
            let Some(schedule) = self.sensors.get(&id) else {
                continue;
            };
            let mut requests = schedule.requests;
            requests.expire(now);

            let mut next = SensorSchedule {
                requests,
                ..*schedule
            };
            let to = self.effective_mode(&next, now);
            let from = next.current;
            next.current = to;

            if from != to {
                info!(
                    sensor_id = %id,
                    from = from.label(),
                    to = to.label(),
                    expires_at = ?to.expires_at(),
                    at = %now,
                    "collection mode changed"
                );
                transitions.push(ModeTransition {
                    sensor_id: id,
                    from,
                    to,
                    at: now,
                });
            }
            self.sensors.insert(id, next);
        }

        transitions
    }
}
