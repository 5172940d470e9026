//! Rule-based anomaly detection over a sensor's recent readings.
//!
//! The detector is stateless: the caller owns the sliding window of recent
//! calibrated readings and passes it in on every evaluation. Each rule
//! category fires independently of the others.

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};

use crate::{
    HiveId, Reading, Scope, Sensor, SensorId, SensorKind, ValidRange,
    mode::{HighFrequencyReason, ModeIntent, ModeRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    TemperatureSpike,
    RainfallEvent,
    RangeAnomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub scope: Scope,
    pub kind: AnomalyKind,
    pub detected_at: Timestamp,
    pub trigger_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Absolute temperature change that counts as a spike.
    pub trigger_threshold: f64,
    /// How far back the spike reference reading is taken from.
    pub spike_window: SignedDuration,
    /// Lifetime of the high-frequency mode requested by spikes and range anomalies.
    pub high_frequency_duration: SignedDuration,
    /// Rain readings strictly above this count as active rain.
    pub rain_threshold: f64,
    /// Lifetime of the rainfall mode after the latest active rain reading.
    pub rain_hold: SignedDuration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 5.0,
            spike_window: SignedDuration::from_hours(1),
            high_frequency_duration: SignedDuration::from_hours(1),
            rain_threshold: 0.0,
            rain_hold: SignedDuration::from_mins(30),
        }
    }
}

/// The parts of a sensor the rules look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorContext {
    pub sensor_id: SensorId,
    pub hive_id: HiveId,
    pub kind: SensorKind,
    pub valid_range: Option<ValidRange>,
}

impl From<&Sensor> for SensorContext {
    fn from(sensor: &Sensor) -> Self {
        Self {
            sensor_id: sensor.id,
            hive_id: sensor.hive_id,
            kind: sensor.kind,
            valid_range: sensor.valid_range,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub events: Vec<AnomalyEvent>,
    pub intents: Vec<ModeIntent>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.intents.is_empty()
    }
}

/// Evaluates `current` against `history`, the sensor's previous readings
/// ordered oldest first.
pub fn evaluate(
    config: &DetectorConfig,
    sensor: &SensorContext,
    current: &Reading,
    history: &[Reading],
) -> Detection {
    let mut detection = Detection::default();
    let now = current.timestamp;
    let value = current.value();

    if sensor.kind == SensorKind::Temperature
        && let Some(reference) = spike_reference(config, current, history)
        && (value - reference.value()).abs() > config.trigger_threshold
    {
        let scope = Scope::Sensor(sensor.sensor_id);
        detection.events.push(AnomalyEvent {
            scope,
            kind: AnomalyKind::TemperatureSpike,
            detected_at: now,
            trigger_value: value,
        });
        detection.intents.push(ModeIntent {
            scope,
            request: ModeRequest::HighFrequency {
                reason: HighFrequencyReason::TemperatureSpike,
                expires_at: now + config.high_frequency_duration,
            },
        });
    }

    if sensor.kind == SensorKind::Rain {
        let scope = Scope::Hive(sensor.hive_id);
        if value > config.rain_threshold {
            detection.events.push(AnomalyEvent {
                scope,
                kind: AnomalyKind::RainfallEvent,
                detected_at: now,
                trigger_value: value,
            });
            detection.intents.push(ModeIntent {
                scope,
                request: ModeRequest::Rainfall {
                    expires_at: now + config.rain_hold,
                },
            });
        } else if history
            .last()
            .is_some_and(|prev| prev.value() > config.rain_threshold)
        {
            detection.intents.push(ModeIntent {
                scope,
                request: ModeRequest::EndRainfall,
            });
        }
    }

    if let Some(range) = sensor.valid_range
        && !range.contains(value)
    {
        // One failing sensor may signal a hive-level condition.
        let scope = Scope::Hive(sensor.hive_id);
        detection.events.push(AnomalyEvent {
            scope,
            kind: AnomalyKind::RangeAnomaly,
            detected_at: now,
            trigger_value: value,
        });
        detection.intents.push(ModeIntent {
            scope,
            request: ModeRequest::HighFrequency {
                reason: HighFrequencyReason::RangeAnomaly,
                expires_at: now + config.high_frequency_duration,
            },
        });
    }

    detection
}

/// Oldest reading inside the trailing spike window.
fn spike_reference<'a>(
    config: &DetectorConfig,
    current: &Reading,
    history: &'a [Reading],
) -> Option<&'a Reading> {
    let window_start = current.timestamp - config.spike_window;
    history
        .iter()
        .find(|r| r.timestamp >= window_start && r.timestamp < current.timestamp)
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn t(mins: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH + SignedDuration::from_mins(mins)
    }

    fn ctx(kind: SensorKind, range: Option<ValidRange>) -> SensorContext {
        SensorContext {
            sensor_id: SensorId(Ulid::from_parts(1, 1)),
            hive_id: HiveId(Ulid::from_parts(1, 2)),
            kind,
            valid_range: range,
        }
    }

    fn reading(ctx: &SensorContext, mins: i64, value: f64) -> Reading {
        Reading::new(ctx.sensor_id, value, t(mins)).unwrap()
    }

    #[test]
    fn temperature_spike_within_the_hour() {
        let sensor = ctx(SensorKind::Temperature, None);
        let history = [reading(&sensor, 0, 20.0)];
        let current = reading(&sensor, 30, 26.5);

        let detection = evaluate(&DetectorConfig::default(), &sensor, &current, &history);

        assert_eq!(detection.events.len(), 1);
        assert_eq!(detection.events[0].kind, AnomalyKind::TemperatureSpike);
        assert_eq!(detection.events[0].scope, Scope::Sensor(sensor.sensor_id));
        assert_eq!(
            detection.intents[0].request,
            ModeRequest::HighFrequency {
                reason: HighFrequencyReason::TemperatureSpike,
                expires_at: t(90),
            }
        );
    }

    #[test]
    fn no_spike_when_reference_is_outside_the_window() {
        let sensor = ctx(SensorKind::Temperature, None);
        let history = [reading(&sensor, 0, 20.0)];
        let current = reading(&sensor, 61, 26.5);

        assert!(evaluate(&DetectorConfig::default(), &sensor, &current, &history).is_empty());
    }

    #[test]
    fn spikes_only_apply_to_temperature_sensors() {
        let sensor = ctx(SensorKind::Weight, None);
        let history = [reading(&sensor, 0, 20.0)];
        let current = reading(&sensor, 10, 40.0);

        assert!(evaluate(&DetectorConfig::default(), &sensor, &current, &history).is_empty());
    }

    #[test]
    fn range_anomaly_targets_the_whole_hive() {
        let sensor = ctx(
            SensorKind::Humidity,
            Some(ValidRange {
                min: 0.0,
                max: 100.0,
            }),
        );
        let current = reading(&sensor, 0, 140.0);

        let detection = evaluate(&DetectorConfig::default(), &sensor, &current, &[]);
        assert_eq!(detection.events[0].kind, AnomalyKind::RangeAnomaly);
        assert_eq!(detection.intents[0].scope, Scope::Hive(sensor.hive_id));
    }

    #[test]
    fn rain_starts_and_ends_rainfall_mode() {
        let sensor = ctx(SensorKind::Rain, None);
        let config = DetectorConfig::default();

        let raining = reading(&sensor, 0, 1.2);
        let detection = evaluate(&config, &sensor, &raining, &[]);
        assert_eq!(detection.events[0].kind, AnomalyKind::RainfallEvent);
        assert_eq!(
            detection.intents[0].request,
            ModeRequest::Rainfall { expires_at: t(30) }
        );

        let dry = reading(&sensor, 5, 0.0);
        let detection = evaluate(&config, &sensor, &dry, &[raining]);
        assert!(detection.events.is_empty());
        assert_eq!(detection.intents[0].request, ModeRequest::EndRainfall);

        let still_dry = reading(&sensor, 10, 0.0);
        assert!(evaluate(&config, &sensor, &still_dry, &[raining, dry]).is_empty());
    }

    #[test]
    fn categories_fire_independently() {
        let sensor = ctx(
            SensorKind::Temperature,
            Some(ValidRange {
                min: -20.0,
                max: 45.0,
            }),
        );
        let history = [reading(&sensor, 0, 30.0)];
        let current = reading(&sensor, 10, 50.0);

        let detection = evaluate(&DetectorConfig::default(), &sensor, &current, &history);
        let kinds: Vec<_> = detection.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![AnomalyKind::TemperatureSpike, AnomalyKind::RangeAnomaly]
        );
    }
}
