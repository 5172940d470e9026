use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HighFrequencyReason {
    TemperatureSpike,
    RangeAnomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionMode {
    Normal,
    NightReduced,
    Rainfall {
        expires_at: Timestamp,
    },
    HighFrequency {
        reason: HighFrequencyReason,
        expires_at: Timestamp,
    },
    UserTriggered {
        expires_at: Timestamp,
    },
}

/// Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModePriority {
    Normal,
    NightReduced,
    Rainfall,
    HighFrequency,
    UserTriggered,
}

impl CollectionMode {
    pub fn priority(&self) -> ModePriority {
        match self {
            CollectionMode::Normal => ModePriority::Normal,
            CollectionMode::NightReduced => ModePriority::NightReduced,
            CollectionMode::Rainfall { .. } => ModePriority::Rainfall,
            CollectionMode::HighFrequency { .. } => ModePriority::HighFrequency,
            CollectionMode::UserTriggered { .. } => ModePriority::UserTriggered,
        }
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        match self {
            CollectionMode::Normal | CollectionMode::NightReduced => None,
            CollectionMode::Rainfall { expires_at }
            | CollectionMode::HighFrequency { expires_at, .. }
            | CollectionMode::UserTriggered { expires_at } => Some(*expires_at),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CollectionMode::Normal => "normal",
            CollectionMode::NightReduced => "night_reduced",
            CollectionMode::Rainfall { .. } => "rainfall",
            CollectionMode::HighFrequency { .. } => "high_frequency",
            CollectionMode::UserTriggered { .. } => "user_triggered",
        }
    }
}

/// A request to enter (or leave) an elevated mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeRequest {
    HighFrequency {
        reason: HighFrequencyReason,
        expires_at: Timestamp,
    },
    Rainfall {
        expires_at: Timestamp,
    },
    EndRainfall,
    UserTriggered {
        expires_at: Timestamp,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeIntent {
    pub scope: Scope,
    pub request: ModeRequest,
}

/// Pending elevated-mode requests of one sensor, one slot per class.
///
/// Lower-priority requests are kept while a higher one is active and take
/// over once it expires, provided their own expiry has not passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeStack {
    user: Option<Timestamp>,
    high: Option<(HighFrequencyReason, Timestamp)>,
    rain: Option<Timestamp>,
}

impl ModeStack {
    /// Records a request. Requests that are already expired at `now` are ignored.
    pub fn apply(&mut self, request: &ModeRequest, now: Timestamp) {
        match *request {
            ModeRequest::UserTriggered { expires_at } if expires_at > now => {
                self.user = Some(expires_at);
            }
            ModeRequest::HighFrequency { reason, expires_at } if expires_at > now => {
                match self.high {
                    Some((_, current)) if current > now && current >= expires_at => {}
                    _ => self.high = Some((reason, expires_at)),
                }
            }
            ModeRequest::Rainfall { expires_at } if expires_at > now => {
                self.rain = Some(self.rain.map_or(expires_at, |r| r.max(expires_at)));
            }
            ModeRequest::EndRainfall => self.rain = None,
            _ => {}
        }
    }

    /// Drops every request whose expiry is at or before `now`.
    pub fn expire(&mut self, now: Timestamp) {
        if self.user.is_some_and(|t| t <= now) {
            self.user = None;
        }
        if self.high.is_some_and(|(_, t)| t <= now) {
            self.high = None;
        }
        if self.rain.is_some_and(|t| t <= now) {
            self.rain = None;
        }
    }

    /// The highest-priority live request, if any.
    pub fn active(&self, now: Timestamp) -> Option<CollectionMode> {
        if let Some(expires_at) = self.user
            && expires_at > now
        {
            return Some(CollectionMode::UserTriggered { expires_at });
        }
        if let Some((reason, expires_at)) = self.high
            && expires_at > now
        {
            return Some(CollectionMode::HighFrequency { reason, expires_at });
        }
        if let Some(expires_at) = self.rain
            && expires_at > now
        {
            return Some(CollectionMode::Rainfall { expires_at });
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.high.is_none() && self.rain.is_none()
    }
}

#[cfg(test)]
mod tests {
    use jiff::SignedDuration;

    use super::*;

    fn t(mins: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH + SignedDuration::from_mins(mins)
    }

    #[test]
    fn user_trigger_wins_over_automatic_requests() {
        let mut stack = ModeStack::default();
        stack.apply(&ModeRequest::UserTriggered { expires_at: t(20) }, t(0));
        stack.apply(
            &ModeRequest::HighFrequency {
                reason: HighFrequencyReason::RangeAnomaly,
                expires_at: t(65),
            },
            t(5),
        );

        assert_eq!(
            stack.active(t(5)),
            Some(CollectionMode::UserTriggered { expires_at: t(20) })
        );
        assert_eq!(
            stack.active(t(19)).map(|m| m.priority()),
            Some(ModePriority::UserTriggered)
        );
        // the pre-empted request resumes once the user mode expires
        assert_eq!(
            stack.active(t(20)),
            Some(CollectionMode::HighFrequency {
                reason: HighFrequencyReason::RangeAnomaly,
                expires_at: t(65),
            })
        );
        assert_eq!(stack.active(t(65)), None);
    }

    #[test]
    fn high_frequency_extends_but_never_shortens() {
        let mut stack = ModeStack::default();
        stack.apply(
            &ModeRequest::HighFrequency {
                reason: HighFrequencyReason::TemperatureSpike,
                expires_at: t(60),
            },
            t(0),
        );
        stack.apply(
            &ModeRequest::HighFrequency {
                reason: HighFrequencyReason::RangeAnomaly,
                expires_at: t(30),
            },
            t(1),
        );
        assert_eq!(
            stack.active(t(1)),
            Some(CollectionMode::HighFrequency {
                reason: HighFrequencyReason::TemperatureSpike,
                expires_at: t(60),
            })
        );
    }

    #[test]
    fn rainfall_ends_early_and_expired_requests_are_ignored() {
        let mut stack = ModeStack::default();
        stack.apply(&ModeRequest::Rainfall { expires_at: t(30) }, t(0));
        assert_eq!(stack.active(t(10)).map(|m| m.label()), Some("rainfall"));

        stack.apply(&ModeRequest::EndRainfall, t(11));
        assert_eq!(stack.active(t(11)), None);

        stack.apply(&ModeRequest::UserTriggered { expires_at: t(5) }, t(10));
        assert!(stack.is_empty());
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(ModePriority::UserTriggered > ModePriority::HighFrequency);
        assert!(ModePriority::HighFrequency > ModePriority::Rainfall);
        assert!(ModePriority::Rainfall > ModePriority::NightReduced);
        assert!(ModePriority::NightReduced > ModePriority::Normal);
    }
}
