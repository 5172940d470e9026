//! Human-readable durations used throughout the configuration files.
//!
//! Accepted forms are an integer followed by a unit, with optional
//! whitespace: `20s`, `1min`, `5m`, `30h`, `70d`, `2w`, `13mo`, `1y`.
//! Months count as 30 days and years as 365 days.

use std::{fmt, str::FromStr};

use jiff::SignedDuration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("missing number in duration `{0}`")]
    MissingNumber(String),
    #[error("unknown duration unit `{0}`")]
    UnknownUnit(String),
    #[error("duration `{0}` is out of range")]
    Overflow(String),
}

fn unit_seconds(unit: &str) -> Option<i64> {
    let secs = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "w" | "week" | "weeks" => 7 * DAY,
        "mo" | "month" | "months" => 30 * DAY,
        "y" | "year" | "years" => 365 * DAY,
        _ => return None,
    };
    Some(secs)
}

pub fn parse_duration(input: &str) -> Result<SignedDuration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(DurationParseError::MissingNumber(input.to_string()));
    }

    let number: i64 = number
        .parse()
        .map_err(|_| DurationParseError::Overflow(input.to_string()))?;
    let unit = unit.trim();
    let factor = if unit.is_empty() {
        1
    } else {
        unit_seconds(unit).ok_or_else(|| DurationParseError::UnknownUnit(unit.to_string()))?
    };

    let secs = number
        .checked_mul(factor)
        .ok_or_else(|| DurationParseError::Overflow(input.to_string()))?;
    Ok(SignedDuration::from_secs(secs))
}

/// Formats with the largest unit that divides the duration exactly.
pub fn format_duration(duration: SignedDuration) -> String {
    let secs = duration.as_secs();
    if secs != 0 && secs % DAY == 0 {
        format!("{}d", secs / DAY)
    } else if secs != 0 && secs % HOUR == 0 {
        format!("{}h", secs / HOUR)
    } else if secs != 0 && secs % MINUTE == 0 {
        format!("{}min", secs / MINUTE)
    } else {
        format!("{secs}s")
    }
}

/// Serde wrapper for config fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(pub SignedDuration);

impl HumanDuration {
    pub const fn from_secs(secs: i64) -> Self {
        Self(SignedDuration::from_secs(secs))
    }

    pub const fn from_mins(mins: i64) -> Self {
        Self(SignedDuration::from_secs(mins * MINUTE))
    }

    pub const fn from_hours(hours: i64) -> Self {
        Self(SignedDuration::from_secs(hours * HOUR))
    }

    pub const fn from_days(days: i64) -> Self {
        Self(SignedDuration::from_secs(days * DAY))
    }

    pub fn get(&self) -> SignedDuration {
        self.0
    }

    /// Negative durations clamp to zero.
    pub fn to_std(&self) -> std::time::Duration {
        std::time::Duration::try_from(self.0).unwrap_or(std::time::Duration::ZERO)
    }
}

impl From<SignedDuration> for HumanDuration {
    fn from(value: SignedDuration) -> Self {
        Self(value)
    }
}

impl FromStr for HumanDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("20s").unwrap(), SignedDuration::from_secs(20));
        assert_eq!(parse_duration("1min").unwrap(), SignedDuration::from_mins(1));
        assert_eq!(parse_duration("5 m").unwrap(), SignedDuration::from_mins(5));
        assert_eq!(parse_duration("30h").unwrap(), SignedDuration::from_hours(30));
        assert_eq!(parse_duration("70d").unwrap(), SignedDuration::from_hours(70 * 24));
        assert_eq!(
            parse_duration("13mo").unwrap(),
            SignedDuration::from_hours(13 * 30 * 24)
        );
        assert_eq!(parse_duration("1day").unwrap(), SignedDuration::from_hours(24));
    }

    #[test]
    fn comparison_is_numeric_not_lexical() {
        let minute = parse_duration("1min").unwrap();
        let day = parse_duration("1day").unwrap();
        // "1min" < "1day" is false lexically but the durations order correctly
        assert!("1min" > "1day");
        assert!(minute < day);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationParseError::Empty));
        assert!(matches!(
            parse_duration("min"),
            Err(DurationParseError::MissingNumber(_))
        ));
        assert!(matches!(
            parse_duration("3 fortnights"),
            Err(DurationParseError::UnknownUnit(_))
        ));
    }

    #[test]
    fn formats_largest_exact_unit() {
        assert_eq!(format_duration(SignedDuration::from_mins(20)), "20min");
        assert_eq!(format_duration(SignedDuration::from_hours(6)), "6h");
        assert_eq!(format_duration(SignedDuration::from_hours(48)), "2d");
        assert_eq!(format_duration(SignedDuration::from_secs(90)), "90s");
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            every: HumanDuration,
        }

        let w: Wrapper = toml::from_str(r#"every = "6h""#).unwrap();
        assert_eq!(w.every, HumanDuration::from_hours(6));
    }
}
