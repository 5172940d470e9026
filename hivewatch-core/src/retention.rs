//! Retention tiers and query resolution.
//!
//! A [`RetentionTable`] is an ordered list of tiers whose age ranges
//! partition `[0, ∞)`. The first tier holds native readings, each later
//! tier rolls up the tier immediately before it into wider buckets.

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::HumanDuration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionTier {
    pub name: Box<str>,
    pub age_from: SignedDuration,
    /// `None` means the tier keeps data forever.
    pub age_to: Option<SignedDuration>,
    /// `None` means native resolution (raw readings).
    pub bucket_width: Option<SignedDuration>,
    pub source: Option<Box<str>>,
}

impl RetentionTier {
    pub fn is_native(&self) -> bool {
        self.bucket_width.is_none()
    }

    pub fn covers_age(&self, age: SignedDuration) -> bool {
        age >= self.age_from && self.age_to.is_none_or(|to| age < to)
    }

    fn width_secs(&self) -> i64 {
        self.bucket_width.map_or(0, |w| w.as_secs())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetentionError {
    #[error("retention table has no tiers")]
    Empty,
    #[error("first tier `{0}` must start at age 0")]
    FirstNotAtZero(String),
    #[error("first tier `{0}` must hold native readings")]
    FirstNotNative(String),
    #[error("tier `{0}` must start where the previous tier ends")]
    Discontinuous(String),
    #[error("tier `{0}` has an empty or inverted age range")]
    EmptyRange(String),
    #[error("only the last tier may be unbounded, `{0}` is not last")]
    UnboundedNotLast(String),
    #[error("last tier `{0}` must be unbounded")]
    LastBounded(String),
    #[error("tier `{0}` needs a positive whole-second bucket width")]
    InvalidBucketWidth(String),
    #[error("tier `{0}` bucket width is narrower than its predecessor's")]
    BucketWidthDecreasing(String),
    #[error("tier `{0}` bucket width is not a multiple of its source's")]
    BucketNotMultiple(String),
    #[error("tier `{0}` must roll up the tier immediately before it")]
    InvalidSource(String),
    #[error("duplicate tier name `{0}`")]
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("query range ends before it starts")]
    InvalidRange,
    #[error("requested interval must be positive")]
    InvalidInterval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionTable {
    tiers: Box<[RetentionTier]>,
}

impl RetentionTable {
    pub fn new(tiers: Vec<RetentionTier>) -> Result<Self, RetentionError> {
        let first = tiers.first().ok_or(RetentionError::Empty)?;
        if !first.age_from.is_zero() {
            return Err(RetentionError::FirstNotAtZero(first.name.to_string()));
        }
        if !first.is_native() || first.source.is_some() {
            return Err(RetentionError::FirstNotNative(first.name.to_string()));
        }

        for (i, tier) in tiers.iter().enumerate() {
            let name = tier.name.to_string();
            if tiers[..i].iter().any(|t| t.name == tier.name) {
                return Err(RetentionError::DuplicateName(name));
            }

            match tier.age_to {
                Some(to) if to <= tier.age_from => return Err(RetentionError::EmptyRange(name)),
                None if i + 1 != tiers.len() => return Err(RetentionError::UnboundedNotLast(name)),
                Some(_) if i + 1 == tiers.len() => return Err(RetentionError::LastBounded(name)),
                _ => {}
            }

            if i == 0 {
                continue;
            }
            let prev = &tiers[i - 1];

            if prev.age_to != Some(tier.age_from) {
                return Err(RetentionError::Discontinuous(name));
            }
            if tier.source.as_deref() != Some(&*prev.name) {
                return Err(RetentionError::InvalidSource(name));
            }

            let width = tier
                .bucket_width
                .filter(|w| w.as_secs() > 0 && w.subsec_nanos() == 0)
                .ok_or_else(|| RetentionError::InvalidBucketWidth(name.clone()))?;
            if width.as_secs() < prev.width_secs() {
                return Err(RetentionError::BucketWidthDecreasing(name));
            }
            if !prev.is_native() && width.as_secs() % prev.width_secs() != 0 {
                return Err(RetentionError::BucketNotMultiple(name));
            }
        }

        Ok(Self {
            tiers: tiers.into_boxed_slice(),
        })
    }

    pub fn tiers(&self) -> &[RetentionTier] {
        &self.tiers
    }

    pub fn get(&self, name: &str) -> Option<&RetentionTier> {
        self.tiers.iter().find(|t| &*t.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|t| &*t.name == name)
    }

    /// The native tier.
    pub fn finest(&self) -> &RetentionTier {
        &self.tiers[0]
    }

    /// The tier that rolls up `name`, if any.
    pub fn successor(&self, name: &str) -> Option<&RetentionTier> {
        self.index_of(name).and_then(|i| self.tiers.get(i + 1))
    }

    /// The tier `name` is rolled up from, if any.
    pub fn source_of(&self, name: &str) -> Option<&RetentionTier> {
        self.index_of(name)
            .and_then(|i| i.checked_sub(1))
            .map(|i| &self.tiers[i])
    }

    /// The tier whose age window contains `age`. Negative ages map to the finest tier.
    pub fn tier_for_age(&self, age: SignedDuration) -> &RetentionTier {
        self.tiers
            .iter()
            .find(|t| t.covers_age(age))
            .unwrap_or(&self.tiers[0])
    }

    /// Picks the tier to read `[start, end]` from.
    ///
    /// With a requested interval, the coarsest rollup tier whose bucket
    /// width divides it is used. Otherwise (or when no rollup width divides
    /// it) the tier is chosen by range length: the first tier whose upper
    /// age bound is at least the range length.
    pub fn resolve(
        &self,
        start: Timestamp,
        end: Timestamp,
        requested: Option<SignedDuration>,
    ) -> Result<&RetentionTier, QueryError> {
        if end < start {
            return Err(QueryError::InvalidRange);
        }

        if let Some(interval) = requested {
            if interval <= SignedDuration::ZERO {
                return Err(QueryError::InvalidInterval);
            }
            let divides = |t: &&RetentionTier| {
                t.bucket_width.is_some_and(|w| {
                    interval.subsec_nanos() == 0 && interval.as_secs() % w.as_secs() == 0
                })
            };
            if let Some(tier) = self.tiers.iter().rev().find(divides) {
                return Ok(tier);
            }
        }

        let length = end.duration_since(start);
        Ok(self
            .tiers
            .iter()
            .find(|t| t.age_to.is_none_or(|to| length <= to))
            .unwrap_or(&self.tiers[self.tiers.len() - 1]))
    }

    /// Like [`resolve`](Self::resolve) but never picks a tier finer than the
    /// one whose age window holds `start`, since finer tiers have already
    /// pruned data that old.
    pub fn resolve_at(
        &self,
        now: Timestamp,
        start: Timestamp,
        end: Timestamp,
        requested: Option<SignedDuration>,
    ) -> Result<&RetentionTier, QueryError> {
        let by_range = self.resolve(start, end, requested)?;
        let by_age = self.tier_for_age(now.duration_since(start));

        let range_idx = self.index_of(&by_range.name).unwrap_or(0);
        let age_idx = self.index_of(&by_age.name).unwrap_or(0);
        Ok(&self.tiers[range_idx.max(age_idx)])
    }
}

impl Default for RetentionTable {
    /// `raw [0,30h)`, `tier1 [30h,70d) 20min`, `tier2 [70d,13mo) 6h`, `tier3 [13mo,∞) 1d`.
    fn default() -> Self {
        let configs = TierConfig::defaults();
        Self {
            tiers: configs.iter().map(TierConfig::to_tier).collect(),
        }
    }
}

/// Serialized form of a tier in configuration files and the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub age_from: HumanDuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_to: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_width: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// How often the tier's rollup runs. Defaults to the bucket width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<HumanDuration>,
}

impl TierConfig {
    pub fn defaults() -> Vec<TierConfig> {
        vec![
            TierConfig {
                name: "raw".into(),
                age_from: HumanDuration::from_secs(0),
                age_to: Some(HumanDuration::from_hours(30)),
                bucket_width: None,
                source: None,
                schedule: None,
            },
            TierConfig {
                name: "tier1".into(),
                age_from: HumanDuration::from_hours(30),
                age_to: Some(HumanDuration::from_days(70)),
                bucket_width: Some(HumanDuration::from_mins(20)),
                source: Some("raw".into()),
                schedule: Some(HumanDuration::from_hours(1)),
            },
            TierConfig {
                name: "tier2".into(),
                age_from: HumanDuration::from_days(70),
                age_to: Some(HumanDuration::from_days(13 * 30)),
                bucket_width: Some(HumanDuration::from_hours(6)),
                source: Some("tier1".into()),
                schedule: None,
            },
            TierConfig {
                name: "tier3".into(),
                age_from: HumanDuration::from_days(13 * 30),
                age_to: None,
                bucket_width: Some(HumanDuration::from_days(1)),
                source: Some("tier2".into()),
                schedule: None,
            },
        ]
    }

    pub fn to_tier(&self) -> RetentionTier {
        RetentionTier {
            name: self.name.as_str().into(),
            age_from: self.age_from.get(),
            age_to: self.age_to.map(|d| d.get()),
            bucket_width: self.bucket_width.map(|d| d.get()),
            source: self.source.as_deref().map(Into::into),
        }
    }

    pub fn from_tier(tier: &RetentionTier) -> Self {
        Self {
            name: tier.name.to_string(),
            age_from: tier.age_from.into(),
            age_to: tier.age_to.map(Into::into),
            bucket_width: tier.bucket_width.map(Into::into),
            source: tier.source.as_deref().map(str::to_string),
            schedule: None,
        }
    }
}

pub fn table_from_configs(configs: &[TierConfig]) -> Result<RetentionTable, RetentionError> {
    RetentionTable::new(configs.iter().map(TierConfig::to_tier).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(hours: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH + SignedDuration::from_hours(hours)
    }

    fn tier_name(table: &RetentionTable, start: i64, end: i64, req: Option<i64>) -> String {
        table
            .resolve(ts(start), ts(end), req.map(SignedDuration::from_mins))
            .unwrap()
            .name
            .to_string()
    }

    #[test]
    fn default_table_is_valid() {
        let table = RetentionTable::default();
        let rebuilt = table_from_configs(&TierConfig::defaults()).unwrap();
        assert_eq!(table, rebuilt);
        assert_eq!(&*table.finest().name, "raw");
        assert_eq!(&*table.successor("raw").unwrap().name, "tier1");
        assert_eq!(&*table.source_of("tier2").unwrap().name, "tier1");
        assert!(table.successor("tier3").is_none());
    }

    #[test]
    fn resolves_by_range_length() {
        let table = RetentionTable::default();
        assert_eq!(tier_name(&table, 0, 30, None), "raw");
        assert_eq!(tier_name(&table, 0, 31, None), "tier1");
        assert_eq!(tier_name(&table, 0, 70 * 24, None), "tier1");
        assert_eq!(tier_name(&table, 0, 70 * 24 + 1, None), "tier2");
        assert_eq!(tier_name(&table, 0, 390 * 24 + 1, None), "tier3");
    }

    #[test]
    fn resolves_by_requested_interval() {
        let table = RetentionTable::default();
        assert_eq!(tier_name(&table, 0, 1, Some(20)), "tier1");
        assert_eq!(tier_name(&table, 0, 1, Some(60)), "tier1");
        assert_eq!(tier_name(&table, 0, 1, Some(6 * 60)), "tier2");
        assert_eq!(tier_name(&table, 0, 1, Some(24 * 60)), "tier3");
        // 7 minutes fits no rollup width, so the range length decides
        assert_eq!(tier_name(&table, 0, 1, Some(7)), "raw");
    }

    #[test]
    fn rejects_inverted_range_and_bad_interval() {
        let table = RetentionTable::default();
        assert_eq!(
            table.resolve(ts(2), ts(1), None),
            Err(QueryError::InvalidRange)
        );
        assert_eq!(
            table.resolve(ts(1), ts(2), Some(SignedDuration::ZERO)),
            Err(QueryError::InvalidInterval)
        );
    }

    #[test]
    fn resolution_is_monotonic_in_range_length() {
        let table = RetentionTable::default();
        let mut previous = 0;
        for hours in (0..12_000).step_by(7) {
            let tier = table.resolve(ts(0), ts(hours), None).unwrap();
            let idx = table.index_of(&tier.name).unwrap();
            assert!(idx >= previous, "finer tier returned for longer range");
            previous = idx;
        }
    }

    #[test]
    fn resolve_at_escalates_for_old_data() {
        let table = RetentionTable::default();
        let now = ts(100);
        let tier = table.resolve_at(now, ts(60), ts(61), None).unwrap();
        assert_eq!(&*tier.name, "tier1");
        let tier = table.resolve_at(now, ts(99), ts(100), None).unwrap();
        assert_eq!(&*tier.name, "raw");
    }

    #[test]
    fn validation_catches_gaps_and_bad_widths() {
        let mut configs = TierConfig::defaults();
        configs[1].age_from = HumanDuration::from_hours(31);
        assert!(matches!(
            table_from_configs(&configs),
            Err(RetentionError::Discontinuous(_))
        ));

        let mut configs = TierConfig::defaults();
        configs[2].bucket_width = Some(HumanDuration::from_mins(10));
        assert!(matches!(
            table_from_configs(&configs),
            Err(RetentionError::BucketWidthDecreasing(_))
        ));

        let mut configs = TierConfig::defaults();
        configs[2].bucket_width = Some(HumanDuration::from_mins(30));
        assert!(matches!(
            table_from_configs(&configs),
            Err(RetentionError::BucketNotMultiple(_))
        ));

        let mut configs = TierConfig::defaults();
        configs[3].age_to = Some(HumanDuration::from_days(1000));
        assert!(matches!(
            table_from_configs(&configs),
            Err(RetentionError::LastBounded(_))
        ));

        let mut configs = TierConfig::defaults();
        configs[2].source = Some("raw".into());
        assert!(matches!(
            table_from_configs(&configs),
            Err(RetentionError::InvalidSource(_))
        ));

        assert_eq!(table_from_configs(&[]), Err(RetentionError::Empty));
    }
}
