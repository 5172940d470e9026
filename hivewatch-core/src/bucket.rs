//! Bucket arithmetic shared by aggregation, pruning and queries.

use jiff::{SignedDuration, Timestamp};
use ordered_float::NotNan;

use crate::{Aggregate, SensorId, StoredReading};

/// Start of the `width`-wide bucket containing `ts`, aligned to the Unix epoch.
///
/// Widths shorter than one second align to the whole second.
pub fn align_down(ts: Timestamp, width: SignedDuration) -> Timestamp {
    let width = width.as_secs().max(1);
    let secs = ts.as_second().div_euclid(width) * width;
    Timestamp::from_second(secs).unwrap_or(ts)
}

/// Running min/max/sum/count over a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl Summary {
    pub fn of_value(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    pub fn of_aggregate(aggregate: &Aggregate) -> Self {
        Self {
            min: aggregate.min.into_inner(),
            max: aggregate.max.into_inner(),
            sum: aggregate.avg.into_inner() * aggregate.count as f64,
            count: aggregate.count,
        }
    }

    pub fn merge(&mut self, other: &Summary) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Builds the aggregate row. The average is clamped into `[min, max]`
    /// so float rounding of re-weighted averages never breaks `min <= avg <= max`.
    pub fn to_aggregate(
        &self,
        sensor_id: SensorId,
        tier: &str,
        bucket_start: Timestamp,
        bucket_end: Timestamp,
    ) -> Option<Aggregate> {
        if self.count == 0 {
            return None;
        }
        let avg = self.avg().clamp(self.min, self.max);
        Some(Aggregate {
            sensor_id,
            tier: tier.into(),
            bucket_start,
            bucket_end,
            min: NotNan::new(self.min).ok()?,
            max: NotNan::new(self.max).ok()?,
            avg: NotNan::new(avg).ok()?,
            count: self.count,
        })
    }
}

/// Groups readings into `width` buckets, in timestamp order.
///
/// The input must already be sorted by timestamp for the sums to be
/// reproducible bit for bit.
pub fn summarize_readings<'a, I>(readings: I, width: SignedDuration) -> Vec<(Timestamp, Summary)>
where
    I: IntoIterator<Item = &'a StoredReading>,
{
    let mut out: Vec<(Timestamp, Summary)> = Vec::new();
    for stored in readings {
        let start = align_down(stored.reading.timestamp, width);
        let value = Summary::of_value(stored.reading.value());
        match out.last_mut() {
            Some((last_start, summary)) if *last_start == start => summary.merge(&value),
            _ => out.push((start, value)),
        }
    }
    out
}

/// Groups finer aggregates into `width` buckets, in bucket order.
pub fn summarize_aggregates<'a, I>(aggregates: I, width: SignedDuration) -> Vec<(Timestamp, Summary)>
where
    I: IntoIterator<Item = &'a Aggregate>,
{
    let mut out: Vec<(Timestamp, Summary)> = Vec::new();
    for aggregate in aggregates {
        let start = align_down(aggregate.bucket_start, width);
        let value = Summary::of_aggregate(aggregate);
        match out.last_mut() {
            Some((last_start, summary)) if *last_start == start => summary.merge(&value),
            _ => out.push((start, value)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::{ReadingFlag, Reading};

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(secs).unwrap()
    }

    fn stored(secs: i64, value: f64) -> StoredReading {
        StoredReading {
            reading: Reading::new(SensorId(Ulid::nil()), value, ts(secs)).unwrap(),
            flag: ReadingFlag::Valid,
        }
    }

    #[test]
    fn aligns_to_bucket_start() {
        let width = SignedDuration::from_mins(20);
        assert_eq!(align_down(ts(1_200), width), ts(1_200));
        assert_eq!(align_down(ts(2_399), width), ts(1_200));
        assert_eq!(align_down(ts(-1), width), ts(-1_200));
    }

    #[test]
    fn summarizes_in_buckets() {
        let readings = [stored(0, 1.0), stored(10, 3.0), stored(1_200, 5.0)];
        let buckets = summarize_readings(&readings, SignedDuration::from_mins(20));

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].0, ts(0));
        assert_eq!(buckets[0].1.count, 2);
        assert_eq!(buckets[0].1.avg(), 2.0);
        assert_eq!(buckets[1].1.min, 5.0);
    }

    #[test]
    fn merges_aggregates_weighted_by_count() {
        let sensor = SensorId(Ulid::nil());
        let a = Summary {
            min: 1.0,
            max: 3.0,
            sum: 6.0,
            count: 3,
        }
        .to_aggregate(sensor, "tier1", ts(0), ts(1_200))
        .unwrap();
        let b = Summary::of_value(10.0)
            .to_aggregate(sensor, "tier1", ts(1_200), ts(2_400))
            .unwrap();

        let merged = summarize_aggregates([&a, &b], SignedDuration::from_hours(6));
        assert_eq!(merged.len(), 1);
        let summary = merged[0].1;
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 10.0);
        assert_eq!(summary.avg(), 4.0);
    }
}
