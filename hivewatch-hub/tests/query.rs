mod common;

use common::{Hub, SENSOR, ago, now, reading};
use hivewatch_core::{SensorId, retention::QueryError};
use hivewatch_hub::query::{QueryRows, QueryServiceError};
use jiff::SignedDuration;
use ulid::Ulid;

async fn two_hours_of_readings(hub: &Hub) {
    let readings: Vec<_> = (0..12)
        .map(|i| {
            reading(
                SENSOR,
                ago(SignedDuration::from_hours(3)) + SignedDuration::from_mins(i * 10),
                i as f64,
            )
        })
        .collect();
    hub.writer.write_batch(&readings, now()).await;
}

#[tokio::test]
async fn short_recent_range_reads_raw() {
    let hub = Hub::new().await;
    two_hours_of_readings(&hub).await;

    let result = hub
        .query
        .query(
            SensorId(SENSOR),
            ago(SignedDuration::from_hours(3)),
            ago(SignedDuration::from_hours(2)),
            None,
            now(),
        )
        .await
        .unwrap();
    assert_eq!(&*result.tier, "raw");
    assert_eq!(result.interval, None);
    assert!(matches!(result.rows, QueryRows::Readings(ref r) if r.len() == 6));
}

#[tokio::test]
async fn wider_interval_merges_tier_buckets() {
    let hub = Hub::new().await;
    two_hours_of_readings(&hub).await;
    hub.aggregator.aggregate_tier("tier1", now()).await.unwrap();

    let result = hub
        .query
        .query(
            SensorId(SENSOR),
            ago(SignedDuration::from_hours(3)),
            ago(SignedDuration::from_hours(1)),
            Some(SignedDuration::from_hours(1)),
            now(),
        )
        .await
        .unwrap();
    assert_eq!(&*result.tier, "tier1");
    assert_eq!(result.interval, Some(SignedDuration::from_hours(1)));

    let QueryRows::Aggregates(buckets) = result.rows else {
        panic!("expected aggregates");
    };
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].bucket_start, ago(SignedDuration::from_hours(3)));
    assert_eq!(buckets[0].count, 6);
    assert_eq!(buckets[0].min.into_inner(), 0.0);
    assert_eq!(buckets[0].max.into_inner(), 5.0);
    assert_eq!(buckets[0].avg.into_inner(), 2.5);
    assert_eq!(buckets[1].min.into_inner(), 6.0);
    assert_eq!(buckets[1].max.into_inner(), 11.0);
}

#[tokio::test]
async fn named_tier_is_read_as_is() {
    let hub = Hub::new().await;
    two_hours_of_readings(&hub).await;

    let result = hub
        .query
        .query_tier(
            SensorId(SENSOR),
            "raw",
            ago(SignedDuration::from_hours(3)),
            ago(SignedDuration::from_hours(1)),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 12);
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let hub = Hub::new().await;

    let reversed = hub
        .query
        .query(SensorId(SENSOR), now(), ago(SignedDuration::from_hours(1)), None, now())
        .await;
    assert!(matches!(
        reversed,
        Err(QueryServiceError::Invalid(QueryError::InvalidRange))
    ));

    let zero = hub
        .query
        .query(
            SensorId(SENSOR),
            ago(SignedDuration::from_hours(1)),
            now(),
            Some(SignedDuration::ZERO),
            now(),
        )
        .await;
    assert!(matches!(
        zero,
        Err(QueryServiceError::Invalid(QueryError::InvalidInterval))
    ));

    let unknown = hub
        .query
        .query(SensorId(Ulid(99)), ago(SignedDuration::from_hours(1)), now(), None, now())
        .await;
    assert!(matches!(unknown, Err(QueryServiceError::UnknownSensor(_))));

    let tier = hub
        .query
        .query_tier(SensorId(SENSOR), "minutely", ago(SignedDuration::from_hours(1)), now())
        .await;
    assert!(matches!(tier, Err(QueryServiceError::UnknownTier(_))));
}
