use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use hivewatch_core::{
    Aggregate, Reading, ReadingFlag, SensorId, StoredReading, duration::HumanDuration,
    retention::TierConfig,
};
use jiff::Timestamp;
use ordered_float::NotNan;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use ulid::Ulid;

use super::{StoreError, TimeSeriesStore};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let database_url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&database_url).await?;

        sqlx::query("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

fn nanos(ts: Timestamp) -> Result<i64, StoreError> {
    i64::try_from(ts.as_nanosecond())
        .map_err(|_| StoreError::Corrupt(format!("timestamp {ts} does not fit in 64 bits")))
}

fn timestamp(value: i64) -> Result<Timestamp, StoreError> {
    Timestamp::from_nanosecond(i128::from(value))
        .map_err(|_| StoreError::Corrupt(format!("timestamp out of range: {value}")))
}

fn sensor_id(value: &str) -> Result<SensorId, StoreError> {
    Ulid::from_str(value)
        .map(SensorId)
        .map_err(|_| StoreError::Corrupt(format!("invalid sensor id: {value}")))
}

fn not_nan(value: f64) -> Result<NotNan<f64>, StoreError> {
    NotNan::new(value).map_err(|_| StoreError::Corrupt("NaN value".to_string()))
}

fn flag_to_int(flag: ReadingFlag) -> i64 {
    match flag {
        ReadingFlag::Valid => 0,
        ReadingFlag::OutOfRange => 1,
    }
}

fn flag_from_int(value: i64) -> Result<ReadingFlag, StoreError> {
    match value {
        0 => Ok(ReadingFlag::Valid),
        1 => Ok(ReadingFlag::OutOfRange),
        other => Err(StoreError::Corrupt(format!("unknown reading flag {other}"))),
    }
}

fn reading_from_row(row: &SqliteRow) -> Result<StoredReading, StoreError> {
    let id: String = row.try_get("sensor_id")?;
    let value: f64 = row.try_get("value")?;
    Ok(StoredReading {
        reading: Reading {
            sensor_id: sensor_id(&id)?,
            value: not_nan(value)?,
            timestamp: timestamp(row.try_get("ts")?)?,
        },
        flag: flag_from_int(row.try_get("flag")?)?,
    })
}

fn aggregate_from_row(row: &SqliteRow) -> Result<Aggregate, StoreError> {
    let id: String = row.try_get("sensor_id")?;
    let tier: String = row.try_get("tier")?;
    let count: i64 = row.try_get("count")?;
    Ok(Aggregate {
        sensor_id: sensor_id(&id)?,
        tier: tier.into_boxed_str(),
        bucket_start: timestamp(row.try_get("bucket_start")?)?,
        bucket_end: timestamp(row.try_get("bucket_end")?)?,
        min: not_nan(row.try_get("min")?)?,
        max: not_nan(row.try_get("max")?)?,
        avg: not_nan(row.try_get("avg")?)?,
        count: u64::try_from(count)
            .map_err(|_| StoreError::Corrupt(format!("negative count {count}")))?,
    })
}

fn secs(duration: Option<HumanDuration>) -> Option<i64> {
    duration.map(|d| d.get().as_secs())
}

#[async_trait]
impl TimeSeriesStore for SqliteStore {
    async fn upsert_readings(&self, readings: &[StoredReading]) -> Result<(), StoreError> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for stored in readings {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO readings (sensor_id, ts, value, flag)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(stored.reading.sensor_id.0.to_string())
            .bind(nanos(stored.reading.timestamp)?)
            .bind(stored.reading.value())
            .bind(flag_to_int(stored.flag))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn readings_in(
        &self,
        sensor: SensorId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, ts, value, flag
            FROM readings
            WHERE sensor_id = ? AND ts >= ? AND ts < ?
            ORDER BY ts ASC
            "#,
        )
        .bind(sensor.0.to_string())
        .bind(nanos(start)?)
        .bind(nanos(end)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(reading_from_row).collect()
    }

    async fn latest_reading(&self, sensor: SensorId) -> Result<Option<StoredReading>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT sensor_id, ts, value, flag
            FROM readings
            WHERE sensor_id = ?
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(sensor.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(reading_from_row).transpose()
    }

    async fn earliest_reading(&self, sensor: SensorId) -> Result<Option<Timestamp>, StoreError> {
        let earliest: Option<i64> =
            sqlx::query_scalar("SELECT MIN(ts) FROM readings WHERE sensor_id = ?")
                .bind(sensor.0.to_string())
                .fetch_one(&self.pool)
                .await?;

        earliest.map(timestamp).transpose()
    }

    async fn upsert_aggregates(&self, aggregates: &[Aggregate]) -> Result<(), StoreError> {
        if aggregates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for aggregate in aggregates {
            let count = i64::try_from(aggregate.count)
                .map_err(|_| StoreError::Corrupt(format!("count too large: {}", aggregate.count)))?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO aggregates
                    (sensor_id, tier, bucket_start, bucket_end, min, max, avg, count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(aggregate.sensor_id.0.to_string())
            .bind(&*aggregate.tier)
            .bind(nanos(aggregate.bucket_start)?)
            .bind(nanos(aggregate.bucket_end)?)
            .bind(aggregate.min.into_inner())
            .bind(aggregate.max.into_inner())
            .bind(aggregate.avg.into_inner())
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn aggregates_in(
        &self,
        sensor: SensorId,
        tier: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Aggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, tier, bucket_start, bucket_end, min, max, avg, count
            FROM aggregates
            WHERE sensor_id = ? AND tier = ? AND bucket_start >= ? AND bucket_start < ?
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(sensor.0.to_string())
        .bind(tier)
        .bind(nanos(start)?)
        .bind(nanos(end)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(aggregate_from_row).collect()
    }

    async fn earliest_aggregate(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let earliest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(bucket_start) FROM aggregates WHERE sensor_id = ? AND tier = ?",
        )
        .bind(sensor.0.to_string())
        .bind(tier)
        .fetch_one(&self.pool)
        .await?;

        earliest.map(timestamp).transpose()
    }

    async fn watermark(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let through: Option<i64> =
            sqlx::query_scalar("SELECT materialized_through FROM watermarks WHERE sensor_id = ? AND tier = ?")
                .bind(sensor.0.to_string())
                .bind(tier)
                .fetch_optional(&self.pool)
                .await?;

        through.map(timestamp).transpose()
    }

    async fn set_watermark(
        &self,
        sensor: SensorId,
        tier: &str,
        through: Timestamp,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO watermarks (sensor_id, tier, materialized_through) VALUES (?, ?, ?)")
            .bind(sensor.0.to_string())
            .bind(tier)
            .bind(nanos(through)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rewind_watermark(
        &self,
        sensor: SensorId,
        tier: &str,
        to: Timestamp,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE watermarks SET materialized_through = ? WHERE sensor_id = ? AND tier = ? AND materialized_through > ?",
        )
        .bind(nanos(to)?)
        .bind(sensor.0.to_string())
        .bind(tier)
        .bind(nanos(to)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_horizon(
        &self,
        sensor: SensorId,
        tier: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let cutoff: Option<i64> = sqlx::query_scalar(
            "SELECT cutoff FROM prune_horizons WHERE sensor_id = ? AND tier = ?",
        )
        .bind(sensor.0.to_string())
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;

        cutoff.map(timestamp).transpose()
    }

    async fn set_prune_horizon(
        &self,
        sensor: SensorId,
        tier: &str,
        cutoff: Timestamp,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO prune_horizons (sensor_id, tier, cutoff) VALUES (?, ?, ?)",
        )
        .bind(sensor.0.to_string())
        .bind(tier)
        .bind(nanos(cutoff)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_readings_before(
        &self,
        sensor: SensorId,
        cutoff: Timestamp,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM readings WHERE sensor_id = ? AND ts < ?")
            .bind(sensor.0.to_string())
            .bind(nanos(cutoff)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_aggregates_before(
        &self,
        sensor: SensorId,
        tier: &str,
        cutoff: Timestamp,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM aggregates WHERE sensor_id = ? AND tier = ? AND bucket_start < ?",
        )
        .bind(sensor.0.to_string())
        .bind(tier)
        .bind(nanos(cutoff)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn tier_has_data(&self, tier: &str) -> Result<bool, StoreError> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM aggregates WHERE tier = ?)
                OR EXISTS (SELECT 1 FROM watermarks WHERE tier = ?)
                OR EXISTS (SELECT 1 FROM prune_horizons WHERE tier = ?)
            "#,
        )
        .bind(tier)
        .bind(tier)
        .bind(tier)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn sensor_ids(&self) -> Result<Vec<SensorId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT sensor_id FROM readings
            UNION
            SELECT sensor_id FROM aggregates
            ORDER BY sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|id| sensor_id(id)).collect()
    }

    async fn delete_sensor_data(&self, sensor: SensorId) -> Result<u64, StoreError> {
        let id = sensor.0.to_string();
        let mut tx = self.pool.begin().await?;

        let readings = sqlx::query("DELETE FROM readings WHERE sensor_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let aggregates = sqlx::query("DELETE FROM aggregates WHERE sensor_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM watermarks WHERE sensor_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM prune_horizons WHERE sensor_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(readings + aggregates)
    }

    async fn load_retention(&self) -> Result<Option<Vec<TierConfig>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, age_from, age_to, bucket_width, source, schedule
            FROM retention_tiers
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let tiers = rows
            .iter()
            .map(|row| -> Result<TierConfig, StoreError> {
                let age_to: Option<i64> = row.try_get("age_to")?;
                let bucket_width: Option<i64> = row.try_get("bucket_width")?;
                let schedule: Option<i64> = row.try_get("schedule")?;
                Ok(TierConfig {
                    name: row.try_get("name")?,
                    age_from: HumanDuration::from_secs(row.try_get("age_from")?),
                    age_to: age_to.map(HumanDuration::from_secs),
                    bucket_width: bucket_width.map(HumanDuration::from_secs),
                    source: row.try_get("source")?,
                    schedule: schedule.map(HumanDuration::from_secs),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(tiers))
    }

    async fn save_retention(&self, tiers: &[TierConfig]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM retention_tiers")
            .execute(&mut *tx)
            .await?;

        for (position, tier) in tiers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO retention_tiers
                    (position, name, age_from, age_to, bucket_width, source, schedule)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(position as i64)
            .bind(&tier.name)
            .bind(tier.age_from.get().as_secs())
            .bind(secs(tier.age_to))
            .bind(secs(tier.bucket_width))
            .bind(tier.source.as_deref())
            .bind(secs(tier.schedule))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
