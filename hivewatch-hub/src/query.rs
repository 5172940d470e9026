use std::sync::Arc;

use hivewatch_core::{
    Aggregate, SensorId, StoredReading,
    bucket::{Summary, align_down, summarize_aggregates, summarize_readings},
    retention::{QueryError, RetentionTier},
};
use jiff::{SignedDuration, Timestamp};
use thiserror::Error;

use crate::registry::{RegistryError, SensorRegistry};
use crate::retention::RetentionHandle;
use crate::store::{StoreError, TimeSeriesStore};

#[derive(Debug, Error)]
pub enum QueryServiceError {
    #[error(transparent)]
    Invalid(#[from] QueryError),
    #[error("sensor {0} not found")]
    UnknownSensor(SensorId),
    #[error("unknown tier `{0}`")]
    UnknownTier(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryRows {
    Readings(Vec<StoredReading>),
    Aggregates(Vec<Aggregate>),
}

impl QueryRows {
    pub fn len(&self) -> usize {
        match self {
            QueryRows::Readings(rows) => rows.len(),
            QueryRows::Aggregates(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub sensor_id: SensorId,
    /// Tier the rows were read from.
    pub tier: Box<str>,
    /// Bucket width of the returned rows, `None` for raw readings.
    pub interval: Option<SignedDuration>,
    pub rows: QueryRows,
}

/// Read path over committed data. Takes no locks.
pub struct QueryService {
    registry: Arc<dyn SensorRegistry>,
    store: Arc<dyn TimeSeriesStore>,
    retention: Arc<RetentionHandle>,
}

impl QueryService {
    pub fn new(
        registry: Arc<dyn SensorRegistry>,
        store: Arc<dyn TimeSeriesStore>,
        retention: Arc<RetentionHandle>,
    ) -> Self {
        Self {
            registry,
            store,
            retention,
        }
    }

    /// Readings or aggregates of `sensor` over `[start, end)`.
    ///
    /// The tier is picked by range length and requested interval, but
    /// never finer than the tier whose age window holds `start`. When the
    /// requested interval is wider than the tier's buckets, rows are merged
    /// into buckets of that width.
    pub async fn query(
        &self,
        sensor: SensorId,
        start: Timestamp,
        end: Timestamp,
        interval: Option<SignedDuration>,
        now: Timestamp,
    ) -> Result<QueryResult, QueryServiceError> {
        let table = self.retention.current();
        let tier = table.resolve_at(now, start, end, interval)?;
        self.read(sensor, tier, start, end, interval).await
    }

    /// Like [`query`](Self::query) but reads the named tier as-is.
    pub async fn query_tier(
        &self,
        sensor: SensorId,
        tier: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<QueryResult, QueryServiceError> {
        if end < start {
            return Err(QueryError::InvalidRange.into());
        }
        let table = self.retention.current();
        let tier = table
            .get(tier)
            .ok_or_else(|| QueryServiceError::UnknownTier(tier.to_string()))?;
        self.read(sensor, tier, start, end, None).await
    }

    async fn read(
        &self,
        sensor: SensorId,
        tier: &RetentionTier,
        start: Timestamp,
        end: Timestamp,
        interval: Option<SignedDuration>,
    ) -> Result<QueryResult, QueryServiceError> {
        if self.registry.get_sensor(sensor).await?.is_none() {
            return Err(QueryServiceError::UnknownSensor(sensor));
        }

        // a requested interval only matters when it is coarser than the tier
        let rebucket = interval.filter(|i| tier.bucket_width.is_none_or(|w| *i > w));

        let (rows, width) = match tier.bucket_width {
            None => {
                let readings = self.store.readings_in(sensor, start, end).await?;
                match rebucket {
                    Some(width) => (
                        QueryRows::Aggregates(to_aggregates(
                            sensor,
                            &tier.name,
                            width,
                            summarize_readings(&readings, width),
                        )),
                        Some(width),
                    ),
                    None => (QueryRows::Readings(readings), None),
                }
            }
            Some(native) => {
                // include the bucket that contains `start`
                let from = align_down(start, native);
                let aggregates = self
                    .store
                    .aggregates_in(sensor, &tier.name, from, end)
                    .await?;
                match rebucket {
                    Some(width) => (
                        QueryRows::Aggregates(to_aggregates(
                            sensor,
                            &tier.name,
                            width,
                            summarize_aggregates(&aggregates, width),
                        )),
                        Some(width),
                    ),
                    None => (QueryRows::Aggregates(aggregates), Some(native)),
                }
            }
        };

        Ok(QueryResult {
            sensor_id: sensor,
            tier: tier.name.clone(),
            interval: width,
            rows,
        })
    }
}

fn to_aggregates(
    sensor: SensorId,
    tier: &str,
    width: SignedDuration,
    summaries: Vec<(Timestamp, Summary)>,
) -> Vec<Aggregate> {
    summaries
        .into_iter()
        .filter_map(|(start, summary)| summary.to_aggregate(sensor, tier, start, start + width))
        .collect()
}
