//! Validation and persistence of readings arriving from edge devices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hivewatch_core::{
    IngestBatchRequest, IngestBatchResponse, Reading, ReadingFlag, RecordOutcome, RejectReason,
    Sensor, SensorId, StoredReading, bucket::align_down,
};
use hivewatch_rpc::{RpcHandler, WireError, WireErrorCode};
use jiff::{SignedDuration, Timestamp};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::LastValueCache;
use crate::locks::SensorLocks;
use crate::registry::{RegistryError, SensorRegistry};
use crate::retention::RetentionHandle;
use crate::store::{StoreError, TimeSeriesStore};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store write timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// How far ahead of the hub clock a timestamp may be.
    pub clock_skew: SignedDuration,
    pub write_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            clock_skew: SignedDuration::from_secs(30),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Persists readings, flagging out-of-range values instead of dropping them.
///
/// Readings of one sensor are written under that sensor's lock and in
/// timestamp order; different sensors proceed in parallel.
#[derive(Clone)]
pub struct IngestWriter {
    registry: Arc<dyn SensorRegistry>,
    store: Arc<dyn TimeSeriesStore>,
    retention: Arc<RetentionHandle>,
    cache: Arc<LastValueCache>,
    locks: SensorLocks,
    config: IngestConfig,
}

impl IngestWriter {
    pub fn new(
        registry: Arc<dyn SensorRegistry>,
        store: Arc<dyn TimeSeriesStore>,
        retention: Arc<RetentionHandle>,
        cache: Arc<LastValueCache>,
        locks: SensorLocks,
        config: IngestConfig,
    ) -> Self {
        Self {
            registry,
            store,
            retention,
            cache,
            locks,
            config,
        }
    }

    /// Writes a single reading.
    pub async fn write(&self, reading: Reading, now: Timestamp) -> RecordOutcome {
        self.write_batch(&[reading], now)
            .await
            .first()
            .copied()
            .unwrap_or(RecordOutcome::Rejected(RejectReason::Internal))
    }

    /// Writes a batch and returns one outcome per reading, in input order.
    pub async fn write_batch(&self, readings: &[Reading], now: Timestamp) -> Vec<RecordOutcome> {
        let mut outcomes = vec![RecordOutcome::Rejected(RejectReason::Internal); readings.len()];

        let mut by_sensor: HashMap<SensorId, Vec<(usize, Reading)>> = HashMap::new();
        for (idx, reading) in readings.iter().enumerate() {
            by_sensor.entry(reading.sensor_id).or_default().push((idx, *reading));
        }

        let mut tasks = JoinSet::new();
        for (sensor_id, group) in by_sensor {
            let writer = self.clone();
            tasks.spawn(async move {
                let indices: Vec<usize> = group.iter().map(|(idx, _)| *idx).collect();
                match writer.write_sensor(sensor_id, group, now).await {
                    Ok(results) => results,
                    Err(e) => {
                        error!(%sensor_id, error = %e, "failed to persist readings");
                        indices
                            .into_iter()
                            .map(|idx| (idx, RecordOutcome::Rejected(RejectReason::Internal)))
                            .collect()
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => {
                    for (idx, outcome) in results {
                        outcomes[idx] = outcome;
                    }
                }
                Err(e) => error!(error = %e, "ingest task failed"),
            }
        }

        outcomes
    }

    async fn write_sensor(
        &self,
        sensor_id: SensorId,
        mut group: Vec<(usize, Reading)>,
        now: Timestamp,
    ) -> Result<Vec<(usize, RecordOutcome)>, IngestError> {
        // Looked up under the lock: hive cleanup removes the sensor while
        // holding it.
        let _guard = self.locks.lock(sensor_id).await;
        let Some(sensor) = self.registry.get_sensor(sensor_id).await? else {
            debug!(%sensor_id, readings = group.len(), "readings for unknown sensor");
            return Ok(group
                .into_iter()
                .map(|(idx, _)| (idx, RecordOutcome::Rejected(RejectReason::UnknownSensor)))
                .collect());
        };

        group.sort_by_key(|(_, r)| r.timestamp);

        let table = self.retention.current();
        let finest = table.finest().name.clone();
        let horizon = self.store.prune_horizon(sensor_id, &finest).await?;
        let latest_allowed = now + self.config.clock_skew;

        let mut results = Vec::with_capacity(group.len());
        let mut accepted = Vec::with_capacity(group.len());
        for (idx, reading) in group {
            if reading.timestamp > latest_allowed {
                warn!(
                    %sensor_id,
                    timestamp = %reading.timestamp,
                    %now,
                    "rejecting reading from the future"
                );
                results.push((idx, RecordOutcome::Rejected(RejectReason::FutureTimestamp)));
                continue;
            }
            if horizon.is_some_and(|h| reading.timestamp < h) {
                debug!(%sensor_id, timestamp = %reading.timestamp, "reading older than retained data");
                results.push((idx, RecordOutcome::Rejected(RejectReason::BeyondRetention)));
                continue;
            }

            let flag = flag_for(&sensor, &reading);
            if flag == ReadingFlag::OutOfRange {
                warn!(
                    %sensor_id,
                    value = reading.value(),
                    timestamp = %reading.timestamp,
                    "reading outside valid range, stored flagged"
                );
            }
            accepted.push((idx, StoredReading { reading, flag }));
        }

        if accepted.is_empty() {
            return Ok(results);
        }

        let rows: Vec<StoredReading> = accepted.iter().map(|(_, s)| *s).collect();
        tokio::time::timeout(self.config.write_timeout, self.store.upsert_readings(&rows))
            .await
            .map_err(|_| IngestError::Timeout)??;

        if let Some(latest) = rows.last() {
            self.cache.update(*latest);
        }

        // readings behind the first rollup's watermark make its buckets stale
        if let Some(rollup) = table.successor(&finest)
            && let (Some(width), Some(oldest)) = (rollup.bucket_width, rows.first())
        {
            let bucket = align_down(oldest.reading.timestamp, width);
            self.store.rewind_watermark(sensor_id, &rollup.name, bucket).await?;
        }

        results.extend(accepted.into_iter().map(|(idx, stored)| {
            let outcome = match stored.flag {
                ReadingFlag::Valid => RecordOutcome::Accepted,
                ReadingFlag::OutOfRange => RecordOutcome::Flagged,
            };
            (idx, outcome)
        }));
        Ok(results)
    }
}

fn flag_for(sensor: &Sensor, reading: &Reading) -> ReadingFlag {
    match sensor.valid_range {
        Some(range) if !range.contains(reading.value()) => ReadingFlag::OutOfRange,
        _ => ReadingFlag::Valid,
    }
}

#[async_trait]
impl RpcHandler for IngestWriter {
    async fn ingest_batch(
        &self,
        request: IngestBatchRequest,
    ) -> Result<IngestBatchResponse, WireError> {
        if request.readings.is_empty() {
            return Err(WireError {
                code: WireErrorCode::BadRequest,
                message: "empty batch".to_string(),
            });
        }

        let outcomes = self.write_batch(&request.readings, Timestamp::now()).await;

        let accepted = outcomes.iter().filter(|o| **o == RecordOutcome::Accepted).count();
        let flagged = outcomes.iter().filter(|o| **o == RecordOutcome::Flagged).count();
        info!(
            device_id = %request.device_id,
            readings = outcomes.len(),
            accepted,
            flagged,
            rejected = outcomes.len() - accepted - flagged,
            "ingested batch"
        );

        Ok(IngestBatchResponse {
            id: request.id,
            outcomes: outcomes.into(),
        })
    }
}
