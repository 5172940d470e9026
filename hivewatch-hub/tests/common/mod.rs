#![allow(dead_code)]

use std::sync::Arc;

use hivewatch_core::{
    Hive, HiveId, Reading, Sensor, SensorId, SensorKind, ValidRange, retention::TierConfig,
};
use hivewatch_hub::{
    aggregator::TierAggregator,
    cache::LastValueCache,
    ingest::{IngestConfig, IngestWriter},
    locks::{SensorLocks, TierLocks},
    pruner::RetentionPruner,
    query::QueryService,
    registry::{SensorRegistry, memory::InMemorySensorRegistry},
    retention::RetentionHandle,
    store::{TimeSeriesStore, memory::MemoryStore},
};
use jiff::{SignedDuration, Timestamp};
use ulid::Ulid;

pub const HIVE: Ulid = Ulid(1);
pub const SENSOR: Ulid = Ulid(2);
pub const OTHER_SENSOR: Ulid = Ulid(3);

/// Every component of a hub wired over one store, without the network.
pub struct Hub {
    pub registry: Arc<dyn SensorRegistry>,
    pub store: Arc<dyn TimeSeriesStore>,
    pub retention: Arc<RetentionHandle>,
    pub cache: Arc<LastValueCache>,
    pub sensor_locks: SensorLocks,
    pub writer: IngestWriter,
    pub aggregator: Arc<TierAggregator>,
    pub pruner: Arc<RetentionPruner>,
    pub query: Arc<QueryService>,
}

impl Hub {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(store: Arc<dyn TimeSeriesStore>) -> Self {
        let registry: Arc<dyn SensorRegistry> = Arc::new(
            InMemorySensorRegistry::with_fleet(
                vec![hive()],
                vec![sensor(SENSOR, "brood temperature"), sensor(OTHER_SENSOR, "outside")],
            )
            .await
            .unwrap(),
        );
        let retention = Arc::new(RetentionHandle::new(TierConfig::defaults()).unwrap());
        let cache = Arc::new(LastValueCache::new(SignedDuration::from_mins(15)));
        let sensor_locks = SensorLocks::new();
        let tier_locks = TierLocks::new();

        let writer = IngestWriter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&retention),
            Arc::clone(&cache),
            sensor_locks.clone(),
            IngestConfig::default(),
        );
        let aggregator = Arc::new(TierAggregator::new(
            Arc::clone(&store),
            Arc::clone(&retention),
            tier_locks.clone(),
            sensor_locks.clone(),
            SignedDuration::ZERO,
        ));
        let pruner = Arc::new(RetentionPruner::new(
            Arc::clone(&store),
            Arc::clone(&retention),
            tier_locks,
            sensor_locks.clone(),
        ));
        let query = Arc::new(QueryService::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&retention),
        ));

        Self {
            registry,
            store,
            retention,
            cache,
            sensor_locks,
            writer,
            aggregator,
            pruner,
            query,
        }
    }
}

pub fn hive() -> Hive {
    Hive {
        id: HiveId(HIVE),
        name: "Linden 3".into(),
        timezone: "Europe/Berlin".into(),
    }
}

pub fn sensor(id: Ulid, name: &str) -> Sensor {
    Sensor {
        id: SensorId(id),
        hive_id: HiveId(HIVE),
        name: name.into(),
        kind: SensorKind::Temperature,
        valid_range: Some(ValidRange {
            min: -40.0,
            max: 85.0,
        }),
        calibration: None,
        collection_interval: None,
    }
}

/// A fixed "now" on a six hour boundary, so every default bucket width aligns.
pub fn now() -> Timestamp {
    "2026-06-01T12:00:00Z".parse().unwrap()
}

pub fn ago(d: SignedDuration) -> Timestamp {
    now() - d
}

pub fn reading(sensor: Ulid, at: Timestamp, value: f64) -> Reading {
    Reading::new(SensorId(sensor), value, at).unwrap()
}
