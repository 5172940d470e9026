//! Deleting a hive and everything hanging off it.
//!
//! Steps run in a fixed order: time-series data, files, comments, sensors,
//! the hive itself. The first failing step stops the cascade and the error
//! carries what was already done, so a retry picks up where it stopped.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hivewatch_core::{HiveId, SensorId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::LastValueCache;
use crate::locks::SensorLocks;
use crate::registry::SensorRegistry;
use crate::store::TimeSeriesStore;

/// Files and comments attached to a hive, kept outside the hub.
#[async_trait]
pub trait AttachmentStore: Send + Sync + 'static {
    /// Returns the number of files deleted.
    async fn delete_files(&self, hive: HiveId) -> Result<u64, String>;

    /// Returns the number of comments deleted.
    async fn delete_comments(&self, hive: HiveId) -> Result<u64, String>;
}

/// Used when no attachment service is configured.
pub struct NoAttachments;

#[async_trait]
impl AttachmentStore for NoAttachments {
    async fn delete_files(&self, _hive: HiveId) -> Result<u64, String> {
        Ok(0)
    }

    async fn delete_comments(&self, _hive: HiveId) -> Result<u64, String> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    Data,
    Files,
    Comments,
    Sensors,
    Hive,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupStep::Data => "data",
            CleanupStep::Files => "files",
            CleanupStep::Comments => "comments",
            CleanupStep::Sensors => "sensors",
            CleanupStep::Hive => "hive",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub completed: Vec<CleanupStep>,
    pub rows_deleted: u64,
    pub files_deleted: u64,
    pub comments_deleted: u64,
    pub sensors_deleted: u64,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("hive {0} not found")]
    NotFound(HiveId),
    #[error("cleanup step `{step}` failed: {message}")]
    StepFailed {
        step: CleanupStep,
        message: String,
        report: CleanupReport,
    },
}

pub struct HiveCleanup {
    registry: Arc<dyn SensorRegistry>,
    store: Arc<dyn TimeSeriesStore>,
    attachments: Arc<dyn AttachmentStore>,
    cache: Arc<LastValueCache>,
    sensor_locks: SensorLocks,
}

impl HiveCleanup {
    pub fn new(
        registry: Arc<dyn SensorRegistry>,
        store: Arc<dyn TimeSeriesStore>,
        attachments: Arc<dyn AttachmentStore>,
        cache: Arc<LastValueCache>,
        sensor_locks: SensorLocks,
    ) -> Self {
        Self {
            registry,
            store,
            attachments,
            cache,
            sensor_locks,
        }
    }

    pub async fn delete_hive(&self, hive: HiveId) -> Result<CleanupReport, CleanupError> {
        let mut report = CleanupReport::default();

        let found = self
            .registry
            .get_hive(hive)
            .await
            .map_err(|e| failed(CleanupStep::Data, e, &report))?;
        if found.is_none() {
            return Err(CleanupError::NotFound(hive));
        }
        let sensors = self
            .registry
            .sensors_of_hive(hive)
            .await
            .map_err(|e| failed(CleanupStep::Data, e, &report))?;

        // Held until the sensors are gone from the registry, so ingest cannot
        // write rows for them in between.
        let mut ids: Vec<SensorId> = sensors.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.sensor_locks.lock(*id).await);
        }

        for id in &ids {
            let rows = self
                .store
                .delete_sensor_data(*id)
                .await
                .map_err(|e| failed(CleanupStep::Data, e, &report))?;
            report.rows_deleted += rows;
            self.cache.remove(*id);
        }
        report.completed.push(CleanupStep::Data);

        let files = self
            .attachments
            .delete_files(hive)
            .await
            .map_err(|e| failed(CleanupStep::Files, e, &report))?;
        report.files_deleted = files;
        report.completed.push(CleanupStep::Files);

        let comments = self
            .attachments
            .delete_comments(hive)
            .await
            .map_err(|e| failed(CleanupStep::Comments, e, &report))?;
        report.comments_deleted = comments;
        report.completed.push(CleanupStep::Comments);

        for id in &ids {
            let existed = self
                .registry
                .delete_sensor(*id)
                .await
                .map_err(|e| failed(CleanupStep::Sensors, e, &report))?;
            if existed {
                report.sensors_deleted += 1;
            }
        }
        report.completed.push(CleanupStep::Sensors);
        drop(guards);
        for id in &ids {
            self.sensor_locks.forget(*id);
        }

        self.registry
            .delete_hive(hive)
            .await
            .map_err(|e| failed(CleanupStep::Hive, e, &report))?;
        report.completed.push(CleanupStep::Hive);

        info!(
            %hive,
            rows = report.rows_deleted,
            files = report.files_deleted,
            comments = report.comments_deleted,
            sensors = report.sensors_deleted,
            "hive deleted"
        );
        Ok(report)
    }
}

fn failed(step: CleanupStep, error: impl fmt::Display, report: &CleanupReport) -> CleanupError {
    warn!(%step, error = %error, completed = ?report.completed, "hive cleanup stopped");
    CleanupError::StepFailed {
        step,
        message: error.to_string(),
        report: report.clone(),
    }
}
