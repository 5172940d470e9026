//! The live retention table and its reload path.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use hivewatch_core::retention::{RetentionError, RetentionTable, TierConfig, table_from_configs};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, load_retention_tiers};
use crate::store::{StoreError, TimeSeriesStore};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid retention table: {0}")]
    Invalid(#[from] RetentionError),
    #[error("failed to persist retention table: {0}")]
    Store(#[from] StoreError),
    #[error("no config file to reload from")]
    NoConfigFile,
    #[error("tier {0:?} already holds data; its name, position, bucket width and source cannot change")]
    TierChanged(String),
}

struct Current {
    table: Arc<RetentionTable>,
    configs: Arc<[TierConfig]>,
}

/// Shared handle to the retention table in effect.
///
/// Readers take a cheap snapshot with [`current`](Self::current); a reload
/// swaps the whole table at once.
pub struct RetentionHandle {
    current: RwLock<Current>,
}

impl RetentionHandle {
    pub fn new(configs: Vec<TierConfig>) -> Result<Self, RetentionError> {
        let table = table_from_configs(&configs)?;
        Ok(Self {
            current: RwLock::new(Current {
                table: Arc::new(table),
                configs: configs.into(),
            }),
        })
    }

    pub fn current(&self) -> Arc<RetentionTable> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current.table),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().table),
        }
    }

    /// The tier definitions as configured, including schedules.
    pub fn configs(&self) -> Arc<[TierConfig]> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current.configs),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().configs),
        }
    }

    /// How often `tier` should be rolled up: its schedule, or its bucket width.
    pub fn schedule_of(&self, tier: &str) -> Option<std::time::Duration> {
        self.configs()
            .iter()
            .find(|c| c.name == tier)
            .and_then(|c| c.schedule.or(c.bucket_width))
            .map(|d| d.to_std())
    }

    /// Validates and swaps in a new table. The old one stays on error.
    ///
    /// Does not look at stored data; [`RetentionReloader::reload`] checks
    /// that first.
    pub(crate) fn replace(&self, configs: Vec<TierConfig>) -> Result<Arc<RetentionTable>, RetentionError> {
        let table = Arc::new(table_from_configs(&configs)?);
        let next = Current {
            table: Arc::clone(&table),
            configs: configs.into(),
        };
        match self.current.write() {
            Ok(mut current) => *current = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(table)
    }
}

/// Fails when a tier of `current` that already holds data would be renamed,
/// moved, removed, or given a new bucket width or source by `next`.
///
/// Its aggregates, watermarks and horizons are laid out on the old buckets,
/// so new buckets would overlap them. Age bounds and schedules may change.
pub async fn check_compatible(
    current: &[TierConfig],
    next: &[TierConfig],
    store: &dyn TimeSeriesStore,
) -> Result<(), ReloadError> {
    for (position, old) in current.iter().enumerate() {
        let kept = next.get(position).is_some_and(|new| {
            new.name == old.name && new.bucket_width == old.bucket_width && new.source == old.source
        });
        if !kept && store.tier_has_data(&old.name).await? {
            return Err(ReloadError::TierChanged(old.name.clone()));
        }
    }
    Ok(())
}

/// Picks the table to start with: the config file's tiers if it has any,
/// else what the store persisted last, else the defaults. The choice is
/// persisted so the store always holds the table in effect.
pub async fn initial_tiers(
    configured: Option<Vec<TierConfig>>,
    store: &dyn TimeSeriesStore,
) -> Result<Vec<TierConfig>, ReloadError> {
    let persisted = store.load_retention().await?;
    let tiers = match configured {
        Some(tiers) => {
            if let Some(persisted) = &persisted {
                check_compatible(persisted, &tiers, store).await?;
            }
            tiers
        }
        None => match persisted {
            Some(tiers) => {
                info!(tiers = tiers.len(), "using persisted retention table");
                tiers
            }
            None => TierConfig::defaults(),
        },
    };
    table_from_configs(&tiers)?;
    store.save_retention(&tiers).await?;
    Ok(tiers)
}

/// Re-reads retention tiers from the config file on request.
pub struct RetentionReloader {
    path: Option<PathBuf>,
    handle: Arc<RetentionHandle>,
    store: Arc<dyn TimeSeriesStore>,
}

impl RetentionReloader {
    pub fn new(
        path: Option<PathBuf>,
        handle: Arc<RetentionHandle>,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        Self {
            path,
            handle,
            store,
        }
    }

    pub fn handle(&self) -> &Arc<RetentionHandle> {
        &self.handle
    }

    /// Loads, validates, persists and swaps in the file's tiers.
    ///
    /// A file without tiers falls back to the defaults.
    pub async fn reload(&self) -> Result<Arc<[TierConfig]>, ReloadError> {
        let path = self.path.as_ref().ok_or(ReloadError::NoConfigFile)?;
        let tiers = load_retention_tiers(path)?.unwrap_or_else(TierConfig::defaults);

        table_from_configs(&tiers)?;
        check_compatible(&self.handle.configs(), &tiers, self.store.as_ref()).await?;
        self.store.save_retention(&tiers).await?;
        self.handle.replace(tiers)?;

        let configs = self.handle.configs();
        info!(
            path = %path.display(),
            tiers = ?configs.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "retention table reloaded"
        );
        Ok(configs)
    }

    /// Like [`reload`](Self::reload) but only logs failures.
    pub async fn reload_logged(&self) {
        if let Err(e) = self.reload().await {
            warn!(error = %e, "retention reload failed, keeping current table");
        }
    }
}

#[cfg(test)]
mod tests {
    use hivewatch_core::duration::HumanDuration;

    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn persisted_table_is_used_when_config_has_none() {
        let store = MemoryStore::new();
        let mut custom = TierConfig::defaults();
        custom[1].bucket_width = Some(HumanDuration::from_mins(10));
        store.save_retention(&custom).await.unwrap();

        let tiers = initial_tiers(None, &store).await.unwrap();
        assert_eq!(tiers[1].bucket_width, Some(HumanDuration::from_mins(10)));
    }

    #[tokio::test]
    async fn configured_width_change_over_stored_data_is_refused() {
        let store = MemoryStore::new();
        store.save_retention(&TierConfig::defaults()).await.unwrap();
        let sensor = hivewatch_core::SensorId(ulid::Ulid(7));
        let through = jiff::Timestamp::from_second(3_600).unwrap();
        store.set_watermark(sensor, "tier1", through).await.unwrap();

        let mut changed = TierConfig::defaults();
        changed[1].bucket_width = Some(HumanDuration::from_mins(30));
        let err = initial_tiers(Some(changed), &store).await.unwrap_err();
        assert!(matches!(err, ReloadError::TierChanged(ref tier) if tier == "tier1"));

        let mut rescheduled = TierConfig::defaults();
        rescheduled[1].schedule = Some(HumanDuration::from_mins(30));
        initial_tiers(Some(rescheduled), &store).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_reload_keeps_old_table() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "[[retention.tiers]]\nname = \"raw\"\nage_from = \"0s\"\nage_to = \"1d\"\n",
        )
        .unwrap();

        let store: Arc<dyn TimeSeriesStore> = Arc::new(MemoryStore::new());
        let handle = Arc::new(RetentionHandle::new(TierConfig::defaults()).unwrap());
        let reloader =
            RetentionReloader::new(Some(file.path().to_path_buf()), Arc::clone(&handle), store);

        assert!(reloader.reload().await.is_err());
        assert_eq!(handle.current().tiers().len(), 4);
    }

    #[tokio::test]
    async fn reload_swaps_and_persists() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"
[[retention.tiers]]
name = "raw"
age_from = "0s"
age_to = "2d"

[[retention.tiers]]
name = "hourly"
age_from = "2d"
bucket_width = "1h"
source = "raw"
schedule = "10min"
"#,
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let handle = Arc::new(RetentionHandle::new(TierConfig::defaults()).unwrap());
        let reloader = RetentionReloader::new(
            Some(file.path().to_path_buf()),
            Arc::clone(&handle),
            store.clone(),
        );

        reloader.reload().await.unwrap();
        assert_eq!(handle.current().tiers().len(), 2);
        assert_eq!(
            handle.schedule_of("hourly"),
            Some(std::time::Duration::from_secs(600))
        );
        assert_eq!(store.load_retention().await.unwrap().unwrap().len(), 2);
    }
}
