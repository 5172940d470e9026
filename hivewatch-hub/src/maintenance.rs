//! Background scheduling of rollups and pruning.
//!
//! Every tick the loop checks which rollup tiers are due according to their
//! schedule and whether a prune pass is due, and spawns one task per due
//! job. A tier never has two jobs in flight; the tier locks additionally
//! keep a rollup and a prune of overlapping tiers apart. Failed runs are
//! logged and simply retried when next due.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::TierAggregator;
use crate::pruner::RetentionPruner;
use crate::retention::RetentionHandle;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub tick: Duration,
    pub prune_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Job {
    Aggregate(Box<str>),
    Prune(Box<str>),
}

impl Job {
    fn tier(&self) -> &str {
        match self {
            Job::Aggregate(tier) | Job::Prune(tier) => tier,
        }
    }
}

pub struct Maintenance {
    aggregator: Arc<TierAggregator>,
    pruner: Arc<RetentionPruner>,
    retention: Arc<RetentionHandle>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        aggregator: Arc<TierAggregator>,
        pruner: Arc<RetentionPruner>,
        retention: Arc<RetentionHandle>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            aggregator,
            pruner,
            retention,
            config,
        }
    }

    /// Aggregates every rollup tier finest first, then prunes every tier.
    /// Errors are logged and the remaining work continues.
    pub async fn run_once(&self, now: Timestamp) {
        let table = self.retention.current();
        for tier in table.tiers().iter().filter(|t| !t.is_native()) {
            run_job(&self.aggregator, &self.pruner, Job::Aggregate(tier.name.clone()), now).await;
        }
        for tier in table.tiers() {
            run_job(&self.aggregator, &self.pruner, Job::Prune(tier.name.clone()), now).await;
        }
    }

    fn due_jobs(
        &self,
        last_run: &HashMap<Job, Instant>,
        running: &HashSet<Job>,
        now: Instant,
    ) -> Vec<(Job, Duration)> {
        let table = self.retention.current();
        let mut jobs = Vec::new();
        for tier in table.tiers() {
            if !tier.is_native()
                && let Some(every) = self.retention.schedule_of(&tier.name)
            {
                jobs.push((Job::Aggregate(tier.name.clone()), every));
            }
            if tier.age_to.is_some() {
                jobs.push((Job::Prune(tier.name.clone()), self.config.prune_interval));
            }
        }

        jobs.into_iter()
            .filter(|(job, every)| {
                !running.contains(job)
                    && last_run
                        .get(job)
                        .is_none_or(|last| now.duration_since(*last) >= *every)
            })
            .collect()
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            tick = ?self.config.tick,
            prune_interval = ?self.config.prune_interval,
            "maintenance started"
        );

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        let mut running: HashSet<Job> = HashSet::new();
        let mut last_run: HashMap<Job, Instant> = HashMap::new();
        let mut in_flight: HashMap<tokio::task::Id, Job> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for (job, _) in self.due_jobs(&last_run, &running, now) {
                        last_run.insert(job.clone(), now);
                        running.insert(job.clone());
                        let aggregator = Arc::clone(&self.aggregator);
                        let pruner = Arc::clone(&self.pruner);
                        let handle = tasks.spawn({
                            let job = job.clone();
                            async move {
                                run_job(&aggregator, &pruner, job, Timestamp::now()).await;
                            }
                        });
                        in_flight.insert(handle.id(), job);
                    }
                }
                Some(joined) = tasks.join_next_with_id() => {
                    let id = match joined {
                        Ok((id, ())) => id,
                        Err(e) => {
                            error!(error = %e, "maintenance task failed");
                            e.id()
                        }
                    };
                    if let Some(job) = in_flight.remove(&id) {
                        running.remove(&job);
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "maintenance stopping");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(aborted = tasks.len(), "abandoning maintenance jobs");
            tasks.shutdown().await;
        }
        info!("maintenance stopped");
    }
}

async fn run_job(aggregator: &TierAggregator, pruner: &RetentionPruner, job: Job, now: Timestamp) {
    match &job {
        Job::Aggregate(tier) => {
            if let Err(e) = aggregator.aggregate_tier(tier, now).await {
                error!(tier = job.tier(), error = %e, "aggregation failed, retrying next run");
            }
        }
        Job::Prune(tier) => {
            if let Err(e) = pruner.prune_tier(tier, now).await {
                error!(tier = job.tier(), error = %e, "prune failed, tier skipped until next run");
            }
        }
    }
}
