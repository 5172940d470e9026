use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use hivewatch_core::{
    BatchId, DeviceId, IngestBatchRequest, IngestBatchResponse, Reading, RecordOutcome,
};
use hivewatch_rpc::ClientError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::buffer::LocalBuffer;

/// Envelope, ids and length prefixes on top of the readings themselves.
const BATCH_OVERHEAD_BYTES: usize = 96;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("rpc error: {0}")]
    Rpc(#[from] ClientError),
    #[error("send timed out")]
    Timeout,
    #[error("failed to encode reading: {0}")]
    Encode(#[from] postcard::Error),
    #[error("hub returned {got} outcomes for {expected} readings")]
    OutcomeMismatch { expected: usize, got: usize },
}

/// Transport to the hub's ingest endpoint.
#[async_trait]
pub trait Uplink: Send + Sync + 'static {
    async fn send(&self, request: IngestBatchRequest)
    -> Result<IngestBatchResponse, ForwardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub max_batch_bytes: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_consecutive_failures: u32,
    pub send_timeout: Duration,
    /// Optional uplink budget; `None` sends as fast as the link allows.
    pub bytes_per_second: Option<u64>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 64 * 1024,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_consecutive_failures: 5,
            send_timeout: Duration::from_secs(10),
            bytes_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Healthy,
    Backoff,
    /// Retrying only at the maximum interval until a send succeeds.
    Degraded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub batches: usize,
    pub accepted: usize,
    pub flagged: usize,
    pub rejected: usize,
    pub requeued: usize,
}

/// Splits readings into batches whose encoded size stays under `max_bytes`,
/// preserving timestamp order. A single oversized reading still gets its
/// own batch.
pub fn split_batches(
    readings: &[Reading],
    max_bytes: usize,
) -> Result<Vec<Vec<Reading>>, ForwardError> {
    let mut sorted = readings.to_vec();
    sorted.sort_by_key(|r| r.timestamp);

    let budget = max_bytes.saturating_sub(BATCH_OVERHEAD_BYTES);
    let mut batches = Vec::new();
    let mut current: Vec<Reading> = Vec::new();
    let mut current_bytes = 0;

    for reading in sorted {
        let size = postcard::to_stdvec(&reading)?.len();
        if !current.is_empty() && current_bytes + size > budget {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(reading);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    Ok(batches)
}

pub struct SyncForwarder<U> {
    device_id: DeviceId,
    uplink: U,
    buffer: Arc<LocalBuffer>,
    config: ForwarderConfig,
    backoff: ExponentialBackoff,
    consecutive_failures: u32,
    state: LinkState,
}

impl<U: Uplink> SyncForwarder<U> {
    pub fn new(
        device_id: DeviceId,
        uplink: U,
        buffer: Arc<LocalBuffer>,
        config: ForwarderConfig,
    ) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: config.initial_backoff,
            initial_interval: config.initial_backoff,
            max_interval: config.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        Self {
            device_id,
            uplink,
            buffer,
            config,
            backoff,
            consecutive_failures: 0,
            state: LinkState::Healthy,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Drains the buffer and sends it in size-capped batches.
    ///
    /// On a failed send, that batch and every later one go back to the
    /// front of the buffer. Records the hub rejected as retryable are
    /// requeued as well; permanent rejections are dropped.
    pub async fn sync_once(&mut self) -> Result<SyncReport, ForwardError> {
        let mut report = SyncReport::default();
        let pending = self.buffer.flush().await;
        if pending.is_empty() {
            return Ok(report);
        }

        let batches = match split_batches(&pending, self.config.max_batch_bytes) {
            Ok(batches) => batches,
            Err(e) => {
                self.buffer.requeue_front(pending).await;
                return Err(e);
            }
        };

        let mut retry_later = Vec::new();
        let mut remaining = batches.into_iter();
        while let Some(batch) = remaining.next() {
            let batch_len = batch.len();
            match self.send_batch(&batch).await {
                Ok(response) => {
                    report.batches += 1;
                    for (reading, outcome) in batch.iter().zip(response.outcomes.iter()) {
                        match outcome {
                            RecordOutcome::Accepted => report.accepted += 1,
                            RecordOutcome::Flagged => report.flagged += 1,
                            outcome if outcome.is_retryable() => retry_later.push(*reading),
                            RecordOutcome::Rejected(reason) => {
                                report.rejected += 1;
                                warn!(
                                    sensor_id = %reading.sensor_id,
                                    timestamp = %reading.timestamp,
                                    ?reason,
                                    "hub rejected reading"
                                );
                            }
                        }
                    }
                    debug!(readings = batch_len, "batch delivered");
                    self.throttle(&batch).await;
                }
                Err(e) => {
                    let mut unsent = retry_later;
                    unsent.extend(batch);
                    unsent.extend(remaining.flatten());
                    unsent.sort_by_key(|r| r.timestamp);
                    self.buffer.requeue_front(unsent).await;
                    return Err(e);
                }
            }
        }

        report.requeued = retry_later.len();
        self.buffer.requeue_front(retry_later).await;
        Ok(report)
    }

    async fn send_batch(&self, batch: &[Reading]) -> Result<IngestBatchResponse, ForwardError> {
        let request = IngestBatchRequest {
            id: BatchId(Ulid::new()),
            device_id: self.device_id,
            readings: batch.into(),
            sent_at: jiff::Timestamp::now(),
        };

        let response = tokio::time::timeout(self.config.send_timeout, self.uplink.send(request))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        if response.outcomes.len() != batch.len() {
            return Err(ForwardError::OutcomeMismatch {
                expected: batch.len(),
                got: response.outcomes.len(),
            });
        }
        Ok(response)
    }

    async fn throttle(&self, batch: &[Reading]) {
        let Some(bps) = self.config.bytes_per_second.filter(|b| *b > 0) else {
            return;
        };
        let bytes: usize = batch
            .iter()
            .filter_map(|r| postcard::to_stdvec(r).ok())
            .map(|b| b.len())
            .sum();
        let pause = Duration::from_secs_f64((bytes + BATCH_OVERHEAD_BYTES) as f64 / bps as f64);
        tokio::time::sleep(pause).await;
    }

    fn on_success(&mut self, report: &SyncReport) {
        if self.consecutive_failures > 0 {
            info!(
                after_failures = self.consecutive_failures,
                "uplink recovered"
            );
        }
        self.consecutive_failures = 0;
        self.state = LinkState::Healthy;
        self.backoff.reset();

        if report.batches > 0 {
            info!(
                batches = report.batches,
                accepted = report.accepted,
                flagged = report.flagged,
                rejected = report.rejected,
                requeued = report.requeued,
                "buffer synced"
            );
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    fn on_failure(&mut self, error: &ForwardError) -> Duration {
        self.consecutive_failures += 1;

        if self.state != LinkState::Degraded
            && self.consecutive_failures >= self.config.max_consecutive_failures
        {
            self.state = LinkState::Degraded;
            error!(
                failures = self.consecutive_failures,
                retry_every = ?self.config.max_backoff,
                error = %error,
                "uplink degraded"
            );
        }

        let delay = match self.state {
            LinkState::Degraded => self.config.max_backoff,
            _ => {
                self.state = LinkState::Backoff;
                self.backoff
                    .next_backoff()
                    .unwrap_or(self.config.max_backoff)
            }
        };

        warn!(
            failures = self.consecutive_failures,
            ?delay,
            error = %error,
            "sync failed, readings kept for retry"
        );
        delay
    }

    /// Forwards whenever the buffer asks for a flush, until cancelled.
    /// A final best-effort flush runs on shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(device_id = %self.device_id, "forwarder started");
        let buffer = Arc::clone(&self.buffer);

        'outer: loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = buffer.wait_flush_due() => {}
            }

            loop {
                match self.sync_once().await {
                    Ok(report) => {
                        self.on_success(&report);
                        if report.requeued > 0 {
                            // hub-side trouble, give it a moment before the requeued records
                            tokio::select! {
                                _ = cancel.cancelled() => break 'outer,
                                _ = tokio::time::sleep(self.config.initial_backoff) => {}
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        let delay = self.on_failure(&e);
                        tokio::select! {
                            _ = cancel.cancelled() => break 'outer,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        if !buffer.is_empty().await {
            let pending = buffer.len().await;
            info!(pending, "final flush before shutdown");
            match self.sync_once().await {
                Ok(report) => self.on_success(&report),
                Err(e) => {
                    let pending = buffer.len().await;
                    warn!(
                        error = %e,
                        pending,
                        "final flush failed, readings left unsent"
                    )
                }
            }
        }
        info!("forwarder stopped");
    }
}
