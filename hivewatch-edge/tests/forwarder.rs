use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hivewatch_core::{
    DeviceId, IngestBatchRequest, IngestBatchResponse, Reading, RecordOutcome, RejectReason,
    SensorId,
};
use hivewatch_edge::{
    buffer::{BufferConfig, LocalBuffer},
    forwarder::{ForwardError, ForwarderConfig, SyncForwarder, Uplink},
};
use hivewatch_rpc::{ClientError, RpcError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Fails the first `failures` sends, then accepts everything.
#[derive(Clone)]
struct FlakyUplink {
    failures: Arc<Mutex<u32>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    delivered: Arc<Mutex<Vec<Reading>>>,
    outcome: RecordOutcome,
}

impl FlakyUplink {
    fn new(failures: u32) -> Self {
        Self {
            failures: Arc::new(Mutex::new(failures)),
            attempts: Arc::default(),
            delivered: Arc::default(),
            outcome: RecordOutcome::Accepted,
        }
    }
}

#[async_trait]
impl Uplink for FlakyUplink {
    async fn send(
        &self,
        request: IngestBatchRequest,
    ) -> Result<IngestBatchResponse, ForwardError> {
        self.attempts.lock().unwrap().push(Instant::now());
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ForwardError::Rpc(ClientError::Rpc(RpcError::Closed)));
            }
        }
        self.delivered
            .lock()
            .unwrap()
            .extend(request.readings.iter().copied());
        Ok(IngestBatchResponse {
            id: request.id,
            outcomes: request.readings.iter().map(|_| self.outcome).collect(),
        })
    }
}

fn reading(secs: i64) -> Reading {
    Reading::new(
        SensorId(Ulid::nil()),
        secs as f64,
        jiff::Timestamp::from_second(1_700_000_000 + secs).unwrap(),
    )
    .unwrap()
}

fn config() -> ForwarderConfig {
    ForwarderConfig {
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(60),
        max_consecutive_failures: 5,
        ..ForwarderConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn failed_sends_keep_readings_and_back_off() {
    let buffer = Arc::new(LocalBuffer::new(BufferConfig {
        flush_size: 5,
        capacity: 100,
        flush_timeout: Duration::from_secs(30),
    }));
    // appended out of order on purpose
    for secs in [3, 1, 4, 0, 2] {
        buffer.append(reading(secs)).await;
    }

    let uplink = FlakyUplink::new(3);
    let forwarder = SyncForwarder::new(
        DeviceId(Ulid::new()),
        uplink.clone(),
        Arc::clone(&buffer),
        config(),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));

    while uplink.delivered.lock().unwrap().len() < 5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cancel.cancel();
    task.await.unwrap();

    let attempts = uplink.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    let delivered: Vec<f64> = uplink
        .delivered
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.value())
        .collect();
    assert_eq!(delivered, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    assert!(buffer.is_empty().await);
}

#[tokio::test]
async fn nothing_is_lost_while_the_link_is_down() {
    let buffer = Arc::new(LocalBuffer::new(BufferConfig::default()));
    for secs in 0..10 {
        buffer.append(reading(secs)).await;
    }

    let uplink = FlakyUplink::new(u32::MAX);
    let mut forwarder = SyncForwarder::new(
        DeviceId(Ulid::new()),
        uplink.clone(),
        Arc::clone(&buffer),
        config(),
    );

    for _ in 0..3 {
        assert!(forwarder.sync_once().await.is_err());
        assert_eq!(buffer.len().await, 10);
    }

    // new readings queue up behind the retained ones
    buffer.append(reading(10)).await;
    let pending: Vec<f64> = buffer.flush().await.iter().map(|r| r.value()).collect();
    assert_eq!(pending, (0..=10).map(|s| s as f64).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn link_degrades_after_repeated_failures() {
    let buffer = Arc::new(LocalBuffer::new(BufferConfig {
        flush_size: 1,
        capacity: 100,
        flush_timeout: Duration::from_secs(1),
    }));
    buffer.append(reading(0)).await;

    let uplink = FlakyUplink::new(7);
    let forwarder = SyncForwarder::new(
        DeviceId(Ulid::new()),
        uplink.clone(),
        Arc::clone(&buffer),
        ForwarderConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            max_consecutive_failures: 3,
            ..ForwarderConfig::default()
        },
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));
    while uplink.delivered.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cancel.cancel();
    task.await.unwrap();

    let attempts = uplink.attempts.lock().unwrap().clone();
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();
    // backoff 1, 2, then degraded: only the max interval
    assert_eq!(gaps, vec![1, 2, 8, 8, 8, 8, 8]);
}

#[tokio::test]
async fn permanent_rejections_are_dropped_internal_ones_requeued() {
    let buffer = Arc::new(LocalBuffer::new(BufferConfig::default()));
    buffer.append(reading(0)).await;
    buffer.append(reading(1)).await;

    let mut rejecting = FlakyUplink::new(0);
    rejecting.outcome = RecordOutcome::Rejected(RejectReason::UnknownSensor);
    let mut forwarder = SyncForwarder::new(
        DeviceId(Ulid::new()),
        rejecting,
        Arc::clone(&buffer),
        config(),
    );
    let report = forwarder.sync_once().await.unwrap();
    assert_eq!(report.rejected, 2);
    assert!(buffer.is_empty().await);

    buffer.append(reading(2)).await;
    let mut internal = FlakyUplink::new(0);
    internal.outcome = RecordOutcome::Rejected(RejectReason::Internal);
    let mut forwarder = SyncForwarder::new(
        DeviceId(Ulid::new()),
        internal,
        Arc::clone(&buffer),
        config(),
    );
    let report = forwarder.sync_once().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(buffer.len().await, 1);
}
