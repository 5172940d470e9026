mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{HIVE, Hub, OTHER_SENSOR, SENSOR, ago, now, reading};
use hivewatch_core::{HiveId, SensorId};
use hivewatch_hub::cleanup::{AttachmentStore, CleanupError, CleanupStep, HiveCleanup};
use hivewatch_core::{RecordOutcome, RejectReason};
use jiff::SignedDuration;
use tokio::sync::Notify;
use ulid::Ulid;

/// Records which attachment calls were made and can fail comment deletion.
#[derive(Default)]
struct RecordingAttachments {
    calls: Mutex<Vec<&'static str>>,
    fail_comments: Mutex<bool>,
}

#[async_trait]
impl AttachmentStore for RecordingAttachments {
    async fn delete_files(&self, _hive: HiveId) -> Result<u64, String> {
        self.calls.lock().unwrap().push("files");
        Ok(3)
    }

    async fn delete_comments(&self, _hive: HiveId) -> Result<u64, String> {
        self.calls.lock().unwrap().push("comments");
        if *self.fail_comments.lock().unwrap() {
            return Err("comment service unavailable".to_string());
        }
        Ok(2)
    }
}

/// Pauses file deletion until released, to run ingest mid-cleanup.
#[derive(Default)]
struct GatedAttachments {
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl AttachmentStore for GatedAttachments {
    async fn delete_files(&self, _hive: HiveId) -> Result<u64, String> {
        self.reached.notify_one();
        self.release.notified().await;
        Ok(0)
    }

    async fn delete_comments(&self, _hive: HiveId) -> Result<u64, String> {
        Ok(0)
    }
}

fn cleanup(hub: &Hub, attachments: Arc<dyn AttachmentStore>) -> HiveCleanup {
    HiveCleanup::new(
        Arc::clone(&hub.registry),
        Arc::clone(&hub.store),
        attachments,
        Arc::clone(&hub.cache),
        hub.sensor_locks.clone(),
    )
}

async fn seed(hub: &Hub) {
    hub.writer
        .write_batch(
            &[
                reading(SENSOR, ago(SignedDuration::from_hours(2)), 34.0),
                reading(SENSOR, ago(SignedDuration::from_hours(1)), 35.0),
                reading(OTHER_SENSOR, ago(SignedDuration::from_hours(1)), 12.0),
            ],
            now(),
        )
        .await;
    hub.aggregator.aggregate_tier("tier1", now()).await.unwrap();
}

#[tokio::test]
async fn deletes_everything_in_order() {
    let hub = Hub::new().await;
    seed(&hub).await;
    let attachments = Arc::new(RecordingAttachments::default());

    let report = cleanup(&hub, Arc::clone(&attachments) as Arc<dyn AttachmentStore>)
        .delete_hive(HiveId(HIVE))
        .await
        .unwrap();

    assert_eq!(
        report.completed,
        vec![
            CleanupStep::Data,
            CleanupStep::Files,
            CleanupStep::Comments,
            CleanupStep::Sensors,
            CleanupStep::Hive,
        ]
    );
    // three readings and three tier1 buckets
    assert_eq!(report.rows_deleted, 6);
    assert_eq!(report.files_deleted, 3);
    assert_eq!(report.comments_deleted, 2);
    assert_eq!(report.sensors_deleted, 2);
    assert_eq!(*attachments.calls.lock().unwrap(), vec!["files", "comments"]);

    assert!(hub.registry.get_hive(HiveId(HIVE)).await.unwrap().is_none());
    assert!(hub.registry.get_sensor(SensorId(SENSOR)).await.unwrap().is_none());
    assert!(hub.store.sensor_ids().await.unwrap().is_empty());
    assert!(hub.cache.get(SensorId(SENSOR), now()).is_none());
}

#[tokio::test]
async fn failed_step_stops_the_cascade_and_can_be_retried() {
    let hub = Hub::new().await;
    seed(&hub).await;
    let attachments = Arc::new(RecordingAttachments::default());
    *attachments.fail_comments.lock().unwrap() = true;
    let cleanup = cleanup(&hub, Arc::clone(&attachments) as Arc<dyn AttachmentStore>);

    match cleanup.delete_hive(HiveId(HIVE)).await {
        Err(CleanupError::StepFailed {
            step,
            message,
            report,
        }) => {
            assert_eq!(step, CleanupStep::Comments);
            assert!(message.contains("unavailable"));
            assert_eq!(report.completed, vec![CleanupStep::Data, CleanupStep::Files]);
        }
        other => panic!("expected a failed step, got {other:?}"),
    }

    // sensors and hive are untouched
    assert!(hub.registry.get_sensor(SensorId(SENSOR)).await.unwrap().is_some());
    assert!(hub.registry.get_hive(HiveId(HIVE)).await.unwrap().is_some());

    *attachments.fail_comments.lock().unwrap() = false;
    let report = cleanup.delete_hive(HiveId(HIVE)).await.unwrap();
    assert_eq!(report.rows_deleted, 0);
    assert_eq!(report.completed.last(), Some(&CleanupStep::Hive));
    assert!(hub.registry.get_hive(HiveId(HIVE)).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_hive_is_not_found() {
    let hub = Hub::new().await;
    let attachments = Arc::new(RecordingAttachments::default());

    let result = cleanup(&hub, Arc::clone(&attachments) as Arc<dyn AttachmentStore>)
        .delete_hive(HiveId(Ulid(42)))
        .await;
    assert!(matches!(result, Err(CleanupError::NotFound(_))));
    assert!(attachments.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ingest_during_cleanup_leaves_no_orphan_rows() {
    let hub = Hub::new().await;
    seed(&hub).await;
    let attachments = Arc::new(GatedAttachments::default());
    let cleanup = cleanup(&hub, Arc::clone(&attachments) as Arc<dyn AttachmentStore>);

    let deletion = tokio::spawn(async move { cleanup.delete_hive(HiveId(HIVE)).await });
    attachments.reached.notified().await;

    // data is gone but the sensor is still registered
    assert!(hub.store.sensor_ids().await.unwrap().is_empty());
    let writer = hub.writer.clone();
    let write = tokio::spawn(async move {
        writer
            .write_batch(&[reading(SENSOR, ago(SignedDuration::from_mins(5)), 36.0)], now())
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!write.is_finished());

    attachments.release.notify_one();
    let report = deletion.await.unwrap().unwrap();
    assert_eq!(report.completed.last(), Some(&CleanupStep::Hive));

    let outcomes = write.await.unwrap();
    assert_eq!(
        outcomes,
        vec![RecordOutcome::Rejected(RejectReason::UnknownSensor)]
    );
    assert!(hub.store.sensor_ids().await.unwrap().is_empty());
    assert!(hub.cache.get(SensorId(SENSOR), now()).is_none());
}
