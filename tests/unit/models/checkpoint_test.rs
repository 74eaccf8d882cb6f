// Checkpoint model tests

use chrono::Utc;
use estransfer::models::{
    storage_key, BatchProgress, Checkpoint, CheckpointKind, CheckpointPayload, CheckpointStatus,
    Document, DocumentProgress, TaskStatus, TransferReport, TimeRangeProgress,
};
use estransfer::config::TransferStrategy;
use serde_json::json;

#[cfg(test)]
mod checkpoint_model_tests {
    use super::*;

    fn batch_checkpoint() -> Checkpoint {
        Checkpoint::new(
            "checkpoint_1_0".to_string(),
            "task".to_string(),
            0,
            CheckpointPayload::Batch(BatchProgress {
                batch_number: 4,
                document_ids: vec!["a".to_string(), "b".to_string()],
                size: 2,
                ..Default::default()
            }),
            3,
        )
    }

    #[test]
    fn test_checkpoint_serializes_single_payload() {
        let checkpoint = batch_checkpoint();
        let value = serde_json::to_value(&checkpoint).unwrap();

        assert!(value["payload"]["batch"].is_object());
        assert!(value["payload"].get("document").is_none());
        assert_eq!(value["status"], json!("pending"));

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
        assert_eq!(back.kind(), CheckpointKind::Batch);
    }

    #[test]
    fn test_payload_must_be_exactly_one() {
        let mut value = serde_json::to_value(batch_checkpoint()).unwrap();
        value["payload"]["document"] = serde_json::to_value(DocumentProgress::default()).unwrap();
        assert!(serde_json::from_value::<Checkpoint>(value.clone()).is_err());

        value["payload"] = json!({});
        let err = serde_json::from_value::<Checkpoint>(value).unwrap_err();
        assert!(err.to_string().contains("no payload"));
    }

    #[test]
    fn test_retry_budget() {
        let mut checkpoint = batch_checkpoint();
        assert!(checkpoint.can_retry());
        for _ in 0..3 {
            checkpoint.increment_retry();
        }
        assert_eq!(checkpoint.retry_count, 3);
        assert!(!checkpoint.can_retry());
    }

    #[test]
    fn test_fail_records_message_and_touches() {
        let mut checkpoint = batch_checkpoint();
        let before = checkpoint.last_update_time();

        checkpoint.fail("bulk rejected");

        assert_eq!(checkpoint.status, CheckpointStatus::Failed);
        assert_eq!(checkpoint.error_message.as_deref(), Some("bulk rejected"));
        assert!(checkpoint.last_update_time() >= before);
        assert!(checkpoint.status.is_recoverable());
        assert!(checkpoint.status.is_unresolved());
        assert!(!CheckpointStatus::Completed.is_unresolved());
    }

    #[test]
    fn test_expiry() {
        let checkpoint = batch_checkpoint();
        assert!(!checkpoint.is_expired(chrono::Duration::hours(1)));
        assert!(checkpoint.is_expired(chrono::Duration::milliseconds(-1)));
    }

    #[test]
    fn test_typed_accessors_match_kind() {
        let checkpoint = batch_checkpoint();
        assert!(checkpoint.batch().is_some());
        assert!(checkpoint.document().is_none());
        assert!(checkpoint.time_range().is_none());
        assert_eq!(checkpoint.payload().kind(), CheckpointKind::Batch);
    }

    #[test]
    fn test_time_range_validity() {
        let now = Utc::now();
        let mut range = TimeRangeProgress {
            start: now,
            end: now + chrono::Duration::minutes(10),
            current: now,
            window_minutes: 10,
            time_field: "@timestamp".to_string(),
            processed_windows: 0,
        };
        assert!(range.is_valid());
        range.current = range.end;
        assert!(!range.is_valid());
    }

    #[test]
    fn test_kind_names_and_order() {
        assert_eq!(CheckpointKind::TimeRange.as_str(), "time_range");
        assert_eq!(CheckpointKind::Field.to_string(), "field");
        assert!(CheckpointKind::Document < CheckpointKind::Field);
        assert!(CheckpointKind::Batch < CheckpointKind::TimeRange);
    }

    #[test]
    fn test_storage_key() {
        assert_eq!(storage_key("task", None), "task");
        assert_eq!(storage_key("task", Some(2)), "task_shard_2");
    }

    #[test]
    fn test_task_status_finished() {
        assert!(TaskStatus::Completed.is_finished());
        assert!(TaskStatus::Cancelled.is_finished());
        assert!(!TaskStatus::Failed.is_finished());
        assert!(!TaskStatus::CompletedWithFailures.is_finished());
        assert_eq!(TaskStatus::CompletedWithFailures.to_string(), "completed_with_failures");
    }

    #[test]
    fn test_document_output_prefers_transformed() {
        let mut doc = Document::from_value("a", json!({ "name": "Alice" }));
        assert_eq!(doc.output()["name"], json!("Alice"));

        let mut transformed = serde_json::Map::new();
        transformed.insert("name".to_string(), json!("alice"));
        doc.transformed = Some(transformed);
        assert_eq!(doc.output()["name"], json!("alice"));

        assert!(Document::from_value("b", json!([1, 2])).source.is_empty());
        assert_eq!(Document::from_value("c", json!({ "k": "vv" })).estimated_size(), 4);
    }

    #[test]
    fn test_report_success_rate() {
        let mut report = TransferReport {
            task_id: "task".to_string(),
            strategy: TransferStrategy::Streaming,
            status: TaskStatus::Completed,
            processed: 0,
            success: 0,
            failed: 0,
            pages: 0,
            recovered: 0,
            duration_ms: 0,
            error: None,
        };
        assert_eq!(report.success_rate(), 0.0);

        report.processed = 200;
        report.success = 150;
        assert_eq!(report.success_rate(), 0.75);
    }
}
