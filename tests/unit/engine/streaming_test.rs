// Streaming engine tests

use crate::unit::support::{doc_id, seeded_source, Harness, RecordingProcessor, TARGET_INDEX};
use estransfer::config::StreamingConfig;
use estransfer::engine::{CursorEngine, StreamingEngine};
use estransfer::metrics::MEMORY_RECLAIMS;
use estransfer::models::CheckpointStatus;
use estransfer::pipeline::{ManualMemorySampler, MemoryMonitor};
use estransfer::TransferError;
use std::sync::Arc;

#[cfg(test)]
mod streaming_tests {
    use super::*;

    fn quick_config() -> StreamingConfig {
        StreamingConfig {
            poll_timeout_ms: 20,
            pause_sleep_ms: 5,
            reclaim_settle_ms: 1,
            pressure_delay_ms: 1,
            ..StreamingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_streaming_transfers_every_page() {
        let harness = Harness::new(seeded_source(2500).await);
        let ctx = harness.context("stream-all", 1000);
        let writer = Arc::new(harness.writer("stream-all"));

        let report = StreamingEngine::new(quick_config())
            .run(&ctx, writer.clone())
            .await
            .unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.processed, 2500);
        assert_eq!(report.success, 2500);
        assert!(!report.cancelled);
        assert_eq!(harness.target.len(TARGET_INDEX).await, 2500);
        assert_eq!(writer.totals(), (2500, 2500, 0));
    }

    #[tokio::test]
    async fn test_streaming_delivers_each_document_once() {
        let harness = Harness::new(seeded_source(1234).await);
        let ctx = harness.context("stream-once", 100);
        let recorder = Arc::new(RecordingProcessor::default());

        StreamingEngine::new(quick_config())
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        let ids = recorder.ids();
        assert_eq!(ids.len(), 1234);
        assert_eq!(recorder.unique_ids().len(), 1234);
        assert!(recorder.unique_ids().contains(&doc_id(1233)));
    }

    #[tokio::test]
    async fn test_producer_cursor_checkpoint_follows_enqueued_pages() {
        let harness = Harness::new(seeded_source(1234).await);
        let ctx = harness.context("stream-cursor", 100);

        StreamingEngine::new(quick_config())
            .run(&ctx, Arc::new(RecordingProcessor::default()))
            .await
            .unwrap();

        let cursors = harness.checkpoints.cursor_checkpoints("stream-cursor").await;
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].status, CheckpointStatus::Completed);
        let progress = cursors[0].document().unwrap();
        assert_eq!(progress.processed_count, 1234);
        assert_eq!(progress.last_processed_id.as_deref(), Some(doc_id(1233).as_str()));
    }

    #[tokio::test]
    async fn test_producer_pauses_and_reclaims_under_pressure() {
        let sampler = Arc::new(ManualMemorySampler::new(0.92).with_reclaim_target(0.5));
        let memory = MemoryMonitor::new(sampler.clone());
        let harness = Harness::with_memory(seeded_source(2500).await, memory.clone());
        let ctx = harness.context("stream-pressure", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        // Keep the background monitor quiet so the producer does the reclaiming
        let config = StreamingConfig {
            throttle_pressure: 0.95,
            pause_pressure: 0.9,
            ..quick_config()
        };

        let report = StreamingEngine::new(config)
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert!(memory.reclaim_count() >= 1);
        assert!(
            MEMORY_RECLAIMS
                .with_label_values(&["streaming-producer"])
                .get()
                >= 1.0
        );
        assert!(memory.last_pressure() < 0.9);
        assert_eq!(report.processed, 2500);
        assert_eq!(recorder.unique_ids().len(), 2500);
    }

    #[tokio::test]
    async fn test_buffer_limit_stops_the_producer() {
        let memory = MemoryMonitor::fixed(0.1).with_tracking_limit(64);
        let harness = Harness::with_memory(seeded_source(200).await, memory.clone());
        let ctx = harness.context("stream-limit", 100);

        let result = StreamingEngine::new(quick_config())
            .run(&ctx, Arc::new(RecordingProcessor::default()))
            .await;

        assert!(matches!(result, Err(TransferError::ResourceExhausted(_))));
        assert_eq!(memory.tracked_bytes(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_stream_produces_nothing() {
        let harness = Harness::new(seeded_source(500).await);
        let ctx = harness.context("stream-cancel", 100);
        harness.cancel();

        let recorder = Arc::new(RecordingProcessor::default());
        let report = StreamingEngine::new(quick_config())
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.pages, 0);
        assert!(recorder.ids().is_empty());
    }
}
