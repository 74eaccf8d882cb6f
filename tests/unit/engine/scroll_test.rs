// Scroll engine tests

use crate::unit::support::{
    doc_id, fast_retry, seeded_source, Harness, RecordingProcessor, SOURCE_INDEX, TARGET_INDEX,
};
use async_trait::async_trait;
use estransfer::config::{ScrollConfig, TransferConfig};
use estransfer::engine::{CursorEngine, PageProcessor, PageResult, ScrollEngine};
use estransfer::models::{CheckpointStatus, Document};
use estransfer::pipeline::MemoryMonitor;
use estransfer::recovery::RecoveryEngine;
use estransfer::store::MemoryStore;
use estransfer::{Result, TransferError};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(test)]
mod scroll_tests {
    use super::*;

    /// Fails every page whose number is listed
    struct FailingPages(Vec<u64>);

    #[async_trait]
    impl PageProcessor for FailingPages {
        async fn process_page(
            &self,
            documents: Vec<Document>,
            page_number: u64,
            _page_key: Option<String>,
        ) -> Result<PageResult> {
            if self.0.contains(&page_number) {
                return Err(TransferError::BulkWrite(format!("page {} rejected", page_number)));
            }
            Ok(PageResult {
                success: documents.len() as u64,
                failed: 0,
            })
        }
    }

    /// Makes the next source fetch fail once the first page has been seen
    struct InjectAfterFirstPage {
        source: Arc<MemoryStore>,
        inner: RecordingProcessor,
    }

    #[async_trait]
    impl PageProcessor for InjectAfterFirstPage {
        async fn process_page(
            &self,
            documents: Vec<Document>,
            page_number: u64,
            page_key: Option<String>,
        ) -> Result<PageResult> {
            if page_number == 1 {
                self.source.fail_next_searches(1);
            }
            self.inner.process_page(documents, page_number, page_key).await
        }
    }

    /// Requests cancellation while handling the given page
    struct CancelOnPage {
        harness: Arc<Harness>,
        page: u64,
    }

    #[async_trait]
    impl PageProcessor for CancelOnPage {
        async fn process_page(
            &self,
            documents: Vec<Document>,
            page_number: u64,
            _page_key: Option<String>,
        ) -> Result<PageResult> {
            if page_number == self.page {
                self.harness.cancel();
            }
            Ok(PageResult {
                success: documents.len() as u64,
                failed: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_scroll_walks_every_page_and_releases_cursor() {
        let harness = Harness::new(seeded_source(2500).await);
        let ctx = harness.context("scroll-task", 1000);
        let writer = Arc::new(harness.writer("scroll-task"));

        let engine = ScrollEngine::new(ScrollConfig::default(), 1);
        let report = engine.run(&ctx, writer.clone()).await.unwrap();

        // Opening search plus two follow-ups with hits and one empty fetch
        assert_eq!(harness.source.scroll_fetches(), 4);
        assert_eq!(report.pages, 3);
        assert_eq!(report.processed, 2500);
        assert_eq!(report.success, 2500);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);

        assert_eq!(harness.source.cleared_scrolls(), 1);
        assert_eq!(harness.source.open_scrolls().await, 0);
        assert_eq!(harness.target.len(TARGET_INDEX).await, 2500);
        assert_eq!(writer.totals(), (2500, 2500, 0));
    }

    #[tokio::test]
    async fn test_scroll_page_sizes_follow_batch_size() {
        let harness = Harness::new(seeded_source(2500).await);
        let ctx = harness.context("scroll-sizes", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let engine = ScrollEngine::new(ScrollConfig::default(), 1);
        engine.run(&ctx, recorder.clone()).await.unwrap();

        assert_eq!(recorder.page_sizes(), vec![1000, 1000, 500]);
        assert_eq!(recorder.unique_ids().len(), 2500);
        // Every page carries the cursor it came from
        assert!(recorder.page_keys().iter().all(|k| k.is_some()));
    }

    #[tokio::test]
    async fn test_failed_page_does_not_stop_the_walk() {
        let harness = Harness::new(seeded_source(2500).await);
        let ctx = harness.context("scroll-failing", 1000);

        let engine = ScrollEngine::new(ScrollConfig::default(), 1);
        let report = engine.run(&ctx, Arc::new(FailingPages(vec![2]))).await.unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.failed_pages, 1);
        assert_eq!(report.success, 1500);
        assert_eq!(report.failed, 1000);
        assert_eq!(harness.source.cleared_scrolls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scroll_still_clears_cursor() {
        let harness = Harness::new(seeded_source(500).await);
        let ctx = harness.context("scroll-cancel", 100);
        harness.cancel();

        let recorder = Arc::new(RecordingProcessor::default());
        let engine = ScrollEngine::new(ScrollConfig::default(), 1);
        let report = engine.run(&ctx, recorder.clone()).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.pages, 0);
        assert!(recorder.ids().is_empty());
        assert_eq!(harness.source.cleared_scrolls(), 1);
        assert_eq!(harness.source.open_scrolls().await, 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_returned() {
        let harness = Harness::new(seeded_source(100).await);
        harness.source.fail_next_searches(1);
        let ctx = harness.context("scroll-open-fails", 50);

        let engine = ScrollEngine::new(ScrollConfig::default(), 1);
        let result = engine.run(&ctx, Arc::new(RecordingProcessor::default())).await;

        assert!(matches!(result, Err(TransferError::Connection(_))));
        assert_eq!(harness.source.open_scrolls().await, 0);
    }

    #[tokio::test]
    async fn test_transient_scroll_failure_is_retried() {
        let harness = Harness::new(seeded_source(300).await);
        let ctx = harness.context("scroll-retry", 100);
        let injector = Arc::new(InjectAfterFirstPage {
            source: harness.source.clone(),
            inner: RecordingProcessor::default(),
        });

        let engine = ScrollEngine::new(ScrollConfig::default(), 1);
        let report = engine.run(&ctx, injector.clone()).await.unwrap();

        assert_eq!(report.processed, 300);
        assert_eq!(report.failed_pages, 0);
        assert_eq!(injector.inner.unique_ids().len(), 300);
        // Open, three pages, one failed attempt, one empty fetch
        assert_eq!(harness.source.scroll_fetches(), 5);
    }

    #[tokio::test]
    async fn test_lease_is_refreshed_every_configured_round() {
        let harness = Harness::new(seeded_source(50).await);
        let ctx = harness.context("scroll-refresh", 10);
        let config = ScrollConfig {
            refresh_every: 2,
            ..ScrollConfig::default()
        };

        let report = ScrollEngine::new(config, 1)
            .run(&ctx, Arc::new(RecordingProcessor::default()))
            .await
            .unwrap();

        assert_eq!(report.pages, 5);
        // Rounds two and four
        assert_eq!(harness.source.scroll_extensions(), 2);
    }

    #[tokio::test]
    async fn test_high_pressure_pauses_once_per_round() {
        let harness = Harness::with_memory(seeded_source(20).await, MemoryMonitor::fixed(0.95));
        let ctx = harness.context("scroll-pressure", 10);
        let config = ScrollConfig {
            reclaim_pause_ms: 100,
            pressure_delay_ms: 100,
            ..ScrollConfig::default()
        };

        let started = Instant::now();
        let report = ScrollEngine::new(config, 1)
            .run(&ctx, Arc::new(RecordingProcessor::default()))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.pages, 2);
        assert_eq!(harness.throttle.memory().reclaim_count(), 2);
        assert!(elapsed >= Duration::from_millis(190), "paused {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(350), "paused {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cursor_checkpoint_completes_with_the_walk() {
        let harness = Harness::new(seeded_source(250).await);
        let ctx = harness.context("scroll-cursor", 100);

        ScrollEngine::new(ScrollConfig::default(), 1)
            .run(&ctx, Arc::new(RecordingProcessor::default()))
            .await
            .unwrap();

        let cursors = harness.checkpoints.cursor_checkpoints("scroll-cursor").await;
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].status, CheckpointStatus::Completed);
        let progress = cursors[0].document().unwrap();
        assert_eq!(progress.processed_count, 250);
        assert_eq!(progress.last_processed_id.as_deref(), Some(doc_id(249).as_str()));
        assert_eq!(progress.walk.as_ref().unwrap().engine, "scroll");
    }

    #[tokio::test]
    async fn test_cancelled_walk_is_finished_by_recovery() {
        let harness = Arc::new(Harness::new(seeded_source(300).await));
        let ctx = harness.context("scroll-resume", 100);
        let processor = Arc::new(CancelOnPage {
            harness: harness.clone(),
            page: 2,
        });

        let report = ScrollEngine::new(ScrollConfig::default(), 1)
            .run(&ctx, processor)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 200);

        let cursor = harness.checkpoints.cursor_checkpoints("scroll-resume").await.remove(0);
        assert_eq!(cursor.status, CheckpointStatus::Processing);
        assert_eq!(cursor.document().unwrap().last_processed_id.as_deref(), Some(doc_id(199).as_str()));

        harness.checkpoints.suspend_task("scroll-resume").await;
        let recovery = RecoveryEngine::new(
            harness.source.clone(),
            harness.target.clone(),
            &TransferConfig::new(SOURCE_INDEX, TARGET_INDEX),
            harness.checkpoints.clone(),
            harness.breakers.clone(),
            100,
        )
        .with_retry(fast_retry())
        .recover_task("scroll-resume")
        .await;

        assert!(recovery.is_success());
        assert_eq!(recovery.recovered_documents, 100);
        let mut expected: Vec<String> = (200..300).map(doc_id).collect();
        expected.sort();
        assert_eq!(harness.target.ids(TARGET_INDEX).await, expected);

        let cursor = harness.checkpoints.get(&cursor.id).await.unwrap();
        assert_eq!(cursor.status, CheckpointStatus::Completed);
        assert_eq!(cursor.document().unwrap().processed_count, 300);
    }

    #[test]
    fn test_keep_alive_tiers() {
        assert_eq!(ScrollEngine::initial_keep_alive(500), Duration::from_secs(300));
        assert_eq!(ScrollEngine::initial_keep_alive(2_000_000), Duration::from_secs(600));
        assert_eq!(ScrollEngine::initial_keep_alive(20_000_000), Duration::from_secs(1800));

        assert_eq!(ScrollEngine::adaptive_keep_alive(0, 0.2), Duration::from_secs(300));
        assert_eq!(ScrollEngine::adaptive_keep_alive(0, 0.85), Duration::from_secs(600));
        assert_eq!(ScrollEngine::adaptive_keep_alive(0, 0.95), Duration::from_secs(1800));
        assert_eq!(ScrollEngine::adaptive_keep_alive(60_000_000, 0.1), Duration::from_secs(1800));
    }
}
