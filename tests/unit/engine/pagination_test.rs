// Pagination engine tests

use crate::unit::support::{base_time, doc_id, seed, Harness, RecordingProcessor, SOURCE_INDEX};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use estransfer::config::{PaginationConfig, PaginationMode};
use estransfer::engine::{CursorEngine, PageProcessor, PageResult, PaginationEngine};
use estransfer::models::{CheckpointKind, CheckpointStatus, Document};
use estransfer::store::MemoryStore;
use estransfer::Result;
use serde_json::json;
use std::sync::Arc;

#[cfg(test)]
mod pagination_tests {
    use super::*;

    fn id_based(page_size: usize) -> PaginationConfig {
        PaginationConfig {
            mode: PaginationMode::IdBased,
            page_size,
            ..PaginationConfig::default()
        }
    }

    fn time_based(page_size: usize) -> PaginationConfig {
        PaginationConfig {
            mode: PaginationMode::TimeBased,
            page_size,
            ..PaginationConfig::default()
        }
    }

    async fn source_with(count: usize, step: ChronoDuration) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new("source"));
        seed(&store, count, step).await;
        store
    }

    /// Breaks the source for `failures` fetches after the first page
    struct BreakSourceAfterFirstPage {
        source: Arc<MemoryStore>,
        failures: usize,
        inner: RecordingProcessor,
    }

    #[async_trait]
    impl PageProcessor for BreakSourceAfterFirstPage {
        async fn process_page(
            &self,
            documents: Vec<Document>,
            page_number: u64,
            page_key: Option<String>,
        ) -> Result<PageResult> {
            if page_number == 1 {
                self.source.fail_next_searches(self.failures);
            }
            self.inner.process_page(documents, page_number, page_key).await
        }
    }

    #[tokio::test]
    async fn test_id_pages_exact_multiple() {
        let harness = Harness::new(source_with(1000, ChronoDuration::seconds(1)).await);
        let ctx = harness.context("id-exact", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let report = PaginationEngine::new(id_based(250))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.pages, 4);
        assert_eq!(recorder.page_sizes(), vec![250, 250, 250, 250]);
        // Four full pages and one empty fetch
        assert_eq!(harness.source.search_calls(), 5);
        assert_eq!(recorder.ids().len(), 1000);
        assert_eq!(recorder.unique_ids().len(), 1000);
    }

    #[tokio::test]
    async fn test_id_pages_short_last_page() {
        let harness = Harness::new(source_with(1050, ChronoDuration::seconds(1)).await);
        let ctx = harness.context("id-short", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let report = PaginationEngine::new(id_based(250))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.pages, 5);
        assert_eq!(recorder.page_sizes(), vec![250, 250, 250, 250, 50]);
        // The short page ends the walk without an extra search
        assert_eq!(harness.source.search_calls(), 5);
        assert_eq!(recorder.unique_ids().len(), 1050);
    }

    #[tokio::test]
    async fn test_id_pages_are_in_id_order_with_cursor_keys() {
        let harness = Harness::new(source_with(300, ChronoDuration::seconds(1)).await);
        let ctx = harness.context("id-order", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        PaginationEngine::new(id_based(100))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        let expected: Vec<String> = (0..300).map(doc_id).collect();
        assert_eq!(recorder.ids(), expected);

        let keys = recorder.page_keys();
        assert_eq!(keys[0].as_deref(), Some("start"));
        assert_eq!(keys[1].as_deref(), Some(r#"["doc-00099"]"#));
    }

    #[tokio::test]
    async fn test_id_walk_keeps_a_cursor_checkpoint() {
        let harness = Harness::new(source_with(300, ChronoDuration::seconds(1)).await);
        let ctx = harness.context("id-cursor", 1000);

        PaginationEngine::new(id_based(100))
            .run(&ctx, Arc::new(RecordingProcessor::default()))
            .await
            .unwrap();

        let cursors = harness.checkpoints.cursor_checkpoints("id-cursor").await;
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].status, CheckpointStatus::Completed);
        let progress = cursors[0].document().unwrap();
        assert_eq!(progress.processed_count, 300);
        assert_eq!(progress.resume_after(), Some(vec![json!(doc_id(299))]));
        assert_eq!(progress.walk.as_ref().unwrap().engine, "pagination");
    }

    #[test]
    fn test_page_size_is_clamped() {
        assert_eq!(id_based(5).effective_page_size(), 100);
        assert_eq!(id_based(50_000).effective_page_size(), 10_000);
        assert_eq!(id_based(2000).effective_page_size(), 2000);
    }

    #[tokio::test]
    async fn test_time_windows_visit_every_document() {
        let harness = Harness::new(source_with(180, ChronoDuration::minutes(1)).await);
        let ctx = harness.context("time-windows", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let report = PaginationEngine::new(time_based(2000))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.processed, 180);
        assert_eq!(recorder.ids().len(), 180);
        assert_eq!(recorder.unique_ids().len(), 180);

        let ranges: Vec<_> = harness
            .checkpoints
            .list("time-windows")
            .await
            .into_iter()
            .filter(|c| c.kind() == CheckpointKind::TimeRange)
            .collect();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].status, CheckpointStatus::Completed);

        let range = ranges[0].time_range().unwrap();
        assert_eq!(range.start, base_time());
        assert_eq!(range.current, range.end);
        // 179 minutes of data in 10 minute windows
        assert_eq!(range.processed_windows, 18);
    }

    #[tokio::test]
    async fn test_dense_window_uses_deep_pages() {
        let harness = Harness::new(source_with(250, ChronoDuration::milliseconds(100)).await);
        let ctx = harness.context("time-deep", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let report = PaginationEngine::new(time_based(100))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(recorder.page_sizes(), vec![100, 100, 50]);

        let expected: Vec<String> = (0..250).map(doc_id).collect();
        assert_eq!(recorder.ids(), expected);
    }

    #[tokio::test]
    async fn test_sparse_data_widens_empty_windows() {
        let harness = Harness::new(source_with(2, ChronoDuration::hours(5)).await);
        let ctx = harness.context("time-sparse", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let report = PaginationEngine::new(time_based(2000))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(recorder.ids(), vec![doc_id(0), doc_id(1)]);
    }

    #[tokio::test]
    async fn test_hybrid_without_time_field_pages_by_id() {
        let source = Arc::new(MemoryStore::new("source"));
        source
            .insert_many(
                SOURCE_INDEX,
                (0..150).map(|i| (doc_id(i), json!({ "title": format!("untimed {}", i) }))),
            )
            .await;
        let harness = Harness::new(source);
        let ctx = harness.context("hybrid-id", 1000);
        let recorder = Arc::new(RecordingProcessor::default());

        let config = PaginationConfig {
            page_size: 100,
            ..PaginationConfig::default()
        };
        assert_eq!(config.mode, PaginationMode::Hybrid);

        let report = PaginationEngine::new(config)
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(recorder.unique_ids().len(), 150);
        // Id paging keeps a cursor instead of time-range bookkeeping
        let checkpoints = harness.checkpoints.list("hybrid-id").await;
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].kind(), CheckpointKind::Document);
        assert_eq!(checkpoints[0].status, CheckpointStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_window_is_recorded_for_recovery() {
        let harness = Harness::new(source_with(30, ChronoDuration::minutes(1)).await);
        let ctx = harness.context("time-broken", 1000);
        // Initial attempt plus both retries of the next window fail
        let processor = Arc::new(BreakSourceAfterFirstPage {
            source: harness.source.clone(),
            failures: 3,
            inner: RecordingProcessor::default(),
        });

        let report = PaginationEngine::new(time_based(2000))
            .run(&ctx, processor.clone())
            .await
            .unwrap();

        // First and last windows still make it through
        assert_eq!(report.processed, 20);
        assert_eq!(processor.inner.unique_ids().len(), 20);

        let failed: Vec<_> = harness
            .checkpoints
            .list("time-broken")
            .await
            .into_iter()
            .filter(|c| c.kind() == CheckpointKind::TimeRange && c.status == CheckpointStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);

        let window = failed[0].time_range().unwrap();
        assert_eq!(window.start, base_time() + ChronoDuration::minutes(10));
        assert_eq!(window.end, base_time() + ChronoDuration::minutes(20));

        let plan = harness.checkpoints.create_resume_plan("time-broken").await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].kind, CheckpointKind::TimeRange);
    }

    #[tokio::test]
    async fn test_cancelled_pagination_stops_before_fetching() {
        let harness = Harness::new(source_with(500, ChronoDuration::seconds(1)).await);
        let ctx = harness.context("id-cancel", 1000);
        harness.cancel();

        let recorder = Arc::new(RecordingProcessor::default());
        let report = PaginationEngine::new(id_based(100))
            .run(&ctx, recorder.clone())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.pages, 0);
        assert_eq!(harness.source.search_calls(), 0);
    }
}
