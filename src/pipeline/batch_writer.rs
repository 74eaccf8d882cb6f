use crate::checkpoint::{CheckpointStorage, CheckpointStore};
use crate::engine::{PageProcessor, PageResult, TARGET_BULK_BREAKER};
use crate::error::Result;
use crate::models::{Document, FieldStatus, ProgressPhase, ProgressUpdate};
use crate::pipeline::{AdaptiveThrottleController, DocumentTransformer};
use crate::recovery::CircuitBreakerManager;
use crate::store::DocumentStore;
use crate::sync::ProgressSink;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Totals {
    processed: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
}

/// Standard page path: permit, transform, bulk write, record the outcome
pub struct BatchWriter {
    task_id: String,
    target: Arc<dyn DocumentStore>,
    target_index: String,
    transformer: DocumentTransformer,
    tracked_fields: Vec<String>,
    throttle: Arc<AdaptiveThrottleController>,
    breakers: Arc<CircuitBreakerManager>,
    checkpoints: Arc<CheckpointStore>,
    storage: Option<Arc<dyn CheckpointStorage>>,
    progress: Option<Arc<dyn ProgressSink>>,
    dry_run: bool,
    totals: Totals,
}

impl BatchWriter {
    pub fn new(
        task_id: impl Into<String>,
        target: Arc<dyn DocumentStore>,
        target_index: impl Into<String>,
        transformer: DocumentTransformer,
        throttle: Arc<AdaptiveThrottleController>,
        breakers: Arc<CircuitBreakerManager>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            target,
            target_index: target_index.into(),
            tracked_fields: transformer.tracked_fields(),
            transformer,
            throttle,
            breakers,
            checkpoints,
            storage: None,
            progress: None,
            dry_run: false,
            totals: Totals::default(),
        }
    }

    /// Keep the task-level checkpoint in `storage` up to date after each page
    pub fn with_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Transform and checkpoint pages without writing to the target
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Cumulative (processed, success, failed)
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.totals.processed.load(Ordering::SeqCst),
            self.totals.success.load(Ordering::SeqCst),
            self.totals.failed.load(Ordering::SeqCst),
        )
    }

    async fn record(&self, cursor: Option<String>, processed: u64, success: u64, failed: u64) {
        self.totals.processed.fetch_add(processed, Ordering::SeqCst);
        self.totals.success.fetch_add(success, Ordering::SeqCst);
        self.totals.failed.fetch_add(failed, Ordering::SeqCst);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage
                .update_progress(&self.task_id, None, cursor, processed, success, failed)
                .await
            {
                warn!(task_id = %self.task_id, error = %e, "Failed to update task checkpoint");
            }
        }

        if let Some(sink) = &self.progress {
            let (processed, success, failed) = self.totals();
            sink.report(ProgressUpdate {
                task_id: self.task_id.clone(),
                processed,
                success,
                failed,
                phase: ProgressPhase::Transferring,
            });
        }
    }

    /// Pending field checkpoints for every tracked field present in the page
    async fn track_fields(&self, documents: &[Document]) -> Vec<(String, String, Option<Value>)> {
        let mut tracked = Vec::new();
        if self.tracked_fields.is_empty() {
            return tracked;
        }
        for doc in documents {
            for field in &self.tracked_fields {
                let Some(original) = doc.source.get(field) else {
                    continue;
                };
                let checkpoint = self
                    .checkpoints
                    .create_field_checkpoint(&self.task_id, &doc.id, field, original.clone())
                    .await;
                let transformed = self
                    .transformer
                    .transform_field(field, original)
                    .map(|(_, value)| value);
                tracked.push((checkpoint.id, doc.id.clone(), transformed));
            }
        }
        tracked
    }

    /// Index the tracked fields of written documents, fail those of rejected ones
    async fn settle_fields(
        &self,
        tracked: Vec<(String, String, Option<Value>)>,
        rejected: &HashMap<String, String>,
    ) {
        for (checkpoint_id, document_id, transformed) in tracked {
            let settled = match rejected.get(&document_id) {
                Some(error) => {
                    match self
                        .checkpoints
                        .update_field_checkpoint(&checkpoint_id, transformed, FieldStatus::Failed)
                        .await
                    {
                        Ok(_) => self.checkpoints.fail_checkpoint(&checkpoint_id, error).await,
                        Err(e) => Err(e),
                    }
                }
                None => {
                    self.checkpoints
                        .update_field_checkpoint(&checkpoint_id, transformed, FieldStatus::Indexed)
                        .await
                }
            };
            if let Err(e) = settled {
                warn!(task_id = %self.task_id, checkpoint_id = %checkpoint_id, error = %e, "Failed to settle field checkpoint");
            }
        }
    }

    async fn write_page(
        &self,
        mut documents: Vec<Document>,
        page_number: u64,
        page_key: Option<String>,
    ) -> Result<PageResult> {
        let total = documents.len();
        let ids = documents.iter().map(|d| d.id.clone()).collect();
        let batch = self
            .checkpoints
            .create_batch_checkpoint(&self.task_id, page_number, ids)
            .await;

        for doc in &mut documents {
            self.transformer.transform(doc);
        }

        if self.dry_run {
            self.checkpoints
                .update_batch_progress(&batch.id, total, total, 0)
                .await?;
            self.record(page_key, total as u64, total as u64, 0).await;
            return Ok(PageResult {
                success: total as u64,
                failed: 0,
            });
        }

        let tracked = self.track_fields(&documents).await;
        let started = Instant::now();
        let response = match self
            .breakers
            .call(TARGET_BULK_BREAKER, || {
                self.target.bulk_index(&self.target_index, &documents)
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    task_id = %self.task_id,
                    page = page_number,
                    docs = total,
                    error = %e,
                    "Bulk write failed, batch left for recovery"
                );
                self.checkpoints.fail_checkpoint(&batch.id, &e.to_string()).await?;
                let rejected: HashMap<String, String> =
                    documents.iter().map(|d| (d.id.clone(), e.to_string())).collect();
                self.settle_fields(tracked, &rejected).await;
                crate::metrics::record_documents(&self.target_index, "failed", total as u64);
                self.record(page_key, total as u64, 0, total as u64).await;
                return Err(e);
            }
        };

        let mut rejected = HashMap::new();
        for item in response.failures() {
            let error = item.error.as_deref().unwrap_or("unknown bulk error");
            self.checkpoints
                .record_failed_document(&self.task_id, &item.id, page_key.clone(), error)
                .await;
            rejected.insert(item.id.clone(), error.to_string());
        }
        let failed = rejected.len();
        let success = response.success_count();
        self.settle_fields(tracked, &rejected).await;

        self.checkpoints
            .update_batch_progress(&batch.id, total, success, failed)
            .await?;

        crate::metrics::record_documents(&self.target_index, "success", success as u64);
        if failed > 0 {
            crate::metrics::record_documents(&self.target_index, "failed", failed as u64);
            warn!(
                task_id = %self.task_id,
                page = page_number,
                failed,
                "Bulk write reported item failures"
            );
        }
        debug!(
            task_id = %self.task_id,
            page = page_number,
            success,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Page written"
        );

        self.record(page_key, total as u64, success as u64, failed as u64).await;

        Ok(PageResult {
            success: success as u64,
            failed: failed as u64,
        })
    }
}

#[async_trait]
impl PageProcessor for BatchWriter {
    async fn process_page(
        &self,
        documents: Vec<Document>,
        page_number: u64,
        page_key: Option<String>,
    ) -> Result<PageResult> {
        if documents.is_empty() {
            return Ok(PageResult::default());
        }

        let mut permit = self.throttle.acquire_permit().await?;
        let result = self.write_page(documents, page_number, page_key).await;
        if let Ok(page) = &result {
            permit.update_processed_docs(page.success + page.failed);
        }
        self.throttle.release_permit(permit).await;
        result
    }
}
