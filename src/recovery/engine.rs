use crate::checkpoint::{CheckpointStore, PlanStatus, ResumePlan, ResumeStep, StepStatus};
use crate::config::TransferConfig;
use crate::engine::{page_position, SOURCE_SEARCH_BREAKER, TARGET_BULK_BREAKER};
use crate::error::retry::RetryConfig;
use crate::error::{Result, TransferError};
use crate::models::{Checkpoint, CheckpointKind, CheckpointStatus, Document, FieldStatus};
use crate::pipeline::DocumentTransformer;
use crate::recovery::CircuitBreakerManager;
use crate::store::{search_with_retry, time_value, BulkResponse, DocumentStore, Query, SearchRequest, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on documents replayed per recovery bulk request
pub const MAX_RECOVERY_BATCH: usize = 100;

/// Aggregate outcome of executing one resume plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub plan_id: String,
    pub task_id: String,
    pub status: PlanStatus,
    pub total_checkpoints: usize,
    /// Checkpoints visited
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    /// Documents written back to the target
    pub recovered_documents: u64,
    pub duration_ms: u64,
    pub steps: Vec<String>,
}

impl RecoveryResult {
    fn from_plan(plan: &ResumePlan, recovered_documents: u64, duration_ms: u64) -> Self {
        Self {
            plan_id: plan.plan_id.clone(),
            task_id: plan.task_id.clone(),
            status: plan.status,
            total_checkpoints: plan.total_checkpoints,
            processed: plan.steps.iter().map(|s| s.processed).sum(),
            success: plan.total_success(),
            failed: plan.total_failed(),
            recovered_documents,
            duration_ms,
            steps: plan.steps.iter().map(ResumeStep::summary).collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Completed && self.failed == 0
    }
}

/// Replays the unresolved units of work recorded for a task
pub struct RecoveryEngine {
    source: Arc<dyn DocumentStore>,
    target: Arc<dyn DocumentStore>,
    source_index: String,
    target_index: String,
    transformer: DocumentTransformer,
    checkpoints: Arc<CheckpointStore>,
    breakers: Arc<CircuitBreakerManager>,
    batch_size: usize,
    retry: RetryConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RecoveryEngine {
    pub fn new(
        source: Arc<dyn DocumentStore>,
        target: Arc<dyn DocumentStore>,
        transfer: &TransferConfig,
        checkpoints: Arc<CheckpointStore>,
        breakers: Arc<CircuitBreakerManager>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            target,
            source_index: transfer.source_index.clone(),
            target_index: transfer.target_index.clone(),
            transformer: DocumentTransformer::new(transfer),
            checkpoints,
            breakers,
            batch_size: batch_size.clamp(1, MAX_RECOVERY_BATCH),
            retry: RetryConfig::default(),
            shutdown: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Build a plan from the stored checkpoints of `task_id` and execute it
    pub async fn recover_task(&self, task_id: &str) -> RecoveryResult {
        let mut plan = self.checkpoints.create_resume_plan(task_id).await;
        self.execute_plan(&mut plan).await
    }

    pub async fn execute_plan(&self, plan: &mut ResumePlan) -> RecoveryResult {
        let started = Instant::now();
        let mut recovered = 0u64;
        plan.start();

        info!(
            task_id = %plan.task_id,
            plan_id = %plan.plan_id,
            steps = plan.steps.len(),
            checkpoints = plan.total_checkpoints,
            "Executing resume plan"
        );

        while !plan.is_complete() {
            if self.is_cancelled() {
                warn!(task_id = %plan.task_id, "Recovery cancelled");
                plan.cancel();
                break;
            }

            let Some(step) = plan.current_step_mut() else {
                break;
            };

            if !step.needs_execution() {
                step.skip("nothing to recover");
            } else {
                step.start();
                recovered += self.execute_step(step).await;

                if step.status == StepStatus::Executing {
                    if step.failed == 0 {
                        step.complete();
                    } else {
                        let message = format!(
                            "{} of {} checkpoints still failing",
                            step.failed,
                            step.checkpoints.len()
                        );
                        step.fail(message);
                    }
                }
            }

            let status = match step.status {
                StepStatus::Completed => "completed",
                StepStatus::Skipped => "skipped",
                StepStatus::Cancelled => "cancelled",
                _ => "failed",
            };
            crate::metrics::record_recovery_step(step.kind.as_str(), status);
            info!("{}", step.summary());

            if step.status == StepStatus::Failed && step.critical {
                let message = format!("critical {} recovery step failed", step.kind);
                plan.fail(message);
                break;
            }

            plan.move_to_next_step();
        }

        if plan.status == PlanStatus::Executing {
            plan.complete();
        }

        let result = RecoveryResult::from_plan(plan, recovered, started.elapsed().as_millis() as u64);
        info!(
            task_id = %result.task_id,
            status = ?result.status,
            success = result.success,
            failed = result.failed,
            recovered_documents = result.recovered_documents,
            duration_ms = result.duration_ms,
            "Resume plan finished"
        );
        result
    }

    /// Visit every checkpoint of the step; returns the number of documents written
    async fn execute_step(&self, step: &mut ResumeStep) -> u64 {
        let mut written = 0u64;

        for checkpoint in step.checkpoints.clone() {
            if self.is_cancelled() {
                step.cancel();
                break;
            }

            let outcome = match step.kind {
                CheckpointKind::Document => self.recover_documents(&checkpoint).await,
                CheckpointKind::Field => self.recover_field(&checkpoint).await,
                CheckpointKind::Batch => self.recover_batch(&checkpoint).await,
                CheckpointKind::TimeRange => self.recover_time_range(&checkpoint).await,
                CheckpointKind::Shard => self.recover_shard(&checkpoint).await,
            };

            match outcome {
                Ok(count) => {
                    written += count;
                    step.record_success();
                }
                Err(e) => {
                    step.record_failure();
                    warn!(
                        checkpoint_id = %checkpoint.id,
                        kind = %step.kind,
                        error = %e,
                        "Checkpoint recovery failed"
                    );
                    if let Err(e) = self.checkpoints.increment_retry(&checkpoint.id).await {
                        debug!(error = %e, "Could not count retry");
                    }
                    if let Err(e) = self.checkpoints.fail_checkpoint(&checkpoint.id, &e.to_string()).await {
                        debug!(error = %e, "Could not mark checkpoint failed");
                    }
                }
            }
        }

        written
    }

    /// Transform and bulk-write through the target breaker
    async fn write(&self, mut documents: Vec<Document>) -> Result<BulkResponse> {
        for doc in &mut documents {
            self.transformer.transform(doc);
        }
        self.breakers
            .call(TARGET_BULK_BREAKER, || {
                self.target.bulk_index(&self.target_index, &documents)
            })
            .await
    }

    /// Re-fetch `ids` from the source and write them; returns (written, ids still failing)
    async fn replay_ids(&self, ids: &[String]) -> Result<(u64, BTreeSet<String>)> {
        let mut written = 0u64;
        let mut failing = BTreeSet::new();

        for chunk in ids.chunks(self.batch_size) {
            let documents = self
                .breakers
                .call(SOURCE_SEARCH_BREAKER, || {
                    self.source.get_many(&self.source_index, chunk)
                })
                .await?;

            let found: BTreeSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();
            for id in chunk {
                if !found.contains(id.as_str()) {
                    warn!(doc_id = %id, "Document no longer present in source");
                    failing.insert(id.clone());
                }
            }
            if documents.is_empty() {
                continue;
            }

            let response = self.write(documents).await?;
            written += response.success_count() as u64;
            for item in response.failures() {
                failing.insert(item.id.clone());
            }
        }

        crate::metrics::record_documents(&self.target_index, "recovered", written);
        Ok((written, failing))
    }

    async fn recover_documents(&self, checkpoint: &Checkpoint) -> Result<u64> {
        let progress = checkpoint
            .document()
            .ok_or_else(|| TransferError::Checkpoint(format!("{} is not a document checkpoint", checkpoint.id)))?;

        if progress.walk.is_some() {
            return self.continue_walk(&checkpoint.id).await;
        }

        // Re-read: an earlier step in this run may already have resolved some ids
        let current = self
            .checkpoints
            .get(&checkpoint.id)
            .await
            .and_then(|c| c.document().map(|d| d.failed_ids.clone()))
            .unwrap_or_else(|| progress.failed_ids.clone());

        if current.is_empty() {
            self.checkpoints
                .set_status(&checkpoint.id, CheckpointStatus::Completed)
                .await?;
            return Ok(0);
        }

        self.checkpoints
            .set_status(&checkpoint.id, CheckpointStatus::Processing)
            .await?;

        let ids: Vec<String> = current.into_iter().collect();
        let (written, failing) = self.replay_ids(&ids).await?;

        let remaining = failing.clone();
        self.checkpoints
            .update(&checkpoint.id, move |c| {
                if let Some(doc) = c.document_mut() {
                    doc.failed_ids = remaining;
                    doc.processed_count += written;
                }
                Ok(())
            })
            .await?;

        if failing.is_empty() {
            self.checkpoints
                .set_status(&checkpoint.id, CheckpointStatus::Completed)
                .await?;
            debug!(checkpoint_id = %checkpoint.id, written, "Document checkpoint recovered");
            Ok(written)
        } else {
            Err(TransferError::BulkWrite(format!(
                "{} of {} documents still failing",
                failing.len(),
                ids.len()
            )))
        }
    }

    /// Continue an interrupted id-ordered walk from its stored cursor.
    ///
    /// The cursor advances after every written page, so a failure here leaves the checkpoint
    /// ready for the next attempt. Cancellation suspends it.
    async fn continue_walk(&self, checkpoint_id: &str) -> Result<u64> {
        let checkpoint = self
            .checkpoints
            .get(checkpoint_id)
            .await
            .ok_or_else(|| TransferError::NotFound(format!("checkpoint {}", checkpoint_id)))?;
        let Some(progress) = checkpoint.document() else {
            return Err(TransferError::Checkpoint(format!("{} is not a document checkpoint", checkpoint_id)));
        };
        let Some(walk) = progress.walk.clone() else {
            return Err(TransferError::Checkpoint(format!("{} is not a cursor checkpoint", checkpoint_id)));
        };
        if checkpoint.status == CheckpointStatus::Completed {
            return Ok(0);
        }

        info!(
            checkpoint_id,
            engine = %walk.engine,
            last_id = ?progress.last_processed_id,
            processed = progress.processed_count,
            "Continuing interrupted walk"
        );
        self.checkpoints
            .set_status(checkpoint_id, CheckpointStatus::Processing)
            .await?;

        let base = SearchRequest::new(walk.query, self.batch_size).sort_asc(ID_FIELD);
        let mut after = progress.resume_after();
        let mut written = 0u64;

        loop {
            if self.is_cancelled() {
                self.checkpoints
                    .set_status(checkpoint_id, CheckpointStatus::Suspended)
                    .await?;
                return Ok(written);
            }

            let request = match &after {
                Some(values) => base.clone().after(values.clone()),
                None => base.clone(),
            };
            let outcome = self
                .breakers
                .call(SOURCE_SEARCH_BREAKER, || {
                    search_with_retry(self.source.as_ref(), &self.source_index, &request, &self.retry)
                })
                .await?;

            let effective = outcome.page_size;
            let hits = outcome.page.hits;
            if hits.is_empty() {
                break;
            }
            let len = hits.len();
            let position = page_position(&hits);

            let response = self.write(hits).await?;
            written += response.success_count() as u64;
            for item in response.failures() {
                let error = item.error.as_deref().unwrap_or("unknown bulk error");
                self.checkpoints
                    .record_failed_document(&checkpoint.task_id, &item.id, None, error)
                    .await;
            }

            if let Some((last_id, values)) = position {
                self.checkpoints
                    .update_document_progress(
                        checkpoint_id,
                        Some(last_id),
                        serde_json::to_string(&values).ok(),
                        len as u64,
                    )
                    .await?;
                after = Some(values);
            }

            if len < effective {
                break;
            }
        }

        self.checkpoints
            .set_status(checkpoint_id, CheckpointStatus::Completed)
            .await?;
        crate::metrics::record_documents(&self.target_index, "recovered", written);
        info!(checkpoint_id, written, "Walk completed");
        Ok(written)
    }

    /// Finish a failed shard by continuing the walk over its slice
    async fn recover_shard(&self, checkpoint: &Checkpoint) -> Result<u64> {
        let shard = checkpoint
            .shard()
            .ok_or_else(|| TransferError::Checkpoint(format!("{} is not a shard checkpoint", checkpoint.id)))?;

        let existing = self
            .checkpoints
            .cursor_checkpoints(&checkpoint.task_id)
            .await
            .into_iter()
            .rev()
            .find(|c| {
                c.document()
                    .and_then(|d| d.walk.as_ref())
                    .is_some_and(|walk| walk.query == shard.query)
            });
        let cursor_id = match existing {
            Some(cursor) => cursor.id,
            None => {
                self.checkpoints
                    .create_cursor_checkpoint(&checkpoint.task_id, "shard", shard.query.clone())
                    .await
                    .id
            }
        };

        let written = self.continue_walk(&cursor_id).await?;
        self.checkpoints
            .update_shard_progress(&checkpoint.id, shard.end_offset)
            .await?;
        debug!(checkpoint_id = %checkpoint.id, shard = shard.shard_index, written, "Shard recovered");
        Ok(written)
    }

    async fn recover_field(&self, checkpoint: &Checkpoint) -> Result<u64> {
        let field = checkpoint
            .field()
            .ok_or_else(|| TransferError::Checkpoint(format!("{} is not a field checkpoint", checkpoint.id)))?;

        let source_doc = self
            .breakers
            .call(SOURCE_SEARCH_BREAKER, || {
                self.source.get(&self.source_index, &field.document_id)
            })
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("source document {}", field.document_id)))?;

        let value = source_doc
            .get(&field.field_name)
            .cloned()
            .unwrap_or_else(|| field.original_value.clone());

        let Some((target_field, corrected)) = self.transformer.transform_field(&field.field_name, &value) else {
            // The field is not carried to the target at all
            self.checkpoints
                .update_field_checkpoint(&checkpoint.id, None, FieldStatus::Indexed)
                .await?;
            return Ok(0);
        };

        self.checkpoints
            .update_field_checkpoint(&checkpoint.id, Some(corrected.clone()), FieldStatus::Indexing)
            .await?;

        let existing = self
            .breakers
            .call(TARGET_BULK_BREAKER, || {
                self.target.get(&self.target_index, &field.document_id)
            })
            .await?;
        let mut body = match existing {
            Some(body) => body,
            None => self.transformer.transform_body(&source_doc),
        };
        body.insert(target_field, corrected);

        let documents = vec![Document::new(field.document_id.clone(), body)];
        let response = self
            .breakers
            .call(TARGET_BULK_BREAKER, || {
                self.target.bulk_index(&self.target_index, &documents)
            })
            .await?;

        if let Some(item) = response.failures().next() {
            let error = item.error.clone().unwrap_or_else(|| "unknown bulk error".to_string());
            self.checkpoints
                .update_field_checkpoint(&checkpoint.id, None, FieldStatus::Failed)
                .await?;
            return Err(TransferError::BulkWrite(error));
        }

        self.checkpoints
            .update_field_checkpoint(&checkpoint.id, None, FieldStatus::Indexed)
            .await?;
        Ok(1)
    }

    async fn recover_batch(&self, checkpoint: &Checkpoint) -> Result<u64> {
        let batch = checkpoint
            .batch()
            .ok_or_else(|| TransferError::Checkpoint(format!("{} is not a batch checkpoint", checkpoint.id)))?;

        self.checkpoints
            .set_status(&checkpoint.id, CheckpointStatus::Processing)
            .await?;

        let (written, failing) = self.replay_ids(&batch.document_ids).await?;

        // Failed members become individually retryable
        for id in &failing {
            self.checkpoints
                .record_failed_document(&checkpoint.task_id, id, None, "failed during batch recovery")
                .await;
        }

        self.checkpoints
            .update_batch_progress(&checkpoint.id, batch.size, written as usize, failing.len())
            .await?;

        info!(
            checkpoint_id = %checkpoint.id,
            batch_number = batch.batch_number,
            written,
            failed = failing.len(),
            "Batch replayed"
        );
        Ok(written)
    }

    async fn recover_time_range(&self, checkpoint: &Checkpoint) -> Result<u64> {
        let range = checkpoint
            .time_range()
            .ok_or_else(|| TransferError::Checkpoint(format!("{} is not a time-range checkpoint", checkpoint.id)))?;

        if !range.is_valid() {
            self.checkpoints
                .set_status(&checkpoint.id, CheckpointStatus::Completed)
                .await?;
            return Ok(0);
        }

        let query = Query::between(
            range.time_field.clone(),
            time_value(range.current),
            time_value(range.end),
        );
        let base = SearchRequest::new(query, self.batch_size)
            .sort_asc(range.time_field.clone())
            .sort_asc(ID_FIELD);

        let mut after: Option<Vec<Value>> = None;
        let mut written = 0u64;

        loop {
            let request = match &after {
                Some(values) => base.clone().after(values.clone()),
                None => base.clone(),
            };
            let outcome = self
                .breakers
                .call(SOURCE_SEARCH_BREAKER, || {
                    search_with_retry(self.source.as_ref(), &self.source_index, &request, &self.retry)
                })
                .await?;

            let effective = outcome.page_size;
            let hits = outcome.page.hits;
            if hits.is_empty() {
                break;
            }
            let len = hits.len();
            after = hits.last().map(|d| d.sort.clone());

            let response = self.write(hits).await?;
            written += response.success_count() as u64;
            for item in response.failures() {
                let error = item.error.as_deref().unwrap_or("unknown bulk error");
                self.checkpoints
                    .record_failed_document(&checkpoint.task_id, &item.id, None, error)
                    .await;
            }

            if len < effective {
                break;
            }
        }

        self.checkpoints
            .update_time_range_progress(&checkpoint.id, range.end, 1)
            .await?;
        crate::metrics::record_documents(&self.target_index, "recovered", written);
        Ok(written)
    }
}
