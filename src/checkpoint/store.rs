use super::plan::{step_priority, ResumePlan, ResumeStep};
use crate::config::CheckpointConfig;
use crate::error::{Result, TransferError};
use crate::models::{
    BatchProgress, Checkpoint, CheckpointKind, CheckpointPayload, CheckpointStatus, CursorWalk,
    DocumentProgress, FieldProgress, FieldStatus, ShardProgress, TimeRangeProgress,
};
use crate::store::Query;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Per-task counts by status and kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStatistics {
    pub task_id: String,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub suspended: usize,
    pub by_kind: BTreeMap<CheckpointKind, usize>,
}

impl CheckpointStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    pub fn count(&self, kind: CheckpointKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Fine-grained checkpoints keyed by task.
///
/// Every operation takes the map lock once, so appends, evictions and updates are atomic
/// with respect to each other and callers need no external locking.
pub struct CheckpointStore {
    max_per_task: usize,
    max_retries: u32,
    expiry: Duration,
    time_window_minutes: i64,
    checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
    sequence: AtomicU64,
}

impl CheckpointStore {
    pub fn new(config: &CheckpointConfig) -> Self {
        Self {
            max_per_task: config.max_per_task.max(1),
            max_retries: config.max_retries,
            expiry: Duration::hours(config.expiry_hours as i64),
            time_window_minutes: config.time_window_minutes,
            checkpoints: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn new_checkpoint(&self, task_id: &str, payload: CheckpointPayload) -> Checkpoint {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = format!("checkpoint_{}_{}", Utc::now().timestamp_millis(), sequence);
        Checkpoint::new(id, task_id.to_string(), sequence, payload, self.max_retries)
    }

    async fn insert(&self, checkpoint: Checkpoint) -> Checkpoint {
        let kind = checkpoint.kind();
        let mut all = self.checkpoints.write().await;
        let list = all.entry(checkpoint.task_id.clone()).or_default();
        list.push(checkpoint.clone());

        if list.len() > self.max_per_task {
            let evicted = self.evict(list);
            debug!(
                task_id = %checkpoint.task_id,
                evicted,
                kept = list.len(),
                "Evicted oldest checkpoints over the per-task cap"
            );
        }

        crate::metrics::record_checkpoint_operation(kind.as_str(), "create");
        checkpoint
    }

    /// Trim `list` to the cap: completed first, then expired, then oldest overall
    fn evict(&self, list: &mut Vec<Checkpoint>) -> usize {
        let mut excess = list.len().saturating_sub(self.max_per_task);
        let before = list.len();
        list.sort_by_key(|c| c.sequence);

        for pass in 0..3 {
            if excess == 0 {
                break;
            }
            let expiry = self.expiry;
            list.retain(|c| {
                if excess == 0 {
                    return true;
                }
                let evictable = match pass {
                    0 => c.status == CheckpointStatus::Completed,
                    1 => c.is_expired(expiry),
                    _ => true,
                };
                if evictable {
                    if pass == 2 {
                        warn!(checkpoint_id = %c.id, status = ?c.status, "Evicting unresolved checkpoint over the per-task cap");
                    }
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }

        before - list.len()
    }

    /// Apply `update` to one checkpoint and bump its update time
    pub async fn update<F>(&self, checkpoint_id: &str, update: F) -> Result<Checkpoint>
    where
        F: FnOnce(&mut Checkpoint) -> Result<()>,
    {
        let mut all = self.checkpoints.write().await;
        let checkpoint = all
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|c| c.id == checkpoint_id)
            .ok_or_else(|| TransferError::NotFound(format!("checkpoint {}", checkpoint_id)))?;

        update(checkpoint)?;
        checkpoint.touch();
        crate::metrics::record_checkpoint_operation(checkpoint.kind().as_str(), "update");
        Ok(checkpoint.clone())
    }

    pub async fn create_document_checkpoint(
        &self,
        task_id: &str,
        last_processed_id: Option<String>,
        last_cursor: Option<String>,
    ) -> Checkpoint {
        let payload = CheckpointPayload::Document(DocumentProgress {
            last_processed_id,
            last_cursor,
            ..Default::default()
        });
        let checkpoint = self.insert(self.new_checkpoint(task_id, payload)).await;
        debug!(task_id, checkpoint_id = %checkpoint.id, "Created document checkpoint");
        checkpoint
    }

    /// Document checkpoint in `processing` that follows an engine's walk over `query`.
    ///
    /// Engines advance it with [`update_document_progress`](Self::update_document_progress),
    /// storing the serialized search-after values of the last page as the cursor.
    pub async fn create_cursor_checkpoint(&self, task_id: &str, engine: &str, query: Query) -> Checkpoint {
        let payload = CheckpointPayload::Document(DocumentProgress {
            walk: Some(CursorWalk {
                engine: engine.to_string(),
                query,
            }),
            ..Default::default()
        });
        let mut checkpoint = self.new_checkpoint(task_id, payload);
        checkpoint.status = CheckpointStatus::Processing;
        let checkpoint = self.insert(checkpoint).await;
        debug!(task_id, engine, checkpoint_id = %checkpoint.id, "Created cursor checkpoint");
        checkpoint
    }

    pub async fn create_field_checkpoint(
        &self,
        task_id: &str,
        document_id: &str,
        field_name: &str,
        original_value: Value,
    ) -> Checkpoint {
        let payload = CheckpointPayload::Field(FieldProgress {
            document_id: document_id.to_string(),
            field_name: field_name.to_string(),
            original_value,
            transformed_value: None,
            status: FieldStatus::Pending,
            error_message: None,
        });
        let checkpoint = self.insert(self.new_checkpoint(task_id, payload)).await;
        debug!(task_id, document_id, field = field_name, "Created field checkpoint");
        checkpoint
    }

    /// Batch checkpoint in `processing`; its size is the member count
    pub async fn create_batch_checkpoint(
        &self,
        task_id: &str,
        batch_number: u64,
        document_ids: Vec<String>,
    ) -> Checkpoint {
        let size = document_ids.len();
        let payload = CheckpointPayload::Batch(BatchProgress {
            batch_number,
            document_ids,
            size,
            ..Default::default()
        });
        let mut checkpoint = self.new_checkpoint(task_id, payload);
        checkpoint.status = CheckpointStatus::Processing;
        let checkpoint = self.insert(checkpoint).await;
        debug!(task_id, batch_number, size, "Created batch checkpoint");
        checkpoint
    }

    pub async fn create_shard_checkpoint(
        &self,
        task_id: &str,
        shard_index: u32,
        start_offset: u64,
        end_offset: u64,
        query: Query,
    ) -> Checkpoint {
        let payload = CheckpointPayload::Shard(ShardProgress {
            shard_index,
            start_offset,
            end_offset,
            current_offset: start_offset,
            query,
        });
        self.insert(self.new_checkpoint(task_id, payload)).await
    }

    pub async fn create_time_range_checkpoint(
        &self,
        task_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        time_field: &str,
    ) -> Checkpoint {
        let payload = CheckpointPayload::TimeRange(TimeRangeProgress {
            start,
            end,
            current: start,
            window_minutes: self.time_window_minutes,
            time_field: time_field.to_string(),
            processed_windows: 0,
        });
        let checkpoint = self.insert(self.new_checkpoint(task_id, payload)).await;
        debug!(task_id, %start, %end, "Created time-range checkpoint");
        checkpoint
    }

    pub async fn update_document_progress(
        &self,
        checkpoint_id: &str,
        last_processed_id: Option<String>,
        last_cursor: Option<String>,
        processed: u64,
    ) -> Result<Checkpoint> {
        self.update(checkpoint_id, |c| {
            let progress = c.document_mut().ok_or_else(|| wrong_kind(checkpoint_id, "document"))?;
            if last_processed_id.is_some() {
                progress.last_processed_id = last_processed_id;
            }
            if last_cursor.is_some() {
                progress.last_cursor = last_cursor;
            }
            progress.processed_count += processed;
            c.status = CheckpointStatus::Processing;
            Ok(())
        })
        .await
    }

    /// Record a field's transformed value; `indexed` completes and `failed` fails the checkpoint
    pub async fn update_field_checkpoint(
        &self,
        checkpoint_id: &str,
        transformed_value: Option<Value>,
        status: FieldStatus,
    ) -> Result<Checkpoint> {
        self.update(checkpoint_id, |c| {
            let field = c.field_mut().ok_or_else(|| wrong_kind(checkpoint_id, "field"))?;
            if transformed_value.is_some() {
                field.transformed_value = transformed_value;
            }
            field.status = status;
            c.status = match status {
                FieldStatus::Indexed => CheckpointStatus::Completed,
                FieldStatus::Failed => CheckpointStatus::Failed,
                FieldStatus::Pending => CheckpointStatus::Pending,
                _ => CheckpointStatus::Processing,
            };
            Ok(())
        })
        .await
    }

    /// Replace the batch counts; reaching the declared size completes the batch
    pub async fn update_batch_progress(
        &self,
        checkpoint_id: &str,
        processed: usize,
        success: usize,
        failed: usize,
    ) -> Result<Checkpoint> {
        let checkpoint = self
            .update(checkpoint_id, |c| {
                let batch = c.batch_mut().ok_or_else(|| wrong_kind(checkpoint_id, "batch"))?;
                batch.processed = processed;
                batch.success = success;
                batch.failed = failed;
                if processed >= batch.size {
                    c.status = CheckpointStatus::Completed;
                }
                Ok(())
            })
            .await?;
        debug!(checkpoint_id, processed, success, failed, "Updated batch progress");
        Ok(checkpoint)
    }

    pub async fn update_shard_progress(&self, checkpoint_id: &str, current_offset: u64) -> Result<Checkpoint> {
        self.update(checkpoint_id, |c| {
            let shard = c.shard_mut().ok_or_else(|| wrong_kind(checkpoint_id, "shard"))?;
            shard.current_offset = current_offset.min(shard.end_offset);
            c.status = if shard.current_offset >= shard.end_offset {
                CheckpointStatus::Completed
            } else {
                CheckpointStatus::Processing
            };
            Ok(())
        })
        .await
    }

    /// Move the cursor time forward; reaching the end completes the range
    pub async fn update_time_range_progress(
        &self,
        checkpoint_id: &str,
        current: DateTime<Utc>,
        windows: u64,
    ) -> Result<Checkpoint> {
        self.update(checkpoint_id, |c| {
            let range = c.time_range_mut().ok_or_else(|| wrong_kind(checkpoint_id, "time_range"))?;
            if current > range.current {
                range.current = current.min(range.end);
            }
            range.processed_windows += windows;
            c.status = if range.is_valid() {
                CheckpointStatus::Processing
            } else {
                CheckpointStatus::Completed
            };
            Ok(())
        })
        .await
    }

    pub async fn set_status(&self, checkpoint_id: &str, status: CheckpointStatus) -> Result<Checkpoint> {
        self.update(checkpoint_id, |c| {
            c.status = status;
            Ok(())
        })
        .await
    }

    pub async fn fail_checkpoint(&self, checkpoint_id: &str, message: &str) -> Result<Checkpoint> {
        let checkpoint = self
            .update(checkpoint_id, |c| {
                c.fail(message);
                Ok(())
            })
            .await?;
        crate::metrics::record_checkpoint_operation(checkpoint.kind().as_str(), "fail");
        Ok(checkpoint)
    }

    pub async fn increment_retry(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.update(checkpoint_id, |c| {
            c.increment_retry();
            Ok(())
        })
        .await
    }

    /// New failed document checkpoint owning a single document id
    pub async fn record_failed_document(
        &self,
        task_id: &str,
        document_id: &str,
        cursor: Option<String>,
        error: &str,
    ) -> Checkpoint {
        let mut failed_ids = BTreeSet::new();
        failed_ids.insert(document_id.to_string());
        let payload = CheckpointPayload::Document(DocumentProgress {
            last_processed_id: Some(document_id.to_string()),
            last_cursor: cursor,
            failed_ids,
            ..Default::default()
        });

        let mut checkpoint = self.new_checkpoint(task_id, payload);
        checkpoint.fail(error);
        crate::metrics::record_checkpoint_operation(CheckpointKind::Document.as_str(), "fail");
        self.insert(checkpoint).await
    }

    /// Add `document_id` to the task's first failed-document checkpoint, creating one when absent
    pub async fn mark_document_failed(&self, task_id: &str, document_id: &str, error: &str) -> Checkpoint {
        {
            let mut all = self.checkpoints.write().await;
            if let Some(checkpoint) = all.get_mut(task_id).and_then(|list| {
                list.iter_mut()
                    .find(|c| c.document().is_some_and(|d| d.walk.is_none()))
            }) {
                if let Some(progress) = checkpoint.document_mut() {
                    progress.failed_ids.insert(document_id.to_string());
                }
                checkpoint.fail(error);
                warn!(task_id, document_id, error, "Marked document failed");
                return checkpoint.clone();
            }
        }

        warn!(task_id, document_id, error, "Marked document failed");
        self.record_failed_document(task_id, document_id, None, error).await
    }

    /// Union of failed ids across the task's document checkpoints
    pub async fn get_failed_documents(&self, task_id: &str) -> BTreeSet<String> {
        let all = self.checkpoints.read().await;
        all.get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|c| c.document())
            .flat_map(|d| d.failed_ids.iter().cloned())
            .collect()
    }

    /// Failed or suspended, retries left, not expired; in creation order
    pub async fn get_recoverable_checkpoints(&self, task_id: &str) -> Vec<Checkpoint> {
        let all = self.checkpoints.read().await;
        let mut recoverable: Vec<Checkpoint> = all
            .get(task_id)
            .into_iter()
            .flatten()
            .filter(|c| c.status.is_recoverable() && c.can_retry() && !c.is_expired(self.expiry))
            .cloned()
            .collect();
        recoverable.sort_by_key(|c| (c.created_at, c.sequence));
        recoverable
    }

    /// Group recoverable checkpoints into priority-ordered steps
    pub async fn create_resume_plan(&self, task_id: &str) -> ResumePlan {
        let recoverable = self.get_recoverable_checkpoints(task_id).await;

        let mut grouped: BTreeMap<CheckpointKind, Vec<Checkpoint>> = BTreeMap::new();
        for checkpoint in recoverable {
            grouped.entry(checkpoint.kind()).or_default().push(checkpoint);
        }

        let steps: Vec<ResumeStep> = grouped
            .into_iter()
            .filter_map(|(kind, checkpoints)| {
                step_priority(kind).map(|priority| ResumeStep::new(kind, priority, checkpoints))
            })
            .collect();

        let plan = ResumePlan::new(task_id, steps);
        info!(
            task_id,
            checkpoints = plan.total_checkpoints,
            steps = plan.steps.len(),
            "Created resume plan"
        );
        plan
    }

    /// Cursor checkpoints of the task, in creation order
    pub async fn cursor_checkpoints(&self, task_id: &str) -> Vec<Checkpoint> {
        let all = self.checkpoints.read().await;
        let mut cursors: Vec<Checkpoint> = all
            .get(task_id)
            .into_iter()
            .flatten()
            .filter(|c| c.document().is_some_and(|d| d.walk.is_some()))
            .cloned()
            .collect();
        cursors.sort_by_key(|c| c.sequence);
        cursors
    }

    pub async fn get(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        let all = self.checkpoints.read().await;
        all.values()
            .flatten()
            .find(|c| c.id == checkpoint_id)
            .cloned()
    }

    pub async fn list(&self, task_id: &str) -> Vec<Checkpoint> {
        self.checkpoints
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn statistics(&self, task_id: &str) -> CheckpointStatistics {
        let all = self.checkpoints.read().await;
        let mut stats = CheckpointStatistics {
            task_id: task_id.to_string(),
            ..Default::default()
        };

        for checkpoint in all.get(task_id).into_iter().flatten() {
            stats.total += 1;
            match checkpoint.status {
                CheckpointStatus::Pending => stats.pending += 1,
                CheckpointStatus::Processing => stats.processing += 1,
                CheckpointStatus::Completed => stats.completed += 1,
                CheckpointStatus::Failed => stats.failed += 1,
                CheckpointStatus::Suspended => stats.suspended += 1,
            }
            *stats.by_kind.entry(checkpoint.kind()).or_default() += 1;
        }
        stats
    }

    /// Drop checkpoints not updated within the expiry window; returns the number removed
    pub async fn cleanup_expired(&self) -> usize {
        let mut all = self.checkpoints.write().await;
        let mut removed = 0;

        for (task_id, list) in all.iter_mut() {
            let before = list.len();
            list.retain(|c| !c.is_expired(self.expiry));
            let cleaned = before - list.len();
            if cleaned > 0 {
                debug!(task_id = %task_id, cleaned, "Removed expired checkpoints");
            }
            removed += cleaned;
        }
        all.retain(|_, list| !list.is_empty());

        if removed > 0 {
            info!("Removed {} expired checkpoints", removed);
        }
        removed
    }

    /// Park pending and processing checkpoints so a later resume picks them up
    pub async fn suspend_task(&self, task_id: &str) -> usize {
        let mut all = self.checkpoints.write().await;
        let mut suspended = 0;

        for checkpoint in all.get_mut(task_id).into_iter().flatten() {
            if matches!(checkpoint.status, CheckpointStatus::Pending | CheckpointStatus::Processing) {
                checkpoint.set_status(CheckpointStatus::Suspended);
                suspended += 1;
            }
        }

        if suspended > 0 {
            info!(task_id, suspended, "Suspended in-flight checkpoints");
        }
        suspended
    }

    pub async fn remove_task(&self, task_id: &str) -> usize {
        self.checkpoints
            .write()
            .await
            .remove(task_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

fn wrong_kind(checkpoint_id: &str, expected: &str) -> TransferError {
    TransferError::Checkpoint(format!(
        "checkpoint {} is not a {} checkpoint",
        checkpoint_id, expected
    ))
}
