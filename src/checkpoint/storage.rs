use crate::error::{Result, TransferError};
use crate::models::{storage_key, TaskStatus, TransferCheckpoint};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Age after which task checkpoints can no longer be resumed
pub const RESUME_WINDOW_HOURS: i64 = 24;

/// Persistence for coarse, task-level resume records
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Save (insert or replace) a checkpoint
    async fn save(&self, checkpoint: &TransferCheckpoint) -> Result<()>;

    async fn get(&self, task_id: &str, shard_index: Option<u32>) -> Result<Option<TransferCheckpoint>>;

    async fn remove(&self, task_id: &str, shard_index: Option<u32>) -> Result<()>;

    async fn list(&self) -> Result<Vec<TransferCheckpoint>>;

    /// Checkpoints whose task has not completed or been cancelled
    async fn list_unfinished(&self) -> Result<Vec<TransferCheckpoint>> {
        let mut unfinished: Vec<TransferCheckpoint> = self
            .list()
            .await?
            .into_iter()
            .filter(|c| !c.status.is_finished())
            .collect();
        unfinished.sort_by_key(|c| c.created_at);
        Ok(unfinished)
    }

    /// Fold a page's counts into the stored checkpoint
    async fn update_progress(
        &self,
        task_id: &str,
        shard_index: Option<u32>,
        cursor: Option<String>,
        processed: u64,
        success: u64,
        failed: u64,
    ) -> Result<TransferCheckpoint> {
        let mut checkpoint = self
            .get(task_id, shard_index)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("checkpoint {}", storage_key(task_id, shard_index))))?;

        if cursor.is_some() {
            checkpoint.cursor = cursor;
        }
        checkpoint.processed += processed;
        checkpoint.success += success;
        checkpoint.failed += failed;
        checkpoint.status = TaskStatus::Running;
        checkpoint.last_update_time = Utc::now();

        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Resume is allowed for the same indices within the resume window
    async fn can_resume(&self, task_id: &str, source_index: &str, target_index: &str) -> Result<bool> {
        let Some(checkpoint) = self.get(task_id, None).await? else {
            return Ok(false);
        };

        let fresh = Utc::now() - checkpoint.last_update_time < Duration::hours(RESUME_WINDOW_HOURS);
        Ok(fresh
            && checkpoint.source_index == source_index
            && checkpoint.target_index == target_index
            && checkpoint.status != TaskStatus::Completed)
    }

    /// Drop failed or cancelled checkpoints past the resume window; returns the number removed
    async fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(RESUME_WINDOW_HOURS);
        let mut removed = 0;

        for checkpoint in self.list().await? {
            let terminal = matches!(checkpoint.status, TaskStatus::Failed | TaskStatus::Cancelled);
            if terminal && checkpoint.last_update_time < cutoff {
                self.remove(&checkpoint.task_id, checkpoint.shard_index).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} expired task checkpoints", removed);
        }
        Ok(removed)
    }

    /// Check if storage is healthy
    async fn is_healthy(&self) -> bool;
}

/// In-memory checkpoint storage (for testing and single-instance deployments)
#[derive(Default)]
pub struct MemoryCheckpointStorage {
    checkpoints: Arc<RwLock<HashMap<String, TransferCheckpoint>>>,
}

impl MemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStorage {
    async fn save(&self, checkpoint: &TransferCheckpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(checkpoint.storage_key(), checkpoint.clone());
        debug!("Saved checkpoint for task '{}'", checkpoint.task_id);
        Ok(())
    }

    async fn get(&self, task_id: &str, shard_index: Option<u32>) -> Result<Option<TransferCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(&storage_key(task_id, shard_index)).cloned())
    }

    async fn remove(&self, task_id: &str, shard_index: Option<u32>) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(&storage_key(task_id, shard_index));
        debug!("Deleted checkpoint for task '{}'", task_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TransferCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.values().cloned().collect())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// One JSON file per task (or shard) under a directory, with a write-through cache
pub struct FileCheckpointStorage {
    directory: PathBuf,
    cache: RwLock<HashMap<String, TransferCheckpoint>>,
}

impl FileCheckpointStorage {
    /// Open the directory, creating it and loading existing checkpoint files
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;

        let mut cache = HashMap::new();
        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<TransferCheckpoint>(&content) {
                Ok(checkpoint) => {
                    cache.insert(checkpoint.storage_key(), checkpoint);
                }
                Err(e) => warn!("Skipping unreadable checkpoint file {}: {}", path.display(), e),
            }
        }

        info!(
            "Loaded {} task checkpoints from {}",
            cache.len(),
            directory.display()
        );

        Ok(Self {
            directory,
            cache: RwLock::new(cache),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.directory.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStorage {
    async fn save(&self, checkpoint: &TransferCheckpoint) -> Result<()> {
        let key = checkpoint.storage_key();
        let path = self.path_for(&key);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.cache.write().await.insert(key, checkpoint.clone());
        debug!("Saved checkpoint for task '{}' to {}", checkpoint.task_id, path.display());
        Ok(())
    }

    async fn get(&self, task_id: &str, shard_index: Option<u32>) -> Result<Option<TransferCheckpoint>> {
        Ok(self
            .cache
            .read()
            .await
            .get(&storage_key(task_id, shard_index))
            .cloned())
    }

    async fn remove(&self, task_id: &str, shard_index: Option<u32>) -> Result<()> {
        let key = storage_key(task_id, shard_index);
        let path = self.path_for(&key);
        self.cache.write().await.remove(&key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Deleted checkpoint for task '{}'", task_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TransferCheckpoint>> {
        Ok(self.cache.read().await.values().cloned().collect())
    }

    async fn is_healthy(&self) -> bool {
        tokio::fs::metadata(&self.directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}
