use crate::config::TransferStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::CompletedWithFailures => "completed_with_failures",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Coarse, task-level resume record persisted by `CheckpointStorage`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCheckpoint {
    pub task_id: String,
    #[serde(default)]
    pub shard_index: Option<u32>,
    pub source_index: String,
    pub target_index: String,
    /// Last scroll id or search-after token
    #[serde(default)]
    pub cursor: Option<String>,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub total: u64,
    pub batch_size: usize,
    #[serde(default)]
    pub strategy: Option<TransferStrategy>,
    pub status: TaskStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl TransferCheckpoint {
    pub fn new(
        task_id: impl Into<String>,
        source_index: impl Into<String>,
        target_index: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            shard_index: None,
            source_index: source_index.into(),
            target_index: target_index.into(),
            cursor: None,
            processed: 0,
            success: 0,
            failed: 0,
            total: 0,
            batch_size: 0,
            strategy: None,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: now,
            last_update_time: now,
        }
    }

    pub fn for_shard(mut self, shard_index: u32) -> Self {
        self.shard_index = Some(shard_index);
        self
    }

    pub fn storage_key(&self) -> String {
        storage_key(&self.task_id, self.shard_index)
    }
}

/// Key under which a task (or one of its shards) is stored
pub fn storage_key(task_id: &str, shard_index: Option<u32>) -> String {
    match shard_index {
        Some(shard) => format!("{}_shard_{}", task_id, shard),
        None => task_id.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Planning,
    Transferring,
    Recovering,
    Finished,
}

/// Periodic progress tuple pushed to the task sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub phase: ProgressPhase,
}

/// Outcome of a single transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub task_id: String,
    pub strategy: TransferStrategy,
    pub status: TaskStatus,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub pages: u64,
    /// Documents written back by the recovery pass
    pub recovered: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferReport {
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.success as f64 / self.processed as f64
        }
    }
}
