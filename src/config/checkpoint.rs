use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Directory for task-level checkpoint files; in-memory when unset
    #[serde(default)]
    pub directory: Option<String>,

    /// Age after which unresolved checkpoints stop being recoverable
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,

    /// Hard cap on fine-grained checkpoints kept per task
    #[serde(default = "default_max_per_task")]
    pub max_per_task: usize,

    /// Retries allowed per checkpoint
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Document ids replayed per bulk request during recovery
    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: usize,

    /// Window size recorded on time-range checkpoints
    #[serde(default = "default_window_minutes")]
    pub time_window_minutes: i64,

    /// Run recovery automatically when a transfer records failures
    #[serde(default = "default_true")]
    pub auto_recover: bool,
}

impl CheckpointConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_hours * 3600)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: None,
            expiry_hours: default_expiry_hours(),
            max_per_task: default_max_per_task(),
            max_retries: default_max_retries(),
            recovery_batch_size: default_recovery_batch_size(),
            time_window_minutes: default_window_minutes(),
            auto_recover: true,
        }
    }
}

fn default_expiry_hours() -> u64 {
    24
}
fn default_max_per_task() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_recovery_batch_size() -> usize {
    100
}
fn default_window_minutes() -> i64 {
    10
}
fn default_true() -> bool {
    true
}
