use crate::models::{Checkpoint, CheckpointKind, CheckpointStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// Priority offset applied to steps that retry a failed step
pub const RETRY_PRIORITY_OFFSET: u32 = 100;

/// Recovery order of a checkpoint kind.
///
/// Shards go last: their slice is usually finished by the document step continuing the
/// shard's cursor, leaving only the shard record to close.
pub fn step_priority(kind: CheckpointKind) -> Option<u32> {
    match kind {
        CheckpointKind::Document => Some(1),
        CheckpointKind::Field => Some(2),
        CheckpointKind::Batch => Some(3),
        CheckpointKind::TimeRange => Some(4),
        CheckpointKind::Shard => Some(5),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Executing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Created,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// Replays every recoverable checkpoint of one kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeStep {
    pub step_id: String,
    pub kind: CheckpointKind,
    pub priority: u32,
    pub checkpoints: Vec<Checkpoint>,
    pub status: StepStatus,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    /// Reserved: a failed critical step halts its plan. No step kind is critical today.
    pub critical: bool,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResumeStep {
    pub fn new(kind: CheckpointKind, priority: u32, checkpoints: Vec<Checkpoint>) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            kind,
            priority,
            checkpoints,
            status: StepStatus::Pending,
            processed: 0,
            success: 0,
            failed: 0,
            critical: false,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Executing;
        self.started_at = Some(Utc::now());
        self.processed = 0;
        self.success = 0;
        self.failed = 0;
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error_message = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = StepStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Every owned checkpoint has been visited
    pub fn all_visited(&self) -> bool {
        self.processed >= self.checkpoints.len()
    }

    /// Fraction of owned checkpoints visited, 0..=1
    pub fn progress(&self) -> f64 {
        if self.checkpoints.is_empty() {
            return if self.status == StepStatus::Completed { 1.0 } else { 0.0 };
        }
        (self.processed as f64 / self.checkpoints.len() as f64).min(1.0)
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.success as f64 / self.processed as f64
        }
    }

    pub fn needs_execution(&self) -> bool {
        self.status == StepStatus::Pending && !self.checkpoints.is_empty()
    }

    pub fn can_retry(&self) -> bool {
        self.status == StepStatus::Failed && self.failed > 0
    }

    pub fn execution_time_ms(&self) -> i64 {
        match self.started_at {
            Some(start) => (self.completed_at.unwrap_or_else(Utc::now) - start).num_milliseconds(),
            None => 0,
        }
    }

    /// A follow-up step owning only the failed checkpoints that still have retries left
    pub fn create_retry_step(&self) -> Option<ResumeStep> {
        let retryable: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::Failed && c.can_retry())
            .cloned()
            .collect();

        if retryable.is_empty() {
            return None;
        }
        Some(ResumeStep::new(
            self.kind,
            self.priority + RETRY_PRIORITY_OFFSET,
            retryable,
        ))
    }

    pub fn summary(&self) -> String {
        format!(
            "{} recovery [{:?}] priority={} checkpoints={} processed={} success={} failed={} progress={:.1}%",
            self.kind,
            self.status,
            self.priority,
            self.checkpoints.len(),
            self.processed,
            self.success,
            self.failed,
            self.progress() * 100.0
        )
    }
}

/// Priority-ordered recovery steps for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePlan {
    pub plan_id: String,
    pub task_id: String,
    pub steps: Vec<ResumeStep>,
    pub status: PlanStatus,
    pub current_step: usize,
    pub total_checkpoints: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResumePlan {
    /// Steps are sorted by priority on construction
    pub fn new(task_id: impl Into<String>, mut steps: Vec<ResumeStep>) -> Self {
        steps.sort_by_key(|s| s.priority);
        let total_checkpoints = steps.iter().map(|s| s.checkpoints.len()).sum();
        Self {
            plan_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            steps,
            status: PlanStatus::Created,
            current_step: 0,
            total_checkpoints,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn start(&mut self) {
        self.status = PlanStatus::Executing;
        self.started_at = Some(Utc::now());
        self.current_step = 0;
    }

    pub fn current_step(&self) -> Option<&ResumeStep> {
        self.steps.get(self.current_step)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut ResumeStep> {
        self.steps.get_mut(self.current_step)
    }

    /// Advance past the current step; false once every step has been visited
    pub fn move_to_next_step(&mut self) -> bool {
        if self.current_step < self.steps.len() {
            self.current_step += 1;
        }
        self.current_step < self.steps.len()
    }

    /// Every step has been visited
    pub fn is_complete(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    pub fn overall_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.steps.iter().map(ResumeStep::progress).sum::<f64>() / self.steps.len() as f64
    }

    pub fn complete(&mut self) {
        self.status = PlanStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = PlanStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Cancel the plan and every step that has not finished
    pub fn cancel(&mut self) {
        for step in &mut self.steps {
            if !step.status.is_terminal() {
                step.cancel();
            }
        }
        self.status = PlanStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn total_success(&self) -> usize {
        self.steps.iter().map(|s| s.success).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.steps.iter().map(|s| s.failed).sum()
    }

    pub fn execution_time_ms(&self) -> i64 {
        match self.started_at {
            Some(start) => (self.completed_at.unwrap_or_else(Utc::now) - start).num_milliseconds(),
            None => 0,
        }
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "Resume plan {} for task {} [{:?}]: step {}/{}, progress {:.1}%, checkpoints {}",
            self.plan_id,
            self.task_id,
            self.status,
            (self.current_step + 1).min(self.steps.len()),
            self.steps.len(),
            self.overall_progress() * 100.0,
            self.total_checkpoints
        );
        if let Some(err) = &self.error_message {
            let _ = write!(out, ", error: {}", err);
        }
        for (i, step) in self.steps.iter().enumerate() {
            let marker = if i < self.current_step {
                "done"
            } else if i == self.current_step {
                "current"
            } else {
                "queued"
            };
            let _ = write!(out, "\n  [{}] {}", marker, step.summary());
        }
        out
    }
}
