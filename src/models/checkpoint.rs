use crate::error::TransferError;
use crate::models::FieldStatus;
use crate::store::Query;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Suspended,
}

impl CheckpointStatus {
    /// Statuses that protect a checkpoint from garbage collection
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, CheckpointStatus::Completed)
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, CheckpointStatus::Failed | CheckpointStatus::Suspended)
    }
}

/// Granularity of a checkpoint; the order here is the recovery order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Document,
    Field,
    Batch,
    Shard,
    TimeRange,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Document => "document",
            CheckpointKind::Field => "field",
            CheckpointKind::Batch => "batch",
            CheckpointKind::Shard => "shard",
            CheckpointKind::TimeRange => "time_range",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentProgress {
    pub last_processed_id: Option<String>,
    /// Page key, or the serialized search-after values of a walk
    pub last_cursor: Option<String>,
    pub processed_count: u64,
    pub failed_ids: BTreeSet<String>,
    pub partially_processed_ids: BTreeSet<String>,
    /// Set when the checkpoint tracks an engine's id-ordered walk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk: Option<CursorWalk>,
}

impl DocumentProgress {
    /// Search-after values to continue a walk from; `None` means from the start
    pub fn resume_after(&self) -> Option<Vec<Value>> {
        self.last_cursor
            .as_deref()
            .and_then(|cursor| serde_json::from_str(cursor).ok())
    }
}

/// The query and engine behind a cursor checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorWalk {
    pub engine: String,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProgress {
    pub document_id: String,
    pub field_name: String,
    pub original_value: Value,
    pub transformed_value: Option<Value>,
    pub status: FieldStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_number: u64,
    pub document_ids: Vec<String>,
    pub size: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardProgress {
    pub shard_index: u32,
    pub start_offset: u64,
    pub end_offset: u64,
    pub current_offset: u64,
    /// Query restricted to this shard's slice
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRangeProgress {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub current: DateTime<Utc>,
    pub window_minutes: i64,
    pub time_field: String,
    pub processed_windows: u64,
}

impl TimeRangeProgress {
    pub fn is_valid(&self) -> bool {
        self.current < self.end
    }
}

/// Exactly one variant payload per checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CheckpointParts", into = "CheckpointParts")]
pub enum CheckpointPayload {
    Document(DocumentProgress),
    Field(FieldProgress),
    Batch(BatchProgress),
    Shard(ShardProgress),
    TimeRange(TimeRangeProgress),
}

impl CheckpointPayload {
    pub fn kind(&self) -> CheckpointKind {
        match self {
            CheckpointPayload::Document(_) => CheckpointKind::Document,
            CheckpointPayload::Field(_) => CheckpointKind::Field,
            CheckpointPayload::Batch(_) => CheckpointKind::Batch,
            CheckpointPayload::Shard(_) => CheckpointKind::Shard,
            CheckpointPayload::TimeRange(_) => CheckpointKind::TimeRange,
        }
    }
}

/// Flat persisted layout: one optional slot per variant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointParts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<FieldProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRangeProgress>,
}

impl TryFrom<CheckpointParts> for CheckpointPayload {
    type Error = TransferError;

    fn try_from(parts: CheckpointParts) -> Result<Self, Self::Error> {
        let mut found = Vec::with_capacity(1);
        if let Some(p) = parts.document {
            found.push(CheckpointPayload::Document(p));
        }
        if let Some(p) = parts.field {
            found.push(CheckpointPayload::Field(p));
        }
        if let Some(p) = parts.batch {
            found.push(CheckpointPayload::Batch(p));
        }
        if let Some(p) = parts.shard {
            found.push(CheckpointPayload::Shard(p));
        }
        if let Some(p) = parts.time_range {
            found.push(CheckpointPayload::TimeRange(p));
        }

        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err(TransferError::Checkpoint(
                "checkpoint has no payload".to_string(),
            )),
            n => Err(TransferError::Checkpoint(format!(
                "checkpoint has {} payloads, expected exactly one",
                n
            ))),
        }
    }
}

impl From<CheckpointPayload> for CheckpointParts {
    fn from(payload: CheckpointPayload) -> Self {
        let mut parts = CheckpointParts::default();
        match payload {
            CheckpointPayload::Document(p) => parts.document = Some(p),
            CheckpointPayload::Field(p) => parts.field = Some(p),
            CheckpointPayload::Batch(p) => parts.batch = Some(p),
            CheckpointPayload::Shard(p) => parts.shard = Some(p),
            CheckpointPayload::TimeRange(p) => parts.time_range = Some(p),
        }
        parts
    }
}

/// Fine-grained progress record for one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    /// Creation order within the process
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    last_update_time: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    payload: CheckpointPayload,
}

impl Checkpoint {
    pub fn new(
        id: String,
        task_id: String,
        sequence: u64,
        payload: CheckpointPayload,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_id,
            sequence,
            created_at: now,
            last_update_time: now,
            status: CheckpointStatus::Pending,
            error_message: None,
            retry_count: 0,
            max_retries,
            payload,
        }
    }

    pub fn kind(&self) -> CheckpointKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &CheckpointPayload {
        &self.payload
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }

    /// Bump the update time; never moves backwards
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_update_time {
            self.last_update_time = now;
        }
    }

    pub fn set_status(&mut self, status: CheckpointStatus) {
        self.status = status;
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = CheckpointStatus::Failed;
        self.error_message = Some(message.into());
        self.touch();
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        self.touch();
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        Utc::now() - self.last_update_time > max_age
    }

    pub fn document(&self) -> Option<&DocumentProgress> {
        match &self.payload {
            CheckpointPayload::Document(p) => Some(p),
            _ => None,
        }
    }

    pub fn document_mut(&mut self) -> Option<&mut DocumentProgress> {
        match &mut self.payload {
            CheckpointPayload::Document(p) => Some(p),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<&FieldProgress> {
        match &self.payload {
            CheckpointPayload::Field(p) => Some(p),
            _ => None,
        }
    }

    pub fn field_mut(&mut self) -> Option<&mut FieldProgress> {
        match &mut self.payload {
            CheckpointPayload::Field(p) => Some(p),
            _ => None,
        }
    }

    pub fn batch(&self) -> Option<&BatchProgress> {
        match &self.payload {
            CheckpointPayload::Batch(p) => Some(p),
            _ => None,
        }
    }

    pub fn batch_mut(&mut self) -> Option<&mut BatchProgress> {
        match &mut self.payload {
            CheckpointPayload::Batch(p) => Some(p),
            _ => None,
        }
    }

    pub fn shard(&self) -> Option<&ShardProgress> {
        match &self.payload {
            CheckpointPayload::Shard(p) => Some(p),
            _ => None,
        }
    }

    pub fn shard_mut(&mut self) -> Option<&mut ShardProgress> {
        match &mut self.payload {
            CheckpointPayload::Shard(p) => Some(p),
            _ => None,
        }
    }

    pub fn time_range(&self) -> Option<&TimeRangeProgress> {
        match &self.payload {
            CheckpointPayload::TimeRange(p) => Some(p),
            _ => None,
        }
    }

    pub fn time_range_mut(&mut self) -> Option<&mut TimeRangeProgress> {
        match &mut self.payload {
            CheckpointPayload::TimeRange(p) => Some(p),
            _ => None,
        }
    }
}
