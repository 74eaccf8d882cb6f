//! Cursoring engines.
//!
//! Each engine walks the source index in a fixed order and hands every retrieved page to a
//! [`PageProcessor`]. A processor error is a page failure: it is counted and the walk goes on.
//! Errors that make the cursor itself unusable end the run.

pub mod pagination;
pub mod scroll;
pub mod streaming;

pub use pagination::PaginationEngine;
pub use scroll::ScrollEngine;
pub use streaming::StreamingEngine;

use crate::checkpoint::CheckpointStore;
use crate::models::CheckpointStatus;
use crate::error::retry::RetryConfig;
use crate::error::{Result, TransferError};
use crate::models::Document;
use crate::pipeline::AdaptiveThrottleController;
use crate::recovery::CircuitBreakerManager;
use crate::store::{DocumentStore, Query};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Breaker guarding source searches and scroll fetches
pub const SOURCE_SEARCH_BREAKER: &str = "source_search";
/// Breaker guarding bulk writes to the target
pub const TARGET_BULK_BREAKER: &str = "target_bulk";

/// Outcome of one processed page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageResult {
    pub success: u64,
    pub failed: u64,
}

/// Receives every page an engine retrieves
#[async_trait]
pub trait PageProcessor: Send + Sync {
    async fn process_page(
        &self,
        documents: Vec<Document>,
        page_number: u64,
        page_key: Option<String>,
    ) -> Result<PageResult>;
}

/// Aggregate counts for one engine run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    pub engine: String,
    pub pages: u64,
    pub failed_pages: u64,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: bool,
}

impl EngineReport {
    pub fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            ..Default::default()
        }
    }

    /// Fold one page outcome into the totals
    pub fn record(&mut self, page_len: usize, outcome: &Result<PageResult>) {
        self.pages += 1;
        self.processed += page_len as u64;
        match outcome {
            Ok(result) => {
                self.success += result.success;
                self.failed += result.failed;
            }
            Err(_) => {
                self.failed_pages += 1;
                self.failed += page_len as u64;
                crate::metrics::record_page_failure(&self.engine);
            }
        }
    }

    pub fn merge(&mut self, other: &EngineReport) {
        self.pages += other.pages;
        self.failed_pages += other.failed_pages;
        self.processed += other.processed;
        self.success += other.success;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
    }
}

/// Everything an engine run needs, passed in explicitly
#[derive(Clone)]
pub struct TransferContext {
    pub task_id: String,
    pub source: Arc<dyn DocumentStore>,
    pub source_index: String,
    /// Base query, e.g. the incremental range
    pub query: Query,
    pub batch_size: usize,
    pub estimated_total: u64,
    pub breakers: Arc<CircuitBreakerManager>,
    pub throttle: Arc<AdaptiveThrottleController>,
    pub checkpoints: Arc<CheckpointStore>,
    pub retry: RetryConfig,
    pub shutdown: watch::Receiver<bool>,
    /// Restricts time-window paging to one shard's slice instead of the index bounds
    pub time_slice: Option<TimeSlice>,
}

impl TransferContext {
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Error returned when a run stops because of cancellation
    pub fn cancelled_error(&self) -> TransferError {
        TransferError::Cancelled(format!("task {}", self.task_id))
    }
}

/// Id and search-after values of the last document of a page
pub(crate) fn page_position(documents: &[Document]) -> Option<(String, Vec<Value>)> {
    documents.last().map(|doc| {
        let after = if doc.sort.is_empty() {
            vec![Value::String(doc.id.clone())]
        } else {
            doc.sort.clone()
        };
        (doc.id.clone(), after)
    })
}

/// Keeps the cursor checkpoint of one id-ordered walk up to date
#[derive(Clone)]
pub(crate) struct CursorTracker {
    checkpoints: Arc<CheckpointStore>,
    checkpoint_id: String,
    task_id: String,
}

impl CursorTracker {
    pub(crate) async fn open(ctx: &TransferContext, engine: &str) -> Self {
        let checkpoint = ctx
            .checkpoints
            .create_cursor_checkpoint(&ctx.task_id, engine, ctx.query.clone())
            .await;
        Self {
            checkpoints: ctx.checkpoints.clone(),
            checkpoint_id: checkpoint.id,
            task_id: ctx.task_id.clone(),
        }
    }

    /// Move the cursor past a page whose documents have been handed on
    pub(crate) async fn advance(&self, position: Option<(String, Vec<Value>)>, processed: u64) {
        let Some((last_id, after)) = position else {
            return;
        };
        let cursor = serde_json::to_string(&after).ok();
        if let Err(e) = self
            .checkpoints
            .update_document_progress(&self.checkpoint_id, Some(last_id), cursor, processed)
            .await
        {
            warn!(task_id = %self.task_id, error = %e, "Failed to advance cursor checkpoint");
        }
    }

    /// Complete the walk, fail it, or leave it in `processing` for a cancelled run
    pub(crate) async fn finish<T>(&self, result: &Result<T>, cancelled: bool) {
        let recorded = match result {
            Ok(_) if cancelled => return,
            Err(TransferError::Cancelled(_)) => return,
            Ok(_) => self
                .checkpoints
                .set_status(&self.checkpoint_id, CheckpointStatus::Completed)
                .await,
            Err(e) => self.checkpoints.fail_checkpoint(&self.checkpoint_id, &e.to_string()).await,
        };
        if let Err(e) = recorded {
            warn!(task_id = %self.task_id, error = %e, "Failed to close cursor checkpoint");
        }
    }
}

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlice {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSlice {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Contiguous slices of near-equal length covering the whole interval, at most `parts` of them
    pub fn split(&self, parts: usize) -> Vec<TimeSlice> {
        let total = (self.end - self.start).num_milliseconds();
        if parts <= 1 || total <= 0 {
            return vec![*self];
        }

        let parts = parts as i64;
        let step = ChronoDuration::milliseconds((total + parts - 1) / parts);
        let mut slices = Vec::with_capacity(parts as usize);
        let mut current = self.start;
        while current < self.end {
            let next = (current + step).min(self.end);
            slices.push(TimeSlice::new(current, next));
            current = next;
        }
        slices
    }
}

#[async_trait]
pub trait CursorEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &TransferContext, processor: Arc<dyn PageProcessor>) -> Result<EngineReport>;
}
