use crate::checkpoint::{CheckpointStorage, CheckpointStore, MemoryCheckpointStorage, PlanStatus};
use crate::config::{Config, TransferConfig, TransferStrategy};
use crate::engine::{
    CursorEngine, EngineReport, PageProcessor, PaginationEngine, ScrollEngine, StreamingEngine,
    TimeSlice, TransferContext,
};
use crate::error::{Result, TransferError};
use crate::models::{
    CheckpointStatus, ProgressPhase, ProgressUpdate, TaskStatus, TransferCheckpoint, TransferReport,
};
use crate::pipeline::{select_strategy, AdaptiveThrottleController, BatchWriter, DocumentTransformer, MemoryMonitor};
use crate::recovery::{CircuitBreakerManager, RecoveryEngine, RecoveryResult};
use crate::store::{time_value, DocumentStore, Query};
use crate::sync::{LoggingProgressSink, ProgressSink};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Estimate used when the source cannot be counted
pub const DEFAULT_ESTIMATE: u64 = 1_000_000;

/// One transfer request
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub task_id: String,
    pub config: TransferConfig,
}

impl TransferTask {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Reuse an existing task id, e.g. to continue an interrupted run
    pub fn with_id(task_id: impl Into<String>, config: TransferConfig) -> Self {
        Self {
            task_id: task_id.into(),
            config,
        }
    }
}

/// Picks a cursoring engine per task, runs it through the batch writer and replays failures
pub struct TransferOrchestrator {
    config: Config,
    source: Arc<dyn DocumentStore>,
    target: Arc<dyn DocumentStore>,
    breakers: Arc<CircuitBreakerManager>,
    throttle: Arc<AdaptiveThrottleController>,
    checkpoints: Arc<CheckpointStore>,
    storage: Arc<dyn CheckpointStorage>,
    progress: Arc<dyn ProgressSink>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dry_run: bool,
}

impl TransferOrchestrator {
    pub fn new(
        config: Config,
        source: Arc<dyn DocumentStore>,
        target: Arc<dyn DocumentStore>,
        memory: MemoryMonitor,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone()));
        let throttle = Arc::new(AdaptiveThrottleController::new(config.throttle.clone(), memory));
        let checkpoints = Arc::new(CheckpointStore::new(&config.checkpoint));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            source,
            target,
            breakers,
            throttle,
            checkpoints,
            storage: Arc::new(MemoryCheckpointStorage::new()),
            progress: Arc::new(LoggingProgressSink),
            shutdown_tx,
            shutdown_rx,
            dry_run: false,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn throttle(&self) -> &Arc<AdaptiveThrottleController> {
        &self.throttle
    }

    /// Ask running transfers to stop after their in-flight pages.
    ///
    /// A request made while nothing runs stops the next run. The flag clears when that
    /// transfer or resume finishes.
    pub fn cancel(&self) {
        let already = self.shutdown_tx.send_replace(true);
        if !already {
            info!("Cancellation requested");
        }
    }

    fn clear_cancellation(&self) {
        if self.shutdown_tx.send_replace(false) {
            debug!("Cancellation flag cleared");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn report_progress(&self, task_id: &str, phase: ProgressPhase, counts: (u64, u64, u64)) {
        self.progress.report(ProgressUpdate {
            task_id: task_id.to_string(),
            processed: counts.0,
            success: counts.1,
            failed: counts.2,
            phase,
        });
    }

    /// Base query: everything, or only documents changed since the last completed run
    async fn base_query(&self, transfer: &TransferConfig) -> Result<Query> {
        if !transfer.incremental {
            return Ok(Query::MatchAll);
        }

        let previous = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|c| {
                c.status == TaskStatus::Completed
                    && c.shard_index.is_none()
                    && c.source_index == transfer.source_index
                    && c.target_index == transfer.target_index
            })
            .max_by_key(|c| c.last_update_time);

        match previous {
            Some(previous) => {
                info!(
                    since = %previous.last_update_time,
                    field = %transfer.timestamp_field,
                    previous_task = %previous.task_id,
                    "Incremental transfer"
                );
                Ok(Query::greater_than(
                    transfer.timestamp_field.clone(),
                    time_value(previous.last_update_time),
                ))
            }
            None => {
                info!("No completed run to continue from, transferring everything");
                Ok(Query::MatchAll)
            }
        }
    }

    async fn choose_strategy(&self, transfer: &TransferConfig, query: &Query) -> (TransferStrategy, u64) {
        let estimated = match self.source.count(&transfer.source_index, query).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, default = DEFAULT_ESTIMATE, "Count query failed, using default estimate");
                DEFAULT_ESTIMATE
            }
        };

        if let Some(strategy) = transfer.strategy {
            info!(strategy = strategy.as_str(), estimated, "Using configured strategy");
            return (strategy, estimated);
        }

        let has_time_field = match self
            .source
            .field_exists(&transfer.source_index, &self.config.pagination.time_field)
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                warn!(error = %e, "Time field check failed");
                false
            }
        };
        let pressure = self.throttle.memory().pressure();
        let strategy = select_strategy(
            estimated,
            has_time_field,
            pressure,
            self.config.throttle.green_threshold,
        );

        info!(
            strategy = strategy.as_str(),
            estimated,
            has_time_field,
            pressure,
            "Selected transfer strategy"
        );
        (strategy, estimated)
    }

    async fn run_engine(
        &self,
        strategy: TransferStrategy,
        ctx: &TransferContext,
        writer: Arc<BatchWriter>,
        scroll_timeout: u64,
    ) -> Result<EngineReport> {
        let scroll = ScrollEngine::new(self.config.scroll.clone(), scroll_timeout);
        let pagination = PaginationEngine::new(self.config.pagination.clone());
        let streaming = StreamingEngine::new(self.config.streaming.clone());

        match strategy {
            TransferStrategy::Scroll => scroll.run(ctx, writer).await,
            TransferStrategy::Pagination => pagination.run(ctx, writer).await,
            TransferStrategy::Streaming => streaming.run(ctx, writer).await,
            TransferStrategy::Hybrid => match pagination.run(ctx, writer.clone()).await {
                Ok(report) => Ok(report),
                Err(TransferError::Cancelled(reason)) => Err(TransferError::Cancelled(reason)),
                Err(e) => {
                    warn!(task_id = %ctx.task_id, error = %e, "Pagination failed, falling back to streaming");
                    self.retire_cursors(&ctx.task_id, pagination.name()).await;
                    streaming.run(ctx, writer).await
                }
            },
        }
    }

    /// Close the failed walks of `engine`; the fallback engine walks the same query again
    async fn retire_cursors(&self, task_id: &str, engine: &str) {
        for cursor in self.checkpoints.cursor_checkpoints(task_id).await {
            let superseded = cursor.status == CheckpointStatus::Failed
                && cursor
                    .document()
                    .and_then(|d| d.walk.as_ref())
                    .is_some_and(|walk| walk.engine == engine);
            if !superseded {
                continue;
            }
            if let Err(e) = self
                .checkpoints
                .set_status(&cursor.id, CheckpointStatus::Completed)
                .await
            {
                warn!(task_id, checkpoint_id = %cursor.id, error = %e, "Failed to retire cursor checkpoint");
            }
        }
    }

    /// Split the run into time shards worked in parallel when `thread_count > 1`.
    ///
    /// Only the single-cursor engines are sharded; streaming has its own consumer pool. Each shard
    /// gets a shard checkpoint whose offsets are the slice bounds in epoch milliseconds.
    async fn run_sharded(
        &self,
        strategy: TransferStrategy,
        ctx: &TransferContext,
        writer: Arc<BatchWriter>,
        transfer: &TransferConfig,
    ) -> Result<EngineReport> {
        let shards = transfer.thread_count;
        if shards <= 1 || !matches!(strategy, TransferStrategy::Scroll | TransferStrategy::Pagination) {
            return self.run_engine(strategy, ctx, writer, transfer.scroll_timeout).await;
        }

        let field = self.config.pagination.time_field.clone();
        let bounds = match ctx.source.time_bounds(&ctx.source_index, &field).await {
            Ok(Some(bounds)) => bounds,
            Ok(None) => {
                info!(task_id = %ctx.task_id, field = %field, "No time bounds to shard on, running a single cursor");
                return self.run_engine(strategy, ctx, writer, transfer.scroll_timeout).await;
            }
            Err(e) => {
                warn!(task_id = %ctx.task_id, error = %e, "Time bounds query failed, running a single cursor");
                return self.run_engine(strategy, ctx, writer, transfer.scroll_timeout).await;
            }
        };

        let slices = TimeSlice::new(bounds.min, bounds.max + chrono::Duration::milliseconds(1)).split(shards);
        info!(
            task_id = %ctx.task_id,
            strategy = strategy.as_str(),
            shards = slices.len(),
            "Running sharded transfer"
        );

        let mut workers = JoinSet::new();
        for (index, slice) in slices.into_iter().enumerate() {
            let query = ctx.query.clone().and(Query::between(
                field.clone(),
                time_value(slice.start),
                time_value(slice.end),
            ));
            let end_offset = slice.end.timestamp_millis().max(0) as u64;
            let checkpoint = ctx
                .checkpoints
                .create_shard_checkpoint(
                    &ctx.task_id,
                    index as u32,
                    slice.start.timestamp_millis().max(0) as u64,
                    end_offset,
                    query.clone(),
                )
                .await;

            let mut shard_ctx = ctx.clone();
            shard_ctx.query = query;
            shard_ctx.time_slice = Some(slice);

            let engine: Box<dyn CursorEngine> = match strategy {
                TransferStrategy::Scroll => Box::new(ScrollEngine::new(
                    self.config.scroll.clone(),
                    transfer.scroll_timeout,
                )),
                _ => Box::new(PaginationEngine::new(self.config.pagination.clone())),
            };
            let processor: Arc<dyn PageProcessor> = writer.clone();

            workers.spawn(async move {
                let outcome = engine.run(&shard_ctx, processor).await;
                let recorded = match &outcome {
                    Ok(report) if report.cancelled => Ok(()),
                    Ok(_) => shard_ctx
                        .checkpoints
                        .update_shard_progress(&checkpoint.id, end_offset)
                        .await
                        .map(|_| ()),
                    Err(e) => shard_ctx
                        .checkpoints
                        .fail_checkpoint(&checkpoint.id, &e.to_string())
                        .await
                        .map(|_| ()),
                };
                if let Err(e) = recorded {
                    warn!(task_id = %shard_ctx.task_id, shard = index, error = %e, "Failed to record shard outcome");
                }
                (index, outcome)
            });
        }

        let mut report = EngineReport::new(strategy.as_str());
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(shard))) => report.merge(&shard),
                Ok((index, Err(e))) => {
                    warn!(task_id = %ctx.task_id, shard = index, error = %e, "Shard failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(task_id = %ctx.task_id, error = %e, "Shard task panicked");
                    first_error.get_or_insert(TransferError::Pipeline(format!("shard task failed: {}", e)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn open_task_checkpoint(
        &self,
        task: &TransferTask,
        strategy: TransferStrategy,
        estimated: u64,
    ) -> Result<TransferCheckpoint> {
        let mut checkpoint = match self.storage.get(&task.task_id, None).await? {
            Some(existing) => existing,
            None => TransferCheckpoint::new(
                &task.task_id,
                &task.config.source_index,
                &task.config.target_index,
            ),
        };
        checkpoint.total = estimated;
        checkpoint.batch_size = task.config.batch_size;
        checkpoint.strategy = Some(strategy);
        checkpoint.status = TaskStatus::Running;
        checkpoint.error_message = None;
        checkpoint.last_update_time = chrono::Utc::now();
        self.storage.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Cursor of the only unfinished walk of a task, if it has exactly one
    async fn open_cursor(&self, task_id: &str) -> Option<String> {
        let mut open = self
            .checkpoints
            .cursor_checkpoints(task_id)
            .await
            .into_iter()
            .filter(|c| c.status != CheckpointStatus::Completed);
        let only = open.next()?;
        if open.next().is_some() {
            return None;
        }
        only.document().and_then(|d| d.last_cursor.clone())
    }

    async fn close_task_checkpoint(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        let result = async {
            if let Some(mut checkpoint) = self.storage.get(task_id, None).await? {
                checkpoint.cursor = match status {
                    TaskStatus::Completed => None,
                    _ => self.open_cursor(task_id).await,
                };
                checkpoint.status = status;
                checkpoint.error_message = error;
                checkpoint.last_update_time = chrono::Utc::now();
                self.storage.save(&checkpoint).await?;
            }
            Ok::<(), TransferError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(task_id, error = %e, "Failed to store final task status");
        }
    }

    /// Run one transfer end to end
    pub async fn transfer(&self, task: TransferTask) -> Result<TransferReport> {
        let started = Instant::now();
        let transfer = &task.config;
        info!(
            task_id = %task.task_id,
            source = %transfer.source_index,
            target = %transfer.target_index,
            dry_run = self.dry_run,
            "Starting transfer"
        );
        self.report_progress(&task.task_id, ProgressPhase::Planning, (0, 0, 0));

        let query = self.base_query(transfer).await?;
        let (strategy, estimated) = self.choose_strategy(transfer, &query).await;
        self.open_task_checkpoint(&task, strategy, estimated).await?;

        let writer = Arc::new(
            BatchWriter::new(
                task.task_id.clone(),
                self.target.clone(),
                transfer.target_index.clone(),
                DocumentTransformer::new(transfer),
                self.throttle.clone(),
                self.breakers.clone(),
                self.checkpoints.clone(),
            )
            .with_storage(self.storage.clone())
            .with_progress(self.progress.clone())
            .dry_run(self.dry_run),
        );

        let ctx = TransferContext {
            task_id: task.task_id.clone(),
            source: self.source.clone(),
            source_index: transfer.source_index.clone(),
            query,
            batch_size: transfer.batch_size,
            estimated_total: estimated,
            breakers: self.breakers.clone(),
            throttle: self.throttle.clone(),
            checkpoints: self.checkpoints.clone(),
            retry: self.config.retry.clone(),
            shutdown: self.shutdown_rx.clone(),
            time_slice: None,
        };

        let outcome = self
            .run_sharded(strategy, &ctx, writer.clone(), transfer)
            .await;

        let mut report = TransferReport {
            task_id: task.task_id.clone(),
            strategy,
            status: TaskStatus::Running,
            processed: 0,
            success: 0,
            failed: 0,
            pages: 0,
            recovered: 0,
            duration_ms: 0,
            error: None,
        };

        match outcome {
            Ok(engine) => {
                report.processed = engine.processed;
                report.success = engine.success;
                report.failed = engine.failed;
                report.pages = engine.pages;
                report.status = if engine.cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Completed
                };
            }
            Err(TransferError::Cancelled(reason)) => {
                report.status = TaskStatus::Cancelled;
                report.error = Some(reason);
            }
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Transfer failed");
                let (processed, success, failed) = writer.totals();
                report.processed = processed;
                report.success = success;
                report.failed = failed;
                report.status = TaskStatus::Failed;
                report.error = Some(e.to_string());
            }
        }

        if report.status == TaskStatus::Cancelled {
            let suspended = self.checkpoints.suspend_task(&task.task_id).await;
            info!(task_id = %task.task_id, suspended, "Transfer cancelled, checkpoints suspended");
        }

        if report.status == TaskStatus::Completed {
            let unresolved = self.checkpoints.statistics(&task.task_id).await.failed;
            if unresolved > 0 && self.config.checkpoint.auto_recover && !self.dry_run {
                self.report_progress(
                    &task.task_id,
                    ProgressPhase::Recovering,
                    (report.processed, report.success, report.failed),
                );
                let recovery = self.recovery_engine(transfer).recover_task(&task.task_id).await;
                report.recovered = recovery.recovered_documents;
            }

            if self.checkpoints.statistics(&task.task_id).await.failed > 0 {
                report.status = TaskStatus::CompletedWithFailures;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.close_task_checkpoint(&task.task_id, report.status, report.error.clone())
            .await;
        self.clear_cancellation();
        self.report_progress(
            &task.task_id,
            ProgressPhase::Finished,
            (report.processed, report.success, report.failed),
        );

        info!(
            task_id = %report.task_id,
            strategy = report.strategy.as_str(),
            status = %report.status,
            processed = report.processed,
            success = report.success,
            failed = report.failed,
            recovered = report.recovered,
            duration_ms = report.duration_ms,
            "Transfer finished"
        );
        Ok(report)
    }

    fn recovery_engine(&self, transfer: &TransferConfig) -> RecoveryEngine {
        RecoveryEngine::new(
            self.source.clone(),
            self.target.clone(),
            transfer,
            self.checkpoints.clone(),
            self.breakers.clone(),
            self.config.checkpoint.recovery_batch_size,
        )
        .with_retry(self.config.retry.clone())
        .with_shutdown(self.shutdown_rx.clone())
    }

    /// Resume a task whose fine-grained checkpoints did not survive, such as one started by an
    /// earlier process. The stored task checkpoint seeds a walk from its cursor; a task that
    /// never recorded progress starts its walk from the beginning.
    pub async fn resume_stored(&self, task_id: &str) -> Result<RecoveryResult> {
        if !self.checkpoints.list(task_id).await.is_empty() {
            return Ok(self.resume(task_id).await);
        }

        let transfer = &self.config.transfer;
        let resumable = self
            .storage
            .can_resume(task_id, &transfer.source_index, &transfer.target_index)
            .await?;
        let Some(stored) = self.storage.get(task_id, None).await?.filter(|_| resumable) else {
            return Err(TransferError::Checkpoint(format!(
                "task {} has no resumable checkpoint",
                task_id
            )));
        };
        if stored.cursor.is_none() && stored.processed > 0 {
            return Err(TransferError::Checkpoint(format!(
                "task {} stopped after {} documents without a single cursor to continue from",
                task_id, stored.processed
            )));
        }

        let query = self.base_query(transfer).await?;
        let seeded = self
            .checkpoints
            .create_cursor_checkpoint(task_id, "stored", query)
            .await;
        self.checkpoints
            .update_document_progress(&seeded.id, None, stored.cursor.clone(), stored.processed)
            .await?;
        self.checkpoints
            .set_status(&seeded.id, CheckpointStatus::Suspended)
            .await?;
        info!(task_id, cursor = ?stored.cursor, processed = stored.processed, "Seeded walk from stored checkpoint");

        Ok(self.resume(task_id).await)
    }

    /// Replay the recoverable checkpoints recorded for `task_id`.
    ///
    /// Interrupted walks continue from their cursor checkpoints, failed shards and time ranges
    /// are finished and failed documents, fields and batches are rewritten. The task-level
    /// checkpoint, when stored, takes the outcome.
    pub async fn resume(&self, task_id: &str) -> RecoveryResult {
        self.report_progress(task_id, ProgressPhase::Recovering, (0, 0, 0));
        let result = self
            .recovery_engine(&self.config.transfer)
            .recover_task(task_id)
            .await;

        if result.total_checkpoints > 0 {
            let stats = self.checkpoints.statistics(task_id).await;
            let unresolved = stats.failed + stats.suspended;
            let status = match result.status {
                PlanStatus::Cancelled => TaskStatus::Cancelled,
                _ if unresolved == 0 => TaskStatus::Completed,
                _ => TaskStatus::CompletedWithFailures,
            };
            self.close_task_checkpoint(task_id, status, None).await;
        }
        self.clear_cancellation();

        info!(
            task_id,
            status = ?result.status,
            checkpoints = result.total_checkpoints,
            recovered = result.recovered_documents,
            "Resume finished"
        );
        self.report_progress(
            task_id,
            ProgressPhase::Finished,
            (result.processed as u64, result.success as u64, result.failed as u64),
        );
        result
    }
}
