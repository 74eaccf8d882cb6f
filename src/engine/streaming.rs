use super::pagination::{cursor_key, fetch_id_page};
use super::{page_position, CursorEngine, CursorTracker, EngineReport, PageProcessor, TransferContext};
use crate::config::StreamingConfig;
use crate::error::Result;
use crate::models::Document;
use crate::pipeline::MemoryAllocation;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

/// A fetched page waiting for a consumer
struct QueuedPage {
    number: u64,
    key: String,
    documents: Vec<Document>,
    _allocation: MemoryAllocation,
}

/// Bounded producer/consumer pipeline with back-pressure on memory
pub struct StreamingEngine {
    config: StreamingConfig,
}

impl StreamingEngine {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    /// Fetch pages in id order and queue them; returns the number of pages produced
    async fn produce(
        config: StreamingConfig,
        ctx: TransferContext,
        cursor: CursorTracker,
        tx: mpsc::Sender<QueuedPage>,
        depth: Arc<AtomicUsize>,
    ) -> Result<u64> {
        let memory = ctx.throttle.memory().clone();
        let capacity = config.queue_capacity.max(1);
        let mut after: Option<Vec<Value>> = None;
        let mut produced = 0u64;

        'pages: loop {
            if ctx.is_cancelled() {
                info!(task_id = %ctx.task_id, produced, "Producer stopping on cancellation");
                break;
            }

            // Suspend fetching entirely while memory is critical
            let mut paused = false;
            while memory.pressure() > config.pause_pressure {
                if !paused {
                    warn!(
                        pressure = memory.last_pressure(),
                        "Memory pressure critical, producer paused"
                    );
                    paused = true;
                }
                sleep(config.pause_sleep()).await;
                memory.reclaim("streaming-producer");
                sleep(config.reclaim_settle()).await;
                if ctx.is_cancelled() {
                    break 'pages;
                }
            }
            if paused {
                info!(pressure = memory.last_pressure(), "Producer resumed");
            }

            let outcome = fetch_id_page(&ctx, ctx.batch_size, after.as_ref()).await?;
            let effective = outcome.page_size;
            let documents = outcome.page.hits;
            if documents.is_empty() {
                break;
            }

            produced += 1;
            let len = documents.len();
            let key = cursor_key(after.as_ref());
            let position = page_position(&documents);
            after = position.as_ref().map(|(_, values)| values.clone());
            crate::metrics::record_page_fetched("streaming");

            let bytes = documents.iter().map(Document::estimated_size).sum();
            let allocation = memory.track(bytes)?;
            let page = QueuedPage {
                number: produced,
                key,
                documents,
                _allocation: allocation,
            };

            if tx.send(page).await.is_err() {
                warn!("Consumer gone, producer stopping");
                break;
            }
            let queued = depth.fetch_add(1, Ordering::SeqCst) + 1;
            // Queued pages are always drained, so the cursor moves on enqueue
            cursor.advance(position, len as u64).await;

            let pressure = memory.last_pressure();
            let fill = queued as f64 / capacity as f64;
            if pressure > config.throttle_pressure || fill > 0.8 {
                let delay = (config.pressure_delay_ms as f64 * pressure.max(fill)) as u64;
                debug!(pressure, queued, delay_ms = delay, "Producer throttling");
                sleep(Duration::from_millis(delay)).await;
            }

            if len < effective {
                break;
            }
        }

        Ok(produced)
    }

    fn spawn_monitor(
        &self,
        ctx: &TransferContext,
        depth: Arc<AtomicUsize>,
        mut done: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let memory = ctx.throttle.memory().clone();
        let period = self.config.monitor_interval();
        let throttle_pressure = self.config.throttle_pressure;
        let task_id = ctx.task_id.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let queued = depth.load(Ordering::SeqCst);
                        let pressure = memory.pressure();
                        crate::metrics::update_stream_queue_depth(queued);
                        debug!(task_id = %task_id, queued, pressure, "Streaming monitor");
                        if pressure > throttle_pressure {
                            memory.reclaim("streaming-monitor");
                        }
                    }
                    changed = done.changed() => {
                        if changed.is_err() || *done.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CursorEngine for StreamingEngine {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn run(&self, ctx: &TransferContext, processor: Arc<dyn PageProcessor>) -> Result<EngineReport> {
        let capacity = self.config.queue_capacity.max(1);
        let workers = self.config.max_concurrent_batches.max(1);
        let (tx, mut rx) = mpsc::channel::<QueuedPage>(capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = watch::channel(false);

        info!(
            task_id = %ctx.task_id,
            queue_capacity = capacity,
            workers,
            batch_size = ctx.batch_size,
            "Starting streaming transfer"
        );

        let cursor = CursorTracker::open(ctx, self.name()).await;
        let producer = tokio::spawn(Self::produce(
            self.config.clone(),
            ctx.clone(),
            cursor.clone(),
            tx,
            depth.clone(),
        ));
        let monitor = self.spawn_monitor(ctx, depth.clone(), done_rx);

        let report = Arc::new(Mutex::new(EngineReport::new(self.name())));
        let semaphore = Arc::new(Semaphore::new(workers));
        let poll_timeout = self.config.poll_timeout();

        loop {
            let page = match timeout(poll_timeout, rx.recv()).await {
                Ok(Some(page)) => page,
                // Producer finished and the queue is drained
                Ok(None) => break,
                Err(_) => continue,
            };
            depth.fetch_sub(1, Ordering::SeqCst);

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let processor = processor.clone();
            let report = report.clone();
            let task_id = ctx.task_id.clone();

            tokio::spawn(async move {
                let QueuedPage {
                    number,
                    key,
                    documents,
                    _allocation,
                } = page;
                let len = documents.len();
                let outcome = processor.process_page(documents, number, Some(key)).await;
                if let Err(e) = &outcome {
                    warn!(task_id = %task_id, page = number, error = %e, "Streaming page failed");
                }
                report.lock().await.record(len, &outcome);
                drop(permit);
            });
        }

        // Wait for every in-flight page
        let drained = semaphore.acquire_many(workers as u32).await;
        drop(drained);

        let _ = done_tx.send(true);
        let _ = monitor.await;
        crate::metrics::update_stream_queue_depth(0);

        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => {
                error!(task_id = %ctx.task_id, error = %e, "Producer task panicked");
                Err(crate::error::TransferError::Pipeline(format!("producer task failed: {}", e)))
            }
        };

        let mut report = report.lock().await.clone();
        report.cancelled = ctx.is_cancelled();
        cursor.finish(&produced, report.cancelled).await;

        info!(
            task_id = %ctx.task_id,
            pages = report.pages,
            processed = report.processed,
            success = report.success,
            failed = report.failed,
            cancelled = report.cancelled,
            "Streaming finished"
        );

        produced.map(|_| report)
    }
}
