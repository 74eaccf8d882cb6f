use super::{
    page_position, CursorEngine, CursorTracker, EngineReport, PageProcessor, TransferContext,
    SOURCE_SEARCH_BREAKER,
};
use crate::config::ScrollConfig;
use crate::error::Result;
use crate::store::{scroll_with_retry, SearchPage, SearchRequest, ID_FIELD};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const MINUTE: u64 = 60;

/// One long-lived server-side cursor over the whole source query.
///
/// The cursor is sorted by id so an interrupted walk can be continued with search-after.
pub struct ScrollEngine {
    config: ScrollConfig,
    /// Floor for the cursor keep-alive, in minutes
    min_keep_alive_minutes: u64,
}

impl ScrollEngine {
    pub fn new(config: ScrollConfig, min_keep_alive_minutes: u64) -> Self {
        Self {
            config,
            min_keep_alive_minutes,
        }
    }

    /// Keep-alive for the opening search, tiered by estimated volume
    pub fn initial_keep_alive(estimated_docs: u64) -> Duration {
        let minutes = if estimated_docs > 10_000_000 {
            30
        } else if estimated_docs > 1_000_000 {
            10
        } else {
            5
        };
        Duration::from_secs(minutes * MINUTE)
    }

    /// Keep-alive for follow-up fetches: longer when the run is large or memory is tight
    pub fn adaptive_keep_alive(processed: u64, pressure: f64) -> Duration {
        let minutes = if pressure > 0.9 || processed > 50_000_000 {
            30
        } else if pressure > 0.8 || processed > 10_000_000 {
            10
        } else {
            5
        };
        Duration::from_secs(minutes * MINUTE)
    }

    fn with_floor(&self, keep_alive: Duration) -> Duration {
        keep_alive.max(Duration::from_secs(self.min_keep_alive_minutes * MINUTE))
    }

    async fn walk(
        &self,
        ctx: &TransferContext,
        processor: &dyn PageProcessor,
        cursor: &CursorTracker,
        scroll_id: &mut Option<String>,
        report: &mut EngineReport,
    ) -> Result<()> {
        let breaker = ctx.breakers.get(SOURCE_SEARCH_BREAKER).await;
        let memory = ctx.throttle.memory();
        let keep_alive = self.with_floor(Self::initial_keep_alive(ctx.estimated_total));

        info!(
            task_id = %ctx.task_id,
            index = %ctx.source_index,
            estimated = ctx.estimated_total,
            keep_alive_secs = keep_alive.as_secs(),
            batch_size = ctx.batch_size,
            "Opening scroll"
        );

        let request = SearchRequest::new(ctx.query.clone(), ctx.batch_size).sort_asc(ID_FIELD);
        let mut page: SearchPage = breaker
            .call(|| ctx.source.open_scroll(&ctx.source_index, &request, keep_alive))
            .await?;
        *scroll_id = page.scroll_id.take();

        let started = Instant::now();
        let mut rounds: u64 = 0;

        while !page.is_empty() {
            if ctx.is_cancelled() {
                info!(task_id = %ctx.task_id, rounds, "Scroll cancelled, stopping after in-flight page");
                report.cancelled = true;
                return Ok(());
            }

            rounds += 1;
            let len = page.len();
            let position = page_position(&page.hits);
            crate::metrics::record_page_fetched("scroll");
            let outcome = processor
                .process_page(std::mem::take(&mut page.hits), rounds, scroll_id.clone())
                .await;
            if let Err(e) = &outcome {
                warn!(task_id = %ctx.task_id, page = rounds, error = %e, "Scroll page failed");
            }
            report.record(len, &outcome);
            cursor.advance(position, len as u64).await;

            if rounds % self.config.progress_log_every.max(1) == 0 {
                let secs = started.elapsed().as_secs_f64();
                info!(
                    task_id = %ctx.task_id,
                    rounds,
                    processed = report.processed,
                    docs_per_sec = if secs > 0.0 { report.processed as f64 / secs } else { 0.0 },
                    "Scroll progress"
                );
            }

            let pressure = memory.pressure();
            let reclaiming = pressure > self.config.reclaim_pressure;
            if reclaiming {
                warn!(pressure, "High memory pressure during scroll, reclaiming");
                memory.reclaim("scroll");
            }

            let Some(id) = scroll_id.clone() else {
                break;
            };

            if rounds % self.config.refresh_every.max(1) == 0 {
                if let Err(e) = ctx.source.extend_scroll(&id, self.with_floor(Duration::from_secs(30 * MINUTE))).await {
                    warn!(error = %e, "Failed to refresh scroll lease");
                } else {
                    debug!(rounds, "Scroll lease refreshed");
                }
            }

            // The cursor's page size is fixed once opened; the recommendation is informational
            let recommended = ctx.throttle.adaptive_batch_size().await;
            if recommended != ctx.batch_size {
                debug!(current = ctx.batch_size, recommended, "Throttle recommends a different batch size");
            }

            // One pause per round: the longer of the reclaim pause and the pressure delay
            if reclaiming {
                let delay = Duration::from_millis((self.config.pressure_delay_ms as f64 * pressure) as u64);
                sleep(self.config.reclaim_pause().max(delay)).await;
            } else if len > self.config.large_page_threshold {
                sleep(Duration::from_millis(self.config.large_page_delay_ms)).await;
            }

            let keep_alive = self.with_floor(Self::adaptive_keep_alive(report.processed, pressure));
            page = breaker
                .call(|| scroll_with_retry(ctx.source.as_ref(), &id, keep_alive, &ctx.retry))
                .await?;
            if let Some(next) = page.scroll_id.take() {
                *scroll_id = Some(next);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl CursorEngine for ScrollEngine {
    fn name(&self) -> &'static str {
        "scroll"
    }

    async fn run(&self, ctx: &TransferContext, processor: Arc<dyn PageProcessor>) -> Result<EngineReport> {
        let started = Instant::now();
        let mut report = EngineReport::new(self.name());
        let mut scroll_id = None;
        let cursor = CursorTracker::open(ctx, self.name()).await;

        let result = self
            .walk(ctx, processor.as_ref(), &cursor, &mut scroll_id, &mut report)
            .await;
        cursor.finish(&result, report.cancelled).await;

        if let Some(id) = scroll_id {
            match ctx.source.clear_scroll(&id).await {
                Ok(()) => debug!(task_id = %ctx.task_id, "Scroll context released"),
                Err(e) => warn!(task_id = %ctx.task_id, error = %e, "Failed to release scroll context"),
            }
        }

        let elapsed = started.elapsed();
        info!(
            task_id = %ctx.task_id,
            pages = report.pages,
            processed = report.processed,
            success = report.success,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Scroll finished"
        );

        result.map(|_| report)
    }
}
