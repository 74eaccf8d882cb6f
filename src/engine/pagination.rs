use super::{
    page_position, CursorEngine, CursorTracker, EngineReport, PageProcessor, TransferContext,
    SOURCE_SEARCH_BREAKER,
};
use crate::config::{PaginationConfig, PaginationMode};
use crate::error::Result;
use crate::store::{search_with_retry, time_value, Query, SearchOutcome, SearchRequest, ID_FIELD};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Fetch one page ordered by document id, strictly after `after`
pub(crate) async fn fetch_id_page(
    ctx: &TransferContext,
    page_size: usize,
    after: Option<&Vec<Value>>,
) -> Result<SearchOutcome> {
    let mut request = SearchRequest::new(ctx.query.clone(), page_size).sort_asc(ID_FIELD);
    if let Some(values) = after {
        request = request.after(values.clone());
    }
    let breaker = ctx.breakers.get(SOURCE_SEARCH_BREAKER).await;
    breaker
        .call(|| search_with_retry(ctx.source.as_ref(), &ctx.source_index, &request, &ctx.retry))
        .await
}

/// Human-readable cursor stored with each page
pub(crate) fn cursor_key(after: Option<&Vec<Value>>) -> String {
    match after {
        Some(values) => serde_json::to_string(values).unwrap_or_default(),
        None => "start".to_string(),
    }
}

/// Stateless paging: search-after by id, or by time windows when the index has a time field
pub struct PaginationEngine {
    config: PaginationConfig,
}

impl PaginationEngine {
    pub fn new(config: PaginationConfig) -> Self {
        Self { config }
    }

    async fn resolve_mode(&self, ctx: &TransferContext) -> Result<PaginationMode> {
        match self.config.mode {
            PaginationMode::IdBased => Ok(PaginationMode::IdBased),
            PaginationMode::TimeBased | PaginationMode::Hybrid => {
                let exists = ctx
                    .source
                    .field_exists(&ctx.source_index, &self.config.time_field)
                    .await?;
                if exists {
                    Ok(PaginationMode::TimeBased)
                } else {
                    info!(
                        field = %self.config.time_field,
                        "Time field not present in source index, paging by id"
                    );
                    Ok(PaginationMode::IdBased)
                }
            }
        }
    }

    async fn control_memory_pressure(&self, ctx: &TransferContext) {
        let memory = ctx.throttle.memory();
        let pressure = memory.pressure();
        if pressure > self.config.high_pressure {
            warn!(pressure, "High memory pressure during pagination, reclaiming");
            memory.reclaim("pagination");
            sleep(Duration::from_millis(self.config.high_pressure_pause_ms)).await;
        } else if pressure > self.config.moderate_pressure {
            sleep(Duration::from_millis(self.config.moderate_pressure_pause_ms)).await;
        }
    }

    fn log_progress(&self, ctx: &TransferContext, pages: u64, report: &EngineReport) {
        if pages % self.config.progress_log_every.max(1) == 0 {
            info!(
                task_id = %ctx.task_id,
                pages,
                processed = report.processed,
                success = report.success,
                failed = report.failed,
                "Pagination progress"
            );
        }
    }

    async fn run_by_id(
        &self,
        ctx: &TransferContext,
        processor: &dyn PageProcessor,
        cursor: &CursorTracker,
        report: &mut EngineReport,
    ) -> Result<()> {
        let page_size = self.config.effective_page_size();
        let mut after: Option<Vec<Value>> = None;
        let mut page_number = 0u64;

        loop {
            if ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = fetch_id_page(ctx, page_size, after.as_ref()).await?;
            let effective = outcome.page_size;
            let hits = outcome.page.hits;
            if hits.is_empty() {
                break;
            }

            page_number += 1;
            let len = hits.len();
            let position = page_position(&hits);
            let next_after = position.as_ref().map(|(_, values)| values.clone()).unwrap_or_default();
            crate::metrics::record_page_fetched("pagination");

            let result = processor
                .process_page(hits, page_number, Some(cursor_key(after.as_ref())))
                .await;
            if let Err(e) = &result {
                warn!(task_id = %ctx.task_id, page = page_number, error = %e, "Page failed");
            }
            report.record(len, &result);
            cursor.advance(position, len as u64).await;
            self.log_progress(ctx, page_number, report);

            after = Some(next_after);
            self.control_memory_pressure(ctx).await;

            if len < effective {
                break;
            }
        }

        Ok(())
    }

    async fn run_by_time(
        &self,
        ctx: &TransferContext,
        processor: &dyn PageProcessor,
        report: &mut EngineReport,
    ) -> Result<bool> {
        let field = self.config.time_field.as_str();
        let (start, end) = match ctx.time_slice {
            Some(slice) => (slice.start, slice.end),
            None => {
                let Some(bounds) = ctx.source.time_bounds(&ctx.source_index, field).await? else {
                    info!(field, "No time bounds available, paging by id");
                    return Ok(false);
                };
                (bounds.min, bounds.max + ChronoDuration::milliseconds(1))
            }
        };
        let overall = ctx
            .checkpoints
            .create_time_range_checkpoint(&ctx.task_id, start, end, field)
            .await;

        info!(task_id = %ctx.task_id, field, %start, %end, "Paging by time windows");

        let max_window = self.config.max_window_minutes.max(1);
        let mut window = self.config.window_minutes.clamp(1, max_window);
        let mut current = start;
        let mut page_number = 0u64;

        while current < end {
            if ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let window_end = (current + ChronoDuration::minutes(window)).min(end);
            match self
                .process_window(ctx, processor, current, window_end, &mut page_number, report)
                .await
            {
                Ok(0) => {
                    if window < max_window {
                        window = (window * 2).min(max_window);
                        debug!(window_minutes = window, "Empty window, widening");
                    }
                }
                Ok(docs) => debug!(%current, %window_end, docs, "Window done"),
                Err(e) => {
                    warn!(
                        task_id = %ctx.task_id,
                        %current,
                        %window_end,
                        error = %e,
                        "Window failed, recording it for recovery"
                    );
                    let failed = ctx
                        .checkpoints
                        .create_time_range_checkpoint(&ctx.task_id, current, window_end, field)
                        .await;
                    ctx.checkpoints.fail_checkpoint(&failed.id, &e.to_string()).await?;
                }
            }

            ctx.checkpoints
                .update_time_range_progress(&overall.id, window_end, 1)
                .await?;
            current = window_end;
            self.control_memory_pressure(ctx).await;
        }

        Ok(true)
    }

    /// Process one window; returns the number of documents seen
    async fn process_window(
        &self,
        ctx: &TransferContext,
        processor: &dyn PageProcessor,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        page_number: &mut u64,
        report: &mut EngineReport,
    ) -> Result<u64> {
        let field = self.config.time_field.as_str();
        let query = ctx.query.clone().and(Query::between(
            field,
            time_value(window_start),
            time_value(window_end),
        ));
        let base = SearchRequest::new(query, self.config.effective_page_size())
            .sort_asc(field)
            .sort_asc(ID_FIELD);
        let breaker = ctx.breakers.get(SOURCE_SEARCH_BREAKER).await;
        let window_key = time_value(window_start).as_str().unwrap_or_default().to_string();

        let mut after: Option<Vec<Value>> = None;
        let mut deep = 0u64;
        let mut seen = 0u64;

        loop {
            if deep > self.config.max_deep_pages {
                warn!(%window_start, deep, "Deep pagination cap reached for window");
                break;
            }

            let request = match &after {
                Some(values) => base.clone().after(values.clone()),
                None => base.clone(),
            };
            let outcome = breaker
                .call(|| search_with_retry(ctx.source.as_ref(), &ctx.source_index, &request, &ctx.retry))
                .await?;
            let effective = outcome.page_size;
            let hits = outcome.page.hits;
            if hits.is_empty() {
                break;
            }

            *page_number += 1;
            let len = hits.len();
            seen += len as u64;
            after = hits.last().map(|d| d.sort.clone());
            crate::metrics::record_page_fetched("pagination");

            let result = processor
                .process_page(hits, *page_number, Some(format!("{}#{}", window_key, deep)))
                .await;
            if let Err(e) = &result {
                warn!(task_id = %ctx.task_id, page = *page_number, error = %e, "Page failed");
            }
            report.record(len, &result);
            self.log_progress(ctx, *page_number, report);

            if len < effective {
                break;
            }
            deep += 1;
        }

        Ok(seen)
    }
}

#[async_trait]
impl CursorEngine for PaginationEngine {
    fn name(&self) -> &'static str {
        "pagination"
    }

    async fn run(&self, ctx: &TransferContext, processor: Arc<dyn PageProcessor>) -> Result<EngineReport> {
        let mut report = EngineReport::new(self.name());

        let handled_by_time = match self.resolve_mode(ctx).await? {
            PaginationMode::TimeBased => self.run_by_time(ctx, processor.as_ref(), &mut report).await?,
            _ => false,
        };
        if !handled_by_time {
            let cursor = CursorTracker::open(ctx, self.name()).await;
            let result = self
                .run_by_id(ctx, processor.as_ref(), &cursor, &mut report)
                .await;
            cursor.finish(&result, report.cancelled).await;
            result?;
        }

        info!(
            task_id = %ctx.task_id,
            pages = report.pages,
            processed = report.processed,
            success = report.success,
            failed = report.failed,
            cancelled = report.cancelled,
            "Pagination finished"
        );
        Ok(report)
    }
}
