use super::{DocumentStore, SearchPage, SearchRequest};
use crate::error::retry::{with_retry, RetryConfig, Retryable};
use crate::error::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Smallest page a parse failure can shrink to
pub const MIN_PAGE_SIZE: usize = 10;

/// Page returned by a retried search plus the page size that produced it
#[derive(Debug)]
pub struct SearchOutcome {
    pub page: SearchPage,
    pub page_size: usize,
}

/// Run `template` with a mutable page size.
///
/// Connection errors back off exponentially on the [`RetryConfig::delay_for`] schedule. A too-large or unparsable
/// response halves the page size, down to [`MIN_PAGE_SIZE`], and retries the same page.
pub async fn search_with_retry(
    store: &dyn DocumentStore,
    index: &str,
    template: &SearchRequest,
    retry: &RetryConfig,
) -> Result<SearchOutcome> {
    let mut page_size = template.size.max(1);
    let mut attempt = 0usize;

    loop {
        let request = template.with_size(page_size);
        match store.search(index, &request).await {
            Ok(page) => {
                if page_size != template.size {
                    debug!(index, page_size, requested = template.size, "Search succeeded with reduced page size");
                }
                return Ok(SearchOutcome { page, page_size });
            }
            Err(err) if err.is_response_parse() && page_size > MIN_PAGE_SIZE => {
                let reduced = (page_size / 2).max(MIN_PAGE_SIZE);
                warn!(
                    index,
                    from = page_size,
                    to = reduced,
                    error = %err,
                    "Search response rejected, shrinking page size"
                );
                page_size = reduced;
            }
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.delay_for(attempt);
                warn!(
                    index,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Search failed, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Continue a scroll with exponential backoff on transient errors
pub async fn scroll_with_retry(
    store: &dyn DocumentStore,
    scroll_id: &str,
    keep_alive: Duration,
    retry: &RetryConfig,
) -> Result<SearchPage> {
    with_retry(retry, "scroll", || store.scroll(scroll_id, keep_alive)).await
}
