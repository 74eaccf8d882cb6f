// Retried search and scroll tests

use crate::unit::support::{fast_retry, seeded_source, SOURCE_INDEX};
use estransfer::store::search::MIN_PAGE_SIZE;
use estransfer::store::{
    scroll_with_retry, search_with_retry, DocumentStore, Query, SearchRequest, ID_FIELD,
};
use estransfer::error::retry::RetryConfig;
use estransfer::TransferError;
use std::time::{Duration, Instant};

#[cfg(test)]
mod search_tests {
    use super::*;

    fn request(size: usize) -> SearchRequest {
        SearchRequest::new(Query::MatchAll, size).sort_asc(ID_FIELD)
    }

    #[tokio::test]
    async fn test_plain_search_keeps_page_size() {
        let store = seeded_source(40).await;

        let outcome = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(25), &fast_retry())
            .await
            .unwrap();

        assert_eq!(outcome.page_size, 25);
        assert_eq!(outcome.page.len(), 25);
        assert_eq!(store.search_calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_failures_halve_page_size() {
        let store = seeded_source(40).await;
        store.fail_next_parses(3);

        let outcome = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(100), &fast_retry())
            .await
            .unwrap();

        // 100 -> 50 -> 25 -> 12
        assert_eq!(outcome.page_size, 12);
        assert_eq!(outcome.page.len(), 12);
        assert_eq!(store.search_calls(), 4);
    }

    #[tokio::test]
    async fn test_page_size_stops_at_minimum() {
        let store = seeded_source(40).await;
        store.fail_next_parses(2);

        let result = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(20), &fast_retry()).await;

        assert!(matches!(result, Err(TransferError::ResponseParse(_))));
        assert_eq!(store.search_calls(), 2);
        assert_eq!(MIN_PAGE_SIZE, 10);
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        let store = seeded_source(40).await;
        store.fail_next_searches(2);

        let outcome = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(30), &fast_retry())
            .await
            .unwrap();

        assert_eq!(outcome.page_size, 30);
        assert_eq!(outcome.page.len(), 30);
        assert_eq!(store.search_calls(), 3);
    }

    #[tokio::test]
    async fn test_connection_retries_back_off_exponentially() {
        let store = seeded_source(40).await;
        store.fail_next_searches(3);
        let retry = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 20,
            max_delay_ms: 1000,
            multiplier: 4.0,
            jitter: false,
        };

        let started = Instant::now();
        let outcome = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(30), &retry)
            .await
            .unwrap();

        assert_eq!(outcome.page.len(), 30);
        assert_eq!(store.search_calls(), 4);
        // 20 + 80 + 320 ms
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_connection_retries_exhausted() {
        let store = seeded_source(40).await;
        store.fail_next_searches(3);

        let result = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(30), &fast_retry()).await;

        assert!(matches!(result, Err(TransferError::Connection(_))));
        assert_eq!(store.search_calls(), 3);
    }

    #[tokio::test]
    async fn test_mixed_failures() {
        let store = seeded_source(40).await;
        store.fail_next_searches(1);
        store.fail_next_parses(1);

        let outcome = search_with_retry(store.as_ref(), SOURCE_INDEX, &request(40), &fast_retry())
            .await
            .unwrap();

        assert_eq!(outcome.page_size, 20);
        assert_eq!(store.search_calls(), 3);
    }

    #[tokio::test]
    async fn test_scroll_retries_transient_errors() {
        let store = seeded_source(30).await;
        let keep_alive = Duration::from_secs(60);
        let first = store
            .open_scroll(SOURCE_INDEX, &request(10), keep_alive)
            .await
            .unwrap();
        let scroll_id = first.scroll_id.unwrap();

        store.fail_next_searches(1);
        let page = scroll_with_retry(store.as_ref(), &scroll_id, keep_alive, &fast_retry())
            .await
            .unwrap();
        assert_eq!(page.len(), 10);

        store.fail_next_searches(3);
        let result = scroll_with_retry(store.as_ref(), &scroll_id, keep_alive, &fast_retry()).await;
        assert!(matches!(result, Err(TransferError::Connection(_))));
    }

    #[tokio::test]
    async fn test_unknown_scroll_is_not_retried() {
        let store = seeded_source(5).await;

        let result = scroll_with_retry(store.as_ref(), "nope", Duration::from_secs(1), &fast_retry()).await;

        assert!(matches!(result, Err(TransferError::NotFound(_))));
        assert_eq!(store.scroll_fetches(), 1);
    }
}
