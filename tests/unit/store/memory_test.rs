// In-memory store and query model tests

use crate::unit::support::{base_time, doc_id, seed, seeded_source, timestamp, SOURCE_INDEX};
use chrono::Duration as ChronoDuration;
use estransfer::models::Document;
use estransfer::store::memory::compare_values;
use estransfer::store::{DocumentStore, MemoryStore, Query, SearchRequest, ID_FIELD};
use estransfer::TransferError;
use serde_json::json;
use std::cmp::Ordering;
use std::time::Duration;

#[cfg(test)]
mod memory_store_tests {
    use super::*;

    const KEEP_ALIVE: Duration = Duration::from_secs(60);

    #[test]
    fn test_and_flattens_and_drops_match_all() {
        assert_eq!(Query::MatchAll.and(Query::MatchAll), Query::MatchAll);
        assert_eq!(Query::MatchAll.and(Query::exists("a")), Query::exists("a"));

        let nested = Query::exists("a")
            .and(Query::exists("b"))
            .and(Query::exists("c"));
        assert_eq!(
            nested,
            Query::And(vec![Query::exists("a"), Query::exists("b"), Query::exists("c")])
        );
    }

    #[test]
    fn test_query_dsl() {
        assert_eq!(Query::MatchAll.to_es(), json!({ "match_all": {} }));
        assert_eq!(
            Query::between("ts", json!(1), json!(5)).to_es(),
            json!({ "range": { "ts": { "gte": 1, "lt": 5 } } })
        );
        assert_eq!(
            Query::greater_than("ts", json!("x")).to_es(),
            json!({ "range": { "ts": { "gt": "x" } } })
        );
        assert_eq!(
            Query::Ids(vec!["a".into()]).to_es(),
            json!({ "ids": { "values": ["a"] } })
        );
        assert_eq!(
            Query::exists("a").and(Query::at_least("n", json!(3))).to_es(),
            json!({ "bool": { "must": [
                { "exists": { "field": "a" } },
                { "range": { "n": { "gte": 3 } } }
            ] } })
        );
    }

    #[test]
    fn test_search_request_body() {
        let request = SearchRequest::new(Query::MatchAll, 50)
            .sort_asc(ID_FIELD)
            .after(vec![json!("doc-00009")])
            .with_total();
        let body = request.to_es();

        assert_eq!(body["size"], json!(50));
        assert_eq!(body["track_total_hits"], json!(true));
        assert_eq!(body["sort"], json!([{ "_id": { "order": "asc" } }]));
        assert_eq!(body["search_after"], json!(["doc-00009"]));

        let smaller = request.with_size(10);
        assert_eq!(smaller.size, 10);
        assert_eq!(smaller.search_after, request.search_after);
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2.5)), Ordering::Equal);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(
            compare_values(&json!("2024-01-01T10:00:00Z"), &json!("2024-01-01T09:00:00+00:00")),
            Ordering::Greater
        );
        assert_eq!(compare_values(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(1), &json!(null)), Ordering::Greater);
    }

    #[tokio::test]
    async fn test_search_after_walks_ids_in_order() {
        let store = seeded_source(25).await;
        let request = SearchRequest::new(Query::MatchAll, 10).sort_asc(ID_FIELD).with_total();

        let first = store.search(SOURCE_INDEX, &request).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first.total, Some(25));
        assert_eq!(first.hits[0].id, doc_id(0));
        assert_eq!(first.hits[9].sort, vec![json!(doc_id(9))]);

        let next = request.after(first.hits[9].sort.clone());
        let second = store.search(SOURCE_INDEX, &next).await.unwrap();
        assert_eq!(second.hits[0].id, doc_id(10));
        assert_eq!(second.total, Some(25));

        let last = store
            .search(SOURCE_INDEX, &next.with_size(100).after(vec![json!(doc_id(19))]))
            .await
            .unwrap();
        assert_eq!(last.len(), 5);
    }

    #[tokio::test]
    async fn test_range_and_count_on_timestamps() {
        let store = MemoryStore::new("source");
        seed(&store, 30, ChronoDuration::minutes(1)).await;

        let window = Query::between(
            "@timestamp",
            timestamp(base_time() + ChronoDuration::minutes(5)),
            timestamp(base_time() + ChronoDuration::minutes(15)),
        );
        assert_eq!(store.count(SOURCE_INDEX, &window).await.unwrap(), 10);
        assert_eq!(store.count(SOURCE_INDEX, &Query::MatchAll).await.unwrap(), 30);
        assert_eq!(store.count("missing", &Query::MatchAll).await.unwrap(), 0);

        let ids = Query::Ids(vec![doc_id(3), doc_id(4), "nope".into()]);
        assert_eq!(store.count(SOURCE_INDEX, &ids).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_field_exists_and_time_bounds() {
        let store = MemoryStore::new("source");
        seed(&store, 10, ChronoDuration::minutes(2)).await;

        assert!(store.field_exists(SOURCE_INDEX, "@timestamp").await.unwrap());
        assert!(!store.field_exists(SOURCE_INDEX, "absent").await.unwrap());

        let bounds = store.time_bounds(SOURCE_INDEX, "@timestamp").await.unwrap().unwrap();
        assert_eq!(bounds.min, base_time());
        assert_eq!(bounds.max, base_time() + ChronoDuration::minutes(18));

        assert!(store.time_bounds(SOURCE_INDEX, "absent").await.unwrap().is_none());
        assert!(store.time_bounds("missing", "@timestamp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scroll_lifecycle() {
        let store = seeded_source(25).await;
        let request = SearchRequest::new(Query::MatchAll, 10).sort_asc(ID_FIELD);

        let first = store.open_scroll(SOURCE_INDEX, &request, KEEP_ALIVE).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first.total, Some(25));
        let id = first.scroll_id.unwrap();

        assert_eq!(store.scroll(&id, KEEP_ALIVE).await.unwrap().len(), 10);
        store.extend_scroll(&id, KEEP_ALIVE).await.unwrap();
        assert_eq!(store.scroll(&id, KEEP_ALIVE).await.unwrap().len(), 5);
        assert!(store.scroll(&id, KEEP_ALIVE).await.unwrap().is_empty());

        assert_eq!(store.scroll_fetches(), 4);
        assert_eq!(store.scroll_extensions(), 1);

        store.clear_scroll(&id).await.unwrap();
        assert_eq!(store.cleared_scrolls(), 1);
        assert_eq!(store.open_scrolls().await, 0);

        let gone = store.scroll(&id, KEEP_ALIVE).await;
        assert!(matches!(gone, Err(TransferError::NotFound(_))));
        assert!(store.extend_scroll(&id, KEEP_ALIVE).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_search_failures_are_consumed() {
        let store = seeded_source(5).await;
        let request = SearchRequest::new(Query::MatchAll, 10);

        store.fail_next_searches(1);
        store.fail_next_parses(1);

        let first = store.search(SOURCE_INDEX, &request).await;
        assert!(matches!(first, Err(TransferError::Connection(_))));
        let second = store.search(SOURCE_INDEX, &request).await;
        assert!(second.unwrap_err().is_response_parse());
        assert_eq!(store.search(SOURCE_INDEX, &request).await.unwrap().len(), 5);
        assert_eq!(store.search_calls(), 3);
    }

    #[tokio::test]
    async fn test_point_reads() {
        let store = seeded_source(5).await;
        store.fail_next_searches(1);

        // Single gets ignore injected failures
        assert!(store.get(SOURCE_INDEX, &doc_id(1)).await.unwrap().is_some());
        assert!(store.get(SOURCE_INDEX, "nope").await.unwrap().is_none());

        let ids = vec![doc_id(4), "nope".to_string(), doc_id(0)];
        assert!(store.get_many(SOURCE_INDEX, &ids).await.is_err());

        let found = store.get_many(SOURCE_INDEX, &ids).await.unwrap();
        let found: Vec<String> = found.into_iter().map(|d| d.id).collect();
        assert_eq!(found, vec![doc_id(4), doc_id(0)]);
    }

    #[tokio::test]
    async fn test_bulk_index_reports_item_failures() {
        let store = MemoryStore::new("target");
        store.fail_ids(vec!["b".to_string()]).await;

        let docs = vec![
            Document::from_value("a", json!({ "v": 1 })),
            Document::from_value("b", json!({ "v": 2 })),
            Document::from_value("c", json!({ "v": 3 })),
        ];
        let response = store.bulk_index("idx", &docs).await.unwrap();

        assert!(response.has_failures());
        assert_eq!(response.success_count(), 2);
        let failures: Vec<_> = response.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "b");
        assert_eq!(store.ids("idx").await, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(store.written(), 2);

        // Overwrites count as writes too
        store.clear_failures().await;
        store.bulk_index("idx", &docs).await.unwrap();
        assert_eq!(store.written(), 5);
        assert_eq!(store.len("idx").await, 3);
        assert_eq!(store.bulk_requests(), 2);
    }

    #[tokio::test]
    async fn test_whole_bulk_failure() {
        let store = MemoryStore::new("target");
        store.fail_next_bulks(1);
        let docs = vec![Document::from_value("a", json!({}))];

        assert!(matches!(
            store.bulk_index("idx", &docs).await,
            Err(TransferError::Connection(_))
        ));
        assert!(store.bulk_index("idx", &docs).await.is_ok());
        assert_eq!(store.len("idx").await, 1);
    }
}
