use super::{
    value_to_millis, BulkItemResult, BulkResponse, DocumentStore, Query, SearchPage,
    SearchRequest, SortOrder, TimeBounds, ID_FIELD,
};
use crate::error::{Result, TransferError};
use crate::models::{Document, DocumentBody};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

struct ScrollContext {
    hits: Vec<Document>,
    position: usize,
    size: usize,
}

#[derive(Default)]
struct Counters {
    searches: AtomicU64,
    scroll_fetches: AtomicU64,
    scroll_extensions: AtomicU64,
    cleared_scrolls: AtomicU64,
    bulk_requests: AtomicU64,
    written: AtomicU64,
}

/// Ordered in-memory cluster with failure injection, used for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    name: String,
    indices: RwLock<HashMap<String, BTreeMap<String, DocumentBody>>>,
    scrolls: RwLock<HashMap<String, ScrollContext>>,
    next_scroll: AtomicU64,
    failing_ids: RwLock<HashSet<String>>,
    search_failures: AtomicUsize,
    parse_failures: AtomicUsize,
    bulk_failures: AtomicUsize,
    counters: Counters,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub async fn insert(&self, index: &str, id: impl Into<String>, body: DocumentBody) {
        self.indices
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .insert(id.into(), body);
    }

    /// Insert `Value::Object` bodies; other values become empty documents
    pub async fn insert_many(&self, index: &str, documents: impl IntoIterator<Item = (String, Value)>) {
        let mut indices = self.indices.write().await;
        let idx = indices.entry(index.to_string()).or_default();
        for (id, value) in documents {
            idx.insert(id.clone(), Document::from_value(id, value).source);
        }
    }

    pub async fn len(&self, index: &str) -> usize {
        self.indices.read().await.get(index).map(|i| i.len()).unwrap_or(0)
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<DocumentBody> {
        self.indices.read().await.get(index).and_then(|i| i.get(id).cloned())
    }

    pub async fn ids(&self, index: &str) -> Vec<String> {
        self.indices
            .read()
            .await
            .get(index)
            .map(|i| i.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Bulk items for these ids fail until cleared
    pub async fn fail_ids(&self, ids: impl IntoIterator<Item = String>) {
        self.failing_ids.write().await.extend(ids);
    }

    pub async fn clear_failures(&self) {
        self.failing_ids.write().await.clear();
        self.search_failures.store(0, Ordering::SeqCst);
        self.parse_failures.store(0, Ordering::SeqCst);
        self.bulk_failures.store(0, Ordering::SeqCst);
    }

    /// The next `n` search or scroll calls fail with a connection error
    pub fn fail_next_searches(&self, n: usize) {
        self.search_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` searches fail as if the response was too large
    pub fn fail_next_parses(&self, n: usize) {
        self.parse_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` bulk requests fail as a whole
    pub fn fail_next_bulks(&self, n: usize) {
        self.bulk_failures.store(n, Ordering::SeqCst);
    }

    pub fn search_calls(&self) -> u64 {
        self.counters.searches.load(Ordering::SeqCst)
    }

    /// Scroll round trips, including the opening search
    pub fn scroll_fetches(&self) -> u64 {
        self.counters.scroll_fetches.load(Ordering::SeqCst)
    }

    pub fn scroll_extensions(&self) -> u64 {
        self.counters.scroll_extensions.load(Ordering::SeqCst)
    }

    pub fn cleared_scrolls(&self) -> u64 {
        self.counters.cleared_scrolls.load(Ordering::SeqCst)
    }

    pub async fn open_scrolls(&self) -> usize {
        self.scrolls.read().await.len()
    }

    pub fn bulk_requests(&self) -> u64 {
        self.counters.bulk_requests.load(Ordering::SeqCst)
    }

    /// Successful item writes, counting overwrites
    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::SeqCst)
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_search_failures(&self) -> Result<()> {
        if Self::take_injected(&self.search_failures) {
            return Err(TransferError::Connection(format!(
                "{}: injected connection failure",
                self.name
            )));
        }
        if Self::take_injected(&self.parse_failures) {
            return Err(TransferError::ResponseParse(format!(
                "{}: injected response too large",
                self.name
            )));
        }
        Ok(())
    }

    /// All matching documents in request sort order, sort values attached
    async fn matching(&self, index: &str, request: &SearchRequest) -> Vec<Document> {
        let indices = self.indices.read().await;
        let Some(idx) = indices.get(index) else {
            return Vec::new();
        };

        let mut hits: Vec<Document> = idx
            .iter()
            .filter(|(id, body)| matches(&request.query, id, body))
            .map(|(id, body)| {
                let sort = request
                    .sort
                    .iter()
                    .map(|s| field_value(id, body, &s.field).unwrap_or(Value::Null))
                    .collect();
                Document::new(id.clone(), body.clone()).with_sort(sort)
            })
            .collect();

        if !request.sort.is_empty() {
            hits.sort_by(|a, b| compare_sort(&a.sort, &b.sort, request));
        }
        hits
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage> {
        self.counters.searches.fetch_add(1, Ordering::SeqCst);
        self.check_search_failures()?;

        let all = self.matching(index, request).await;
        let total = request.track_total_hits.then_some(all.len() as u64);

        let hits = all
            .into_iter()
            .filter(|doc| match &request.search_after {
                Some(after) => compare_sort(&doc.sort, after, request) == CmpOrdering::Greater,
                None => true,
            })
            .take(request.size)
            .collect();

        Ok(SearchPage {
            hits,
            total,
            scroll_id: None,
        })
    }

    async fn open_scroll(
        &self,
        index: &str,
        request: &SearchRequest,
        _keep_alive: Duration,
    ) -> Result<SearchPage> {
        self.counters.scroll_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_search_failures()?;

        let mut hits = self.matching(index, request).await;
        let total = hits.len() as u64;
        let first_len = request.size.min(hits.len());
        let first: Vec<Document> = hits.drain(..first_len).collect();

        let scroll_id = format!(
            "{}-scroll-{}",
            self.name,
            self.next_scroll.fetch_add(1, Ordering::SeqCst)
        );
        self.scrolls.write().await.insert(
            scroll_id.clone(),
            ScrollContext {
                hits,
                position: 0,
                size: request.size,
            },
        );
        debug!(store = %self.name, index, scroll_id = %scroll_id, total, "Opened scroll");

        Ok(SearchPage {
            hits: first,
            total: Some(total),
            scroll_id: Some(scroll_id),
        })
    }

    async fn scroll(&self, scroll_id: &str, _keep_alive: Duration) -> Result<SearchPage> {
        self.counters.scroll_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_search_failures()?;

        let mut scrolls = self.scrolls.write().await;
        let ctx = scrolls
            .get_mut(scroll_id)
            .ok_or_else(|| TransferError::NotFound(format!("scroll context {}", scroll_id)))?;

        let end = (ctx.position + ctx.size).min(ctx.hits.len());
        let hits = ctx.hits[ctx.position..end].to_vec();
        ctx.position = end;

        Ok(SearchPage {
            hits,
            total: None,
            scroll_id: Some(scroll_id.to_string()),
        })
    }

    async fn extend_scroll(&self, scroll_id: &str, _keep_alive: Duration) -> Result<()> {
        if !self.scrolls.read().await.contains_key(scroll_id) {
            return Err(TransferError::NotFound(format!("scroll context {}", scroll_id)));
        }
        self.counters.scroll_extensions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        if self.scrolls.write().await.remove(scroll_id).is_some() {
            self.counters.cleared_scrolls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<DocumentBody>> {
        Ok(self.document(index, id).await)
    }

    async fn get_many(&self, index: &str, ids: &[String]) -> Result<Vec<Document>> {
        self.check_search_failures()?;
        let indices = self.indices.read().await;
        let Some(idx) = indices.get(index) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| idx.get(id).map(|body| Document::new(id.clone(), body.clone())))
            .collect())
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<BulkResponse> {
        self.counters.bulk_requests.fetch_add(1, Ordering::SeqCst);
        if Self::take_injected(&self.bulk_failures) {
            return Err(TransferError::Connection(format!(
                "{}: injected bulk failure",
                self.name
            )));
        }

        let failing = self.failing_ids.read().await;
        let mut indices = self.indices.write().await;
        let idx = indices.entry(index.to_string()).or_default();

        let mut items = Vec::with_capacity(documents.len());
        for doc in documents {
            if failing.contains(&doc.id) {
                items.push(BulkItemResult {
                    id: doc.id.clone(),
                    success: false,
                    error: Some("mapper_parsing_exception: injected failure".to_string()),
                });
                continue;
            }
            idx.insert(doc.id.clone(), doc.output().clone());
            self.counters.written.fetch_add(1, Ordering::SeqCst);
            items.push(BulkItemResult {
                id: doc.id.clone(),
                success: true,
                error: None,
            });
        }

        Ok(BulkResponse { items, took_ms: 0 })
    }

    async fn count(&self, index: &str, query: &Query) -> Result<u64> {
        self.check_search_failures()?;
        let indices = self.indices.read().await;
        Ok(indices
            .get(index)
            .map(|idx| idx.iter().filter(|(id, body)| matches(query, id, body)).count() as u64)
            .unwrap_or(0))
    }

    async fn field_exists(&self, index: &str, field: &str) -> Result<bool> {
        Ok(self.count(index, &Query::exists(field)).await? > 0)
    }

    async fn time_bounds(&self, index: &str, field: &str) -> Result<Option<TimeBounds>> {
        let indices = self.indices.read().await;
        let Some(idx) = indices.get(index) else {
            return Ok(None);
        };

        let millis: Vec<i64> = idx
            .values()
            .filter_map(|body| body.get(field).and_then(value_to_millis))
            .collect();

        let (Some(min), Some(max)) = (millis.iter().min(), millis.iter().max()) else {
            return Ok(None);
        };
        match (
            Utc.timestamp_millis_opt(*min).single(),
            Utc.timestamp_millis_opt(*max).single(),
        ) {
            (Some(min), Some(max)) => Ok(Some(TimeBounds { min, max })),
            _ => Ok(None),
        }
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

fn field_value(id: &str, body: &DocumentBody, field: &str) -> Option<Value> {
    if field == ID_FIELD {
        Some(Value::String(id.to_string()))
    } else {
        body.get(field).filter(|v| !v.is_null()).cloned()
    }
}

fn matches(query: &Query, id: &str, body: &DocumentBody) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Exists { field } => field_value(id, body, field).is_some(),
        Query::Ids(ids) => ids.iter().any(|i| i == id),
        Query::And(clauses) => clauses.iter().all(|q| matches(q, id, body)),
        Query::Range { field, gt, gte, lt, lte } => {
            let Some(value) = field_value(id, body, field) else {
                return false;
            };
            let check = |bound: &Option<Value>, ok: fn(CmpOrdering) -> bool| {
                bound
                    .as_ref()
                    .map(|b| ok(compare_values(&value, b)))
                    .unwrap_or(true)
            };
            check(gt, |o| o == CmpOrdering::Greater)
                && check(gte, |o| o != CmpOrdering::Less)
                && check(lt, |o| o == CmpOrdering::Less)
                && check(lte, |o| o != CmpOrdering::Greater)
        }
    }
}

/// Numbers numerically, timestamps chronologically, other strings lexically
pub fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (chrono::DateTime::parse_from_rfc3339(x), chrono::DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        _ => match (value_to_millis(a), value_to_millis(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

fn compare_sort(a: &[Value], b: &[Value], request: &SearchRequest) -> CmpOrdering {
    for (i, sort) in request.sort.iter().enumerate() {
        let (Some(x), Some(y)) = (a.get(i), b.get(i)) else {
            break;
        };
        let ord = compare_values(x, y);
        let ord = match sort.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    CmpOrdering::Equal
}
