//! Source / target cluster access.
//!
//! The engines only need cursoring, bulk writes, point reads and a few lookups, so both
//! clusters are driven through the same [`DocumentStore`] trait.

pub mod elasticsearch;
pub mod memory;
pub mod search;

pub use elasticsearch::ElasticsearchStore;
pub use memory::MemoryStore;
pub use search::{scroll_with_retry, search_with_retry, SearchOutcome};

use crate::error::Result;
use crate::models::{Document, DocumentBody};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Id pseudo-field usable in queries and sorts
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    MatchAll,
    Range {
        field: String,
        gt: Option<Value>,
        gte: Option<Value>,
        lt: Option<Value>,
        lte: Option<Value>,
    },
    Exists {
        field: String,
    },
    Ids(Vec<String>),
    /// Every clause must match
    And(Vec<Query>),
}

impl Query {
    /// `field` in [gte, lt)
    pub fn between(field: impl Into<String>, gte: Value, lt: Value) -> Self {
        Query::Range {
            field: field.into(),
            gt: None,
            gte: Some(gte),
            lt: Some(lt),
            lte: None,
        }
    }

    pub fn greater_than(field: impl Into<String>, gt: Value) -> Self {
        Query::Range {
            field: field.into(),
            gt: Some(gt),
            gte: None,
            lt: None,
            lte: None,
        }
    }

    pub fn at_least(field: impl Into<String>, gte: Value) -> Self {
        Query::Range {
            field: field.into(),
            gt: None,
            gte: Some(gte),
            lt: None,
            lte: None,
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Query::Exists { field: field.into() }
    }

    /// Conjunction, dropping match-all clauses
    pub fn and(self, other: Query) -> Query {
        let mut clauses = Vec::new();
        for q in [self, other] {
            match q {
                Query::MatchAll => {}
                Query::And(inner) => clauses.extend(inner),
                q => clauses.push(q),
            }
        }
        match clauses.len() {
            0 => Query::MatchAll,
            1 => clauses.remove(0),
            _ => Query::And(clauses),
        }
    }

    /// Elasticsearch query DSL
    pub fn to_es(&self) -> Value {
        match self {
            Query::MatchAll => json!({ "match_all": {} }),
            Query::Range { field, gt, gte, lt, lte } => {
                let mut bounds = serde_json::Map::new();
                for (op, v) in [("gt", gt), ("gte", gte), ("lt", lt), ("lte", lte)] {
                    if let Some(v) = v {
                        bounds.insert(op.to_string(), v.clone());
                    }
                }
                json!({ "range": { field.as_str(): Value::Object(bounds) } })
            }
            Query::Exists { field } => json!({ "exists": { "field": field } }),
            Query::Ids(ids) => json!({ "ids": { "values": ids } }),
            Query::And(clauses) => {
                let must: Vec<Value> = clauses.iter().map(Query::to_es).collect();
                json!({ "bool": { "must": must } })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

/// Immutable description of one search; page size is overridden per attempt by retry helpers
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Query,
    pub sort: Vec<SortField>,
    pub size: usize,
    pub search_after: Option<Vec<Value>>,
    pub track_total_hits: bool,
}

impl SearchRequest {
    pub fn new(query: Query, size: usize) -> Self {
        Self {
            query,
            sort: Vec::new(),
            size,
            search_after: None,
            track_total_hits: false,
        }
    }

    pub fn sort_asc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            order: SortOrder::Asc,
        });
        self
    }

    pub fn after(mut self, values: Vec<Value>) -> Self {
        self.search_after = Some(values);
        self
    }

    pub fn with_total(mut self) -> Self {
        self.track_total_hits = true;
        self
    }

    pub fn with_size(&self, size: usize) -> Self {
        let mut req = self.clone();
        req.size = size;
        req
    }

    pub fn to_es(&self) -> Value {
        let mut body = json!({
            "query": self.query.to_es(),
            "size": self.size,
            "track_total_hits": self.track_total_hits,
        });
        if !self.sort.is_empty() {
            let sort: Vec<Value> = self
                .sort
                .iter()
                .map(|s| json!({ s.field.as_str(): { "order": s.order } }))
                .collect();
            body["sort"] = Value::Array(sort);
        }
        if let Some(after) = &self.search_after {
            body["search_after"] = Value::Array(after.clone());
        }
        body
    }
}

/// One page of hits
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<Document>,
    pub total: Option<u64>,
    pub scroll_id: Option<String>,
}

impl SearchPage {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
    pub took_ms: u64,
}

impl BulkResponse {
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|i| !i.success)
    }

    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|i| i.success).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|i| !i.success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBounds {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Label used in logs
    fn name(&self) -> &str;

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage>;

    /// Run the first search of a server-side cursor
    async fn open_scroll(
        &self,
        index: &str,
        request: &SearchRequest,
        keep_alive: Duration,
    ) -> Result<SearchPage>;

    async fn scroll(&self, scroll_id: &str, keep_alive: Duration) -> Result<SearchPage>;

    /// Extend a cursor's lease without consuming a page
    async fn extend_scroll(&self, _scroll_id: &str, _keep_alive: Duration) -> Result<()> {
        Ok(())
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()>;

    async fn get(&self, index: &str, id: &str) -> Result<Option<DocumentBody>>;

    /// Point reads for many ids; missing ids are skipped
    async fn get_many(&self, index: &str, ids: &[String]) -> Result<Vec<Document>>;

    /// Index every document under its id, overwriting existing ones
    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<BulkResponse>;

    async fn count(&self, index: &str, query: &Query) -> Result<u64>;

    async fn field_exists(&self, index: &str, field: &str) -> Result<bool>;

    async fn time_bounds(&self, index: &str, field: &str) -> Result<Option<TimeBounds>>;

    async fn is_healthy(&self) -> bool;
}

/// Parse a stored timestamp: epoch millis or RFC 3339
pub fn value_to_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.parse::<i64>().ok()),
        _ => None,
    }
}

/// Timestamp as sent in range queries
pub fn time_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}
