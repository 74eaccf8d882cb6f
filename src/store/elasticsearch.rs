use super::{
    value_to_millis, BulkItemResult, BulkResponse, DocumentStore, Query, SearchPage,
    SearchRequest, TimeBounds,
};
use crate::config::ClusterConfig;
use crate::error::{Result, TransferError};
use crate::models::{Document, DocumentBody};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, Level};

const BODY_PREVIEW_LIMIT: usize = 2_000;

/// REST client for one Elasticsearch cluster
#[derive(Clone)]
pub struct ElasticsearchStore {
    name: String,
    base_url: Url,
    http: Client,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchStore {
    pub fn new(name: impl Into<String>, config: &ClusterConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| TransferError::Config(format!("invalid cluster url '{}': {}", config.url, e)))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| TransferError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            base_url,
            http,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransferError::Config(format!("cluster url '{}' cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<String> {
        let resp = self.authorize(request).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            return Ok(body);
        }

        let reason = Self::error_reason(&body);
        let (preview, truncated) = Self::truncate_body(&body);
        tracing::event!(
            Level::ERROR,
            store = %self.name,
            operation,
            http.status = %status,
            error.reason = ?reason,
            body.truncated = truncated,
            body.preview = preview,
            "cluster request failed"
        );

        let message = format!(
            "{} failed ({}): {}",
            operation,
            status.as_u16(),
            reason.unwrap_or(preview)
        );
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransferError::Connection(message),
            StatusCode::PAYLOAD_TOO_LARGE => TransferError::ResponseParse(message),
            StatusCode::NOT_FOUND => TransferError::NotFound(message),
            _ => TransferError::Store(message),
        })
    }

    async fn send_json(&self, operation: &str, request: RequestBuilder) -> Result<Value> {
        let body = self.send(operation, request).await?;
        serde_json::from_str(&body).map_err(|e| {
            TransferError::ResponseParse(format!("{}: invalid JSON response: {}", operation, e))
        })
    }

    fn error_reason(body: &str) -> Option<String> {
        let json: Value = serde_json::from_str(body).ok()?;
        let error = json.get("error")?;
        error
            .get("root_cause")
            .and_then(|rc| rc.as_array())
            .and_then(|causes| causes.first())
            .and_then(|c| c.get("reason"))
            .or_else(|| error.get("reason"))
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
    }

    fn truncate_body(body: &str) -> (String, bool) {
        if body.len() > BODY_PREVIEW_LIMIT {
            let mut cut = BODY_PREVIEW_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            (format!("{}...<truncated {} bytes>", &body[..cut], body.len() - cut), true)
        } else {
            (body.to_string(), false)
        }
    }

    fn keep_alive(duration: Duration) -> String {
        format!("{}s", duration.as_secs().max(1))
    }

    fn parse_page(json: &Value) -> Result<SearchPage> {
        let hits = json
            .get("hits")
            .ok_or_else(|| TransferError::ResponseParse("search response has no hits".to_string()))?;

        let total = match hits.get("total") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(obj) => obj.get("value").and_then(|v| v.as_u64()),
            None => None,
        };

        let mut documents = Vec::new();
        for hit in hits.get("hits").and_then(|h| h.as_array()).into_iter().flatten() {
            documents.push(Self::parse_hit(hit)?);
        }

        Ok(SearchPage {
            hits: documents,
            total,
            scroll_id: json
                .get("_scroll_id")
                .and_then(|s| s.as_str())
                .map(str::to_string),
        })
    }

    fn parse_hit(hit: &Value) -> Result<Document> {
        let id = hit
            .get("_id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| TransferError::ResponseParse("hit without _id".to_string()))?;
        let source = match hit.get("_source") {
            Some(Value::Object(map)) => map.clone(),
            _ => DocumentBody::new(),
        };
        let sort = hit
            .get("sort")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(Document::new(id, source).with_sort(sort))
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage> {
        let url = self.url(&[index, "_search"])?;
        let json = self
            .send_json("search", self.http.post(url).json(&request.to_es()))
            .await?;
        Self::parse_page(&json)
    }

    async fn open_scroll(
        &self,
        index: &str,
        request: &SearchRequest,
        keep_alive: Duration,
    ) -> Result<SearchPage> {
        let mut url = self.url(&[index, "_search"])?;
        url.query_pairs_mut()
            .append_pair("scroll", &Self::keep_alive(keep_alive));
        let json = self
            .send_json("open_scroll", self.http.post(url).json(&request.to_es()))
            .await?;
        let page = Self::parse_page(&json)?;
        debug!(store = %self.name, index, hits = page.len(), "Opened scroll");
        Ok(page)
    }

    async fn scroll(&self, scroll_id: &str, keep_alive: Duration) -> Result<SearchPage> {
        let url = self.url(&["_search", "scroll"])?;
        let body = json!({ "scroll": Self::keep_alive(keep_alive), "scroll_id": scroll_id });
        let json = self.send_json("scroll", self.http.post(url).json(&body)).await?;
        Self::parse_page(&json)
    }

    async fn extend_scroll(&self, _scroll_id: &str, keep_alive: Duration) -> Result<()> {
        // The REST API renews the lease on every scroll call; the next fetch carries keep_alive
        debug!(store = %self.name, keep_alive = %Self::keep_alive(keep_alive), "Scroll lease renewed on next fetch");
        Ok(())
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let url = self.url(&["_search", "scroll"])?;
        let body = json!({ "scroll_id": [scroll_id] });
        match self.send("clear_scroll", self.http.delete(url).json(&body)).await {
            Ok(_) | Err(TransferError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<DocumentBody>> {
        let url = self.url(&[index, "_doc", id])?;
        match self.send_json("get", self.http.get(url)).await {
            Ok(json) => {
                if json.get("found").and_then(|f| f.as_bool()) == Some(false) {
                    return Ok(None);
                }
                Ok(json.get("_source").and_then(|s| s.as_object()).cloned())
            }
            Err(TransferError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_many(&self, index: &str, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(&[index, "_mget"])?;
        let json = self
            .send_json("mget", self.http.post(url).json(&json!({ "ids": ids })))
            .await?;

        let mut documents = Vec::new();
        for doc in json.get("docs").and_then(|d| d.as_array()).into_iter().flatten() {
            if doc.get("found").and_then(|f| f.as_bool()) != Some(true) {
                continue;
            }
            documents.push(Self::parse_hit(doc)?);
        }
        Ok(documents)
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<BulkResponse> {
        if documents.is_empty() {
            return Ok(BulkResponse::default());
        }

        let mut body = String::new();
        for doc in documents {
            body.push_str(&serde_json::to_string(&json!({ "index": { "_index": index, "_id": doc.id } }))?);
            body.push('\n');
            body.push_str(&serde_json::to_string(doc.output())?);
            body.push('\n');
        }

        let url = self.url(&["_bulk"])?;
        let started = Instant::now();
        let request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let json = self.send_json("bulk", request).await?;
        crate::metrics::record_bulk_latency(index, started.elapsed());

        let mut items = Vec::with_capacity(documents.len());
        for item in json.get("items").and_then(|i| i.as_array()).into_iter().flatten() {
            let Some(action) = item.get("index") else {
                continue;
            };
            let id = action
                .get("_id")
                .and_then(|id| id.as_str())
                .unwrap_or_default()
                .to_string();
            let status = action.get("status").and_then(|s| s.as_u64()).unwrap_or(0);
            let error = action.get("error").map(|e| {
                e.get("reason")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            });
            items.push(BulkItemResult {
                id,
                success: error.is_none() && (200..300).contains(&status),
                error,
            });
        }

        if items.len() != documents.len() {
            return Err(TransferError::BulkWrite(format!(
                "bulk response has {} items for {} documents",
                items.len(),
                documents.len()
            )));
        }

        Ok(BulkResponse {
            items,
            took_ms: json.get("took").and_then(|t| t.as_u64()).unwrap_or(0),
        })
    }

    async fn count(&self, index: &str, query: &Query) -> Result<u64> {
        let url = self.url(&[index, "_count"])?;
        let json = self
            .send_json("count", self.http.post(url).json(&json!({ "query": query.to_es() })))
            .await?;
        json.get("count")
            .and_then(|c| c.as_u64())
            .ok_or_else(|| TransferError::ResponseParse("count response has no count".to_string()))
    }

    async fn field_exists(&self, index: &str, field: &str) -> Result<bool> {
        Ok(self.count(index, &Query::exists(field)).await? > 0)
    }

    async fn time_bounds(&self, index: &str, field: &str) -> Result<Option<TimeBounds>> {
        let url = self.url(&[index, "_search"])?;
        let body = json!({
            "size": 0,
            "aggs": {
                "min_time": { "min": { "field": field } },
                "max_time": { "max": { "field": field } },
            }
        });
        let json = self.send_json("time_bounds", self.http.post(url).json(&body)).await?;

        let bound = |name: &str| {
            json.get("aggregations")
                .and_then(|a| a.get(name))
                .and_then(|agg| agg.get("value"))
                .and_then(value_to_millis)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };

        Ok(match (bound("min_time"), bound("max_time")) {
            (Some(min), Some(max)) => Some(TimeBounds { min, max }),
            _ => None,
        })
    }

    async fn is_healthy(&self) -> bool {
        let Ok(url) = self.url(&["_cluster", "health"]) else {
            return false;
        };
        match self.send_json("health", self.http.get(url)).await {
            Ok(json) => {
                let status = json.get("status").and_then(|s| s.as_str()).unwrap_or("red");
                info!(store = %self.name, status, "Cluster health");
                status != "red"
            }
            Err(_) => false,
        }
    }
}
