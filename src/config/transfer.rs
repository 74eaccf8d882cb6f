use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Cursoring strategy chosen for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategy {
    Scroll,
    Pagination,
    Streaming,
    /// Pagination first, streaming when pagination fails outright
    Hybrid,
}

impl TransferStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStrategy::Scroll => "scroll",
            TransferStrategy::Pagination => "pagination",
            TransferStrategy::Streaming => "streaming",
            TransferStrategy::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for TransferStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scroll" => Ok(TransferStrategy::Scroll),
            "pagination" => Ok(TransferStrategy::Pagination),
            "streaming" => Ok(TransferStrategy::Streaming),
            "hybrid" => Ok(TransferStrategy::Hybrid),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    pub source_index: String,

    pub target_index: String,

    /// Documents per page / bulk request (1..=10000)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Scroll keep-alive and window timeout in minutes (1..=60)
    #[serde(default = "default_scroll_timeout")]
    pub scroll_timeout: u64,

    /// Worker count (1..=10)
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// source field -> target field; when non-empty only mapped fields are copied
    #[serde(default)]
    pub field_mapping: HashMap<String, String>,

    /// Fields added with a default value when absent from the document
    #[serde(default)]
    pub new_fields: HashMap<String, Value>,

    /// Fields whose string values are lowercased
    #[serde(default)]
    pub case_insensitive_fields: Vec<String>,

    #[serde(default)]
    pub include_fields: Vec<String>,

    #[serde(default)]
    pub exclude_fields: Vec<String>,

    /// Only transfer documents updated after the last completed run
    #[serde(default)]
    pub incremental: bool,

    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,

    /// Write target documents even when they already exist
    #[serde(default = "default_true")]
    pub overwrite_existing: bool,

    /// Bypass the strategy selector
    #[serde(default)]
    pub strategy: Option<TransferStrategy>,
}

impl TransferConfig {
    pub fn new(source_index: impl Into<String>, target_index: impl Into<String>) -> Self {
        Self {
            source_index: source_index.into(),
            target_index: target_index.into(),
            batch_size: default_batch_size(),
            scroll_timeout: default_scroll_timeout(),
            thread_count: default_thread_count(),
            field_mapping: HashMap::new(),
            new_fields: HashMap::new(),
            case_insensitive_fields: Vec::new(),
            include_fields: Vec::new(),
            exclude_fields: Vec::new(),
            incremental: false,
            timestamp_field: default_timestamp_field(),
            overwrite_existing: true,
            strategy: None,
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_scroll_timeout() -> u64 {
    5
}

fn default_thread_count() -> usize {
    1
}

fn default_timestamp_field() -> String {
    "updateTime".to_string()
}

fn default_true() -> bool {
    true
}
