use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Document body as stored in a cluster
pub type DocumentBody = Map<String, Value>;

/// Processing state of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Pending,
    Transforming,
    Transformed,
    Indexing,
    Indexed,
    Failed,
}

/// A unit of transfer: one document observed in a source page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,

    pub source: DocumentBody,

    /// Set once the transformer has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformed: Option<DocumentBody>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_states: HashMap<String, FieldStatus>,

    /// Sort values returned with the hit, used as a search-after cursor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, source: DocumentBody) -> Self {
        Self {
            id: id.into(),
            source,
            transformed: None,
            field_states: HashMap::new(),
            sort: Vec::new(),
        }
    }

    /// Build from a JSON object literal; non-objects yield an empty body
    pub fn from_value(id: impl Into<String>, value: Value) -> Self {
        let source = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, source)
    }

    pub fn with_sort(mut self, sort: Vec<Value>) -> Self {
        self.sort = sort;
        self
    }

    /// Body that should be written to the target
    pub fn output(&self) -> &DocumentBody {
        self.transformed.as_ref().unwrap_or(&self.source)
    }

    pub fn set_field_state(&mut self, field: &str, status: FieldStatus) {
        self.field_states.insert(field.to_string(), status);
    }

    /// Approximate in-memory size, used for queue accounting
    pub fn estimated_size(&self) -> u64 {
        let body: usize = self
            .source
            .iter()
            .map(|(k, v)| k.len() + value_size(v))
            .sum();
        (self.id.len() + body) as u64
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
    }
}
