use crate::config::TransferConfig;
use crate::models::{Document, DocumentBody, FieldStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Reshapes source documents for the target index: rename, default, case-fold, filter
#[derive(Debug, Clone, Default)]
pub struct DocumentTransformer {
    field_mapping: HashMap<String, String>,
    new_fields: HashMap<String, Value>,
    case_insensitive: HashSet<String>,
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl DocumentTransformer {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            field_mapping: config.field_mapping.clone(),
            new_fields: config.new_fields.clone(),
            case_insensitive: config.case_insensitive_fields.iter().cloned().collect(),
            include: config.include_fields.iter().cloned().collect(),
            exclude: config.exclude_fields.iter().cloned().collect(),
        }
    }

    /// Identity transform
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn transform_body(&self, source: &DocumentBody) -> DocumentBody {
        let mut result = DocumentBody::new();

        if self.field_mapping.is_empty() {
            result = source.clone();
        } else {
            for (from, to) in &self.field_mapping {
                if let Some(value) = source.get(from) {
                    result.insert(to.clone(), value.clone());
                }
            }
        }

        for (field, default) in &self.new_fields {
            if !result.contains_key(field) {
                result.insert(field.clone(), default.clone());
            }
        }

        for field in &self.case_insensitive {
            if let Some(value) = result.get_mut(field) {
                fold_case(value);
            }
        }

        for field in &self.exclude {
            result.remove(field);
        }

        if !self.include.is_empty() {
            let filtered: DocumentBody = result
                .iter()
                .filter(|(k, _)| self.include.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            // An inclusion list that matches nothing leaves the document untouched
            if !filtered.is_empty() {
                result = filtered;
            }
        }

        result
    }

    /// Transform in place, recording field states
    pub fn transform(&self, document: &mut Document) {
        let transformed = self.transform_body(&document.source);
        for field in transformed.keys() {
            document.set_field_state(field, FieldStatus::Transformed);
        }
        trace!(doc_id = %document.id, fields = transformed.len(), "Transformed document");
        document.transformed = Some(transformed);
    }

    /// Source fields whose target value is renamed or case-folded
    pub fn tracked_fields(&self) -> Vec<String> {
        let candidates: Vec<&String> = if self.field_mapping.is_empty() {
            self.case_insensitive.iter().collect()
        } else {
            self.field_mapping.keys().collect()
        };
        let mut fields: Vec<String> = candidates
            .into_iter()
            .filter(|field| self.transform_field(field, &Value::Null).is_some())
            .cloned()
            .collect();
        fields.sort();
        fields
    }

    /// Transform one field; returns the target name and value, or None when the field is dropped
    pub fn transform_field(&self, field: &str, value: &Value) -> Option<(String, Value)> {
        let target = if self.field_mapping.is_empty() {
            field.to_string()
        } else {
            self.field_mapping.get(field)?.clone()
        };

        if self.exclude.contains(&target) {
            return None;
        }

        let mut value = value.clone();
        if self.case_insensitive.contains(&target) {
            fold_case(&mut value);
        }
        Some((target, value))
    }
}

fn fold_case(value: &mut Value) {
    match value {
        Value::String(s) => *s = s.to_lowercase(),
        Value::Array(items) => items.iter_mut().for_each(fold_case),
        _ => {}
    }
}
