// Document transformer tests

use estransfer::config::TransferConfig;
use estransfer::models::{Document, DocumentBody, FieldStatus};
use estransfer::pipeline::DocumentTransformer;
use serde_json::{json, Value};

#[cfg(test)]
mod transformer_tests {
    use super::*;

    fn body(value: Value) -> DocumentBody {
        Document::from_value("x", value).source
    }

    fn config() -> TransferConfig {
        TransferConfig::new("users", "users_v2")
    }

    #[test]
    fn test_passthrough_keeps_document() {
        let source = body(json!({ "name": "Alice", "age": 30 }));
        assert_eq!(DocumentTransformer::passthrough().transform_body(&source), source);
    }

    #[test]
    fn test_mapping_copies_only_mapped_fields() {
        let mut cfg = config();
        cfg.field_mapping.insert("user_name".to_string(), "username".to_string());
        cfg.field_mapping.insert("mail".to_string(), "email".to_string());
        let transformer = DocumentTransformer::new(&cfg);

        let out = transformer.transform_body(&body(json!({
            "user_name": "alice",
            "mail": "a@example.com",
            "unmapped": 1
        })));

        assert_eq!(out, body(json!({ "username": "alice", "email": "a@example.com" })));
    }

    #[test]
    fn test_new_fields_do_not_overwrite() {
        let mut cfg = config();
        cfg.new_fields.insert("migrated".to_string(), json!(true));
        cfg.new_fields.insert("version".to_string(), json!(2));
        let transformer = DocumentTransformer::new(&cfg);

        let out = transformer.transform_body(&body(json!({ "version": 1 })));
        assert_eq!(out, body(json!({ "version": 1, "migrated": true })));
    }

    #[test]
    fn test_case_folding_strings_and_arrays() {
        let mut cfg = config();
        cfg.case_insensitive_fields = vec!["email".to_string(), "tags".to_string(), "age".to_string()];
        let transformer = DocumentTransformer::new(&cfg);

        let out = transformer.transform_body(&body(json!({
            "email": "Alice@Example.COM",
            "tags": ["Red", ["Blue"], 3],
            "age": 30,
            "name": "Alice"
        })));

        assert_eq!(out["email"], json!("alice@example.com"));
        assert_eq!(out["tags"], json!(["red", ["blue"], 3]));
        assert_eq!(out["age"], json!(30));
        assert_eq!(out["name"], json!("Alice"));
    }

    #[test]
    fn test_case_folding_applies_to_mapped_name() {
        let mut cfg = config();
        cfg.field_mapping.insert("mail".to_string(), "email".to_string());
        cfg.case_insensitive_fields = vec!["email".to_string()];
        let transformer = DocumentTransformer::new(&cfg);

        let out = transformer.transform_body(&body(json!({ "mail": "Bob@Example.com" })));
        assert_eq!(out, body(json!({ "email": "bob@example.com" })));
    }

    #[test]
    fn test_exclude_then_include() {
        let mut cfg = config();
        cfg.exclude_fields = vec!["secret".to_string()];
        cfg.include_fields = vec!["name".to_string(), "secret".to_string()];
        let transformer = DocumentTransformer::new(&cfg);

        let out = transformer.transform_body(&body(json!({
            "name": "Alice",
            "secret": "hunter2",
            "age": 30
        })));
        assert_eq!(out, body(json!({ "name": "Alice" })));
    }

    #[test]
    fn test_include_matching_nothing_leaves_document() {
        let mut cfg = config();
        cfg.include_fields = vec!["missing".to_string()];
        let transformer = DocumentTransformer::new(&cfg);

        let source = body(json!({ "name": "Alice", "age": 30 }));
        assert_eq!(transformer.transform_body(&source), source);
    }

    #[test]
    fn test_transform_sets_output_and_field_states() {
        let mut cfg = config();
        cfg.case_insensitive_fields = vec!["email".to_string()];
        let transformer = DocumentTransformer::new(&cfg);

        let mut doc = Document::from_value("u-1", json!({ "email": "X@Y.Z", "name": "X" }));
        transformer.transform(&mut doc);

        assert_eq!(doc.source["email"], json!("X@Y.Z"));
        assert_eq!(doc.output()["email"], json!("x@y.z"));
        assert_eq!(doc.field_states.get("email"), Some(&FieldStatus::Transformed));
        assert_eq!(doc.field_states.len(), 2);
    }

    #[test]
    fn test_transform_field() {
        let mut cfg = config();
        cfg.field_mapping.insert("mail".to_string(), "email".to_string());
        cfg.field_mapping.insert("notes".to_string(), "internal".to_string());
        cfg.case_insensitive_fields = vec!["email".to_string()];
        cfg.exclude_fields = vec!["internal".to_string()];
        let transformer = DocumentTransformer::new(&cfg);

        assert_eq!(
            transformer.transform_field("mail", &json!("A@B.C")),
            Some(("email".to_string(), json!("a@b.c")))
        );
        assert_eq!(transformer.transform_field("notes", &json!("x")), None);
        assert_eq!(transformer.transform_field("unmapped", &json!("x")), None);
    }

    #[test]
    fn test_transform_field_without_mapping_keeps_name() {
        let transformer = DocumentTransformer::passthrough();
        assert_eq!(
            transformer.transform_field("title", &json!("Hello")),
            Some(("title".to_string(), json!("Hello")))
        );
    }

    #[test]
    fn test_tracked_fields_follow_mapping_or_case_folding() {
        assert!(DocumentTransformer::passthrough().tracked_fields().is_empty());

        let mut folded = config();
        folded.case_insensitive_fields = vec!["email".to_string(), "tags".to_string()];
        folded.exclude_fields = vec!["tags".to_string()];
        assert_eq!(DocumentTransformer::new(&folded).tracked_fields(), vec!["email".to_string()]);

        let mut mapped = config();
        mapped.field_mapping.insert("user_name".to_string(), "username".to_string());
        mapped.field_mapping.insert("mail".to_string(), "email".to_string());
        mapped.case_insensitive_fields = vec!["email".to_string()];
        assert_eq!(
            DocumentTransformer::new(&mapped).tracked_fields(),
            vec!["mail".to_string(), "user_name".to_string()]
        );
    }
}
