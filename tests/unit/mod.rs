// Unit tests for es-transfer components
// These tests run against in-memory stores and need no running cluster


pub mod config;
pub mod recovery;
pub mod store;
