// Unit tests for store module

pub mod memory_test;
pub mod search_test;
