// Unit tests for config module
