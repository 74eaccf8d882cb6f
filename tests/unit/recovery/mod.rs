// Unit tests for recovery module
