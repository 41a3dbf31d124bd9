//! Integration tests with mock HTTP server

pub mod batching;
pub mod guardrails;
pub mod mock_server;
pub mod rule_processor;
