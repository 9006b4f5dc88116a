//! Deterministic, pure logic shared by the fix and review paths.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod output_parser;
pub mod payload;
pub mod ranker;
pub mod refs;
pub mod report;
pub mod review_policy;
pub mod state_codec;
pub mod types;
