//! Full-text search entry points.
//!
//! # Responsibility
//! - Parse the user query grammar into a safe FTS5 expression.
//! - Run ranked, filtered queries against the `capsules_fts` index.
//! - Render match context into bounded, escaped snippets.

pub mod fts;
pub mod query;
pub mod snippet;
