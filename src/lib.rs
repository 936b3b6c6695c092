//! Sparlo: a durable multi-phase report generation engine.
//!
//! A run walks a mode-specific phase graph, invoking a model collaborator
//! per phase with compacted upstream context, metering every token through
//! an idempotent usage ledger, and pausing at most once for a human
//! clarification. All resume state lives in SQLite; the HTTP surface is an
//! axum API with an SSE event stream.

pub mod client;
pub mod compaction;
pub mod config;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod model;
pub mod models;
pub mod orchestrator;
pub mod phases;
pub mod server;
pub mod store;
pub mod util;
