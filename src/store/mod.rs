//! SQLite persistence for runs, phase outputs, chat history, and usage.

mod db;

pub use db::{CommitTotals, DbHandle, SparloDb};
