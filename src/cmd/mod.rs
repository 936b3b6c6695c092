//! CLI command implementations.
//!
//! | Module   | Commands handled                                  |
//! |----------|---------------------------------------------------|
//! | `serve`  | `Serve`                                           |
//! | `client` | `Submit`, `Watch`, `Clarify`, `Status`, `Usage`   |
//! | `phases` | `Phases`                                          |

pub mod client;
pub mod phases;
pub mod serve;

pub use client::{cmd_clarify, cmd_status, cmd_submit, cmd_usage, cmd_watch};
pub use phases::cmd_phases;
pub use serve::cmd_serve;
