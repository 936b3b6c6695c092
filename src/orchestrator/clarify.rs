//! Clarification flow derived from the persisted run.
//!
//! Nothing here is held in memory across triggers: the stage is a pure
//! function of the Run row, so a restarted server resumes the flow exactly
//! where the database left it.

use crate::models::{Run, RunStatus};

/// Canned answer injected when the user skips the clarification.
pub const SKIP_DIRECTIVE: &str =
    "Proceed with your best interpretation; no further input is coming.";

/// Where a run sits in the ask-at-most-once clarification flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClarifyStage {
    /// First phase has not asked anything (and may still ask).
    AwaitingFirstPhase,
    /// Question recorded, run paused for the answer.
    AwaitingClarification,
    /// Answer present, first phase owes its second pass.
    Resuming,
    /// Question was asked and the second pass produced an output (or the
    /// first pass never asked and completed). No further questions possible.
    PastClarification,
}

/// Derive the stage from the persisted run plus whether the first phase has
/// an appended output.
pub fn stage(run: &Run, first_phase_output_exists: bool) -> ClarifyStage {
    if first_phase_output_exists {
        return ClarifyStage::PastClarification;
    }
    if !run.clarification_asked {
        return ClarifyStage::AwaitingFirstPhase;
    }
    if run.clarification_answer.is_some() {
        ClarifyStage::Resuming
    } else {
        ClarifyStage::AwaitingClarification
    }
}

/// Whether a clarify request is acceptable for this run right now.
pub fn can_accept_answer(run: &Run) -> bool {
    run.status == RunStatus::AwaitingClarification
        && run.clarification_asked
        && run.clarification_answer.is_none()
}
