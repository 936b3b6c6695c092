use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Analysis mode selected at run creation. Each mode maps to a distinct
/// phase catalog (see `crate::phases::catalog`), never to string dispatch
/// inside phase logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Standard,
    Discovery,
    DueDiligence,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Discovery => "discovery",
            Self::DueDiligence => "due_diligence",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "discovery" => Ok(Self::Discovery),
            "due_diligence" => Ok(Self::DueDiligence),
            _ => Err(format!("Invalid run mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingClarification,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "awaiting_clarification" => Ok(Self::AwaitingClarification),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Whitelist of legal status transitions. Terminal states have no outgoing
/// edges, so a Completed or Failed run can never regress.
pub fn is_valid_transition(from: &RunStatus, to: &RunStatus) -> bool {
    matches!(
        (from, to),
        (RunStatus::Queued, RunStatus::Running)
            | (RunStatus::Queued, RunStatus::Failed)
            | (RunStatus::Running, RunStatus::AwaitingClarification)
            | (RunStatus::Running, RunStatus::Completed)
            | (RunStatus::Running, RunStatus::Failed)
            | (RunStatus::AwaitingClarification, RunStatus::Running)
            | (RunStatus::AwaitingClarification, RunStatus::Failed)
    )
}

/// One user-initiated analysis request, persisted in the `runs` table.
/// Phase outputs and chat history live in their own tables and are joined
/// into `RunDetail` for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub account_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub clarification_asked: bool,
    pub clarification_question: Option<String>,
    pub clarification_answer: Option<String>,
    pub challenge: String,
    pub challenge_digest: String,
    pub title: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Run {
    /// A fresh Queued run for a submitted challenge.
    pub fn new(account_id: impl Into<String>, mode: RunMode, challenge: impl Into<String>) -> Self {
        let challenge = challenge.into();
        let digest = challenge_digest(&challenge);
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            mode,
            status: RunStatus::Queued,
            current_phase: None,
            clarification_asked: false,
            clarification_question: None,
            clarification_answer: None,
            challenge,
            challenge_digest: digest,
            title: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// sha256 hex of the submitted challenge text, for duplicate detection and
/// log correlation.
pub fn challenge_digest(challenge: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid chat role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: String,
}

/// Attachment metadata submitted with a run. Blob transport belongs to the
/// external storage collaborator; the engine only validates and records it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub media_type: String,
    pub size_bytes: u64,
}

/// One persisted phase output row. `UNIQUE(run_id, phase)` in the schema is
/// what makes the append exactly-once under retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutputRecord {
    pub phase: String,
    pub output: serde_json::Value,
    pub context_truncated: bool,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub created_at: String,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusView {
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub attachments: Vec<AttachmentMeta>,
    pub phase_outputs: Vec<PhaseOutputRecord>,
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub account_id: String,
    pub period_start: String,
    pub period_end: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tier_limit: u64,
    pub remaining: u64,
    pub reports_today: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_roundtrip() {
        for s in &["standard", "discovery", "due_diligence"] {
            let parsed: RunMode = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_run_status_roundtrip() {
        for s in &[
            "queued",
            "running",
            "awaiting_clarification",
            "completed",
            "failed",
        ] {
            let parsed: RunStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&RunStatus::AwaitingClarification).unwrap(),
            "\"awaiting_clarification\""
        );
        assert_eq!(
            serde_json::to_string(&RunMode::DueDiligence).unwrap(),
            "\"due_diligence\""
        );
        assert_eq!(serde_json::to_string(&ChatRole::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(&RunStatus::Queued, &RunStatus::Running));
        assert!(is_valid_transition(
            &RunStatus::Running,
            &RunStatus::AwaitingClarification
        ));
        assert!(is_valid_transition(
            &RunStatus::AwaitingClarification,
            &RunStatus::Running
        ));
        assert!(is_valid_transition(&RunStatus::Running, &RunStatus::Completed));
        assert!(is_valid_transition(&RunStatus::Running, &RunStatus::Failed));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_transitions() {
        for terminal in &[RunStatus::Completed, RunStatus::Failed] {
            for to in &[
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::AwaitingClarification,
                RunStatus::Completed,
                RunStatus::Failed,
            ] {
                assert!(!is_valid_transition(terminal, to));
            }
        }
    }

    #[test]
    fn test_no_regression_to_queued() {
        for from in &[
            RunStatus::Running,
            RunStatus::AwaitingClarification,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert!(!is_valid_transition(from, &RunStatus::Queued));
        }
    }
}
