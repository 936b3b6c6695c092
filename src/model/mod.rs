//! Model collaborator abstraction.
//!
//! The orchestrator only sees the `ModelClient` trait; the executor maps
//! `ModelError` into its own retry taxonomy. `ScriptedModel` is the
//! deterministic backend used by tests and `--dev` runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Input to one model invocation for a single phase pass.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub run_id: String,
    pub phase: String,
    /// The user's submitted challenge text. Present on every pass so each
    /// phase analyzes the original input, not just upstream summaries.
    pub challenge: String,
    /// The phase's instruction prompt.
    pub instruction: String,
    /// Compacted dependency context.
    pub context: String,
    /// User's clarification answer (or the skip directive), second pass only.
    pub clarification: Option<String>,
    pub max_output_tokens: u64,
}

/// Result of one model invocation. Token counts feed the usage ledger.
#[derive(Debug, Clone)]
pub struct ModelCompletion {
    pub text: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Model invocation timed out")]
    Timeout,
    #[error("Model server error: {0}")]
    Server(String),
    #[error("Model refused the request: {0}")]
    Refusal(String),
}

/// Backend trait the executor drives. Implementations must be safe to share
/// across concurrent phase executions.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelCompletion, ModelError>;
}

/// One scripted reply: either a completion body or an error to surface.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    RateLimited { retry_after_secs: u64 },
    Timeout,
    Server(String),
    Refusal(String),
}

/// Deterministic backend replaying canned responses per phase, in order.
/// Invocation counts are tracked so tests can assert retry and second-pass
/// behavior.
pub struct ScriptedModel {
    replies: Mutex<HashMap<String, Vec<ScriptedReply>>>,
    invocations: Mutex<HashMap<String, u64>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            invocations: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for `phase`. Replies are consumed front-to-back; the
    /// last reply is repeated once the queue would run dry.
    pub fn push_reply(&self, phase: &str, reply: ScriptedReply) {
        self.replies
            .lock()
            .expect("scripted replies lock poisoned")
            .entry(phase.to_string())
            .or_default()
            .push(reply);
    }

    pub fn push_text(&self, phase: &str, text: impl Into<String>) {
        self.push_reply(phase, ScriptedReply::Text(text.into()));
    }

    /// Queue a JSON object as the completion body.
    pub fn push_json(&self, phase: &str, value: serde_json::Value) {
        self.push_reply(phase, ScriptedReply::Text(value.to_string()));
    }

    /// Requests seen for `phase`, in invocation order.
    pub fn requests_for(&self, phase: &str) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .expect("scripted requests lock poisoned")
            .iter()
            .filter(|r| r.phase == phase)
            .cloned()
            .collect()
    }

    pub fn invocation_count(&self, phase: &str) -> u64 {
        self.invocations
            .lock()
            .expect("scripted invocations lock poisoned")
            .get(phase)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelCompletion, ModelError> {
        {
            let mut counts = self
                .invocations
                .lock()
                .expect("scripted invocations lock poisoned");
            *counts.entry(request.phase.clone()).or_insert(0) += 1;
        }
        self.requests
            .lock()
            .expect("scripted requests lock poisoned")
            .push(request.clone());

        let reply = {
            let mut replies = self.replies.lock().expect("scripted replies lock poisoned");
            let queue = replies.get_mut(&request.phase).ok_or_else(|| {
                ModelError::Server(format!("No scripted reply for phase '{}'", request.phase))
            })?;
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue
                    .first()
                    .cloned()
                    .ok_or_else(|| {
                        ModelError::Server(format!(
                            "Scripted replies exhausted for phase '{}'",
                            request.phase
                        ))
                    })?
            }
        };

        match reply {
            ScriptedReply::Text(text) => {
                // chars/4 mirrors the compactor's estimation heuristic.
                let tokens_input = ((request.instruction.chars().count()
                    + request.challenge.chars().count()
                    + request.context.chars().count()) as u64)
                    .div_ceil(4);
                let tokens_output = (text.chars().count() as u64).div_ceil(4);
                Ok(ModelCompletion {
                    text,
                    tokens_input,
                    tokens_output,
                })
            }
            ScriptedReply::RateLimited { retry_after_secs } => {
                Err(ModelError::RateLimited { retry_after_secs })
            }
            ScriptedReply::Timeout => Err(ModelError::Timeout),
            ScriptedReply::Server(detail) => Err(ModelError::Server(detail)),
            ScriptedReply::Refusal(detail) => Err(ModelError::Refusal(detail)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(phase: &str) -> ModelRequest {
        ModelRequest {
            run_id: "r1".to_string(),
            phase: phase.to_string(),
            challenge: "Evaluate the thing".to_string(),
            instruction: "Do the thing".to_string(),
            context: "context".to_string(),
            clarification: None,
            max_output_tokens: 1000,
        }
    }

    #[tokio::test]
    async fn test_replies_consumed_in_order_then_last_repeats() {
        let model = ScriptedModel::new();
        model.push_text("framing", "first");
        model.push_text("framing", "second");

        assert_eq!(model.invoke(request("framing")).await.unwrap().text, "first");
        assert_eq!(model.invoke(request("framing")).await.unwrap().text, "second");
        assert_eq!(model.invoke(request("framing")).await.unwrap().text, "second");
        assert_eq!(model.invocation_count("framing"), 3);
    }

    #[tokio::test]
    async fn test_error_replies_surface_as_model_errors() {
        let model = ScriptedModel::new();
        model.push_reply("framing", ScriptedReply::RateLimited { retry_after_secs: 7 });
        model.push_text("framing", "ok");

        match model.invoke(request("framing")).await {
            Err(ModelError::RateLimited { retry_after_secs: 7 }) => {}
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(model.invoke(request("framing")).await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_unscripted_phase_is_a_server_error() {
        let model = ScriptedModel::new();
        assert!(matches!(
            model.invoke(request("unknown")).await,
            Err(ModelError::Server(_))
        ));
    }
}
