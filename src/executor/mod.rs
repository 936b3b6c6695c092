//! Step executor: runs one phase pass end to end.
//!
//! The executor owns the invariants that make phase execution safe to
//! repeat: short-circuit on an existing output, budget check before every
//! model call, idempotent usage commit keyed by the pass's step key, and
//! exactly-once output append via insert-or-ignore. Retry policy is
//! centralized here and applies to `Retryable` errors only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::compaction::{self, DependencyOutput};
use crate::config::RetryConfig;
use crate::dag::PhaseGraph;
use crate::errors::{FatalError, RetryableError, StepError};
use crate::ledger::{self, Decision, UsageLedger};
use crate::model::{ModelClient, ModelError, ModelRequest};
use crate::models::Run;
use crate::phases::{FIRST_PHASE, PhaseSpec};
use crate::store::DbHandle;
use crate::util::extract_json_object;

/// Exponential backoff with a cap, applied to retryable errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            cap: Duration::from_millis(config.cap_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay before retrying after `attempt` failures (attempt >= 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = (attempt - 1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }
}

/// Result of a successfully executed pass.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase: String,
    pub output: Value,
    pub context_truncated: bool,
    pub tokens_input: u64,
    pub tokens_output: u64,
    /// False when the output already existed and was returned as-is.
    pub fresh: bool,
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Phase produced (or already had) a persisted output.
    Output(PhaseOutcome),
    /// The first pass surfaced an ambiguity. Nothing was appended; the
    /// orchestrator records the question and pauses the run.
    NeedsClarification { question: String },
}

pub struct StepExecutor {
    db: DbHandle,
    ledger: UsageLedger,
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(
        db: DbHandle,
        ledger: UsageLedger,
        model: Arc<dyn ModelClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            ledger,
            model,
            retry,
        }
    }

    /// Execute one pass of `phase` for `run`. `second_pass` marks the
    /// post-clarification re-run of the first phase, which bills under its
    /// own step key and never asks again.
    pub async fn execute(
        &self,
        run: &Run,
        graph: &PhaseGraph,
        phase: &str,
        second_pass: bool,
    ) -> Result<StepOutcome, StepError> {
        let spec = graph
            .get(phase)
            .ok_or_else(|| RetryableError::Store(anyhow!("Phase {} not in catalog", phase)))?;

        // Short-circuit: a persisted output means this pass already ran to
        // completion once.
        if let Some(existing) = self.load_output(&run.id, phase).await? {
            debug!(run_id = %run.id, phase, "Phase output already persisted, skipping");
            return Ok(StepOutcome::Output(PhaseOutcome {
                phase: phase.to_string(),
                output: existing.output,
                context_truncated: existing.context_truncated,
                tokens_input: existing.tokens_input,
                tokens_output: existing.tokens_output,
                fresh: false,
            }));
        }

        let context = self.build_context(run, graph, spec).await?;

        // Budget gate precedes every model call.
        let estimate = context.estimated_tokens
            + compaction::estimate_tokens(&run.challenge)
            + compaction::estimate_tokens(spec.instruction)
            + spec.output_allowance;
        let decision = self
            .ledger
            .check_and_reserve(&run.account_id, estimate)
            .await
            .map_err(RetryableError::Store)?;
        if let Decision::Denied { reason, retry_after_secs } = decision {
            return Err(FatalError::BudgetExceeded {
                reason,
                retry_after_secs: Some(retry_after_secs),
            }
            .into());
        }

        let clarification = if second_pass {
            run.clarification_answer.clone()
        } else {
            None
        };
        let completion = self
            .invoke_with_retry(ModelRequest {
                run_id: run.id.clone(),
                phase: phase.to_string(),
                challenge: run.challenge.clone(),
                instruction: spec.instruction.to_string(),
                context: context.text.clone(),
                clarification,
                max_output_tokens: spec.output_allowance,
            })
            .await?;

        // Commit usage before parsing: tokens were spent even if the output
        // turns out malformed.
        let step_key = ledger::step_key(&run.id, phase, second_pass);
        self.commit_usage(&run.account_id, &step_key, completion.tokens_input, completion.tokens_output)
            .await?;

        let output = self.parse_completion(phase, &completion.text)?;

        let allow_clarification = phase == FIRST_PHASE && !second_pass && !run.clarification_asked;
        if allow_clarification {
            if let Some(question) = output.get("clarifying_question").and_then(Value::as_str) {
                if !question.trim().is_empty() {
                    info!(run_id = %run.id, phase, "Phase raised a clarifying question");
                    return Ok(StepOutcome::NeedsClarification {
                        question: question.to_string(),
                    });
                }
            }
        }
        self.validate_schema(spec, &output)?;

        let outcome = self
            .append_output(
                run,
                phase,
                output,
                context.truncated,
                completion.tokens_input,
                completion.tokens_output,
            )
            .await?;
        if outcome.fresh {
            info!(
                run_id = %run.id,
                phase,
                tokens_input = outcome.tokens_input,
                tokens_output = outcome.tokens_output,
                truncated = outcome.context_truncated,
                "Phase completed"
            );
        }
        Ok(StepOutcome::Output(outcome))
    }

    async fn load_output(
        &self,
        run_id: &str,
        phase: &str,
    ) -> Result<Option<crate::models::PhaseOutputRecord>, StepError> {
        let run_id = run_id.to_string();
        let phase = phase.to_string();
        self.db
            .call(move |db| db.get_phase_output(&run_id, &phase))
            .await
            .map_err(|e| RetryableError::Store(e).into())
    }

    /// Load dependency outputs and compact them into the phase's context
    /// budget. A missing dependency output means the scheduler slipped; it
    /// is treated as a transient store fault.
    async fn build_context(
        &self,
        run: &Run,
        graph: &PhaseGraph,
        spec: &PhaseSpec,
    ) -> Result<compaction::CompactedContext, StepError> {
        let mut records = Vec::with_capacity(spec.depends_on.len());
        for dep in spec.depends_on {
            let record = self.load_output(&run.id, dep).await?.ok_or_else(|| {
                RetryableError::Store(anyhow!(
                    "Dependency output {} missing for phase {}",
                    dep,
                    spec.name
                ))
            })?;
            records.push((*dep, record));
        }

        let distances = graph.dependency_distances(spec.name);
        let deps: Vec<DependencyOutput<'_>> = records
            .iter()
            .filter_map(|(name, record)| {
                graph.get(name).map(|dep_spec| DependencyOutput {
                    spec: dep_spec,
                    output: &record.output,
                    distance: distances.get(name).copied().unwrap_or(usize::MAX),
                })
            })
            .collect();

        Ok(compaction::compact(&deps, spec.context_budget))
    }

    async fn invoke_with_retry(
        &self,
        request: ModelRequest,
    ) -> Result<crate::model::ModelCompletion, StepError> {
        let mut attempt = 1u32;
        loop {
            match self.model.invoke(request.clone()).await {
                Ok(completion) => return Ok(completion),
                Err(ModelError::Refusal(detail)) => {
                    return Err(FatalError::ModelRefusal(detail).into());
                }
                Err(err) => {
                    let (retryable, hint) = match err {
                        ModelError::RateLimited { retry_after_secs } => (
                            RetryableError::RateLimited {
                                retry_after_secs: Some(retry_after_secs),
                            },
                            Some(Duration::from_secs(retry_after_secs)),
                        ),
                        ModelError::Timeout => (RetryableError::Timeout, None),
                        ModelError::Server(detail) => (RetryableError::ModelServer(detail), None),
                        ModelError::Refusal(_) => unreachable!("handled above"),
                    };
                    if attempt >= self.retry.max_attempts {
                        return Err(retryable.into());
                    }
                    let delay = hint.unwrap_or_else(|| self.retry.delay(attempt)).min(self.retry.cap);
                    warn!(
                        run_id = %request.run_id,
                        phase = %request.phase,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %retryable,
                        "Model invocation failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Usage commits must not be lost: store failures are retried with the
    /// same backoff, and exhaustion is fatal for the run.
    async fn commit_usage(
        &self,
        account_id: &str,
        step_key: &str,
        tokens_input: u64,
        tokens_output: u64,
    ) -> Result<(), StepError> {
        let mut attempt = 1u32;
        loop {
            match self
                .ledger
                .commit(account_id, step_key, tokens_input, tokens_output)
                .await
            {
                Ok(_) => return Ok(()),
                Err(source) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(FatalError::UsageCommitFailed {
                            step_key: step_key.to_string(),
                            source,
                        }
                        .into());
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(step_key, attempt, "Usage commit failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn parse_completion(&self, phase: &str, text: &str) -> Result<Value, StepError> {
        let raw = extract_json_object(text).ok_or_else(|| FatalError::MalformedOutput {
            phase: phase.to_string(),
            detail: "No JSON object in completion".to_string(),
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| FatalError::MalformedOutput {
            phase: phase.to_string(),
            detail: format!("Invalid JSON: {}", e),
        })?;
        if !value.is_object() {
            return Err(FatalError::MalformedOutput {
                phase: phase.to_string(),
                detail: "Completion is not a JSON object".to_string(),
            }
            .into());
        }
        Ok(value)
    }

    fn validate_schema(&self, spec: &PhaseSpec, output: &Value) -> Result<(), StepError> {
        let missing: Vec<&str> = spec
            .required_fields
            .iter()
            .filter(|field| output.get(**field).is_none())
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(FatalError::MalformedOutput {
                phase: spec.name.to_string(),
                detail: format!("Missing required fields: {}", missing.join(", ")),
            }
            .into());
        }
        Ok(())
    }

    /// Append the output exactly once. A lost insert race returns the row
    /// the winner wrote.
    async fn append_output(
        &self,
        run: &Run,
        phase: &str,
        output: Value,
        truncated: bool,
        tokens_input: u64,
        tokens_output: u64,
    ) -> Result<PhaseOutcome, StepError> {
        let mut attempt = 1u32;
        let inserted = loop {
            let run_id = run.id.clone();
            let phase_name = phase.to_string();
            let value = output.clone();
            let result = self
                .db
                .call(move |db| {
                    db.insert_phase_output(
                        &run_id,
                        &phase_name,
                        &value,
                        truncated,
                        tokens_input,
                        tokens_output,
                    )
                })
                .await;
            match result {
                Ok(inserted) => break inserted,
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(RetryableError::Store(e).into());
                    }
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
            }
        };

        if inserted {
            Ok(PhaseOutcome {
                phase: phase.to_string(),
                output,
                context_truncated: truncated,
                tokens_input,
                tokens_output,
                fresh: true,
            })
        } else {
            let existing = self.load_output(&run.id, phase).await?.ok_or_else(|| {
                RetryableError::Store(anyhow!("Phase output vanished after insert conflict"))
            })?;
            Ok(PhaseOutcome {
                phase: phase.to_string(),
                output: existing.output,
                context_truncated: existing.context_truncated,
                tokens_input: existing.tokens_input,
                tokens_output: existing.tokens_output,
                fresh: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::model::{ScriptedModel, ScriptedReply};
    use crate::models::{RunMode, RunStatus};
    use crate::phases::catalog;
    use crate::store::SparloDb;
    use serde_json::json;

    struct Fixture {
        db: DbHandle,
        model: Arc<ScriptedModel>,
        executor: StepExecutor,
        graph: PhaseGraph,
    }

    fn fixture(budget: BudgetConfig) -> Fixture {
        let db = DbHandle::new(SparloDb::new_in_memory().unwrap());
        let model = Arc::new(ScriptedModel::new());
        let ledger = UsageLedger::new(db.clone(), budget);
        let retry = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_attempts: 4,
        };
        let executor = StepExecutor::new(
            db.clone(),
            ledger,
            model.clone() as Arc<dyn ModelClient>,
            retry,
        );
        let graph = PhaseGraph::build(catalog(RunMode::Discovery)).unwrap();
        Fixture {
            db,
            model,
            executor,
            graph,
        }
    }

    async fn seed_run(db: &DbHandle) -> Run {
        let run = Run::new("acct", RunMode::Discovery, "Test challenge");
        let stored = run.clone();
        db.call(move |db| db.create_run(&stored, &[])).await.unwrap();
        run
    }

    fn framing_json() -> serde_json::Value {
        json!({
            "title": "T",
            "summary": "S",
            "key_questions": ["q1"]
        })
    }

    #[tokio::test]
    async fn test_happy_path_appends_output_and_bills() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model.push_json("framing", framing_json());

        let outcome = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap();
        match outcome {
            StepOutcome::Output(o) => {
                assert!(o.fresh);
                assert_eq!(o.output["title"], "T");
            }
            other => panic!("expected output, got {:?}", other),
        }

        let run_id = run.id.clone();
        let has_step = fx
            .db
            .call(move |db| db.has_usage_step(&format!("{}:framing", run_id)))
            .await
            .unwrap();
        assert!(has_step);
    }

    #[tokio::test]
    async fn test_request_carries_the_submitted_challenge() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model.push_json("framing", framing_json());

        fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap();

        let requests = fx.model.requests_for("framing");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].challenge, "Test challenge");
        assert!(requests[0].clarification.is_none());
    }

    #[tokio::test]
    async fn test_second_pass_carries_challenge_and_answer() {
        let fx = fixture(BudgetConfig::default());
        let mut run = seed_run(&fx.db).await;
        run.clarification_asked = true;
        run.clarification_answer = Some("Europe".to_string());
        fx.model.push_json("framing", framing_json());

        fx.executor.execute(&run, &fx.graph, "framing", true).await.unwrap();

        let requests = fx.model.requests_for("framing");
        assert_eq!(requests[0].challenge, "Test challenge");
        assert_eq!(requests[0].clarification.as_deref(), Some("Europe"));
    }

    #[tokio::test]
    async fn test_existing_output_short_circuits_model() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        let run_id = run.id.clone();
        fx.db
            .call(move |db| {
                db.insert_phase_output(&run_id, "framing", &json!({"title": "old"}), false, 10, 20)
                    .map(|_| ())
            })
            .await
            .unwrap();

        let outcome = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap();
        match outcome {
            StepOutcome::Output(o) => {
                assert!(!o.fresh);
                assert_eq!(o.output["title"], "old");
            }
            other => panic!("expected output, got {:?}", other),
        }
        assert_eq!(fx.model.invocation_count("framing"), 0);
    }

    #[tokio::test]
    async fn test_clarifying_question_is_not_appended() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model
            .push_json("framing", json!({"clarifying_question": "Which market?"}));

        let outcome = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap();
        match outcome {
            StepOutcome::NeedsClarification { question } => {
                assert_eq!(question, "Which market?");
            }
            other => panic!("expected clarification, got {:?}", other),
        }

        let run_id = run.id.clone();
        let stored = fx
            .db
            .call(move |db| db.get_phase_output(&run_id, "framing"))
            .await
            .unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_second_pass_ignores_second_question() {
        let fx = fixture(BudgetConfig::default());
        let mut run = seed_run(&fx.db).await;
        run.clarification_asked = true;
        run.clarification_answer = Some("Europe".to_string());
        // A renewed ambiguity signal alongside a valid schema is appended
        // anyway; the chain must terminate.
        fx.model.push_json(
            "framing",
            json!({
                "title": "T",
                "summary": "S",
                "key_questions": [],
                "clarifying_question": "Still unsure?"
            }),
        );

        let outcome = fx.executor.execute(&run, &fx.graph, "framing", true).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Output(o) if o.fresh));
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model
            .push_reply("framing", ScriptedReply::RateLimited { retry_after_secs: 0 });
        fx.model.push_reply("framing", ScriptedReply::Timeout);
        fx.model.push_json("framing", framing_json());

        let outcome = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Output(_)));
        assert_eq!(fx.model.invocation_count("framing"), 3);
    }

    #[tokio::test]
    async fn test_retries_exhaust_as_retryable() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model.push_reply("framing", ScriptedReply::Timeout);

        let err = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap_err();
        assert!(matches!(err, StepError::Retryable(RetryableError::Timeout)));
        assert_eq!(fx.model.invocation_count("framing"), 4);
    }

    #[tokio::test]
    async fn test_refusal_is_fatal_without_retry() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model
            .push_reply("framing", ScriptedReply::Refusal("no".to_string()));

        let err = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap_err();
        assert!(matches!(err, StepError::Fatal(FatalError::ModelRefusal(_))));
        assert_eq!(fx.model.invocation_count("framing"), 1);
    }

    #[tokio::test]
    async fn test_budget_denial_is_fatal_before_model_call() {
        let fx = fixture(BudgetConfig {
            tier_limit_tokens: 10,
            ..BudgetConfig::default()
        });
        let run = seed_run(&fx.db).await;
        fx.model.push_json("framing", framing_json());

        let err = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Fatal(FatalError::BudgetExceeded { .. })
        ));
        assert_eq!(fx.model.invocation_count("framing"), 0);
    }

    #[tokio::test]
    async fn test_malformed_output_is_fatal_but_billed() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model.push_text("framing", "not json at all");

        let err = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Fatal(FatalError::MalformedOutput { .. })
        ));

        let run_id = run.id.clone();
        let billed = fx
            .db
            .call(move |db| db.has_usage_step(&format!("{}:framing", run_id)))
            .await
            .unwrap();
        assert!(billed);
    }

    #[tokio::test]
    async fn test_missing_required_fields_is_fatal() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model.push_json("framing", json!({"title": "only"}));

        let err = fx.executor.execute(&run, &fx.graph, "framing", false).await.unwrap_err();
        match err {
            StepError::Fatal(FatalError::MalformedOutput { detail, .. }) => {
                assert!(detail.contains("summary"));
            }
            other => panic!("expected malformed output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_dependency_output_is_transient() {
        let fx = fixture(BudgetConfig::default());
        let run = seed_run(&fx.db).await;
        fx.model.push_json("scan", json!({"summary": "S", "findings": []}));

        let err = fx.executor.execute(&run, &fx.graph, "scan", false).await.unwrap_err();
        assert!(matches!(err, StepError::Retryable(RetryableError::Store(_))));
    }

    #[test]
    fn test_retry_policy_backoff_caps() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 4,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }
}
