//! Run orchestrator: lifecycle, wavefront scheduling, and the clarification
//! pause.
//!
//! The orchestrator is deliberately stateless between triggers: every
//! scheduling decision is recomputed from the persisted Run and its phase
//! outputs, so a crashed or restarted server resumes exactly where the
//! database says the run is. The only in-memory state is the claim registry
//! guaranteeing at most one active execution per run id.

pub mod clarify;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dag::PhaseGraph;
use crate::errors::{OrchestratorError, StepError};
use crate::executor::{PhaseOutcome, RetryPolicy, StepExecutor, StepOutcome};
use crate::ledger::{Decision, UsageLedger};
use crate::model::ModelClient;
use crate::models::{
    AttachmentMeta, ChatRole, Run, RunDetail, RunMode, RunStatus, RunStatusView, UsageSnapshot,
    challenge_digest,
};
use crate::phases::{FIRST_PHASE, REPORT_PHASE, catalog};
use crate::server::events::{EventBus, RunEvent};
use crate::store::DbHandle;

use clarify::{ClarifyStage, SKIP_DIRECTIVE};

pub const MAX_ATTACHMENTS: usize = 4;
pub const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;
pub const ALLOWED_MEDIA_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "image/png",
    "image/jpeg",
];
pub const MAX_CHALLENGE_CHARS: usize = 20_000;

/// Sanitized text for runs that died on exhausted transient errors.
const TRANSIENT_FAILURE_MESSAGE: &str =
    "The analysis hit a temporary problem and could not be completed. Please try again.";

#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub account_id: String,
    pub mode: RunMode,
    pub challenge: String,
    pub attachments: Vec<AttachmentMeta>,
}

/// How one scheduling iteration ended.
enum Advance {
    /// Recompute the wavefront and keep going.
    Continue,
    /// Run paused (clarification) or reached a terminal state.
    Stop,
}

pub struct RunOrchestrator {
    db: DbHandle,
    ledger: UsageLedger,
    executor: Arc<StepExecutor>,
    events: EventBus,
    graphs: HashMap<RunMode, Arc<PhaseGraph>>,
    /// Run ids with an active in-process execution. Claimed on trigger,
    /// released when the drive loop returns.
    active: DashMap<String, ()>,
    /// Global bound on concurrent model invocations.
    limiter: Arc<Semaphore>,
    cooldown_window_secs: u64,
}

impl RunOrchestrator {
    pub fn new(
        db: DbHandle,
        config: &Config,
        model: Arc<dyn ModelClient>,
        events: EventBus,
    ) -> Result<Self> {
        let ledger = UsageLedger::new(db.clone(), config.budget.clone());
        let executor = Arc::new(StepExecutor::new(
            db.clone(),
            ledger.clone(),
            model,
            RetryPolicy::from_config(&config.retry),
        ));

        let mut graphs = HashMap::new();
        for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
            let graph = PhaseGraph::build(catalog(mode))
                .with_context(|| format!("Invalid phase catalog for mode {}", mode))?;
            graphs.insert(mode, Arc::new(graph));
        }

        Ok(Self {
            db,
            ledger,
            executor,
            events,
            graphs,
            active: DashMap::new(),
            limiter: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            cooldown_window_secs: config.budget.cooldown_window_secs,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn graph(&self, mode: RunMode) -> Arc<PhaseGraph> {
        // All three catalogs were validated in new().
        Arc::clone(&self.graphs[&mode])
    }

    // ── Run creation ──────────────────────────────────────────────────

    /// Validate and persist a new Queued run. Does not start execution;
    /// callers follow up with `trigger`.
    pub async fn create_run(&self, req: CreateRunRequest) -> Result<Run, OrchestratorError> {
        let challenge = req.challenge.trim().to_string();
        if challenge.is_empty() {
            return Err(OrchestratorError::BadRequest(
                "Challenge text must not be empty".to_string(),
            ));
        }
        if challenge.chars().count() > MAX_CHALLENGE_CHARS {
            return Err(OrchestratorError::BadRequest(format!(
                "Challenge text exceeds {} characters",
                MAX_CHALLENGE_CHARS
            )));
        }
        validate_attachments(&req.attachments)?;

        match self
            .ledger
            .admit_run(&req.account_id)
            .await
            .map_err(OrchestratorError::Other)?
        {
            Decision::Allowed { .. } => {}
            Decision::Denied { reason, retry_after_secs } => {
                return Err(OrchestratorError::RateLimited {
                    reason,
                    retry_after_secs,
                });
            }
        }

        let digest = challenge_digest(&challenge);
        let window_start = (Utc::now() - Duration::seconds(self.cooldown_window_secs as i64))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let duplicate = {
            let account = req.account_id.clone();
            let digest = digest.clone();
            self.db
                .call(move |db| db.has_run_with_digest_since(&account, &digest, &window_start))
                .await
                .map_err(OrchestratorError::Other)?
        };
        if duplicate {
            return Err(OrchestratorError::BadRequest(
                "An identical challenge was submitted moments ago".to_string(),
            ));
        }

        let run = Run::new(req.account_id, req.mode, challenge);
        {
            let run = run.clone();
            let attachments = req.attachments.clone();
            self.db
                .call(move |db| {
                    db.create_run(&run, &attachments)?;
                    db.append_chat(&run.id, ChatRole::User, &run.challenge)
                })
                .await
                .map_err(OrchestratorError::Other)?;
        }
        info!(run_id = %run.id, mode = %run.mode, "Run created");
        Ok(run)
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Claim the run and drive it in the background. A second trigger while
    /// an execution is active is rejected; triggers for terminal runs are
    /// rejected too.
    pub async fn trigger(self: &Arc<Self>, run_id: &str) -> Result<(), OrchestratorError> {
        let run = self
            .load_run(run_id)
            .await
            .map_err(OrchestratorError::Other)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::BadRequest(format!(
                "Run {} already finished ({})",
                run_id, run.status
            )));
        }

        match self.active.entry(run_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyActive {
                    id: run_id.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        self.events.publish(RunEvent::RunStarted {
            run_id: run_id.to_string(),
        });

        let this = Arc::clone(self);
        let id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.drive(&id).await {
                error!(run_id = %id, error = ?err, "Run drive loop failed");
                if let Err(fail_err) = this
                    .fail_run(&id, "The analysis could not be completed due to an internal error.")
                    .await
                {
                    error!(run_id = %id, error = ?fail_err, "Could not mark run failed");
                }
            }
            this.active.remove(&id);
        });
        Ok(())
    }

    /// One scheduling loop over the persisted state. Returns when the run
    /// reaches a terminal state or suspends for clarification.
    async fn drive(&self, run_id: &str) -> Result<()> {
        loop {
            let run = self
                .load_run(run_id)
                .await?
                .ok_or_else(|| anyhow!("Run {} vanished mid-execution", run_id))?;
            if run.status.is_terminal() {
                return Ok(());
            }
            if run.status == RunStatus::Queued {
                self.set_status(run_id, RunStatus::Running).await?;
                continue;
            }

            let graph = self.graph(run.mode);
            let completed = self.completed_phases(run_id).await?;

            if graph.all_complete(&completed) {
                self.complete_run(&run, &graph).await?;
                return Ok(());
            }

            let advance = match clarify::stage(&run, completed.contains(FIRST_PHASE)) {
                ClarifyStage::AwaitingClarification => {
                    // Suspended. Status was already moved when the question
                    // was recorded; nothing to schedule.
                    return Ok(());
                }
                ClarifyStage::AwaitingFirstPhase => {
                    self.run_first_phase(&run, &graph, false).await?
                }
                ClarifyStage::Resuming => self.run_first_phase(&run, &graph, true).await?,
                ClarifyStage::PastClarification => {
                    let ready: Vec<String> = graph
                        .ready_phases(&completed)
                        .iter()
                        .map(|spec| spec.name.to_string())
                        .collect();
                    if ready.is_empty() {
                        // Outputs exist for every schedulable phase but the
                        // catalog is not complete: nothing can make progress.
                        return Err(anyhow!(
                            "Run {} has no ready phases but is not complete",
                            run_id
                        ));
                    }
                    self.run_wave(&run, &graph, ready).await?
                }
            };

            match advance {
                Advance::Continue => continue,
                Advance::Stop => return Ok(()),
            }
        }
    }

    /// Execute the opening phase, handling the clarification outcomes that
    /// only it can produce.
    async fn run_first_phase(
        &self,
        run: &Run,
        graph: &Arc<PhaseGraph>,
        second_pass: bool,
    ) -> Result<Advance> {
        self.mark_phase_started(run, FIRST_PHASE).await?;
        match self.executor.execute(run, graph, FIRST_PHASE, second_pass).await {
            Ok(StepOutcome::Output(outcome)) => {
                self.after_phase_success(run, graph, &outcome).await?;
                Ok(Advance::Continue)
            }
            Ok(StepOutcome::NeedsClarification { question }) => {
                {
                    let run_id = run.id.clone();
                    let q = question.clone();
                    self.db
                        .call(move |db| {
                            db.record_clarification_question(&run_id, &q)?;
                            db.append_chat(&run_id, ChatRole::Assistant, &q)
                        })
                        .await?;
                }
                self.set_status(&run.id, RunStatus::AwaitingClarification).await?;
                self.events.publish(RunEvent::ClarificationRequested {
                    run_id: run.id.clone(),
                    question,
                });
                info!(run_id = %run.id, "Run paused for clarification");
                Ok(Advance::Stop)
            }
            Err(err) => {
                self.handle_step_error(run, err).await?;
                Ok(Advance::Stop)
            }
        }
    }

    /// Execute one wavefront of ready phases concurrently, bounded by the
    /// orchestrator's semaphore.
    async fn run_wave(
        &self,
        run: &Run,
        graph: &Arc<PhaseGraph>,
        ready: Vec<String>,
    ) -> Result<Advance> {
        let mut set: JoinSet<(String, Result<StepOutcome, StepError>)> = JoinSet::new();
        for phase in ready {
            self.mark_phase_started(run, &phase).await?;
            let executor = Arc::clone(&self.executor);
            let limiter = Arc::clone(&self.limiter);
            let run = run.clone();
            let graph = Arc::clone(graph);
            set.spawn(async move {
                let permit = limiter.acquire_owned().await;
                if permit.is_err() {
                    return (
                        phase,
                        Err(StepError::Retryable(crate::errors::RetryableError::Store(
                            anyhow!("Execution limiter closed"),
                        ))),
                    );
                }
                let result = executor.execute(&run, &graph, &phase, false).await;
                (phase, result)
            });
        }

        let mut first_error: Option<StepError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(StepOutcome::Output(outcome)))) => {
                    self.after_phase_success(run, graph, &outcome).await?;
                }
                Ok((phase, Ok(StepOutcome::NeedsClarification { .. }))) => {
                    // Only the first pass of the opening phase can ask, and
                    // that pass never runs inside a wave.
                    warn!(run_id = %run.id, phase, "Unexpected clarification outcome in wave");
                }
                Ok((_, Err(err))) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(StepError::Retryable(
                            crate::errors::RetryableError::Store(anyhow!(
                                "Phase task panicked: {}",
                                join_err
                            )),
                        ));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            self.handle_step_error(run, err).await?;
            return Ok(Advance::Stop);
        }
        Ok(Advance::Continue)
    }

    async fn mark_phase_started(&self, run: &Run, phase: &str) -> Result<()> {
        {
            let run_id = run.id.clone();
            let phase = phase.to_string();
            self.db
                .call(move |db| db.set_current_phase(&run_id, &phase))
                .await?;
        }
        self.events.publish(RunEvent::PhaseStarted {
            run_id: run.id.clone(),
            phase: phase.to_string(),
        });
        Ok(())
    }

    async fn after_phase_success(
        &self,
        run: &Run,
        graph: &Arc<PhaseGraph>,
        outcome: &PhaseOutcome,
    ) -> Result<()> {
        if outcome.phase == FIRST_PHASE && run.title.is_none() {
            if let Some(title) = outcome.output.get("title").and_then(Value::as_str) {
                let run_id = run.id.clone();
                let title = title.to_string();
                self.db
                    .call(move |db| db.set_title(&run_id, &title))
                    .await?;
            }
        }

        let completed = self.completed_phases(&run.id).await?;
        self.events.publish(RunEvent::PhaseCompleted {
            run_id: run.id.clone(),
            phase: outcome.phase.clone(),
            progress: graph.progress(&completed),
            context_truncated: outcome.context_truncated,
        });
        Ok(())
    }

    /// Terminal success: append the report to chat history (best effort,
    /// reflected in the completion event's `saved` flag) and mark Completed.
    async fn complete_run(&self, run: &Run, graph: &Arc<PhaseGraph>) -> Result<()> {
        let report = {
            let run_id = run.id.clone();
            self.db
                .call(move |db| db.get_phase_output(&run_id, REPORT_PHASE))
                .await?
                .ok_or_else(|| anyhow!("Run {} complete without a report output", run.id))?
        };
        let report_text = report
            .output
            .get("report_markdown")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| report.output.to_string());

        let saved = {
            let run_id = run.id.clone();
            let text = report_text.clone();
            match self
                .db
                .call(move |db| db.append_chat(&run_id, ChatRole::Assistant, &text))
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    // The run still completes; the client learns the report
                    // did not reach chat history.
                    error!(run_id = %run.id, error = ?err, "Report chat append failed");
                    false
                }
            }
        };

        self.set_status(&run.id, RunStatus::Completed).await?;
        let completed = self.completed_phases(&run.id).await?;
        debug_assert!(graph.all_complete(&completed));
        self.events.publish(RunEvent::RunCompleted {
            run_id: run.id.clone(),
            saved,
        });
        info!(run_id = %run.id, saved, "Run completed");
        Ok(())
    }

    /// A step failed past its retries. Fatal errors surface their sanitized
    /// message; exhausted transient errors surface a generic one. Either
    /// way the run is Failed and completed outputs stay persisted.
    async fn handle_step_error(&self, run: &Run, err: StepError) -> Result<()> {
        let message = match &err {
            StepError::Fatal(fatal) => fatal.user_message(),
            StepError::Retryable(_) => TRANSIENT_FAILURE_MESSAGE.to_string(),
        };
        warn!(run_id = %run.id, error = ?err, "Run failed");
        self.fail_run(&run.id, &message).await
    }

    async fn fail_run(&self, run_id: &str, message: &str) -> Result<()> {
        let run = self
            .load_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("Run {} not found", run_id))?;
        if run.status.is_terminal() {
            return Ok(());
        }
        {
            let run_id = run_id.to_string();
            let message = message.to_string();
            self.db
                .call(move |db| {
                    db.set_error(&run_id, &message)?;
                    db.update_run_status(&run_id, RunStatus::Failed).map(|_| ())
                })
                .await?;
        }
        self.events.publish(RunEvent::StatusChanged {
            run_id: run_id.to_string(),
            status: RunStatus::Failed,
        });
        self.events.publish(RunEvent::RunFailed {
            run_id: run_id.to_string(),
            error: message.to_string(),
        });
        Ok(())
    }

    // ── Clarification ─────────────────────────────────────────────────

    /// Accept the user's clarification answer (or a skip, which injects the
    /// canned directive) and resume execution.
    pub async fn answer_clarification(
        self: &Arc<Self>,
        run_id: &str,
        answer: Option<String>,
    ) -> Result<Run, OrchestratorError> {
        let run = self
            .load_run(run_id)
            .await
            .map_err(OrchestratorError::Other)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })?;
        if !clarify::can_accept_answer(&run) {
            return Err(OrchestratorError::NotAwaitingClarification {
                id: run_id.to_string(),
            });
        }

        let answer = match answer {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => SKIP_DIRECTIVE.to_string(),
        };
        {
            let run_id = run_id.to_string();
            let answer = answer.clone();
            self.db
                .call(move |db| {
                    db.set_clarification_answer(&run_id, &answer)?;
                    db.append_chat(&run_id, ChatRole::User, &answer)
                })
                .await
                .map_err(OrchestratorError::Other)?;
        }
        self.set_status(run_id, RunStatus::Running)
            .await
            .map_err(OrchestratorError::Other)?;

        // A racing trigger already driving the run will pick the answer up
        // from the store.
        match self.trigger(run_id).await {
            Ok(()) | Err(OrchestratorError::AlreadyActive { .. }) => {}
            Err(err) => return Err(err),
        }

        self.load_run(run_id)
            .await
            .map_err(OrchestratorError::Other)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })
    }

    // ── Read side ─────────────────────────────────────────────────────

    pub async fn status_view(&self, run_id: &str) -> Result<RunStatusView, OrchestratorError> {
        let run = self
            .load_run(run_id)
            .await
            .map_err(OrchestratorError::Other)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })?;
        let graph = self.graph(run.mode);
        let completed = self
            .completed_phases(run_id)
            .await
            .map_err(OrchestratorError::Other)?;
        Ok(RunStatusView {
            status: run.status,
            current_phase: run.current_phase,
            progress: graph.progress(&completed),
            clarification_question: run.clarification_question,
            error: run.error,
            title: run.title,
        })
    }

    pub async fn run_detail(&self, run_id: &str) -> Result<RunDetail, OrchestratorError> {
        let run = self
            .load_run(run_id)
            .await
            .map_err(OrchestratorError::Other)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })?;
        let id = run_id.to_string();
        let (attachments, phase_outputs, chat_history) = self
            .db
            .call(move |db| {
                Ok((
                    db.list_attachments(&id)?,
                    db.list_phase_outputs(&id)?,
                    db.list_chat(&id)?,
                ))
            })
            .await
            .map_err(OrchestratorError::Other)?;
        Ok(RunDetail {
            run,
            attachments,
            phase_outputs,
            chat_history,
        })
    }

    pub async fn usage(&self, account_id: &str) -> Result<UsageSnapshot, OrchestratorError> {
        self.ledger
            .usage_snapshot(account_id)
            .await
            .map_err(OrchestratorError::Other)
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>> {
        let id = run_id.to_string();
        self.db.call(move |db| db.get_run(&id)).await
    }

    async fn completed_phases(&self, run_id: &str) -> Result<HashSet<String>> {
        let id = run_id.to_string();
        let outputs = self.db.call(move |db| db.list_phase_outputs(&id)).await?;
        Ok(outputs.into_iter().map(|o| o.phase).collect())
    }

    async fn set_status(&self, run_id: &str, to: RunStatus) -> Result<()> {
        {
            let id = run_id.to_string();
            self.db
                .call(move |db| db.update_run_status(&id, to).map(|_| ()))
                .await?;
        }
        self.events.publish(RunEvent::StatusChanged {
            run_id: run_id.to_string(),
            status: to,
        });
        Ok(())
    }
}

fn validate_attachments(attachments: &[AttachmentMeta]) -> Result<(), OrchestratorError> {
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(OrchestratorError::BadRequest(format!(
            "At most {} attachments are allowed",
            MAX_ATTACHMENTS
        )));
    }
    for attachment in attachments {
        if attachment.size_bytes > MAX_ATTACHMENT_BYTES {
            return Err(OrchestratorError::BadRequest(format!(
                "Attachment {} exceeds the {} MB limit",
                attachment.filename,
                MAX_ATTACHMENT_BYTES / (1024 * 1024)
            )));
        }
        if !ALLOWED_MEDIA_TYPES.contains(&attachment.media_type.as_str()) {
            return Err(OrchestratorError::BadRequest(format!(
                "Attachment media type {} is not allowed",
                attachment.media_type
            )));
        }
    }
    Ok(())
}
