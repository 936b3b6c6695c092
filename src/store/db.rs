use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Current UTC timestamp in the format every table stores.
pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Async-safe handle to the engine database.
///
/// Wraps `SparloDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SparloDb>>,
}

impl DbHandle {
    pub fn new(db: SparloDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SparloDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Result of an idempotent usage commit: whether this call applied the
/// increment, plus the period totals after the call.
#[derive(Debug, Clone, Copy)]
pub struct CommitTotals {
    pub applied: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct SparloDb {
    conn: Connection,
}

impl SparloDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    account_id TEXT NOT NULL,
                    mode TEXT NOT NULL DEFAULT 'standard',
                    status TEXT NOT NULL DEFAULT 'queued',
                    current_phase TEXT,
                    clarification_asked INTEGER NOT NULL DEFAULT 0,
                    clarification_question TEXT,
                    clarification_answer TEXT,
                    challenge TEXT NOT NULL,
                    challenge_digest TEXT NOT NULL,
                    title TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phase_outputs (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    output TEXT NOT NULL,
                    context_truncated INTEGER NOT NULL DEFAULT 0,
                    tokens_input INTEGER NOT NULL DEFAULT 0,
                    tokens_output INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE(run_id, phase)
                );

                CREATE TABLE IF NOT EXISTS chat_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_attachments (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    filename TEXT NOT NULL,
                    media_type TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    position INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS usage_periods (
                    account_id TEXT NOT NULL,
                    period_start TEXT NOT NULL,
                    period_end TEXT NOT NULL,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    tier_limit INTEGER NOT NULL,
                    PRIMARY KEY(account_id, period_start)
                );

                CREATE TABLE IF NOT EXISTS usage_steps (
                    step_key TEXT PRIMARY KEY,
                    account_id TEXT NOT NULL,
                    period_start TEXT NOT NULL,
                    tokens_input INTEGER NOT NULL,
                    tokens_output INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_account ON runs(account_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_phase_outputs_run ON phase_outputs(run_id);
                CREATE INDEX IF NOT EXISTS idx_chat_run ON chat_messages(run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Run CRUD ──────────────────────────────────────────────────────

    pub fn create_run(&self, run: &Run, attachments: &[AttachmentMeta]) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, account_id, mode, status, current_phase,
                 clarification_asked, clarification_question, clarification_answer,
                 challenge, challenge_digest, title, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    run.id,
                    run.account_id,
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.current_phase,
                    run.clarification_asked as i64,
                    run.clarification_question,
                    run.clarification_answer,
                    run.challenge,
                    run.challenge_digest,
                    run.title,
                    run.error,
                    run.created_at,
                    run.updated_at,
                ],
            )
            .context("Failed to insert run")?;

        for (position, att) in attachments.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO run_attachments (run_id, filename, media_type, size_bytes, position)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        run.id,
                        att.filename,
                        att.media_type,
                        att.size_bytes as i64,
                        position as i64
                    ],
                )
                .context("Failed to insert attachment")?;
        }
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, account_id, mode, status, current_phase, clarification_asked,
                 clarification_question, clarification_answer, challenge, challenge_digest,
                 title, error, created_at, updated_at
                 FROM runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let row = stmt
            .query_row(params![id], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    mode: row.get(2)?,
                    status: row.get(3)?,
                    current_phase: row.get(4)?,
                    clarification_asked: row.get(5)?,
                    clarification_question: row.get(6)?,
                    clarification_answer: row.get(7)?,
                    challenge: row.get(8)?,
                    challenge_digest: row.get(9)?,
                    title: row.get(10)?,
                    error: row.get(11)?,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                })
            })
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Apply a status transition after validating it against the whitelist.
    /// An invalid transition — including any mutation of a terminal run —
    /// is an error, not a silent overwrite.
    pub fn update_run_status(&self, id: &str, to: RunStatus) -> Result<Run> {
        let run = self
            .get_run(id)?
            .with_context(|| format!("Run {} not found", id))?;
        if !is_valid_transition(&run.status, &to) {
            anyhow::bail!(
                "Invalid status transition {} -> {} for run {}",
                run.status,
                to,
                id
            );
        }
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), now_ts(), id],
            )
            .context("Failed to update run status")?;
        self.get_run(id)?
            .with_context(|| format!("Run {} not found after status update", id))
    }

    pub fn set_current_phase(&self, id: &str, phase: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET current_phase = ?1, updated_at = ?2 WHERE id = ?3",
                params![phase, now_ts(), id],
            )
            .context("Failed to set current phase")?;
        Ok(())
    }

    /// Record the clarification question and flip `clarification_asked` to
    /// true. The flag is write-once: no statement in this store ever sets it
    /// back to 0.
    pub fn record_clarification_question(&self, id: &str, question: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET clarification_asked = 1, clarification_question = ?1,
                 updated_at = ?2 WHERE id = ?3",
                params![question, now_ts(), id],
            )
            .context("Failed to record clarification question")?;
        Ok(())
    }

    pub fn set_clarification_answer(&self, id: &str, answer: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET clarification_answer = ?1, updated_at = ?2 WHERE id = ?3",
                params![answer, now_ts(), id],
            )
            .context("Failed to set clarification answer")?;
        Ok(())
    }

    pub fn set_title(&self, id: &str, title: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now_ts(), id],
            )
            .context("Failed to set run title")?;
        Ok(())
    }

    pub fn set_error(&self, id: &str, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now_ts(), id],
            )
            .context("Failed to set run error")?;
        Ok(())
    }

    /// Number of runs the account created at or after `since` (RFC 3339).
    pub fn count_runs_since(&self, account_id: &str, since: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE account_id = ?1 AND created_at >= ?2",
                params![account_id, since],
                |row| row.get(0),
            )
            .context("Failed to count runs")?;
        Ok(count as u64)
    }

    /// True if the account already submitted the same challenge digest at or
    /// after `since`. Used for duplicate-submission rejection.
    pub fn has_run_with_digest_since(
        &self,
        account_id: &str,
        digest: &str,
        since: &str,
    ) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM runs
                 WHERE account_id = ?1 AND challenge_digest = ?2 AND created_at >= ?3",
                params![account_id, digest, since],
                |row| row.get(0),
            )
            .context("Failed to check duplicate digest")?;
        Ok(count > 0)
    }

    // ── Phase outputs ─────────────────────────────────────────────────

    /// Append a phase output exactly once. Returns true when this call
    /// inserted the row, false when the `(run_id, phase)` key already
    /// existed — the at-least-once re-invocation case.
    pub fn insert_phase_output(
        &self,
        run_id: &str,
        phase: &str,
        output: &serde_json::Value,
        context_truncated: bool,
        tokens_input: u64,
        tokens_output: u64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO phase_outputs
                 (run_id, phase, output, context_truncated, tokens_input, tokens_output, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    phase,
                    output.to_string(),
                    context_truncated as i64,
                    tokens_input as i64,
                    tokens_output as i64,
                    now_ts(),
                ],
            )
            .context("Failed to insert phase output")?;
        Ok(changed == 1)
    }

    pub fn get_phase_output(&self, run_id: &str, phase: &str) -> Result<Option<PhaseOutputRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT phase, output, context_truncated, tokens_input, tokens_output, created_at
                 FROM phase_outputs WHERE run_id = ?1 AND phase = ?2",
            )
            .context("Failed to prepare get_phase_output")?;
        let row = stmt
            .query_row(params![run_id, phase], parse_output_row)
            .optional()
            .context("Failed to query phase output")?;
        row.map(|(phase, output, truncated, ti, to, created_at)| {
            Ok(PhaseOutputRecord {
                phase,
                output: serde_json::from_str(&output).context("Corrupt phase output JSON")?,
                context_truncated: truncated != 0,
                tokens_input: ti as u64,
                tokens_output: to as u64,
                created_at,
            })
        })
        .transpose()
    }

    pub fn list_phase_outputs(&self, run_id: &str) -> Result<Vec<PhaseOutputRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT phase, output, context_truncated, tokens_input, tokens_output, created_at
                 FROM phase_outputs WHERE run_id = ?1 ORDER BY created_at, phase",
            )
            .context("Failed to prepare list_phase_outputs")?;
        let rows = stmt
            .query_map(params![run_id], parse_output_row)
            .context("Failed to query phase outputs")?;
        let mut outputs = Vec::new();
        for row in rows {
            let (phase, output, truncated, ti, to, created_at) =
                row.context("Failed to read phase output row")?;
            outputs.push(PhaseOutputRecord {
                phase,
                output: serde_json::from_str(&output).context("Corrupt phase output JSON")?,
                context_truncated: truncated != 0,
                tokens_input: ti as u64,
                tokens_output: to as u64,
                created_at,
            });
        }
        Ok(outputs)
    }

    // ── Chat history ──────────────────────────────────────────────────

    pub fn append_chat(&self, run_id: &str, role: ChatRole, content: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO chat_messages (run_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, role.as_str(), content, now_ts()],
            )
            .context("Failed to append chat message")?;
        Ok(())
    }

    pub fn list_chat(&self, run_id: &str) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT role, content, created_at FROM chat_messages
                 WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_chat")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query chat messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let (role, content, created_at) = row.context("Failed to read chat row")?;
            messages.push(ChatMessage {
                role: ChatRole::from_str(&role).map_err(|e| anyhow::anyhow!(e))?,
                content,
                created_at,
            });
        }
        Ok(messages)
    }

    pub fn list_attachments(&self, run_id: &str) -> Result<Vec<AttachmentMeta>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT filename, media_type, size_bytes FROM run_attachments
                 WHERE run_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare list_attachments")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(AttachmentMeta {
                    filename: row.get(0)?,
                    media_type: row.get(1)?,
                    size_bytes: row.get::<_, i64>(2)? as u64,
                })
            })
            .context("Failed to query attachments")?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row.context("Failed to read attachment row")?);
        }
        Ok(attachments)
    }

    // ── Usage ledger rows ─────────────────────────────────────────────

    /// Read (or lazily create) the account's usage period, returning
    /// `(input_tokens, output_tokens, tier_limit)`.
    pub fn get_or_create_usage_period(
        &self,
        account_id: &str,
        period_start: &str,
        period_end: &str,
        tier_limit: u64,
    ) -> Result<(u64, u64, u64)> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO usage_periods
                 (account_id, period_start, period_end, input_tokens, output_tokens, tier_limit)
                 VALUES (?1, ?2, ?3, 0, 0, ?4)",
                params![account_id, period_start, period_end, tier_limit as i64],
            )
            .context("Failed to create usage period")?;
        let (input, output, limit): (i64, i64, i64) = self
            .conn
            .query_row(
                "SELECT input_tokens, output_tokens, tier_limit FROM usage_periods
                 WHERE account_id = ?1 AND period_start = ?2",
                params![account_id, period_start],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to read usage period")?;
        Ok((input as u64, output as u64, limit as u64))
    }

    /// Idempotent usage commit. The step row insert and the period total
    /// update run in one transaction keyed by the `usage_steps` primary key:
    /// a step key that already exists makes the whole call a no-op that
    /// returns the existing totals.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_usage_step(
        &self,
        step_key: &str,
        account_id: &str,
        period_start: &str,
        period_end: &str,
        tier_limit: u64,
        tokens_input: u64,
        tokens_output: u64,
    ) -> Result<CommitTotals> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin usage transaction")?;

        tx.execute(
            "INSERT OR IGNORE INTO usage_periods
             (account_id, period_start, period_end, input_tokens, output_tokens, tier_limit)
             VALUES (?1, ?2, ?3, 0, 0, ?4)",
            params![account_id, period_start, period_end, tier_limit as i64],
        )
        .context("Failed to ensure usage period")?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO usage_steps
                 (step_key, account_id, period_start, tokens_input, tokens_output, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    step_key,
                    account_id,
                    period_start,
                    tokens_input as i64,
                    tokens_output as i64,
                    now_ts(),
                ],
            )
            .context("Failed to insert usage step")?;

        if inserted == 1 {
            tx.execute(
                "UPDATE usage_periods
                 SET input_tokens = input_tokens + ?1, output_tokens = output_tokens + ?2
                 WHERE account_id = ?3 AND period_start = ?4",
                params![
                    tokens_input as i64,
                    tokens_output as i64,
                    account_id,
                    period_start
                ],
            )
            .context("Failed to update usage totals")?;
        }

        let (input, output): (i64, i64) = tx
            .query_row(
                "SELECT input_tokens, output_tokens FROM usage_periods
                 WHERE account_id = ?1 AND period_start = ?2",
                params![account_id, period_start],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to read usage totals")?;

        tx.commit().context("Failed to commit usage transaction")?;

        Ok(CommitTotals {
            applied: inserted == 1,
            input_tokens: input as u64,
            output_tokens: output as u64,
        })
    }

    pub fn has_usage_step(&self, step_key: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM usage_steps WHERE step_key = ?1",
                params![step_key],
                |row| row.get(0),
            )
            .context("Failed to check usage step")?;
        Ok(count > 0)
    }

    /// Direct statement execution, for tests that need to corrupt or seed
    /// state outside the public API.
    #[doc(hidden)]
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Raw statement failed")?;
        Ok(())
    }
}

type OutputRow = (String, String, i64, i64, i64, String);

fn parse_output_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutputRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

/// Raw row type holding TEXT columns before enum parsing.
struct RunRow {
    id: String,
    account_id: String,
    mode: String,
    status: String,
    current_phase: Option<String>,
    clarification_asked: i64,
    clarification_question: Option<String>,
    clarification_answer: Option<String>,
    challenge: String,
    challenge_digest: String,
    title: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            account_id: self.account_id,
            mode: RunMode::from_str(&self.mode).map_err(|e| anyhow::anyhow!(e))?,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            current_phase: self.current_phase,
            clarification_asked: self.clarification_asked != 0,
            clarification_question: self.clarification_question,
            clarification_answer: self.clarification_answer,
            challenge: self.challenge,
            challenge_digest: self.challenge_digest,
            title: self.title,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_run(id: &str, account: &str) -> Run {
        Run {
            id: id.to_string(),
            account_id: account.to_string(),
            mode: RunMode::Standard,
            status: RunStatus::Queued,
            current_phase: None,
            clarification_asked: false,
            clarification_question: None,
            clarification_answer: None,
            challenge: "Reduce thermal drift in the probe arm".to_string(),
            challenge_digest: format!("digest-{}", id),
            title: None,
            error: None,
            created_at: now_ts(),
            updated_at: now_ts(),
        }
    }

    #[test]
    fn test_run_roundtrip() {
        let db = SparloDb::new_in_memory().unwrap();
        db.create_run(&test_run("r1", "acct"), &[]).unwrap();

        let run = db.get_run("r1").unwrap().unwrap();
        assert_eq!(run.account_id, "acct");
        assert_eq!(run.mode, RunMode::Standard);
        assert_eq!(run.status, RunStatus::Queued);
        assert!(!run.clarification_asked);
        assert!(db.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn test_status_transition_whitelist_enforced() {
        let db = SparloDb::new_in_memory().unwrap();
        db.create_run(&test_run("r1", "acct"), &[]).unwrap();

        db.update_run_status("r1", RunStatus::Running).unwrap();
        db.update_run_status("r1", RunStatus::Completed).unwrap();

        // Terminal states are immutable.
        let err = db.update_run_status("r1", RunStatus::Running).unwrap_err();
        assert!(err.to_string().contains("Invalid status transition"));
        assert_eq!(db.get_run("r1").unwrap().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_phase_output_insert_is_exactly_once() {
        let db = SparloDb::new_in_memory().unwrap();
        db.create_run(&test_run("r1", "acct"), &[]).unwrap();

        let first = serde_json::json!({"summary": "first"});
        let second = serde_json::json!({"summary": "second"});
        assert!(db.insert_phase_output("r1", "framing", &first, false, 100, 200).unwrap());
        // Re-invocation does not overwrite.
        assert!(!db.insert_phase_output("r1", "framing", &second, false, 100, 200).unwrap());

        let stored = db.get_phase_output("r1", "framing").unwrap().unwrap();
        assert_eq!(stored.output["summary"], "first");
        assert_eq!(db.list_phase_outputs("r1").unwrap().len(), 1);
    }

    #[test]
    fn test_clarification_flag_is_write_once() {
        let db = SparloDb::new_in_memory().unwrap();
        db.create_run(&test_run("r1", "acct"), &[]).unwrap();

        db.record_clarification_question("r1", "Which alloy?").unwrap();
        let run = db.get_run("r1").unwrap().unwrap();
        assert!(run.clarification_asked);
        assert_eq!(run.clarification_question.as_deref(), Some("Which alloy?"));

        db.set_clarification_answer("r1", "6061 aluminum").unwrap();
        let run = db.get_run("r1").unwrap().unwrap();
        assert!(run.clarification_asked);
        assert_eq!(run.clarification_answer.as_deref(), Some("6061 aluminum"));
    }

    #[test]
    fn test_commit_usage_step_idempotent() {
        let db = SparloDb::new_in_memory().unwrap();

        let t1 = db
            .commit_usage_step("r1:framing", "acct", "2026-08-01", "2026-09-01", 1000, 100, 50)
            .unwrap();
        assert!(t1.applied);
        assert_eq!(t1.input_tokens, 100);
        assert_eq!(t1.output_tokens, 50);

        // Same key, different counts: no-op returning existing totals.
        let t2 = db
            .commit_usage_step("r1:framing", "acct", "2026-08-01", "2026-09-01", 1000, 999, 999)
            .unwrap();
        assert!(!t2.applied);
        assert_eq!(t2.input_tokens, 100);
        assert_eq!(t2.output_tokens, 50);

        // A different step key accumulates.
        let t3 = db
            .commit_usage_step("r1:teaching", "acct", "2026-08-01", "2026-09-01", 1000, 30, 20)
            .unwrap();
        assert!(t3.applied);
        assert_eq!(t3.input_tokens, 130);
        assert_eq!(t3.output_tokens, 70);
    }

    #[test]
    fn test_chat_ordering_and_attachments() {
        let db = SparloDb::new_in_memory().unwrap();
        let attachments = vec![AttachmentMeta {
            filename: "drawing.pdf".into(),
            media_type: "application/pdf".into(),
            size_bytes: 1024,
        }];
        db.create_run(&test_run("r1", "acct"), &attachments).unwrap();

        db.append_chat("r1", ChatRole::User, "challenge text").unwrap();
        db.append_chat("r1", ChatRole::Assistant, "final report").unwrap();

        let chat = db.list_chat("r1").unwrap();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].role, ChatRole::User);
        assert_eq!(chat[1].content, "final report");

        let stored = db.list_attachments("r1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].filename, "drawing.pdf");
    }

    #[test]
    fn test_count_runs_since() {
        let db = SparloDb::new_in_memory().unwrap();
        db.create_run(&test_run("r1", "acct"), &[]).unwrap();
        db.create_run(&test_run("r2", "acct"), &[]).unwrap();
        db.create_run(&test_run("r3", "other"), &[]).unwrap();

        assert_eq!(db.count_runs_since("acct", "2000-01-01T00:00:00Z").unwrap(), 2);
        assert_eq!(db.count_runs_since("acct", "2999-01-01T00:00:00Z").unwrap(), 0);
    }
}
