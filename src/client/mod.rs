//! Client-side sync: adaptive status polling with a circuit breaker.
//!
//! `SyncSession` is the pure state machine (interval backoff, consecutive
//! error counting, visibility suspend/resume); `StatusWatcher` drives it
//! over HTTP. Nothing here is persisted server-side.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::models::{RunStatus, RunStatusView};

pub const BASE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Consecutive errors after which polling stops until an explicit reset.
pub const CIRCUIT_THRESHOLD: u32 = 5;

/// Polling state for one watched run.
#[derive(Debug)]
pub struct SyncSession {
    interval: Duration,
    consecutive_errors: u32,
    circuit_open: bool,
    visible: bool,
    /// Set by `show()` so the next poll fires immediately.
    immediate: bool,
    last_status: Option<RunStatusView>,
}

impl SyncSession {
    pub fn new() -> Self {
        Self {
            interval: BASE_POLL_INTERVAL,
            consecutive_errors: 0,
            circuit_open: false,
            visible: true,
            immediate: true,
            last_status: None,
        }
    }

    /// Delay before the next poll, or None when polling is suspended
    /// (hidden or circuit open).
    pub fn next_poll(&mut self) -> Option<Duration> {
        if self.circuit_open || !self.visible {
            return None;
        }
        if self.immediate {
            self.immediate = false;
            return Some(Duration::ZERO);
        }
        Some(self.interval)
    }

    /// A successful poll resets the backoff and the error count.
    pub fn on_success(&mut self, view: RunStatusView) {
        self.interval = BASE_POLL_INTERVAL;
        self.consecutive_errors = 0;
        self.last_status = Some(view);
    }

    /// A failed poll doubles the interval (capped) and may open the
    /// circuit.
    pub fn on_error(&mut self) {
        self.consecutive_errors += 1;
        self.interval = (self.interval * 2).min(MAX_POLL_INTERVAL);
        if self.consecutive_errors >= CIRCUIT_THRESHOLD {
            self.circuit_open = true;
        }
    }

    /// Manual refresh: close the circuit and start over from the base
    /// interval.
    pub fn reset(&mut self) {
        self.circuit_open = false;
        self.consecutive_errors = 0;
        self.interval = BASE_POLL_INTERVAL;
        self.immediate = true;
    }

    /// Tab went to the background: suspend polling.
    pub fn hide(&mut self) {
        self.visible = false;
    }

    /// Tab is visible again: resume with an immediate poll.
    pub fn show(&mut self) {
        self.visible = true;
        self.immediate = true;
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn last_status(&self) -> Option<&RunStatusView> {
        self.last_status.as_ref()
    }
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a `SyncSession` against the server's status endpoint.
pub struct StatusWatcher {
    client: reqwest::Client,
    base_url: String,
    run_id: String,
    session: SyncSession,
}

impl StatusWatcher {
    pub fn new(base_url: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            run_id: run_id.into(),
            session: SyncSession::new(),
        }
    }

    pub fn session_mut(&mut self) -> &mut SyncSession {
        &mut self.session
    }

    /// One poll against the server, feeding the session.
    pub async fn poll_once(&mut self) -> Option<RunStatusView> {
        let url = format!("{}/api/runs/{}/status", self.base_url, self.run_id);
        let result = async {
            let response = self.client.get(&url).send().await?;
            let response = response.error_for_status()?;
            response.json::<RunStatusView>().await
        }
        .await;

        match result {
            Ok(view) => {
                debug!(run_id = %self.run_id, status = %view.status, "Status poll");
                self.session.on_success(view.clone());
                Some(view)
            }
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "Status poll failed");
                self.session.on_error();
                None
            }
        }
    }

    /// Poll until the run finishes or pauses for clarification. Fails if
    /// the circuit opens first.
    pub async fn watch(&mut self) -> Result<RunStatusView> {
        loop {
            let Some(delay) = self.session.next_poll() else {
                bail!(
                    "Polling stopped after {} consecutive errors; reset to retry",
                    self.session.consecutive_errors()
                );
            };
            tokio::time::sleep(delay).await;

            if let Some(view) = self.poll_once().await {
                if view.status.is_terminal() || view.status == RunStatus::AwaitingClarification {
                    return Ok(view);
                }
            }
        }
    }

    /// Full run detail, single shot.
    pub async fn fetch_detail(&self) -> Result<serde_json::Value> {
        let url = format!("{}/api/runs/{}", self.base_url, self.run_id);
        self.client
            .get(&url)
            .send()
            .await
            .context("Request failed")?
            .error_for_status()
            .context("Server rejected request")?
            .json()
            .await
            .context("Invalid response body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(status: RunStatus) -> RunStatusView {
        RunStatusView {
            status,
            current_phase: None,
            progress: 0,
            clarification_question: None,
            error: None,
            title: None,
        }
    }

    #[test]
    fn test_first_poll_is_immediate_then_base_interval() {
        let mut session = SyncSession::new();
        assert_eq!(session.next_poll(), Some(Duration::ZERO));
        assert_eq!(session.next_poll(), Some(BASE_POLL_INTERVAL));
    }

    #[test]
    fn test_backoff_doubles_on_error() {
        let mut session = SyncSession::new();
        let _ = session.next_poll();

        session.on_error();
        assert_eq!(session.next_poll(), Some(Duration::from_secs(4)));
        session.on_error();
        assert_eq!(session.next_poll(), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_backoff_caps_at_max_interval() {
        let mut session = SyncSession::new();
        let _ = session.next_poll();
        // 2 → 4 → 8 → 16 → 32 → 60 (cap), before the circuit opens at 5
        // errors; the interval itself never passes the cap.
        session.on_error();
        session.on_error();
        session.on_error();
        session.on_error();
        assert_eq!(session.interval, Duration::from_secs(32));
        session.on_error();
        assert_eq!(session.interval, Duration::from_secs(60));
        assert!(session.is_circuit_open());
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut session = SyncSession::new();
        session.on_error();
        session.on_error();
        session.on_success(view(RunStatus::Running));
        assert_eq!(session.consecutive_errors(), 0);
        let _ = session.next_poll();
        assert_eq!(session.next_poll(), Some(BASE_POLL_INTERVAL));
    }

    #[test]
    fn test_circuit_opens_after_five_errors_and_reset_closes_it() {
        let mut session = SyncSession::new();
        for _ in 0..CIRCUIT_THRESHOLD {
            session.on_error();
        }
        assert!(session.is_circuit_open());
        assert_eq!(session.next_poll(), None);

        session.reset();
        assert!(!session.is_circuit_open());
        assert_eq!(session.next_poll(), Some(Duration::ZERO));
        assert_eq!(session.next_poll(), Some(BASE_POLL_INTERVAL));
    }

    #[test]
    fn test_hide_suspends_show_resumes_immediately() {
        let mut session = SyncSession::new();
        let _ = session.next_poll();
        session.hide();
        assert_eq!(session.next_poll(), None);

        session.show();
        assert_eq!(session.next_poll(), Some(Duration::ZERO));
        assert_eq!(session.next_poll(), Some(BASE_POLL_INTERVAL));
    }

    #[test]
    fn test_last_status_tracked() {
        let mut session = SyncSession::new();
        assert!(session.last_status().is_none());
        session.on_success(view(RunStatus::Completed));
        assert_eq!(session.last_status().unwrap().status, RunStatus::Completed);
    }
}
