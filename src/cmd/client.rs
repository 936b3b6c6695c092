//! Client commands — `sparlo submit`, `watch`, `clarify`, `status`, `usage`.

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::json;

use sparlo::client::StatusWatcher;
use sparlo::models::{ChatRole, Run, RunDetail, RunStatus, RunStatusView, UsageSnapshot};

fn base_url(server: &str) -> String {
    server.trim_end_matches('/').to_string()
}

/// Surface the server's `{"error": ...}` body instead of a bare status code.
async fn checked(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body["error"].as_str().unwrap_or("Unknown server error");
    bail!("{} ({})", message, status)
}

pub async fn cmd_submit(server: &str, account: &str, mode: &str, challenge: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/runs", base_url(server)))
        .json(&json!({
            "account_id": account,
            "mode": mode,
            "challenge": challenge,
        }))
        .send()
        .await
        .context("Request failed")?;

    let run: Run = checked(response).await?.json().await.context("Invalid response body")?;

    println!("{} Run created: {}", style("✓").green(), style(&run.id).bold());
    println!("  Mode:   {}", run.mode);
    println!("  Status: {}", run.status);
    println!();
    println!("Follow it with: sparlo watch {}", run.id);
    Ok(())
}

pub async fn cmd_watch(server: &str, run_id: &str) -> Result<()> {
    let mut watcher = StatusWatcher::new(base_url(server), run_id);
    println!("Watching run {}...", style(run_id).bold());

    let view = watcher.watch().await?;
    print_status(&view);

    match view.status {
        RunStatus::AwaitingClarification => {
            println!();
            println!(
                "Answer with:  sparlo clarify {} --answer \"...\"",
                run_id
            );
            println!("Or skip with: sparlo clarify {} --skip", run_id);
        }
        RunStatus::Completed => {
            let detail: RunDetail = serde_json::from_value(watcher.fetch_detail().await?)
                .context("Invalid run detail")?;
            if let Some(report) = detail
                .chat_history
                .iter()
                .rev()
                .find(|m| m.role == ChatRole::Assistant)
            {
                println!();
                println!("{}", report.content);
            }
        }
        _ => {}
    }
    Ok(())
}

pub async fn cmd_clarify(
    server: &str,
    run_id: &str,
    answer: Option<&str>,
    skip: bool,
) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/runs/{}/clarify", base_url(server), run_id))
        .json(&json!({
            "answer": answer,
            "skip": skip,
        }))
        .send()
        .await
        .context("Request failed")?;
    checked(response).await?;

    if skip {
        println!("{} Skipped; the run resumes with its best interpretation.", style("✓").green());
    } else {
        println!("{} Answer recorded; the run is resuming.", style("✓").green());
    }
    cmd_watch(server, run_id).await
}

pub async fn cmd_status(server: &str, run_id: &str) -> Result<()> {
    let mut watcher = StatusWatcher::new(base_url(server), run_id);
    match watcher.poll_once().await {
        Some(view) => {
            print_status(&view);
            Ok(())
        }
        None => bail!("Could not fetch status for run {}", run_id),
    }
}

pub async fn cmd_usage(server: &str, account: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/api/accounts/{}/usage", base_url(server), account))
        .send()
        .await
        .context("Request failed")?;
    let usage: UsageSnapshot =
        checked(response).await?.json().await.context("Invalid response body")?;

    println!("{}", style(format!("Usage for {}", usage.account_id)).bold());
    println!("  Period:        {} → {}", usage.period_start, usage.period_end);
    println!("  Input tokens:  {}", usage.input_tokens);
    println!("  Output tokens: {}", usage.output_tokens);
    println!(
        "  Remaining:     {} of {}",
        style(usage.remaining).bold(),
        usage.tier_limit
    );
    println!("  Reports today: {}", usage.reports_today);
    Ok(())
}

fn print_status(view: &RunStatusView) {
    let status = match view.status {
        RunStatus::Completed => style(view.status.to_string()).green().bold(),
        RunStatus::Failed => style(view.status.to_string()).red().bold(),
        RunStatus::AwaitingClarification => style(view.status.to_string()).yellow().bold(),
        _ => style(view.status.to_string()).bold(),
    };
    println!("Status: {} ({}%)", status, view.progress);
    if let Some(title) = &view.title {
        println!("Title:  {}", title);
    }
    if let Some(phase) = &view.current_phase {
        println!("Phase:  {}", phase);
    }
    if let Some(question) = &view.clarification_question {
        println!();
        println!("{} {}", style("Clarification needed:").yellow().bold(), question);
    }
    if let Some(error) = &view.error {
        println!("{} {}", style("Error:").red().bold(), error);
    }
}
