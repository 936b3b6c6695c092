//! The `serve` command: bring up the HTTP API.
//!
//! Ships with a scripted demo backend so the server is usable out of the
//! box; swap in a real model collaborator by constructing the server with a
//! different [`ModelClient`](sparlo::model::ModelClient).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use sparlo::config::Config;
use sparlo::model::{ModelClient, ScriptedModel};
use sparlo::models::RunMode;
use sparlo::phases;
use sparlo::server;

pub async fn cmd_serve(
    port: Option<u16>,
    host: Option<String>,
    data_dir: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let mut config = Config::load(data_dir)?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    if dev {
        config.dev_mode = true;
    }
    config.ensure_directories()?;

    let _guard = init_tracing(&config)?;
    server::start_server(config, demo_model()).await
}

/// Console logging filtered by `RUST_LOG`, plus JSON lines in a daily
/// rotated file under the data directory. The returned guard must stay
/// alive for the file writer to flush.
fn init_tracing(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "sparlo.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sparlo=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().json().with_writer(file_writer))
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

/// Scripted completions for every phase of every catalog. A scripted reply
/// repeats once its queue is drained, so one entry per phase name covers
/// arbitrarily many runs. Phase names shared across catalogs (e.g.
/// `evaluation`) get the union of their schemas.
pub fn demo_model() -> Arc<dyn ModelClient> {
    let model = ScriptedModel::new();

    let mut outputs: HashMap<&'static str, Map<String, Value>> = HashMap::new();
    for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
        for spec in phases::catalog(mode) {
            let fields = outputs.entry(spec.name).or_default();
            for field in spec.required_fields {
                fields
                    .entry(field.to_string())
                    .or_insert_with(|| demo_field(spec.name, field));
            }
        }
    }
    for (phase, fields) in outputs {
        model.push_json(phase, Value::Object(fields));
    }

    Arc::new(model)
}

fn demo_field(phase: &str, field: &str) -> Value {
    match field {
        "title" => json!("Demo analysis"),
        "summary" => json!(format!(
            "Canned {phase} summary produced by the demo backend."
        )),
        "verdict" => json!("Plausible, contingent on the canned assumptions holding."),
        "report_markdown" => json!(
            "# Demo report\n\nThis report was produced by the scripted demo backend. \
             Run the server against a real model collaborator for substantive analyses."
        ),
        _ => json!([format!("Canned {field} item from the demo backend")]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparlo::model::ModelRequest;

    fn request(phase: &str) -> ModelRequest {
        ModelRequest {
            run_id: "run-1".to_string(),
            phase: phase.to_string(),
            challenge: "test challenge".to_string(),
            instruction: "test".to_string(),
            context: String::new(),
            clarification: None,
            max_output_tokens: 1_000,
        }
    }

    #[tokio::test]
    async fn test_demo_model_covers_every_phase() {
        let model = demo_model();
        for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
            for spec in phases::catalog(mode) {
                let completion = model.invoke(request(spec.name)).await.unwrap();
                let output: Value = serde_json::from_str(&completion.text).unwrap();
                for field in spec.required_fields {
                    assert!(
                        output.get(*field).is_some(),
                        "{} demo output missing {}",
                        spec.name,
                        field
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_demo_model_report_is_markdown() {
        let model = demo_model();
        let completion = model.invoke(request("report")).await.unwrap();
        let output: Value = serde_json::from_str(&completion.text).unwrap();
        assert!(output["report_markdown"].as_str().unwrap().starts_with("# "));
    }
}
