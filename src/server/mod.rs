//! HTTP server wiring: router construction and startup.

pub mod api;
pub mod events;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::model::ModelClient;
use crate::orchestrator::RunOrchestrator;
use crate::store::{DbHandle, SparloDb};

use api::{AppState, SharedState};
use events::EventBus;

/// Build the application router over shared state.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Assemble the orchestrator and state for a given database handle. Used by
/// startup and by router-level tests with an in-memory store.
pub fn build_state(db: DbHandle, config: &Config, model: Arc<dyn ModelClient>) -> Result<SharedState> {
    let orchestrator = RunOrchestrator::new(db, config, model, EventBus::new())?;
    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
    }))
}

/// Start the HTTP server and block until shutdown.
pub async fn start_server(config: Config, model: Arc<dyn ModelClient>) -> Result<()> {
    config.ensure_directories()?;
    let db = SparloDb::new(&config.db_path()).context("Failed to initialize database")?;
    let state = build_state(DbHandle::new(db), &config, model)?;

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Sparlo server listening");
    println!("Sparlo running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedModel;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = DbHandle::new(SparloDb::new_in_memory().unwrap());
        let model = Arc::new(ScriptedModel::new());
        let state = build_state(db, &Config::default(), model).unwrap();
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/runs/nope/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
