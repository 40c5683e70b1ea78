//! realtalk gateway: serves one voice conversation per WebSocket connection.

mod state;
mod ws;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use realtalk_core::{spawn_stale_sweep, PerformanceMonitor, RealtalkConfig};
use state::{build_deps, AppState};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[realtalk-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RealtalkConfig::load().context("loading configuration")?;
    let monitor = PerformanceMonitor::global();
    let deps = build_deps(&config, monitor.clone());

    let sweep = spawn_stale_sweep(
        deps.llm.clone(),
        config.llm.stale_sweep_interval(),
        config.llm.stale_request_timeout(),
    );

    let app = build_app(AppState::new(deps, monitor.clone()), config.server.cors_permissive);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    tracing::info!("🎙️ realtalk gateway listening on {}", config.server.bind_addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown initiated (Ctrl+C received)");
        }
    }

    sweep.abort();
    monitor.shutdown();
    tracing::info!("✓ Graceful shutdown complete");
    Ok(())
}

fn build_app(state: AppState, cors_permissive: bool) -> Router {
    let cors = if cors_permissive {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// GET /health – liveness plus a metrics snapshot.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "llm_backend": state.deps.llm.backend_name(),
        "active_connections": state.active_connections(),
        "active_requests": state.deps.llm.active_requests(),
        "metrics": state.monitor.summary(),
    }))
}
