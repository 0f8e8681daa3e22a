//! AI Coding Tutor · Backend
//!
//! - Axum HTTP API under /api
//! - Optional Anthropic integration (via environment variables)
//! - Static SPA fallback (STATIC_DIR/index.html)
//!
//! See `config` for the full list of environment variables.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, instrument};

use aictutor_backend::config::AppConfig;
use aictutor_backend::routes::build_router;
use aictutor_backend::state::AppState;
use aictutor_backend::telemetry;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  let cfg = AppConfig::from_env();

  // Build shared application state (task source, LLM client, evaluator).
  let state = Arc::new(AppState::from_config(&cfg)?);

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state, &cfg.static_dir);

  let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
  let listener = TcpListener::bind(addr).await?;
  info!(target: "aictutor_backend", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "aictutor_backend", error = %e, "failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!(target: "aictutor_backend", "shutdown requested");
}
