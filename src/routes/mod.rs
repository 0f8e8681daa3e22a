//! Router assembly: HTTP endpoints, static files, CORS, and HTTP tracing.

use std::{path::Path, sync::Arc};

use axum::{
  routing::{get, post},
  Router,
};
use tower_http::{
  cors::{Any, CorsLayer},
  services::{ServeDir, ServeFile},
  trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Endpoints, without static files or layers.
pub fn api_router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(http::http_health))
    .route("/tasks", get(http::http_list_tasks))
    .route("/tasks/:id", get(http::http_get_task))
    .route("/variants", post(http::http_post_variant))
    .route("/eval", post(http::http_post_eval))
    .route("/tutor", post(http::http_post_tutor))
    .route("/tutor/session", post(http::http_post_tutor_session))
    .route("/mastery", get(http::http_get_mastery).post(http::http_post_mastery))
    .with_state(state)
}

/// Build the application router with:
/// - API under `/api/...`
/// - Static SPA from `static_dir` with index fallback
/// - CORS (allow any origin/method/headers) – adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>, static_dir: &Path) -> Router {
  let static_service = ServeDir::new(static_dir)
    .append_index_html_on_directories(true)
    .not_found_service(ServeFile::new(static_dir.join("index.html")));

  Router::new()
    .nest("/api", api_router(state))
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .layer(
      TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
    .fallback_service(static_service)
}
