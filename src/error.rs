//! Error types per layer, and their mapping onto HTTP responses.

use std::path::PathBuf;

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::sandbox::SandboxError;

/// Task store failures.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("no readable task source among {0:?}")]
  NotFound(Vec<PathBuf>),
  #[error("database error: {0}")]
  Db(#[from] rusqlite::Error),
  #[error("stored column `{column}` of task `{id}` is not valid JSON: {source}")]
  Column {
    id: String,
    column: &'static str,
    #[source]
    source: serde_json::Error,
  },
  #[error("blocking task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// LLM call failures. None of them are retried.
#[derive(Debug, Error)]
pub enum LlmError {
  #[error("LLM integration is disabled (no API key configured)")]
  Disabled,
  #[error("LLM HTTP {status}: {message}")]
  Http { status: u16, message: String },
  #[error("LLM request failed: {0}")]
  Network(String),
  #[error("LLM response could not be parsed: {0}")]
  Parse(String),
}

impl From<reqwest::Error> for LlmError {
  fn from(e: reqwest::Error) -> Self {
    LlmError::Network(e.to_string())
  }
}

/// Failure of one host capability.
#[derive(Debug, Error)]
pub enum HostError {
  #[error("no task is loaded")]
  NoTask,
  #[error("task `{0}` not found")]
  TaskNotFound(String),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Sandbox(#[from] SandboxError),
}

/// A tutor action that failed while being applied. Actions before it stay applied.
#[derive(Debug, Error)]
#[error("action `{action}` failed after {applied} applied: {message}")]
pub struct DispatchError {
  pub action: &'static str,
  pub applied: usize,
  pub message: String,
}

/// Errors surfaced by HTTP handlers. Rendered as `{ "error": ... }`.
#[derive(Debug, Error)]
pub enum AppError {
  #[error("{0}")]
  BadRequest(String),
  #[error("{0}")]
  NotFound(String),
  #[error("{0}")]
  Internal(String),
}

impl AppError {
  pub fn status(&self) -> StatusCode {
    match self {
      AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!(target: "aictutor_backend", error = %self, "request failed");
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

impl From<StoreError> for AppError {
  fn from(e: StoreError) -> Self {
    AppError::Internal(e.to_string())
  }
}

impl From<LlmError> for AppError {
  fn from(e: LlmError) -> Self {
    AppError::Internal(e.to_string())
  }
}

impl From<SandboxError> for AppError {
  fn from(e: SandboxError) -> Self {
    AppError::Internal(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn statuses_follow_error_class() {
    assert_eq!(AppError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
    assert_eq!(AppError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
    let from_llm: AppError = LlmError::Parse("bad".into()).into();
    assert_eq!(from_llm.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(from_llm.to_string().contains("bad"));
  }

  #[test]
  fn dispatch_error_names_the_action() {
    let e = DispatchError { action: "run_tests", applied: 2, message: "boom".into() };
    assert_eq!(e.to_string(), "action `run_tests` failed after 2 applied: boom");
  }
}
