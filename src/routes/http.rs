//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs parameters and basic result info.

use std::sync::Arc;

use axum::{
  extract::{rejection::JsonRejection, Path, Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::domain::TestResult;
use crate::error::AppError;
use crate::protocol::*;
use crate::state::AppState;
use crate::tasks::{TaskPage, TaskQuery, DEFAULT_PAGE_LIMIT};
use crate::tutor::{actions::TutorReply, run_session, TutorContext, UiMessage, UPSTREAM_FALLBACK};
use crate::variants::{generate_variant, merge_variant, random_seed};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
  payload.map(|Json(v)| v).map_err(|e| AppError::BadRequest(e.body_text()))
}

fn bad_request(message: &str) -> Response {
  (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse {
  Json(HealthOut { ok: true })
}

fn number<T: std::str::FromStr>(raw: Option<&str>, name: &str, default: T) -> Result<T, AppError> {
  match raw.map(str::trim).filter(|s| !s.is_empty()) {
    None => Ok(default),
    Some(s) => s.parse().map_err(|_| AppError::BadRequest(format!("{name} must be a number"))),
  }
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_tasks(
  State(state): State<Arc<AppState>>,
  Query(q): Query<TasksQuery>,
) -> Result<Json<TaskPage>, AppError> {
  let level = q.level.as_deref().or(q.difficulty.as_deref());
  let difficulty = match level.map(str::trim).filter(|s| !s.is_empty()) {
    None => None,
    Some(s) => Some(s.parse::<u32>().map_err(|_| AppError::BadRequest("level must be a number".into()))?),
  };
  let query = TaskQuery {
    difficulty,
    concept_id: q.concept_id.clone(),
    limit: number(q.limit.as_deref(), "limit", DEFAULT_PAGE_LIMIT)?,
    offset: number(q.offset.as_deref(), "offset", 0)?,
  };

  let page = state.tasks.list(&query).await.map_err(|e| {
    error!(target: "tasks", error = %e, "task listing failed");
    AppError::Internal("Failed to fetch tasks".into())
  })?;
  info!(target: "tasks", ?difficulty, returned = page.items.len(), total = page.total, "HTTP tasks listed");
  Ok(Json(page))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_task(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
  match state.tasks.get(&id).await? {
    Some(task) => Ok(Json(task)),
    None => Err(AppError::NotFound("task not found".into())),
  }
}

#[instrument(level = "info", skip(state, payload))]
pub async fn http_post_variant(
  State(state): State<Arc<AppState>>,
  payload: Result<Json<VariantIn>, JsonRejection>,
) -> Result<Json<VariantOut>, AppError> {
  let req = body(payload)?;
  let task_id = req
    .task_id
    .filter(|id| !id.trim().is_empty())
    .ok_or_else(|| AppError::BadRequest("task_id required".into()))?;
  let task = state
    .tasks
    .get(&task_id)
    .await?
    .ok_or_else(|| AppError::NotFound("task not found".into()))?;

  let seed = req.seed.filter(|s| !s.is_empty()).unwrap_or_else(random_seed);
  let variant = generate_variant(state.llm.as_ref(), &state.prompts, &state.variant_model, &task, &seed).await?;
  let merged = merge_variant(&task, &variant);
  info!(target: "variants", %task_id, seed = %variant.seed, theme = %variant.theme, "HTTP variant served");
  Ok(Json(VariantOut { task: merged, variant }))
}

#[instrument(level = "info", skip(state, payload))]
pub async fn http_post_eval(
  State(state): State<Arc<AppState>>,
  payload: Result<Json<EvalIn>, JsonRejection>,
) -> Response {
  let (task, files) = match payload {
    Ok(Json(EvalIn { task: Some(task), files: Some(files) })) => (task, files),
    Ok(_) => return bad_request("Missing task or files"),
    Err(e) => return bad_request(&e.body_text()),
  };

  match state.evaluator.evaluate(&files, &task.tests).await {
    Ok(result) => {
      info!(target: "sandbox", passed = result.passed, tests = task.tests.len(), "HTTP eval finished");
      Json(result).into_response()
    }
    Err(e) => {
      error!(target: "sandbox", error = %e, "evaluation failed");
      (StatusCode::INTERNAL_SERVER_ERROR, Json(TestResult::internal_failure())).into_response()
    }
  }
}

fn upstream_failure() -> Response {
  let reply = TutorReply::message(UiMessage::system(UPSTREAM_FALLBACK));
  (StatusCode::INTERNAL_SERVER_ERROR, Json(reply)).into_response()
}

#[instrument(level = "info", skip(state, payload))]
pub async fn http_post_tutor(
  State(state): State<Arc<AppState>>,
  payload: Result<Json<TutorIn>, JsonRejection>,
) -> Response {
  let (user_text, context) = match payload {
    Ok(Json(TutorIn { user_text: Some(text), context: Some(ctx) })) if !text.is_empty() && !ctx.is_null() => {
      (text, ctx)
    }
    Ok(_) => return bad_request("Missing userText or context"),
    Err(e) => return bad_request(&e.body_text()),
  };

  match state.tutor.ask(&user_text, &context).await {
    Ok(reply) => Json(reply).into_response(),
    Err(e) => {
      error!(target: "tutor", error = %e, "tutor call failed");
      upstream_failure()
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct TutorSessionIn {
  #[serde(default, rename = "userText")]
  pub user_text: Option<String>,
  #[serde(default)]
  pub context: Option<TutorContext>,
}

#[instrument(level = "info", skip(state, payload))]
pub async fn http_post_tutor_session(
  State(state): State<Arc<AppState>>,
  payload: Result<Json<TutorSessionIn>, JsonRejection>,
) -> Response {
  let (user_text, context) = match payload {
    Ok(Json(TutorSessionIn { user_text: Some(text), context: Some(ctx) })) if !text.is_empty() => (text, ctx),
    Ok(_) => return bad_request("Missing userText or context"),
    Err(e) => return bad_request(&e.body_text()),
  };

  let context_json = match serde_json::to_value(&context) {
    Ok(v) => v,
    Err(e) => return AppError::Internal(e.to_string()).into_response(),
  };
  let reply = match state.tutor.ask(&user_text, &context_json).await {
    Ok(reply) => reply,
    Err(e) => {
      error!(target: "tutor", error = %e, "tutor call failed");
      return upstream_failure();
    }
  };

  let outcome = run_session(reply, context, state.headless_host()).await;
  info!(
    target: "tutor",
    session_id = %outcome.session_id,
    applied = outcome.applied_actions,
    next_task = ?outcome.next_task_id,
    failed = outcome.dispatch_error.is_some(),
    "HTTP tutor session finished"
  );
  Json(outcome).into_response()
}

#[instrument(level = "info", skip(state, payload))]
pub async fn http_post_mastery(
  State(state): State<Arc<AppState>>,
  payload: Result<Json<MasteryIn>, JsonRejection>,
) -> Result<Json<MasteryOut>, AppError> {
  let req = body(payload)?;
  state.mastery.record(&req.tags, req.result).await;
  Ok(Json(MasteryOut { ok: true, mastery: state.mastery.snapshot().await }))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_mastery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(state.mastery.snapshot().await)
}
