//! End-to-end checks of the `/api` surface against temp-dir task fixtures and
//! a scripted LLM.

use std::{path::Path, sync::Arc};

use aictutor_backend::{
  config::Prompts,
  error::LlmError,
  llm::{Completion, LlmClient},
  routes::build_router,
  sandbox::Evaluator,
  state::AppState,
  tasks::local_source,
  tutor::{FORMAT_FALLBACK, UPSTREAM_FALLBACK},
};
use async_trait::async_trait;
use axum::{
  body::{to_bytes, Body},
  http::{Request, StatusCode},
  Router,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

/// Replies with the same text every time, or fails like a dead upstream.
struct Scripted(Option<String>);

#[async_trait]
impl LlmClient for Scripted {
  async fn complete(&self, _req: &Completion) -> Result<String, LlmError> {
    self.0.clone().ok_or(LlmError::Http { status: 529, message: "overloaded".into() })
  }
}

fn write_fixtures(root: &Path) {
  let challenges = root.join("challenges");
  std::fs::create_dir_all(&challenges).unwrap();
  std::fs::write(
    challenges.join("pack.json"),
    json!([{
      "id": "c-heading",
      "title": "Heading",
      "description": "Add an h1",
      "level": 2,
      "conceptIds": ["html-headings"],
      "starterFiles": {"index.html": "<body></body>"},
      "solutions": [{"files": {"index.html": "<body><h1>Hi</h1></body>"}}],
      "tests": [{"id": "t1", "type": "dom-assert", "selector": "h1"}]
    }])
    .to_string(),
  )
  .unwrap();

  std::fs::write(
    root.join("tasks.json"),
    json!([
      {"id": "a-basics", "title": "Basics", "difficulty": 1,
       "tests": [{"id": "t1", "code": "document.querySelector('p') !== null"}]},
      {"id": "b-lists", "title": "Lists", "difficulty": 2, "conceptIds": ["html-lists"],
       "scaffold": {"index.html": "<ul></ul>"},
       "tests": [{"id": "t1", "code": "document.querySelectorAll('li').length >= 2"}],
       "solution": {"index.html": "<ul><li>a</li><li>b</li></ul>"}},
      {"id": "c-heading", "title": "Shadowed by the directory", "difficulty": 5}
    ])
    .to_string(),
  )
  .unwrap();
}

fn app(dir: &TempDir, llm: Scripted) -> (Router, Arc<AppState>) {
  write_fixtures(dir.path());
  let tasks = local_source(vec![dir.path().join("challenges")], vec![dir.path().join("tasks.json")]);
  let state = Arc::new(AppState::new(
    Arc::new(tasks),
    Arc::new(llm),
    Evaluator::new(20),
    Prompts::default(),
    "variant-model",
    "tutor-model",
  ));
  (build_router(state.clone(), &dir.path().join("static")), state)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
  let mut req = Request::builder().method(method).uri(uri);
  let body = match body {
    Some(v) => {
      req = req.header("content-type", "application/json");
      Body::from(v.to_string())
    }
    None => Body::empty(),
  };
  let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
  let status = res.status();
  let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
  let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
  (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(None));
  let (status, body) = call(&app, "GET", "/api/health", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn task_listing_filters_pages_and_counts() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(None));

  let (status, body) = call(&app, "GET", "/api/tasks?level=2&limit=1&offset=0", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["total"], 2);
  assert_eq!(body["items"].as_array().unwrap().len(), 1);
  assert_eq!(body["items"][0]["id"], "b-lists");

  let (_, body) = call(&app, "GET", "/api/tasks?level=2&limit=1&offset=1", None).await;
  assert_eq!(body["items"][0]["id"], "c-heading");
  assert_eq!(body["items"][0]["title"], "Heading");

  let (_, body) = call(&app, "GET", "/api/tasks?conceptId=html-lists", None).await;
  assert_eq!(body["total"], 1);

  let (status, body) = call(&app, "GET", "/api/tasks?level=two", None).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(body["error"], "level must be a number");
}

#[tokio::test]
async fn single_task_lookup() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(None));

  let (status, body) = call(&app, "GET", "/api/tasks/c-heading", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["difficulty"], 2);
  assert_eq!(body["tests"][0]["code"], "document.querySelector(\"h1\") !== null");

  let (status, body) = call(&app, "GET", "/api/tasks/nope", None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(body["error"], "task not found");
}

#[tokio::test]
async fn eval_runs_predicates_against_submitted_files() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(None));

  let payload = json!({
    "task": {"tests": [
      {"id": "t1", "code": "document.querySelector('h1') !== null"},
      {"id": "t2", "code": "document.querySelector('h2') !== null"}
    ]},
    "files": {"index.html": "<html><body><h1>Hi</h1></body></html>"}
  });
  let (status, body) = call(&app, "POST", "/api/eval", Some(payload)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["passed"], false);
  assert_eq!(body["passedIds"], json!(["t1"]));
  assert_eq!(body["failedIds"], json!(["t2"]));
  assert_eq!(body["messages"]["t1"], "Test passed");
  assert_eq!(body["messages"]["t2"], "Test failed");

  let (status, body) = call(&app, "POST", "/api/eval", Some(json!({"task": {"tests": []}}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(body["error"], "Missing task or files");
}

#[tokio::test]
async fn tutor_falls_back_on_unparsable_reply() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(Some("Sure! Try adding an <h1>.".into())));

  let payload = json!({"userText": "help", "context": {"task": {"id": "x", "title": "X"}}});
  let (status, body) = call(&app, "POST", "/api/tutor", Some(payload)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["ui_messages"][0]["type"], "assistant");
  assert_eq!(body["ui_messages"][0]["text"], FORMAT_FALLBACK);

  let (status, body) = call(&app, "POST", "/api/tutor", Some(json!({"userText": "help"}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(body["error"], "Missing userText or context");
}

#[tokio::test]
async fn tutor_upstream_failure_is_a_system_message() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(None));

  let payload = json!({"userText": "help", "context": {}});
  let (status, body) = call(&app, "POST", "/api/tutor", Some(payload)).await;
  assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
  assert_eq!(body["ui_messages"][0]["type"], "system");
  assert_eq!(body["ui_messages"][0]["text"], UPSTREAM_FALLBACK);
}

#[tokio::test]
async fn tutor_session_applies_actions_headlessly() {
  let dir = TempDir::new().unwrap();
  let reply = json!({
    "ui_messages": [{"type": "assistant", "text": "Let me add the items and run the tests."}],
    "hint": {"level": 2, "concept_tag": "html-lists"},
    "actions": [
      {"type": "write_files", "files": {"index.html": "<ul><li>a</li><li>b</li></ul>"}},
      {"type": "run_tests"},
      {"type": "update_mastery", "concept_tags": ["html-lists"], "result": "pass"}
    ]
  });
  let (app, _) = app(&dir, Scripted(Some(format!("```json\n{reply}\n```"))));

  let (_, task) = call(&app, "GET", "/api/tasks/b-lists", None).await;
  let payload = json!({"userText": "do it for me", "context": {"task": task}});
  let (status, body) = call(&app, "POST", "/api/tutor/session", Some(payload)).await;
  assert_eq!(status, StatusCode::OK, "{body}");
  assert_eq!(body["applied_actions"], 3);
  assert_eq!(body["session_id"].as_str().unwrap().len(), 36);
  assert_eq!(body["reply"]["hint"]["level"], 2);
  assert_eq!(body["test_result"]["passed"], true);
  assert_eq!(body["editor"]["files"]["index.html"], "<ul><li>a</li><li>b</li></ul>");
  assert!(body.get("next_task_id").is_none());
  assert!(body.get("dispatch_error").is_none());

  let (_, mastery) = call(&app, "GET", "/api/mastery", None).await;
  assert_eq!(mastery["html-lists"]["passes"], 1);
}

#[tokio::test]
async fn tutor_session_moves_to_the_next_task() {
  let dir = TempDir::new().unwrap();
  let reply = json!({
    "ui_messages": [{"type": "assistant", "text": "Great work, on to the next one."}],
    "actions": [{"type": "pick_next_task", "strategy": "sequential"}, {"type": "run"}]
  });
  let (app, _) = app(&dir, Scripted(Some(reply.to_string())));

  let (_, task) = call(&app, "GET", "/api/tasks/b-lists", None).await;
  let payload = json!({
    "userText": "next please",
    "context": {"task": task, "test_result": {"passed": true, "passedIds": ["t1"], "failedIds": [], "messages": {}}}
  });
  let (status, body) = call(&app, "POST", "/api/tutor/session", Some(payload)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["next_task_id"], "c-heading");
  assert_eq!(body["editor"]["files"]["index.html"], "<body></body>");
  assert_eq!(body["editor"]["open_path"], "index.html");
  assert_eq!(body["refreshes"], 1);
  assert!(body.get("test_result").is_none());
}

#[tokio::test]
async fn tutor_session_reports_where_dispatch_stopped() {
  let dir = TempDir::new().unwrap();
  let reply = json!({
    "ui_messages": [{"type": "assistant", "text": "Here is the answer."}],
    "actions": [{"type": "open_path", "path": "index.html"}, {"type": "reveal_solution", "confirm": true}]
  });
  let (app, _) = app(&dir, Scripted(Some(reply.to_string())));

  let payload = json!({"userText": "show me", "context": {"editor": {"files": {}}}});
  let (status, body) = call(&app, "POST", "/api/tutor/session", Some(payload)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["applied_actions"], 1);
  assert_eq!(body["editor"]["open_path"], "index.html");
  assert_eq!(body["solution_revealed"], false);
  assert!(body["dispatch_error"].as_str().unwrap().contains("reveal_solution"));
}

#[tokio::test]
async fn variants_validate_then_merge() {
  let dir = TempDir::new().unwrap();
  let spec = json!({
    "seed": "abc",
    "theme": "space",
    "title": "Mission Log",
    "description": "List the crew of the starship.",
    "scaffold_overrides": {"index.html": "<h1>Crew</h1><ul></ul>"},
    "additional_hints": ["Each crew member is one <li>."]
  });
  let (app, _) = app(&dir, Scripted(Some(spec.to_string())));

  let (status, body) = call(&app, "POST", "/api/variants", Some(json!({}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(body["error"], "task_id required");

  let (status, _) = call(&app, "POST", "/api/variants", Some(json!({"task_id": "missing"}))).await;
  assert_eq!(status, StatusCode::NOT_FOUND);

  let (status, body) = call(&app, "POST", "/api/variants", Some(json!({"task_id": "b-lists", "seed": "abc"}))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["task"]["id"], "b-lists");
  assert_eq!(body["task"]["title"], "Mission Log");
  assert_eq!(body["task"]["variant"], json!({"seed": "abc", "theme": "space"}));
  assert_eq!(body["task"]["scaffold"]["index.html"], "<h1>Crew</h1><ul></ul>");
  assert_eq!(body["task"]["tests"][0]["id"], "t1");
  assert_eq!(body["variant"]["theme"], "space");
}

#[tokio::test]
async fn variants_surface_llm_failures() {
  let dir = TempDir::new().unwrap();
  let (app, _) = app(&dir, Scripted(None));
  let (status, body) = call(&app, "POST", "/api/variants", Some(json!({"task_id": "b-lists"}))).await;
  assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
  assert!(body["error"].is_string());
}

#[tokio::test]
async fn mastery_accumulates_outcomes() {
  let dir = TempDir::new().unwrap();
  let (app, state) = app(&dir, Scripted(None));

  let (status, body) = call(
    &app,
    "POST",
    "/api/mastery",
    Some(json!({"tags": ["css-basics", "html-lists"], "result": "fail"})),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["ok"], true);
  assert_eq!(body["mastery"]["css-basics"]["fails"], 1);

  call(&app, "POST", "/api/mastery", Some(json!({"tags": ["css-basics"], "result": "pass"}))).await;
  let snapshot = state.mastery.snapshot().await;
  assert_eq!(snapshot["css-basics"].passes, 1);
  assert_eq!(snapshot["css-basics"].fails, 1);

  let (status, _) = call(&app, "POST", "/api/mastery", Some(json!({"tags": ["x"], "result": "maybe"}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}
