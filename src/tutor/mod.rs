//! Tutor orchestration: one LLM call per student message, a constrained JSON
//! reply, and in-order dispatch of the reply's actions to a host.

pub mod actions;
pub mod host;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Task, TestResult};
use crate::error::{DispatchError, LlmError};
use crate::llm::{Completion, LlmClient};
use crate::util::trunc_for_log;
use actions::{parse_reply, TutorAction, TutorReply};
use host::{EditorState, HeadlessHost, HostCapabilities, RunTestsPayload};

pub use actions::{HintRef, Strategy, UiMessage, FORMAT_FALLBACK};

pub const UPSTREAM_FALLBACK: &str = "I encountered an error. Please try rephrasing your question.";

/// Student preferences sent along with every message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentPrefs {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hint_policy: Option<String>,
  #[serde(default)]
  pub requested_full_solution: bool,
}

/// What the client knows when the student speaks. Unknown keys are kept and
/// forwarded to the model untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TutorContext {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task: Option<Task>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub test_result: Option<TestResult>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub editor: Option<EditorState>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub student: Option<StudentPrefs>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, Value>,
}

pub struct Tutor {
  llm: Arc<dyn LlmClient>,
  model: String,
  system: String,
}

impl Tutor {
  pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, system: impl Into<String>) -> Self {
    Self { llm, model: model.into(), system: system.into() }
  }

  /// Ask the model. Transport failures are errors; malformed replies are not
  /// (they become the fallback reply).
  #[instrument(level = "info", target = "tutor", skip(self, context, user_text), fields(model = %self.model, text_len = user_text.len()))]
  pub async fn ask(&self, user_text: &str, context: &Value) -> Result<TutorReply, LlmError> {
    let text = self
      .llm
      .complete(&Completion {
        model: self.model.clone(),
        system: self.system.clone(),
        user: user_message(user_text, context),
        max_tokens: 4096,
        temperature: 0.7,
      })
      .await?;
    let reply = parse_reply(&text);
    info!(
      target: "tutor",
      messages = reply.ui_messages.len(),
      actions = reply.actions().len(),
      hint = ?reply.hint.as_ref().map(|h| h.level),
      preview = %trunc_for_log(&text, 120),
      "tutor reply parsed"
    );
    Ok(reply)
  }
}

pub fn user_message(user_text: &str, context: &Value) -> String {
  let context = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
  format!("Context:\n{context}\n\nStudent message: {user_text}")
}

/// Apply actions in order. The first failing capability stops the run;
/// actions before it stay applied. Returns how many were applied.
#[instrument(level = "info", target = "tutor", skip_all, fields(actions = actions.len()))]
pub async fn dispatch<H: HostCapabilities + ?Sized>(actions: &[TutorAction], host: &mut H) -> Result<usize, DispatchError> {
  for (applied, action) in actions.iter().enumerate() {
    let fail = |e: crate::error::HostError| DispatchError { action: action.kind(), applied, message: e.to_string() };
    match action {
      TutorAction::WriteFiles { files } => host.write_files(files).await.map_err(fail)?,
      TutorAction::Run => host.run_sandbox().await.map_err(fail)?,
      TutorAction::RunTests => {
        let tests = match host.current_task() {
          Some(task) => task.tests.clone(),
          None => return Err(fail(crate::error::HostError::NoTask)),
        };
        let payload = RunTestsPayload { tests, files: host.current_files().clone() };
        let result = host.run_tests(payload).await.map_err(fail)?;
        host.record_test_result(result);
      }
      TutorAction::OpenPath { path } => host.open_path(path).await.map_err(fail)?,
      TutorAction::UpdateMastery { concept_tags, result } => {
        host.update_mastery(concept_tags, *result).await.map_err(fail)?
      }
      TutorAction::PickNextTask { strategy } => {
        if host.pick_next_task(*strategy).await.map_err(fail)?.is_none() {
          warn!(target: "tutor", ?strategy, "no next task available");
        }
      }
      TutorAction::RevealSolution { confirm: true } => host.reveal_solution().await.map_err(fail)?,
      TutorAction::RevealSolution { confirm: false } => {
        info!(target: "tutor", "reveal_solution without confirmation ignored");
      }
    }
  }
  Ok(actions.len())
}

/// Result of one server-side tutor turn.
#[derive(Clone, Debug, Serialize)]
pub struct SessionOutcome {
  pub session_id: String,
  pub reply: TutorReply,
  pub editor: EditorState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub test_result: Option<TestResult>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub next_task_id: Option<String>,
  pub solution_revealed: bool,
  pub refreshes: u32,
  pub applied_actions: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dispatch_error: Option<String>,
}

/// Dispatch a reply's actions against a headless host seeded from `context`.
pub async fn run_session(reply: TutorReply, context: TutorContext, mut host: HeadlessHost) -> SessionOutcome {
  let session_id = Uuid::new_v4().to_string();
  let start_task = context.task.as_ref().map(|t| t.id.clone());
  host = host.with_state(context.task, context.editor.unwrap_or_default(), context.test_result);

  let (applied_actions, dispatch_error) = match dispatch(reply.actions(), &mut host).await {
    Ok(n) => (n, None),
    Err(e) => {
      warn!(target: "tutor", %session_id, error = %e, "tutor actions stopped early");
      (e.applied, Some(e.to_string()))
    }
  };

  let current = host.current_task().map(|t| t.id.clone());
  SessionOutcome {
    session_id,
    next_task_id: current.filter(|id| Some(id) != start_task.as_ref()),
    editor: host.editor().clone(),
    test_result: host.last_result().cloned(),
    solution_revealed: host.solution_revealed(),
    refreshes: host.refreshes(),
    applied_actions,
    dispatch_error,
    reply,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::FileBundle;
  use crate::error::HostError;
  use crate::mastery::Outcome;
  use async_trait::async_trait;
  use serde_json::json;

  /// Host that records calls and can be told to fail one capability.
  #[derive(Default)]
  struct Recorder {
    calls: Vec<String>,
    fail_on: Option<&'static str>,
    task: Option<Task>,
    files: FileBundle,
    recorded: Option<TestResult>,
  }

  impl Recorder {
    fn call(&mut self, name: &'static str) -> Result<(), HostError> {
      self.calls.push(name.to_string());
      if self.fail_on == Some(name) {
        return Err(HostError::TaskNotFound("boom".into()));
      }
      Ok(())
    }
  }

  #[async_trait]
  impl HostCapabilities for Recorder {
    async fn load_task(&mut self, _id: &str) -> Result<(), HostError> {
      self.call("load_task")
    }
    async fn pick_next_task(&mut self, _s: Strategy) -> Result<Option<String>, HostError> {
      self.call("pick_next_task").map(|_| None)
    }
    async fn open_path(&mut self, _p: &str) -> Result<(), HostError> {
      self.call("open_path")
    }
    async fn write_files(&mut self, files: &FileBundle) -> Result<(), HostError> {
      self.files.extend(files.clone());
      self.call("write_files")
    }
    async fn run_sandbox(&mut self) -> Result<(), HostError> {
      self.call("run_sandbox")
    }
    async fn run_tests(&mut self, payload: RunTestsPayload) -> Result<TestResult, HostError> {
      self.call("run_tests")?;
      Ok(TestResult { passed: true, passed_ids: payload.tests.into_iter().map(|t| t.id).collect(), ..Default::default() })
    }
    async fn update_mastery(&mut self, _t: &[String], _r: Outcome) -> Result<(), HostError> {
      self.call("update_mastery")
    }
    async fn reveal_solution(&mut self) -> Result<(), HostError> {
      self.call("reveal_solution")
    }
    fn current_task(&self) -> Option<&Task> {
      self.task.as_ref()
    }
    fn current_files(&self) -> &FileBundle {
      &self.files
    }
    fn record_test_result(&mut self, result: TestResult) {
      self.recorded = Some(result);
    }
  }

  fn task() -> Task {
    serde_json::from_value(json!({"id": "t", "title": "T", "tests": [{"id": "t1", "code": "true"}]})).unwrap()
  }

  #[tokio::test]
  async fn actions_run_in_order_and_tests_feed_back() {
    let mut host = Recorder { task: Some(task()), ..Default::default() };
    let actions = vec![
      TutorAction::WriteFiles { files: [("index.html".to_string(), "<h1/>".to_string())].into() },
      TutorAction::Run,
      TutorAction::RunTests,
      TutorAction::RevealSolution { confirm: false },
      TutorAction::RevealSolution { confirm: true },
    ];
    assert_eq!(dispatch(&actions, &mut host).await.unwrap(), 5);
    assert_eq!(host.calls, vec!["write_files", "run_sandbox", "run_tests", "reveal_solution"]);
    assert_eq!(host.recorded.unwrap().passed_ids, vec!["t1"]);
  }

  #[tokio::test]
  async fn failure_stops_remaining_actions_but_keeps_earlier_ones() {
    let mut host = Recorder { task: Some(task()), fail_on: Some("open_path"), ..Default::default() };
    let actions = vec![
      TutorAction::WriteFiles { files: [("a.js".to_string(), "1".to_string())].into() },
      TutorAction::OpenPath { path: "a.js".into() },
      TutorAction::Run,
    ];
    let err = dispatch(&actions, &mut host).await.unwrap_err();
    assert_eq!(err.action, "open_path");
    assert_eq!(err.applied, 1);
    assert_eq!(host.calls, vec!["write_files", "open_path"]);
    assert!(host.files.contains_key("a.js"));
  }

  #[tokio::test]
  async fn run_tests_without_task_fails() {
    let mut host = Recorder::default();
    let err = dispatch(&[TutorAction::RunTests], &mut host).await.unwrap_err();
    assert_eq!(err.action, "run_tests");
    assert_eq!(err.applied, 0);
  }

  #[test]
  fn context_keeps_unknown_keys() {
    let ctx: TutorContext = serde_json::from_value(json!({
      "editor": {"open_path": "index.html", "files": {"index.html": ""}},
      "student": {"hint_policy": "normal", "requested_full_solution": false},
      "locale": "en"
    }))
    .unwrap();
    assert_eq!(ctx.extra["locale"], "en");
    let back = serde_json::to_value(&ctx).unwrap();
    assert_eq!(back["locale"], "en");
    assert_eq!(back["editor"]["open_path"], "index.html");
  }

  #[test]
  fn user_message_embeds_context_and_text() {
    let msg = user_message("I'm stuck", &json!({"task": {"id": "x"}}));
    assert!(msg.starts_with("Context:\n{"));
    assert!(msg.ends_with("\n\nStudent message: I'm stuck"));
  }
}
