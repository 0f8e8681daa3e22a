//! Capabilities the tutor's actions are applied against.
//!
//! A browser client implements these against its editor and preview;
//! [`HeadlessHost`] implements them in memory on the server.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::actions::Strategy;
use crate::domain::{FileBundle, Task, TaskTest, TestResult};
use crate::error::HostError;
use crate::mastery::{MasteryLedger, Outcome};
use crate::sandbox::Evaluator;
use crate::tasks::{TaskQuery, TaskSource};

/// Body of a test run: the tests to check and the files to check them against.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunTestsPayload {
  pub tests: Vec<TaskTest>,
  pub files: FileBundle,
}

#[async_trait]
pub trait HostCapabilities: Send {
  async fn load_task(&mut self, id: &str) -> Result<(), HostError>;
  /// Switch to the next task; returns its id, or `None` when nothing qualifies.
  async fn pick_next_task(&mut self, strategy: Strategy) -> Result<Option<String>, HostError>;
  async fn open_path(&mut self, path: &str) -> Result<(), HostError>;
  /// Merge files into the editor; unmentioned files are kept.
  async fn write_files(&mut self, files: &FileBundle) -> Result<(), HostError>;
  /// Refresh the live preview.
  async fn run_sandbox(&mut self) -> Result<(), HostError>;
  async fn run_tests(&mut self, payload: RunTestsPayload) -> Result<TestResult, HostError>;
  async fn update_mastery(&mut self, tags: &[String], result: Outcome) -> Result<(), HostError>;
  /// Open the solution view.
  async fn reveal_solution(&mut self) -> Result<(), HostError>;
  fn current_task(&self) -> Option<&Task>;
  fn current_files(&self) -> &FileBundle;
  fn record_test_result(&mut self, result: TestResult);
}

/// Editor state as the client sees it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EditorState {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub open_path: Option<String>,
  #[serde(default)]
  pub files: FileBundle,
}

/// Server-side host: in-memory editor over the task store, the evaluator and
/// the mastery ledger.
pub struct HeadlessHost {
  tasks: Arc<dyn TaskSource>,
  evaluator: Evaluator,
  mastery: Arc<MasteryLedger>,
  task: Option<Task>,
  editor: EditorState,
  last_result: Option<TestResult>,
  solution_revealed: bool,
  refreshes: u32,
}

impl HeadlessHost {
  pub fn new(tasks: Arc<dyn TaskSource>, evaluator: Evaluator, mastery: Arc<MasteryLedger>) -> Self {
    Self {
      tasks,
      evaluator,
      mastery,
      task: None,
      editor: EditorState::default(),
      last_result: None,
      solution_revealed: false,
      refreshes: 0,
    }
  }

  /// Start from a known task and editor. An empty editor is filled from the
  /// task's scaffold.
  pub fn with_state(mut self, task: Option<Task>, editor: EditorState, last_result: Option<TestResult>) -> Self {
    self.editor = editor;
    if self.editor.files.is_empty() {
      if let Some(t) = &task {
        self.editor.files = t.scaffold.clone();
      }
    }
    self.task = task;
    self.last_result = last_result;
    self
  }

  pub fn editor(&self) -> &EditorState {
    &self.editor
  }

  pub fn last_result(&self) -> Option<&TestResult> {
    self.last_result.as_ref()
  }

  pub fn solution_revealed(&self) -> bool {
    self.solution_revealed
  }

  pub fn refreshes(&self) -> u32 {
    self.refreshes
  }

  fn switch_to(&mut self, task: Task) {
    info!(target: "tutor", task_id = %task.id, difficulty = task.difficulty, "host switched task");
    self.editor.files = task.scaffold.clone();
    self.editor.open_path = Some(first_path(&task.scaffold));
    self.last_result = None;
    self.solution_revealed = false;
    self.task = Some(task);
  }

  async fn level(&self, difficulty: u32) -> Result<Vec<Task>, HostError> {
    let query = TaskQuery { difficulty: Some(difficulty), limit: usize::MAX, ..Default::default() };
    Ok(self.tasks.list(&query).await?.items)
  }

  async fn sequential_next(&self) -> Result<Option<Task>, HostError> {
    let (difficulty, current) = match &self.task {
      Some(t) => (t.difficulty, Some(t.id.as_str())),
      None => (1, None),
    };
    let mut level = self.level(difficulty).await?;
    let next = match current.and_then(|id| level.iter().position(|t| t.id == id)) {
      Some(i) if i + 1 < level.len() => i + 1,
      _ => 0,
    };
    Ok((next < level.len()).then(|| level.swap_remove(next)))
  }

  async fn just_right_next(&self) -> Result<Option<Task>, HostError> {
    let Some(current) = &self.task else {
      return self.sequential_next().await;
    };
    let passed = self.last_result.as_ref().map_or(false, |r| r.passed);
    let target = if passed { current.difficulty.saturating_add(1) } else { current.difficulty };
    let candidate = self.level(target).await?.into_iter().find(|t| t.id != current.id);
    match candidate {
      Some(t) => Ok(Some(t)),
      None => self.sequential_next().await,
    }
  }
}

fn first_path(files: &FileBundle) -> String {
  if files.contains_key("index.html") {
    return "index.html".into();
  }
  files.keys().next().cloned().unwrap_or_else(|| "index.html".into())
}

#[async_trait]
impl HostCapabilities for HeadlessHost {
  #[instrument(level = "debug", target = "tutor", skip(self))]
  async fn load_task(&mut self, id: &str) -> Result<(), HostError> {
    let task = self.tasks.get(id).await?.ok_or_else(|| HostError::TaskNotFound(id.to_string()))?;
    self.switch_to(task);
    Ok(())
  }

  #[instrument(level = "debug", target = "tutor", skip(self))]
  async fn pick_next_task(&mut self, strategy: Strategy) -> Result<Option<String>, HostError> {
    let next = match strategy {
      Strategy::Sequential => self.sequential_next().await?,
      Strategy::JustRight => self.just_right_next().await?,
    };
    Ok(next.map(|task| {
      let id = task.id.clone();
      self.switch_to(task);
      id
    }))
  }

  async fn open_path(&mut self, path: &str) -> Result<(), HostError> {
    self.editor.open_path = Some(path.to_string());
    Ok(())
  }

  async fn write_files(&mut self, files: &FileBundle) -> Result<(), HostError> {
    for (path, content) in files {
      self.editor.files.insert(path.clone(), content.clone());
    }
    Ok(())
  }

  async fn run_sandbox(&mut self) -> Result<(), HostError> {
    self.refreshes += 1;
    Ok(())
  }

  async fn run_tests(&mut self, payload: RunTestsPayload) -> Result<TestResult, HostError> {
    Ok(self.evaluator.evaluate(&payload.files, &payload.tests).await?)
  }

  async fn update_mastery(&mut self, tags: &[String], result: Outcome) -> Result<(), HostError> {
    self.mastery.record(tags, result).await;
    Ok(())
  }

  async fn reveal_solution(&mut self) -> Result<(), HostError> {
    if self.task.is_none() {
      return Err(HostError::NoTask);
    }
    self.solution_revealed = true;
    Ok(())
  }

  fn current_task(&self) -> Option<&Task> {
    self.task.as_ref()
  }

  fn current_files(&self) -> &FileBundle {
    &self.editor.files
  }

  fn record_test_result(&mut self, result: TestResult) {
    self.last_result = Some(result);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tasks::{local_source, TaskSource};
  use serde_json::json;

  fn store() -> (tempfile::TempDir, Arc<dyn TaskSource>) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("tasks.json");
    let tasks = json!([
      {"id": "a1", "title": "A1", "difficulty": 1, "scaffold": {"index.html": "<p>a1</p>"}},
      {"id": "a2", "title": "A2", "difficulty": 1, "scaffold": {"style.css": "", "app.js": ""}},
      {"id": "a3", "title": "A3", "difficulty": 1},
      {"id": "b1", "title": "B1", "difficulty": 2}
    ]);
    std::fs::write(&file, tasks.to_string()).unwrap();
    let src: Arc<dyn TaskSource> = Arc::new(local_source(vec![dir.path().join("none")], vec![file]));
    (dir, src)
  }

  fn host(src: Arc<dyn TaskSource>) -> HeadlessHost {
    HeadlessHost::new(src, Evaluator::new(0), Arc::new(MasteryLedger::new()))
  }

  #[tokio::test]
  async fn sequential_walks_level_and_wraps() {
    let (_dir, src) = store();
    let mut h = host(src);
    h.load_task("a2").await.unwrap();
    assert_eq!(h.editor().open_path.as_deref(), Some("app.js"));
    assert_eq!(h.pick_next_task(Strategy::Sequential).await.unwrap().as_deref(), Some("a3"));
    assert_eq!(h.pick_next_task(Strategy::Sequential).await.unwrap().as_deref(), Some("a1"));
    assert_eq!(h.current_files()["index.html"], "<p>a1</p>");
  }

  #[tokio::test]
  async fn just_right_moves_up_after_a_pass() {
    let (_dir, src) = store();
    let mut h = host(src);
    h.load_task("a1").await.unwrap();
    assert_eq!(h.pick_next_task(Strategy::JustRight).await.unwrap().as_deref(), Some("a2"));

    h.record_test_result(TestResult { passed: true, ..Default::default() });
    assert_eq!(h.pick_next_task(Strategy::JustRight).await.unwrap().as_deref(), Some("b1"));

    // Nothing at difficulty 3, so a pass on b1 falls back to sequential (wraps to itself).
    h.record_test_result(TestResult { passed: true, ..Default::default() });
    assert_eq!(h.pick_next_task(Strategy::JustRight).await.unwrap().as_deref(), Some("b1"));
  }

  #[tokio::test]
  async fn just_right_at_the_top_difficulty_does_not_overflow() {
    let (_dir, src) = store();
    let top: Task = serde_json::from_value(json!({"id": "top", "title": "Top", "difficulty": u32::MAX})).unwrap();
    let passed = TestResult { passed: true, ..Default::default() };
    let mut h = host(src).with_state(Some(top), EditorState::default(), Some(passed));
    assert_eq!(h.pick_next_task(Strategy::JustRight).await.unwrap(), None);
    assert_eq!(h.current_task().map(|t| t.id.as_str()), Some("top"));
  }

  #[tokio::test]
  async fn write_files_merges_and_unknown_task_errors() {
    let (_dir, src) = store();
    let mut h = host(src);
    h.load_task("a1").await.unwrap();
    h.write_files(&[("script.js".to_string(), "1".to_string())].into()).await.unwrap();
    assert_eq!(h.current_files().len(), 2);
    assert!(matches!(h.load_task("zzz").await, Err(HostError::TaskNotFound(_))));
    assert_eq!(h.current_task().map(|t| t.id.as_str()), Some("a1"));
  }

  #[tokio::test]
  async fn reveal_requires_a_task() {
    let (_dir, src) = store();
    let mut h = host(src);
    assert!(matches!(h.reveal_solution().await, Err(HostError::NoTask)));
    h.load_task("a1").await.unwrap();
    h.reveal_solution().await.unwrap();
    assert!(h.solution_revealed());
  }
}
