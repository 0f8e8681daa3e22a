//! Evaluation sandbox: builds a page from submitted files, runs its scripts
//! inside a virtual DOM and checks each test predicate against the result.
//!
//! Every evaluation gets its own [`js::Realm`] on a dedicated thread with a
//! large stack (the interpreter is recursive). The realm is dropped when the
//! thread finishes, whichever way it finishes.

pub mod css;
pub mod document;
pub mod dom;
pub mod js;
pub mod selector;

use std::time::Instant;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::domain::{FileBundle, TaskTest, TestResult};
use dom::Dom;
use js::Realm;

pub const DEFAULT_SETTLE_MS: u64 = 100;
const SANDBOX_STACK_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("failed to start sandbox thread: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("sandbox thread died before reporting")]
  Crashed,
}

/// Runs test predicates against a bundle of files.
#[derive(Clone, Debug)]
pub struct Evaluator {
  settle_ms: u64,
}

impl Default for Evaluator {
  fn default() -> Self {
    Self::new(DEFAULT_SETTLE_MS)
  }
}

impl Evaluator {
  pub fn new(settle_ms: u64) -> Self {
    Self { settle_ms }
  }

  pub fn settle_ms(&self) -> u64 {
    self.settle_ms
  }

  /// Evaluate off the async runtime. Only infrastructure failures surface as
  /// errors; script and predicate failures land in the [`TestResult`].
  #[instrument(level = "info", target = "sandbox", skip_all, fields(files = files.len(), tests = tests.len()))]
  pub async fn evaluate(&self, files: &FileBundle, tests: &[TaskTest]) -> Result<TestResult, SandboxError> {
    let (tx, rx) = oneshot::channel();
    let files = files.clone();
    let tests = tests.to_vec();
    let settle_ms = self.settle_ms;

    std::thread::Builder::new()
      .name("sandbox".into())
      .stack_size(SANDBOX_STACK_BYTES)
      .spawn(move || {
        let _ = tx.send(evaluate_in_place(&files, &tests, settle_ms));
      })?;

    rx.await.map_err(|_| {
      warn!(target: "sandbox", "evaluation thread exited without a result");
      SandboxError::Crashed
    })
  }
}

/// Synchronous core of [`Evaluator::evaluate`]. Callers must provide a
/// generous stack.
pub fn evaluate_in_place(files: &FileBundle, tests: &[TaskTest], settle_ms: u64) -> TestResult {
  let started = Instant::now();
  let html = document::build_document(files);
  let mut realm = Realm::new(Dom::parse(&html));

  let script_errors = realm.run_scripts();
  let timer_errors = realm.advance(settle_ms as f64);
  if !script_errors.is_empty() || !timer_errors.is_empty() {
    debug!(
      target: "sandbox",
      scripts = script_errors.len(),
      timers = timer_errors.len(),
      "page raised errors before predicates ran"
    );
  }

  let mut result = TestResult { passed: true, ..Default::default() };
  for test in tests {
    match realm.eval_predicate(&test.code) {
      Ok(true) => {
        result.passed_ids.push(test.id.clone());
        let msg = test.success_message.clone().unwrap_or_else(|| "Test passed".into());
        result.messages.insert(test.id.clone(), msg);
      }
      Ok(false) => {
        result.passed = false;
        result.failed_ids.push(test.id.clone());
        let msg = test.failure_message.clone().unwrap_or_else(|| "Test failed".into());
        result.messages.insert(test.id.clone(), msg);
      }
      Err(err) => {
        debug!(target: "sandbox", test = %test.id, error = %err, "predicate threw");
        result.passed = false;
        result.failed_ids.push(test.id.clone());
        result.messages.insert(test.id.clone(), format!("Error: {err}"));
      }
    }
  }

  for line in realm.console() {
    debug!(target: "sandbox", console = %line);
  }
  info!(
    target: "sandbox",
    passed = result.passed_ids.len(),
    failed = result.failed_ids.len(),
    elapsed_ms = started.elapsed().as_millis() as u64,
    "evaluation finished"
  );
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  fn files(pairs: &[(&str, &str)]) -> FileBundle {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  fn check(result: &TestResult, tests: &[TaskTest]) {
    assert_eq!(result.passed, result.failed_ids.is_empty());
    assert_eq!(result.passed_ids.len() + result.failed_ids.len(), tests.len());
  }

  #[tokio::test]
  async fn heading_page_passes_heading_test() {
    let tests = vec![TaskTest::new("t1", "document.querySelector('h1') !== null")];
    let result = Evaluator::default()
      .evaluate(&files(&[("index.html", "<h1>Hi</h1>")]), &tests)
      .await
      .unwrap();
    check(&result, &tests);
    assert!(result.passed);
    assert_eq!(result.passed_ids, vec!["t1"]);
    assert_eq!(result.messages["t1"], "Test passed");
  }

  #[tokio::test]
  async fn throwing_predicate_fails_without_stopping_the_loop() {
    let mut failing = TaskTest::new("t2", "document.querySelector('h2').textContent === 'x'");
    failing.failure_message = Some("unused".into());
    let mut ok = TaskTest::new("t3", "true");
    ok.success_message = Some("yes".into());
    let tests = vec![TaskTest::new("t1", "false"), failing, ok];

    let result = Evaluator::default()
      .evaluate(&files(&[("index.html", "<h1>Hi</h1>")]), &tests)
      .await
      .unwrap();
    check(&result, &tests);
    assert!(!result.passed);
    assert_eq!(result.failed_ids, vec!["t1", "t2"]);
    assert_eq!(result.messages["t1"], "Test failed");
    assert!(result.messages["t2"].starts_with("Error: "), "{}", result.messages["t2"]);
    assert!(result.messages["t2"].contains("textContent"));
    assert_eq!(result.messages["t3"], "yes");
  }

  #[tokio::test]
  async fn missing_index_uses_skeleton_root() {
    let tests = vec![TaskTest::new("root", "document.getElementById('root') !== null")];
    let result = Evaluator::default()
      .evaluate(&files(&[("style.css", "body { margin: 0; }")]), &tests)
      .await
      .unwrap();
    assert!(result.passed);
  }

  #[tokio::test]
  async fn empty_index_html_uses_main_html() {
    let tests = vec![TaskTest::new("m", "document.getElementById('m') !== null")];
    let result = Evaluator::default()
      .evaluate(&files(&[("index.html", ""), ("main.html", "<p id='m'>m</p>")]), &tests)
      .await
      .unwrap();
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn scripts_and_timers_inside_settle_window_are_visible() {
    let page = files(&[
      ("index.html", "<html><head></head><body><ul id='list'></ul></body></html>"),
      (
        "script.js",
        "const list = document.getElementById('list');\n\
         ['a', 'b'].forEach(t => { const li = document.createElement('li'); li.textContent = t; list.appendChild(li); });\n\
         setTimeout(() => list.dataset.ready = 'yes', 50);\n\
         setTimeout(() => list.dataset.late = 'yes', 5000);",
      ),
    ]);
    let tests = vec![
      TaskTest::new("items", "document.querySelectorAll('#list li').length === 2"),
      TaskTest::new("ready", "document.getElementById('list').dataset.ready === 'yes'"),
      TaskTest::new("late", "document.getElementById('list').dataset.late === undefined"),
    ];
    let result = Evaluator::new(100).evaluate(&page, &tests).await.unwrap();
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn runaway_script_does_not_hang_evaluation() {
    let page = files(&[
      ("index.html", "<html><head></head><body><p>x</p></body></html>"),
      ("script.js", "while (true) {}"),
    ]);
    let tests = vec![
      TaskTest::new("p", "document.querySelector('p') !== null"),
      TaskTest::new("loop", "(() => { for (;;) {} })()"),
    ];
    let result = Evaluator::default().evaluate(&page, &tests).await.unwrap();
    check(&result, &tests);
    assert_eq!(result.passed_ids, vec!["p"]);
    assert!(result.messages["loop"].starts_with("Error: "));
  }

  /// Run `script` on a bare page and check the flag it is expected to set.
  async fn sets_ok_flag(script: &str) -> TestResult {
    let page = files(&[
      ("index.html", "<html><head></head><body><p>x</p></body></html>"),
      ("script.js", script),
    ]);
    let tests = vec![TaskTest::new("ok", "document.body.dataset.ok === 'x'")];
    Evaluator::default().evaluate(&page, &tests).await.unwrap()
  }

  #[tokio::test]
  async fn class_scripts_are_evaluated() {
    let result = sets_ok_flag(
      "class Flag { constructor(v) { this.v = v; } apply() { document.body.dataset.ok = this.v; } }\n\
       class XFlag extends Flag { constructor() { super('x'); } }\n\
       new XFlag().apply();",
    )
    .await;
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn getters_and_setters_are_evaluated() {
    let result = sets_ok_flag(
      "const state = { _v: '', get v() { return this._v; }, set v(n) { this._v = n; } };\n\
       state.v = 'x';\n\
       document.body.dataset.ok = state.v;",
    )
    .await;
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn promise_callbacks_run_before_predicates() {
    let result = sets_ok_flag("Promise.resolve('x').then(v => { document.body.dataset.ok = v; });").await;
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn async_functions_settle_inside_the_window() {
    let result = sets_ok_flag(
      "const later = v => new Promise(r => setTimeout(() => r(v), 30));\n\
       async function pick() { const v = await later('x'); return v; }\n\
       pick().then(v => { document.body.dataset.ok = v; });",
    )
    .await;
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn local_storage_round_trips() {
    let result = sets_ok_flag(
      "localStorage.setItem('flag', 'x');\n\
       document.body.dataset.ok = localStorage.getItem('flag');",
    )
    .await;
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn huge_array_length_is_contained() {
    let page = files(&[
      ("index.html", "<html><head></head><body><p>x</p></body></html>"),
      ("script.js", "const a = []; a.length = 2 ** 40; document.body.dataset.ok = 'x';"),
    ]);
    let tests = vec![
      TaskTest::new("p", "document.querySelector('p') !== null"),
      TaskTest::new("ok", "document.body.dataset.ok === undefined"),
    ];
    let result = Evaluator::default().evaluate(&page, &tests).await.unwrap();
    check(&result, &tests);
    assert!(result.passed, "{:?}", result.messages);
  }

  #[tokio::test]
  async fn empty_test_list_passes() {
    let result = Evaluator::default().evaluate(&FileBundle::new(), &[]).await.unwrap();
    assert!(result.passed);
    assert!(result.messages.is_empty());
  }
}
