//! Domain models used by the backend: tasks, their tests and solutions,
//! evaluation results and LLM-produced variant overlays.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// File path -> text content. Keys are conventionally `index.html`,
/// `style.css` and `script.js`, but nothing enforces that.
pub type FileBundle = BTreeMap<String, String>;

/// One predicate test. `code` is a boolean expression evaluated against the
/// rendered document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskTest {
  pub id: String,
  #[serde(default)]
  pub code: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub success_message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure_message: Option<String>,
}

impl TaskTest {
  pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      code: code.into(),
      label: None,
      success_message: None,
      failure_message: None,
    }
  }
}

/// Extra solution shown in the "Solutions" tab.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlternativeSolution {
  pub label: String,
  pub files: FileBundle,
  pub explanation: String,
}

/// A hint, optionally leveled (1 = subtle .. 3 = direct).
/// Accepts either a bare string or `{level, text}` on input.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(from = "HintRepr")]
pub struct Hint {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub level: Option<u8>,
  pub text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HintRepr {
  Text(String),
  Full {
    #[serde(default)]
    level: Option<u8>,
    text: String,
  },
}

impl From<HintRepr> for Hint {
  fn from(r: HintRepr) -> Self {
    match r {
      HintRepr::Text(text) => Hint { level: None, text },
      HintRepr::Full { level, text } => Hint { level, text },
    }
  }
}

/// Seed/theme marker carried by a task that was merged with a variant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VariantTag {
  pub seed: String,
  pub theme: String,
}

/// Canonical task record. Both on-disk schemas normalize into this.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default = "default_difficulty", alias = "level")]
  pub difficulty: u32,
  #[serde(default)]
  pub scaffold: FileBundle,
  #[serde(default)]
  pub tests: Vec<TaskTest>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub solution: Option<FileBundle>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub alternative_solutions: Vec<AlternativeSolution>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub hints: Vec<Hint>,
  #[serde(default)]
  pub concept_ids: Vec<String>,
  #[serde(default)]
  pub prerequisites: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub detailed_description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub real_world_context: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub variant: Option<VariantTag>,
}

pub fn default_difficulty() -> u32 { 1 }

/// Outcome of one evaluation run. Recomputed on every run, never stored.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
  pub passed: bool,
  pub passed_ids: Vec<String>,
  pub failed_ids: Vec<String>,
  pub messages: BTreeMap<String, String>,
}

impl TestResult {
  /// Shape returned when evaluation itself blew up.
  pub fn internal_failure() -> Self {
    let mut messages = BTreeMap::new();
    messages.insert("error".to_string(), "Failed to run tests".to_string());
    Self { passed: false, passed_ids: Vec::new(), failed_ids: Vec::new(), messages }
  }
}

/// LLM-produced overlay for a task. Merged at request time, never persisted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct VariantSpec {
  #[serde(default)]
  pub seed: String,
  #[serde(default)]
  pub theme: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub scaffold_overrides: FileBundle,
  #[serde(default)]
  pub additional_hints: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hints_accept_strings_and_objects() {
    let hints: Vec<Hint> =
      serde_json::from_str(r#"["plain", {"level": 2, "text": "leveled"}]"#).unwrap();
    assert_eq!(hints[0], Hint { level: None, text: "plain".into() });
    assert_eq!(hints[1], Hint { level: Some(2), text: "leveled".into() });
  }

  #[test]
  fn task_defaults_fill_missing_fields() {
    let t: Task = serde_json::from_str(r#"{"id": "a", "title": "A"}"#).unwrap();
    assert_eq!(t.difficulty, 1);
    assert!(t.tests.is_empty());
    assert!(t.solution.is_none());
  }

  #[test]
  fn test_result_uses_camel_case_keys() {
    let r = TestResult { passed: true, passed_ids: vec!["t1".into()], ..Default::default() };
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["passedIds"][0], "t1");
    assert!(v["failedIds"].as_array().unwrap().is_empty());
  }
}
