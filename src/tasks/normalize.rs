//! One `Task` out of two on-disk schemas.
//!
//! The *task* shape is the canonical record itself (`scaffold`, `tests` with
//! predicate code, `solution`). The *challenge* shape comes from authored
//! challenge packs: `starterFiles`, typed tests and a `solutions` array.

use serde::Deserialize;
use serde_json::Value;

use super::challenge::{compile_test, TypedTest};
use crate::domain::{default_difficulty, AlternativeSolution, FileBundle, Hint, Task};

const DEFAULT_EXPLANATION: &str = "An alternative solution approach.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeRecord {
  id: String,
  title: String,
  #[serde(default)]
  description: String,
  #[serde(default)]
  detailed_description: Option<String>,
  #[serde(default)]
  real_world_context: Option<String>,
  #[serde(default)]
  category: Option<String>,
  #[serde(default)]
  level: Option<Value>,
  #[serde(default)]
  difficulty: Option<Value>,
  #[serde(default)]
  starter_files: Option<FileBundle>,
  #[serde(default)]
  files: Option<FileBundle>,
  #[serde(default)]
  scaffold: Option<FileBundle>,
  #[serde(default)]
  solutions: Vec<SolutionRecord>,
  #[serde(default)]
  solution: Option<FileBundle>,
  #[serde(default)]
  tests: Vec<TypedTest>,
  #[serde(default)]
  hints: Vec<Hint>,
  #[serde(default, alias = "concepts")]
  concept_ids: Vec<String>,
  #[serde(default)]
  prerequisites: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SolutionRecord {
  #[serde(default)]
  id: Option<String>,
  #[serde(default)]
  files: FileBundle,
  #[serde(default)]
  explanation: Option<String>,
}

/// True when a record carries challenge-only fields.
pub fn is_challenge_shape(v: &Value) -> bool {
  let Some(obj) = v.as_object() else { return false };
  if obj.contains_key("starterFiles") || obj.contains_key("solutions") {
    return true;
  }
  obj
    .get("tests")
    .and_then(Value::as_array)
    .map(|tests| tests.iter().any(|t| t.get("type").is_some()))
    .unwrap_or(false)
}

/// Normalize a record of either shape.
pub fn normalize(v: Value) -> Result<Task, serde_json::Error> {
  if is_challenge_shape(&v) {
    from_challenge(v)
  } else {
    serde_json::from_value(v)
  }
}

/// Normalize a challenge-shaped record, compiling its typed tests.
pub fn from_challenge(v: Value) -> Result<Task, serde_json::Error> {
  let rec: ChallengeRecord = serde_json::from_value(v)?;
  let difficulty = rec
    .difficulty
    .as_ref()
    .or(rec.level.as_ref())
    .and_then(level_number)
    .unwrap_or_else(default_difficulty);

  let scaffold = rec.starter_files.or(rec.files).or(rec.scaffold).unwrap_or_default();
  let tests = rec
    .tests
    .into_iter()
    .enumerate()
    .map(|(i, t)| compile_test(&rec.id, i + 1, t))
    .collect();

  let mut solutions = rec.solutions.into_iter();
  // Without any solution the starter files stand in for one.
  let solution = solutions.next().map(|s| s.files).or(rec.solution).or_else(|| Some(scaffold.clone()));
  let alternative_solutions = solutions
    .map(|s| AlternativeSolution {
      label: s.id.unwrap_or_else(|| "Alternative".into()),
      files: s.files,
      explanation: s.explanation.unwrap_or_else(|| DEFAULT_EXPLANATION.into()),
    })
    .collect();

  Ok(Task {
    id: rec.id,
    title: rec.title,
    description: rec.description,
    difficulty,
    scaffold,
    tests,
    solution,
    alternative_solutions,
    hints: rec.hints,
    concept_ids: rec.concept_ids,
    prerequisites: rec.prerequisites,
    category: rec.category,
    detailed_description: rec.detailed_description,
    real_world_context: rec.real_world_context,
    variant: None,
  })
}

fn level_number(v: &Value) -> Option<u32> {
  match v {
    Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn challenge_shape_is_normalized() {
    let v = json!({
      "id": "html-001",
      "title": "Heading",
      "level": 2,
      "category": "html",
      "realWorldContext": "Every page has one.",
      "starterFiles": {"index.html": "<body></body>"},
      "solutions": [
        {"id": "main", "files": {"index.html": "<h1>A</h1>"}},
        {"id": "semantic", "files": {"index.html": "<header><h1>A</h1></header>"}, "explanation": "Wrapped."},
        {"files": {"index.html": "<h1>B</h1>"}}
      ],
      "tests": [
        {"id": "t1", "type": "dom-assert", "selector": "h1", "description": "has a heading"}
      ]
    });
    assert!(is_challenge_shape(&v));
    let t = normalize(v).unwrap();
    assert_eq!(t.difficulty, 2);
    assert_eq!(t.scaffold["index.html"], "<body></body>");
    assert_eq!(t.solution.as_ref().unwrap()["index.html"], "<h1>A</h1>");
    assert_eq!(t.alternative_solutions.len(), 2);
    assert_eq!(t.alternative_solutions[0].label, "semantic");
    assert_eq!(t.alternative_solutions[0].explanation, "Wrapped.");
    assert_eq!(t.alternative_solutions[1].label, "Alternative");
    assert_eq!(t.alternative_solutions[1].explanation, DEFAULT_EXPLANATION);
    assert_eq!(t.tests[0].label.as_deref(), Some("has a heading"));
    assert_eq!(t.category.as_deref(), Some("html"));

    let bare = json!({
      "id": "html-009",
      "title": "Bare",
      "starterFiles": {"index.html": "<main></main>"},
      "tests": [{"id": "t1", "type": "dom-assert", "selector": "main"}]
    });
    let t = normalize(bare).unwrap();
    assert_eq!(t.solution.as_ref(), Some(&t.scaffold));
    assert!(t.alternative_solutions.is_empty());
  }

  #[test]
  fn task_shape_passes_through_and_accepts_level() {
    let v = json!({
      "id": "html-lists-1",
      "title": "Todo list",
      "level": 3,
      "scaffold": {"index.html": ""},
      "tests": [{"id": "has-ul", "code": "document.querySelector('ul') !== null"}],
      "hints": ["Use <ul>", {"level": 2, "text": "Wrap <li>"}]
    });
    assert!(!is_challenge_shape(&v));
    let t = normalize(v).unwrap();
    assert_eq!(t.difficulty, 3);
    assert_eq!(t.tests[0].label, None);
    assert_eq!(t.hints.len(), 2);
  }

  #[test]
  fn string_levels_are_parsed() {
    let v = json!({"id": "x", "title": "X", "difficulty": "4", "solutions": []});
    assert_eq!(normalize(v).unwrap().difficulty, 4);
  }
}
