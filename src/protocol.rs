//! Public request/response structs for the HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{FileBundle, Task, TaskTest, VariantSpec};
use crate::mastery::{ConceptStats, Outcome};

#[derive(Debug, Serialize)]
pub struct HealthOut {
  pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct VariantIn {
  #[serde(default)]
  pub task_id: Option<String>,
  #[serde(default)]
  pub seed: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VariantOut {
  pub task: Task,
  pub variant: VariantSpec,
}

/// Only the tests of the submitted task matter for evaluation.
#[derive(Debug, Deserialize)]
pub struct EvalTask {
  #[serde(default)]
  pub tests: Vec<TaskTest>,
}

#[derive(Debug, Deserialize)]
pub struct EvalIn {
  #[serde(default)]
  pub task: Option<EvalTask>,
  #[serde(default)]
  pub files: Option<FileBundle>,
}

/// Query strings stay raw so bad numbers can be reported as 400s.
#[derive(Debug, Default, Deserialize)]
pub struct TasksQuery {
  #[serde(default)]
  pub level: Option<String>,
  #[serde(default)]
  pub difficulty: Option<String>,
  #[serde(default, rename = "conceptId")]
  pub concept_id: Option<String>,
  #[serde(default)]
  pub limit: Option<String>,
  #[serde(default)]
  pub offset: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TutorIn {
  #[serde(default, rename = "userText")]
  pub user_text: Option<String>,
  #[serde(default)]
  pub context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct MasteryIn {
  #[serde(default)]
  pub tags: Vec<String>,
  pub result: Outcome,
}

#[derive(Debug, Serialize)]
pub struct MasteryOut {
  pub ok: bool,
  pub mastery: BTreeMap<String, ConceptStats>,
}
