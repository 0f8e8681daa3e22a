//! Runtime configuration: environment variables plus optional TOML prompt
//! overrides at `AGENT_CONFIG_PATH`.
//!
//! Environment:
//!   PORT                : u16 (default 3000)
//!   ANTHROPIC_API_KEY   : enables the LLM client when present
//!   ANTHROPIC_BASE_URL  : default "https://api.anthropic.com/v1"
//!   CLAUDE_MODEL        : model for variant generation
//!   TUTOR_MODEL         : model for tutor replies
//!   TASK_SOURCE         : "local" (default) or "db"
//!   TASKS_DIR           : comma-separated challenge directories, tried in order
//!   TASKS_FILE          : comma-separated flat task files, tried in order
//!   TASKS_DB_PATH       : SQLite file for TASK_SOURCE=db (default "data/tasks.db")
//!   EVAL_SETTLE_MS      : settle delay before predicates run (default 100)
//!   STATIC_DIR          : prebuilt frontend (default "./static")
//!   AGENT_CONFIG_PATH   : TOML with a `[prompts]` table

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::sandbox::DEFAULT_SETTLE_MS;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_VARIANT_MODEL: &str = "claude-3-5-haiku-20241022";
pub const DEFAULT_TUTOR_MODEL: &str = "claude-haiku-4-5-20251001";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AgentConfig {
  #[serde(default)]
  pub prompts: Prompts,
}

/// System prompts. Any subset can be overridden from TOML.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub tutor_system: String,
  pub variant_system: String,
  pub variant_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      tutor_system: TUTOR_SYSTEM.trim().into(),
      variant_system: VARIANT_SYSTEM.trim().into(),
      variant_user_template: VARIANT_USER_TEMPLATE.trim().into(),
    }
  }
}

const TUTOR_SYSTEM: &str = r#"
You are an AI coding tutor helping students learn web development through hands-on practice.

# Your Role
- Guide students to discover solutions through Socratic questioning
- Provide hints at appropriate levels (1=subtle, 2=moderate, 3=direct)
- Never give full solutions unless explicitly requested and confirmed
- Encourage testing and iteration

# Response Format
You MUST respond with valid JSON matching this schema:

{
  "ui_messages": [
    {"type": "assistant", "text": "Your message to the student"}
  ],
  "hint": {"level": 1|2|3, "concept_tag": "string|null"},
  "actions": [
    {"type": "write_files", "files": {"path": "code"}},
    {"type": "run"},
    {"type": "run_tests"},
    {"type": "open_path", "path": "index.html"},
    {"type": "update_mastery", "concept_tags": ["html-basics"], "result": "pass"|"fail"},
    {"type": "pick_next_task", "strategy": "just-right"|"sequential"},
    {"type": "reveal_solution", "confirm": true}
  ]
}

# Context You'll Receive
- task: Current task details with tests
- test_result: Latest test results (if any)
- editor: Current file state and open path
- student: Preferences and flags

# Guidelines
- Keep code snippets small (5 lines or fewer unless revealing the solution)
- Always run_tests after code changes
- Praise effort and progress
- Ask clarifying questions when the student is stuck
- Use hint levels based on context

# Examples
Student: "I'm stuck"
Response: {"ui_messages": [{"type": "assistant", "text": "Let's break this down. What HTML element creates a heading?"}], "hint": {"level": 1, "concept_tag": "html-headings"}}

Student: "Add a heading for me"
Response: {"ui_messages": [{"type": "assistant", "text": "I'll add an h1 element. Let's see how it looks!"}], "actions": [{"type": "write_files", "files": {"index.html": "...with <h1> added..."}}, {"type": "run"}, {"type": "run_tests"}]}
"#;

const VARIANT_SYSTEM: &str = r#"
You rewrite web development exercises into themed variants. The learning goal and
the tests must stay exactly the same; only the story, wording and starter content
change. Respond ONLY with strict JSON.
"#;

const VARIANT_USER_TEMPLATE: &str = r#"
Seed: {seed}
Use the seed to pick a theme (for example a bakery, a space station, a bookshop)
so that the same seed always leads to the same theme.

Base task (JSON):
{task_json}

Return JSON with fields:
{"seed": string, "theme": string, "title": string, "description": string,
 "scaffold_overrides": {"<path>": "<file contents>"}, "additional_hints": [string]}
Only override scaffold files when the theme changes their text. Keep element ids,
classes and structure the tests rely on.
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskBackend {
  Local,
  Db,
}

#[derive(Clone, Debug)]
pub struct TaskStoreConfig {
  pub backend: TaskBackend,
  pub dirs: Vec<PathBuf>,
  pub files: Vec<PathBuf>,
  pub db_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
  pub api_key: Option<String>,
  pub base_url: String,
  pub variant_model: String,
  pub tutor_model: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
  pub port: u16,
  pub llm: LlmConfig,
  pub tasks: TaskStoreConfig,
  pub settle_ms: u64,
  pub static_dir: PathBuf,
  pub prompts: Prompts,
}

impl AppConfig {
  pub fn from_env() -> Self {
    let prompts = load_agent_config_from_env().map(|c| c.prompts).unwrap_or_default();
    Self::from_lookup(|key| std::env::var(key).ok(), prompts)
  }

  /// Build from an arbitrary variable lookup. Unparsable values fall back to
  /// defaults with a warning.
  pub fn from_lookup(var: impl Fn(&str) -> Option<String>, prompts: Prompts) -> Self {
    let var = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let port = parsed(&var, "PORT").unwrap_or(3000);
    let settle_ms = parsed(&var, "EVAL_SETTLE_MS").unwrap_or(DEFAULT_SETTLE_MS);

    let backend = match var("TASK_SOURCE").as_deref() {
      None | Some("local") => TaskBackend::Local,
      Some("db") | Some("sqlite") => TaskBackend::Db,
      Some(other) => {
        warn!(target: "aictutor_backend", value = %other, "unknown TASK_SOURCE, using local");
        TaskBackend::Local
      }
    };

    Self {
      port,
      llm: LlmConfig {
        api_key: var("ANTHROPIC_API_KEY"),
        base_url: var("ANTHROPIC_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
        variant_model: var("CLAUDE_MODEL").unwrap_or_else(|| DEFAULT_VARIANT_MODEL.into()),
        tutor_model: var("TUTOR_MODEL").unwrap_or_else(|| DEFAULT_TUTOR_MODEL.into()),
      },
      tasks: TaskStoreConfig {
        backend,
        dirs: path_list(var("TASKS_DIR"), &["data/challenges", "apps/web/data/challenges"]),
        files: path_list(var("TASKS_FILE"), &["data/tasks.levels.json", "apps/web/data/tasks.levels.json"]),
        db_path: var("TASKS_DB_PATH").map(PathBuf::from).unwrap_or_else(|| "data/tasks.db".into()),
      },
      settle_ms,
      static_dir: var("STATIC_DIR").map(PathBuf::from).unwrap_or_else(|| "./static".into()),
      prompts,
    }
  }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
  let raw = var(key)?;
  match raw.parse() {
    Ok(v) => Some(v),
    Err(_) => {
      warn!(target: "aictutor_backend", %key, value = %raw, "ignoring unparsable setting");
      None
    }
  }
}

fn path_list(raw: Option<String>, defaults: &[&str]) -> Vec<PathBuf> {
  match raw {
    Some(list) => list
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(PathBuf::from)
      .collect(),
    None => defaults.iter().map(PathBuf::from).collect(),
  }
}

/// Attempt to load `AgentConfig` from AGENT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_agent_config_from_env() -> Option<AgentConfig> {
  let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<AgentConfig>(&s) {
      Ok(cfg) => {
        info!(target: "aictutor_backend", %path, "Loaded agent config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "aictutor_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "aictutor_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(pairs: &[(&str, &str)]) -> AppConfig {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    AppConfig::from_lookup(|k| vars.get(k).cloned(), Prompts::default())
  }

  #[test]
  fn defaults_apply_when_unset() {
    let cfg = config(&[]);
    assert_eq!(cfg.port, 3000);
    assert_eq!(cfg.settle_ms, 100);
    assert_eq!(cfg.tasks.backend, TaskBackend::Local);
    assert_eq!(cfg.tasks.dirs[0], PathBuf::from("data/challenges"));
    assert!(cfg.llm.api_key.is_none());
    assert_eq!(cfg.llm.tutor_model, DEFAULT_TUTOR_MODEL);
  }

  #[test]
  fn env_values_override_and_split_lists() {
    let cfg = config(&[
      ("PORT", "8080"),
      ("EVAL_SETTLE_MS", "250"),
      ("TASK_SOURCE", "db"),
      ("TASKS_FILE", "a.json, b.json"),
      ("ANTHROPIC_API_KEY", "k"),
    ]);
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.settle_ms, 250);
    assert_eq!(cfg.tasks.backend, TaskBackend::Db);
    assert_eq!(cfg.tasks.files, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
    assert_eq!(cfg.llm.api_key.as_deref(), Some("k"));
  }

  #[test]
  fn bad_numbers_fall_back() {
    let cfg = config(&[("PORT", "eighty"), ("EVAL_SETTLE_MS", "-1")]);
    assert_eq!(cfg.port, 3000);
    assert_eq!(cfg.settle_ms, 100);
  }

  #[test]
  fn toml_prompts_override_partially() {
    let cfg: AgentConfig = toml::from_str("[prompts]\ntutor_system = \"Be brief.\"\n").unwrap();
    assert_eq!(cfg.prompts.tutor_system, "Be brief.");
    assert!(cfg.prompts.variant_user_template.contains("{seed}"));
  }
}
