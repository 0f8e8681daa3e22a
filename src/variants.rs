//! Themed task variants: one LLM call turns a base task plus a seed into a
//! [`VariantSpec`], which is then overlaid onto the task.

use rand::Rng;
use serde_json::json;
use tracing::{info, instrument};

use crate::config::Prompts;
use crate::domain::{Hint, Task, VariantSpec, VariantTag};
use crate::error::LlmError;
use crate::llm::{strip_code_fence, Completion, LlmClient};
use crate::util::fill_template;

const SEED_LEN: usize = 11;

/// Random lowercase base-36 seed.
pub fn random_seed() -> String {
  const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
  let mut rng = rand::thread_rng();
  (0..SEED_LEN).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

/// Ask the model for a variant. Errors are returned as-is; nothing is retried.
#[instrument(level = "info", target = "variants", skip(llm, prompts, task), fields(task_id = %task.id, %model))]
pub async fn generate_variant(
  llm: &dyn LlmClient,
  prompts: &Prompts,
  model: &str,
  task: &Task,
  seed: &str,
) -> Result<VariantSpec, LlmError> {
  let view = json!({
    "id": task.id,
    "title": task.title,
    "description": task.description,
    "difficulty": task.difficulty,
    "scaffold": task.scaffold,
    "tests": task.tests,
    "hints": task.hints,
  });
  let task_json = serde_json::to_string_pretty(&view).map_err(|e| LlmError::Parse(e.to_string()))?;
  let user = fill_template(&prompts.variant_user_template, &[("seed", seed), ("task_json", &task_json)]);

  let text = llm
    .complete(&Completion {
      model: model.to_string(),
      system: prompts.variant_system.clone(),
      user,
      max_tokens: 2048,
      temperature: 0.8,
    })
    .await?;

  let mut spec: VariantSpec =
    serde_json::from_str(strip_code_fence(&text)).map_err(|e| LlmError::Parse(format!("variant JSON: {e}")))?;
  if spec.seed.is_empty() {
    spec.seed = seed.to_string();
  }
  if spec.title.is_empty() {
    spec.title = task.title.clone();
  }
  if spec.description.is_empty() {
    spec.description = task.description.clone();
  }
  info!(target: "variants", task_id = %task.id, seed = %spec.seed, theme = %spec.theme, overrides = spec.scaffold_overrides.len(), "variant generated");
  Ok(spec)
}

/// Overlay a variant onto its base task.
pub fn merge_variant(task: &Task, spec: &VariantSpec) -> Task {
  let mut merged = task.clone();
  merged.title = spec.title.clone();
  merged.description = spec.description.clone();
  merged.variant = Some(VariantTag { seed: spec.seed.clone(), theme: spec.theme.clone() });
  for (path, content) in &spec.scaffold_overrides {
    merged.scaffold.insert(path.clone(), content.clone());
  }
  merged
    .hints
    .extend(spec.additional_hints.iter().map(|text| Hint { level: None, text: text.clone() }));
  merged
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;

  struct Canned(&'static str);

  #[async_trait]
  impl LlmClient for Canned {
    async fn complete(&self, req: &Completion) -> Result<String, LlmError> {
      assert!(req.user.contains("seed-123"));
      Ok(self.0.to_string())
    }
  }

  fn base() -> Task {
    serde_json::from_value(json!({
      "id": "html-lists-1",
      "title": "Todo list",
      "description": "Build a list",
      "scaffold": {"index.html": "<ul></ul>", "style.css": ""},
      "hints": ["Use <ul>"]
    }))
    .unwrap()
  }

  #[test]
  fn seeds_are_base36() {
    let s = random_seed();
    assert_eq!(s.len(), SEED_LEN);
    assert!(s.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
  }

  #[tokio::test]
  async fn missing_fields_default_to_base_and_request_seed() {
    let llm = Canned("```json\n{\"theme\": \"bakery\"}\n```");
    let spec = generate_variant(&llm, &Prompts::default(), "m", &base(), "seed-123").await.unwrap();
    assert_eq!(spec.seed, "seed-123");
    assert_eq!(spec.title, "Todo list");
    assert_eq!(spec.description, "Build a list");
    assert_eq!(spec.theme, "bakery");
  }

  #[tokio::test]
  async fn unparsable_reply_is_an_error() {
    let llm = Canned("Sure! Here is a fun variant.");
    let err = generate_variant(&llm, &Prompts::default(), "m", &base(), "seed-123").await.unwrap_err();
    assert!(matches!(err, LlmError::Parse(_)));
  }

  #[test]
  fn merge_overlays_scaffold_and_appends_hints() {
    let spec = VariantSpec {
      seed: "s".into(),
      theme: "space".into(),
      title: "Mission log".into(),
      description: "List the checks".into(),
      scaffold_overrides: [("index.html".to_string(), "<ul id='log'></ul>".to_string())].into(),
      additional_hints: vec!["Each check is an <li>".into()],
    };
    let merged = merge_variant(&base(), &spec);
    assert_eq!(merged.title, "Mission log");
    assert_eq!(merged.scaffold["index.html"], "<ul id='log'></ul>");
    assert_eq!(merged.scaffold["style.css"], "");
    assert_eq!(merged.hints.len(), 2);
    assert_eq!(merged.hints[1].text, "Each check is an <li>");
    assert_eq!(merged.variant, Some(VariantTag { seed: "s".into(), theme: "space".into() }));
    assert_eq!(merged.id, "html-lists-1");
  }
}
