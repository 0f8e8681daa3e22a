//! Application state shared by every handler.
//!
//! This module owns:
//!   - the configured task source
//!   - the LLM client (real or disabled) and the tutor built on it
//!   - the evaluator with its settle delay
//!   - the mastery ledger

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::{AppConfig, Prompts};
use crate::error::StoreError;
use crate::llm::{build_client, LlmClient};
use crate::mastery::MasteryLedger;
use crate::sandbox::Evaluator;
use crate::tasks::{build_source, TaskSource};
use crate::tutor::{host::HeadlessHost, Tutor};

pub struct AppState {
  pub tasks: Arc<dyn TaskSource>,
  pub llm: Arc<dyn LlmClient>,
  pub tutor: Tutor,
  pub evaluator: Evaluator,
  pub mastery: Arc<MasteryLedger>,
  pub prompts: Prompts,
  pub variant_model: String,
}

impl AppState {
  /// Build state from configuration: task source, LLM client, evaluator.
  #[instrument(level = "info", skip_all)]
  pub fn from_config(cfg: &AppConfig) -> Result<Self, StoreError> {
    let tasks = build_source(&cfg.tasks)?;
    let llm = build_client(&cfg.llm);
    info!(
      target: "aictutor_backend",
      source = tasks.name(),
      settle_ms = cfg.settle_ms,
      "state ready"
    );
    Ok(Self::new(
      tasks,
      llm,
      Evaluator::new(cfg.settle_ms),
      cfg.prompts.clone(),
      &cfg.llm.variant_model,
      &cfg.llm.tutor_model,
    ))
  }

  pub fn new(
    tasks: Arc<dyn TaskSource>,
    llm: Arc<dyn LlmClient>,
    evaluator: Evaluator,
    prompts: Prompts,
    variant_model: &str,
    tutor_model: &str,
  ) -> Self {
    let tutor = Tutor::new(llm.clone(), tutor_model, prompts.tutor_system.clone());
    Self {
      tasks,
      llm,
      tutor,
      evaluator,
      mastery: Arc::new(MasteryLedger::new()),
      prompts,
      variant_model: variant_model.to_string(),
    }
  }

  /// Fresh host for one server-side tutor turn.
  pub fn headless_host(&self) -> HeadlessHost {
    HeadlessHost::new(self.tasks.clone(), self.evaluator.clone(), self.mastery.clone())
  }
}
