//! The tutor's JSON reply protocol and its parse policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::FileBundle;
use crate::llm::strip_code_fence;
use crate::mastery::Outcome;

pub const FORMAT_FALLBACK: &str =
  "I had trouble formatting my response. Let me help you differently - what specific part are you working on?";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  JustRight,
  Sequential,
}

/// One side effect the tutor asks the host to perform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TutorAction {
  WriteFiles { files: FileBundle },
  Run,
  RunTests,
  OpenPath { path: String },
  UpdateMastery { concept_tags: Vec<String>, result: Outcome },
  PickNextTask { strategy: Strategy },
  RevealSolution {
    #[serde(default)]
    confirm: bool,
  },
}

impl TutorAction {
  pub fn kind(&self) -> &'static str {
    match self {
      TutorAction::WriteFiles { .. } => "write_files",
      TutorAction::Run => "run",
      TutorAction::RunTests => "run_tests",
      TutorAction::OpenPath { .. } => "open_path",
      TutorAction::UpdateMastery { .. } => "update_mastery",
      TutorAction::PickNextTask { .. } => "pick_next_task",
      TutorAction::RevealSolution { .. } => "reveal_solution",
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
  #[serde(rename = "type")]
  pub kind: String,
  pub text: String,
}

impl UiMessage {
  pub fn assistant(text: impl Into<String>) -> Self {
    Self { kind: "assistant".into(), text: text.into() }
  }

  pub fn system(text: impl Into<String>) -> Self {
    Self { kind: "system".into(), text: text.into() }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HintRef {
  pub level: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub concept_tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TutorReply {
  pub ui_messages: Vec<UiMessage>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hint: Option<HintRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub actions: Option<Vec<TutorAction>>,
}

impl TutorReply {
  pub fn message(msg: UiMessage) -> Self {
    Self { ui_messages: vec![msg], hint: None, actions: None }
  }

  /// Reply used when the model's output is not parseable JSON.
  pub fn format_fallback() -> Self {
    Self::message(UiMessage::assistant(FORMAT_FALLBACK))
  }

  pub fn actions(&self) -> &[TutorAction] {
    self.actions.as_deref().unwrap_or_default()
  }
}

/// Parse raw model text.
///
/// A surrounding code fence is stripped. Text that is not a JSON object
/// becomes the fixed fallback reply. Inside a valid object, malformed
/// messages, out-of-range hints and unknown or malformed actions are dropped
/// individually.
pub fn parse_reply(text: &str) -> TutorReply {
  let value: Value = match serde_json::from_str(strip_code_fence(text)) {
    Ok(Value::Object(map)) => Value::Object(map),
    Ok(_) | Err(_) => {
      warn!(target: "tutor", len = text.len(), "model reply is not a JSON object, using fallback");
      return TutorReply::format_fallback();
    }
  };

  let ui_messages = value
    .get("ui_messages")
    .and_then(Value::as_array)
    .map(|msgs| {
      msgs
        .iter()
        .filter_map(|m| match serde_json::from_value::<UiMessage>(m.clone()) {
          Ok(msg) => Some(msg),
          Err(e) => {
            warn!(target: "tutor", error = %e, "dropping malformed ui message");
            None
          }
        })
        .collect()
    })
    .unwrap_or_default();

  let hint = value.get("hint").filter(|h| !h.is_null()).and_then(|h| {
    match serde_json::from_value::<HintRef>(h.clone()) {
      Ok(hint) if (1..=3).contains(&hint.level) => Some(hint),
      Ok(hint) => {
        warn!(target: "tutor", level = hint.level, "dropping hint with out-of-range level");
        None
      }
      Err(e) => {
        warn!(target: "tutor", error = %e, "dropping malformed hint");
        None
      }
    }
  });

  let actions = value.get("actions").and_then(Value::as_array).map(|raw| parse_actions(raw));

  TutorReply { ui_messages, hint, actions }
}

fn parse_actions(raw: &[Value]) -> Vec<TutorAction> {
  raw
    .iter()
    .filter_map(|a| match serde_json::from_value::<TutorAction>(a.clone()) {
      Ok(action) => Some(action),
      Err(e) => {
        let kind = a.get("type").and_then(Value::as_str).unwrap_or("<missing>");
        warn!(target: "tutor", %kind, error = %e, "dropping unknown or malformed action");
        None
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fenced_reply_with_all_parts() {
    let text = r#"```json
{
  "ui_messages": [{"type": "assistant", "text": "Try an h1."}],
  "hint": {"level": 2, "concept_tag": "html-headings"},
  "actions": [
    {"type": "write_files", "files": {"index.html": "<h1>Hi</h1>"}},
    {"type": "run"},
    {"type": "run_tests"},
    {"type": "open_path", "path": "style.css"},
    {"type": "update_mastery", "concept_tags": ["html-basics"], "result": "pass"},
    {"type": "pick_next_task", "strategy": "just-right"},
    {"type": "reveal_solution", "confirm": true}
  ]
}
```"#;
    let reply = parse_reply(text);
    assert_eq!(reply.ui_messages, vec![UiMessage::assistant("Try an h1.")]);
    assert_eq!(reply.hint, Some(HintRef { level: 2, concept_tag: Some("html-headings".into()) }));
    let kinds: Vec<_> = reply.actions().iter().map(TutorAction::kind).collect();
    assert_eq!(
      kinds,
      vec!["write_files", "run", "run_tests", "open_path", "update_mastery", "pick_next_task", "reveal_solution"]
    );
    assert_eq!(reply.actions()[5], TutorAction::PickNextTask { strategy: Strategy::JustRight });
  }

  #[test]
  fn unparsable_text_yields_fallback() {
    let reply = parse_reply("Sure, let me help! First, add a heading.");
    assert_eq!(reply.ui_messages[0].text, FORMAT_FALLBACK);
    assert_eq!(reply.ui_messages[0].kind, "assistant");
    assert!(reply.actions.is_none());
    assert_eq!(parse_reply("[1, 2]"), TutorReply::format_fallback());
  }

  #[test]
  fn out_of_range_hint_is_dropped() {
    let reply = parse_reply(r#"{"ui_messages": [], "hint": {"level": 5}}"#);
    assert!(reply.hint.is_none());
    let reply = parse_reply(r#"{"ui_messages": [], "hint": {"level": 0, "concept_tag": null}}"#);
    assert!(reply.hint.is_none());
  }

  #[test]
  fn unknown_actions_are_dropped_in_place() {
    let reply = parse_reply(
      r#"{"ui_messages": [{"type": "assistant", "text": "ok"}],
          "actions": [{"type": "format_disk"}, {"type": "run"}, {"type": "open_path"}, {"type": "reveal_solution"}]}"#,
    );
    assert_eq!(reply.actions(), &[TutorAction::Run, TutorAction::RevealSolution { confirm: false }]);
  }

  #[test]
  fn serializes_back_to_the_wire_shape() {
    let reply = TutorReply {
      ui_messages: vec![UiMessage::assistant("hi")],
      hint: None,
      actions: Some(vec![TutorAction::UpdateMastery { concept_tags: vec!["a".into()], result: Outcome::Fail }]),
    };
    let v = serde_json::to_value(&reply).unwrap();
    assert_eq!(v["actions"][0]["type"], "update_mastery");
    assert_eq!(v["actions"][0]["result"], "fail");
    assert!(v.get("hint").is_none());
  }
}
