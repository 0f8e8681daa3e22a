//! In-memory per-concept pass/fail counters.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Pass,
  Fail,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptStats {
  pub passes: u32,
  pub fails: u32,
}

/// Longest concept tag that is counted.
pub const MAX_TAG_LEN: usize = 64;
/// Tags beyond this many in one record are ignored.
pub const MAX_TAGS_PER_RECORD: usize = 32;
/// Once this many concepts are tracked, new ones are no longer added.
pub const MAX_CONCEPTS: usize = 1000;

#[derive(Default)]
pub struct MasteryLedger {
  counts: RwLock<HashMap<String, ConceptStats>>,
}

impl MasteryLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// Count one outcome for every tag. Blank and over-long tags are ignored,
  /// as are new concepts once the ledger is full.
  pub async fn record(&self, tags: &[String], outcome: Outcome) {
    if tags.len() > MAX_TAGS_PER_RECORD {
      warn!(target: "tutor", tags = tags.len(), "too many concept tags; extra tags ignored");
    }
    let mut counts = self.counts.write().await;
    let usable = tags
      .iter()
      .take(MAX_TAGS_PER_RECORD)
      .map(|t| t.trim())
      .filter(|t| !t.is_empty() && t.len() <= MAX_TAG_LEN);
    for tag in usable {
      if !counts.contains_key(tag) && counts.len() >= MAX_CONCEPTS {
        warn!(target: "tutor", concept = %tag, "mastery ledger full; concept not tracked");
        continue;
      }
      let entry = counts.entry(tag.to_string()).or_default();
      match outcome {
        Outcome::Pass => entry.passes += 1,
        Outcome::Fail => entry.fails += 1,
      }
      debug!(target: "tutor", concept = %tag, ?outcome, passes = entry.passes, fails = entry.fails, "mastery updated");
    }
  }

  pub async fn snapshot(&self) -> BTreeMap<String, ConceptStats> {
    self.counts.read().await.iter().map(|(k, v)| (k.clone(), *v)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn counts_accumulate_per_tag() {
    let ledger = MasteryLedger::new();
    let tags = vec!["html-basics".to_string(), " ".to_string(), "css-basics".to_string()];
    ledger.record(&tags, Outcome::Pass).await;
    ledger.record(&tags[..1], Outcome::Fail).await;

    let snap = ledger.snapshot().await;
    assert_eq!(snap.len(), 2);
    assert_eq!(snap["html-basics"], ConceptStats { passes: 1, fails: 1 });
    assert_eq!(snap["css-basics"], ConceptStats { passes: 1, fails: 0 });
    assert_eq!(snap.keys().next().map(String::as_str), Some("css-basics"));
  }

  #[tokio::test]
  async fn oversized_and_excess_tags_are_bounded() {
    let ledger = MasteryLedger::new();
    let long = "x".repeat(MAX_TAG_LEN + 1);
    ledger.record(&[long, "ok".to_string()], Outcome::Pass).await;
    assert_eq!(ledger.snapshot().await.keys().collect::<Vec<_>>(), vec!["ok"]);

    let many: Vec<String> = (0..MAX_TAGS_PER_RECORD + 5).map(|i| format!("t{i}")).collect();
    ledger.record(&many, Outcome::Fail).await;
    assert_eq!(ledger.snapshot().await.len(), 1 + MAX_TAGS_PER_RECORD);

    for chunk in (0..MAX_CONCEPTS * 2).collect::<Vec<_>>().chunks(MAX_TAGS_PER_RECORD) {
      let tags: Vec<String> = chunk.iter().map(|i| format!("c{i}")).collect();
      ledger.record(&tags, Outcome::Pass).await;
    }
    let snap = ledger.snapshot().await;
    assert_eq!(snap.len(), MAX_CONCEPTS);
    // Concepts already tracked keep counting.
    ledger.record(&["ok".to_string()], Outcome::Pass).await;
    assert_eq!(ledger.snapshot().await["ok"], ConceptStats { passes: 2, fails: 0 });
  }

  #[test]
  fn outcome_wire_names() {
    assert_eq!(serde_json::to_string(&Outcome::Pass).unwrap(), "\"pass\"");
    assert_eq!(serde_json::from_str::<Outcome>("\"fail\"").unwrap(), Outcome::Fail);
  }
}
