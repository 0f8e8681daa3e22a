use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{normalize, TaskSource};
use crate::domain::Task;
use crate::error::StoreError;

/// One JSON array of task-shaped records, read from the first candidate
/// file that is both readable and valid JSON.
pub struct FlatFileSource {
  candidates: Vec<PathBuf>,
}

impl FlatFileSource {
  pub fn new(candidates: Vec<PathBuf>) -> Self {
    Self { candidates }
  }
}

#[async_trait]
impl TaskSource for FlatFileSource {
  fn name(&self) -> &'static str {
    "flat-file"
  }

  #[instrument(level = "debug", target = "tasks", skip(self))]
  async fn all(&self) -> Result<Vec<Task>, StoreError> {
    for path in &self.candidates {
      let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
          debug!(target: "tasks", path = %path.display(), error = %e, "task file unavailable");
          continue;
        }
      };
      let records: Vec<Value> = match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(e) => {
          warn!(target: "tasks", path = %path.display(), error = %e, "corrupt task file skipped");
          continue;
        }
      };

      let mut tasks = Vec::with_capacity(records.len());
      for record in records {
        match normalize::normalize(record) {
          Ok(task) => tasks.push(task),
          Err(e) => warn!(target: "tasks", path = %path.display(), error = %e, "skipping malformed task"),
        }
      }
      debug!(target: "tasks", path = %path.display(), count = tasks.len(), "loaded tasks");
      return Ok(tasks);
    }
    Err(StoreError::NotFound(self.candidates.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn corrupt_candidate_falls_through_to_next() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad.json");
    let good = dir.path().join("good.json");
    std::fs::write(&bad, "[{").unwrap();
    std::fs::write(&good, r#"[{"id":"a","title":"A","difficulty":1},{"id":"b","title":"B","level":2}]"#).unwrap();

    let src = FlatFileSource::new(vec![dir.path().join("absent.json"), bad, good]);
    let tasks = src.all().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(src.get("b").await.unwrap().unwrap().difficulty, 2);
    assert!(src.get("zzz").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn reports_not_found_when_every_candidate_misses() {
    let src = FlatFileSource::new(vec![PathBuf::from("/definitely/not/here.json")]);
    assert!(matches!(src.all().await, Err(StoreError::NotFound(_))));
  }
}
