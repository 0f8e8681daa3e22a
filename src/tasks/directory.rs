use std::{collections::HashSet, path::{Path, PathBuf}};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{normalize, TaskSource};
use crate::domain::Task;
use crate::error::StoreError;

/// Reads every `*.json` file of the first readable candidate directory.
/// A file may hold one challenge object or an array of them.
pub struct DirectorySource {
  candidates: Vec<PathBuf>,
}

impl DirectorySource {
  pub fn new(candidates: Vec<PathBuf>) -> Self {
    Self { candidates }
  }

  async fn json_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) == Some("json") {
        files.push(path);
      }
    }
    files.sort();
    Ok(files)
  }

  async fn read_file(path: &Path) -> Result<Vec<Task>, StoreError> {
    let raw = tokio::fs::read_to_string(path)
      .await
      .map_err(|source| StoreError::Io { path: path.to_path_buf(), source })?;
    let value: Value = serde_json::from_str(&raw)
      .map_err(|source| StoreError::Parse { path: path.to_path_buf(), source })?;
    let records = match value {
      Value::Array(items) => items,
      other => vec![other],
    };

    let mut tasks = Vec::with_capacity(records.len());
    for record in records {
      match normalize::from_challenge(record) {
        Ok(task) => tasks.push(task),
        Err(e) => warn!(target: "tasks", path = %path.display(), error = %e, "skipping malformed challenge"),
      }
    }
    Ok(tasks)
  }
}

#[async_trait]
impl TaskSource for DirectorySource {
  fn name(&self) -> &'static str {
    "directory"
  }

  #[instrument(level = "debug", target = "tasks", skip(self))]
  async fn all(&self) -> Result<Vec<Task>, StoreError> {
    for dir in &self.candidates {
      let files = match Self::json_files(dir).await {
        Ok(files) => files,
        Err(e) => {
          debug!(target: "tasks", dir = %dir.display(), error = %e, "challenge directory unavailable");
          continue;
        }
      };

      let mut seen = HashSet::new();
      let mut tasks = Vec::new();
      for path in files {
        match Self::read_file(&path).await {
          Ok(found) => {
            for task in found {
              if seen.insert(task.id.clone()) {
                tasks.push(task);
              } else {
                warn!(target: "tasks", id = %task.id, path = %path.display(), "duplicate challenge id ignored");
              }
            }
          }
          Err(e) => warn!(target: "tasks", error = %e, "skipping unreadable challenge file"),
        }
      }
      debug!(target: "tasks", dir = %dir.display(), count = tasks.len(), "loaded challenges");
      return Ok(tasks);
    }
    Err(StoreError::NotFound(self.candidates.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn first_existing_directory_wins_and_corrupt_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
      dir.path().join("a.json"),
      r#"[{"id":"c1","title":"One","level":1,"tests":[{"id":"t1","type":"dom-assert","selector":"h1"}]},
          {"id":"c2","title":"Two","level":2}]"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("b.json"), r#"{"id":"c3","title":"Three"}"#).unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let missing = dir.path().join("missing");
    let src = DirectorySource::new(vec![missing, dir.path().to_path_buf()]);
    let mut ids: Vec<String> = src.all().await.unwrap().into_iter().map(|t| t.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);

    let c1 = src.get("c1").await.unwrap().unwrap();
    assert_eq!(c1.tests[0].code, r#"document.querySelector("h1") !== null"#);
  }

  #[tokio::test]
  async fn all_candidates_missing_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let src = DirectorySource::new(vec![dir.path().join("nope")]);
    assert!(matches!(src.all().await, Err(StoreError::NotFound(_))));
  }
}
