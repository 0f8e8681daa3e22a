use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use tracing::{instrument, warn};

use super::TaskSource;
use crate::domain::Task;
use crate::error::StoreError;

/// Sources consulted in priority order. Earlier layers win on id collisions;
/// a failing layer is logged and skipped as long as another one answers.
pub struct LayeredSource {
  layers: Vec<Arc<dyn TaskSource>>,
}

impl LayeredSource {
  pub fn new(layers: Vec<Arc<dyn TaskSource>>) -> Self {
    Self { layers }
  }
}

#[async_trait]
impl TaskSource for LayeredSource {
  fn name(&self) -> &'static str {
    "layered"
  }

  #[instrument(level = "debug", target = "tasks", skip(self))]
  async fn all(&self) -> Result<Vec<Task>, StoreError> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut last_err = None;
    let mut answered = false;

    for layer in &self.layers {
      match layer.all().await {
        Ok(tasks) => {
          answered = true;
          for task in tasks {
            if seen.insert(task.id.clone()) {
              merged.push(task);
            }
          }
        }
        Err(e) => {
          warn!(target: "tasks", layer = layer.name(), error = %e, "task layer unavailable");
          last_err = Some(e);
        }
      }
    }

    match (answered, last_err) {
      (false, Some(e)) => Err(e),
      _ => Ok(merged),
    }
  }

  #[instrument(level = "debug", target = "tasks", skip(self))]
  async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
    let mut last_err = None;
    let mut answered = false;
    for layer in &self.layers {
      match layer.get(id).await {
        Ok(Some(task)) => return Ok(Some(task)),
        Ok(None) => answered = true,
        Err(e) => {
          warn!(target: "tasks", layer = layer.name(), %id, error = %e, "task layer unavailable");
          last_err = Some(e);
        }
      }
    }
    match (answered, last_err) {
      (false, Some(e)) => Err(e),
      _ => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tasks::{local_source, TaskQuery};

  fn write(path: &std::path::Path, body: &str) {
    std::fs::write(path, body).unwrap();
  }

  #[tokio::test]
  async fn directory_record_wins_over_flat_file() {
    let dir = tempfile::tempdir().unwrap();
    let challenges = dir.path().join("challenges");
    std::fs::create_dir(&challenges).unwrap();
    write(&challenges.join("pack.json"), r#"[{"id":"shared","title":"From directory","level":1}]"#);
    let flat = dir.path().join("tasks.json");
    write(
      &flat,
      r#"[{"id":"shared","title":"From flat file","difficulty":1},{"id":"only-flat","title":"Flat","difficulty":2}]"#,
    );

    let src = local_source(vec![challenges], vec![flat]);
    assert_eq!(src.get("shared").await.unwrap().unwrap().title, "From directory");
    assert_eq!(src.get("only-flat").await.unwrap().unwrap().title, "Flat");
    assert!(src.get("none").await.unwrap().is_none());

    let page = src.list(&TaskQuery::default()).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].title, "From directory");
  }

  #[tokio::test]
  async fn missing_directory_falls_back_to_flat_file() {
    let dir = tempfile::tempdir().unwrap();
    let flat = dir.path().join("tasks.json");
    write(&flat, r#"[{"id":"a","title":"A"}]"#);
    let src = local_source(vec![dir.path().join("absent")], vec![flat]);
    assert_eq!(src.all().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn every_layer_missing_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let src = local_source(vec![dir.path().join("a")], vec![dir.path().join("b.json")]);
    assert!(src.get("x").await.is_err());
    assert!(src.all().await.is_err());
  }
}
