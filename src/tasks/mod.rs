//! Task store: adapters that read challenge definitions and hand out
//! normalized [`Task`] records.
//!
//! - [`DirectorySource`]: a directory of challenge-pack JSON files.
//! - [`FlatFileSource`]: one JSON array of task-shaped records.
//! - [`LayeredSource`]: several sources in priority order (directory first).
//! - [`SqliteSource`]: the `tasks` table of a SQLite database.

mod challenge;
mod directory;
mod flat;
mod layered;
pub mod normalize;
mod sqlite;

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{TaskBackend, TaskStoreConfig};
use crate::domain::Task;
use crate::error::StoreError;

pub use challenge::{compile_test, TypedTest};
pub use directory::DirectorySource;
pub use flat::FlatFileSource;
pub use layered::LayeredSource;
pub use sqlite::SqliteSource;

pub const DEFAULT_PAGE_LIMIT: usize = 15;

/// Page request for task listings.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskQuery {
  pub difficulty: Option<u32>,
  pub concept_id: Option<String>,
  pub limit: usize,
  pub offset: usize,
}

impl Default for TaskQuery {
  fn default() -> Self {
    Self { difficulty: None, concept_id: None, limit: DEFAULT_PAGE_LIMIT, offset: 0 }
  }
}

impl TaskQuery {
  pub fn matches(&self, task: &Task) -> bool {
    self.difficulty.map_or(true, |d| task.difficulty == d)
      && self.concept_id.as_ref().map_or(true, |c| task.concept_ids.contains(c))
  }
}

/// One page of tasks. `total` counts every task matching the filter.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TaskPage {
  pub items: Vec<Task>,
  pub total: usize,
}

#[async_trait]
pub trait TaskSource: Send + Sync {
  /// Short label used in logs.
  fn name(&self) -> &'static str;

  /// Every task this source can see, in no particular order.
  async fn all(&self) -> Result<Vec<Task>, StoreError>;

  async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
    Ok(self.all().await?.into_iter().find(|t| t.id == id))
  }

  async fn list(&self, query: &TaskQuery) -> Result<TaskPage, StoreError> {
    Ok(paginate(self.all().await?, query))
  }
}

/// Filter, order by `(difficulty, id)`, count, then slice.
pub fn paginate(tasks: Vec<Task>, query: &TaskQuery) -> TaskPage {
  let mut items: Vec<Task> = tasks.into_iter().filter(|t| query.matches(t)).collect();
  items.sort_by(|a, b| (a.difficulty, &a.id).cmp(&(b.difficulty, &b.id)));
  let total = items.len();
  let items = items.into_iter().skip(query.offset).take(query.limit).collect();
  TaskPage { items, total }
}

/// Build the configured task source.
pub fn build_source(cfg: &TaskStoreConfig) -> Result<Arc<dyn TaskSource>, StoreError> {
  match cfg.backend {
    TaskBackend::Local => Ok(Arc::new(local_source(cfg.dirs.clone(), cfg.files.clone()))),
    TaskBackend::Db => Ok(Arc::new(SqliteSource::open(&cfg.db_path)?)),
  }
}

/// Directory adapter layered over the flat-file adapter.
pub fn local_source(dirs: Vec<PathBuf>, files: Vec<PathBuf>) -> LayeredSource {
  LayeredSource::new(vec![
    Arc::new(DirectorySource::new(dirs)),
    Arc::new(FlatFileSource::new(files)),
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task(id: &str, difficulty: u32, concepts: &[&str]) -> Task {
    let mut t: Task = serde_json::from_value(serde_json::json!({"id": id, "title": id})).unwrap();
    t.difficulty = difficulty;
    t.concept_ids = concepts.iter().map(|c| c.to_string()).collect();
    t
  }

  #[test]
  fn paginate_filters_orders_and_counts() {
    let tasks = vec![task("b", 2, &[]), task("a", 2, &[]), task("c", 1, &[]), task("d", 2, &[])];
    let page = paginate(tasks, &TaskQuery { difficulty: Some(2), limit: 1, ..Default::default() });
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, "a");
  }

  #[test]
  fn paginate_offset_past_end_is_empty() {
    let page = paginate(vec![task("a", 1, &[])], &TaskQuery { offset: 5, ..Default::default() });
    assert_eq!(page.total, 1);
    assert!(page.items.is_empty());
  }

  #[test]
  fn concept_filter() {
    let tasks = vec![task("a", 1, &["html-basics"]), task("b", 1, &["css-basics"])];
    let q = TaskQuery { concept_id: Some("css-basics".into()), ..Default::default() };
    let page = paginate(tasks, &q);
    assert_eq!(page.items.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
  }
}
