//! Relational task source: one `tasks` table, scalar columns plus JSON text
//! columns for the nested parts of a task.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use super::{TaskPage, TaskQuery, TaskSource};
use crate::domain::Task;
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    difficulty INTEGER NOT NULL DEFAULT 1,
    category TEXT,
    detailed_description TEXT,
    real_world_context TEXT,
    scaffold TEXT NOT NULL DEFAULT '{}',
    tests TEXT NOT NULL DEFAULT '[]',
    solution TEXT,
    alternative_solutions TEXT NOT NULL DEFAULT '[]',
    hints TEXT NOT NULL DEFAULT '[]',
    concept_ids TEXT NOT NULL DEFAULT '[]',
    prerequisites TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_tasks_difficulty ON tasks(difficulty, id);
"#;

const COLUMNS: &str = "id, title, description, difficulty, category, detailed_description, \
  real_world_context, scaffold, tests, solution, alternative_solutions, hints, concept_ids, prerequisites";

const FILTER: &str = "(?1 IS NULL OR difficulty = ?1) \
  AND (?2 IS NULL OR EXISTS (SELECT 1 FROM json_each(tasks.concept_ids) WHERE value = ?2))";

pub struct SqliteSource {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteSource {
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    info!(target: "tasks", path = %path.display(), "opened task database");
    Ok(Self { conn: Arc::new(Mutex::new(conn)) })
  }

  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Self { conn: Arc::new(Mutex::new(conn)) })
  }

  /// Insert or replace a task by id.
  #[instrument(level = "debug", target = "tasks", skip(self, task), fields(id = %task.id))]
  pub async fn upsert(&self, task: &Task) -> Result<(), StoreError> {
    let conn = self.conn.clone();
    let t = task.clone();
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
      let conn = conn.blocking_lock();
      let solution = t.solution.as_ref().map(|s| to_json(&t.id, "solution", s)).transpose()?;
      conn.execute(
        &format!(
          "INSERT OR REPLACE INTO tasks ({COLUMNS}) \
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
          t.id,
          t.title,
          t.description,
          t.difficulty,
          t.category,
          t.detailed_description,
          t.real_world_context,
          to_json(&t.id, "scaffold", &t.scaffold)?,
          to_json(&t.id, "tests", &t.tests)?,
          solution,
          to_json(&t.id, "alternative_solutions", &t.alternative_solutions)?,
          to_json(&t.id, "hints", &t.hints)?,
          to_json(&t.id, "concept_ids", &t.concept_ids)?,
          to_json(&t.id, "prerequisites", &t.prerequisites)?,
        ],
      )?;
      Ok(())
    })
    .await?
  }
}

/// Raw row, decoded outside the rusqlite closure so JSON errors keep their column.
struct RawRow {
  id: String,
  title: String,
  description: String,
  difficulty: u32,
  category: Option<String>,
  detailed_description: Option<String>,
  real_world_context: Option<String>,
  scaffold: String,
  tests: String,
  solution: Option<String>,
  alternative_solutions: String,
  hints: String,
  concept_ids: String,
  prerequisites: String,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      title: row.get(1)?,
      description: row.get(2)?,
      difficulty: row.get(3)?,
      category: row.get(4)?,
      detailed_description: row.get(5)?,
      real_world_context: row.get(6)?,
      scaffold: row.get(7)?,
      tests: row.get(8)?,
      solution: row.get(9)?,
      alternative_solutions: row.get(10)?,
      hints: row.get(11)?,
      concept_ids: row.get(12)?,
      prerequisites: row.get(13)?,
    })
  }

  fn into_task(self) -> Result<Task, StoreError> {
    let id = self.id;
    Ok(Task {
      scaffold: from_json(&id, "scaffold", &self.scaffold)?,
      tests: from_json(&id, "tests", &self.tests)?,
      solution: self.solution.as_deref().map(|s| from_json(&id, "solution", s)).transpose()?,
      alternative_solutions: from_json(&id, "alternative_solutions", &self.alternative_solutions)?,
      hints: from_json(&id, "hints", &self.hints)?,
      concept_ids: from_json(&id, "concept_ids", &self.concept_ids)?,
      prerequisites: from_json(&id, "prerequisites", &self.prerequisites)?,
      title: self.title,
      description: self.description,
      difficulty: self.difficulty,
      category: self.category,
      detailed_description: self.detailed_description,
      real_world_context: self.real_world_context,
      variant: None,
      id,
    })
  }
}

fn clamp(n: usize) -> i64 {
  i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_json<T: Serialize>(id: &str, column: &'static str, value: &T) -> Result<String, StoreError> {
  serde_json::to_string(value).map_err(|source| StoreError::Column { id: id.to_string(), column, source })
}

fn from_json<T: DeserializeOwned>(id: &str, column: &'static str, raw: &str) -> Result<T, StoreError> {
  serde_json::from_str(raw).map_err(|source| StoreError::Column { id: id.to_string(), column, source })
}

#[async_trait]
impl TaskSource for SqliteSource {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  async fn all(&self) -> Result<Vec<Task>, StoreError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<Task>, StoreError> {
      let conn = conn.blocking_lock();
      let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM tasks ORDER BY difficulty, id"))?;
      let rows = stmt.query_map([], RawRow::from_row)?.collect::<Result<Vec<_>, _>>()?;
      rows.into_iter().map(RawRow::into_task).collect()
    })
    .await?
  }

  #[instrument(level = "debug", target = "tasks", skip(self))]
  async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
    let conn = self.conn.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || -> Result<Option<Task>, StoreError> {
      let conn = conn.blocking_lock();
      let row = conn
        .query_row(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"), params![id], RawRow::from_row)
        .optional()?;
      row.map(RawRow::into_task).transpose()
    })
    .await?
  }

  #[instrument(level = "debug", target = "tasks", skip(self))]
  async fn list(&self, query: &TaskQuery) -> Result<TaskPage, StoreError> {
    let conn = self.conn.clone();
    let q = query.clone();
    tokio::task::spawn_blocking(move || -> Result<TaskPage, StoreError> {
      let conn = conn.blocking_lock();
      let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM tasks WHERE {FILTER}"),
        params![q.difficulty, q.concept_id],
        |row| row.get(0),
      )?;
      let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM tasks WHERE {FILTER} ORDER BY difficulty, id LIMIT ?3 OFFSET ?4"
      ))?;
      let rows = stmt
        .query_map(
          params![q.difficulty, q.concept_id, clamp(q.limit), clamp(q.offset)],
          RawRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
      let items = rows.into_iter().map(RawRow::into_task).collect::<Result<Vec<_>, _>>()?;
      Ok(TaskPage { items, total: total.max(0) as usize })
    })
    .await?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Hint, TaskTest};

  fn task(id: &str, difficulty: u32) -> Task {
    let mut t: Task = serde_json::from_value(serde_json::json!({"id": id, "title": id.to_uppercase()})).unwrap();
    t.difficulty = difficulty;
    t
  }

  #[tokio::test]
  async fn upsert_then_get_round_trips_nested_columns() {
    let db = SqliteSource::in_memory().unwrap();
    let mut t = task("html-lists-1", 2);
    t.scaffold.insert("index.html".into(), "<ul></ul>".into());
    t.tests.push(TaskTest::new("has-ul", "document.querySelector('ul') !== null"));
    t.hints.push(Hint { level: Some(1), text: "Use <ul>".into() });
    t.concept_ids.push("html-basics".into());
    db.upsert(&t).await.unwrap();

    assert_eq!(db.get("html-lists-1").await.unwrap(), Some(t.clone()));
    assert!(db.get("missing").await.unwrap().is_none());

    t.title = "Renamed".into();
    db.upsert(&t).await.unwrap();
    assert_eq!(db.get("html-lists-1").await.unwrap().unwrap().title, "Renamed");
  }

  #[tokio::test]
  async fn list_filters_counts_and_pages() {
    let db = SqliteSource::in_memory().unwrap();
    for (id, d) in [("b", 2), ("a", 2), ("c", 1), ("d", 2)] {
      let mut t = task(id, d);
      if id == "d" {
        t.concept_ids.push("css-basics".into());
      }
      db.upsert(&t).await.unwrap();
    }

    let page = db
      .list(&TaskQuery { difficulty: Some(2), limit: 1, offset: 1, ..Default::default() })
      .await
      .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, "b");

    let by_concept = db
      .list(&TaskQuery { concept_id: Some("css-basics".into()), ..Default::default() })
      .await
      .unwrap();
    assert_eq!(by_concept.total, 1);
    assert_eq!(by_concept.items[0].id, "d");

    let everything = db.all().await.unwrap();
    assert_eq!(everything.first().map(|t| t.id.as_str()), Some("c"));
  }
}
