//! Every task shipped under `data/` must load and be solvable by its own
//! reference solutions.

use std::path::PathBuf;

use aictutor_backend::{
  sandbox::Evaluator,
  tasks::{local_source, TaskQuery, TaskSource},
};

fn data() -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data")
}

#[tokio::test]
async fn bundled_solutions_pass_their_tests() {
  let source = local_source(vec![data().join("challenges")], vec![data().join("tasks.levels.json")]);
  let tasks = source.all().await.unwrap();
  assert!(tasks.len() >= 8, "expected both bundled files to load, got {}", tasks.len());

  let evaluator = Evaluator::default();
  for task in &tasks {
    assert!(!task.tests.is_empty(), "{} has no tests", task.id);

    let solution = task.solution.as_ref().unwrap_or_else(|| panic!("{} has no solution", task.id));
    let result = evaluator.evaluate(solution, &task.tests).await.unwrap();
    assert!(result.passed, "{} solution failed: {:?}", task.id, result.messages);

    for alt in &task.alternative_solutions {
      let result = evaluator.evaluate(&alt.files, &task.tests).await.unwrap();
      assert!(result.passed, "{} / {} failed: {:?}", task.id, alt.label, result.messages);
    }
  }
}

#[tokio::test]
async fn bundled_scaffolds_do_not_already_pass() {
  let source = local_source(vec![data().join("challenges")], vec![data().join("tasks.levels.json")]);
  let evaluator = Evaluator::default();
  for task in source.all().await.unwrap() {
    let result = evaluator.evaluate(&task.scaffold, &task.tests).await.unwrap();
    assert!(!result.passed, "{} passes with its starter files", task.id);
  }
}

#[tokio::test]
async fn bundled_levels_are_listed_in_order() {
  let source = local_source(vec![data().join("challenges")], vec![data().join("tasks.levels.json")]);
  let query = TaskQuery { difficulty: Some(2), ..Default::default() };
  let page = source.list(&query).await.unwrap();
  let ids: Vec<&str> = page.items.iter().map(|t| t.id.as_str()).collect();
  assert_eq!(ids, vec!["css-001", "css-box-1", "html-003", "html-lists-1"]);
  assert_eq!(page.total, 4);
}
