//! Compilation of typed challenge tests into predicate source.
//!
//! Challenge files describe most checks declaratively (`dom-assert`,
//! `dom-count`, `style-assert`). They are turned into the same boolean
//! expressions hand-written tests use, once, at load time.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::domain::TaskTest;

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TypedTest {
  #[serde(default)]
  pub id: Option<Value>,
  #[serde(default, rename = "type")]
  pub kind: Option<String>,
  #[serde(default)]
  pub code: Option<String>,
  #[serde(default)]
  pub selector: Option<String>,
  #[serde(default)]
  pub count: Option<u64>,
  #[serde(default)]
  pub min: Option<u64>,
  #[serde(default)]
  pub max: Option<u64>,
  #[serde(default)]
  pub text: Option<String>,
  #[serde(default)]
  pub attribute: Option<String>,
  #[serde(default)]
  pub value: Option<Value>,
  #[serde(default, alias = "styleProperty")]
  pub property: Option<String>,
  #[serde(default)]
  pub expected: Option<Value>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub label: Option<String>,
  #[serde(default)]
  pub success_message: Option<String>,
  #[serde(default)]
  pub failure_message: Option<String>,
}

/// Compile one typed test. `index` is its 1-based position, used when the
/// record carries no id.
pub fn compile_test(task_id: &str, index: usize, t: TypedTest) -> TaskTest {
  let id = match &t.id {
    Some(Value::String(s)) => s.clone(),
    Some(Value::Number(n)) => n.to_string(),
    _ => format!("t{index}"),
  };
  let label = t
    .description
    .clone()
    .or_else(|| t.label.clone())
    .unwrap_or_else(|| format!("Test {id}"));

  let mut failure_message = t.failure_message.clone();
  let code = match t.kind.as_deref() {
    None | Some("code") | Some("js") => t.code.clone().unwrap_or_else(|| "false".into()),
    Some("dom-assert") => dom_assert(&t),
    Some("dom-count") => dom_count(&t),
    Some("style-assert") => style_assert(&t),
    Some(other) => {
      warn!(target: "tasks", task = %task_id, test = %id, kind = %other, "unknown test type compiles to false");
      failure_message = Some(format!("Unknown test type: {other}"));
      "false".into()
    }
  };

  TaskTest {
    id,
    code,
    label: Some(label),
    success_message: t.success_message,
    failure_message,
  }
}

fn js_str(s: &str) -> String {
  // JSON string syntax is valid JavaScript string syntax.
  serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

fn value_text(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn dom_assert(t: &TypedTest) -> String {
  let Some(selector) = t.selector.as_deref() else {
    return "false".into();
  };
  let sel = js_str(selector);
  if let Some(count) = t.count {
    return format!("document.querySelectorAll({sel}).length >= {count}");
  }
  if let Some(text) = &t.text {
    return format!(
      "(document.querySelector({sel})?.textContent ?? '').includes({})",
      js_str(text)
    );
  }
  if let Some(attr) = &t.attribute {
    let attr = js_str(attr);
    return match &t.value {
      Some(v) => format!(
        "document.querySelector({sel})?.getAttribute({attr}) === {}",
        js_str(&value_text(v))
      ),
      None => format!("document.querySelector({sel})?.hasAttribute({attr}) === true"),
    };
  }
  format!("document.querySelector({sel}) !== null")
}

fn dom_count(t: &TypedTest) -> String {
  let Some(selector) = t.selector.as_deref() else {
    return "false".into();
  };
  let len = format!("document.querySelectorAll({}).length", js_str(selector));
  let mut checks = Vec::new();
  if let Some(n) = t.count {
    checks.push(format!("{len} === {n}"));
  }
  if let Some(n) = t.min {
    checks.push(format!("{len} >= {n}"));
  }
  if let Some(n) = t.max {
    checks.push(format!("{len} <= {n}"));
  }
  if checks.is_empty() {
    checks.push(format!("{len} > 0"));
  }
  checks.join(" && ")
}

fn style_assert(t: &TypedTest) -> String {
  let (Some(selector), Some(prop)) = (t.selector.as_deref(), t.property.as_deref()) else {
    return "false".into();
  };
  let expected = t.value.as_ref().or(t.expected.as_ref()).map(value_text).unwrap_or_default();
  format!(
    "(() => {{ const el = document.querySelector({}); return !!el && window.getComputedStyle(el).getPropertyValue({}) === {}; }})()",
    js_str(selector),
    js_str(prop),
    js_str(&expected)
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn typed(json: &str) -> TypedTest {
    serde_json::from_str(json).unwrap()
  }

  #[test]
  fn selector_presence() {
    let t = compile_test("c", 1, typed(r#"{"id":"a","type":"dom-assert","selector":"h1"}"#));
    assert_eq!(t.code, r#"document.querySelector("h1") !== null"#);
    assert_eq!(t.label.as_deref(), Some("Test a"));
  }

  #[test]
  fn count_and_text_and_attribute_variants() {
    let count = compile_test("c", 1, typed(r#"{"type":"dom-assert","selector":"li","count":3}"#));
    assert_eq!(count.id, "t1");
    assert_eq!(count.code, r#"document.querySelectorAll("li").length >= 3"#);

    let text = compile_test("c", 2, typed(r#"{"type":"dom-assert","selector":"h1","text":"Hi"}"#));
    assert!(text.code.contains(r#".includes("Hi")"#));

    let attr = compile_test("c", 3, typed(r#"{"type":"dom-assert","selector":"img","attribute":"alt"}"#));
    assert!(attr.code.contains(r#"hasAttribute("alt")"#));

    let eq = compile_test(
      "c",
      4,
      typed(r#"{"type":"dom-assert","selector":"a","attribute":"href","value":"/x"}"#),
    );
    assert!(eq.code.ends_with(r#"getAttribute("href") === "/x""#));
  }

  #[test]
  fn dom_count_bounds() {
    let t = compile_test("c", 1, typed(r#"{"type":"dom-count","selector":"p","min":2,"max":4}"#));
    assert_eq!(
      t.code,
      r#"document.querySelectorAll("p").length >= 2 && document.querySelectorAll("p").length <= 4"#
    );
  }

  #[test]
  fn unknown_type_compiles_to_false_with_message() {
    let t = compile_test("c", 1, typed(r#"{"id":7,"type":"a11y-audit","description":"accessible"}"#));
    assert_eq!(t.id, "7");
    assert_eq!(t.code, "false");
    assert_eq!(t.label.as_deref(), Some("accessible"));
    assert_eq!(t.failure_message.as_deref(), Some("Unknown test type: a11y-audit"));
  }

  #[test]
  fn code_tests_pass_through() {
    let t = compile_test("c", 1, typed(r#"{"id":"x","code":"1 + 1 === 2","label":"math"}"#));
    assert_eq!(t.code, "1 + 1 === 2");
    assert_eq!(t.label.as_deref(), Some("math"));
  }
}
