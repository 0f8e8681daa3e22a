//! Synthesis of one HTML document from a bundle of submitted files.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::FileBundle;

const SKELETON: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <title>Test</title>
</head>
<body>
  <div id="root"></div>
</body>
</html>"#;

fn annotation_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r": \w+").expect("annotation pattern"))
}

fn interface_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"interface \w+ \{[^}]+\}").expect("interface pattern"))
}

/// Build the page the tests run against.
///
/// The base page is the first non-empty of `index.html` and `main.html`,
/// else a skeleton with a `#root` div. Stylesheets go before the first `</head>` and scripts before
/// the first `</body>`, in path order. A page without those closing tags
/// receives nothing.
pub fn build_document(files: &FileBundle) -> String {
  let mut html = files
    .get("index.html")
    .filter(|s| !s.is_empty())
    .or_else(|| files.get("main.html").filter(|s| !s.is_empty()))
    .cloned()
    .unwrap_or_else(|| SKELETON.to_string());

  let mut styles = String::new();
  for (_, css) in files.iter().filter(|(p, _)| p.ends_with(".css")) {
    styles.push_str("<style>\n");
    styles.push_str(css);
    styles.push_str("\n</style>\n");
  }

  let mut scripts = String::new();
  for (path, code) in files.iter().filter(|(p, _)| p.ends_with(".js") || p.ends_with(".ts")) {
    scripts.push_str("<script>\n");
    if path.ends_with(".ts") {
      scripts.push_str(&strip_types(code));
    } else {
      scripts.push_str(code);
    }
    scripts.push_str("\n</script>\n");
  }

  html = html.replacen("</head>", &format!("{styles}</head>"), 1);
  html.replacen("</body>", &format!("{scripts}</body>"), 1)
}

/// Textual TypeScript strip: drops `: Type` annotations and simple
/// `interface X { ... }` blocks. Anything fancier is left in place.
pub fn strip_types(code: &str) -> String {
  let no_annotations = annotation_re().replace_all(code, "");
  interface_re().replace_all(&no_annotations, "").into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bundle(pairs: &[(&str, &str)]) -> FileBundle {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn falls_back_to_skeleton_with_root() {
    let html = build_document(&bundle(&[("script.js", "let a = 1;")]));
    assert!(html.contains(r#"<div id="root"></div>"#));
    assert!(html.contains("<script>\nlet a = 1;\n</script>\n</body>"));
  }

  #[test]
  fn main_html_is_used_when_index_is_missing() {
    let html = build_document(&bundle(&[("main.html", "<html><head></head><body><p>main</p></body></html>")]));
    assert!(html.contains("<p>main</p>"));
    assert!(!html.contains("root"));
  }

  #[test]
  fn empty_index_falls_through_to_main() {
    let html = build_document(&bundle(&[("index.html", ""), ("main.html", "<p id='m'>m</p>")]));
    assert!(html.contains("<p id='m'>m</p>"));
    assert!(!html.contains("root"));
  }

  #[test]
  fn styles_land_in_head_and_scripts_before_body_end() {
    let files = bundle(&[
      ("index.html", "<html><head><title>x</title></head><body><h1>Hi</h1></body></html>"),
      ("style.css", "h1 { color: red; }"),
      ("app.js", "console.log(1);"),
    ]);
    let html = build_document(&files);
    let style_at = html.find("<style>").unwrap();
    let head_end = html.find("</head>").unwrap();
    assert!(style_at < head_end);
    let script_at = html.find("<script>").unwrap();
    assert!(script_at > html.find("<h1>").unwrap());
    assert!(html.ends_with("</script>\n</body></html>"));
  }

  #[test]
  fn typescript_annotations_and_interfaces_are_stripped() {
    let ts = "interface Todo { title: string }\nconst n: number = 2;\nfunction f(a: string) { return a; }";
    let out = strip_types(ts);
    assert!(!out.contains("interface"));
    assert!(out.contains("const n = 2;"));
    assert!(out.contains("function f(a) { return a; }"));
  }

  #[test]
  fn plain_javascript_is_not_stripped() {
    let html = build_document(&bundle(&[("script.js", "const o = { n: 1 }; const v = o.n ? a : b;")]));
    assert!(html.contains("const o = { n: 1 }; const v = o.n ? a : b;"));
  }

  #[test]
  fn only_first_closing_tags_receive_injections() {
    let files = bundle(&[
      ("index.html", "<body></body><body></body>"),
      ("a.js", "x"),
    ]);
    let html = build_document(&files);
    assert_eq!(html.matches("<script>").count(), 1);
    assert!(html.starts_with("<body><script>"));
  }
}
