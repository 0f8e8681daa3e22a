//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// Values are inserted verbatim and never re-scanned for placeholders.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = String::with_capacity(tpl.len());
  let mut rest = tpl;
  'scan: while let Some(open) = rest.find('{') {
    out.push_str(&rest[..open]);
    let tail = &rest[open..];
    for (k, v) in pairs {
      let needle = format!("{{{}}}", k);
      if tail.starts_with(&needle) {
        out.push_str(v);
        rest = &tail[needle.len()..];
        continue 'scan;
      }
    }
    out.push('{');
    rest = &tail[1..];
  }
  out.push_str(rest);
  out
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn template_fills_known_keys_only() {
    let out = fill_template("Seed {seed}, task {task_json} {other}", &[("seed", "abc"), ("task_json", "{\"seed\": 1}")]);
    assert_eq!(out, "Seed abc, task {\"seed\": 1} {other}");
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    assert_eq!(trunc_for_log("short", 10), "short");
    let out = trunc_for_log("héllo wörld", 2);
    assert!(out.starts_with("h…"));
  }
}
