//! Minimal stylesheet cascade backing `getComputedStyle`.
//!
//! Rules from every `<style>` element are matched against an element and
//! applied in (importance, specificity, source order); inline `style` wins
//! over normal rules. A handful of inherited properties fall through from the
//! parent, and `display` gets the user-agent default for the tag.

use std::collections::BTreeMap;

use super::dom::{Dom, NodeId};
use super::selector::{SelectorList, Specificity};

#[derive(Debug, Clone)]
pub struct Rule {
    selectors: SelectorList,
    declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
    pub important: bool,
}

const INHERITED: &[&str] = &[
    "color",
    "cursor",
    "font-family",
    "font-size",
    "font-style",
    "font-weight",
    "letter-spacing",
    "line-height",
    "list-style-type",
    "text-align",
    "text-transform",
    "visibility",
    "white-space",
];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "body", "dd", "details", "div", "dl", "dt",
    "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6",
    "header", "hr", "html", "main", "nav", "ol", "p", "pre", "section", "summary", "ul",
];

const HIDDEN_TAGS: &[&str] = &["head", "link", "meta", "script", "style", "template", "title"];

/// Parse a stylesheet, skipping at-rules and rules whose selector we reject.
pub fn parse_stylesheet(css: &str) -> Vec<Rule> {
    let css = strip_comments(css);
    let mut rules = Vec::new();
    let mut rest = css.as_str();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if rest.starts_with('@') {
            rest = skip_at_rule(rest);
            continue;
        }
        let Some(open) = rest.find('{') else { break };
        let prelude = rest[..open].trim();
        let after = &rest[open + 1..];
        let close = after.find('}').unwrap_or(after.len());
        let body = &after[..close];
        rest = if close < after.len() { &after[close + 1..] } else { "" };

        if let Ok(selectors) = SelectorList::parse(prelude) {
            rules.push(Rule { selectors, declarations: parse_declarations(body) });
        }
    }
    rules
}

/// `color: red; margin: 0 !important` -> declarations in source order.
pub fn parse_declarations(text: &str) -> Vec<Declaration> {
    let mut out = Vec::new();
    for decl in split_declarations(text) {
        let Some((prop, value)) = decl.split_once(':') else { continue };
        let property = prop.trim().to_ascii_lowercase();
        let mut value = value.trim().to_string();
        if property.is_empty() || value.is_empty() {
            continue;
        }
        let mut important = false;
        if let Some(idx) = value.to_ascii_lowercase().rfind("!important") {
            value = value[..idx].trim().to_string();
            important = true;
        }
        out.push(Declaration { property, value, important });
    }
    out
}

/// Serialize declarations back into `style` attribute form.
pub fn serialize_declarations(decls: &[Declaration]) -> String {
    decls
        .iter()
        .map(|d| {
            if d.important {
                format!("{}: {} !important;", d.property, d.value)
            } else {
                format!("{}: {};", d.property, d.value)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolved property map for `node`.
pub fn computed_style(dom: &Dom, rules: &[Rule], node: NodeId) -> BTreeMap<String, String> {
    let mut out = own_style(dom, rules, node);

    if !out.contains_key("display") {
        if let Some(tag) = dom.tag(node) {
            out.insert("display".into(), default_display(tag).into());
        }
    }

    let mut cur = dom.parent_element(node);
    while let Some(p) = cur {
        let missing: Vec<&str> = INHERITED.iter().copied().filter(|k| !out.contains_key(*k)).collect();
        if missing.is_empty() {
            break;
        }
        let parent_style = own_style(dom, rules, p);
        for k in missing {
            if let Some(v) = parent_style.get(k) {
                out.insert(k.to_string(), v.clone());
            }
        }
        cur = dom.parent_element(p);
    }

    if !out.contains_key("visibility") {
        out.insert("visibility".into(), "visible".into());
    }
    out
}

/// Cascade of matching rules plus inline style, no inheritance.
fn own_style(dom: &Dom, rules: &[Rule], node: NodeId) -> BTreeMap<String, String> {
    let mut matched: Vec<(Specificity, usize, &Rule)> = rules
        .iter()
        .enumerate()
        .filter_map(|(order, r)| r.selectors.matching_specificity(dom, node).map(|s| (s, order, r)))
        .collect();
    matched.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let inline = dom.attr(node, "style").map(parse_declarations).unwrap_or_default();

    let mut out = BTreeMap::new();
    for (_, _, rule) in &matched {
        for d in rule.declarations.iter().filter(|d| !d.important) {
            apply(&mut out, d);
        }
    }
    for d in inline.iter().filter(|d| !d.important) {
        apply(&mut out, d);
    }
    for (_, _, rule) in &matched {
        for d in rule.declarations.iter().filter(|d| d.important) {
            apply(&mut out, d);
        }
    }
    for d in inline.iter().filter(|d| d.important) {
        apply(&mut out, d);
    }
    out
}

fn apply(out: &mut BTreeMap<String, String>, d: &Declaration) {
    if d.value.eq_ignore_ascii_case("inherit") || d.value.eq_ignore_ascii_case("initial") {
        out.remove(&d.property);
        return;
    }
    out.insert(d.property.clone(), d.value.clone());
    for (longhand, value) in expand_shorthand(&d.property, &d.value) {
        out.insert(longhand, value);
    }
}

/// Box shorthands expand to their four sides so `marginTop` works after
/// `margin: 0 auto`.
fn expand_shorthand(prop: &str, value: &str) -> Vec<(String, String)> {
    let sides = ["top", "right", "bottom", "left"];
    let (prefix, suffix) = match prop {
        "margin" => ("margin-", ""),
        "padding" => ("padding-", ""),
        "border-width" => ("border-", "-width"),
        "border-style" => ("border-", "-style"),
        "border-color" => ("border-", "-color"),
        _ => return Vec::new(),
    };
    let parts: Vec<&str> = value.split_whitespace().collect();
    let values: [&str; 4] = match parts.as_slice() {
        [a] => [*a, *a, *a, *a],
        [a, b] => [*a, *b, *a, *b],
        [a, b, c] => [*a, *b, *c, *b],
        [a, b, c, d] => [*a, *b, *c, *d],
        _ => return Vec::new(),
    };
    sides
        .iter()
        .zip(values)
        .map(|(side, v)| (format!("{prefix}{side}{suffix}"), v.to_string()))
        .collect()
}

fn default_display(tag: &str) -> &'static str {
    if HIDDEN_TAGS.contains(&tag) {
        "none"
    } else if tag == "li" {
        "list-item"
    } else if tag == "table" {
        "table"
    } else if BLOCK_TAGS.contains(&tag) {
        "block"
    } else {
        "inline"
    }
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Skip `@import ...;` or a whole `@media ... { ... }` block.
fn skip_at_rule(s: &str) -> &str {
    let semi = s.find(';');
    let brace = s.find('{');
    match (semi, brace) {
        (Some(sc), Some(b)) if sc < b => &s[sc + 1..],
        (Some(sc), None) => &s[sc + 1..],
        (_, Some(b)) => {
            let mut depth = 0usize;
            for (i, ch) in s[b..].char_indices() {
                match ch {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            return &s[b + i + 1..];
                        }
                    }
                    _ => {}
                }
            }
            ""
        }
        (None, None) => "",
    }
}

/// Split on `;` outside of quotes and parentheses (`url(a;b)`).
fn split_declarations(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '(' => depth += 1,
                ')' => depth -= 1,
                ';' if depth == 0 => {
                    parts.push(&text[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&text[start..]);
    parts
}

/// `backgroundColor` -> `background-color`.
pub fn camel_to_kebab(name: &str) -> String {
    if name == "cssFloat" {
        return "float".into();
    }
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `data-user-id` suffix `user-id` -> `userId`.
pub fn kebab_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for ch in name.chars() {
        if ch == '-' {
            upper = true;
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn style_of(html: &str, css: &str, id: &str) -> BTreeMap<String, String> {
        let dom = Dom::parse(html);
        let rules = parse_stylesheet(css);
        let node = dom.get_element_by_id(id).unwrap();
        computed_style(&dom, &rules, node)
    }

    #[test]
    fn specificity_beats_source_order() {
        let s = style_of(
            r#"<p id="x" class="c">t</p>"#,
            "#x { color: blue } p.c { color: red } p { color: green }",
            "x",
        );
        assert_eq!(s["color"], "blue");
    }

    #[test]
    fn inline_style_overrides_rules_but_not_important() {
        let s = style_of(
            r#"<p id="x" style="color: red; margin: 4px">t</p>"#,
            "p { color: blue; margin: 0 !important }",
            "x",
        );
        assert_eq!(s["color"], "red");
        assert_eq!(s["margin"], "0");
        assert_eq!(s["margin-left"], "0");
    }

    #[test]
    fn inherited_and_default_display() {
        let s = style_of(
            r#"<div style="color: purple"><span id="x">t</span></div>"#,
            "@media (max-width: 10px) { span { color: red } } div { padding: 1px 2px }",
            "x",
        );
        assert_eq!(s["color"], "purple");
        assert_eq!(s["display"], "inline");
        assert!(!s.contains_key("padding"));
    }

    #[test]
    fn comments_and_bad_selectors_are_skipped() {
        let rules = parse_stylesheet("/* a */ h1 { color: red } h1[ { color: blue } h2 { x: y }");
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn case_conversion_helpers() {
        assert_eq!(camel_to_kebab("backgroundColor"), "background-color");
        assert_eq!(kebab_to_camel("user-id"), "userId");
    }
}
