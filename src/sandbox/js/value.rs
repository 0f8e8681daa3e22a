//! Runtime values and heap objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use super::ast::FunctionDef;
use crate::sandbox::dom::NodeId;

pub type ObjId = usize;
pub type ScopeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Obj(ObjId),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Obj(_) => true,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_obj(&self) -> Option<ObjId> {
        match self {
            Value::Obj(id) => Some(*id),
            _ => None,
        }
    }

    /// Label used in "Cannot read properties of ..." messages.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            _ => "value",
        }
    }
}

/// Own properties in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Props(Vec<(String, Value)>);

impl Props {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(k, _)| k != key);
        before != self.0.len()
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0.clone()
    }
}

#[derive(Debug)]
pub struct Obj {
    pub kind: ObjKind,
    pub props: Props,
    pub proto: Option<ObjId>,
    /// Own props are skipped by key enumeration (class prototypes).
    pub hidden: bool,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Self {
        Self { kind, props: Props::default(), proto: None, hidden: false }
    }
}

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

#[derive(Debug)]
pub struct PromiseData {
    pub state: PromiseState,
    pub reactions: Vec<Reaction>,
    /// Resolving functions carrying this token may still settle the promise;
    /// zero once one of them has fired.
    pub token: u64,
    pub handled: bool,
}

/// An async function body parked on `await`.
#[derive(Debug, Clone)]
pub struct AsyncTask {
    pub def: Arc<FunctionDef>,
    pub scope: ScopeId,
    pub promise: ObjId,
}

#[derive(Debug, Clone)]
pub enum Reaction {
    Then { on_fulfilled: Value, on_rejected: Value, derived: ObjId },
    Finally { callback: Value, derived: ObjId },
    /// Slot `index` of a `Promise.all`-style combinator.
    Combine { combinator: ObjId, index: usize },
    /// Continue `task` after the top-level statement at `index`.
    Resume { task: AsyncTask, index: usize },
}

/// Outcome a reaction runs with: fulfillment value or rejection reason.
pub type Settlement = Result<Value, Value>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CombineMode {
    All,
    AllSettled,
    Any,
    Race,
}

#[derive(Debug)]
pub enum ObjKind {
    Plain,
    Array(Vec<Value>),
    Closure { def: Arc<FunctionDef>, env: ScopeId },
    /// Built-in function, dispatched by name.
    Native(&'static str),
    /// Built-in method read off a receiver (`const up = s.toUpperCase`).
    Method { this: Value, name: String },
    Bound { target: ObjId, this: Value, args: Vec<Value> },
    Error,
    Window,
    Node(NodeId),
    NodeList(Vec<NodeId>),
    ClassList(NodeId),
    Style(NodeId),
    Dataset(NodeId),
    ComputedStyle(BTreeMap<String, String>),
    Regex { source: String, flags: String, re: Regex, last_index: usize },
    /// `class` is the constructor name (`MouseEvent`, `CustomEvent`...).
    Event { class: &'static str, prevented: bool, stopped: bool, immediate: bool },
    Date(f64),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Property slot holding a getter and/or setter.
    Accessor { get: Option<Value>, set: Option<Value> },
    Promise(PromiseData),
    /// `resolve`/`reject` handed to an executor or thenable.
    Resolver { promise: ObjId, token: u64, reject: bool },
    Combinator { mode: CombineMode, promise: ObjId, values: Vec<Value>, remaining: usize, done: bool },
    /// `localStorage` / `sessionStorage` items in insertion order.
    Storage(Vec<(String, String)>),
}

impl ObjKind {
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            ObjKind::Closure { .. }
                | ObjKind::Native(_)
                | ObjKind::Method { .. }
                | ObjKind::Bound { .. }
                | ObjKind::Resolver { .. }
        )
    }
}

/// Number to string the way `String(n)` renders it.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let s = format!("{n:e}");
        return match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => s,
        };
    }
    if n.fract() == 0.0 && abs < 9.007_199_254_740_992e15 {
        return format!("{}", n as i64);
    }
    format!("{n}")
}

/// `Number("...")` semantics: trimmed, empty is 0, hex/binary/octal prefixes.
pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let lower = t.to_ascii_lowercase();
    for (prefix, radix) in [("0x", 16), ("0b", 2), ("0o", 8)] {
        if let Some(digits) = lower.strip_prefix(prefix) {
            return u64::from_str_radix(digits, radix).map(|v| v as f64).unwrap_or(f64::NAN);
        }
    }
    if lower.contains("inf") || lower.contains("nan") {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// `parseFloat`: longest numeric prefix.
pub fn parse_float_prefix(s: &str) -> f64 {
    let t = s.trim_start();
    if t.starts_with("Infinity") || t.starts_with("+Infinity") {
        return f64::INFINITY;
    }
    if t.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }
    let bytes = t.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end];
        match c {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    let mut candidate = &t[..end];
    while !candidate.is_empty() {
        if let Ok(v) = candidate.parse::<f64>() {
            return v;
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    f64::NAN
}

/// `parseInt(s, radix)`.
pub fn parse_int_prefix(s: &str, radix: Option<u32>) -> f64 {
    let mut t = s.trim_start();
    let mut sign = 1.0;
    if let Some(rest) = t.strip_prefix('-') {
        sign = -1.0;
        t = rest;
    } else if let Some(rest) = t.strip_prefix('+') {
        t = rest;
    }
    let mut radix = radix.filter(|r| *r != 0).unwrap_or(10);
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    if radix == 16 || radix == 10 {
        if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            t = rest;
            radix = 16;
        }
    }
    let digits: String = t.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let mut acc = 0f64;
    for c in digits.chars() {
        acc = acc * radix as f64 + c.to_digit(radix).unwrap_or(0) as f64;
    }
    sign * acc
}

pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 as u64 & 0xffff_ffff) as u32 as i32
}

pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// Integer index from a property key (`"3"` -> 3).
pub fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// Relative index helper for `slice`/`splice`/`at`.
pub fn relative_index(n: f64, len: usize) -> usize {
    let len_f = len as f64;
    if n.is_nan() {
        return 0;
    }
    let n = n.trunc();
    if n < 0.0 {
        (len_f + n).max(0.0) as usize
    } else {
        n.min(len_f) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1e-7), "1e-7");
        assert_eq!(number_to_string(f64::NAN), "NaN");
    }

    #[test]
    fn numeric_parsing() {
        assert_eq!(string_to_number(" 42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert!(string_to_number("12px").is_nan());
        assert_eq!(parse_float_prefix("12.5px"), 12.5);
        assert_eq!(parse_int_prefix("42abc", None), 42.0);
        assert_eq!(parse_int_prefix("ff", Some(16)), 255.0);
        assert!(parse_int_prefix("abc", None).is_nan());
    }

    #[test]
    fn index_helpers() {
        assert_eq!(array_index("3"), Some(3));
        assert_eq!(array_index("03"), None);
        assert_eq!(relative_index(-1.0, 5), 4);
        assert_eq!(relative_index(10.0, 5), 5);
    }
}
