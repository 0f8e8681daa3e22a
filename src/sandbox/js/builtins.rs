//! Language builtins: globals, constructors and methods of primitive and
//! collection values. DOM-facing natives live in `host`.

use rand::Rng;
use regex::{Captures, Regex, RegexBuilder};

use super::host;
use super::interp::{arg, check_array_len, check_string_len, type_err, Interp, MAX_ARRAY_LEN, MAX_CALL_DEPTH, MAX_STRING_LEN, R};
use super::promise::{PROMISE_METHODS, PROMISE_STATICS};
use super::value::*;
use super::ScriptError;

const STRING_METHODS: &[&str] = &[
    "charAt", "charCodeAt", "codePointAt", "at", "indexOf", "lastIndexOf", "includes", "startsWith",
    "endsWith", "slice", "substring", "substr", "toUpperCase", "toLowerCase", "toLocaleUpperCase",
    "toLocaleLowerCase", "trim", "trimStart", "trimEnd", "padStart", "padEnd", "repeat", "split",
    "replace", "replaceAll", "match", "search", "concat", "localeCompare", "normalize", "toString",
    "valueOf",
];

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "slice", "splice", "concat", "join", "reverse", "indexOf",
    "lastIndexOf", "includes", "find", "findIndex", "findLast", "findLastIndex", "filter", "map",
    "forEach", "reduce", "reduceRight", "some", "every", "sort", "flat", "flatMap", "fill", "at",
    "keys", "values", "entries", "toString",
];

const NUMBER_METHODS: &[&str] = &["toFixed", "toString", "toPrecision", "toLocaleString", "valueOf"];
const OBJECT_METHODS: &[&str] = &["hasOwnProperty", "toString", "valueOf"];
const FUNCTION_METHODS: &[&str] = &["call", "apply", "bind", "toString"];
const REGEX_METHODS: &[&str] = &["test", "exec", "toString"];
const MAP_METHODS: &[&str] = &["get", "set", "has", "delete", "clear", "forEach", "keys", "values", "entries"];
const SET_METHODS: &[&str] = &["add", "has", "delete", "clear", "forEach", "keys", "values", "entries"];
const DATE_METHODS: &[&str] = &[
    "getTime", "valueOf", "getFullYear", "getMonth", "getDate", "getDay", "getHours", "getMinutes",
    "getSeconds", "getMilliseconds", "toISOString", "toJSON", "toLocaleDateString",
    "toLocaleTimeString", "toLocaleString", "toDateString", "toString", "getTimezoneOffset",
];

const MATH_FUNCTIONS: &[&str] = &[
    "Math.abs", "Math.floor", "Math.ceil", "Math.round", "Math.trunc", "Math.sign", "Math.sqrt",
    "Math.cbrt", "Math.pow", "Math.min", "Math.max", "Math.random", "Math.sin", "Math.cos",
    "Math.tan", "Math.asin", "Math.acos", "Math.atan", "Math.atan2", "Math.log", "Math.log2",
    "Math.log10", "Math.exp", "Math.hypot",
];

const GLOBAL_FUNCTIONS: &[&str] = &[
    "parseInt", "parseFloat", "isNaN", "isFinite", "encodeURIComponent", "decodeURIComponent",
    "encodeURI", "decodeURI", "String", "Number", "Boolean", "Error", "TypeError", "RangeError",
    "SyntaxError", "ReferenceError", "Map", "Set", "RegExp", "Function",
];

impl Interp {
    pub fn install_builtins(&mut self) {
        let scope = self.builtins_scope;
        self.declare(scope, "undefined", Value::Undefined, false);
        self.declare(scope, "NaN", Value::Num(f64::NAN), false);
        self.declare(scope, "Infinity", Value::Num(f64::INFINITY), false);

        for name in GLOBAL_FUNCTIONS {
            let f = self.native(name);
            self.declare(scope, name, f, true);
        }

        let math = self.namespace(None, MATH_FUNCTIONS);
        for (k, v) in [
            ("PI", std::f64::consts::PI),
            ("E", std::f64::consts::E),
            ("LN2", std::f64::consts::LN_2),
            ("LN10", std::f64::consts::LN_10),
            ("LOG2E", std::f64::consts::LOG2_E),
            ("LOG10E", std::f64::consts::LOG10_E),
            ("SQRT2", std::f64::consts::SQRT_2),
            ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
        ] {
            self.heap[math].props.set(k, Value::Num(v));
        }
        self.declare(scope, "Math", Value::Obj(math), true);

        let json = self.namespace(None, &["JSON.stringify", "JSON.parse"]);
        self.declare(scope, "JSON", Value::Obj(json), true);

        let console = self.namespace(
            None,
            &["console.log", "console.info", "console.warn", "console.error", "console.debug", "console.table"],
        );
        self.declare(scope, "console", Value::Obj(console), true);

        let object = self.namespace(
            Some("Object"),
            &[
                "Object.keys", "Object.values", "Object.entries", "Object.assign", "Object.freeze",
                "Object.isFrozen", "Object.fromEntries", "Object.create", "Object.getPrototypeOf",
                "Object.defineProperty", "Object.getOwnPropertyNames",
            ],
        );
        self.declare(scope, "Object", Value::Obj(object), true);

        let array = self.namespace(Some("Array"), &["Array.isArray", "Array.from", "Array.of"]);
        self.declare(scope, "Array", Value::Obj(array), true);

        let number = self.namespace(
            Some("Number"),
            &[
                "Number.isInteger", "Number.isFinite", "Number.isNaN", "Number.isSafeInteger",
                "Number.parseFloat", "Number.parseInt",
            ],
        );
        for (k, v) in [
            ("MAX_SAFE_INTEGER", 9_007_199_254_740_991.0),
            ("MIN_SAFE_INTEGER", -9_007_199_254_740_991.0),
            ("EPSILON", f64::EPSILON),
            ("MAX_VALUE", f64::MAX),
            ("MIN_VALUE", 5e-324),
            ("POSITIVE_INFINITY", f64::INFINITY),
            ("NEGATIVE_INFINITY", f64::NEG_INFINITY),
            ("NaN", f64::NAN),
        ] {
            self.heap[number].props.set(k, Value::Num(v));
        }
        self.declare(scope, "Number", Value::Obj(number), true);

        let string = self.namespace(Some("String"), &["String.fromCharCode"]);
        self.declare(scope, "String", Value::Obj(string), true);

        let date = self.namespace(Some("Date"), &["Date.now"]);
        self.declare(scope, "Date", Value::Obj(date), true);

        let promise = self.namespace(Some("Promise"), PROMISE_STATICS);
        self.declare(scope, "Promise", Value::Obj(promise), true);
    }

    /// Object holding natives under their short names (`Math.floor` -> `floor`).
    fn namespace(&mut self, ctor: Option<&'static str>, members: &[&'static str]) -> ObjId {
        let id = match ctor {
            Some(name) => self.alloc(ObjKind::Native(name)),
            None => self.alloc(ObjKind::Plain),
        };
        for m in members {
            let key = m.rsplit('.').next().unwrap_or_default();
            let f = self.native(m);
            self.heap[id].props.set(key, f);
        }
        id
    }

    pub fn call_native(&mut self, name: &'static str, this: Value, args: Vec<Value>, construct: bool) -> R<Value> {
        if let Some(op) = name.strip_prefix("Math.") {
            return self.math(op, &args);
        }
        match name {
            "parseInt" | "Number.parseInt" => {
                let s = self.to_string(&arg(&args, 0))?;
                let radix = match arg(&args, 1) {
                    Value::Undefined => None,
                    r => Some(self.to_number(&r)? as u32),
                };
                Ok(Value::Num(parse_int_prefix(&s, radix)))
            }
            "parseFloat" | "Number.parseFloat" => {
                let s = self.to_string(&arg(&args, 0))?;
                Ok(Value::Num(parse_float_prefix(&s)))
            }
            "isNaN" => Ok(Value::Bool(self.to_number(&arg(&args, 0))?.is_nan())),
            "isFinite" => Ok(Value::Bool(self.to_number(&arg(&args, 0))?.is_finite())),
            "Number.isNaN" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Num(n) if n.is_nan()))),
            "Number.isFinite" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Num(n) if n.is_finite()))),
            "Number.isInteger" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Num(n) if n.is_finite() && n.fract() == 0.0))),
            "Number.isSafeInteger" => Ok(Value::Bool(
                matches!(arg(&args, 0), Value::Num(n) if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0),
            )),
            "encodeURIComponent" | "encodeURI" => {
                let s = self.to_string(&arg(&args, 0))?;
                Ok(Value::Str(percent_encode(&s, name == "encodeURI")))
            }
            "decodeURIComponent" | "decodeURI" => {
                let s = self.to_string(&arg(&args, 0))?;
                percent_decode(&s).map(Value::Str).ok_or_else(|| ScriptError::Dom { name: "URIError", message: "URI malformed".into() })
            }
            "String" => match args.first() {
                None => Ok(Value::str("")),
                Some(v) => Ok(Value::Str(self.to_string(v)?)),
            },
            "String.fromCharCode" => {
                let mut out = String::new();
                for a in &args {
                    let code = to_uint32(self.to_number(a)?) & 0xffff;
                    out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                }
                Ok(Value::Str(out))
            }
            "Number" => match args.first() {
                None => Ok(Value::Num(0.0)),
                Some(v) => Ok(Value::Num(self.to_number(v)?)),
            },
            "Boolean" => Ok(Value::Bool(arg(&args, 0).truthy())),
            "Error" | "TypeError" | "RangeError" | "SyntaxError" | "ReferenceError" => {
                let message = match arg(&args, 0) {
                    Value::Undefined => String::new(),
                    m => self.to_string(&m)?,
                };
                Ok(self.error_value(name, &message))
            }
            "Object" => match arg(&args, 0) {
                v @ Value::Obj(_) => Ok(v),
                _ => Ok(self.plain(Vec::new())),
            },
            "Array" | "Array.of" => {
                if name == "Array" && args.len() == 1 {
                    if let Value::Num(n) = args[0] {
                        if n < 0.0 || n.fract() != 0.0 || n > MAX_ARRAY_LEN as f64 {
                            return Err(ScriptError::Range("Invalid array length".into()));
                        }
                        return Ok(self.array(vec![Value::Undefined; n as usize]));
                    }
                }
                Ok(self.array(args))
            }
            "Array.isArray" => Ok(Value::Bool(matches!(
                arg(&args, 0).as_obj().map(|id| &self.heap[id].kind),
                Some(ObjKind::Array(_))
            ))),
            "Array.from" => self.array_from(&args),
            "Map" => {
                if !construct {
                    return Err(type_err("Constructor Map requires 'new'"));
                }
                let mut entries: Vec<(Value, Value)> = Vec::new();
                if let Some(src) = args.first().filter(|v| !v.is_nullish()) {
                    for pair in self.iterate(src)? {
                        let k = self.get_prop(&pair, "0")?;
                        let v = self.get_prop(&pair, "1")?;
                        match entries.iter_mut().find(|(ek, _)| same_value_zero(ek, &k)) {
                            Some(slot) => slot.1 = v,
                            None => entries.push((k, v)),
                        }
                    }
                }
                Ok(Value::Obj(self.alloc(ObjKind::Map(entries))))
            }
            "Set" => {
                if !construct {
                    return Err(type_err("Constructor Set requires 'new'"));
                }
                let mut items: Vec<Value> = Vec::new();
                if let Some(src) = args.first().filter(|v| !v.is_nullish()) {
                    for v in self.iterate(src)? {
                        if !items.iter().any(|i| same_value_zero(i, &v)) {
                            items.push(v);
                        }
                    }
                }
                Ok(Value::Obj(self.alloc(ObjKind::Set(items))))
            }
            "RegExp" => {
                let (pattern, mut flags) = match arg(&args, 0) {
                    Value::Obj(id) => match &self.heap[id].kind {
                        ObjKind::Regex { source, flags, .. } => (source.clone(), flags.clone()),
                        _ => (self.to_string(&Value::Obj(id))?, String::new()),
                    },
                    Value::Undefined => ("(?:)".to_string(), String::new()),
                    other => (self.to_string(&other)?, String::new()),
                };
                if let Some(f) = args.get(1).filter(|f| !f.is_nullish()) {
                    flags = self.to_string(f)?;
                }
                self.new_regex(&pattern, &flags)
            }
            "Function" => Err(ScriptError::Dom {
                name: "EvalError",
                message: "Code generation from strings disallowed for this context".into(),
            }),
            "Date" => {
                if !construct {
                    return Ok(Value::Str(date_string(self.now())));
                }
                let t = match args.len() {
                    0 => self.now(),
                    1 => match &args[0] {
                        Value::Str(s) => parse_date(s),
                        Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Date(_)) => self.to_number(&args[0])?,
                        other => self.to_number(other)?,
                    },
                    _ => {
                        let mut parts = [0f64, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
                        for (i, a) in args.iter().take(7).enumerate() {
                            parts[i] = self.to_number(a)?;
                        }
                        make_time(parts)
                    }
                };
                Ok(Value::Obj(self.alloc(ObjKind::Date(t))))
            }
            "Date.now" => Ok(Value::Num(self.now().floor())),
            "JSON.stringify" => {
                let indent = match arg(&args, 2) {
                    Value::Num(n) => " ".repeat(n.clamp(0.0, 10.0) as usize),
                    Value::Str(s) => s.chars().take(10).collect(),
                    _ => String::new(),
                };
                let mut stack = Vec::new();
                Ok(match self.json_stringify(&arg(&args, 0), &indent, "", &mut stack)? {
                    Some(s) => Value::Str(s),
                    None => Value::Undefined,
                })
            }
            "JSON.parse" => {
                let text = self.to_string(&arg(&args, 0))?;
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(v) => Ok(self.from_json(&v)),
                    Err(_) => {
                        let shown: String = text.chars().take(30).collect();
                        Err(ScriptError::Syntax(format!("\"{shown}\" is not valid JSON")))
                    }
                }
            }
            n if n.starts_with("console.") => {
                let mut parts = Vec::with_capacity(args.len());
                for a in &args {
                    parts.push(self.inspect(a));
                }
                self.log(&n["console.".len()..], parts.join(" "));
                Ok(Value::Undefined)
            }
            n if n.starts_with("Object.") => self.object_static(&n["Object.".len()..], args),
            n if n == "Promise" || n.starts_with("Promise.") => self.promise_native(n, args, construct),
            _ => self.call_host_native(name, this, args, construct),
        }
    }

    fn now(&self) -> f64 {
        self.epoch_ms + self.clock
    }

    fn math(&mut self, op: &str, args: &[Value]) -> R<Value> {
        let mut nums = Vec::with_capacity(args.len());
        for a in args {
            nums.push(self.to_number(a)?);
        }
        let x = nums.first().copied().unwrap_or(f64::NAN);
        let y = nums.get(1).copied().unwrap_or(f64::NAN);
        Ok(Value::Num(match op {
            "abs" => x.abs(),
            "floor" => x.floor(),
            "ceil" => x.ceil(),
            "round" => (x + 0.5).floor(),
            "trunc" => x.trunc(),
            "sign" => {
                if x.is_nan() || x == 0.0 {
                    x
                } else {
                    x.signum()
                }
            }
            "sqrt" => x.sqrt(),
            "cbrt" => x.cbrt(),
            "pow" => x.powf(y),
            "min" => nums.iter().copied().fold(f64::INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }),
            "max" => nums.iter().copied().fold(f64::NEG_INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }),
            "random" => rand::thread_rng().gen::<f64>(),
            "sin" => x.sin(),
            "cos" => x.cos(),
            "tan" => x.tan(),
            "asin" => x.asin(),
            "acos" => x.acos(),
            "atan" => x.atan(),
            "atan2" => x.atan2(y),
            "log" => x.ln(),
            "log2" => x.log2(),
            "log10" => x.log10(),
            "exp" => x.exp(),
            "hypot" => nums.iter().map(|n| n * n).sum::<f64>().sqrt(),
            _ => f64::NAN,
        }))
    }

    fn object_static(&mut self, op: &str, args: Vec<Value>) -> R<Value> {
        let target = arg(&args, 0);
        let needs_object = matches!(op, "keys" | "values" | "entries" | "assign" | "getOwnPropertyNames");
        if needs_object && target.is_nullish() {
            return Err(type_err(format!("Cannot convert {} to object", target.kind_label())));
        }
        match op {
            "keys" | "getOwnPropertyNames" => {
                let keys = self.own_keys(&target).into_iter().map(Value::Str).collect();
                Ok(self.array(keys))
            }
            "values" => {
                let mut out = Vec::new();
                for k in self.own_keys(&target) {
                    out.push(self.get_prop(&target, &k)?);
                }
                Ok(self.array(out))
            }
            "entries" => {
                let mut out = Vec::new();
                for k in self.own_keys(&target) {
                    let v = self.get_prop(&target, &k)?;
                    out.push(self.array(vec![Value::Str(k), v]));
                }
                Ok(self.array(out))
            }
            "assign" => {
                for src in args.iter().skip(1).filter(|s| !s.is_nullish()) {
                    for k in self.own_keys(src) {
                        let v = self.get_prop(src, &k)?;
                        self.set_prop(&target, &k, v)?;
                    }
                }
                Ok(target)
            }
            "freeze" => Ok(target),
            "isFrozen" => Ok(Value::Bool(false)),
            "fromEntries" => {
                let out = self.plain(Vec::new());
                for pair in self.iterate(&target)? {
                    let k = self.get_prop(&pair, "0")?;
                    let k = self.to_string(&k)?;
                    let v = self.get_prop(&pair, "1")?;
                    self.set_prop(&out, &k, v)?;
                }
                Ok(out)
            }
            "create" => {
                let id = self.alloc(ObjKind::Plain);
                self.heap[id].proto = target.as_obj();
                Ok(Value::Obj(id))
            }
            "getPrototypeOf" => Ok(target
                .as_obj()
                .and_then(|id| self.heap[id].proto)
                .map(Value::Obj)
                .unwrap_or(Value::Null)),
            "defineProperty" => {
                let key = self.to_string(&arg(&args, 1))?;
                let desc = arg(&args, 2);
                if desc.is_nullish() {
                    return Ok(target);
                }
                let get = self.get_prop(&desc, "get")?;
                let set = self.get_prop(&desc, "set")?;
                match target.as_obj() {
                    Some(id) if !get.is_nullish() || !set.is_nullish() => {
                        for (label, f) in [("Getter", &get), ("Setter", &set)] {
                            if !f.is_nullish() && !self.is_callable(f) {
                                return Err(type_err(format!("{label} must be a function: {}", self.display(f))));
                            }
                        }
                        let get = (!get.is_nullish()).then_some(get);
                        let set = (!set.is_nullish()).then_some(set);
                        self.define_accessor(id, &key, get, set);
                    }
                    _ => {
                        let v = self.get_prop(&desc, "value")?;
                        self.set_prop(&target, &key, v)?;
                    }
                }
                Ok(target)
            }
            _ => Err(type_err(format!("Object.{op} is not a function"))),
        }
    }

    fn array_from(&mut self, args: &[Value]) -> R<Value> {
        let src = arg(args, 0);
        if src.is_nullish() {
            return Err(type_err(format!("{} is not iterable", src.kind_label())));
        }
        let items = match self.iterate(&src) {
            Ok(items) => items,
            Err(_) => {
                let len = self.get_prop(&src, "length")?;
                let len = self.to_number(&len)?;
                let len = if len.is_finite() && len > 0.0 { len.min(MAX_ARRAY_LEN as f64) as usize } else { 0 };
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(self.get_prop(&src, &i.to_string())?);
                }
                out
            }
        };
        let map = arg(args, 1);
        if map.is_nullish() {
            return Ok(self.array(items));
        }
        let mut out = Vec::with_capacity(items.len());
        for (i, v) in items.into_iter().enumerate() {
            self.tick()?;
            out.push(self.call(&map, Value::Undefined, vec![v, Value::Num(i as f64)])?);
        }
        Ok(self.array(out))
    }

    // --- Method dispatch ---

    pub fn has_method(&self, v: &Value, key: &str) -> bool {
        match v {
            Value::Str(_) => STRING_METHODS.contains(&key),
            Value::Num(_) => NUMBER_METHODS.contains(&key),
            Value::Bool(_) => matches!(key, "toString" | "valueOf"),
            Value::Undefined | Value::Null => false,
            Value::Obj(id) => {
                let specific: &[&str] = match &self.heap[*id].kind {
                    ObjKind::Array(_) => ARRAY_METHODS,
                    ObjKind::Regex { .. } => REGEX_METHODS,
                    ObjKind::Map(_) => MAP_METHODS,
                    ObjKind::Set(_) => SET_METHODS,
                    ObjKind::Date(_) => DATE_METHODS,
                    ObjKind::Node(n) => {
                        if *n == crate::sandbox::dom::DOCUMENT {
                            host::DOCUMENT_METHODS
                        } else {
                            host::NODE_METHODS
                        }
                    }
                    ObjKind::Window => host::WINDOW_METHODS,
                    ObjKind::ClassList(_) => host::CLASS_LIST_METHODS,
                    ObjKind::Style(_) => host::STYLE_METHODS,
                    ObjKind::ComputedStyle(_) => &["getPropertyValue"],
                    ObjKind::NodeList(_) => host::NODE_LIST_METHODS,
                    ObjKind::Event { .. } => host::EVENT_METHODS,
                    ObjKind::Promise(_) => PROMISE_METHODS,
                    ObjKind::Storage(_) => host::STORAGE_METHODS,
                    k if k.is_callable() => FUNCTION_METHODS,
                    _ => &[],
                };
                specific.contains(&key) || OBJECT_METHODS.contains(&key)
            }
        }
    }

    pub fn call_method(&mut self, this: &Value, name: &str, args: Vec<Value>) -> R<Value> {
        match this {
            Value::Str(s) => {
                let s = s.clone();
                self.string_method(&s, name, args)
            }
            Value::Num(n) => self.number_method(*n, name, args),
            Value::Bool(b) => Ok(match name {
                "toString" => Value::str(b.to_string()),
                _ => Value::Bool(*b),
            }),
            Value::Obj(id) => {
                let id = *id;
                let handled = match &self.heap[id].kind {
                    ObjKind::Array(_) if ARRAY_METHODS.contains(&name) => Some(self.array_method(id, name, args.clone())?),
                    ObjKind::Regex { .. } if REGEX_METHODS.contains(&name) => Some(self.regex_method(id, name, &args)?),
                    ObjKind::Map(_) if MAP_METHODS.contains(&name) => Some(self.map_method(id, name, &args)?),
                    ObjKind::Set(_) if SET_METHODS.contains(&name) => Some(self.set_method(id, name, &args)?),
                    ObjKind::Date(t) if DATE_METHODS.contains(&name) => {
                        let t = *t;
                        Some(date_method(t, name)?)
                    }
                    ObjKind::Promise(_) if PROMISE_METHODS.contains(&name) => Some(self.promise_method(id, name, &args)?),
                    k if k.is_callable() && FUNCTION_METHODS.contains(&name) => Some(self.function_method(id, name, args.clone())?),
                    _ => self.call_host_method(id, name, &args)?,
                };
                match handled {
                    Some(v) => Ok(v),
                    None => self.object_method(this, name, &args),
                }
            }
            _ => Err(type_err(format!("Cannot read properties of {} (reading '{name}')", this.kind_label()))),
        }
    }

    fn object_method(&mut self, this: &Value, name: &str, args: &[Value]) -> R<Value> {
        match name {
            "hasOwnProperty" => {
                let key = self.to_string(&arg(args, 0))?;
                let own = self.own_keys(this).contains(&key)
                    || matches!(this, Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Array(_)) && key == "length");
                Ok(Value::Bool(own))
            }
            "toString" => Ok(Value::Str(self.to_string(this)?)),
            "valueOf" => Ok(this.clone()),
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    fn function_method(&mut self, id: ObjId, name: &str, args: Vec<Value>) -> R<Value> {
        let mut args = args.into_iter();
        let this = args.next().unwrap_or(Value::Undefined);
        match name {
            "call" => self.call_function(id, this, args.collect()),
            "apply" => {
                let list = args.next().unwrap_or(Value::Undefined);
                let list = if list.is_nullish() { Vec::new() } else { self.iterate(&list)? };
                self.call_function(id, this, list)
            }
            "bind" => Ok(Value::Obj(self.alloc(ObjKind::Bound { target: id, this, args: args.collect() }))),
            _ => Ok(Value::Str(self.to_string(&Value::Obj(id))?)),
        }
    }

    pub fn native_instance_of(&self, id: ObjId, ctor: &str) -> bool {
        let kind = &self.heap[id].kind;
        match ctor {
            "Object" => true,
            "Array" => matches!(kind, ObjKind::Array(_)),
            "Function" => kind.is_callable(),
            "Error" => matches!(kind, ObjKind::Error),
            "TypeError" | "RangeError" | "SyntaxError" | "ReferenceError" => {
                matches!(kind, ObjKind::Error)
                    && matches!(self.heap[id].props.get("name"), Some(Value::Str(n)) if n == ctor)
            }
            "Date" => matches!(kind, ObjKind::Date(_)),
            "Map" => matches!(kind, ObjKind::Map(_)),
            "Set" => matches!(kind, ObjKind::Set(_)),
            "RegExp" => matches!(kind, ObjKind::Regex { .. }),
            "Promise" => matches!(kind, ObjKind::Promise(_)),
            _ => self.host_instance_of(id, ctor),
        }
    }

    // --- Strings ---

    fn string_method(&mut self, s: &str, name: &str, args: Vec<Value>) -> R<Value> {
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len();
        let sub = |a: usize, b: usize| -> String {
            let a = a.min(len);
            let b = b.min(len).max(a);
            chars[a..b].iter().collect()
        };
        Ok(match name {
            "charAt" => {
                let i = self.to_integer(&arg(&args, 0), 0.0)?;
                Value::Str(if i >= 0.0 { chars.get(i as usize).map(|c| c.to_string()).unwrap_or_default() } else { String::new() })
            }
            "charCodeAt" | "codePointAt" => {
                let i = self.to_integer(&arg(&args, 0), 0.0)?;
                match chars.get(i.max(0.0) as usize).filter(|_| i >= 0.0) {
                    Some(c) => Value::Num(*c as u32 as f64),
                    None if name == "codePointAt" => Value::Undefined,
                    None => Value::Num(f64::NAN),
                }
            }
            "at" => {
                let i = self.to_integer(&arg(&args, 0), 0.0)?;
                let idx = if i < 0.0 { len as f64 + i } else { i };
                if idx < 0.0 {
                    Value::Undefined
                } else {
                    chars.get(idx as usize).map(|c| Value::Str(c.to_string())).unwrap_or(Value::Undefined)
                }
            }
            "indexOf" | "includes" => {
                let needle: Vec<char> = self.to_string(&arg(&args, 0))?.chars().collect();
                let from = self.to_integer(&arg(&args, 1), 0.0)?.max(0.0) as usize;
                let found = char_find(&chars, &needle, from);
                if name == "includes" {
                    Value::Bool(found.is_some())
                } else {
                    Value::Num(found.map(|i| i as f64).unwrap_or(-1.0))
                }
            }
            "lastIndexOf" => {
                let needle: Vec<char> = self.to_string(&arg(&args, 0))?.chars().collect();
                let found = (0..=len.saturating_sub(needle.len()))
                    .rev()
                    .find(|i| needle.len() <= len && chars[*i..*i + needle.len()] == needle[..]);
                Value::Num(found.map(|i| i as f64).unwrap_or(-1.0))
            }
            "startsWith" => {
                let needle: Vec<char> = self.to_string(&arg(&args, 0))?.chars().collect();
                let pos = self.to_integer(&arg(&args, 1), 0.0)?.max(0.0) as usize;
                Value::Bool(pos + needle.len() <= len && chars[pos..pos + needle.len()] == needle[..])
            }
            "endsWith" => {
                let needle: Vec<char> = self.to_string(&arg(&args, 0))?.chars().collect();
                let end = (self.to_integer(&arg(&args, 1), len as f64)?.max(0.0) as usize).min(len);
                Value::Bool(needle.len() <= end && chars[end - needle.len()..end] == needle[..])
            }
            "slice" => {
                let a = relative_index(self.to_integer(&arg(&args, 0), 0.0)?, len);
                let b = relative_index(self.to_integer(&arg(&args, 1), len as f64)?, len);
                Value::Str(sub(a, b))
            }
            "substring" => {
                let a = self.to_integer(&arg(&args, 0), 0.0)?.clamp(0.0, len as f64) as usize;
                let b = self.to_integer(&arg(&args, 1), len as f64)?.clamp(0.0, len as f64) as usize;
                Value::Str(sub(a.min(b), a.max(b)))
            }
            "substr" => {
                let a = relative_index(self.to_integer(&arg(&args, 0), 0.0)?, len);
                let n = self.to_integer(&arg(&args, 1), len as f64)?.max(0.0) as usize;
                Value::Str(sub(a, a.saturating_add(n)))
            }
            "toUpperCase" | "toLocaleUpperCase" => Value::Str(s.to_uppercase()),
            "toLowerCase" | "toLocaleLowerCase" => Value::Str(s.to_lowercase()),
            "trim" => Value::str(s.trim()),
            "trimStart" => Value::str(s.trim_start()),
            "trimEnd" => Value::str(s.trim_end()),
            "padStart" | "padEnd" => {
                let target = self.to_integer(&arg(&args, 0), 0.0)?.max(0.0) as usize;
                let pad = match arg(&args, 1) {
                    Value::Undefined => " ".to_string(),
                    p => self.to_string(&p)?,
                };
                if target <= len || pad.is_empty() {
                    Value::str(s)
                } else {
                    check_string_len((target - len).saturating_mul(pad.chars().map(char::len_utf8).max().unwrap_or(1)).saturating_add(s.len()))?;
                    let fill: String = pad.chars().cycle().take(target - len).collect();
                    Value::Str(if name == "padStart" { fill + s } else { s.to_string() + &fill })
                }
            }
            "repeat" => {
                let n = self.to_integer(&arg(&args, 0), 0.0)?;
                if n < 0.0 || n.is_infinite() {
                    return Err(ScriptError::Range(format!("Invalid count value: {}", number_to_string(n))));
                }
                check_string_len((n.min(MAX_STRING_LEN as f64) as usize).saturating_mul(s.len()))?;
                Value::Str(s.repeat(n as usize))
            }
            "concat" => {
                let mut out = s.to_string();
                for a in &args {
                    out.push_str(&self.to_string(a)?);
                    check_string_len(out.len())?;
                }
                Value::Str(out)
            }
            "localeCompare" => {
                let other = self.to_string(&arg(&args, 0))?;
                let ord = s.to_lowercase().cmp(&other.to_lowercase()).then_with(|| other.cmp(&s.to_string()));
                Value::Num(match ord {
                    std::cmp::Ordering::Less => -1.0,
                    std::cmp::Ordering::Equal => 0.0,
                    std::cmp::Ordering::Greater => 1.0,
                })
            }
            "normalize" | "toString" | "valueOf" => Value::str(s),
            "split" => return self.string_split(s, &args),
            "replace" | "replaceAll" => return self.string_replace(s, name == "replaceAll", &args),
            "match" => {
                let (re, flags) = self.coerce_regex(&arg(&args, 0))?;
                if flags.contains('g') {
                    let all: Vec<Value> = re.find_iter(s).map(|m| Value::str(m.as_str())).collect();
                    if all.is_empty() {
                        Value::Null
                    } else {
                        self.array(all)
                    }
                } else {
                    match re.captures(s) {
                        Some(caps) => self.match_result(&caps, s),
                        None => Value::Null,
                    }
                }
            }
            "search" => {
                let (re, _) = self.coerce_regex(&arg(&args, 0))?;
                Value::Num(re.find(s).map(|m| s[..m.start()].chars().count() as f64).unwrap_or(-1.0))
            }
            _ => return Err(type_err(format!("{name} is not a function"))),
        })
    }

    fn string_split(&mut self, s: &str, args: &[Value]) -> R<Value> {
        let limit = match arg(args, 1) {
            Value::Undefined => usize::MAX,
            l => to_uint32(self.to_number(&l)?) as usize,
        };
        let sep = arg(args, 0);
        let parts: Vec<String> = match &sep {
            Value::Undefined => vec![s.to_string()],
            Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Regex { .. }) => {
                let (re, _) = self.coerce_regex(&sep)?;
                if s.is_empty() {
                    if re.is_match(s) { Vec::new() } else { vec![String::new()] }
                } else {
                    let mut out: Vec<String> = re.split(s).map(str::to_string).collect();
                    if re.find(s).map(|m| m.as_str().is_empty()).unwrap_or(false) {
                        out = s.chars().map(|c| c.to_string()).collect();
                    }
                    out
                }
            }
            other => {
                let sep = self.to_string(other)?;
                if sep.is_empty() {
                    s.chars().map(|c| c.to_string()).collect()
                } else {
                    s.split(sep.as_str()).map(str::to_string).collect()
                }
            }
        };
        let parts = parts.into_iter().take(limit).map(Value::Str).collect();
        Ok(self.array(parts))
    }

    fn string_replace(&mut self, s: &str, all: bool, args: &[Value]) -> R<Value> {
        let pattern = arg(args, 0);
        let replacement = arg(args, 1);
        let callable = self.is_callable(&replacement);
        let template = if callable { String::new() } else { self.to_string(&replacement)? };

        let is_regex = matches!(&pattern, Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Regex { .. }));
        if is_regex {
            let (re, flags) = self.coerce_regex(&pattern)?;
            let global = flags.contains('g');
            if all && !global {
                return Err(type_err("replaceAll must be called with a global RegExp"));
            }
            let captures: Vec<Captures> = if global { re.captures_iter(s).collect() } else { re.captures(s).into_iter().collect() };
            let mut out = String::new();
            let mut last = 0;
            for caps in captures {
                let Some(m) = caps.get(0) else { continue };
                out.push_str(&s[last..m.start()]);
                let groups: Vec<Option<&str>> = (1..caps.len()).map(|i| caps.get(i).map(|g| g.as_str())).collect();
                let rep = if callable {
                    let mut cb_args = vec![Value::str(m.as_str())];
                    cb_args.extend(groups.iter().map(|g| g.map(Value::str).unwrap_or(Value::Undefined)));
                    cb_args.push(Value::Num(s[..m.start()].chars().count() as f64));
                    cb_args.push(Value::str(s));
                    let r = self.call(&replacement, Value::Undefined, cb_args)?;
                    self.to_string(&r)?
                } else {
                    expand_replacement(&template, m.as_str(), &groups, &s[..m.start()], &s[m.end()..])
                };
                out.push_str(&rep);
                check_string_len(out.len())?;
                last = m.end();
            }
            out.push_str(&s[last..]);
            return Ok(Value::Str(out));
        }

        let needle = self.to_string(&pattern)?;
        let mut positions = Vec::new();
        if all {
            if needle.is_empty() {
                positions.extend(s.char_indices().map(|(i, _)| i));
                positions.push(s.len());
            } else {
                positions.extend(s.match_indices(needle.as_str()).map(|(i, _)| i));
            }
        } else if let Some(i) = s.find(needle.as_str()) {
            positions.push(i);
        }
        let mut out = String::new();
        let mut last = 0;
        for start in positions {
            let end = start + needle.len();
            out.push_str(&s[last..start]);
            let rep = if callable {
                let cb_args = vec![Value::str(needle.as_str()), Value::Num(s[..start].chars().count() as f64), Value::str(s)];
                let r = self.call(&replacement, Value::Undefined, cb_args)?;
                self.to_string(&r)?
            } else {
                expand_replacement(&template, &needle, &[], &s[..start], &s[end..])
            };
            out.push_str(&rep);
            check_string_len(out.len())?;
            last = end;
        }
        out.push_str(&s[last..]);
        Ok(Value::Str(out))
    }

    fn match_result(&mut self, caps: &Captures, input: &str) -> Value {
        let items: Vec<Value> = (0..caps.len())
            .map(|i| caps.get(i).map(|m| Value::str(m.as_str())).unwrap_or(Value::Undefined))
            .collect();
        let index = caps.get(0).map(|m| input[..m.start()].chars().count()).unwrap_or(0);
        let arr = self.array(items);
        if let Value::Obj(id) = arr {
            self.heap[id].props.set("index", Value::Num(index as f64));
            self.heap[id].props.set("input", Value::str(input));
        }
        arr
    }

    // --- Regular expressions ---

    pub fn new_regex(&mut self, pattern: &str, flags: &str) -> R<Value> {
        let re = compile_regex(pattern, flags)?;
        Ok(Value::Obj(self.alloc(ObjKind::Regex {
            source: pattern.to_string(),
            flags: flags.to_string(),
            re,
            last_index: 0,
        })))
    }

    /// A regex value as-is, anything else compiled from its string form.
    fn coerce_regex(&mut self, v: &Value) -> R<(Regex, String)> {
        if let Value::Obj(id) = v {
            if let ObjKind::Regex { re, flags, .. } = &self.heap[*id].kind {
                return Ok((re.clone(), flags.clone()));
            }
        }
        let s = match v {
            Value::Undefined => String::new(),
            other => self.to_string(other)?,
        };
        Ok((compile_regex(&regex::escape(&s), "")?, String::new()))
    }

    fn regex_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Value> {
        let (re, flags, source, last_index) = match &self.heap[id].kind {
            ObjKind::Regex { re, flags, source, last_index } => (re.clone(), flags.clone(), source.clone(), *last_index),
            _ => return Err(type_err("not a regular expression")),
        };
        if name == "toString" {
            return Ok(Value::Str(format!("/{source}/{flags}")));
        }
        let input = self.to_string(&arg(args, 0))?;
        let sticky = flags.contains('g') || flags.contains('y');
        let start = if sticky {
            input.char_indices().nth(last_index).map(|(b, _)| b).unwrap_or(if last_index == input.chars().count() { input.len() } else { usize::MAX })
        } else {
            0
        };
        let caps = if start > input.len() { None } else { re.captures_at(&input, start) };
        let new_last = match (&caps, sticky) {
            (Some(c), true) => c.get(0).map(|m| input[..m.end()].chars().count()).unwrap_or(0),
            _ => 0,
        };
        if sticky {
            if let ObjKind::Regex { last_index, .. } = &mut self.heap[id].kind {
                *last_index = new_last;
            }
        }
        Ok(match name {
            "test" => Value::Bool(caps.is_some()),
            _ => match caps {
                Some(c) => self.match_result(&c, &input),
                None => Value::Null,
            },
        })
    }

    // --- Numbers ---

    fn number_method(&mut self, n: f64, name: &str, args: Vec<Value>) -> R<Value> {
        Ok(match name {
            "toFixed" => {
                let digits = self.to_integer(&arg(&args, 0), 0.0)?;
                if !(0.0..=100.0).contains(&digits) {
                    return Err(ScriptError::Range("toFixed() digits argument must be between 0 and 100".into()));
                }
                Value::Str(to_fixed(n, digits as usize))
            }
            "toString" => {
                let radix = match arg(&args, 0) {
                    Value::Undefined => 10,
                    r => self.to_number(&r)? as u32,
                };
                if !(2..=36).contains(&radix) {
                    return Err(ScriptError::Range("toString() radix must be between 2 and 36".into()));
                }
                Value::Str(if radix == 10 || !n.is_finite() || n.fract() != 0.0 { number_to_string(n) } else { int_to_radix(n, radix) })
            }
            "toPrecision" => match arg(&args, 0) {
                Value::Undefined => Value::Str(number_to_string(n)),
                p => {
                    let p = self.to_number(&p)?;
                    if !(1.0..=100.0).contains(&p) {
                        return Err(ScriptError::Range("toPrecision() argument must be between 1 and 100".into()));
                    }
                    Value::Str(to_precision(n, p as usize))
                }
            },
            "toLocaleString" => {
                let opts = arg(&args, 1);
                let mut min_frac = 0usize;
                let mut max_frac = 3usize;
                let mut prefix = String::new();
                if !opts.is_nullish() {
                    if let Value::Str(style) = self.get_prop(&opts, "style")? {
                        if style == "currency" {
                            let cur = self.get_prop(&opts, "currency")?;
                            prefix = match self.to_string(&cur)?.as_str() {
                                "USD" => "$".into(),
                                "EUR" => "€".into(),
                                "GBP" => "£".into(),
                                other => format!("{other} "),
                            };
                            min_frac = 2;
                            max_frac = 2;
                        }
                    }
                    if let Value::Num(m) = self.get_prop(&opts, "minimumFractionDigits")? {
                        min_frac = m as usize;
                        max_frac = max_frac.max(min_frac);
                    }
                    if let Value::Num(m) = self.get_prop(&opts, "maximumFractionDigits")? {
                        max_frac = m as usize;
                    }
                }
                Value::Str(locale_number(n, min_frac, max_frac, &prefix))
            }
            _ => Value::Num(n),
        })
    }

    pub fn to_integer(&mut self, v: &Value, default: f64) -> R<f64> {
        match v {
            Value::Undefined => Ok(default),
            other => {
                let n = self.to_number(other)?;
                Ok(if n.is_nan() { 0.0 } else { n.trunc() })
            }
        }
    }

    // --- Arrays ---

    fn arr_len(&self, id: ObjId) -> usize {
        match &self.heap[id].kind {
            ObjKind::Array(items) => items.len(),
            _ => 0,
        }
    }

    fn arr_get(&self, id: ObjId, i: usize) -> Value {
        match &self.heap[id].kind {
            ObjKind::Array(items) => items.get(i).cloned().unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    fn arr_snapshot(&self, id: ObjId) -> Vec<Value> {
        match &self.heap[id].kind {
            ObjKind::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    fn arr_mut(&mut self, id: ObjId) -> R<&mut Vec<Value>> {
        match &mut self.heap[id].kind {
            ObjKind::Array(items) => Ok(items),
            _ => Err(type_err("not an array")),
        }
    }

    fn array_method(&mut self, id: ObjId, name: &str, args: Vec<Value>) -> R<Value> {
        let this = Value::Obj(id);
        let f = arg(&args, 0);
        match name {
            "push" => {
                check_array_len(self.arr_len(id) + args.len())?;
                let items = self.arr_mut(id)?;
                items.extend(args);
                Ok(Value::Num(items.len() as f64))
            }
            "pop" => Ok(self.arr_mut(id)?.pop().unwrap_or(Value::Undefined)),
            "shift" => {
                let items = self.arr_mut(id)?;
                Ok(if items.is_empty() { Value::Undefined } else { items.remove(0) })
            }
            "unshift" => {
                check_array_len(self.arr_len(id) + args.len())?;
                let items = self.arr_mut(id)?;
                for (i, v) in args.into_iter().enumerate() {
                    items.insert(i, v);
                }
                Ok(Value::Num(items.len() as f64))
            }
            "slice" => {
                let items = self.arr_snapshot(id);
                let len = items.len();
                let a = relative_index(self.to_integer(&arg(&args, 0), 0.0)?, len);
                let b = relative_index(self.to_integer(&arg(&args, 1), len as f64)?, len);
                let out = if a < b { items[a..b].to_vec() } else { Vec::new() };
                Ok(self.array(out))
            }
            "splice" => {
                let len = self.arr_len(id);
                let start = relative_index(self.to_integer(&arg(&args, 0), 0.0)?, len);
                let count = match args.len() {
                    0 => 0,
                    1 => len - start,
                    _ => (self.to_integer(&args[1], 0.0)?.max(0.0) as usize).min(len - start),
                };
                let inserts: Vec<Value> = args.into_iter().skip(2).collect();
                check_array_len(len - count + inserts.len())?;
                let items = self.arr_mut(id)?;
                let removed: Vec<Value> = items.splice(start..start + count, inserts).collect();
                Ok(self.array(removed))
            }
            "concat" => {
                let mut out = self.arr_snapshot(id);
                for a in &args {
                    match a {
                        Value::Obj(aid) if matches!(self.heap[*aid].kind, ObjKind::Array(_)) => out.extend(self.arr_snapshot(*aid)),
                        other => out.push(other.clone()),
                    }
                    check_array_len(out.len())?;
                }
                Ok(self.array(out))
            }
            "join" | "toString" => {
                let sep = match (name, &f) {
                    ("join", Value::Undefined) | ("toString", _) => ",".to_string(),
                    (_, other) => self.to_string(other)?,
                };
                if self.joining.contains(&id) {
                    return Ok(Value::str(""));
                }
                if self.joining.len() >= MAX_CALL_DEPTH {
                    return Err(ScriptError::StackOverflow);
                }
                self.joining.push(id);
                let mut parts = Vec::new();
                let mut total = 0usize;
                let mut res = Ok(());
                for v in self.arr_snapshot(id) {
                    let part = match v {
                        Value::Undefined | Value::Null => Ok(String::new()),
                        other => self.to_string(&other),
                    };
                    match part.and_then(|p| {
                        total += p.len() + sep.len();
                        check_string_len(total).map(|_| p)
                    }) {
                        Ok(p) => parts.push(p),
                        Err(e) => {
                            res = Err(e);
                            break;
                        }
                    }
                }
                self.joining.retain(|j| *j != id);
                res?;
                Ok(Value::Str(parts.join(&sep)))
            }
            "reverse" => {
                self.arr_mut(id)?.reverse();
                Ok(this)
            }
            "indexOf" | "lastIndexOf" | "includes" => {
                let items = self.arr_snapshot(id);
                let pos = match name {
                    "indexOf" => items.iter().position(|v| *v == f),
                    "lastIndexOf" => items.iter().rposition(|v| *v == f),
                    _ => items.iter().position(|v| same_value_zero(v, &f)),
                };
                Ok(if name == "includes" {
                    Value::Bool(pos.is_some())
                } else {
                    Value::Num(pos.map(|p| p as f64).unwrap_or(-1.0))
                })
            }
            "find" | "findIndex" | "findLast" | "findLastIndex" => {
                let len = self.arr_len(id);
                let reverse = name.starts_with("findLast");
                let order: Vec<usize> = if reverse { (0..len).rev().collect() } else { (0..len).collect() };
                for i in order {
                    self.tick()?;
                    let v = self.arr_get(id, i);
                    let hit = self.call(&f, Value::Undefined, vec![v.clone(), Value::Num(i as f64), this.clone()])?;
                    if hit.truthy() {
                        return Ok(if name.ends_with("Index") { Value::Num(i as f64) } else { v });
                    }
                }
                Ok(if name.ends_with("Index") { Value::Num(-1.0) } else { Value::Undefined })
            }
            "filter" | "map" | "forEach" | "some" | "every" | "flatMap" => {
                if !self.is_callable(&f) {
                    let shown = self.display(&f);
                    return Err(type_err(format!("{shown} is not a function")));
                }
                let len = self.arr_len(id);
                let mut out = Vec::new();
                for i in 0..len {
                    self.tick()?;
                    if i >= self.arr_len(id) {
                        break;
                    }
                    let v = self.arr_get(id, i);
                    let r = self.call(&f, arg(&args, 1), vec![v.clone(), Value::Num(i as f64), this.clone()])?;
                    match name {
                        "filter" if r.truthy() => out.push(v),
                        "map" => out.push(r),
                        "flatMap" => match &r {
                            Value::Obj(rid) if matches!(self.heap[*rid].kind, ObjKind::Array(_)) => {
                                out.extend(self.arr_snapshot(*rid));
                                check_array_len(out.len())?;
                            }
                            _ => out.push(r),
                        },
                        "some" if r.truthy() => return Ok(Value::Bool(true)),
                        "every" if !r.truthy() => return Ok(Value::Bool(false)),
                        _ => {}
                    }
                }
                Ok(match name {
                    "forEach" => Value::Undefined,
                    "some" => Value::Bool(false),
                    "every" => Value::Bool(true),
                    _ => self.array(out),
                })
            }
            "reduce" | "reduceRight" => {
                let len = self.arr_len(id);
                let order: Vec<usize> = if name == "reduce" { (0..len).collect() } else { (0..len).rev().collect() };
                let mut iter = order.into_iter();
                let mut acc = if args.len() >= 2 {
                    args[1].clone()
                } else {
                    match iter.next() {
                        Some(i) => self.arr_get(id, i),
                        None => return Err(type_err("Reduce of empty array with no initial value")),
                    }
                };
                for i in iter {
                    self.tick()?;
                    let v = self.arr_get(id, i);
                    acc = self.call(&f, Value::Undefined, vec![acc, v, Value::Num(i as f64), this.clone()])?;
                }
                Ok(acc)
            }
            "sort" => {
                let items = self.arr_snapshot(id);
                let sorted = self.merge_sort(items, &f)?;
                *self.arr_mut(id)? = sorted;
                Ok(this)
            }
            "flat" => {
                let depth = self.to_integer(&f, 1.0)?;
                let items = self.arr_snapshot(id);
                let mut out = Vec::new();
                self.flatten(items, depth, &mut out)?;
                Ok(self.array(out))
            }
            "fill" => {
                let len = self.arr_len(id);
                let a = relative_index(self.to_integer(&arg(&args, 1), 0.0)?, len);
                let b = relative_index(self.to_integer(&arg(&args, 2), len as f64)?, len);
                let items = self.arr_mut(id)?;
                for slot in items.iter_mut().take(b).skip(a) {
                    *slot = f.clone();
                }
                Ok(this)
            }
            "at" => {
                let len = self.arr_len(id) as f64;
                let i = self.to_integer(&f, 0.0)?;
                let idx = if i < 0.0 { len + i } else { i };
                Ok(if idx < 0.0 { Value::Undefined } else { self.arr_get(id, idx as usize) })
            }
            "keys" => {
                let keys = (0..self.arr_len(id)).map(|i| Value::Num(i as f64)).collect();
                Ok(self.array(keys))
            }
            "values" => {
                let items = self.arr_snapshot(id);
                Ok(self.array(items))
            }
            "entries" => {
                let items = self.arr_snapshot(id);
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.into_iter().enumerate() {
                    out.push(self.array(vec![Value::Num(i as f64), v]));
                }
                Ok(self.array(out))
            }
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    /// Nesting is followed at most `MAX_CALL_DEPTH` levels, so a cyclic
    /// array flattened with `Infinity` still terminates.
    fn flatten(&self, items: Vec<Value>, depth: f64, out: &mut Vec<Value>) -> R<()> {
        for v in items {
            match &v {
                Value::Obj(id) if depth >= 1.0 && matches!(self.heap[*id].kind, ObjKind::Array(_)) => {
                    let depth = (depth - 1.0).min(MAX_CALL_DEPTH as f64);
                    self.flatten(self.arr_snapshot(*id), depth, out)?;
                }
                _ => {
                    out.push(v);
                    check_array_len(out.len())?;
                }
            }
        }
        Ok(())
    }

    fn merge_sort(&mut self, items: Vec<Value>, cmp: &Value) -> R<Vec<Value>> {
        if items.len() <= 1 {
            return Ok(items);
        }
        let mid = items.len() / 2;
        let right = self.merge_sort(items[mid..].to_vec(), cmp)?;
        let left = self.merge_sort(items[..mid].to_vec(), cmp)?;
        let mut out = Vec::with_capacity(left.len() + right.len());
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            if self.sort_compare(&right[j], &left[i], cmp)? < 0.0 {
                out.push(right[j].clone());
                j += 1;
            } else {
                out.push(left[i].clone());
                i += 1;
            }
        }
        out.extend_from_slice(&left[i..]);
        out.extend_from_slice(&right[j..]);
        Ok(out)
    }

    fn sort_compare(&mut self, a: &Value, b: &Value, cmp: &Value) -> R<f64> {
        self.tick()?;
        match (a, b) {
            (Value::Undefined, Value::Undefined) => return Ok(0.0),
            (Value::Undefined, _) => return Ok(1.0),
            (_, Value::Undefined) => return Ok(-1.0),
            _ => {}
        }
        if cmp.is_nullish() {
            let sa = self.to_string(a)?;
            let sb = self.to_string(b)?;
            return Ok(match sa.cmp(&sb) {
                std::cmp::Ordering::Less => -1.0,
                std::cmp::Ordering::Equal => 0.0,
                std::cmp::Ordering::Greater => 1.0,
            });
        }
        let r = self.call(cmp, Value::Undefined, vec![a.clone(), b.clone()])?;
        let n = self.to_number(&r)?;
        Ok(if n.is_nan() { 0.0 } else { n })
    }

    // --- Map / Set ---

    fn map_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Value> {
        let key = arg(args, 0);
        let this = Value::Obj(id);
        let ObjKind::Map(entries) = &mut self.heap[id].kind else { return Err(type_err("not a Map")) };
        let pos = entries.iter().position(|(k, _)| same_value_zero(k, &key));
        match name {
            "get" => Ok(pos.map(|p| entries[p].1.clone()).unwrap_or(Value::Undefined)),
            "set" => {
                let v = arg(args, 1);
                match pos {
                    Some(p) => entries[p].1 = v,
                    None => entries.push((key, v)),
                }
                Ok(this)
            }
            "has" => Ok(Value::Bool(pos.is_some())),
            "delete" => Ok(Value::Bool(pos.map(|p| entries.remove(p)).is_some())),
            "clear" => {
                entries.clear();
                Ok(Value::Undefined)
            }
            "forEach" => {
                let snapshot = entries.clone();
                for (k, v) in snapshot {
                    self.tick()?;
                    self.call(&key, Value::Undefined, vec![v, k, this.clone()])?;
                }
                Ok(Value::Undefined)
            }
            "keys" | "values" | "entries" => {
                let snapshot = entries.clone();
                let mut out = Vec::with_capacity(snapshot.len());
                for (k, v) in snapshot {
                    out.push(match name {
                        "keys" => k,
                        "values" => v,
                        _ => self.array(vec![k, v]),
                    });
                }
                Ok(self.array(out))
            }
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    fn set_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Value> {
        let v = arg(args, 0);
        let this = Value::Obj(id);
        let ObjKind::Set(items) = &mut self.heap[id].kind else { return Err(type_err("not a Set")) };
        let pos = items.iter().position(|i| same_value_zero(i, &v));
        match name {
            "add" => {
                if pos.is_none() {
                    items.push(v);
                }
                Ok(this)
            }
            "has" => Ok(Value::Bool(pos.is_some())),
            "delete" => Ok(Value::Bool(pos.map(|p| items.remove(p)).is_some())),
            "clear" => {
                items.clear();
                Ok(Value::Undefined)
            }
            "forEach" => {
                let snapshot = items.clone();
                for item in snapshot {
                    self.tick()?;
                    self.call(&v, Value::Undefined, vec![item.clone(), item, this.clone()])?;
                }
                Ok(Value::Undefined)
            }
            "keys" | "values" => {
                let snapshot = items.clone();
                Ok(self.array(snapshot))
            }
            "entries" => {
                let snapshot = items.clone();
                let mut out = Vec::with_capacity(snapshot.len());
                for item in snapshot {
                    out.push(self.array(vec![item.clone(), item]));
                }
                Ok(self.array(out))
            }
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    // --- JSON ---

    fn json_stringify(&mut self, v: &Value, indent: &str, current: &str, stack: &mut Vec<ObjId>) -> R<Option<String>> {
        let id = match v {
            Value::Undefined => return Ok(None),
            Value::Null => return Ok(Some("null".into())),
            Value::Bool(b) => return Ok(Some(b.to_string())),
            Value::Num(n) => return Ok(Some(if n.is_finite() { number_to_string(*n) } else { "null".into() })),
            Value::Str(s) => return Ok(Some(quote_json(s))),
            Value::Obj(id) => *id,
        };
        if self.heap[id].kind.is_callable() {
            return Ok(None);
        }
        if let ObjKind::Date(t) = self.heap[id].kind {
            return Ok(Some(quote_json(&iso_string(t)?)));
        }
        if stack.contains(&id) {
            return Err(type_err("Converting circular structure to JSON"));
        }
        if stack.len() >= MAX_CALL_DEPTH {
            return Err(ScriptError::StackOverflow);
        }
        stack.push(id);
        let inner = format!("{current}{indent}");
        let (open, close, parts) = match &self.heap[id].kind {
            ObjKind::Array(_) | ObjKind::NodeList(_) => {
                let items = self.iterate(v)?;
                let mut parts = Vec::with_capacity(items.len());
                for it in &items {
                    parts.push(self.json_stringify(it, indent, &inner, stack)?.unwrap_or_else(|| "null".into()));
                }
                ('[', ']', parts)
            }
            ObjKind::Plain | ObjKind::Error | ObjKind::Dataset(_) | ObjKind::Storage(_) => {
                let mut parts = Vec::new();
                for k in self.own_keys(v) {
                    let val = self.get_prop(v, &k)?;
                    if let Some(s) = self.json_stringify(&val, indent, &inner, stack)? {
                        let sep = if indent.is_empty() { ":" } else { ": " };
                        parts.push(format!("{}{sep}{s}", quote_json(&k)));
                    }
                }
                ('{', '}', parts)
            }
            _ => ('{', '}', Vec::new()),
        };
        stack.pop();
        if parts.is_empty() {
            return Ok(Some(format!("{open}{close}")));
        }
        check_string_len(parts.iter().map(|p| p.len() + inner.len() + 2).sum())?;
        Ok(Some(if indent.is_empty() {
            format!("{open}{}{close}", parts.join(","))
        } else {
            format!("{open}\n{inner}{}\n{current}{close}", parts.join(&format!(",\n{inner}")))
        }))
    }

    fn from_json(&mut self, v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::str(s.as_str()),
            serde_json::Value::Array(items) => {
                let vals = items.iter().map(|i| self.from_json(i)).collect();
                self.array(vals)
            }
            serde_json::Value::Object(map) => {
                let id = self.alloc(ObjKind::Plain);
                for (k, val) in map {
                    let val = self.from_json(val);
                    self.heap[id].props.set(k, val);
                }
                Value::Obj(id)
            }
        }
    }

    /// Console rendering: strings bare, structures as JSON.
    fn inspect(&mut self, v: &Value) -> String {
        match v {
            Value::Str(s) => s.clone(),
            Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Plain | ObjKind::Array(_)) => {
                let mut stack = Vec::new();
                match self.json_stringify(v, "", "", &mut stack) {
                    Ok(Some(s)) => s,
                    _ => self.display(v),
                }
            }
            other => self.to_string(other).unwrap_or_else(|_| self.display(other)),
        }
    }
}

pub(super) fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) if x.is_nan() && y.is_nan() => true,
        _ => a == b,
    }
}

fn char_find(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(hay.len()));
    }
    if needle.len() > hay.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|i| hay[*i..*i + needle.len()] == needle[..])
}

fn compile_regex(pattern: &str, flags: &str) -> R<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| {
            let detail = e.to_string();
            let last = detail.lines().last().unwrap_or_default().trim().to_string();
            ScriptError::Syntax(format!("Invalid regular expression: /{pattern}/{flags}: {last}"))
        })
}

/// `$&`, `` $` ``, `$'`, `$1`..`$99` and `$$` in a replacement template.
fn expand_replacement(template: &str, matched: &str, groups: &[Option<&str>], before: &str, after: &str) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' || i + 1 >= chars.len() {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        match chars[i + 1] {
            '$' => {
                out.push('$');
                i += 2;
            }
            '&' => {
                out.push_str(matched);
                i += 2;
            }
            '`' => {
                out.push_str(before);
                i += 2;
            }
            '\'' => {
                out.push_str(after);
                i += 2;
            }
            d if d.is_ascii_digit() => {
                let mut num = d.to_digit(10).unwrap_or(0) as usize;
                let mut used = 2;
                if let Some(d2) = chars.get(i + 2).and_then(|c| c.to_digit(10)) {
                    let two = num * 10 + d2 as usize;
                    if two >= 1 && two <= groups.len() {
                        num = two;
                        used = 3;
                    }
                }
                if num >= 1 && num <= groups.len() {
                    out.push_str(groups[num - 1].unwrap_or_default());
                    i += used;
                } else {
                    out.push('$');
                    i += 1;
                }
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }
    out
}

fn quote_json(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

fn to_fixed(n: f64, digits: usize) -> String {
    if !n.is_finite() || n.abs() >= 1e21 {
        return number_to_string(n);
    }
    let scale = 10f64.powi(digits as i32);
    let scaled = n.abs() * scale;
    // Ties round away from zero, unlike Rust's formatter.
    let value = if scaled < 9.007_199_254_740_992e15 && scaled - scaled.floor() == 0.5 {
        (scaled.floor() + 1.0) / scale * n.signum()
    } else {
        n
    };
    let s = format!("{value:.digits$}");
    if s.starts_with('-') && s.trim_start_matches(['-', '0', '.']).is_empty() {
        return s[1..].to_string();
    }
    s
}

fn to_precision(n: f64, p: usize) -> String {
    if !n.is_finite() {
        return number_to_string(n);
    }
    if n == 0.0 {
        return to_fixed(0.0, p - 1);
    }
    let e = n.abs().log10().floor() as i32;
    if e < -6 || e >= p as i32 {
        let s = format!("{:.*e}", p - 1, n);
        return match s.split_once('e') {
            Some((m, exp)) if !exp.starts_with('-') => format!("{m}e+{exp}"),
            _ => s,
        };
    }
    let decimals = (p as i32 - 1 - e).max(0) as usize;
    to_fixed(n, decimals)
}

fn int_to_radix(n: f64, radix: u32) -> String {
    let negative = n < 0.0;
    let mut v = n.abs() as u128;
    if v == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while v > 0 {
        digits.push(std::char::from_digit((v % radix as u128) as u32, radix).unwrap_or('0'));
        v /= radix as u128;
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

/// en-US grouping: `1234.5` -> `1,234.5`.
fn locale_number(n: f64, min_frac: usize, max_frac: usize, prefix: &str) -> String {
    if !n.is_finite() {
        return number_to_string(n);
    }
    let fixed = to_fixed(n.abs(), max_frac);
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (fixed.clone(), String::new()),
    };
    let mut frac = frac_part.trim_end_matches('0').to_string();
    while frac.len() < min_frac {
        frac.push('0');
    }
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if n < 0.0 { "-" } else { "" };
    if frac.is_empty() {
        format!("{sign}{prefix}{grouped}")
    } else {
        format!("{sign}{prefix}{grouped}.{frac}")
    }
}

fn percent_encode(s: &str, keep_reserved: bool) -> String {
    const UNRESERVED: &str = "-_.!~*'()";
    const RESERVED: &str = ";,/?:@&=+$#";
    let mut out = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || UNRESERVED.contains(c) || (keep_reserved && RESERVED.contains(c)) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        }
    }
    out
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// --- Dates (UTC) ---

const MS_PER_DAY: f64 = 86_400_000.0;
const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { yoe + era * 400 + 1 } else { yoe + era * 400 }, m, d)
}

struct Parts {
    year: i64,
    month: i64,
    day: i64,
    weekday: usize,
    hour: i64,
    minute: i64,
    second: i64,
    ms: i64,
}

fn split_time(t: f64) -> Parts {
    let days = (t / MS_PER_DAY).floor();
    let rem = (t - days * MS_PER_DAY) as i64;
    let (year, month, day) = civil_from_days(days as i64);
    Parts {
        year,
        month,
        day,
        weekday: ((days as i64 + 4).rem_euclid(7)) as usize,
        hour: rem / 3_600_000,
        minute: rem / 60_000 % 60,
        second: rem / 1000 % 60,
        ms: rem % 1000,
    }
}

/// `new Date(y, m, d, h, mi, s, ms)` in UTC.
fn make_time(p: [f64; 7]) -> f64 {
    if p.iter().any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    let year = p[0] as i64 + (p[1] as i64).div_euclid(12);
    let month = (p[1] as i64).rem_euclid(12) + 1;
    let days = days_from_civil(year, month, 1) as f64 + p[2] - 1.0;
    days * MS_PER_DAY + p[3] * 3_600_000.0 + p[4] * 60_000.0 + p[5] * 1000.0 + p[6]
}

/// ISO-8601 subset: `YYYY-MM-DD[THH:MM[:SS[.mmm]]][Z]`.
fn parse_date(s: &str) -> f64 {
    let s = s.trim().trim_end_matches('Z');
    let (date, time) = match s.split_once(['T', ' ']) {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    let mut dp = date.split('-').map(|p| p.parse::<f64>());
    let (Some(Ok(y)), m, d) = (dp.next(), dp.next(), dp.next()) else { return f64::NAN };
    let m = match m {
        Some(Ok(m)) => m,
        None => 1.0,
        Some(Err(_)) => return f64::NAN,
    };
    let d = match d {
        Some(Ok(d)) => d,
        None => 1.0,
        Some(Err(_)) => return f64::NAN,
    };
    let mut clock = [0f64; 4];
    if let Some(t) = time {
        let (hms, ms) = t.split_once('.').unwrap_or((t, "0"));
        for (i, part) in hms.split(':').take(3).enumerate() {
            match part.parse::<f64>() {
                Ok(v) => clock[i] = v,
                Err(_) => return f64::NAN,
            }
        }
        clock[3] = ms.parse::<f64>().unwrap_or(0.0);
    }
    make_time([y, m - 1.0, d, clock[0], clock[1], clock[2], clock[3]])
}

pub(super) fn iso_string(t: f64) -> R<String> {
    if !t.is_finite() {
        return Err(ScriptError::Range("Invalid time value".into()));
    }
    let p = split_time(t);
    Ok(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        p.year, p.month, p.day, p.hour, p.minute, p.second, p.ms
    ))
}

pub(super) fn date_string(t: f64) -> String {
    if !t.is_finite() {
        return "Invalid Date".into();
    }
    let p = split_time(t);
    format!(
        "{} {} {:02} {:04} {:02}:{:02}:{:02} GMT+0000 (Coordinated Universal Time)",
        DAY_NAMES[p.weekday],
        MONTH_NAMES[(p.month - 1) as usize],
        p.day,
        p.year,
        p.hour,
        p.minute,
        p.second
    )
}

fn date_method(t: f64, name: &str) -> R<Value> {
    if !t.is_finite() && !matches!(name, "getTime" | "valueOf" | "toString" | "toDateString") {
        return Ok(match name {
            "toISOString" | "toJSON" => return Err(ScriptError::Range("Invalid time value".into())),
            n if n.starts_with("get") => Value::Num(f64::NAN),
            _ => Value::str("Invalid Date"),
        });
    }
    let p = split_time(t);
    let hour12 = if p.hour % 12 == 0 { 12 } else { p.hour % 12 };
    let meridiem = if p.hour < 12 { "AM" } else { "PM" };
    Ok(match name {
        "getTime" | "valueOf" => Value::Num(t),
        "getFullYear" => Value::Num(p.year as f64),
        "getMonth" => Value::Num((p.month - 1) as f64),
        "getDate" => Value::Num(p.day as f64),
        "getDay" => Value::Num(p.weekday as f64),
        "getHours" => Value::Num(p.hour as f64),
        "getMinutes" => Value::Num(p.minute as f64),
        "getSeconds" => Value::Num(p.second as f64),
        "getMilliseconds" => Value::Num(p.ms as f64),
        "getTimezoneOffset" => Value::Num(0.0),
        "toISOString" | "toJSON" => Value::Str(iso_string(t)?),
        "toLocaleDateString" => Value::Str(format!("{}/{}/{}", p.month, p.day, p.year)),
        "toLocaleTimeString" => Value::Str(format!("{hour12}:{:02}:{:02} {meridiem}", p.minute, p.second)),
        "toLocaleString" => Value::Str(format!(
            "{}/{}/{}, {hour12}:{:02}:{:02} {meridiem}",
            p.month, p.day, p.year, p.minute, p.second
        )),
        "toDateString" => {
            if !t.is_finite() {
                return Ok(Value::str("Invalid Date"));
            }
            Value::Str(format!("{} {} {:02} {:04}", DAY_NAMES[p.weekday], MONTH_NAMES[(p.month - 1) as usize], p.day, p.year))
        }
        _ => Value::Str(date_string(t)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_templates() {
        assert_eq!(expand_replacement("[$&]", "ab", &[], "", ""), "[ab]");
        assert_eq!(expand_replacement("$2-$1", "a-b", &[Some("a"), Some("b")], "", ""), "b-a");
        assert_eq!(expand_replacement("$$", "x", &[], "", ""), "$");
    }

    #[test]
    fn fixed_and_locale_formatting() {
        assert_eq!(to_fixed(1.5, 0), "2");
        assert_eq!(to_fixed(2.345, 1), "2.3");
        assert_eq!(to_fixed(10.0, 2), "10.00");
        assert_eq!(locale_number(1234567.891, 0, 3, ""), "1,234,567.891");
        assert_eq!(locale_number(1234.5, 2, 2, "$"), "$1,234.50");
        assert_eq!(to_precision(123.456, 4), "123.5");
        assert_eq!(int_to_radix(255.0, 16), "ff");
    }

    #[test]
    fn calendar_round_trip() {
        let t = make_time([2024.0, 1.0, 29.0, 13.0, 5.0, 9.0, 7.0]);
        assert_eq!(iso_string(t).unwrap(), "2024-02-29T13:05:09.007Z");
        assert_eq!(parse_date("2024-02-29T13:05:09.007Z"), t);
        assert_eq!(date_string(0.0), "Thu Jan 01 1970 00:00:00 GMT+0000 (Coordinated Universal Time)");
    }

    #[test]
    fn uri_coding() {
        assert_eq!(percent_encode("a b&c", false), "a%20b%26c");
        assert_eq!(percent_decode("a%20b").as_deref(), Some("a b"));
    }
}
