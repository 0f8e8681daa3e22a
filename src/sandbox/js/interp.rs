//! Tree-walking evaluator: scopes, control flow, property access, calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use super::ast::*;
use super::parser;
use super::promise::Job;
use super::value::*;
use super::ScriptError;
use crate::sandbox::dom::{Dom, NodeId};

pub(super) const MAX_STEPS: u64 = 500_000;
pub(super) const MAX_CALL_DEPTH: usize = 200;
/// Longest array a script may build, matching the `Array(n)` ceiling.
pub(super) const MAX_ARRAY_LEN: usize = 10_000_000;
/// Longest string, in bytes, a script may build.
pub(super) const MAX_STRING_LEN: usize = 1 << 24;
/// Arena size past which DOM-building scripts are stopped.
pub(super) const MAX_DOM_NODES: usize = 250_000;
/// Microtask jobs per checkpoint.
pub(super) const MAX_MICROTASKS: usize = 100_000;

/// Class-body bindings; `%` keeps them out of reach of script identifiers.
const HOME: &str = "%home";
const PARENT: &str = "%parent";
const FIELDS: &str = "%fields";

pub(super) type R<T> = Result<T, ScriptError>;

pub(super) fn type_err(msg: impl Into<String>) -> ScriptError {
    ScriptError::Type(msg.into())
}

pub(super) fn check_array_len(len: usize) -> R<()> {
    if len > MAX_ARRAY_LEN {
        return Err(ScriptError::Range("Invalid array length".into()));
    }
    Ok(())
}

pub(super) fn check_string_len(len: usize) -> R<()> {
    if len > MAX_STRING_LEN {
        return Err(ScriptError::Range("Invalid string length".into()));
    }
    Ok(())
}

pub(super) fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

#[derive(Debug)]
pub(super) struct Binding {
    pub value: Value,
    pub mutable: bool,
    pub initialized: bool,
}

#[derive(Debug, Default)]
pub(super) struct Scope {
    pub vars: HashMap<String, Binding>,
    pub parent: Option<ScopeId>,
    /// `None` for arrow functions and blocks: `this` comes from outside.
    pub this: Option<Value>,
}

pub(super) enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum BindMode {
    Var,
    Let,
    Const,
    Assign,
}

#[derive(Debug, Clone)]
pub(super) struct Listener {
    pub target: ObjId,
    pub event_type: String,
    pub callback: Value,
    pub capture: bool,
    pub once: bool,
}

#[derive(Debug, Clone)]
pub(super) struct Timer {
    pub id: u32,
    pub due: f64,
    pub seq: u64,
    pub callback: Value,
    pub args: Vec<Value>,
    pub interval: Option<f64>,
    pub animation_frame: bool,
}

/// Live state of form controls, separate from their attributes.
#[derive(Debug, Default, Clone)]
pub(super) struct FormState {
    pub value: Option<String>,
    pub checked: Option<bool>,
}

pub(super) struct Interp {
    pub heap: Vec<Obj>,
    pub scopes: Vec<Scope>,
    pub scope: ScopeId,
    pub dom: Dom,
    pub node_objs: HashMap<NodeId, ObjId>,
    pub form_state: HashMap<NodeId, FormState>,
    pub listeners: Vec<Listener>,
    pub timers: Vec<Timer>,
    pub next_timer_id: u32,
    pub timer_seq: u64,
    pub clock: f64,
    pub steps: u64,
    pub depth: usize,
    pub builtins_scope: ScopeId,
    pub global_scope: ScopeId,
    pub window: ObjId,
    pub lexical_globals: HashSet<String>,
    pub console: Vec<String>,
    pub active_element: Option<NodeId>,
    pub epoch_ms: f64,
    /// Arrays/objects currently being stringified (cycle guard).
    pub joining: Vec<ObjId>,
    pub microtasks: VecDeque<Job>,
    /// Promises rejected with no handler attached yet.
    pub unhandled: Vec<ObjId>,
    pub next_token: u64,
}

impl Interp {
    pub fn new(dom: Dom) -> Self {
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        let mut it = Self {
            heap: Vec::new(),
            scopes: Vec::new(),
            scope: 0,
            dom,
            node_objs: HashMap::new(),
            form_state: HashMap::new(),
            listeners: Vec::new(),
            timers: Vec::new(),
            next_timer_id: 1,
            timer_seq: 0,
            clock: 0.0,
            steps: 0,
            depth: 0,
            builtins_scope: 0,
            global_scope: 0,
            window: 0,
            lexical_globals: HashSet::new(),
            console: Vec::new(),
            active_element: None,
            epoch_ms,
            joining: Vec::new(),
            microtasks: VecDeque::new(),
            unhandled: Vec::new(),
            next_token: 1,
        };
        it.window = it.alloc(ObjKind::Window);
        it.builtins_scope = it.new_scope(None, None);
        it.global_scope = it.new_scope(Some(it.builtins_scope), Some(Value::Obj(it.window)));
        it.scope = it.global_scope;
        it.install_builtins();
        it.install_host();
        it
    }

    // --- Entry points ---

    pub fn run_script(&mut self, source: &str) -> R<()> {
        self.steps = 0;
        self.depth = 0;
        self.run_source(source)
    }

    /// Run source in the global scope without touching the budgets.
    pub fn run_source(&mut self, source: &str) -> R<()> {
        let program = parser::parse_program(source)?;
        let global = self.global_scope;
        self.hoist(global, &program, true)?;
        let saved = self.scope;
        self.scope = global;
        let res = self.exec_stmts(&program);
        self.scope = saved;
        match res {
            Ok(_) | Err(ScriptError::Suspended) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn eval_predicate(&mut self, code: &str) -> R<Value> {
        let body = parser::parse_program(&format!("return {code}"))?;
        self.steps = 0;
        self.depth = 0;
        let scope = self.new_scope(Some(self.builtins_scope), Some(Value::Undefined));
        let doc = self.document_value();
        self.declare(scope, "document", doc, true);
        self.declare(scope, "window", Value::Obj(self.window), true);
        self.hoist(scope, &body, true)?;
        let saved = self.scope;
        self.scope = scope;
        let res = self.exec_stmts(&body);
        self.scope = saved;
        match res? {
            Flow::Return(v) => Ok(v),
            _ => Ok(Value::Undefined),
        }
    }

    // --- Heap ---

    pub fn alloc(&mut self, kind: ObjKind) -> ObjId {
        self.heap.push(Obj::new(kind));
        self.heap.len() - 1
    }

    pub fn array(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(ObjKind::Array(items)))
    }

    pub fn plain(&mut self, entries: Vec<(&str, Value)>) -> Value {
        let id = self.alloc(ObjKind::Plain);
        for (k, v) in entries {
            self.heap[id].props.set(k, v);
        }
        Value::Obj(id)
    }

    pub fn error_value(&mut self, name: &str, message: &str) -> Value {
        let id = self.alloc(ObjKind::Error);
        let props = &mut self.heap[id].props;
        props.set("message", Value::str(message));
        props.set("name", Value::str(name));
        let stack = if message.is_empty() { name.to_string() } else { format!("{name}: {message}") };
        props.set("stack", Value::Str(stack));
        Value::Obj(id)
    }

    pub fn native(&mut self, name: &'static str) -> Value {
        Value::Obj(self.alloc(ObjKind::Native(name)))
    }

    pub fn is_callable(&self, v: &Value) -> bool {
        match v {
            Value::Obj(id) => self.heap[*id].kind.is_callable(),
            _ => false,
        }
    }

    pub fn type_of(&self, v: &Value) -> &'static str {
        match v {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Obj(_) if self.is_callable(v) => "function",
            Value::Obj(_) => "object",
        }
    }

    pub fn tick(&mut self) -> R<()> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(ScriptError::StepLimit);
        }
        if self.dom.len() > MAX_DOM_NODES {
            return Err(ScriptError::Range("Document node limit exceeded".into()));
        }
        Ok(())
    }

    // --- Scopes ---

    pub fn new_scope(&mut self, parent: Option<ScopeId>, this: Option<Value>) -> ScopeId {
        self.scopes.push(Scope { vars: HashMap::new(), parent, this });
        self.scopes.len() - 1
    }

    pub fn declare(&mut self, scope: ScopeId, name: &str, value: Value, mutable: bool) {
        self.scopes[scope]
            .vars
            .insert(name.to_string(), Binding { value, mutable, initialized: true });
    }

    fn declare_uninitialized(&mut self, scope: ScopeId, name: &str, mutable: bool) {
        self.scopes[scope]
            .vars
            .insert(name.to_string(), Binding { value: Value::Undefined, mutable, initialized: false });
    }

    /// Hoist declarations of `stmts` into `scope`. Function-level hoisting
    /// also creates `var` bindings.
    pub fn hoist(&mut self, scope: ScopeId, stmts: &[Stmt], function_level: bool) -> R<()> {
        if function_level {
            let mut names = Vec::new();
            var_names(stmts, &mut names);
            for n in names {
                if !self.scopes[scope].vars.contains_key(&n) {
                    self.declare(scope, &n, Value::Undefined, true);
                }
                if scope == self.global_scope {
                    self.lexical_globals.remove(&n);
                }
            }
        }
        for s in stmts {
            match s {
                Stmt::Function(def) => {
                    let Some(name) = def.name.clone() else { continue };
                    let f = self.make_closure(def.clone(), scope);
                    self.declare(scope, &name, f, true);
                    if scope == self.global_scope {
                        self.lexical_globals.remove(&name);
                    }
                }
                Stmt::Decl(kind @ (DeclKind::Let | DeclKind::Const), decls) => {
                    for (p, _) in decls {
                        let mut names = Vec::new();
                        p.names(&mut names);
                        for n in names {
                            self.declare_uninitialized(scope, &n, *kind == DeclKind::Let);
                            if scope == self.global_scope {
                                self.lexical_globals.insert(n);
                            }
                        }
                    }
                }
                Stmt::Class(class) => {
                    let Some(name) = class.name.clone() else { continue };
                    self.declare_uninitialized(scope, &name, true);
                    if scope == self.global_scope {
                        self.lexical_globals.insert(name);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn find_binding(&self, name: &str) -> (Option<ScopeId>, bool) {
        let mut cur = Some(self.scope);
        let mut via_global = false;
        while let Some(s) = cur {
            if s == self.global_scope {
                via_global = true;
            }
            if self.scopes[s].vars.contains_key(name) {
                return (Some(s), via_global);
            }
            cur = self.scopes[s].parent;
        }
        (None, via_global)
    }

    pub fn lookup(&self, name: &str) -> R<Value> {
        match self.lookup_opt(name)? {
            Some(v) => Ok(v),
            None => Err(ScriptError::Reference(format!("{name} is not defined"))),
        }
    }

    /// `Ok(None)` for an undeclared name (what `typeof` needs).
    pub fn lookup_opt(&self, name: &str) -> R<Option<Value>> {
        match self.find_binding(name) {
            (Some(s), _) => {
                let b = &self.scopes[s].vars[name];
                if !b.initialized {
                    return Err(ScriptError::Reference(format!("Cannot access '{name}' before initialization")));
                }
                Ok(Some(b.value.clone()))
            }
            (None, true) => Ok(self.heap[self.window].props.get(name).cloned()),
            (None, false) => Ok(None),
        }
    }

    pub fn assign(&mut self, name: &str, value: Value) -> R<()> {
        match self.find_binding(name).0 {
            Some(s) => {
                let b = self.scopes[s].vars.get_mut(name).ok_or_else(|| type_err("lost binding"))?;
                if !b.initialized {
                    return Err(ScriptError::Reference(format!("Cannot access '{name}' before initialization")));
                }
                if !b.mutable {
                    return Err(type_err("Assignment to constant variable."));
                }
                b.value = value;
            }
            None => {
                let window = self.window;
                self.heap[window].props.set(name, value);
            }
        }
        Ok(())
    }

    pub fn this_value(&self) -> Value {
        let mut cur = Some(self.scope);
        while let Some(s) = cur {
            if let Some(t) = &self.scopes[s].this {
                return t.clone();
            }
            cur = self.scopes[s].parent;
        }
        Value::Undefined
    }

    fn bind_name(&mut self, name: &str, value: Value, mode: BindMode) -> R<()> {
        match mode {
            BindMode::Let | BindMode::Const => {
                let scope = self.scope;
                self.declare(scope, name, value, mode == BindMode::Let);
                Ok(())
            }
            BindMode::Var => match self.find_binding(name).0 {
                Some(s) => {
                    if let Some(b) = self.scopes[s].vars.get_mut(name) {
                        b.value = value;
                        b.initialized = true;
                    }
                    Ok(())
                }
                None => {
                    let scope = self.scope;
                    self.declare(scope, name, value, true);
                    Ok(())
                }
            },
            BindMode::Assign => self.assign(name, value),
        }
    }

    pub fn bind_pattern(&mut self, pattern: &Pattern, value: Value, mode: BindMode) -> R<()> {
        match pattern {
            Pattern::Ident(name) => self.bind_name(name, value, mode),
            Pattern::Object(props) => {
                if value.is_nullish() {
                    return Err(type_err(format!("Cannot destructure '{}' as it is {}.", self.display(&value), value.kind_label())));
                }
                let mut used = Vec::new();
                for p in props {
                    if p.target.rest {
                        let rest = self.alloc(ObjKind::Plain);
                        for key in self.own_keys(&value) {
                            if !used.contains(&key) {
                                let v = self.get_prop(&value, &key)?;
                                self.heap[rest].props.set(&key, v);
                            }
                        }
                        self.bind_pattern(&p.target.pattern, Value::Obj(rest), mode)?;
                        continue;
                    }
                    let mut v = self.get_prop(&value, &p.key)?;
                    used.push(p.key.clone());
                    if matches!(v, Value::Undefined) {
                        if let Some(d) = &p.target.default {
                            v = self.eval(d)?;
                        }
                    }
                    self.bind_pattern(&p.target.pattern, v, mode)?;
                }
                Ok(())
            }
            Pattern::Array(items) => {
                let values = self.iterate(&value)?;
                for (i, item) in items.iter().enumerate() {
                    let Some(item) = item else { continue };
                    if item.rest {
                        let rest = values.get(i..).map(|s| s.to_vec()).unwrap_or_default();
                        let arr = self.array(rest);
                        self.bind_pattern(&item.pattern, arr, mode)?;
                        break;
                    }
                    let mut v = values.get(i).cloned().unwrap_or(Value::Undefined);
                    if matches!(v, Value::Undefined) {
                        if let Some(d) = &item.default {
                            v = self.eval(d)?;
                        }
                    }
                    self.bind_pattern(&item.pattern, v, mode)?;
                }
                Ok(())
            }
        }
    }

    // --- Statements ---

    pub fn exec_stmts(&mut self, stmts: &[Stmt]) -> R<Flow> {
        for s in stmts {
            match self.exec_stmt(s)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> R<Flow> {
        if !has_lexical(stmts) {
            return self.exec_stmts(stmts);
        }
        let saved = self.scope;
        let scope = self.new_scope(Some(saved), None);
        self.hoist(scope, stmts, false)?;
        self.scope = scope;
        let res = self.exec_stmts(stmts);
        self.scope = saved;
        res
    }

    pub(super) fn exec_stmt(&mut self, stmt: &Stmt) -> R<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Decl(kind, decls) => {
                for (pattern, init) in decls {
                    let mode = match kind {
                        DeclKind::Var => BindMode::Var,
                        DeclKind::Let => BindMode::Let,
                        DeclKind::Const => BindMode::Const,
                    };
                    let value = match init {
                        Some(e) => self.eval(e)?,
                        None if *kind == DeclKind::Var => continue,
                        None => Value::Undefined,
                    };
                    self.bind_pattern(pattern, value, mode)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::Class(class) => {
                let ctor = self.eval_class(class)?;
                if let Some(name) = &class.name {
                    self.bind_name(name, ctor, BindMode::Let)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Expr(e) => {
                self.eval(e)?;
                Ok(Flow::Normal)
            }
            Stmt::If { test, consequent, alternate } => {
                if self.eval(test)?.truthy() {
                    self.exec_stmt(consequent)
                } else if let Some(alt) = alternate {
                    self.exec_stmt(alt)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::For { init, test, update, body } => {
                let saved = self.scope;
                let res = self.exec_for(init.as_ref(), test.as_ref(), update.as_ref(), body);
                self.scope = saved;
                res
            }
            Stmt::ForOf { kind, target, iterable, body } => {
                let subject = self.eval(iterable)?;
                let items = self.iterate(&subject)?;
                self.exec_for_each(*kind, target, items, body)
            }
            Stmt::ForIn { kind, target, object, body } => {
                let subject = self.eval(object)?;
                let keys = if subject.is_nullish() { Vec::new() } else { self.enumerable_keys(&subject) };
                let items = keys.into_iter().map(Value::Str).collect();
                self.exec_for_each(*kind, target, items, body)
            }
            Stmt::While { test, body } => {
                while self.eval(test)?.truthy() {
                    match self.exec_stmt(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Continue | Flow::Normal => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, test } => {
                loop {
                    match self.exec_stmt(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Continue | Flow::Normal => {}
                    }
                    if !self.eval(test)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Switch { discriminant, cases } => {
                let saved = self.scope;
                let res = self.exec_switch(discriminant, cases);
                self.scope = saved;
                res
            }
            Stmt::Try { block, param, handler, finalizer } => {
                let mut res = self.exec_block(block);
                let pending = match (&res, handler) {
                    (Err(err), Some(handler)) if !matches!(err, ScriptError::StepLimit | ScriptError::Suspended) => {
                        Some((err.clone(), handler))
                    }
                    _ => None,
                };
                if let Some((err, handler)) = pending {
                    let caught = self.error_to_value(err)?;
                    let saved = self.scope;
                    let scope = self.new_scope(Some(saved), None);
                    self.scope = scope;
                    res = match param {
                        Some(p) => match self.bind_pattern(p, caught, BindMode::Let) {
                            Ok(()) => self.exec_block(handler),
                            Err(e) => Err(e),
                        },
                        None => self.exec_block(handler),
                    };
                    self.scope = saved;
                }
                if let Some(fin) = finalizer {
                    match self.exec_block(fin)? {
                        Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                res
            }
            Stmt::Return(e) => {
                let v = match e {
                    Some(e) => self.eval(e)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(v))
            }
            Stmt::Throw(e) => {
                let v = self.eval(e)?;
                Err(self.throw_value(v))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Block(stmts) => self.exec_block(stmts),
        }
    }

    fn exec_for(&mut self, init: Option<&ForInit>, test: Option<&Expr>, update: Option<&Expr>, body: &Stmt) -> R<Flow> {
        let outer = self.scope;
        let scope = self.new_scope(Some(outer), None);
        self.scope = scope;
        let mut per_iteration = Vec::new();
        match init {
            Some(ForInit::Decl(kind, decls)) => {
                if *kind != DeclKind::Var {
                    for (p, _) in decls {
                        p.names(&mut per_iteration);
                    }
                }
                let stmt = Stmt::Decl(*kind, decls.clone());
                self.exec_stmt(&stmt)?;
            }
            Some(ForInit::Expr(e)) => {
                self.eval(e)?;
            }
            None => {}
        }
        self.copy_iteration_scope(outer, &per_iteration);
        loop {
            if let Some(t) = test {
                if !self.eval(t)?.truthy() {
                    break;
                }
            }
            match self.exec_stmt(body)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Continue | Flow::Normal => {}
            }
            self.copy_iteration_scope(outer, &per_iteration);
            if let Some(u) = update {
                self.eval(u)?;
            }
        }
        Ok(Flow::Normal)
    }

    /// Fresh bindings per iteration so closures capture that iteration's `let`.
    fn copy_iteration_scope(&mut self, outer: ScopeId, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let prev = self.scope;
        let next = self.new_scope(Some(outer), None);
        for n in names {
            if let Some(b) = self.scopes[prev].vars.get(n) {
                let copy = Binding { value: b.value.clone(), mutable: b.mutable, initialized: b.initialized };
                self.scopes[next].vars.insert(n.clone(), copy);
            }
        }
        self.scope = next;
    }

    fn exec_for_each(&mut self, kind: Option<DeclKind>, target: &Pattern, items: Vec<Value>, body: &Stmt) -> R<Flow> {
        let outer = self.scope;
        let mode = match kind {
            None => BindMode::Assign,
            Some(DeclKind::Var) => BindMode::Var,
            Some(DeclKind::Let) => BindMode::Let,
            Some(DeclKind::Const) => BindMode::Const,
        };
        for item in items {
            self.tick()?;
            if matches!(mode, BindMode::Let | BindMode::Const) {
                self.scope = self.new_scope(Some(outer), None);
            }
            let res = self.bind_pattern(target, item, mode).and_then(|_| self.exec_stmt(body));
            self.scope = outer;
            match res? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Continue | Flow::Normal => {}
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_switch(&mut self, discriminant: &Expr, cases: &[(Option<Expr>, Vec<Stmt>)]) -> R<Flow> {
        let value = self.eval(discriminant)?;
        let outer = self.scope;
        let scope = self.new_scope(Some(outer), None);
        for (_, body) in cases {
            self.hoist(scope, body, false)?;
        }
        self.scope = scope;

        let mut start = None;
        for (i, (test, _)) in cases.iter().enumerate() {
            if let Some(t) = test {
                if self.eval(t)? == value {
                    start = Some(i);
                    break;
                }
            }
        }
        let start = start.or_else(|| cases.iter().position(|(t, _)| t.is_none()));
        let Some(start) = start else { return Ok(Flow::Normal) };
        for (_, body) in &cases[start..] {
            match self.exec_stmts(body)? {
                Flow::Normal => {}
                Flow::Break => return Ok(Flow::Normal),
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    // --- Errors ---

    /// Turn a runtime failure into the value a `catch` clause sees.
    pub fn error_to_value(&mut self, err: ScriptError) -> R<Value> {
        Ok(match err {
            ScriptError::StepLimit | ScriptError::Suspended => return Err(err),
            ScriptError::Thrown { value, .. } => value,
            ScriptError::Syntax(m) => self.error_value("SyntaxError", &m),
            ScriptError::Type(m) => self.error_value("TypeError", &m),
            ScriptError::Reference(m) => self.error_value("ReferenceError", &m),
            ScriptError::Range(m) => self.error_value("RangeError", &m),
            ScriptError::StackOverflow => self.error_value("RangeError", "Maximum call stack size exceeded"),
            ScriptError::Dom { name, message } => self.error_value(name, &message),
        })
    }

    pub fn throw_value(&mut self, value: Value) -> ScriptError {
        let message = match &value {
            Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Error) => {
                let m = self.heap[*id].props.get("message").cloned().unwrap_or(Value::Undefined);
                Some(self.display(&m))
            }
            _ => None,
        };
        ScriptError::Thrown { value, message }
    }

    // --- Expressions ---

    pub fn eval(&mut self, e: &Expr) -> R<Value> {
        match e {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Template(parts) => {
                let mut out = String::new();
                for p in parts {
                    match p {
                        TemplatePart::Text(t) => out.push_str(t),
                        TemplatePart::Expr(e) => {
                            let v = self.eval(e)?;
                            out.push_str(&self.to_string(&v)?);
                        }
                    }
                    check_string_len(out.len())?;
                }
                Ok(Value::Str(out))
            }
            Expr::Regex { pattern, flags } => self.new_regex(pattern, flags),
            Expr::Ident(name) => self.lookup(name),
            Expr::This => Ok(self.this_value()),
            Expr::Array(items) => {
                let values = self.eval_items(items)?;
                Ok(self.array(values))
            }
            Expr::Object(props) => self.eval_object(props),
            Expr::Function(def) => Ok(self.make_closure(def.clone(), self.scope)),
            Expr::Class(class) => self.eval_class(class),
            Expr::Member { .. } | Expr::Call { .. } => Ok(self.eval_chain(e)?.unwrap_or(Value::Undefined)),
            Expr::SuperMember(key) => {
                let key = self.member_key(key)?;
                let this = self.this_value();
                self.super_get(&key, &this)
            }
            Expr::SuperCall(args) => {
                let argv = self.eval_items(args)?;
                self.super_call(argv)?;
                Ok(Value::Undefined)
            }
            Expr::Await(operand) => {
                let v = self.eval(operand)?;
                self.await_now(v)
            }
            Expr::New { callee, args } => {
                let f = self.eval(callee)?;
                let argv = self.eval_items(args)?;
                self.construct(&f, argv, callee)
            }
            Expr::Unary { op, expr } => self.eval_unary(*op, expr),
            Expr::Update { increment, prefix, target } => {
                let old = self.read_target(target)?;
                let old = self.to_number(&old)?;
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_target(target, Value::Num(new))?;
                Ok(Value::Num(if *prefix { new } else { old }))
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.binary_op(*op, l, r)
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                if logical_short_circuits(*op, &l) {
                    Ok(l)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional { test, consequent, alternate } => {
                if self.eval(test)?.truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value),
            Expr::Sequence(items) => {
                let mut last = Value::Undefined;
                for i in items {
                    last = self.eval(i)?;
                }
                Ok(last)
            }
        }
    }

    fn eval_items(&mut self, items: &[ArrayItem]) -> R<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for it in items {
            match it {
                ArrayItem::Item(e) => out.push(self.eval(e)?),
                ArrayItem::Spread(e) => {
                    let v = self.eval(e)?;
                    out.extend(self.iterate(&v)?);
                    check_array_len(out.len())?;
                }
                ArrayItem::Hole => out.push(Value::Undefined),
            }
        }
        Ok(out)
    }

    fn eval_object(&mut self, props: &[Property]) -> R<Value> {
        let id = self.alloc(ObjKind::Plain);
        for p in props {
            match p {
                Property::KeyValue(key, value) => {
                    let key = self.prop_key(key)?;
                    let v = self.eval(value)?;
                    self.heap[id].props.set(&key, v);
                }
                Property::Shorthand(name) => {
                    let v = self.lookup(name)?;
                    self.heap[id].props.set(name, v);
                }
                Property::Spread(e) => {
                    let src = self.eval(e)?;
                    if !src.is_nullish() {
                        for key in self.own_keys(&src) {
                            let v = self.get_prop(&src, &key)?;
                            self.heap[id].props.set(&key, v);
                        }
                    }
                }
                Property::Getter(key, def) | Property::Setter(key, def) => {
                    let key = self.prop_key(key)?;
                    let f = self.make_closure(def.clone(), self.scope);
                    if matches!(p, Property::Getter(..)) {
                        self.define_accessor(id, &key, Some(f), None);
                    } else {
                        self.define_accessor(id, &key, None, Some(f));
                    }
                }
            }
        }
        Ok(Value::Obj(id))
    }

    fn prop_key(&mut self, key: &PropKey) -> R<String> {
        match key {
            PropKey::Static(s) => Ok(s.clone()),
            PropKey::Computed(e) => {
                let k = self.eval(e)?;
                self.to_string(&k)
            }
        }
    }

    /// Install or extend the accessor slot for `key` on `target`.
    pub fn define_accessor(&mut self, target: ObjId, key: &str, get: Option<Value>, set: Option<Value>) {
        if let Some(Value::Obj(slot)) = self.heap[target].props.get(key).cloned() {
            if let ObjKind::Accessor { get: g, set: s } = &mut self.heap[slot].kind {
                if get.is_some() {
                    *g = get;
                }
                if set.is_some() {
                    *s = set;
                }
                return;
            }
        }
        let slot = self.alloc(ObjKind::Accessor { get, set });
        self.heap[target].props.set(key, Value::Obj(slot));
    }

    /// The accessor slot `key` resolves to along `id`'s prototype chain.
    fn find_accessor(&self, id: ObjId, key: &str) -> Option<ObjId> {
        let mut cur = Some(id);
        while let Some(o) = cur {
            if let Some(v) = self.heap[o].props.get(key) {
                return match v {
                    Value::Obj(slot) if matches!(self.heap[*slot].kind, ObjKind::Accessor { .. }) => Some(*slot),
                    _ => None,
                };
            }
            cur = self.heap[o].proto;
        }
        None
    }

    // --- Classes ---

    fn eval_class(&mut self, class: &ClassDef) -> R<Value> {
        let parent = match &class.extends {
            None => None,
            Some(e) => match self.eval(e)? {
                Value::Null => Some(Value::Null),
                v if self.is_callable(&v) => Some(v),
                v => {
                    return Err(type_err(format!(
                        "Class extends value {} is not a constructor or null",
                        self.display(&v)
                    )))
                }
            },
        };
        let outer = self.scope;
        let class_scope = self.new_scope(Some(outer), None);
        let proto = self.alloc(ObjKind::Plain);
        self.heap[proto].hidden = true;
        let proto_scope = self.new_scope(Some(class_scope), None);
        self.declare(proto_scope, HOME, Value::Obj(proto), false);

        let ctor = self.make_closure(class.constructor.clone(), proto_scope);
        let Value::Obj(cid) = ctor else { return Err(type_err("class constructor")) };
        self.heap[cid].props.set("prototype", Value::Obj(proto));
        self.heap[proto].props.set("constructor", ctor.clone());
        if let Some(name) = &class.name {
            self.declare(class_scope, name, ctor.clone(), false);
        }
        self.declare(class_scope, PARENT, parent.clone().unwrap_or(Value::Undefined), false);
        let fields = match &class.fields {
            Some(def) => self.make_closure(def.clone(), proto_scope),
            None => Value::Undefined,
        };
        self.declare(class_scope, FIELDS, fields, false);

        if let Some(Value::Obj(pid)) = parent {
            if matches!(self.heap[pid].kind, ObjKind::Closure { .. }) {
                let parent_proto = self.closure_prototype(pid);
                self.heap[proto].proto = Some(parent_proto);
            }
            self.heap[cid].proto = Some(pid);
        }

        let static_scope = self.new_scope(Some(class_scope), Some(ctor.clone()));
        self.declare(static_scope, HOME, ctor.clone(), false);
        self.scope = class_scope;
        let res = self.class_members(class, cid, proto, proto_scope, static_scope);
        self.scope = outer;
        res?;
        Ok(ctor)
    }

    fn class_members(&mut self, class: &ClassDef, ctor: ObjId, proto: ObjId, proto_scope: ScopeId, static_scope: ScopeId) -> R<()> {
        for m in &class.members {
            let key = self.prop_key(&m.key)?;
            let (target, env) = if m.is_static { (ctor, static_scope) } else { (proto, proto_scope) };
            match &m.kind {
                ClassMemberKind::Method(def) => {
                    let f = self.make_closure(def.clone(), env);
                    self.heap[target].props.set(&key, f);
                }
                ClassMemberKind::Getter(def) => {
                    let f = self.make_closure(def.clone(), env);
                    self.define_accessor(target, &key, Some(f), None);
                }
                ClassMemberKind::Setter(def) => {
                    let f = self.make_closure(def.clone(), env);
                    self.define_accessor(target, &key, None, Some(f));
                }
                ClassMemberKind::Field(init) => {
                    let saved = self.scope;
                    self.scope = static_scope;
                    let v = match init {
                        Some(e) => self.eval(e),
                        None => Ok(Value::Undefined),
                    };
                    self.scope = saved;
                    self.heap[ctor].props.set(&key, v?);
                }
            }
        }
        Ok(())
    }

    /// Innermost binding of a class-body slot, searched from `scope`.
    fn class_slot(&self, scope: ScopeId, name: &str) -> Value {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            if let Some(b) = self.scopes[s].vars.get(name) {
                return b.value.clone();
            }
            cur = self.scopes[s].parent;
        }
        Value::Undefined
    }

    /// Run the instance field initializers of the class whose body encloses `scope`.
    fn init_fields(&mut self, scope: ScopeId, this: &Value) -> R<()> {
        let fields = self.class_slot(scope, FIELDS);
        if self.is_callable(&fields) {
            self.call(&fields, this.clone(), Vec::new())?;
        }
        Ok(())
    }

    fn super_call(&mut self, args: Vec<Value>) -> R<()> {
        let parent = self.class_slot(self.scope, PARENT);
        let this = self.this_value();
        let Value::Obj(pid) = parent else {
            return Err(ScriptError::Syntax("'super' keyword unexpected here".into()));
        };
        if !self.heap[pid].kind.is_callable() {
            return Err(type_err("Super constructor is not a constructor"));
        }
        self.construct_on(pid, this.clone(), args)?;
        let scope = self.scope;
        self.init_fields(scope, &this)
    }

    /// `super.key` read against the home object's prototype.
    fn super_get(&mut self, key: &str, this: &Value) -> R<Value> {
        let Value::Obj(home) = self.class_slot(self.scope, HOME) else {
            return Err(ScriptError::Syntax("'super' keyword unexpected here".into()));
        };
        let Some(parent) = self.heap[home].proto else { return Ok(Value::Undefined) };
        let mut cur = Some(parent);
        while let Some(o) = cur {
            if let Some(v) = self.heap[o].props.get(key).cloned() {
                return self.read_slot(v, this);
            }
            cur = self.heap[o].proto;
        }
        if self.has_method(this, key) {
            let id = self.alloc(ObjKind::Method { this: this.clone(), name: key.to_string() });
            return Ok(Value::Obj(id));
        }
        Ok(Value::Undefined)
    }

    /// A stored property value; accessor slots run their getter on `receiver`.
    fn read_slot(&mut self, slot: Value, receiver: &Value) -> R<Value> {
        if let Value::Obj(id) = &slot {
            if let ObjKind::Accessor { get, .. } = &self.heap[*id].kind {
                return match get.clone() {
                    Some(g) => self.call(&g, receiver.clone(), Vec::new()),
                    None => Ok(Value::Undefined),
                };
            }
        }
        Ok(slot)
    }

    pub fn make_closure(&mut self, def: Arc<FunctionDef>, env: ScopeId) -> Value {
        Value::Obj(self.alloc(ObjKind::Closure { def, env }))
    }

    fn member_key(&mut self, key: &MemberKey) -> R<String> {
        match key {
            MemberKey::Name(n) => Ok(n.clone()),
            MemberKey::Computed(e) => {
                let k = self.eval(e)?;
                self.to_string(&k)
            }
        }
    }

    /// Member/call chains; `None` means an optional link short-circuited.
    fn eval_chain(&mut self, e: &Expr) -> R<Option<Value>> {
        match e {
            Expr::Member { object, property, optional } => {
                let Some(obj) = self.eval_chain(object)? else { return Ok(None) };
                if *optional && obj.is_nullish() {
                    return Ok(None);
                }
                let key = self.member_key(property)?;
                self.get_prop(&obj, &key).map(Some)
            }
            Expr::Call { callee, args, optional } => {
                let (f, this) = match &**callee {
                    Expr::Member { object, property, optional: member_optional } => {
                        let Some(obj) = self.eval_chain(object)? else { return Ok(None) };
                        if *member_optional && obj.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.member_key(property)?;
                        match self.get_own(&obj, &key)? {
                            Some(f) => (f, obj),
                            None if self.has_method(&obj, &key) => {
                                let argv = self.eval_items(args)?;
                                return self.call_method(&obj, &key, argv).map(Some);
                            }
                            None => (Value::Undefined, obj),
                        }
                    }
                    Expr::SuperMember(property) => {
                        let key = self.member_key(property)?;
                        let this = self.this_value();
                        (self.super_get(&key, &this)?, this)
                    }
                    other => {
                        let Some(f) = self.eval_chain(other)? else { return Ok(None) };
                        (f, Value::Undefined)
                    }
                };
                if *optional && f.is_nullish() {
                    return Ok(None);
                }
                let argv = self.eval_items(args)?;
                match f {
                    Value::Obj(id) if self.heap[id].kind.is_callable() => self.call_function(id, this, argv).map(Some),
                    _ => Err(type_err(format!("{} is not a function", describe(callee)))),
                }
            }
            other => self.eval(other).map(Some),
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, expr: &Expr) -> R<Value> {
        match op {
            UnaryOp::TypeOf => {
                let v = match expr {
                    Expr::Ident(name) => self.lookup_opt(name)?.unwrap_or(Value::Undefined),
                    other => self.eval(other)?,
                };
                Ok(Value::str(self.type_of(&v)))
            }
            UnaryOp::Delete => match expr {
                Expr::Member { object, property, .. } => {
                    let obj = self.eval(object)?;
                    let key = self.member_key(property)?;
                    self.delete_prop(&obj, &key)?;
                    Ok(Value::Bool(true))
                }
                _ => Ok(Value::Bool(false)),
            },
            UnaryOp::Void => {
                self.eval(expr)?;
                Ok(Value::Undefined)
            }
            UnaryOp::Not => Ok(Value::Bool(!self.eval(expr)?.truthy())),
            UnaryOp::Neg => {
                let v = self.eval(expr)?;
                Ok(Value::Num(-self.to_number(&v)?))
            }
            UnaryOp::Plus => {
                let v = self.eval(expr)?;
                Ok(Value::Num(self.to_number(&v)?))
            }
            UnaryOp::BitNot => {
                let v = self.eval(expr)?;
                Ok(Value::Num(!to_int32(self.to_number(&v)?) as f64))
            }
        }
    }

    fn read_target(&mut self, target: &Expr) -> R<Value> {
        match target {
            Expr::Ident(name) => self.lookup(name),
            other => self.eval(other),
        }
    }

    pub(super) fn write_target(&mut self, target: &Expr, value: Value) -> R<()> {
        match target {
            Expr::Ident(name) => self.assign(name, value),
            Expr::Member { object, property, .. } => {
                let obj = self.eval(object)?;
                let key = self.member_key(property)?;
                self.set_prop(&obj, &key, value)
            }
            _ => Err(ScriptError::Syntax("Invalid left-hand side in assignment".into())),
        }
    }

    fn eval_assign(&mut self, op: AssignOp, target: &Expr, value: &Expr) -> R<Value> {
        match target {
            Expr::Ident(name) => {
                let v = match op {
                    AssignOp::Assign => self.eval(value)?,
                    AssignOp::Compound(bop) => {
                        let cur = self.lookup(name)?;
                        let rhs = self.eval(value)?;
                        self.binary_op(bop, cur, rhs)?
                    }
                    AssignOp::Logical(lop) => {
                        let cur = self.lookup(name)?;
                        if logical_short_circuits(lop, &cur) {
                            return Ok(cur);
                        }
                        self.eval(value)?
                    }
                };
                self.assign(name, v.clone())?;
                Ok(v)
            }
            Expr::Member { object, property, .. } => {
                let obj = self.eval(object)?;
                let key = self.member_key(property)?;
                let v = match op {
                    AssignOp::Assign => self.eval(value)?,
                    AssignOp::Compound(bop) => {
                        let cur = self.get_prop(&obj, &key)?;
                        let rhs = self.eval(value)?;
                        self.binary_op(bop, cur, rhs)?
                    }
                    AssignOp::Logical(lop) => {
                        let cur = self.get_prop(&obj, &key)?;
                        if logical_short_circuits(lop, &cur) {
                            return Ok(cur);
                        }
                        self.eval(value)?
                    }
                };
                self.set_prop(&obj, &key, v.clone())?;
                Ok(v)
            }
            _ => Err(ScriptError::Syntax("Invalid left-hand side in assignment".into())),
        }
    }

    pub fn binary_op(&mut self, op: BinaryOp, l: Value, r: Value) -> R<Value> {
        use BinaryOp::*;
        Ok(match op {
            Add => {
                let lp = self.to_primitive(&l)?;
                let rp = self.to_primitive(&r)?;
                if matches!(lp, Value::Str(_)) || matches!(rp, Value::Str(_)) {
                    let (a, b) = (self.to_string(&lp)?, self.to_string(&rp)?);
                    check_string_len(a.len() + b.len())?;
                    Value::Str(a + &b)
                } else {
                    Value::Num(self.to_number(&lp)? + self.to_number(&rp)?)
                }
            }
            Sub => Value::Num(self.to_number(&l)? - self.to_number(&r)?),
            Mul => Value::Num(self.to_number(&l)? * self.to_number(&r)?),
            Div => Value::Num(self.to_number(&l)? / self.to_number(&r)?),
            Rem => Value::Num(self.to_number(&l)? % self.to_number(&r)?),
            Exp => Value::Num(self.to_number(&l)?.powf(self.to_number(&r)?)),
            Eq => Value::Bool(self.loose_eq(&l, &r)?),
            NotEq => Value::Bool(!self.loose_eq(&l, &r)?),
            StrictEq => Value::Bool(l == r),
            StrictNotEq => Value::Bool(l != r),
            Lt => Value::Bool(self.less_than(&l, &r)? == Some(true)),
            Gt => Value::Bool(self.less_than(&r, &l)? == Some(true)),
            LtEq => Value::Bool(self.less_than(&r, &l)? == Some(false)),
            GtEq => Value::Bool(self.less_than(&l, &r)? == Some(false)),
            BitAnd => Value::Num((to_int32(self.to_number(&l)?) & to_int32(self.to_number(&r)?)) as f64),
            BitOr => Value::Num((to_int32(self.to_number(&l)?) | to_int32(self.to_number(&r)?)) as f64),
            BitXor => Value::Num((to_int32(self.to_number(&l)?) ^ to_int32(self.to_number(&r)?)) as f64),
            Shl => Value::Num(to_int32(self.to_number(&l)?).wrapping_shl(to_uint32(self.to_number(&r)?) & 31) as f64),
            Shr => Value::Num((to_int32(self.to_number(&l)?) >> (to_uint32(self.to_number(&r)?) & 31)) as f64),
            UShr => Value::Num((to_uint32(self.to_number(&l)?) >> (to_uint32(self.to_number(&r)?) & 31)) as f64),
            In => {
                if !matches!(r, Value::Obj(_)) {
                    let key = self.to_string(&l)?;
                    return Err(type_err(format!("Cannot use 'in' operator to search for '{key}' in {}", self.display(&r))));
                }
                let key = self.to_string(&l)?;
                Value::Bool(self.get_own(&r, &key)?.is_some() || self.has_method(&r, &key))
            }
            InstanceOf => Value::Bool(self.instance_of(&l, &r)?),
        })
    }

    fn less_than(&mut self, l: &Value, r: &Value) -> R<Option<bool>> {
        let lp = self.to_primitive(l)?;
        let rp = self.to_primitive(r)?;
        if let (Value::Str(a), Value::Str(b)) = (&lp, &rp) {
            return Ok(Some(a < b));
        }
        let a = self.to_number(&lp)?;
        let b = self.to_number(&rp)?;
        if a.is_nan() || b.is_nan() {
            return Ok(None);
        }
        Ok(Some(a < b))
    }

    pub fn loose_eq(&mut self, a: &Value, b: &Value) -> R<bool> {
        Ok(match (a, b) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Num(_), Value::Num(_))
            | (Value::Str(_), Value::Str(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Obj(_), Value::Obj(_)) => a == b,
            (Value::Num(x), Value::Str(s)) | (Value::Str(s), Value::Num(x)) => *x == string_to_number(s),
            (Value::Bool(x), other) | (other, Value::Bool(x)) => {
                let n = Value::Num(if *x { 1.0 } else { 0.0 });
                return self.loose_eq(&n, other);
            }
            (Value::Obj(_), prim) | (prim, Value::Obj(_)) => {
                let obj = if matches!(a, Value::Obj(_)) { a } else { b };
                let p = self.to_primitive(obj)?;
                return self.loose_eq(&p, prim);
            }
        })
    }

    pub fn instance_of(&mut self, v: &Value, ctor: &Value) -> R<bool> {
        let Some(cid) = ctor.as_obj().filter(|c| self.heap[*c].kind.is_callable()) else {
            return Err(type_err("Right-hand side of 'instanceof' is not callable"));
        };
        let Value::Obj(id) = v else { return Ok(false) };
        let id = *id;
        match &self.heap[cid].kind {
            ObjKind::Native(name) => Ok(self.native_instance_of(id, name)),
            ObjKind::Bound { target, .. } => {
                let target = Value::Obj(*target);
                self.instance_of(v, &target)
            }
            ObjKind::Closure { .. } => {
                let proto = self.closure_prototype(cid);
                let mut cur = self.heap[id].proto;
                while let Some(p) = cur {
                    if p == proto {
                        return Ok(true);
                    }
                    cur = self.heap[p].proto;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    // --- Calls ---

    pub fn call_function(&mut self, id: ObjId, this: Value, args: Vec<Value>) -> R<Value> {
        self.tick()?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::StackOverflow);
        }
        self.depth += 1;
        let res = self.call_function_inner(id, this, args);
        self.depth -= 1;
        res
    }

    fn call_function_inner(&mut self, id: ObjId, this: Value, args: Vec<Value>) -> R<Value> {
        match &self.heap[id].kind {
            ObjKind::Closure { def, .. } if def.ctor.is_some() => Err(type_err(format!(
                "Class constructor {} cannot be invoked without 'new'",
                def.name.clone().unwrap_or_default()
            ))),
            ObjKind::Closure { def, env } => {
                let (def, env) = (def.clone(), *env);
                self.call_closure(id, def, env, this, args)
            }
            ObjKind::Native(name) => {
                let name = *name;
                self.call_native(name, this, args, false)
            }
            ObjKind::Resolver { promise, token, reject } => {
                let (promise, token, reject) = (*promise, *token, *reject);
                self.resolver_called(promise, token, reject, arg(&args, 0))?;
                Ok(Value::Undefined)
            }
            ObjKind::Method { this: receiver, name } => {
                let (receiver, name) = (receiver.clone(), name.clone());
                self.call_method(&receiver, &name, args)
            }
            ObjKind::Bound { target, this: bound_this, args: bound_args } => {
                let target = *target;
                let bound_this = bound_this.clone();
                let mut all = bound_args.clone();
                all.extend(args);
                self.call_function(target, bound_this, all)
            }
            _ => Err(type_err("value is not a function")),
        }
    }

    fn call_closure(&mut self, id: ObjId, def: Arc<FunctionDef>, env: ScopeId, this: Value, args: Vec<Value>) -> R<Value> {
        let scope = self.new_scope(Some(env), if def.arrow { None } else { Some(this) });
        if !def.arrow {
            if let Some(name) = &def.name {
                self.declare(scope, name, Value::Obj(id), true);
            }
            let arguments = self.array(args.clone());
            self.declare(scope, "arguments", arguments, true);
        }
        if def.is_async {
            return self.start_async(def, scope, args);
        }
        let saved = self.scope;
        self.scope = scope;
        let res = self.run_closure_body(&def, scope, args);
        self.scope = saved;
        res
    }

    fn run_closure_body(&mut self, def: &FunctionDef, scope: ScopeId, args: Vec<Value>) -> R<Value> {
        self.bind_params(def, args)?;
        match &def.body {
            FunctionBody::Expr(e) => self.eval(e),
            FunctionBody::Block(stmts) => {
                self.hoist(scope, stmts, true)?;
                match self.exec_stmts(stmts)? {
                    Flow::Return(v) => Ok(v),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }

    pub(super) fn bind_params(&mut self, def: &FunctionDef, args: Vec<Value>) -> R<()> {
        for (i, p) in def.params.iter().enumerate() {
            if p.rest {
                let rest = args.get(i..).map(|s| s.to_vec()).unwrap_or_default();
                let arr = self.array(rest);
                self.bind_pattern(&p.pattern, arr, BindMode::Let)?;
                break;
            }
            let mut v = arg(&args, i);
            if matches!(v, Value::Undefined) {
                if let Some(d) = &p.default {
                    v = self.eval(d)?;
                }
            }
            self.bind_pattern(&p.pattern, v, BindMode::Let)?;
        }
        Ok(())
    }

    /// Call any callable value (callbacks, listeners, timers).
    pub fn call(&mut self, f: &Value, this: Value, args: Vec<Value>) -> R<Value> {
        match f {
            Value::Obj(id) if self.heap[*id].kind.is_callable() => self.call_function(*id, this, args),
            other => Err(type_err(format!("{} is not a function", self.display(other)))),
        }
    }

    fn construct(&mut self, f: &Value, args: Vec<Value>, callee: &Expr) -> R<Value> {
        let not_ctor = || type_err(format!("{} is not a constructor", describe(callee)));
        let Value::Obj(fid) = f else { return Err(not_ctor()) };
        let fid = *fid;
        match &self.heap[fid].kind {
            ObjKind::Native(name) => {
                let name = *name;
                self.call_native(name, Value::Undefined, args, true)
            }
            ObjKind::Closure { def, .. } if !def.arrow && !def.is_async => {
                let proto = self.closure_prototype(fid);
                let obj = self.alloc(ObjKind::Plain);
                self.heap[obj].proto = Some(proto);
                self.construct_on(fid, Value::Obj(obj), args)
            }
            _ => Err(not_ctor()),
        }
    }

    /// Run constructor `fid` against an already allocated `this`. Class
    /// constructors reach their parent through `super(...)`.
    fn construct_on(&mut self, fid: ObjId, this: Value, args: Vec<Value>) -> R<Value> {
        let (def, env) = match &self.heap[fid].kind {
            ObjKind::Closure { def, env } if !def.arrow => (def.clone(), *env),
            ObjKind::Native(name) => {
                // Built-in parent class: take over the object it builds.
                let name = *name;
                let made = self.call_native(name, Value::Undefined, args, true)?;
                if let (Value::Obj(src), Value::Obj(dst)) = (&made, &this) {
                    let kind = std::mem::replace(&mut self.heap[*src].kind, ObjKind::Plain);
                    let props = std::mem::take(&mut self.heap[*src].props);
                    self.heap[*dst].kind = kind;
                    for (k, v) in props.entries() {
                        self.heap[*dst].props.set(&k, v);
                    }
                }
                return Ok(this);
            }
            _ => return Err(type_err(format!("{} is not a constructor", self.display(&Value::Obj(fid))))),
        };
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::StackOverflow);
        }
        self.tick()?;
        self.depth += 1;
        let res = self.construct_body(fid, def, env, this.clone(), args);
        self.depth -= 1;
        match res? {
            v @ Value::Obj(_) => Ok(v),
            _ => Ok(this),
        }
    }

    fn construct_body(&mut self, fid: ObjId, def: Arc<FunctionDef>, env: ScopeId, this: Value, args: Vec<Value>) -> R<Value> {
        if def.ctor == Some(CtorKind::Base) {
            self.init_fields(env, &this)?;
        }
        self.call_closure(fid, def, env, this, args)
    }

    /// `F.prototype`, created on first use.
    pub fn closure_prototype(&mut self, fid: ObjId) -> ObjId {
        if let Some(Value::Obj(p)) = self.heap[fid].props.get("prototype") {
            return *p;
        }
        let proto = self.alloc(ObjKind::Plain);
        self.heap[proto].props.set("constructor", Value::Obj(fid));
        self.heap[fid].props.set("prototype", Value::Obj(proto));
        proto
    }

    // --- Properties ---

    pub fn get_prop(&mut self, obj: &Value, key: &str) -> R<Value> {
        if let Some(v) = self.get_own(obj, key)? {
            return Ok(v);
        }
        if self.has_method(obj, key) {
            let id = self.alloc(ObjKind::Method { this: obj.clone(), name: key.to_string() });
            return Ok(Value::Obj(id));
        }
        Ok(Value::Undefined)
    }

    /// Data and accessor-like properties, without built-in methods.
    pub fn get_own(&mut self, obj: &Value, key: &str) -> R<Option<Value>> {
        let id = match obj {
            Value::Undefined | Value::Null => {
                return Err(type_err(format!("Cannot read properties of {} (reading '{key}')", obj.kind_label())))
            }
            Value::Str(s) => {
                if key == "length" {
                    return Ok(Some(Value::Num(s.chars().count() as f64)));
                }
                return Ok(array_index(key).and_then(|i| s.chars().nth(i)).map(|c| Value::Str(c.to_string())));
            }
            Value::Num(_) | Value::Bool(_) => return Ok(None),
            Value::Obj(id) => *id,
        };

        match &self.heap[id].kind {
            ObjKind::Array(items) => {
                if key == "length" {
                    return Ok(Some(Value::Num(items.len() as f64)));
                }
                if let Some(i) = array_index(key) {
                    return Ok(Some(items.get(i).cloned().unwrap_or(Value::Undefined)));
                }
            }
            ObjKind::Closure { def, .. } => match key {
                "name" => return Ok(Some(Value::str(def.name.clone().unwrap_or_default()))),
                "length" => return Ok(Some(Value::Num(def.params.iter().filter(|p| !p.rest && p.default.is_none()).count() as f64))),
                "prototype" if !def.arrow => {
                    let p = self.closure_prototype(id);
                    return Ok(Some(Value::Obj(p)));
                }
                _ => {}
            },
            ObjKind::Native(name) if key == "name" => {
                let short = name.rsplit('.').next().unwrap_or_default();
                return Ok(Some(Value::str(short)));
            }
            ObjKind::Regex { source, flags, last_index, .. } => match key {
                "source" => return Ok(Some(Value::str(source.clone()))),
                "flags" => return Ok(Some(Value::str(flags.clone()))),
                "global" => return Ok(Some(Value::Bool(flags.contains('g')))),
                "lastIndex" => return Ok(Some(Value::Num(*last_index as f64))),
                _ => {}
            },
            ObjKind::Map(entries) if key == "size" => return Ok(Some(Value::Num(entries.len() as f64))),
            ObjKind::Set(items) if key == "size" => return Ok(Some(Value::Num(items.len() as f64))),
            ObjKind::Event { prevented, .. } if key == "defaultPrevented" => return Ok(Some(Value::Bool(*prevented))),
            ObjKind::Node(n) => {
                let n = *n;
                if let Some(v) = self.node_get(id, n, key)? {
                    return Ok(Some(v));
                }
            }
            ObjKind::Window => {
                if let Some(v) = self.window_get(key)? {
                    return Ok(Some(v));
                }
            }
            ObjKind::NodeList(nodes) => {
                if key == "length" {
                    return Ok(Some(Value::Num(nodes.len() as f64)));
                }
                if let Some(i) = array_index(key) {
                    let n = nodes.get(i).copied();
                    return Ok(Some(match n {
                        Some(n) => self.node_value(n),
                        None => Value::Undefined,
                    }));
                }
            }
            ObjKind::ClassList(n) => {
                let n = *n;
                if let Some(v) = self.class_list_get(n, key) {
                    return Ok(Some(v));
                }
            }
            ObjKind::Style(n) => {
                let n = *n;
                if !self.has_method(obj, key) {
                    return Ok(Some(self.style_get(n, key)));
                }
            }
            ObjKind::ComputedStyle(map) => {
                if key == "length" {
                    return Ok(Some(Value::Num(map.len() as f64)));
                }
                if key != "getPropertyValue" {
                    let prop = crate::sandbox::css::camel_to_kebab(key);
                    return Ok(Some(Value::str(map.get(&prop).cloned().unwrap_or_default())));
                }
            }
            ObjKind::Dataset(n) => {
                let n = *n;
                let attr = format!("data-{}", crate::sandbox::css::camel_to_kebab(key));
                return Ok(self.dom.attr(n, &attr).map(Value::str));
            }
            ObjKind::Storage(items) => {
                if key == "length" {
                    return Ok(Some(Value::Num(items.len() as f64)));
                }
                if !super::host::STORAGE_METHODS.contains(&key) {
                    if let Some((_, v)) = items.iter().find(|(k, _)| k == key) {
                        return Ok(Some(Value::str(v.clone())));
                    }
                }
            }
            _ => {}
        }

        let mut cur = Some(id);
        while let Some(o) = cur {
            if let Some(v) = self.heap[o].props.get(key).cloned() {
                return self.read_slot(v, obj).map(Some);
            }
            cur = self.heap[o].proto;
        }
        Ok(None)
    }

    pub fn set_prop(&mut self, obj: &Value, key: &str, value: Value) -> R<()> {
        let id = match obj {
            Value::Undefined | Value::Null => {
                return Err(type_err(format!("Cannot set properties of {} (setting '{key}')", obj.kind_label())))
            }
            Value::Obj(id) => *id,
            _ => return Ok(()),
        };
        if matches!(self.heap[id].kind, ObjKind::Storage(_)) && !self.has_method(obj, key) {
            let v = self.to_string(&value)?;
            return self.storage_set(id, key, v);
        }
        match &mut self.heap[id].kind {
            ObjKind::Array(items) => {
                if key == "length" {
                    let len = match value {
                        Value::Num(n) if n >= 0.0 && n.fract() == 0.0 && n <= MAX_ARRAY_LEN as f64 => n as usize,
                        _ => return Err(ScriptError::Range("Invalid array length".into())),
                    };
                    items.resize(len, Value::Undefined);
                    return Ok(());
                }
                if let Some(i) = array_index(key) {
                    if i >= items.len() {
                        check_array_len(i.saturating_add(1))?;
                        items.resize(i + 1, Value::Undefined);
                    }
                    items[i] = value;
                    return Ok(());
                }
            }
            ObjKind::Regex { last_index, .. } if key == "lastIndex" => {
                if let Value::Num(n) = value {
                    *last_index = n.max(0.0) as usize;
                }
                return Ok(());
            }
            ObjKind::Node(n) => {
                let n = *n;
                if self.node_set(n, key, &value)? {
                    return Ok(());
                }
            }
            ObjKind::Window => {
                if self.window_set(key, &value)? {
                    return Ok(());
                }
            }
            ObjKind::Style(n) => {
                let n = *n;
                let v = self.to_string(&value)?;
                self.style_set(n, key, &v);
                return Ok(());
            }
            ObjKind::Dataset(n) => {
                let n = *n;
                let v = self.to_string(&value)?;
                let attr = format!("data-{}", crate::sandbox::css::camel_to_kebab(key));
                self.dom.set_attr(n, &attr, &v);
                return Ok(());
            }
            ObjKind::ClassList(n) if key == "value" => {
                let n = *n;
                let v = self.to_string(&value)?;
                self.dom.set_attr(n, "class", &v);
                return Ok(());
            }
            _ => {}
        }
        if let Some(slot) = self.find_accessor(id, key) {
            let setter = match &self.heap[slot].kind {
                ObjKind::Accessor { set, .. } => set.clone(),
                _ => None,
            };
            if let Some(f) = setter {
                self.call(&f, obj.clone(), vec![value])?;
            }
            return Ok(());
        }
        self.heap[id].props.set(key, value);
        Ok(())
    }

    fn delete_prop(&mut self, obj: &Value, key: &str) -> R<()> {
        let Value::Obj(id) = obj else {
            if obj.is_nullish() {
                return Err(type_err(format!("Cannot convert {} to object", obj.kind_label())));
            }
            return Ok(());
        };
        match &mut self.heap[*id].kind {
            ObjKind::Array(items) => {
                if let Some(i) = array_index(key) {
                    if let Some(slot) = items.get_mut(i) {
                        *slot = Value::Undefined;
                    }
                    return Ok(());
                }
            }
            ObjKind::Dataset(n) => {
                let n = *n;
                let attr = format!("data-{}", crate::sandbox::css::camel_to_kebab(key));
                self.dom.remove_attr(n, &attr);
                return Ok(());
            }
            ObjKind::Storage(items) => {
                items.retain(|(k, _)| k != key);
                return Ok(());
            }
            _ => {}
        }
        self.heap[*id].props.remove(key);
        Ok(())
    }

    /// Own enumerable keys (`Object.keys`).
    pub fn own_keys(&self, v: &Value) -> Vec<String> {
        match v {
            Value::Str(s) => (0..s.chars().count()).map(|i| i.to_string()).collect(),
            Value::Obj(id) => {
                let obj = &self.heap[*id];
                let mut keys: Vec<String> = match &obj.kind {
                    ObjKind::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
                    ObjKind::NodeList(nodes) => (0..nodes.len()).map(|i| i.to_string()).collect(),
                    ObjKind::Dataset(n) => self
                        .dom
                        .attrs(*n)
                        .iter()
                        .filter_map(|(k, _)| k.strip_prefix("data-").map(crate::sandbox::css::kebab_to_camel))
                        .collect(),
                    ObjKind::Storage(items) => items.iter().map(|(k, _)| k.clone()).collect(),
                    _ => Vec::new(),
                };
                if !obj.hidden {
                    // `#private` class members stay out of enumeration.
                    keys.extend(obj.props.keys().into_iter().filter(|k| k != "prototype" && !k.starts_with('#')));
                }
                keys
            }
            _ => Vec::new(),
        }
    }

    /// `for...in` keys: own keys then inherited ones.
    fn enumerable_keys(&self, v: &Value) -> Vec<String> {
        let mut keys = self.own_keys(v);
        if let Value::Obj(id) = v {
            let mut cur = self.heap[*id].proto;
            while let Some(p) = cur {
                if !self.heap[p].hidden {
                    for k in self.heap[p].props.keys() {
                        if k != "constructor" && !k.starts_with('#') && !keys.contains(&k) {
                            keys.push(k);
                        }
                    }
                }
                cur = self.heap[p].proto;
            }
        }
        keys
    }

    /// Values produced by iterating `v` (`for...of`, spread, destructuring).
    pub fn iterate(&mut self, v: &Value) -> R<Vec<Value>> {
        match v {
            Value::Str(s) => return Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Obj(id) => match &self.heap[*id].kind {
                ObjKind::Array(items) => return Ok(items.clone()),
                ObjKind::Set(items) => return Ok(items.clone()),
                ObjKind::NodeList(nodes) => {
                    let nodes = nodes.clone();
                    return Ok(nodes.into_iter().map(|n| self.node_value(n)).collect());
                }
                ObjKind::Map(entries) => {
                    let entries = entries.clone();
                    return Ok(entries.into_iter().map(|(k, v)| self.array(vec![k, v])).collect());
                }
                ObjKind::ClassList(n) => {
                    return Ok(self.dom.class_list(*n).into_iter().map(Value::Str).collect());
                }
                _ => {}
            },
            _ => {}
        }
        Err(type_err(format!("{} is not iterable", self.display(v))))
    }

    // --- Conversions ---

    pub fn to_string(&mut self, v: &Value) -> R<String> {
        Ok(match v {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => number_to_string(*n),
            Value::Str(s) => s.clone(),
            Value::Obj(id) => self.obj_to_string(*id)?,
        })
    }

    /// Infallible rendering for error messages and logs.
    pub fn display(&self, v: &Value) -> String {
        match v {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => number_to_string(*n),
            Value::Str(s) => s.clone(),
            Value::Obj(id) => match &self.heap[*id].kind {
                ObjKind::Array(_) => "[object Array]".into(),
                ObjKind::Error => {
                    let p = &self.heap[*id].props;
                    let name = p.get("name").map(|v| self.display(v)).unwrap_or_else(|| "Error".into());
                    let msg = p.get("message").map(|v| self.display(v)).unwrap_or_default();
                    if msg.is_empty() { name } else { format!("{name}: {msg}") }
                }
                k if k.is_callable() => "function".into(),
                _ => "#<Object>".into(),
            },
        }
    }

    fn obj_to_string(&mut self, id: ObjId) -> R<String> {
        match &self.heap[id].kind {
            ObjKind::Array(items) => {
                if self.joining.contains(&id) {
                    return Ok(String::new());
                }
                if self.joining.len() >= MAX_CALL_DEPTH {
                    return Err(ScriptError::StackOverflow);
                }
                let items = items.clone();
                self.joining.push(id);
                let mut parts = Vec::with_capacity(items.len());
                let mut total = 0usize;
                let mut res = Ok(());
                for it in &items {
                    let part = match it {
                        Value::Undefined | Value::Null => Ok(String::new()),
                        other => self.to_string(other),
                    };
                    match part.and_then(|s| {
                        total += s.len() + 1;
                        check_string_len(total).map(|_| s)
                    }) {
                        Ok(s) => parts.push(s),
                        Err(e) => {
                            res = Err(e);
                            break;
                        }
                    }
                }
                self.joining.retain(|j| *j != id);
                res?;
                Ok(parts.join(","))
            }
            ObjKind::Error => Ok(self.display(&Value::Obj(id))),
            ObjKind::Closure { def, .. } => Ok(format!("function {}() {{ [code] }}", def.name.clone().unwrap_or_default())),
            ObjKind::Native(name) => Ok(format!("function {}() {{ [native code] }}", name.rsplit('.').next().unwrap_or_default())),
            ObjKind::Method { name, .. } => Ok(format!("function {name}() {{ [native code] }}")),
            ObjKind::Bound { .. } => Ok("function () { [native code] }".into()),
            ObjKind::Regex { source, flags, .. } => Ok(format!("/{source}/{flags}")),
            ObjKind::Date(t) => Ok(super::builtins::date_string(*t)),
            ObjKind::Node(n) => Ok(self.node_type_string(*n)),
            ObjKind::Window => Ok("[object Window]".into()),
            ObjKind::NodeList(_) => Ok("[object NodeList]".into()),
            ObjKind::ClassList(n) => Ok(self.dom.attr(*n, "class").unwrap_or_default().to_string()),
            ObjKind::Style(_) | ObjKind::ComputedStyle(_) => Ok("[object CSSStyleDeclaration]".into()),
            ObjKind::Dataset(_) => Ok("[object DOMStringMap]".into()),
            ObjKind::Event { .. } => Ok("[object Event]".into()),
            ObjKind::Map(_) => Ok("[object Map]".into()),
            ObjKind::Set(_) => Ok("[object Set]".into()),
            ObjKind::Promise(_) => Ok("[object Promise]".into()),
            ObjKind::Resolver { .. } => Ok("function () { [native code] }".into()),
            ObjKind::Storage(_) => Ok("[object Storage]".into()),
            ObjKind::Accessor { .. } | ObjKind::Combinator { .. } => Ok("[object Object]".into()),
            ObjKind::Plain => {
                let custom = self.get_own(&Value::Obj(id), "toString")?;
                match custom {
                    Some(f) if self.is_callable(&f) => {
                        let v = self.call(&f, Value::Obj(id), Vec::new())?;
                        match v {
                            Value::Obj(_) => Ok("[object Object]".into()),
                            other => self.to_string(&other),
                        }
                    }
                    _ => Ok("[object Object]".into()),
                }
            }
        }
    }

    pub fn to_number(&mut self, v: &Value) -> R<f64> {
        Ok(match v {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Num(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Obj(id) => {
                if let ObjKind::Date(t) = self.heap[*id].kind {
                    return Ok(t);
                }
                let s = self.obj_to_string(*id)?;
                string_to_number(&s)
            }
        })
    }

    pub fn to_primitive(&mut self, v: &Value) -> R<Value> {
        match v {
            Value::Obj(id) => {
                if let ObjKind::Date(t) = self.heap[*id].kind {
                    return Ok(Value::Str(super::builtins::date_string(t)));
                }
                Ok(Value::Str(self.obj_to_string(*id)?))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn document_value(&mut self) -> Value {
        self.node_value(crate::sandbox::dom::DOCUMENT)
    }

    pub fn log(&mut self, level: &str, line: String) {
        debug!(target: "sandbox", console = level, "{line}");
        self.console.push(line);
    }
}

fn logical_short_circuits(op: LogicalOp, left: &Value) -> bool {
    match op {
        LogicalOp::And => !left.truthy(),
        LogicalOp::Or => left.truthy(),
        LogicalOp::Nullish => !left.is_nullish(),
    }
}

/// Source-like rendering of a callee for "is not a function" messages.
pub(super) fn describe(e: &Expr) -> String {
    match e {
        Expr::Ident(n) => n.clone(),
        Expr::This => "this".into(),
        Expr::Member { object, property: MemberKey::Name(n), .. } => format!("{}.{n}", describe(object)),
        Expr::Member { object, .. } => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        Expr::SuperMember(MemberKey::Name(n)) => format!("super.{n}"),
        Expr::Str(s) => format!("\"{s}\""),
        Expr::Num(n) => number_to_string(*n),
        _ => "expression".into(),
    }
}
