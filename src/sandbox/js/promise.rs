//! Promises, the microtask queue and `async` function bodies.
//!
//! An async body runs statement by statement in its own scope. A top-level
//! `await` parks the body on the awaited promise and the rest resumes from a
//! microtask. An `await` nested deeper (inside a loop, a block or an
//! expression) cannot unwind that way, so it drains queued microtasks and
//! pending timers in place until its operand settles.

use std::sync::Arc;

use tracing::warn;

use super::ast::*;
use super::host::MAX_TIMER_RUNS;
use super::interp::{arg, type_err, BindMode, Flow, Interp, MAX_MICROTASKS, R};
use super::value::*;
use super::ScriptError;

pub(super) const PROMISE_METHODS: &[&str] = &["then", "catch", "finally"];

pub(super) const PROMISE_STATICS: &[&str] =
    &["Promise.resolve", "Promise.reject", "Promise.all", "Promise.allSettled", "Promise.any", "Promise.race"];

/// Work waiting on the microtask queue.
#[derive(Debug, Clone)]
pub(super) enum Job {
    Reaction { reaction: Reaction, outcome: Settlement },
    /// `queueMicrotask` callback.
    Callback(Value),
    /// Adopt the state of a foreign thenable through its `then`.
    Thenable { promise: ObjId, thenable: Value, then: Value },
}

/// The operand of an `await` that can park an async body: one that is the
/// whole statement, a plain assignment, a single declaration or a `return`.
fn await_operand(stmt: &Stmt) -> Option<&Expr> {
    match stmt {
        Stmt::Expr(Expr::Await(e)) | Stmt::Return(Some(Expr::Await(e))) => Some(e),
        Stmt::Expr(Expr::Assign { op: AssignOp::Assign, value, .. }) => match &**value {
            Expr::Await(e) => Some(e),
            _ => None,
        },
        Stmt::Decl(_, decls) if decls.len() == 1 => match &decls[0].1 {
            Some(Expr::Await(e)) => Some(e),
            _ => None,
        },
        _ => None,
    }
}

impl Interp {
    pub(super) fn new_promise(&mut self) -> ObjId {
        self.alloc(ObjKind::Promise(PromiseData {
            state: PromiseState::Pending,
            reactions: Vec::new(),
            token: 0,
            handled: false,
        }))
    }

    fn is_promise(&self, v: &Value) -> Option<ObjId> {
        match v {
            Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Promise(_)) => Some(*id),
            _ => None,
        }
    }

    /// A fresh `resolve`/`reject` pair for `p`. Only the first call of either
    /// function has an effect.
    fn resolvers(&mut self, p: ObjId) -> (Value, Value) {
        let token = self.next_token;
        self.next_token += 1;
        if let ObjKind::Promise(data) = &mut self.heap[p].kind {
            data.token = token;
        }
        let resolve = self.alloc(ObjKind::Resolver { promise: p, token, reject: false });
        let reject = self.alloc(ObjKind::Resolver { promise: p, token, reject: true });
        (Value::Obj(resolve), Value::Obj(reject))
    }

    pub(super) fn resolver_called(&mut self, p: ObjId, token: u64, reject: bool, value: Value) -> R<()> {
        match &mut self.heap[p].kind {
            ObjKind::Promise(data) if data.token == token && token != 0 => data.token = 0,
            _ => return Ok(()),
        }
        if reject {
            self.reject_promise(p, value);
            Ok(())
        } else {
            self.resolve_promise(p, value)
        }
    }

    /// Resolve `p` with `x`, following `x` when it is thenable.
    pub(super) fn resolve_promise(&mut self, p: ObjId, x: Value) -> R<()> {
        if x == Value::Obj(p) {
            let reason = self.error_value("TypeError", "Chaining cycle detected for promise #<Promise>");
            self.reject_promise(p, reason);
            return Ok(());
        }
        if let Value::Obj(_) = x {
            let then = match self.get_prop(&x, "then") {
                Ok(t) => t,
                Err(err) => {
                    let reason = self.error_to_value(err)?;
                    self.reject_promise(p, reason);
                    return Ok(());
                }
            };
            if self.is_callable(&then) {
                self.microtasks.push_back(Job::Thenable { promise: p, thenable: x, then });
                return Ok(());
            }
        }
        self.settle(p, Ok(x));
        Ok(())
    }

    pub(super) fn reject_promise(&mut self, p: ObjId, reason: Value) {
        self.settle(p, Err(reason));
    }

    fn settle(&mut self, p: ObjId, outcome: Settlement) {
        let ObjKind::Promise(data) = &mut self.heap[p].kind else { return };
        if !matches!(data.state, PromiseState::Pending) {
            return;
        }
        data.token = 0;
        data.state = match &outcome {
            Ok(v) => PromiseState::Fulfilled(v.clone()),
            Err(r) => PromiseState::Rejected(r.clone()),
        };
        let reactions = std::mem::take(&mut data.reactions);
        let unhandled = outcome.is_err() && !data.handled;
        for reaction in reactions {
            self.microtasks.push_back(Job::Reaction { reaction, outcome: outcome.clone() });
        }
        if unhandled {
            self.unhandled.push(p);
        }
    }

    fn add_reaction(&mut self, p: ObjId, reaction: Reaction) {
        let ObjKind::Promise(data) = &mut self.heap[p].kind else { return };
        data.handled = true;
        let outcome = match &data.state {
            PromiseState::Pending => {
                data.reactions.push(reaction);
                return;
            }
            PromiseState::Fulfilled(v) => Ok(v.clone()),
            PromiseState::Rejected(r) => Err(r.clone()),
        };
        self.unhandled.retain(|u| *u != p);
        self.microtasks.push_back(Job::Reaction { reaction, outcome });
    }

    /// `Promise.resolve(v)`: `v` itself when it already is a promise.
    pub(super) fn promise_resolve(&mut self, v: Value) -> R<ObjId> {
        if let Some(p) = self.is_promise(&v) {
            return Ok(p);
        }
        let p = self.new_promise();
        self.resolve_promise(p, v)?;
        Ok(p)
    }

    fn promise_then(&mut self, p: ObjId, on_fulfilled: Value, on_rejected: Value) -> Value {
        let derived = self.new_promise();
        self.add_reaction(p, Reaction::Then { on_fulfilled, on_rejected, derived });
        Value::Obj(derived)
    }

    /// Settle `derived` from a handler's result; a throw rejects it.
    fn settle_from(&mut self, derived: ObjId, res: R<Value>) -> R<()> {
        match res {
            Ok(v) => self.resolve_promise(derived, v),
            Err(err) => {
                let reason = self.error_to_value(err)?;
                self.reject_promise(derived, reason);
                Ok(())
            }
        }
    }

    // --- Jobs ---

    fn run_job(&mut self, job: Job) -> R<()> {
        match job {
            Job::Reaction { reaction, outcome } => self.run_reaction(reaction, outcome),
            Job::Callback(f) => self.call(&f, Value::Undefined, Vec::new()).map(|_| ()),
            Job::Thenable { promise, thenable, then } => {
                let (resolve, reject) = self.resolvers(promise);
                if let Err(err) = self.call(&then, thenable, vec![resolve, reject.clone()]) {
                    let reason = self.error_to_value(err)?;
                    self.call(&reject, Value::Undefined, vec![reason])?;
                }
                Ok(())
            }
        }
    }

    fn run_reaction(&mut self, reaction: Reaction, outcome: Settlement) -> R<()> {
        match reaction {
            Reaction::Then { on_fulfilled, on_rejected, derived } => {
                let handler = if outcome.is_ok() { on_fulfilled } else { on_rejected };
                if !self.is_callable(&handler) {
                    return match outcome {
                        Ok(v) => self.resolve_promise(derived, v),
                        Err(r) => {
                            self.reject_promise(derived, r);
                            Ok(())
                        }
                    };
                }
                let (Ok(value) | Err(value)) = outcome;
                let res = self.call(&handler, Value::Undefined, vec![value]);
                self.settle_from(derived, res)
            }
            Reaction::Finally { callback, derived } => {
                if self.is_callable(&callback) {
                    if let Err(err) = self.call(&callback, Value::Undefined, Vec::new()) {
                        return self.settle_from(derived, Err(err));
                    }
                }
                match outcome {
                    Ok(v) => self.resolve_promise(derived, v),
                    Err(r) => {
                        self.reject_promise(derived, r);
                        Ok(())
                    }
                }
            }
            Reaction::Combine { combinator, index } => self.combine(combinator, index, outcome),
            Reaction::Resume { task, index } => self.run_async(task, index, Some(outcome)),
        }
    }

    /// Drain the microtask queue, then report rejections nobody handled.
    pub fn run_microtasks(&mut self) -> Vec<ScriptError> {
        self.steps = 0;
        self.depth = 0;
        let mut errors = Vec::new();
        let mut runs = 0;
        while let Some(job) = self.microtasks.pop_front() {
            runs += 1;
            if runs > MAX_MICROTASKS {
                warn!(target: "sandbox", "microtask budget exhausted, dropping remaining jobs");
                self.microtasks.clear();
                break;
            }
            match self.run_job(job) {
                Ok(()) | Err(ScriptError::Suspended) => {}
                Err(err) => {
                    warn!(target: "sandbox", error = %err, "microtask failed");
                    let fatal = matches!(err, ScriptError::StepLimit);
                    errors.push(err);
                    if fatal {
                        self.microtasks.clear();
                        break;
                    }
                }
            }
        }
        errors.extend(self.report_unhandled());
        errors
    }

    fn report_unhandled(&mut self) -> Vec<ScriptError> {
        let mut errors = Vec::new();
        for p in std::mem::take(&mut self.unhandled) {
            let reason = match &self.heap[p].kind {
                ObjKind::Promise(PromiseData { state: PromiseState::Rejected(r), handled: false, .. }) => r.clone(),
                _ => continue,
            };
            let shown = match &reason {
                Value::Obj(id) if matches!(self.heap[*id].kind, ObjKind::Error) => {
                    self.heap[*id].props.get("stack").map(|s| self.display(s)).unwrap_or_default()
                }
                other => self.display(other),
            };
            warn!(target: "sandbox", reason = %shown, "unhandled promise rejection");
            self.log("error", format!("Uncaught (in promise) {shown}"));
            errors.push(self.throw_value(reason));
        }
        errors
    }

    // --- Combinators ---

    fn combinator_start(&mut self, mode: CombineMode, iterable: &Value) -> R<Value> {
        let items = self.iterate(iterable)?;
        let promise = self.new_promise();
        if items.is_empty() {
            match mode {
                CombineMode::All | CombineMode::AllSettled => {
                    let list = self.array(Vec::new());
                    self.settle(promise, Ok(list));
                }
                CombineMode::Any => {
                    let err = self.aggregate_error(Vec::new());
                    self.reject_promise(promise, err);
                }
                CombineMode::Race => {}
            }
            return Ok(Value::Obj(promise));
        }
        let id = self.alloc(ObjKind::Combinator {
            mode,
            promise,
            values: vec![Value::Undefined; items.len()],
            remaining: items.len(),
            done: false,
        });
        for (index, item) in items.into_iter().enumerate() {
            let p = self.promise_resolve(item)?;
            self.add_reaction(p, Reaction::Combine { combinator: id, index });
        }
        Ok(Value::Obj(promise))
    }

    fn aggregate_error(&mut self, errors: Vec<Value>) -> Value {
        let err = self.error_value("AggregateError", "All promises were rejected");
        let list = self.array(errors);
        if let Value::Obj(id) = err {
            self.heap[id].props.set("errors", list);
        }
        err
    }

    fn combine(&mut self, id: ObjId, index: usize, outcome: Settlement) -> R<()> {
        let mode = match &self.heap[id].kind {
            ObjKind::Combinator { mode, done: false, .. } => *mode,
            _ => return Ok(()),
        };
        let slot = match (mode, &outcome) {
            (CombineMode::AllSettled, Ok(v)) => self.plain(vec![("status", Value::str("fulfilled")), ("value", v.clone())]),
            (CombineMode::AllSettled, Err(r)) => self.plain(vec![("status", Value::str("rejected")), ("reason", r.clone())]),
            (_, Ok(v) | Err(v)) => v.clone(),
        };
        let early = match (mode, outcome) {
            (CombineMode::Race, o) => Some(o),
            (CombineMode::All, Err(r)) => Some(Err(r)),
            (CombineMode::Any, Ok(v)) => Some(Ok(v)),
            _ => None,
        };
        let ObjKind::Combinator { promise, values, remaining, done, .. } = &mut self.heap[id].kind else {
            return Ok(());
        };
        let promise = *promise;
        let finish = match early {
            Some(o) => {
                *done = true;
                o
            }
            None => {
                if let Some(s) = values.get_mut(index) {
                    *s = slot;
                }
                *remaining = remaining.saturating_sub(1);
                if *remaining > 0 {
                    return Ok(());
                }
                *done = true;
                let values = std::mem::take(values);
                if mode == CombineMode::Any {
                    Err(self.aggregate_error(values))
                } else {
                    Ok(self.array(values))
                }
            }
        };
        match finish {
            Ok(v) => self.resolve_promise(promise, v),
            Err(r) => {
                self.reject_promise(promise, r);
                Ok(())
            }
        }
    }

    // --- Async functions ---

    /// Enter an `async` function whose call scope is ready; returns its promise.
    pub(super) fn start_async(&mut self, def: Arc<FunctionDef>, scope: ScopeId, args: Vec<Value>) -> R<Value> {
        let promise = self.new_promise();
        let task = AsyncTask { def, scope, promise };
        let saved = self.scope;
        self.scope = scope;
        let mut res = self.bind_params(&task.def, args);
        if res.is_ok() {
            if let FunctionBody::Block(stmts) = &task.def.body {
                res = self.hoist(scope, stmts, true);
            }
        }
        self.scope = saved;
        match res {
            Ok(()) => self.run_async(task, 0, None)?,
            Err(err) => self.settle_async(promise, Err(err))?,
        }
        Ok(Value::Obj(promise))
    }

    /// Run `task` from top-level statement `start`. `resumed` carries the
    /// outcome of the await that parked it there.
    fn run_async(&mut self, task: AsyncTask, start: usize, resumed: Option<Settlement>) -> R<()> {
        let saved = self.scope;
        self.scope = task.scope;
        let res = self.async_body(&task, start, resumed);
        self.scope = saved;
        match res {
            Ok(Some(v)) => self.settle_async(task.promise, Ok(v)),
            Ok(None) => Ok(()),
            Err(err) => self.settle_async(task.promise, Err(err)),
        }
    }

    /// `Ok(None)` when the body parked on an await.
    fn async_body(&mut self, task: &AsyncTask, start: usize, resumed: Option<Settlement>) -> R<Option<Value>> {
        let resumed = match resumed {
            Some(Ok(v)) => Some(v),
            Some(Err(reason)) => return Err(self.throw_value(reason)),
            None => None,
        };
        let stmts = match &task.def.body {
            FunctionBody::Expr(Expr::Await(operand)) => {
                if let Some(v) = resumed {
                    return Ok(Some(v));
                }
                let v = self.eval(operand)?;
                self.park(task.clone(), 0, v)?;
                return Ok(None);
            }
            FunctionBody::Expr(e) => return self.eval(e).map(Some),
            FunctionBody::Block(stmts) => stmts,
        };
        let mut i = start;
        if let Some(v) = resumed {
            let Some(stmt) = stmts.get(i) else { return Ok(Some(Value::Undefined)) };
            if let Flow::Return(v) = self.complete_await(stmt, v)? {
                return Ok(Some(v));
            }
            i += 1;
        }
        while let Some(stmt) = stmts.get(i) {
            if let Some(operand) = await_operand(stmt) {
                let v = self.eval(operand)?;
                self.park(task.clone(), i, v)?;
                return Ok(None);
            }
            if let Flow::Return(v) = self.exec_stmt(stmt)? {
                return Ok(Some(v));
            }
            i += 1;
        }
        Ok(Some(Value::Undefined))
    }

    /// Finish the statement that parked on an await, given the awaited value.
    fn complete_await(&mut self, stmt: &Stmt, v: Value) -> R<Flow> {
        match stmt {
            Stmt::Return(_) => return Ok(Flow::Return(v)),
            Stmt::Expr(Expr::Assign { target, .. }) => self.write_target(target, v)?,
            Stmt::Decl(kind, decls) => {
                let mode = match kind {
                    DeclKind::Var => BindMode::Var,
                    DeclKind::Let => BindMode::Let,
                    DeclKind::Const => BindMode::Const,
                };
                if let Some((pattern, _)) = decls.first() {
                    self.bind_pattern(pattern, v, mode)?;
                }
            }
            _ => {}
        }
        Ok(Flow::Normal)
    }

    fn park(&mut self, task: AsyncTask, index: usize, v: Value) -> R<()> {
        let p = self.promise_resolve(v)?;
        self.add_reaction(p, Reaction::Resume { task, index });
        Ok(())
    }

    fn settle_async(&mut self, promise: ObjId, res: R<Value>) -> R<()> {
        match res {
            Err(ScriptError::Suspended) => Ok(()),
            Err(ScriptError::StepLimit) => Err(ScriptError::StepLimit),
            res => self.settle_from(promise, res),
        }
    }

    /// An await that cannot park: run queued work until `v` settles.
    pub(super) fn await_now(&mut self, v: Value) -> R<Value> {
        let p = self.promise_resolve(v)?;
        if let ObjKind::Promise(data) = &mut self.heap[p].kind {
            data.handled = true;
        }
        self.unhandled.retain(|u| *u != p);
        let mut timer_runs = 0;
        loop {
            match &self.heap[p].kind {
                ObjKind::Promise(PromiseData { state: PromiseState::Fulfilled(v), .. }) => return Ok(v.clone()),
                ObjKind::Promise(PromiseData { state: PromiseState::Rejected(r), .. }) => {
                    let r = r.clone();
                    return Err(self.throw_value(r));
                }
                _ => {}
            }
            let res = if let Some(job) = self.microtasks.pop_front() {
                self.tick()?;
                self.run_job(job)
            } else {
                timer_runs += 1;
                match self.take_due_timer(f64::INFINITY) {
                    Some(timer) if timer_runs <= MAX_TIMER_RUNS => self.fire_timer(timer).map(|_| ()),
                    _ => return Err(ScriptError::Suspended),
                }
            };
            match res {
                Ok(()) | Err(ScriptError::Suspended) => {}
                Err(ScriptError::StepLimit) => return Err(ScriptError::StepLimit),
                Err(err) => warn!(target: "sandbox", error = %err, "queued callback failed during await"),
            }
        }
    }

    // --- Natives ---

    pub(super) fn promise_native(&mut self, name: &str, args: Vec<Value>, construct: bool) -> R<Value> {
        let a0 = arg(&args, 0);
        match name {
            "Promise" => {
                if !construct {
                    return Err(type_err("Promise constructor cannot be invoked without 'new'"));
                }
                if !self.is_callable(&a0) {
                    return Err(type_err(format!("Promise resolver {} is not a function", self.display(&a0))));
                }
                let p = self.new_promise();
                let (resolve, reject) = self.resolvers(p);
                if let Err(err) = self.call(&a0, Value::Undefined, vec![resolve, reject.clone()]) {
                    let reason = self.error_to_value(err)?;
                    self.call(&reject, Value::Undefined, vec![reason])?;
                }
                Ok(Value::Obj(p))
            }
            "Promise.resolve" => self.promise_resolve(a0).map(Value::Obj),
            "Promise.reject" => {
                let p = self.new_promise();
                self.reject_promise(p, a0);
                Ok(Value::Obj(p))
            }
            "Promise.all" => self.combinator_start(CombineMode::All, &a0),
            "Promise.allSettled" => self.combinator_start(CombineMode::AllSettled, &a0),
            "Promise.any" => self.combinator_start(CombineMode::Any, &a0),
            "Promise.race" => self.combinator_start(CombineMode::Race, &a0),
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    pub(super) fn promise_method(&mut self, p: ObjId, name: &str, args: &[Value]) -> R<Value> {
        Ok(match name {
            "then" => self.promise_then(p, arg(args, 0), arg(args, 1)),
            "catch" => self.promise_then(p, Value::Undefined, arg(args, 0)),
            _ => {
                let derived = self.new_promise();
                self.add_reaction(p, Reaction::Finally { callback: arg(args, 0), derived });
                Value::Obj(derived)
            }
        })
    }
}
