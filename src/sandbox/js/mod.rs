//! Embedded interpreter for the JavaScript that student DOM exercises use.
//!
//! A [`Realm`] owns one virtual document plus everything scripts can reach
//! from it: a heap of objects, scope chains, event listeners, a microtask
//! queue for promise jobs and a virtual timer queue. Execution is bounded by a
//! step budget, a call-depth limit and allocation caps, so runaway student
//! code ends in a [`ScriptError`] instead of hanging or exhausting memory.

mod ast;
mod builtins;
mod host;
mod interp;
mod lexer;
mod parser;
mod promise;
mod value;

use thiserror::Error;
use tracing::{debug, warn};

use super::dom::{Dom, DOCUMENT};
use interp::Interp;
pub use value::Value;

#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Reference(String),
    #[error("{0}")]
    Range(String),
    /// DOMException-style failure (`name` is e.g. `QuotaExceededError`).
    #[error("{message}")]
    Dom { name: &'static str, message: String },
    /// A value thrown by script code; `message` is set for Error instances.
    #[error("{}", .message.as_deref().unwrap_or("Unknown error"))]
    Thrown { value: Value, message: Option<String> },
    #[error("Script execution exceeded the step limit")]
    StepLimit,
    #[error("Maximum call stack size exceeded")]
    StackOverflow,
    /// An `await` whose promise can no longer settle. Unwinds the awaiting
    /// code without being catchable; the async function stays pending.
    #[error("await on a promise that never settles")]
    Suspended,
}

/// One isolated document with its script environment.
pub struct Realm {
    interp: Interp,
}

impl Realm {
    pub fn new(dom: Dom) -> Self {
        Self { interp: Interp::new(dom) }
    }

    /// Run every inline script in document order, then fire
    /// `DOMContentLoaded` and `load`. Failures are collected, never fatal.
    pub fn run_scripts(&mut self) -> Vec<ScriptError> {
        let mut errors = Vec::new();
        for (node, source) in self.interp.dom.inline_scripts() {
            if !is_javascript(self.interp.dom.attr(node, "type")) {
                continue;
            }
            if self.interp.dom.has_attr(node, "src") && source.trim().is_empty() {
                debug!(target: "sandbox", src = ?self.interp.dom.attr(node, "src"), "external script not fetched");
                continue;
            }
            if let Err(err) = self.interp.run_script(&source) {
                warn!(target: "sandbox", error = %err, "script failed");
                errors.push(err);
            }
            errors.extend(self.interp.run_microtasks());
        }
        errors.extend(self.interp.fire_lifecycle());
        errors
    }

    /// Advance the virtual clock by `ms`, running every timer that falls due
    /// and the microtasks each one queues.
    pub fn advance(&mut self, ms: f64) -> Vec<ScriptError> {
        let mut errors = self.interp.run_microtasks();
        errors.extend(self.interp.run_timers(ms));
        errors
    }

    /// Evaluate `return <code>` in a fresh scope that sees only `document`,
    /// `window` and the language builtins.
    pub fn eval_predicate(&mut self, code: &str) -> Result<bool, ScriptError> {
        self.interp.eval_predicate(code).map(|v| v.truthy())
    }

    /// Lines written through `console.*`.
    pub fn console(&self) -> &[String] {
        &self.interp.console
    }

    pub fn dom(&self) -> &Dom {
        &self.interp.dom
    }

    pub fn document_html(&self) -> String {
        self.interp.dom.inner_html(DOCUMENT)
    }
}

fn is_javascript(ty: Option<&str>) -> bool {
    match ty.map(|t| t.trim().to_ascii_lowercase()) {
        None => true,
        Some(t) => t.is_empty() || t == "module" || t.contains("javascript") || t.contains("ecmascript"),
    }
}

#[cfg(test)]
mod tests;
