//! State evaluation: a small sandboxed boolean expression language over an
//! object's structural form, plus reconciliation-cycle boundary detection.
//!
//! Expressions see one variable, `object`, bound to the JSON form of the
//! object under test:
//!
//! ```text
//! has(object.status.phase) && object.status.phase == "Running"
//! ```
//!
//! Compilation checks size, nesting depth, identifiers, functions and literal
//! regex patterns. Evaluation is bounded by a step budget and must produce a
//! bool.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use kube::core::DynamicObject;
use kview_core::{Error, Result};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

mod cycle;
mod interp;
mod lexer;
mod parser;

pub use cycle::{find_cycle_start, latest_cycle_start};

use interp::{Interp, Scope};
use parser::{Expr, Parser};

/// Name of the variable bound to the evaluated object.
pub const OBJECT_VAR: &str = "object";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalLimits {
    pub step_budget: usize,
    pub max_expr_bytes: usize,
    pub max_depth: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self { step_budget: 10_000, max_expr_bytes: 4096, max_depth: 64 }
    }
}

impl EvalLimits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            step_budget: std::env::var("KVIEW_EVAL_STEP_BUDGET").ok().and_then(|s| s.parse().ok()).unwrap_or(d.step_budget),
            max_expr_bytes: std::env::var("KVIEW_EVAL_MAX_EXPR_BYTES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_expr_bytes),
            max_depth: d.max_depth,
        }
    }
}

/// A compiled expression.
#[derive(Debug)]
pub struct Program {
    source: String,
    expr: Expr,
    regexes: FxHashMap<String, Regex>,
    step_budget: usize,
}

impl Program {
    pub fn compile(source: &str, limits: &EvalLimits) -> Result<Self> {
        let fail = |message: String| Error::compile(source, message);
        if source.trim().is_empty() {
            return Err(fail("empty expression".to_string()));
        }
        if source.len() > limits.max_expr_bytes {
            return Err(fail(format!("expression is {} bytes, the limit is {}", source.len(), limits.max_expr_bytes)));
        }
        let tokens = lexer::tokenize(source).map_err(fail)?;
        let expr = Parser::new(tokens, source.len(), limits.max_depth).parse().map_err(fail)?;
        let mut regexes = FxHashMap::default();
        interp::check(&expr, &mut vec![OBJECT_VAR.to_string()], &mut regexes).map_err(fail)?;
        Ok(Self { source: source.to_string(), expr, regexes, step_budget: limits.step_budget })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the structural form of an object. Non-bool results are
    /// runtime errors.
    pub fn evaluate(&self, object: &Value) -> Result<bool> {
        let mut interp = Interp::new(&self.regexes, self.step_budget);
        let out = interp.eval_bool(&self.expr, &Scope::root(OBJECT_VAR, object));
        metrics::histogram!("eval_steps", interp.steps() as f64);
        out.map_err(|message| {
            metrics::counter!("eval_errors_total", 1u64, "stage" => "runtime");
            Error::runtime(&self.source, message)
        })
    }
}

/// Evaluates state expressions against objects, caching compiled programs by
/// source text. Safe to share between reconcile tasks.
#[derive(Debug, Default)]
pub struct StateEvaluator {
    limits: EvalLimits,
    programs: Mutex<FxHashMap<String, Arc<Program>>>,
}

impl StateEvaluator {
    pub fn new(limits: EvalLimits) -> Self {
        Self { limits, programs: Mutex::default() }
    }

    pub fn limits(&self) -> &EvalLimits {
        &self.limits
    }

    pub fn program(&self, expression: &str) -> Result<Arc<Program>> {
        if let Some(p) = self.programs.lock().unwrap_or_else(PoisonError::into_inner).get(expression) {
            return Ok(p.clone());
        }
        let program = Program::compile(expression, &self.limits).map_err(|e| {
            metrics::counter!("eval_errors_total", 1u64, "stage" => "compile");
            e
        })?;
        let program = Arc::new(program);
        debug!(expression, "compiled state expression");
        self.programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(expression.to_string(), program.clone());
        Ok(program)
    }

    /// Whether `object` is settled according to `expression`.
    pub fn evaluate(&self, object: &DynamicObject, expression: &str) -> Result<bool> {
        let program = self.program(expression)?;
        let value = serde_json::to_value(object)?;
        program.evaluate(&value)
    }
}
