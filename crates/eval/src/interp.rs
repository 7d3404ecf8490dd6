//! Tree-walking evaluator over JSON values, bounded by a step budget.

use std::borrow::Cow;
use std::cmp::Ordering;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::parser::{BinaryOp, Expr, Quantifier, UnaryOp};

const FUNCTIONS: &[&str] = &["size", "int", "double", "string"];
const METHODS: &[&str] = &["size", "startsWith", "endsWith", "contains", "matches"];

type Eval<'e> = Result<Cow<'e, Value>, String>;

/// Variable bindings; comprehensions push a frame that points at its parent.
pub(crate) struct Scope<'e> {
    name: &'e str,
    value: &'e Value,
    parent: Option<&'e Scope<'e>>,
}

impl<'e> Scope<'e> {
    pub(crate) fn root(name: &'e str, value: &'e Value) -> Self {
        Self { name, value, parent: None }
    }

    fn lookup(&self, name: &str) -> Option<&'e Value> {
        let mut cur = Some(self);
        while let Some(s) = cur {
            if s.name == name {
                return Some(s.value);
            }
            cur = s.parent;
        }
        None
    }
}

/// Static checks run once at compile time: identifiers must be bound, functions
/// and methods must exist, and literal `matches` patterns are compiled up front.
pub(crate) fn check(expr: &Expr, bound: &mut Vec<String>, regexes: &mut FxHashMap<String, Regex>) -> Result<(), String> {
    match expr {
        Expr::Lit(_) => Ok(()),
        Expr::Ident(name) => {
            if bound.iter().any(|b| b == name) {
                Ok(())
            } else {
                Err(format!("undeclared reference to '{name}'"))
            }
        }
        Expr::List(items) => items.iter().try_for_each(|e| check(e, bound, regexes)),
        Expr::Select(e, _) | Expr::Has(e, _) | Expr::Unary(_, e) => check(e, bound, regexes),
        Expr::Index(a, b) | Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            check(a, bound, regexes)?;
            check(b, bound, regexes)
        }
        Expr::Cond(c, t, e) => {
            check(c, bound, regexes)?;
            check(t, bound, regexes)?;
            check(e, bound, regexes)
        }
        Expr::Call(name, args) => {
            if !FUNCTIONS.contains(&name.as_str()) {
                return Err(format!("unknown function '{name}'"));
            }
            args.iter().try_for_each(|e| check(e, bound, regexes))
        }
        Expr::Method(target, name, args) => {
            if !METHODS.contains(&name.as_str()) {
                return Err(format!("unknown method '{name}'"));
            }
            if let (true, [Expr::Lit(Value::String(pattern))]) = (name == "matches", args.as_slice()) {
                if !regexes.contains_key(pattern) {
                    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern {pattern:?}: {e}"))?;
                    regexes.insert(pattern.clone(), re);
                }
            }
            check(target, bound, regexes)?;
            args.iter().try_for_each(|e| check(e, bound, regexes))
        }
        Expr::Comprehension { range, var, predicate, .. } => {
            check(range, bound, regexes)?;
            bound.push(var.clone());
            let out = check(predicate, bound, regexes);
            bound.pop();
            out
        }
    }
}

pub(crate) struct Interp<'p> {
    regexes: &'p FxHashMap<String, Regex>,
    budget: usize,
    steps: usize,
}

impl<'p> Interp<'p> {
    pub(crate) fn new(regexes: &'p FxHashMap<String, Regex>, budget: usize) -> Self {
        Self { regexes, budget, steps: 0 }
    }

    pub(crate) fn steps(&self) -> usize {
        self.steps
    }

    fn tick(&mut self) -> Result<(), String> {
        self.steps += 1;
        if self.steps > self.budget {
            return Err(format!("evaluation exceeded the step budget of {}", self.budget));
        }
        Ok(())
    }

    pub(crate) fn eval_bool(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<bool, String> {
        match self.eval(expr, scope)?.as_ref() {
            Value::Bool(b) => Ok(*b),
            other => Err(format!("expected bool but found {}", type_name(other))),
        }
    }

    pub(crate) fn eval<'e>(&mut self, expr: &Expr, scope: &Scope<'e>) -> Eval<'e> {
        self.tick()?;
        match expr {
            Expr::Lit(v) => Ok(Cow::Owned(v.clone())),
            Expr::Ident(name) => scope.lookup(name).map(Cow::Borrowed).ok_or_else(|| format!("undeclared reference to '{name}'")),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?.into_owned());
                }
                Ok(Cow::Owned(Value::Array(out)))
            }
            Expr::Select(operand, field) => {
                let base = self.eval(operand, scope)?;
                project(base, |v| match v {
                    Value::Object(m) => m.get(field.as_str()).ok_or_else(|| format!("no such key: {field}")),
                    other => Err(format!("cannot select '{field}' from {}", type_name(other))),
                })
            }
            Expr::Index(operand, index) => {
                let base = self.eval(operand, scope)?;
                let key = self.eval(index, scope)?.into_owned();
                project(base, |v| index_value(v, &key))
            }
            Expr::Has(operand, field) => {
                let present = match self.resolve(operand, scope)? {
                    None => false,
                    Some(base) => match base.as_ref() {
                        Value::Object(m) => m.contains_key(field.as_str()),
                        Value::Null => false,
                        other => return Err(format!("has() cannot test '{field}' on {}", type_name(other))),
                    },
                };
                Ok(Cow::Owned(Value::Bool(present)))
            }
            Expr::Call(name, args) => self.call(name, args, scope),
            Expr::Method(target, name, args) => self.method(target, name, args, scope),
            Expr::Comprehension { quantifier, range, var, predicate } => {
                let range = self.eval(range, scope)?;
                let keys: Vec<Value>;
                let items: &[Value] = match range.as_ref() {
                    Value::Array(items) => items,
                    Value::Object(m) => {
                        keys = m.keys().map(|k| Value::String(k.clone())).collect();
                        &keys
                    }
                    other => return Err(format!("cannot iterate over {}", type_name(other))),
                };
                // exists() stops at the first true, all() at the first false.
                let want = *quantifier == Quantifier::All;
                for item in items {
                    let inner = Scope { name: var.as_str(), value: item, parent: Some(scope) };
                    if self.eval_bool(predicate, &inner)? != want {
                        return Ok(Cow::Owned(Value::Bool(!want)));
                    }
                }
                Ok(Cow::Owned(Value::Bool(want)))
            }
            Expr::Unary(UnaryOp::Not, operand) => Ok(Cow::Owned(Value::Bool(!self.eval_bool(operand, scope)?))),
            Expr::Unary(UnaryOp::Neg, operand) => {
                let v = self.eval(operand, scope)?;
                let out = match num(&v) {
                    Some(Num::Int(i)) => i.checked_neg().map(Value::from).ok_or_else(|| "integer overflow".to_string())?,
                    Some(Num::Float(f)) => Value::from(-f),
                    None => return Err(format!("cannot negate {}", type_name(&v))),
                };
                Ok(Cow::Owned(out))
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs, scope)?;
                let r = self.eval(rhs, scope)?;
                binary(*op, &l, &r).map(Cow::Owned)
            }
            Expr::And(lhs, rhs) => self.logic(lhs, rhs, scope, false),
            Expr::Or(lhs, rhs) => self.logic(lhs, rhs, scope, true),
            Expr::Cond(cond, then, otherwise) => {
                if self.eval_bool(cond, scope)? {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
        }
    }

    /// Like `eval`, but a missing key along a selection chain is `None`.
    fn resolve<'e>(&mut self, expr: &Expr, scope: &Scope<'e>) -> Result<Option<Cow<'e, Value>>, String> {
        let Expr::Select(operand, field) = expr else {
            return self.eval(expr, scope).map(Some);
        };
        self.tick()?;
        let Some(base) = self.resolve(operand, scope)? else {
            return Ok(None);
        };
        match base {
            Cow::Borrowed(Value::Object(m)) => Ok(m.get(field.as_str()).map(Cow::Borrowed)),
            Cow::Owned(Value::Object(mut m)) => Ok(m.remove(field.as_str()).map(Cow::Owned)),
            b if b.is_null() => Ok(None),
            b => Err(format!("cannot select '{field}' from {}", type_name(&b))),
        }
    }

    /// `&&` and `||` where a decisive operand wins over an error on the other side.
    fn logic<'e>(&mut self, lhs: &Expr, rhs: &Expr, scope: &Scope<'e>, decisive: bool) -> Eval<'e> {
        let l = self.eval_bool(lhs, scope);
        if l == Ok(decisive) {
            return Ok(Cow::Owned(Value::Bool(decisive)));
        }
        let r = self.eval_bool(rhs, scope);
        if r == Ok(decisive) {
            return Ok(Cow::Owned(Value::Bool(decisive)));
        }
        l?;
        r?;
        Ok(Cow::Owned(Value::Bool(!decisive)))
    }

    fn call<'e>(&mut self, name: &str, args: &[Expr], scope: &Scope<'e>) -> Eval<'e> {
        let [arg] = args else {
            return Err(format!("{name}() takes exactly one argument"));
        };
        let v = self.eval(arg, scope)?;
        let out = match name {
            "size" => size(&v)?,
            "int" => to_int(&v)?,
            "double" => match num(&v) {
                Some(n) => Value::from(n.as_f64()),
                None => match v.as_str().map(str::parse::<f64>) {
                    Some(Ok(f)) => Value::from(f),
                    _ => return Err(format!("cannot convert {} to double", type_name(&v))),
                },
            },
            "string" => match v.as_ref() {
                Value::String(s) => Value::String(s.clone()),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                other => return Err(format!("cannot convert {} to string", type_name(other))),
            },
            _ => return Err(format!("unknown function '{name}'")),
        };
        Ok(Cow::Owned(out))
    }

    fn method<'e>(&mut self, target: &Expr, name: &str, args: &[Expr], scope: &Scope<'e>) -> Eval<'e> {
        let recv = self.eval(target, scope)?;
        if name == "size" {
            if !args.is_empty() {
                return Err("size() takes no arguments".to_string());
            }
            return size(&recv).map(Cow::Owned);
        }
        let [arg] = args else {
            return Err(format!("{name}() takes exactly one argument"));
        };
        let arg = self.eval(arg, scope)?;
        let (Value::String(s), Value::String(p)) = (recv.as_ref(), arg.as_ref()) else {
            return Err(format!("{name}() needs strings, found {} and {}", type_name(&recv), type_name(&arg)));
        };
        let out = match name {
            "startsWith" => s.starts_with(p.as_str()),
            "endsWith" => s.ends_with(p.as_str()),
            "contains" => s.contains(p.as_str()),
            "matches" => match self.regexes.get(p) {
                Some(re) => re.is_match(s),
                None => Regex::new(p).map_err(|e| format!("invalid pattern {p:?}: {e}"))?.is_match(s),
            },
            _ => return Err(format!("unknown method '{name}'")),
        };
        Ok(Cow::Owned(Value::Bool(out)))
    }
}

fn project<'e>(base: Cow<'e, Value>, f: impl FnOnce(&Value) -> Result<&Value, String>) -> Eval<'e> {
    match base {
        Cow::Borrowed(v) => f(v).map(Cow::Borrowed),
        Cow::Owned(v) => f(&v).map(|x| Cow::Owned(x.clone())),
    }
}

fn index_value<'a>(v: &'a Value, key: &Value) -> Result<&'a Value, String> {
    match (v, key) {
        (Value::Array(items), Value::Number(_)) => {
            let i = key.as_i64().ok_or_else(|| format!("invalid list index {key}"))?;
            usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i))
                .ok_or_else(|| format!("index {i} out of range for list of size {}", items.len()))
        }
        (Value::Object(m), Value::String(k)) => m.get(k).ok_or_else(|| format!("no such key: {k}")),
        _ => Err(format!("cannot index {} with {}", type_name(v), type_name(key))),
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn num(v: &Value) -> Option<Num> {
    let Value::Number(n) = v else { return None };
    n.as_i64().map(Num::Int).or_else(|| n.as_f64().map(Num::Float))
}

pub(crate) fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::In => "in",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(l, r).ok_or_else(|| format!("no operator {} for {} and {}", symbol(op), type_name(l), type_name(r)))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::In => contains(r, l).map(Value::Bool),
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            _ => arith(op, l, r),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arith(op, l, r),
    }
}

fn arith(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, String> {
    let (Some(a), Some(b)) = (num(l), num(r)) else {
        return Err(format!("no operator {} for {} and {}", symbol(op), type_name(l), type_name(r)));
    };
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => {
            if b == 0 && matches!(op, BinaryOp::Div | BinaryOp::Rem) {
                return Err("division by zero".to_string());
            }
            let out = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => a.checked_div(b),
                _ => a.checked_rem(b),
            };
            out.map(Value::from).ok_or_else(|| "integer overflow".to_string())
        }
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            let out = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            Ok(Value::from(out))
        }
    }
}

/// Structural equality where ints and doubles compare numerically.
fn equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => match (num(l), num(r)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => l == r,
        },
        (Value::Array(a), Value::Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equal(x, y)),
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| equal(v, w)))
        }
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => match (num(l)?, num(r)?) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match (container, item) {
        (Value::Array(items), _) => Ok(items.iter().any(|x| equal(x, item))),
        (Value::Object(m), Value::String(k)) => Ok(m.contains_key(k)),
        _ => Err(format!("no operator in for {} and {}", type_name(item), type_name(container))),
    }
}

fn size(v: &Value) -> Result<Value, String> {
    let n = match v {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(m) => m.len(),
        other => return Err(format!("size() is undefined for {}", type_name(other))),
    };
    Ok(Value::from(n as i64))
}

fn to_int(v: &Value) -> Result<Value, String> {
    match (num(v), v) {
        (Some(Num::Int(i)), _) => Ok(Value::from(i)),
        (Some(Num::Float(f)), _) if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(Value::from(f.trunc() as i64)),
        (None, Value::String(s)) => s.trim().parse::<i64>().map(Value::from).map_err(|_| format!("cannot convert {s:?} to int")),
        _ => Err(format!("cannot convert {} to int", type_name(v))),
    }
}
