// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Expression evaluation capability for the collector filtering language.
//!
//! The collector evaluates route conditions written in a small expression
//! language (`attributes.method == "GET" && resource["k8s.ns"] in ["a"]`).
//! The control plane only needs two things from it: syntax-checking the
//! expressions it generates, and evaluating them in tests against a set of
//! variable bindings. Both are exposed through [`ExpressionEvaluator`] so a
//! different engine can be plugged in.
//!
//! The grammar lives in `grammars/route-expr.pest`.

#![allow(clippy::upper_case_acronyms)] // EOI from pest.

use pest::error::InputLocation;
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use regex::Regex;
use serde_json::{Map, Value};

/// Errors returned while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("invalid regex '{pattern}': {message}")]
    Regex { pattern: String, message: String },
}

/// Capability to check and evaluate filter expressions.
pub trait ExpressionEvaluator: Send + Sync {
    /// Fails if `expr` is not a valid expression.
    fn check(&self, expr: &str) -> Result<(), EvalError>;

    /// Evaluates `expr` with the given variable bindings.
    fn evaluate(&self, expr: &str, bindings: &Map<String, Value>) -> Result<Value, EvalError>;
}

/// Built-in evaluator for the subset of the language the filter compiler emits.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinEvaluator;

impl ExpressionEvaluator for BuiltinEvaluator {
    fn check(&self, expr: &str) -> Result<(), EvalError> {
        let ast = parse(expr)?;
        check_regex_literals(&ast)
    }

    fn evaluate(&self, expr: &str, bindings: &Map<String, Value>) -> Result<Value, EvalError> {
        let ast = parse(expr)?;
        eval(&ast, bindings)
    }
}

/// Parser generated from the route expression grammar.
#[derive(pest_derive::Parser)]
#[grammar = "../grammars/route-expr.pest"]
struct RouteExprParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Matches,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary {
        op: BinOp,
        negated: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

fn syntax(offset: usize, message: impl Into<String>) -> EvalError {
    EvalError::Syntax {
        offset,
        message: message.into(),
    }
}

fn unexpected(pair: &Pair<Rule>) -> EvalError {
    syntax(
        pair.as_span().start(),
        format!("unexpected {:?} '{}'", pair.as_rule(), pair.as_str()),
    )
}

fn parse(input: &str) -> Result<Expr, EvalError> {
    let mut pairs = RouteExprParser::parse(Rule::expression, input).map_err(|err| {
        let offset = match err.location {
            InputLocation::Pos(pos) => pos,
            InputLocation::Span((start, _)) => start,
        };
        syntax(offset, err.variant.message())
    })?;
    let or_expr = pairs
        .next()
        .and_then(|expression| expression.into_inner().next())
        .ok_or_else(|| syntax(0, "empty expression"))?;
    build_or(or_expr)
}

fn build_or(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    fold_binary(pair.into_inner(), Rule::and_expr, build_and, Expr::Or)
}

fn build_and(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    fold_binary(pair.into_inner(), Rule::unary, build_unary, Expr::And)
}

/// Left-folds the `operand` pairs of a combinator chain; keyword pairs are skipped.
fn fold_binary(
    pairs: Pairs<Rule>,
    operand_rule: Rule,
    build: fn(Pair<Rule>) -> Result<Expr, EvalError>,
    combine: fn(Box<Expr>, Box<Expr>) -> Expr,
) -> Result<Expr, EvalError> {
    let mut result: Option<Expr> = None;
    for pair in pairs.filter(|pair| pair.as_rule() == operand_rule) {
        let rhs = build(pair)?;
        result = Some(match result {
            Some(lhs) => combine(Box::new(lhs), Box::new(rhs)),
            None => rhs,
        });
    }
    result.ok_or_else(|| syntax(0, "missing operand"))
}

fn build_unary(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    let offset = pair.as_span().start();
    let mut negations = 0;
    let mut comparison = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::not_op => negations += 1,
            Rule::comparison => comparison = Some(build_comparison(inner)?),
            _ => return Err(unexpected(&inner)),
        }
    }
    let mut expr = comparison.ok_or_else(|| syntax(offset, "missing comparison"))?;
    for _ in 0..negations {
        expr = Expr::Not(Box::new(expr));
    }
    Ok(expr)
}

fn build_comparison(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    let offset = pair.as_span().start();
    let mut inner = pair.into_inner();
    let lhs = inner
        .next()
        .ok_or_else(|| syntax(offset, "missing operand"))
        .and_then(build_operand)?;
    let Some(op_pair) = inner.next() else {
        return Ok(lhs);
    };
    let (op, negated) = match op_pair.as_rule() {
        Rule::op_eq => (BinOp::Eq, false),
        Rule::op_ne => (BinOp::Ne, false),
        Rule::op_lt => (BinOp::Lt, false),
        Rule::op_le => (BinOp::Le, false),
        Rule::op_gt => (BinOp::Gt, false),
        Rule::op_ge => (BinOp::Ge, false),
        Rule::word_op => word_op(op_pair)?,
        _ => return Err(unexpected(&op_pair)),
    };
    let rhs = inner
        .next()
        .ok_or_else(|| syntax(offset, "missing right operand"))
        .and_then(build_operand)?;
    Ok(Expr::Binary {
        op,
        negated,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn word_op(pair: Pair<Rule>) -> Result<(BinOp, bool), EvalError> {
    let mut negated = false;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::negation => negated = true,
            Rule::kw_contains => return Ok((BinOp::Contains, negated)),
            Rule::kw_matches => return Ok((BinOp::Matches, negated)),
            Rule::kw_in => return Ok((BinOp::In, negated)),
            _ => return Err(unexpected(&inner)),
        }
    }
    Err(syntax(0, "missing operator keyword"))
}

fn build_operand(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    match pair.as_rule() {
        Rule::string => Ok(Expr::Literal(Value::String(unescape(&pair)))),
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(|number| Expr::Literal(number_value(number)))
            .map_err(|err| {
                syntax(
                    pair.as_span().start(),
                    format!("invalid number '{}': {err}", pair.as_str()),
                )
            }),
        Rule::kw_true => Ok(Expr::Literal(Value::Bool(true))),
        Rule::kw_false => Ok(Expr::Literal(Value::Bool(false))),
        Rule::kw_nil => Ok(Expr::Literal(Value::Null)),
        Rule::array => pair
            .into_inner()
            .map(build_or)
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Array),
        Rule::or_expr => build_or(pair),
        Rule::path => Ok(Expr::Path(
            pair.into_inner()
                .map(|segment| match segment.as_rule() {
                    Rule::string => unescape(&segment),
                    _ => segment.as_str().to_string(),
                })
                .collect(),
        )),
        _ => Err(unexpected(&pair)),
    }
}

/// Contents of a quoted string with backslash escapes resolved.
fn unescape(pair: &Pair<Rule>) -> String {
    let raw = pair
        .clone()
        .into_inner()
        .next()
        .map(|chars| chars.as_str())
        .unwrap_or_default();
    let mut value = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => value.push('\n'),
            Some('t') => value.push('\t'),
            Some('r') => value.push('\r'),
            Some(other) => value.push(other),
            None => {}
        }
    }
    value
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < (i64::MAX as f64) {
        Value::from(number as i64)
    } else {
        serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn check_regex_literals(expr: &Expr) -> Result<(), EvalError> {
    match expr {
        Expr::Binary {
            op: BinOp::Matches,
            rhs,
            lhs,
            ..
        } => {
            if let Expr::Literal(Value::String(pattern)) = rhs.as_ref() {
                compile_regex(pattern)?;
            }
            check_regex_literals(lhs)
        }
        Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            check_regex_literals(lhs)?;
            check_regex_literals(rhs)
        }
        Expr::Not(inner) => check_regex_literals(inner),
        Expr::Array(items) => items.iter().try_for_each(check_regex_literals),
        Expr::Literal(_) | Expr::Path(_) => Ok(()),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, EvalError> {
    Regex::new(pattern).map_err(|err| EvalError::Regex {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

fn eval(expr: &Expr, bindings: &Map<String, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(resolve_path(segments, bindings)),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, bindings)?)?)),
        Expr::And(lhs, rhs) => {
            if !truthy(&eval(lhs, bindings)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(rhs, bindings)?)?))
        }
        Expr::Or(lhs, rhs) => {
            if truthy(&eval(lhs, bindings)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(rhs, bindings)?)?))
        }
        Expr::Binary {
            op,
            negated,
            lhs,
            rhs,
        } => {
            let lhs = eval(lhs, bindings)?;
            let rhs = eval(rhs, bindings)?;
            let result = apply(*op, &lhs, &rhs)?;
            Ok(Value::Bool(result != *negated))
        }
    }
}

/// Missing members resolve to null instead of failing, so records lacking an
/// attribute simply do not match.
fn resolve_path(segments: &[String], bindings: &Map<String, Value>) -> Value {
    let Some((root, rest)) = segments.split_first() else {
        return Value::Null;
    };
    let mut current = match bindings.get(root) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        current = match current.get(segment.as_str()) {
            Some(value) => value,
            None => return Value::Null,
        };
    }
    current.clone()
}

fn truthy(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(EvalError::Type(format!("expected bool, got {other}"))),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) if lhs.is_number() && rhs.is_number() => a == b,
        _ => lhs == rhs,
    }
}

fn apply(op: BinOp, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    match op {
        BinOp::Eq => Ok(values_equal(lhs, rhs)),
        BinOp::Ne => Ok(!values_equal(lhs, rhs)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Null, _) | (_, Value::Null) => return Ok(false),
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                (a, b) => {
                    return Err(EvalError::Type(format!("cannot compare {a} with {b}")));
                }
            };
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            Ok(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinOp::Contains => match (lhs, rhs) {
            (Value::Null, _) => Ok(false),
            (Value::String(haystack), Value::String(needle)) => {
                Ok(haystack.contains(needle.as_str()))
            }
            (Value::Array(items), needle) => Ok(items.iter().any(|item| values_equal(item, needle))),
            (a, b) => Err(EvalError::Type(format!("{a} cannot contain {b}"))),
        },
        BinOp::Matches => match (lhs, rhs) {
            (Value::Null, _) => Ok(false),
            (Value::String(text), Value::String(pattern)) => {
                Ok(compile_regex(pattern)?.is_match(text))
            }
            (a, b) => Err(EvalError::Type(format!("cannot match {a} against {b}"))),
        },
        BinOp::In => match rhs {
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, lhs))),
            Value::Object(map) => match lhs {
                Value::String(key) => Ok(map.contains_key(key)),
                other => Err(EvalError::Type(format!("object keys are strings, got {other}"))),
            },
            Value::Null => Ok(false),
            other => Err(EvalError::Type(format!("'in' requires an array or map, got {other}"))),
        },
    }
}
