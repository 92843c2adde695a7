// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filter expression compiler.
//!
//! A pipeline filter is a flat list of attribute comparisons combined with a
//! single `AND`/`OR`. This module renders it into the collector's route
//! expression language, e.g.
//!
//! ```text
//! {"op": "AND", "items": [{"key": {"key": "method", "type": "tag"}, "op": "=", "value": "GET"}]}
//!   => attributes.method == "GET"
//! ```
//!
//! Every rendered expression is syntax-checked through the
//! [`ExpressionEvaluator`] capability before it is returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::expr::{BuiltinEvaluator, ExpressionEvaluator};

/// Namespace an attribute key lives in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKeyType {
    /// Log record attribute.
    Tag,
    /// Resource attribute.
    Resource,
    /// Top-level field of the record.
    #[default]
    #[serde(rename = "")]
    #[serde(other)]
    Unspecified,
}

/// Attribute referenced by a filter item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeKey {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub r#type: AttributeKeyType,
}

impl AttributeKey {
    pub fn tag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data_type: Some("string".to_string()),
            r#type: AttributeKeyType::Tag,
        }
    }

    pub fn resource(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data_type: Some("string".to_string()),
            r#type: AttributeKeyType::Resource,
        }
    }
}

/// A single comparison of an attribute against a literal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterItem {
    pub key: AttributeKey,
    #[serde(rename = "op")]
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

/// Comparisons combined by a single boolean combinator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(rename = "op", default)]
    pub operator: String,
    #[serde(default)]
    pub items: Vec<FilterItem>,
}

impl FilterSet {
    /// Combines `items` with `AND`.
    pub fn all(items: Vec<FilterItem>) -> Self {
        Self {
            operator: "AND".to_string(),
            items,
        }
    }

    /// Renders the filter with the built-in evaluator.
    pub fn to_expr(&self) -> Result<String, ConfigError> {
        compile_filter(self, &BuiltinEvaluator)
    }
}

/// Comparison operators accepted in filter items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEq,
    GreaterThan,
    GreaterThanOrEq,
    Contains,
    NotContains,
    Regex,
    NotRegex,
    In,
    NotIn,
    Exists,
    NotExists,
}

impl FilterOperator {
    /// Parses the wire spelling of an operator (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        let op = match value.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Self::Equal,
            "!=" => Self::NotEqual,
            "<" => Self::LessThan,
            "<=" => Self::LessThanOrEq,
            ">" => Self::GreaterThan,
            ">=" => Self::GreaterThanOrEq,
            "contains" | "like" => Self::Contains,
            "ncontains" | "nlike" => Self::NotContains,
            "regex" => Self::Regex,
            "nregex" => Self::NotRegex,
            "in" => Self::In,
            "nin" => Self::NotIn,
            "exists" => Self::Exists,
            "nexists" => Self::NotExists,
            _ => return None,
        };
        Some(op)
    }

    fn as_expr(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEq => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEq => ">=",
            Self::Contains => "contains",
            Self::NotContains => "not contains",
            Self::Regex => "matches",
            Self::NotRegex => "not matches",
            Self::In | Self::Exists => "in",
            Self::NotIn | Self::NotExists => "not in",
        }
    }
}

/// Renders `filter` into a route expression and checks it with `evaluator`.
///
/// An empty item list or an unknown combinator is a validation error; an
/// item that cannot be expressed is a compilation error.
pub fn compile_filter(
    filter: &FilterSet,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<String, ConfigError> {
    if filter.items.is_empty() {
        return Err(ConfigError::Validation(
            "filter must contain at least one item".to_string(),
        ));
    }
    let joiner = match filter.operator.trim().to_ascii_uppercase().as_str() {
        "AND" => " && ",
        "OR" => " || ",
        other => {
            return Err(ConfigError::Validation(format!(
                "unsupported filter combinator '{other}', expected AND or OR"
            )));
        }
    };

    let mut parts = Vec::with_capacity(filter.items.len());
    for (index, item) in filter.items.iter().enumerate() {
        let part = compile_item(item).map_err(|message| {
            ConfigError::Compilation(format!("filter item {index}: {message}"))
        })?;
        evaluator.check(&part).map_err(|err| {
            ConfigError::Compilation(format!("filter item {index} '{part}': {err}"))
        })?;
        parts.push(part);
    }

    let expr = parts.join(joiner);
    evaluator
        .check(&expr)
        .map_err(|err| ConfigError::Compilation(format!("filter '{expr}': {err}")))?;
    Ok(expr)
}

fn compile_item(item: &FilterItem) -> Result<String, String> {
    let operator = FilterOperator::parse(&item.operator)
        .ok_or_else(|| format!("operator '{}' not supported", item.operator))?;
    let key = item.key.key.trim();
    if key.is_empty() {
        return Err("attribute key must not be empty".to_string());
    }

    match operator {
        FilterOperator::Exists | FilterOperator::NotExists => {
            let Some(namespace) = namespace_of(item.key.r#type) else {
                let name = attribute_reference(&item.key)?;
                let cmp = if operator == FilterOperator::Exists {
                    "!="
                } else {
                    "=="
                };
                return Ok(format!("{name} {cmp} nil"));
            };
            Ok(format!(
                "{} {} {namespace}",
                quote(key),
                operator.as_expr()
            ))
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let values = match &item.value {
                Value::Array(values) => values.clone(),
                other => vec![other.clone()],
            };
            let literal = format_value(&Value::Array(values))?;
            let name = attribute_reference(&item.key)?;
            Ok(format!("{name} {} {literal}", operator.as_expr()))
        }
        _ => {
            let name = attribute_reference(&item.key)?;
            let literal = format_value(&item.value)?;
            Ok(format!("{name} {} {literal}", operator.as_expr()))
        }
    }
}

fn namespace_of(key_type: AttributeKeyType) -> Option<&'static str> {
    match key_type {
        AttributeKeyType::Tag => Some("attributes"),
        AttributeKeyType::Resource => Some("resource"),
        AttributeKeyType::Unspecified => None,
    }
}

/// Builds the namespace-qualified reference to an attribute.
///
/// Keys that are not plain identifiers (`http.method`) use bracket access so
/// the dots stay part of the key.
fn attribute_reference(key: &AttributeKey) -> Result<String, String> {
    let name = key.key.trim();
    match namespace_of(key.r#type) {
        Some(namespace) if is_identifier(name) => Ok(format!("{namespace}.{name}")),
        Some(namespace) => Ok(format!("{namespace}[{}]", quote(name))),
        None if name.split('.').all(is_identifier) => Ok(name.to_string()),
        None => Err(format!("'{name}' is not a valid field reference")),
    }
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(
            value,
            "and" | "or" | "not" | "in" | "contains" | "matches" | "true" | "false" | "nil"
        )
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            '\r' => quoted.push_str("\\r"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn format_value(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(quote(s)),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("nil".to_string()),
        Value::Array(items) => {
            let rendered = items
                .iter()
                .map(format_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("[{}]", rendered.join(", ")))
        }
        Value::Object(_) => Err("object values are not supported in filters".to_string()),
    }
}
