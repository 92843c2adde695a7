// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log pipeline definitions and submission validation.
//!
//! A pipeline is an ordered, filterable chain of field-mutation operators.
//! [`validate_pipelines`] enforces everything the compiler relies on, so a
//! submission that passes validation only fails compilation on filters the
//! expression language cannot express.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::filter::FilterSet;

pub mod compiler;
pub mod controller;

pub use compiler::{
    collector_processor_name, compile_pipelines, prepare_pipeline_processors, CompiledBundle,
    OperatorConfig, ProcessorConfig, Route, LOGS_PIPELINE_PREFIX, NOOP_OPERATOR_ID, ROUTER_OPERATOR_ID,
};
pub use controller::{LogPipelines, LogPipelinesController, PipelinesResponse};

/// Element type under which log pipeline versions are recorded.
pub const LOG_PIPELINES_ELEMENT_TYPE: &str = "log_pipelines";

/// A single pipeline as submitted and as returned by the read surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Stable identifier, assigned on save when absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub order_id: i64,
    pub name: String,
    /// Source of the compiled processor name.
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub filter: FilterSet,
    /// Operators in the pipeline.
    #[serde(default)]
    pub config: Vec<PipelineOperator>,
}

/// Body of a pipelines submission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostablePipelines {
    pub pipelines: Vec<Pipeline>,
}

/// A field-mutation step inside a pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOperator {
    pub order_id: i64,
    pub id: String,
    pub r#type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Source field for `move` and `copy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub enabled: bool,
    /// Id of the operator to chain into. Defaults to the next one by order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Operator kinds the compiler knows how to emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorType {
    Add,
    Remove,
    Move,
    Copy,
}

impl OperatorType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "move" => Some(Self::Move),
            "copy" => Some(Self::Copy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Move => "move",
            Self::Copy => "copy",
        }
    }
}

/// Knobs for [`validate_pipelines`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Namespaces operator fields must live under, e.g. `attributes`.
    pub allowed_field_namespaces: Vec<String>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            allowed_field_namespaces: vec!["attributes".to_string(), "resource".to_string()],
        }
    }
}

/// Validates a full submission. Nothing is persisted when this fails.
pub fn validate_pipelines(
    pipelines: &[Pipeline],
    options: &ValidationOptions,
) -> Result<(), ConfigError> {
    let mut order_ids = HashSet::new();
    let mut aliases = HashSet::new();
    for pipeline in pipelines {
        if pipeline.order_id < 1 {
            return Err(ConfigError::Validation(format!(
                "pipeline '{}': orderId must be a positive integer, got {}",
                pipeline.name, pipeline.order_id
            )));
        }
        if !order_ids.insert(pipeline.order_id) {
            return Err(ConfigError::Validation(format!(
                "duplicate pipeline orderId {}",
                pipeline.order_id
            )));
        }
        if pipeline.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "pipeline with orderId {} has no name",
                pipeline.order_id
            )));
        }
        if !is_valid_alias(&pipeline.alias) {
            return Err(ConfigError::Validation(format!(
                "pipeline '{}': alias '{}' must be non-empty and contain only letters, digits, '_' or '-'",
                pipeline.name, pipeline.alias
            )));
        }
        if !aliases.insert(pipeline.alias.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate pipeline alias '{}'",
                pipeline.alias
            )));
        }
        if pipeline.filter.items.is_empty() {
            return Err(ConfigError::Validation(format!(
                "pipeline '{}': filter must contain at least one item",
                pipeline.name
            )));
        }
        validate_operators(pipeline, options)?;
    }
    Ok(())
}

fn validate_operators(pipeline: &Pipeline, options: &ValidationOptions) -> Result<(), ConfigError> {
    let invalid =
        |message: String| ConfigError::Validation(format!("pipeline '{}': {message}", pipeline.name));

    let mut order_ids = HashSet::new();
    let mut ids = HashSet::new();
    for op in &pipeline.config {
        if op.order_id < 1 {
            return Err(invalid(format!(
                "operator '{}': orderId must be a positive integer, got {}",
                op.id, op.order_id
            )));
        }
        if !order_ids.insert(op.order_id) {
            return Err(invalid(format!("duplicate operator orderId {}", op.order_id)));
        }
        if op.id.trim().is_empty() {
            return Err(invalid(format!(
                "operator with orderId {} has no id",
                op.order_id
            )));
        }
        if !ids.insert(op.id.as_str()) {
            return Err(invalid(format!("duplicate operator id '{}'", op.id)));
        }

        let Some(kind) = OperatorType::parse(&op.r#type) else {
            return Err(invalid(format!(
                "operator '{}': unsupported type '{}'",
                op.id, op.r#type
            )));
        };
        check_field(&op.field, options).map_err(|reason| {
            invalid(format!("operator '{}': field {reason}", op.id))
        })?;
        match kind {
            OperatorType::Add if op.value.is_none() => {
                return Err(invalid(format!("operator '{}': add requires a value", op.id)));
            }
            OperatorType::Move | OperatorType::Copy => {
                let from = op.from.as_deref().unwrap_or_default();
                check_field(from, options).map_err(|reason| {
                    invalid(format!("operator '{}': from {reason}", op.id))
                })?;
            }
            _ => {}
        }
    }

    let enabled: HashSet<&str> = pipeline
        .config
        .iter()
        .filter(|op| op.enabled)
        .map(|op| op.id.as_str())
        .collect();
    for op in pipeline.config.iter().filter(|op| op.enabled) {
        if let Some(output) = op.output.as_deref() {
            if output == op.id || !enabled.contains(output) {
                return Err(invalid(format!(
                    "operator '{}': output '{output}' is not another enabled operator of this pipeline",
                    op.id
                )));
            }
        }
    }
    check_chain_terminates(pipeline)
}

/// Rejects operator chains that loop. Each enabled operator continues at its
/// explicit output, else at the next operator by order.
fn check_chain_terminates(pipeline: &Pipeline) -> Result<(), ConfigError> {
    let mut ordered: Vec<&PipelineOperator> =
        pipeline.config.iter().filter(|op| op.enabled).collect();
    ordered.sort_by_key(|op| op.order_id);
    let next: HashMap<&str, Option<&str>> = ordered
        .iter()
        .enumerate()
        .map(|(index, op)| {
            let implicit = ordered.get(index + 1).map(|next| next.id.as_str());
            (op.id.as_str(), op.output.as_deref().or(implicit))
        })
        .collect();

    for start in &ordered {
        let mut visited = HashSet::new();
        let mut current = Some(start.id.as_str());
        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(ConfigError::Validation(format!(
                    "pipeline '{}': operator chain starting at '{}' loops back to '{id}'",
                    pipeline.name, start.id
                )));
            }
            current = next.get(id).copied().flatten();
        }
    }
    Ok(())
}

/// Checks that `field` is `<namespace>.<path>` with an allowed namespace.
fn check_field(field: &str, options: &ValidationOptions) -> Result<(), String> {
    let Some((namespace, path)) = field.split_once('.') else {
        return Err(format!("'{field}' must be of the form <namespace>.<name>"));
    };
    if path.is_empty() {
        return Err(format!("'{field}' names no attribute"));
    }
    if !options
        .allowed_field_namespaces
        .iter()
        .any(|allowed| allowed == namespace)
    {
        return Err(format!(
            "'{field}' is outside the allowed namespaces ({})",
            options.allowed_field_namespaces.join(", ")
        ));
    }
    Ok(())
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
