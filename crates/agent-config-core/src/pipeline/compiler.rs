// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compiles validated pipelines into a collector configuration fragment.
//!
//! Every enabled pipeline becomes one `logstransform` processor:
//!
//! ```text
//! logstransform/pipeline_<alias>:
//!   operators:
//!     - id: pipeline_router
//!       type: router
//!       routes: [{ output: <first op>, expr: <compiled filter> }]
//!       default: noop
//!     - <enabled operators in orderId order, chained by output>
//!     - id: noop
//!       type: noop
//! ```
//!
//! Records failing the filter go straight to `noop`, so none of the
//! pipeline's operators run for them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{OperatorType, Pipeline, PipelineOperator};
use crate::error::ConfigError;
use crate::expr::{BuiltinEvaluator, ExpressionEvaluator};
use crate::filter::compile_filter;

/// Marker prefix of every pipeline-owned processor name.
pub const LOGS_PIPELINE_PREFIX: &str = "logstransform/pipeline_";
/// Id of the routing operator heading each pipeline processor.
pub const ROUTER_OPERATOR_ID: &str = "pipeline_router";
/// Id of the terminal no-op operator.
pub const NOOP_OPERATOR_ID: &str = "noop";

/// One operator of a `logstransform` processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl OperatorConfig {
    fn bare(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            r#type: kind.to_string(),
            routes: Vec::new(),
            default: None,
            field: None,
            value: None,
            from: None,
            to: None,
            output: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub output: String,
    pub expr: String,
}

/// A single pipeline-owned processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub operators: Vec<OperatorConfig>,
}

impl ProcessorConfig {
    /// The filter expression of the routing operator, if present.
    #[cfg(test)]
    pub fn route_expr(&self) -> Option<&str> {
        self.operators
            .iter()
            .find(|op| op.id == ROUTER_OPERATOR_ID)
            .and_then(|op| op.routes.first())
            .map(|route| route.expr.as_str())
    }
}

/// Output of the pipeline compiler.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledBundle {
    /// Processor definitions keyed by processor name.
    pub processors: BTreeMap<String, ProcessorConfig>,
    /// Processor names in pipeline `orderId` order.
    pub processor_names: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Fragment {
    #[serde(default)]
    processors: BTreeMap<String, ProcessorConfig>,
    service: FragmentService,
}

#[derive(Serialize, Deserialize)]
struct FragmentService {
    pipelines: FragmentPipelines,
}

#[derive(Serialize, Deserialize)]
struct FragmentPipelines {
    logs: FragmentLogs,
}

#[derive(Serialize, Deserialize)]
struct FragmentLogs {
    #[serde(default)]
    processors: Vec<String>,
}

impl CompiledBundle {
    /// Serializes the bundle as a collector configuration fragment.
    ///
    /// Processors are keyed through a `BTreeMap`, so equal bundles always
    /// produce identical bytes and therefore identical hashes.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        let fragment = Fragment {
            processors: self.processors.clone(),
            service: FragmentService {
                pipelines: FragmentPipelines {
                    logs: FragmentLogs {
                        processors: self.processor_names.clone(),
                    },
                },
            },
        };
        Ok(serde_yaml::to_string(&fragment)?)
    }

    /// Parses a fragment produced by [`CompiledBundle::to_yaml`].
    #[cfg(test)]
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let fragment: Fragment = serde_yaml::from_str(yaml)?;
        Ok(Self {
            processors: fragment.processors,
            processor_names: fragment.service.pipelines.logs.processors,
        })
    }
}

/// Name of the processor compiled for `pipeline`.
pub fn collector_processor_name(pipeline: &Pipeline) -> String {
    format!("{LOGS_PIPELINE_PREFIX}{}", pipeline.alias)
}

/// Compiles `pipelines` with the built-in expression evaluator.
pub fn prepare_pipeline_processors(pipelines: &[Pipeline]) -> Result<CompiledBundle, ConfigError> {
    compile_pipelines(pipelines, &BuiltinEvaluator)
}

/// Compiles already validated pipelines. Disabled pipelines are skipped.
pub fn compile_pipelines(
    pipelines: &[Pipeline],
    evaluator: &dyn ExpressionEvaluator,
) -> Result<CompiledBundle, ConfigError> {
    let mut enabled: Vec<&Pipeline> = pipelines.iter().filter(|p| p.enabled).collect();
    enabled.sort_by_key(|p| p.order_id);

    let mut bundle = CompiledBundle::default();
    for pipeline in enabled {
        let name = collector_processor_name(pipeline);
        let expr = compile_filter(&pipeline.filter, evaluator).map_err(|err| match err {
            ConfigError::Validation(reason) => {
                ConfigError::Validation(format!("pipeline '{}': {reason}", pipeline.name))
            }
            ConfigError::Compilation(reason) => {
                ConfigError::Compilation(format!("pipeline '{}': {reason}", pipeline.name))
            }
            other => other,
        })?;
        let operators = operator_chain(pipeline, expr)?;
        bundle
            .processors
            .insert(name.clone(), ProcessorConfig { operators });
        bundle.processor_names.push(name);
    }
    Ok(bundle)
}

fn operator_chain(pipeline: &Pipeline, expr: String) -> Result<Vec<OperatorConfig>, ConfigError> {
    let mut ops: Vec<&PipelineOperator> = pipeline.config.iter().filter(|op| op.enabled).collect();
    ops.sort_by_key(|op| op.order_id);

    let first = ops
        .first()
        .map_or(NOOP_OPERATOR_ID.to_string(), |op| op.id.clone());
    let mut router = OperatorConfig::bare(ROUTER_OPERATOR_ID, "router");
    router.routes.push(Route {
        output: first,
        expr,
    });
    router.default = Some(NOOP_OPERATOR_ID.to_string());

    let mut chain = Vec::with_capacity(ops.len() + 2);
    chain.push(router);
    for (index, op) in ops.iter().enumerate() {
        let next = op.output.clone().unwrap_or_else(|| {
            ops.get(index + 1)
                .map_or(NOOP_OPERATOR_ID.to_string(), |next| next.id.clone())
        });
        chain.push(compile_operator(pipeline, op, next)?);
    }
    chain.push(OperatorConfig::bare(NOOP_OPERATOR_ID, "noop"));
    Ok(chain)
}

fn compile_operator(
    pipeline: &Pipeline,
    op: &PipelineOperator,
    output: String,
) -> Result<OperatorConfig, ConfigError> {
    let kind = OperatorType::parse(&op.r#type).ok_or_else(|| {
        ConfigError::Compilation(format!(
            "pipeline '{}': operator '{}' has unsupported type '{}'",
            pipeline.name, op.id, op.r#type
        ))
    })?;
    let mut compiled = OperatorConfig::bare(&op.id, kind.as_str());
    match kind {
        OperatorType::Add => {
            compiled.field = Some(op.field.clone());
            compiled.value = op.value.clone();
        }
        OperatorType::Remove => compiled.field = Some(op.field.clone()),
        OperatorType::Move | OperatorType::Copy => {
            compiled.from = op.from.clone();
            compiled.to = Some(op.field.clone());
        }
    }
    compiled.output = Some(output);
    Ok(compiled)
}
