// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Submission and read surfaces for log pipelines.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::compiler::{compile_pipelines, LOGS_PIPELINE_PREFIX};
use super::{validate_pipelines, Pipeline, PostablePipelines, ValidationOptions, LOG_PIPELINES_ELEMENT_TYPE};
use crate::collector::merge_fragment;
use crate::error::ConfigError;
use crate::expr::{BuiltinEvaluator, ExpressionEvaluator};
use crate::history::{AgentFeature, ConfigManager, ConfigVersion};

/// The log pipelines [`AgentFeature`].
pub struct LogPipelines {
    options: ValidationOptions,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl LogPipelines {
    pub fn new(options: ValidationOptions) -> Self {
        Self::with_evaluator(options, Arc::new(BuiltinEvaluator))
    }

    pub fn with_evaluator(options: ValidationOptions, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { options, evaluator }
    }
}

impl Default for LogPipelines {
    fn default() -> Self {
        Self::new(ValidationOptions::default())
    }
}

impl AgentFeature for LogPipelines {
    fn element_type(&self) -> &'static str {
        LOG_PIPELINES_ELEMENT_TYPE
    }

    fn compile(&self, elements: &Value) -> Result<String, ConfigError> {
        let pipelines: Vec<Pipeline> = serde_json::from_value(elements.clone())
            .map_err(|err| ConfigError::Validation(format!("malformed pipelines: {err}")))?;
        validate_pipelines(&pipelines, &self.options)?;
        compile_pipelines(&pipelines, self.evaluator.as_ref())?.to_yaml()
    }

    fn recommend(&self, effective: &str, bundle: &str) -> Result<String, ConfigError> {
        merge_fragment(effective, bundle, LOGS_PIPELINE_PREFIX)
    }
}

/// Pipelines of one version together with the full history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelinesResponse {
    /// Version the pipelines belong to; absent when nothing was saved yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub pipelines: Vec<Pipeline>,
    pub history: Vec<ConfigVersion>,
}

/// Entry point of the API layer for log pipelines.
#[derive(Clone, Debug)]
pub struct LogPipelinesController {
    manager: Arc<ConfigManager>,
}

impl LogPipelinesController {
    pub fn new(manager: Arc<ConfigManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConfigManager> {
        &self.manager
    }

    /// Saves `postable` as a new version and pushes it to connected agents.
    ///
    /// Pipelines without an id get a fresh one. On error nothing is saved.
    pub async fn apply_pipelines(
        &self,
        postable: PostablePipelines,
    ) -> Result<PipelinesResponse, ConfigError> {
        let mut pipelines = postable.pipelines;
        for pipeline in pipelines.iter_mut().filter(|p| p.id.trim().is_empty()) {
            pipeline.id = Uuid::new_v4().to_string();
        }
        debug!(
            "agent-config: applying {} log pipelines",
            pipelines.len()
        );
        let created = self
            .manager
            .create_version(serde_json::to_value(&pipelines)?)
            .await?;
        let history = self.manager.history().await?;
        Ok(PipelinesResponse {
            version: Some(created.version),
            pipelines,
            history,
        })
    }

    /// Pipelines of the newest version, or none when nothing was saved.
    pub async fn latest_pipelines(&self) -> Result<PipelinesResponse, ConfigError> {
        let history = self.manager.history().await?;
        let Some(latest) = history.first() else {
            return Ok(PipelinesResponse::default());
        };
        Ok(PipelinesResponse {
            version: Some(latest.version),
            pipelines: decode_pipelines(latest)?,
            history,
        })
    }

    /// Pipelines of a specific version.
    pub async fn pipelines_by_version(&self, version: u64) -> Result<PipelinesResponse, ConfigError> {
        let (record, history) = self.manager.get_version(version).await?;
        Ok(PipelinesResponse {
            version: Some(record.version),
            pipelines: decode_pipelines(&record)?,
            history,
        })
    }
}

fn decode_pipelines(record: &ConfigVersion) -> Result<Vec<Pipeline>, ConfigError> {
    Ok(serde_json::from_value(record.elements.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DeployStatus;
    use crate::pipeline::tests::{add_op, pipeline};
    use crate::store::Store;

    fn controller() -> LogPipelinesController {
        let manager = ConfigManager::new(
            Arc::new(LogPipelines::default()),
            Store::open_ephemeral().unwrap(),
        );
        LogPipelinesController::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn empty_read_surface() {
        let response = controller().latest_pipelines().await.unwrap();
        assert_eq!(response, PipelinesResponse::default());
    }

    #[tokio::test]
    async fn apply_assigns_ids_and_records_history() {
        let controller = controller();
        let mut with_id = pipeline(2, "p2", vec![]);
        with_id.id = "fixed".to_string();
        let response = controller
            .apply_pipelines(PostablePipelines {
                pipelines: vec![pipeline(1, "p1", vec![add_op(1, "add", "attributes.a", "v")]), with_id],
            })
            .await
            .unwrap();

        assert_eq!(response.version, Some(1));
        assert!(Uuid::parse_str(&response.pipelines[0].id).is_ok());
        assert_eq!(response.pipelines[1].id, "fixed");
        assert_eq!(response.history.len(), 1);
        assert_eq!(response.history[0].deploy_status, DeployStatus::Initiated);

        let latest = controller.latest_pipelines().await.unwrap();
        assert_eq!(latest.pipelines, response.pipelines);
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_without_history() {
        let controller = controller();
        let err = controller
            .apply_pipelines(PostablePipelines {
                pipelines: vec![pipeline(0, "p1", vec![])],
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::BAD_REQUEST);
        assert!(controller.latest_pipelines().await.unwrap().history.is_empty());
    }

    #[tokio::test]
    async fn pipelines_by_version_reads_older_versions() {
        let controller = controller();
        controller
            .apply_pipelines(PostablePipelines {
                pipelines: vec![pipeline(1, "first", vec![])],
            })
            .await
            .unwrap();
        controller
            .apply_pipelines(PostablePipelines {
                pipelines: vec![pipeline(1, "second", vec![])],
            })
            .await
            .unwrap();

        let v1 = controller.pipelines_by_version(1).await.unwrap();
        assert_eq!(v1.pipelines[0].alias, "first");
        assert_eq!(v1.history.len(), 2);

        let err = controller.pipelines_by_version(7).await.unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn feature_compiles_to_fragment() {
        let feature = LogPipelines::default();
        let elements = serde_json::to_value(vec![pipeline(1, "p1", vec![])]).unwrap();
        let yaml = feature.compile(&elements).unwrap();
        assert!(yaml.contains("logstransform/pipeline_p1"));

        let malformed = feature.compile(&serde_json::json!({"not": "a list"}));
        assert!(matches!(malformed, Err(ConfigError::Validation(_))));
    }
}
