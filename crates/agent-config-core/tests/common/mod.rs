// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test bed for log pipeline integration tests

#![allow(dead_code)]

pub mod helpers;

use std::sync::Arc;

use agent_config_core::{
    AgentConfigFile, AgentConfigMap, AgentServer, AgentToServer, ConfigManager, EffectiveConfig,
    LogPipelines, LogPipelinesController, PipelinesResponse, PostablePipelines,
    RecordingConnection, RemoteConfigStatus, RemoteConfigStatuses, ServerOptions, ServerToAgent,
    Store,
};

/// Collector configuration an agent reports on first contact.
pub const INITIAL_AGENT_CONFIG: &str = r#"receivers:
  otlp:
    protocols:
      grpc:
        endpoint: 0.0.0.0:4317
      http:
        endpoint: 0.0.0.0:4318
processors:
  batch:
    send_batch_size: 10000
    send_batch_max_size: 11000
    timeout: 10s
exporters:
  otlp:
    endpoint: otelcol2:4317
service:
  pipelines:
    logs:
      receivers: [otlp]
      processors: [batch]
      exporters: [otlp]
"#;

/// Control plane wired with an ephemeral store and one recorded agent.
pub struct LogPipelinesTestBed {
    pub controller: LogPipelinesController,
    pub server: Arc<AgentServer>,
    pub agent_uid: String,
    pub agent: Arc<RecordingConnection>,
}

impl LogPipelinesTestBed {
    /// Builds the control plane and connects one agent reporting [`INITIAL_AGENT_CONFIG`].
    pub async fn new() -> Self {
        let bed = Self::without_agents().await;
        bed.server
            .on_message(bed.agent.clone(), initial_message(&bed.agent_uid))
            .await;
        bed
    }

    /// Builds the control plane without any connected agent.
    pub async fn without_agents() -> Self {
        let manager = Arc::new(ConfigManager::new(
            Arc::new(LogPipelines::default()),
            Store::open_ephemeral().unwrap(),
        ));
        let server = AgentServer::new(Arc::clone(&manager), ServerOptions::default()).await;
        Self {
            controller: LogPipelinesController::new(manager),
            server,
            agent_uid: uuid::Uuid::new_v4().to_string(),
            agent: Arc::new(RecordingConnection::new()),
        }
    }

    pub async fn post_pipelines(&self, postable: PostablePipelines) -> PipelinesResponse {
        self.controller.apply_pipelines(postable).await.unwrap()
    }

    pub async fn get_pipelines(&self) -> PipelinesResponse {
        self.controller.latest_pipelines().await.unwrap()
    }

    /// Last message delivered to the bed's agent.
    pub async fn last_message(&self) -> ServerToAgent {
        self.agent
            .messages()
            .await
            .pop()
            .expect("no message was sent to the agent")
    }

    /// Acknowledges the last pushed configuration as applied.
    pub async fn simulate_ack_for_latest_config(&self) -> Option<ServerToAgent> {
        let last = self.last_message().await;
        let remote = last.remote_config.expect("last message carries no config");
        self.server
            .on_message(
                self.agent.clone(),
                AgentToServer {
                    instance_uid: self.agent_uid.clone(),
                    effective_config: Some(EffectiveConfig {
                        config_map: remote.config,
                    }),
                    remote_config_status: Some(RemoteConfigStatus {
                        status: RemoteConfigStatuses::Applied,
                        last_remote_config_hash: remote.config_hash,
                        error_message: String::new(),
                    }),
                },
            )
            .await
    }

    /// Connects a brand new agent and returns its connection.
    pub async fn connect_new_agent(&self) -> (String, Arc<RecordingConnection>) {
        let uid = uuid::Uuid::new_v4().to_string();
        let connection = Arc::new(RecordingConnection::new());
        self.server
            .on_message(connection.clone(), initial_message(&uid))
            .await;
        (uid, connection)
    }
}

pub fn initial_message(uid: &str) -> AgentToServer {
    AgentToServer {
        instance_uid: uid.to_string(),
        effective_config: Some(EffectiveConfig {
            config_map: AgentConfigMap::single(
                "otel-collector.yaml",
                AgentConfigFile::yaml(INITIAL_AGENT_CONFIG),
            ),
        }),
        remote_config_status: None,
    }
}
