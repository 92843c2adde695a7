// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent management protocol: messages, connections and the server.
//!
//! Only the decision logic lives here. Framing, TLS and socket-level retries
//! belong to whichever transport implements [`AgentConnection`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

pub mod server;
pub mod state;

pub use server::{AgentServer, ServerOptions};
pub use state::AgentSnapshot;

/// Content type of YAML configuration files.
pub const YAML_CONTENT_TYPE: &str = "text/yaml";

/// One configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    pub body: String,
    pub content_type: String,
}

impl AgentConfigFile {
    pub fn yaml(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: YAML_CONTENT_TYPE.to_string(),
        }
    }
}

/// Configuration files keyed by file name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigMap {
    pub config_map: BTreeMap<String, AgentConfigFile>,
}

impl AgentConfigMap {
    pub fn single(name: impl Into<String>, file: AgentConfigFile) -> Self {
        Self {
            config_map: BTreeMap::from([(name.into(), file)]),
        }
    }

    /// The first file by name, which is the collector config for single-file agents.
    pub fn primary(&self) -> Option<(&String, &AgentConfigFile)> {
        self.config_map.iter().next()
    }
}

/// Configuration the agent is currently running with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub config_map: AgentConfigMap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteConfigStatuses {
    #[default]
    Unset,
    Applied,
    Applying,
    Failed,
}

/// Agent report about the last remote config it received.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfigStatus {
    pub status: RemoteConfigStatuses,
    /// Hash of the config the status refers to. Empty when unknown.
    #[serde(default)]
    pub last_remote_config_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Inbound message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToServer {
    pub instance_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_config: Option<EffectiveConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config_status: Option<RemoteConfigStatus>,
}

/// Recommended configuration and its hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRemoteConfig {
    pub config: AgentConfigMap,
    pub config_hash: String,
}

/// Outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToAgent {
    pub instance_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config: Option<AgentRemoteConfig>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("connection send buffer is full")]
    Full,
    #[error("transport error: {0}")]
    Transport(String),
}

/// A live connection to one agent.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Delivers `message` to the agent.
    async fn send(&self, message: ServerToAgent) -> Result<(), ConnectionError>;

    /// The most recently delivered message.
    async fn last_message(&self) -> Option<ServerToAgent>;
}

/// In-memory connection recording every delivered message.
#[derive(Debug, Default)]
pub struct RecordingConnection {
    messages: Mutex<Vec<ServerToAgent>>,
    failing: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All delivered messages, oldest first.
    pub async fn messages(&self) -> Vec<ServerToAgent> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl AgentConnection for RecordingConnection {
    async fn send(&self, message: ServerToAgent) -> Result<(), ConnectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("simulated failure".to_string()));
        }
        self.messages.lock().await.push(message);
        Ok(())
    }

    async fn last_message(&self) -> Option<ServerToAgent> {
        self.messages.lock().await.last().cloned()
    }
}

/// Connection forwarding messages into a bounded channel drained by the
/// transport task that owns the socket.
#[derive(Debug)]
pub struct ChannelConnection {
    tx: mpsc::Sender<ServerToAgent>,
    last: Mutex<Option<ServerToAgent>>,
}

impl ChannelConnection {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerToAgent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                last: Mutex::new(None),
            },
            rx,
        )
    }
}

#[async_trait]
impl AgentConnection for ChannelConnection {
    async fn send(&self, message: ServerToAgent) -> Result<(), ConnectionError> {
        // Never wait on a slow transport; the next inbound message re-syncs.
        self.tx
            .try_send(message.clone())
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ConnectionError::Full,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })?;
        *self.last.lock().await = Some(message);
        Ok(())
    }

    async fn last_message(&self) -> Option<ServerToAgent> {
        self.last.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(hash: &str) -> ServerToAgent {
        ServerToAgent {
            instance_uid: "agent".to_string(),
            remote_config: Some(AgentRemoteConfig {
                config: AgentConfigMap::single("collector.yaml", AgentConfigFile::yaml("a: 1\n")),
                config_hash: hash.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn recording_connection_remembers_messages() {
        let conn = RecordingConnection::new();
        assert!(conn.last_message().await.is_none());
        conn.send(message("h1")).await.unwrap();
        conn.send(message("h2")).await.unwrap();
        assert_eq!(conn.messages().await.len(), 2);
        assert_eq!(conn.last_message().await, Some(message("h2")));

        conn.set_failing(true);
        assert!(conn.send(message("h3")).await.is_err());
        assert_eq!(conn.last_message().await, Some(message("h2")));
    }

    #[tokio::test]
    async fn channel_connection_forwards_and_reports_backpressure() {
        let (conn, mut rx) = ChannelConnection::new(1);
        conn.send(message("h1")).await.unwrap();
        assert_eq!(conn.send(message("h2")).await, Err(ConnectionError::Full));
        assert_eq!(rx.recv().await, Some(message("h1")));
        assert_eq!(conn.last_message().await, Some(message("h1")));

        drop(rx);
        assert_eq!(conn.send(message("h3")).await, Err(ConnectionError::Closed));
    }

    #[test]
    fn inbound_message_decodes_with_defaults() {
        let msg: AgentToServer = serde_json::from_str(
            r#"{"instance_uid":"a1","remote_config_status":{"status":"APPLIED","last_remote_config_hash":"abc"}}"#,
        )
        .unwrap();
        assert!(msg.effective_config.is_none());
        let status = msg.remote_config_status.unwrap();
        assert_eq!(status.status, RemoteConfigStatuses::Applied);
        assert_eq!(status.last_remote_config_hash, "abc");
        assert!(status.error_message.is_empty());
    }

    #[test]
    fn primary_file_is_first_by_name() {
        let mut map = AgentConfigMap::single("b.yaml", AgentConfigFile::yaml("b"));
        map.config_map
            .insert("a.yaml".to_string(), AgentConfigFile::yaml("a"));
        assert_eq!(map.primary().map(|(name, _)| name.as_str()), Some("a.yaml"));
    }
}
