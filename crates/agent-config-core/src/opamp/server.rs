// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides, per inbound agent message, whether and what to push.
//!
//! For every message the server records the agent, forwards any status
//! report to the version manager, then compares the newest version's hash
//! with the hash the agent is known to hold. A mismatch, or the first
//! message on a connection, sends the newest bundle merged over the agent's
//! effective configuration.
//!
//! Pushes are fire-and-forget. A failed delivery leaves the agent's known
//! hash untouched so its next message triggers a resend.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::state::{AgentRegistry, AgentSnapshot};
use super::{
    AgentConfigFile, AgentConfigMap, AgentConnection, AgentRemoteConfig, AgentToServer,
    RemoteConfigStatus, RemoteConfigStatuses, ServerToAgent,
};
use crate::config::{ControlPlaneConfig, DEFAULT_CONFIG_FILE_NAME};
use crate::error::{ConfigError, ProtocolAnomaly};
use crate::history::{ConfigManager, ConfigSubscriber, ConfigVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// File name used when the agent reported no configuration file.
    pub config_file_name: String,
    /// Always push to agents on their first message.
    pub push_on_connect: bool,
    /// Silence after which [`AgentServer::evict_idle`] forgets an agent.
    pub agent_idle_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            config_file_name: DEFAULT_CONFIG_FILE_NAME.to_string(),
            push_on_connect: true,
            agent_idle_timeout: None,
        }
    }
}

impl From<&ControlPlaneConfig> for ServerOptions {
    fn from(config: &ControlPlaneConfig) -> Self {
        Self {
            config_file_name: config.config_file_name.clone(),
            push_on_connect: config.push_on_connect,
            agent_idle_timeout: config.agent_idle_timeout,
        }
    }
}

/// Protocol server for one managed feature.
pub struct AgentServer {
    manager: Arc<ConfigManager>,
    options: ServerOptions,
    registry: Mutex<AgentRegistry>,
}

impl AgentServer {
    /// Creates the server and subscribes it to new versions of `manager`.
    pub async fn new(manager: Arc<ConfigManager>, options: ServerOptions) -> Arc<Self> {
        let server = Arc::new(Self {
            manager: Arc::clone(&manager),
            options,
            registry: Mutex::new(AgentRegistry::default()),
        });
        let subscriber: Weak<dyn ConfigSubscriber> = Arc::downgrade(&server) as _;
        manager.subscribe(subscriber).await;
        server
    }

    /// Handles one inbound message from the agent behind `connection`.
    ///
    /// A returned message has already been delivered through `connection`.
    /// `None` means nothing needed sending or delivery failed.
    pub async fn on_message(
        &self,
        connection: Arc<dyn AgentConnection>,
        message: AgentToServer,
    ) -> Option<ServerToAgent> {
        if message.instance_uid.is_empty() {
            warn!("opamp: dropping message without instance uid");
            return None;
        }
        let uid = message.instance_uid.as_str();

        let registration = self.registry.lock().await.register(connection, &message);
        if registration.is_new {
            info!("opamp: agent {uid} connected");
        }
        if let Some(status) = &message.remote_config_status {
            self.handle_status(uid, status).await;
        }

        let latest = match self.manager.latest().await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                debug!("opamp: no configuration version yet, nothing to send to {uid}");
                return None;
            }
            Err(err) => {
                error!("opamp: failed to read latest configuration for {uid}: {err}");
                return None;
            }
        };

        let force = registration.is_new && self.options.push_on_connect;
        if !force && registration.known_hash.as_deref() == Some(latest.hash.as_str()) {
            debug!("opamp: agent {uid} already holds {}", latest.hash);
            return None;
        }

        self.push(
            uid,
            &registration.connection,
            registration.effective_config.as_ref(),
            &latest,
        )
        .await
    }

    /// Forgets an agent. Returns whether it was known.
    pub async fn disconnect(&self, instance_uid: &str) -> bool {
        let removed = self.registry.lock().await.remove(instance_uid);
        if removed {
            info!("opamp: agent {instance_uid} disconnected");
        }
        removed
    }

    /// Forgets agents that sent nothing for longer than `max_idle`.
    /// Returns how many were evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = time::Duration::try_from(max_idle)
            .ok()
            .and_then(|idle| OffsetDateTime::now_utc().checked_sub(idle))
        else {
            return 0;
        };
        let mut registry = self.registry.lock().await;
        let evicted = registry.evict_idle(cutoff);
        for uid in &evicted {
            info!("opamp: agent {uid} evicted after {max_idle:?} without messages");
        }
        if !evicted.is_empty() {
            debug!("opamp: {} agent(s) still connected", registry.len());
        }
        evicted.len()
    }

    /// Diagnostics for every connected agent, sorted by instance uid.
    pub async fn agents(&self) -> Vec<AgentSnapshot> {
        self.registry.lock().await.snapshots()
    }

    pub async fn agent(&self, instance_uid: &str) -> Option<AgentSnapshot> {
        self.registry.lock().await.snapshot(instance_uid)
    }

    /// Sends `version` to every connected agent. Returns how many deliveries succeeded.
    ///
    /// Notifications can arrive out of order, so a version that is no longer
    /// the newest is replaced by the newest one.
    pub async fn broadcast(&self, version: &ConfigVersion) -> usize {
        let newest = match self.manager.latest().await {
            Ok(Some(latest)) if latest.version > version.version => {
                debug!(
                    "opamp: version {} superseded by {}, broadcasting the newer one",
                    version.version, latest.version
                );
                Some(latest)
            }
            Ok(_) => None,
            Err(err) => {
                error!("opamp: failed to read latest configuration before broadcast: {err}");
                None
            }
        };
        let version = newest.as_ref().unwrap_or(version);

        let targets = self.registry.lock().await.targets();
        if targets.is_empty() {
            debug!(
                "opamp: no connected agents for version {}",
                version.version
            );
            return 0;
        }
        let mut delivered = 0;
        for target in targets {
            if self
                .push(
                    &target.instance_uid,
                    &target.connection,
                    target.effective_config.as_ref(),
                    version,
                )
                .await
                .is_some()
            {
                delivered += 1;
            }
        }
        debug!(
            "opamp: version {} delivered to {delivered} agent(s)",
            version.version
        );
        delivered
    }

    async fn handle_status(&self, uid: &str, status: &RemoteConfigStatus) {
        let hash = status.last_remote_config_hash.as_str();
        match status.status {
            RemoteConfigStatuses::Applied if hash.is_empty() => {
                let anomaly = ProtocolAnomaly::MissingHash {
                    instance_uid: uid.to_string(),
                };
                warn!("opamp: {anomaly}");
            }
            RemoteConfigStatuses::Applied => match self.manager.on_acknowledgment(hash).await {
                Ok(true) => {}
                Ok(false) => {
                    let anomaly = ProtocolAnomaly::UnmatchedHash {
                        instance_uid: uid.to_string(),
                        hash: hash.to_string(),
                    };
                    debug!("opamp: {anomaly}");
                }
                Err(err) => error!("opamp: failed to record acknowledgment from {uid}: {err}"),
            },
            RemoteConfigStatuses::Failed => {
                let anomaly = ProtocolAnomaly::ApplyFailed {
                    instance_uid: uid.to_string(),
                    hash: hash.to_string(),
                    message: status.error_message.clone(),
                };
                warn!("opamp: {anomaly}");
                if !hash.is_empty() {
                    if let Err(err) = self.manager.on_failure(hash, &status.error_message).await {
                        error!("opamp: failed to record apply failure from {uid}: {err}");
                    }
                }
            }
            RemoteConfigStatuses::Applying | RemoteConfigStatuses::Unset => {}
        }
    }

    async fn push(
        &self,
        uid: &str,
        connection: &Arc<dyn AgentConnection>,
        effective: Option<&AgentConfigMap>,
        version: &ConfigVersion,
    ) -> Option<ServerToAgent> {
        let config = match self.recommended_config(uid, effective, version) {
            Ok(config) => config,
            Err(err) => {
                error!(
                    "opamp: cannot build configuration for {uid} from version {}: {err}",
                    version.version
                );
                return None;
            }
        };
        let message = ServerToAgent {
            instance_uid: uid.to_string(),
            remote_config: Some(AgentRemoteConfig {
                config,
                config_hash: version.hash.clone(),
            }),
        };

        if let Err(err) = connection.send(message.clone()).await {
            warn!(
                "opamp: failed to deliver version {} to {uid}: {err}",
                version.version
            );
            return None;
        }
        self.registry
            .lock()
            .await
            .record_sent(uid, connection, &version.hash);
        debug!("opamp: sent version {} to {uid}", version.version);
        Some(message)
    }

    /// Merges the version's bundle over the agent's reported configuration.
    ///
    /// An unparseable report falls back to an empty baseline.
    fn recommended_config(
        &self,
        uid: &str,
        effective: Option<&AgentConfigMap>,
        version: &ConfigVersion,
    ) -> Result<AgentConfigMap, ConfigError> {
        let feature = self.manager.feature();
        let (file_name, baseline) = match effective.and_then(AgentConfigMap::primary) {
            Some((name, file)) => (name.clone(), file.body.as_str()),
            None => (self.options.config_file_name.clone(), ""),
        };
        let body = match feature.recommend(baseline, &version.last_config) {
            Ok(body) => body,
            Err(err) => {
                let anomaly = ProtocolAnomaly::UnparseableEffectiveConfig {
                    instance_uid: uid.to_string(),
                    reason: err.to_string(),
                };
                warn!("opamp: {anomaly}");
                feature.recommend("", &version.last_config)?
            }
        };
        Ok(AgentConfigMap::single(file_name, AgentConfigFile::yaml(body)))
    }
}

#[async_trait]
impl ConfigSubscriber for AgentServer {
    async fn on_config_changed(&self, version: &ConfigVersion) {
        self.broadcast(version).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opamp::{EffectiveConfig, RecordingConnection};
    use crate::pipeline::tests::{add_op, pipeline};
    use crate::pipeline::{LogPipelines, LogPipelinesController, PostablePipelines};
    use crate::store::Store;
    use tracing_test::traced_test;

    const BASELINE: &str = "receivers:\n  otlp: {}\nprocessors:\n  batch: {}\nservice:\n  pipelines:\n    logs:\n      receivers: [otlp]\n      processors: [batch]\n";

    struct Bed {
        controller: LogPipelinesController,
        server: Arc<AgentServer>,
    }

    async fn bed(options: ServerOptions) -> Bed {
        let manager = Arc::new(ConfigManager::new(
            Arc::new(LogPipelines::default()),
            Store::open_ephemeral().unwrap(),
        ));
        let server = AgentServer::new(Arc::clone(&manager), options).await;
        Bed {
            controller: LogPipelinesController::new(manager),
            server,
        }
    }

    fn hello(uid: &str) -> AgentToServer {
        AgentToServer {
            instance_uid: uid.to_string(),
            effective_config: Some(EffectiveConfig {
                config_map: AgentConfigMap::single("otel.yaml", AgentConfigFile::yaml(BASELINE)),
            }),
            remote_config_status: None,
        }
    }

    fn report(uid: &str, status: RemoteConfigStatuses, hash: &str, error: &str) -> AgentToServer {
        AgentToServer {
            instance_uid: uid.to_string(),
            effective_config: None,
            remote_config_status: Some(RemoteConfigStatus {
                status,
                last_remote_config_hash: hash.to_string(),
                error_message: error.to_string(),
            }),
        }
    }

    async fn save(bed: &Bed, alias: &str) -> ConfigVersion {
        let response = bed
            .controller
            .apply_pipelines(PostablePipelines {
                pipelines: vec![pipeline(1, alias, vec![add_op(1, "add", "attributes.x", "v")])],
            })
            .await
            .unwrap();
        response.history[0].clone()
    }

    #[tokio::test]
    async fn nothing_is_sent_before_first_version() {
        let bed = bed(ServerOptions::default()).await;
        let conn = Arc::new(RecordingConnection::new());
        assert!(bed.server.on_message(conn.clone(), hello("a1")).await.is_none());
        assert!(conn.messages().await.is_empty());
        assert_eq!(bed.server.agents().await.len(), 1);
    }

    #[tokio::test]
    async fn new_agent_receives_latest_merged_over_baseline() {
        let bed = bed(ServerOptions::default()).await;
        let version = save(&bed, "p1").await;

        let conn = Arc::new(RecordingConnection::new());
        let sent = bed.server.on_message(conn.clone(), hello("a1")).await.unwrap();
        assert_eq!(conn.last_message().await.as_ref(), Some(&sent));

        let remote = sent.remote_config.unwrap();
        assert_eq!(remote.config_hash, version.hash);
        let (name, file) = remote.config.primary().unwrap();
        assert_eq!(name, "otel.yaml");
        let merged: serde_yaml::Value = serde_yaml::from_str(&file.body).unwrap();
        assert_eq!(
            merged["service"]["pipelines"]["logs"]["processors"],
            serde_yaml::from_str::<serde_yaml::Value>("[batch, logstransform/pipeline_p1]").unwrap()
        );
        assert!(merged["receivers"]["otlp"].is_mapping());
    }

    #[tokio::test]
    async fn matching_hash_suppresses_push() {
        let bed = bed(ServerOptions::default()).await;
        let version = save(&bed, "p1").await;
        let conn = Arc::new(RecordingConnection::new());
        bed.server.on_message(conn.clone(), hello("a1")).await.unwrap();

        let ack = report("a1", RemoteConfigStatuses::Applied, &version.hash, "");
        assert!(bed.server.on_message(conn.clone(), ack).await.is_none());
        assert!(bed.server.on_message(conn.clone(), hello("a1")).await.is_none());
        assert_eq!(conn.messages().await.len(), 1);

        let snapshot = bed.server.agent("a1").await.unwrap();
        assert_eq!(snapshot.last_applied_hash.as_deref(), Some(version.hash.as_str()));
        assert_eq!(snapshot.last_sent_hash.as_deref(), Some(version.hash.as_str()));
    }

    #[tokio::test]
    async fn stale_acknowledgment_triggers_resend() {
        let bed = bed(ServerOptions::default()).await;
        let v1 = save(&bed, "p1").await;
        let conn = Arc::new(RecordingConnection::new());
        bed.server.on_message(conn.clone(), hello("a1")).await.unwrap();
        let v2 = save(&bed, "p2").await;
        assert_eq!(conn.messages().await.len(), 2);

        let late = report("a1", RemoteConfigStatuses::Applied, &v1.hash, "");
        let resent = bed.server.on_message(conn.clone(), late).await.unwrap();
        assert_eq!(resent.remote_config.unwrap().config_hash, v2.hash);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_on_next_message() {
        let bed = bed(ServerOptions::default()).await;
        save(&bed, "p1").await;
        let conn = Arc::new(RecordingConnection::new());
        conn.set_failing(true);
        assert!(bed.server.on_message(conn.clone(), hello("a1")).await.is_none());
        assert!(bed.server.agent("a1").await.unwrap().last_sent_hash.is_none());

        conn.set_failing(false);
        assert!(bed.server.on_message(conn.clone(), hello("a1")).await.is_some());
    }

    #[tokio::test]
    async fn push_on_connect_can_be_disabled() {
        let bed = bed(ServerOptions {
            push_on_connect: false,
            ..Default::default()
        })
        .await;
        let version = save(&bed, "p1").await;
        let conn = Arc::new(RecordingConnection::new());
        // A restarted agent already running the newest bundle is left alone.
        let restarted = report("a1", RemoteConfigStatuses::Applied, &version.hash, "");
        assert!(bed.server.on_message(conn.clone(), restarted).await.is_none());

        // With push-on-connect it is sent regardless.
        let bed = self::bed(ServerOptions::default()).await;
        let version = save(&bed, "p1").await;
        let restarted = report("a1", RemoteConfigStatuses::Applied, &version.hash, "");
        assert!(bed.server.on_message(conn, restarted).await.is_some());
    }

    #[tokio::test]
    async fn disconnect_forgets_agent() {
        let bed = bed(ServerOptions::default()).await;
        let conn = Arc::new(RecordingConnection::new());
        bed.server.on_message(conn.clone(), hello("a1")).await;
        assert!(bed.server.disconnect("a1").await);
        assert!(!bed.server.disconnect("a1").await);

        save(&bed, "p1").await;
        assert!(conn.messages().await.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_apply_is_recorded_and_not_resent() {
        let bed = bed(ServerOptions::default()).await;
        let version = save(&bed, "p1").await;
        let conn = Arc::new(RecordingConnection::new());
        bed.server.on_message(conn.clone(), hello("a1")).await.unwrap();

        let failed = report("a1", RemoteConfigStatuses::Failed, &version.hash, "unknown processor");
        assert!(bed.server.on_message(conn.clone(), failed).await.is_none());
        assert!(logs_contain("failed to apply config"));

        let latest = bed.controller.latest_pipelines().await.unwrap();
        assert_eq!(
            latest.history[0].deploy_result.as_deref(),
            Some("unknown processor")
        );
        let snapshot = bed.server.agent("a1").await.unwrap();
        assert_eq!(snapshot.last_error.as_deref(), Some("unknown processor"));
    }

    #[tokio::test]
    #[traced_test]
    async fn anomalies_are_tolerated() {
        let bed = bed(ServerOptions::default()).await;
        let version = save(&bed, "p1").await;
        let conn = Arc::new(RecordingConnection::new());

        let missing = report("a1", RemoteConfigStatuses::Applied, "", "");
        assert!(bed.server.on_message(conn.clone(), missing).await.is_some());
        assert!(logs_contain("without a hash"));

        let mut garbage = hello("a2");
        garbage.effective_config = Some(EffectiveConfig {
            config_map: AgentConfigMap::single("c.yaml", AgentConfigFile::yaml("- not\n- a map\n")),
        });
        let sent = bed.server.on_message(conn.clone(), garbage).await.unwrap();
        assert!(logs_contain("unparseable effective config"));
        assert_eq!(sent.remote_config.unwrap().config_hash, version.hash);

        let anonymous = AgentToServer::default();
        assert!(bed.server.on_message(conn, anonymous).await.is_none());
    }

    #[tokio::test]
    async fn idle_agents_are_evicted() {
        let bed = bed(ServerOptions::default()).await;
        let conn = Arc::new(RecordingConnection::new());
        bed.server.on_message(conn.clone(), hello("a1")).await;

        assert_eq!(bed.server.evict_idle(Duration::from_secs(3600)).await, 0);
        assert!(bed.server.agent("a1").await.is_some());

        std::thread::sleep(Duration::from_millis(20));
        bed.server.on_message(conn.clone(), hello("a2")).await;
        assert_eq!(bed.server.evict_idle(Duration::from_millis(10)).await, 1);
        assert!(bed.server.agent("a1").await.is_none());
        assert!(bed.server.agent("a2").await.is_some());

        // An evicted agent that speaks again is registered anew.
        bed.server.on_message(conn, hello("a1")).await;
        assert_eq!(bed.server.agents().await.len(), 2);
    }

    #[tokio::test]
    async fn late_notification_broadcasts_newest_version() {
        let bed = bed(ServerOptions::default()).await;
        let conn = Arc::new(RecordingConnection::new());
        bed.server.on_message(conn.clone(), hello("a1")).await;
        let v1 = save(&bed, "p1").await;
        let v2 = save(&bed, "p2").await;

        // v1's notification delivered after v2 was committed.
        bed.server.on_config_changed(&v1).await;

        let last = conn.last_message().await.unwrap();
        assert_eq!(last.remote_config.unwrap().config_hash, v2.hash);
        let snapshot = bed.server.agent("a1").await.unwrap();
        assert_eq!(snapshot.last_sent_hash.as_deref(), Some(v2.hash.as_str()));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_agent() {
        let bed = bed(ServerOptions::default()).await;
        let first = Arc::new(RecordingConnection::new());
        let second = Arc::new(RecordingConnection::new());
        bed.server.on_message(first.clone(), hello("a1")).await;
        bed.server.on_message(second.clone(), hello("a2")).await;

        let version = save(&bed, "p1").await;
        for conn in [&first, &second] {
            let last = conn.last_message().await.unwrap();
            assert_eq!(last.remote_config.unwrap().config_hash, version.hash);
        }
    }
}
