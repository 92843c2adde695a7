// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Version/history manager for agent configuration features.
//!
//! The manager owns the append-only history of one feature. At most one
//! record is ever [`DeployStatus::Initiated`] and it is always the newest:
//! creating a version demotes a still-Initiated predecessor to
//! [`DeployStatus::Unknown`] in the same store transaction that appends the
//! new record. Writers (create, acknowledge, failure) hold the write side of
//! an `RwLock`; readers hold the read side and therefore never observe a
//! half-applied create.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::store::Store;
use crate::util::compute_sha256;

/// Rollout status of a version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    /// Pushed, awaiting an agent acknowledgment.
    Initiated,
    /// Acknowledged as applied by an agent.
    Deployed,
    /// Superseded before any acknowledgment. Terminal.
    Unknown,
}

/// One immutable compiled snapshot plus its deployment record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVersion {
    pub version: u64,
    pub element_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// SHA-256 of `last_config`.
    pub hash: String,
    pub deploy_status: DeployStatus,
    /// Last error reported by an agent for this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_result: Option<String>,
    /// Compiled configuration fragment.
    pub last_config: String,
    /// Feature elements (e.g. pipeline definitions) the fragment was compiled from.
    pub elements: Value,
}

/// A configuration feature managed through versions.
///
/// Implementations are pure: they validate and compile elements and merge
/// compiled bundles into agent configurations, but never touch the history.
pub trait AgentFeature: Send + Sync {
    /// Name the feature's versions are recorded under.
    fn element_type(&self) -> &'static str;

    /// Validates `elements` and compiles them into a configuration fragment.
    fn compile(&self, elements: &Value) -> Result<String, ConfigError>;

    /// Merges a compiled fragment into the configuration an agent reported.
    fn recommend(&self, effective: &str, bundle: &str) -> Result<String, ConfigError>;
}

/// Receives new versions after they are committed.
#[async_trait]
pub trait ConfigSubscriber: Send + Sync {
    async fn on_config_changed(&self, version: &ConfigVersion);
}

/// Owns the version history of a single [`AgentFeature`].
pub struct ConfigManager {
    feature: Arc<dyn AgentFeature>,
    store: Store,
    lock: RwLock<()>,
    subscribers: Mutex<Vec<Weak<dyn ConfigSubscriber>>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("element_type", &self.feature.element_type())
            .field("store", &self.store.path())
            .finish()
    }
}

impl ConfigManager {
    pub fn new(feature: Arc<dyn AgentFeature>, store: Store) -> Self {
        Self {
            feature,
            store,
            lock: RwLock::new(()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn feature(&self) -> &Arc<dyn AgentFeature> {
        &self.feature
    }

    pub fn element_type(&self) -> &'static str {
        self.feature.element_type()
    }

    /// Registers a subscriber notified after every committed version.
    pub async fn subscribe(&self, subscriber: Weak<dyn ConfigSubscriber>) {
        self.subscribers.lock().await.push(subscriber);
    }

    /// Validates, compiles and records a new version.
    ///
    /// The version is durable before this returns. Subscribers are notified
    /// afterwards, outside the history lock; a subscriber that fails to
    /// reach agents does not fail the call.
    pub async fn create_version(&self, elements: Value) -> Result<ConfigVersion, ConfigError> {
        let element_type = self.element_type();
        let last_config = self.feature.compile(&elements)?;
        let hash = compute_sha256(last_config.as_bytes());

        let version = {
            let _guard = self.lock.write().await;
            let previous = self.store.latest_version(element_type)?;
            let record = ConfigVersion {
                version: previous.as_ref().map_or(1, |prev| prev.version + 1),
                element_type: element_type.to_string(),
                created_at: OffsetDateTime::now_utc(),
                hash,
                deploy_status: DeployStatus::Initiated,
                deploy_result: None,
                last_config,
                elements,
            };
            if let Some(prev) = previous
                .as_ref()
                .filter(|prev| prev.deploy_status == DeployStatus::Initiated)
            {
                debug!(
                    "agent-config: version {} of {element_type} superseded before acknowledgment",
                    prev.version
                );
            }
            self.store
                .append_version(previous.map(|prev| prev.version), &record)?;
            record
        };

        info!(
            "agent-config: created {element_type} version {} (hash {})",
            version.version, version.hash
        );
        self.notify(&version).await;
        Ok(version)
    }

    /// Most recent version, if any.
    pub async fn latest(&self) -> Result<Option<ConfigVersion>, ConfigError> {
        let _guard = self.lock.read().await;
        Ok(self.store.latest_version(self.element_type())?)
    }

    /// Full history, newest first.
    pub async fn history(&self) -> Result<Vec<ConfigVersion>, ConfigError> {
        let _guard = self.lock.read().await;
        Ok(self.store.list_versions(self.element_type())?)
    }

    /// A specific version together with the full history, read atomically.
    pub async fn get_version(
        &self,
        version: u64,
    ) -> Result<(ConfigVersion, Vec<ConfigVersion>), ConfigError> {
        let _guard = self.lock.read().await;
        let found = self
            .store
            .get_version(self.element_type(), version)?
            .ok_or(ConfigError::VersionNotFound(version))?;
        let history = self.store.list_versions(self.element_type())?;
        Ok((found, history))
    }

    /// Marks the Initiated version carrying `hash` as Deployed.
    ///
    /// Returns whether a record changed. Unknown, superseded or already
    /// deployed hashes are a no-op.
    pub async fn on_acknowledgment(&self, hash: &str) -> Result<bool, ConfigError> {
        let _guard = self.lock.write().await;
        let Some(mut latest) = self.initiated_with_hash(hash)? else {
            debug!("agent-config: ignoring acknowledgment for hash {hash}");
            return Ok(false);
        };
        latest.deploy_status = DeployStatus::Deployed;
        self.store.update_version(&latest)?;
        info!(
            "agent-config: {} version {} deployed",
            latest.element_type, latest.version
        );
        Ok(true)
    }

    /// Records an agent's apply failure on the Initiated version carrying
    /// `hash`. The status itself is left untouched.
    pub async fn on_failure(&self, hash: &str, message: &str) -> Result<bool, ConfigError> {
        let _guard = self.lock.write().await;
        let Some(mut latest) = self.initiated_with_hash(hash)? else {
            debug!("agent-config: ignoring failure report for hash {hash}");
            return Ok(false);
        };
        latest.deploy_result = Some(message.to_string());
        self.store.update_version(&latest)?;
        warn!(
            "agent-config: {} version {} failed to apply: {message}",
            latest.element_type, latest.version
        );
        Ok(true)
    }

    /// Only the newest record can be Initiated, so there is nothing else to scan.
    fn initiated_with_hash(&self, hash: &str) -> Result<Option<ConfigVersion>, ConfigError> {
        Ok(self
            .store
            .latest_version(self.element_type())?
            .filter(|latest| latest.deploy_status == DeployStatus::Initiated && latest.hash == hash))
    }

    async fn notify(&self, version: &ConfigVersion) {
        let live: Vec<Arc<dyn ConfigSubscriber>> = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for subscriber in live {
            subscriber.on_config_changed(version).await;
        }
    }
}
