// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-agent bookkeeping of the protocol server.
//!
//! An agent is Connected from its first inbound message until it is
//! disconnected or evicted for idling. Absence from the registry is the
//! Unknown state.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;

use super::{AgentConfigMap, AgentConnection, AgentToServer, RemoteConfigStatuses};

/// Diagnostic view of a connected agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub instance_uid: String,
    /// Hash the agent last reported as applied.
    pub last_applied_hash: Option<String>,
    /// Hash of the last configuration delivered to the agent.
    pub last_sent_hash: Option<String>,
    pub last_status: Option<RemoteConfigStatuses>,
    /// Error message of the last failed apply.
    pub last_error: Option<String>,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
}

pub(super) struct AgentState {
    connection: Arc<dyn AgentConnection>,
    effective_config: Option<AgentConfigMap>,
    last_applied_hash: Option<String>,
    /// Hash from the most recent status report of any kind.
    reported_hash: Option<String>,
    last_sent_hash: Option<String>,
    last_status: Option<RemoteConfigStatuses>,
    last_error: Option<String>,
    first_seen: OffsetDateTime,
    last_seen: OffsetDateTime,
}

impl AgentState {
    fn new(connection: Arc<dyn AgentConnection>, now: OffsetDateTime) -> Self {
        Self {
            connection,
            effective_config: None,
            last_applied_hash: None,
            reported_hash: None,
            last_sent_hash: None,
            last_status: None,
            last_error: None,
            first_seen: now,
            last_seen: now,
        }
    }

    fn snapshot(&self, instance_uid: &str) -> AgentSnapshot {
        AgentSnapshot {
            instance_uid: instance_uid.to_string(),
            last_applied_hash: self.last_applied_hash.clone(),
            last_sent_hash: self.last_sent_hash.clone(),
            last_status: self.last_status,
            last_error: self.last_error.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Outcome of recording an inbound message.
pub(super) struct Registration {
    /// First message on this connection.
    pub(super) is_new: bool,
    /// Hash the agent is believed to hold.
    pub(super) known_hash: Option<String>,
    pub(super) connection: Arc<dyn AgentConnection>,
    pub(super) effective_config: Option<AgentConfigMap>,
}

/// A connected agent a broadcast should reach.
pub(super) struct PushTarget {
    pub(super) instance_uid: String,
    pub(super) connection: Arc<dyn AgentConnection>,
    pub(super) effective_config: Option<AgentConfigMap>,
}

#[derive(Default)]
pub(super) struct AgentRegistry {
    agents: HashMap<String, AgentState>,
}

impl AgentRegistry {
    /// Records `message` and returns what the server needs to decide on a push.
    ///
    /// A status carrying a hash is authoritative for what the agent holds.
    /// Without one, the last delivered hash is assumed to be held.
    pub(super) fn register(
        &mut self,
        connection: Arc<dyn AgentConnection>,
        message: &AgentToServer,
    ) -> Registration {
        let now = OffsetDateTime::now_utc();
        let mut is_new = false;
        let state = match self.agents.entry(message.instance_uid.clone()) {
            Entry::Occupied(mut entry) => {
                if !Arc::ptr_eq(&entry.get().connection, &connection) {
                    // Same agent on a fresh connection: start over.
                    entry.insert(AgentState::new(connection, now));
                    is_new = true;
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                is_new = true;
                entry.insert(AgentState::new(connection, now))
            }
        };

        state.last_seen = now;
        if let Some(effective) = &message.effective_config {
            state.effective_config = Some(effective.config_map.clone());
        }

        let mut reported = None;
        if let Some(status) = &message.remote_config_status {
            state.last_status = Some(status.status);
            let hash = Some(status.last_remote_config_hash.clone()).filter(|h| !h.is_empty());
            match status.status {
                RemoteConfigStatuses::Applied => {
                    state.last_error = None;
                    if hash.is_some() {
                        state.last_applied_hash = hash.clone();
                    }
                }
                RemoteConfigStatuses::Failed => {
                    state.last_error = Some(status.error_message.clone());
                }
                RemoteConfigStatuses::Applying | RemoteConfigStatuses::Unset => {}
            }
            if status.status != RemoteConfigStatuses::Unset {
                reported = hash;
            }
        }

        let known_hash = reported
            .clone()
            .or_else(|| state.last_sent_hash.clone())
            .or_else(|| state.reported_hash.clone());
        if reported.is_some() {
            state.reported_hash = reported;
        }

        Registration {
            is_new,
            known_hash,
            connection: Arc::clone(&state.connection),
            effective_config: state.effective_config.clone(),
        }
    }

    /// Notes a successful delivery on the given connection.
    ///
    /// Ignored when the agent reconnected in the meantime.
    pub(super) fn record_sent(
        &mut self,
        instance_uid: &str,
        connection: &Arc<dyn AgentConnection>,
        hash: &str,
    ) {
        if let Some(state) = self.agents.get_mut(instance_uid) {
            if Arc::ptr_eq(&state.connection, connection) {
                state.last_sent_hash = Some(hash.to_string());
            }
        }
    }

    pub(super) fn remove(&mut self, instance_uid: &str) -> bool {
        self.agents.remove(instance_uid).is_some()
    }

    pub(super) fn targets(&self) -> Vec<PushTarget> {
        self.agents
            .iter()
            .map(|(uid, state)| PushTarget {
                instance_uid: uid.clone(),
                connection: Arc::clone(&state.connection),
                effective_config: state.effective_config.clone(),
            })
            .collect()
    }

    pub(super) fn snapshot(&self, instance_uid: &str) -> Option<AgentSnapshot> {
        self.agents
            .get(instance_uid)
            .map(|state| state.snapshot(instance_uid))
    }

    /// Snapshots of every agent, sorted by instance id.
    pub(super) fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<AgentSnapshot> = self
            .agents
            .iter()
            .map(|(uid, state)| state.snapshot(uid))
            .collect();
        snapshots.sort_by(|a, b| a.instance_uid.cmp(&b.instance_uid));
        snapshots
    }

    /// Removes agents last seen before `cutoff` and returns their uids.
    pub(super) fn evict_idle(&mut self, cutoff: OffsetDateTime) -> Vec<String> {
        let idle: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, state)| state.last_seen < cutoff)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in &idle {
            self.agents.remove(uid);
        }
        idle
    }

    pub(super) fn len(&self) -> usize {
        self.agents.len()
    }
}
