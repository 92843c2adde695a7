// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration for the control plane.
//!
//! Settings are read once at startup. `from_env_iter` exists so tests can
//! build a configuration without touching the process environment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::ValidationOptions;

/// Directory of the persistent version store. Unset means an ephemeral store.
const ENV_STORE_PATH: &str = "DD_AGENT_CONFIG_STORE_PATH";
/// Log level for the tracing subscriber.
const ENV_LOG_LEVEL: &str = "DD_LOG_LEVEL";
/// File name used for recommended configs when the agent reported none.
const ENV_CONFIG_FILE_NAME: &str = "DD_AGENT_CONFIG_FILE_NAME";
/// Toggles push-on-connect for agents seen for the first time.
const ENV_PUSH_ON_CONNECT: &str = "DD_AGENT_CONFIG_PUSH_ON_CONNECT";
/// Comma separated list of attribute namespaces operators may write to.
const ENV_ALLOWED_FIELD_NAMESPACES: &str = "DD_AGENT_CONFIG_ALLOWED_FIELD_NAMESPACES";
/// Seconds without a message after which an agent is forgotten. Unset or 0 keeps agents.
const ENV_AGENT_IDLE_TIMEOUT_SECS: &str = "DD_AGENT_CONFIG_AGENT_IDLE_TIMEOUT_SECS";

/// Default file name of the collector configuration pushed to agents.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "collector.yaml";
/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime configuration of the agent configuration control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    /// Location of the sled database. `None` keeps all versions in memory.
    pub store_path: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Name of the config file sent to agents that did not report one.
    pub config_file_name: String,
    /// Whether agents seen for the first time are sent the latest bundle.
    pub push_on_connect: bool,
    /// Attribute namespaces operator fields must resolve to.
    pub allowed_field_namespaces: Vec<String>,
    /// Silence after which an agent is evicted from the registry.
    pub agent_idle_timeout: Option<Duration>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            config_file_name: DEFAULT_CONFIG_FILE_NAME.to_string(),
            push_on_connect: true,
            allowed_field_namespaces: ValidationOptions::default().allowed_field_namespaces,
            agent_idle_timeout: None,
        }
    }
}

impl ControlPlaneConfig {
    /// Builds and validates the configuration from the process environment.
    pub fn from_os_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds and validates the configuration from key/value pairs.
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let defaults = Self::default();

        let store_path = map
            .get(ENV_STORE_PATH)
            .and_then(|value| sanitize_non_empty(value))
            .map(PathBuf::from);
        let log_level = map
            .get(ENV_LOG_LEVEL)
            .and_then(|value| sanitize_non_empty(value))
            .map(|value| value.to_lowercase())
            .unwrap_or(defaults.log_level);
        let config_file_name = map
            .get(ENV_CONFIG_FILE_NAME)
            .map(|value| value.trim().to_string())
            .unwrap_or(defaults.config_file_name);
        let push_on_connect = parse_bool(
            map.get(ENV_PUSH_ON_CONNECT).map(String::as_str),
            defaults.push_on_connect,
        );
        let allowed_field_namespaces = match map.get(ENV_ALLOWED_FIELD_NAMESPACES) {
            Some(raw) => raw
                .split(',')
                .filter_map(sanitize_non_empty)
                .collect(),
            None => defaults.allowed_field_namespaces,
        };
        let agent_idle_timeout = match map
            .get(ENV_AGENT_IDLE_TIMEOUT_SECS)
            .and_then(|value| sanitize_non_empty(value))
        {
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "{ENV_AGENT_IDLE_TIMEOUT_SECS} must be a number of seconds, got '{raw}'"
                    )))
                }
            },
            None => defaults.agent_idle_timeout,
        };

        let config = Self {
            store_path,
            log_level,
            config_file_name,
            push_on_connect,
            allowed_field_namespaces,
            agent_idle_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.config_file_name.is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "{ENV_CONFIG_FILE_NAME} cannot be empty"
            )));
        }
        if self.allowed_field_namespaces.is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "{ENV_ALLOWED_FIELD_NAMESPACES} must name at least one namespace"
            )));
        }
        Ok(())
    }

    /// Pipeline validation options derived from this configuration.
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            allowed_field_namespaces: self.allowed_field_namespaces.clone(),
        }
    }
}

/// Trims whitespace and discards empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}
