// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the agent configuration control plane.
//!
//! User-correctable failures (`Validation`, `Compilation`) never mutate state
//! and map to a 4xx response in the API layer. Agent-side misbehaviour is
//! modelled separately as [`ProtocolAnomaly`], which is only ever logged.

use http::StatusCode;

use crate::store::StoreError;

/// Errors returned by the version manager, the pipeline compiler and the
/// controller surfaces.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The submission is malformed (bad order ids, empty filter, disallowed field).
    #[error("invalid pipelines: {0}")]
    Validation(String),

    /// A filter or operator could not be translated into collector configuration.
    #[error("could not compile pipelines: {0}")]
    Compilation(String),

    /// The control plane's own settings are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested version does not exist in the history.
    #[error("config version {0} not found")]
    VersionNotFound(u64),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Returns the HTTP-equivalent status the API layer should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Compilation(_) => StatusCode::BAD_REQUEST,
            Self::VersionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidConfig(_) | Self::Store(_) | Self::Json(_) | Self::Yaml(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the caller can fix the error by changing the request.
    pub fn is_user_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Anomalies observed in messages from agents.
///
/// Agents are only partially trusted and may be stale or buggy, so none of
/// these ever fail the message that produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolAnomaly {
    #[error("agent {instance_uid} reported an applied config without a hash")]
    MissingHash { instance_uid: String },

    #[error("agent {instance_uid} acknowledged unknown or superseded hash {hash}")]
    UnmatchedHash { instance_uid: String, hash: String },

    #[error("agent {instance_uid} sent an unparseable effective config: {reason}")]
    UnparseableEffectiveConfig {
        instance_uid: String,
        reason: String,
    },

    #[error("agent {instance_uid} failed to apply config {hash}: {message}")]
    ApplyFailed {
        instance_uid: String,
        hash: String,
        message: String,
    },
}
