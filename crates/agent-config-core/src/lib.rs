// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Public entry points for the agent configuration control plane.
//!
//! Pipeline definitions are validated and compiled into a collector
//! configuration fragment, recorded as versions by the [`ConfigManager`],
//! and distributed to agents by the [`AgentServer`], which tracks rollout
//! through content-hash acknowledgments.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod collector;
pub mod config;
pub mod error;
pub mod expr;
pub mod filter;
pub mod history;
pub mod opamp;
pub mod pipeline;
pub mod store;
pub mod util;

pub use config::ControlPlaneConfig;
pub use error::{ConfigError, ProtocolAnomaly};
pub use expr::{BuiltinEvaluator, EvalError, ExpressionEvaluator};
pub use filter::{compile_filter, AttributeKey, AttributeKeyType, FilterItem, FilterOperator, FilterSet};
pub use history::{AgentFeature, ConfigManager, ConfigSubscriber, ConfigVersion, DeployStatus};
pub use opamp::{
    AgentConfigFile, AgentConfigMap, AgentConnection, AgentRemoteConfig, AgentServer,
    AgentSnapshot, AgentToServer, ChannelConnection, ConnectionError, EffectiveConfig,
    RecordingConnection, RemoteConfigStatus, RemoteConfigStatuses, ServerOptions, ServerToAgent,
};
pub use pipeline::{
    LogPipelines, LogPipelinesController, Pipeline, PipelineOperator, PipelinesResponse,
    PostablePipelines, ValidationOptions,
};
pub use store::{Store, StoreError};
