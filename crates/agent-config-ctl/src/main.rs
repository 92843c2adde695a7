// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, io, process, sync::Arc};

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use agent_config_core::{
    AgentConnection, AgentServer, AgentToServer, ChannelConnection, ConfigError, ConfigManager,
    ControlPlaneConfig, LogPipelines, LogPipelinesController, PostablePipelines, ServerOptions,
    Store,
};

/// Outbound messages buffered for the stdout writer.
const OUTBOUND_CAPACITY: usize = 64;

/// Interval between idle agent sweeps while serving.
const EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Manage versioned log pipeline configuration for collector agents
#[derive(Debug, Parser)]
#[command(name = "agent-config-ctl", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Command {
    /// Save a new log pipelines version
    Apply {
        /// JSON file holding the pipelines to submit
        path: PathBuf,
    },

    /// Print every version, newest first
    History,

    /// Print the pipelines of one version
    Show {
        /// Version number as listed by `history`
        version: u64,
    },

    /// Exchange JSON-lines agent messages over stdin/stdout
    Serve,
}

#[derive(Debug, Error)]
enum CtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
pub async fn main() {
    let cli = Cli::parse();

    let config = match ControlPlaneConfig::from_os_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading agent config control plane configuration: {e}");
            process::exit(2);
        }
    };

    let env_filter = format!("sled=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run(config, cli.command).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(config: ControlPlaneConfig, command: Command) -> Result<(), CtlError> {
    let store = match &config.store_path {
        Some(path) => Store::open(path).map_err(ConfigError::from)?,
        None => {
            warn!("DD_AGENT_CONFIG_STORE_PATH is not set, versions are kept in memory only");
            Store::open_ephemeral().map_err(ConfigError::from)?
        }
    };
    let manager = Arc::new(ConfigManager::new(
        Arc::new(LogPipelines::new(config.validation_options())),
        store,
    ));
    let controller = LogPipelinesController::new(Arc::clone(&manager));

    match command {
        Command::Apply { path } => {
            let postable: PostablePipelines = serde_json::from_str(&fs::read_to_string(&path)?)?;
            let response = controller.apply_pipelines(postable).await?;
            print_json(&response)
        }
        Command::History => print_json(&manager.history().await?),
        Command::Show { version } => print_json(&controller.pipelines_by_version(version).await?),
        Command::Serve => serve(manager, ServerOptions::from(&config)).await,
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), CtlError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Reads one `AgentToServer` JSON document per stdin line and writes every
/// pushed `ServerToAgent` as one JSON line on stdout.
async fn serve(manager: Arc<ConfigManager>, options: ServerOptions) -> Result<(), CtlError> {
    let idle_timeout = options.agent_idle_timeout;
    let server = AgentServer::new(manager, options).await;
    let (channel, mut outbound) = ChannelConnection::new(OUTBOUND_CAPACITY);
    let connection: Arc<dyn AgentConnection> = Arc::new(channel);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode message for {}: {e}", message.instance_uid);
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = stdout.write_all(&line).await {
                error!("Failed to write to stdout: {e}");
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!("Failed to flush stdout: {e}");
                break;
            }
        }
    });

    let sweeper = idle_timeout.map(|max_idle| {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL.min(max_idle));
            loop {
                ticker.tick().await;
                server.evict_idle(max_idle).await;
            }
        })
    });

    info!("Serving agents over stdio");
    let mut seen = BTreeSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: AgentToServer = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed agent message: {e}");
                continue;
            }
        };
        seen.insert(message.instance_uid.clone());
        server.on_message(Arc::clone(&connection), message).await;
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    for uid in &seen {
        server.disconnect(uid).await;
    }
    drop(connection);
    if let Err(e) = writer.await {
        error!("stdout writer stopped unexpectedly: {e}");
    }
    debug!("stdin closed, {} agent(s) disconnected", seen.len());
    Ok(())
}
