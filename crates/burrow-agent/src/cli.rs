//! CLI module for the burrow agent binary.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use burrow_crypto::SigningKeypair;

use crate::config::{load_agent_config, LoggingConfig};
use crate::node::{PeerEndpoint, StandaloneNode};
use crate::{Agent, AgentError};

/// Burrow agent CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "burrow-agent",
    version,
    about = "Expose a NAT-bound TCP service through a rendezvous server"
)]
pub struct AgentArgs {
    /// Config file path (toml/json).
    #[arg(short, long, default_value = "agent.toml")]
    pub config: PathBuf,

    /// Override the rendezvous server node id (hex).
    #[arg(long)]
    pub server_id: Option<String>,

    /// Override the rendezvous server endpoint (host:port).
    #[arg(long)]
    pub server: Option<String>,

    /// Override the upstream endpoint (host:port).
    #[arg(short, long)]
    pub upstream: Option<String>,

    /// Override the advertised domain name.
    #[arg(long)]
    pub domain: Option<String>,

    /// Override the maximum number of pooled sessions.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level override.
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Run the agent with the given CLI arguments.
pub async fn run(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_agent_config(&args.config)?;

    // Apply CLI overrides
    if let Some(server_id) = &args.server_id {
        config.agent.server_peer_id = server_id.clone();
    }
    if let Some(server) = &args.server {
        let (host, port) = split_endpoint(server)?;
        config.agent.server_host = Some(host);
        config.agent.server_port = Some(port);
    }
    if let Some(upstream) = &args.upstream {
        let (host, port) = split_endpoint(upstream)?;
        config.agent.upstream_host = host;
        config.agent.upstream_port = port;
    }
    if let Some(domain) = &args.domain {
        config.agent.domain_name = Some(domain.clone());
    }
    if let Some(max) = args.max_connections {
        config.agent.max_connections = max;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = Some(level.clone());
    }

    init_tracing(&config.logging);

    let keys = load_identity(config.agent.identity_file.as_deref())?;
    info!(node = %keys.id(), "node identity loaded");

    let server = match (&config.agent.server_host, config.agent.server_port) {
        (Some(host), Some(port)) => Some(PeerEndpoint {
            host: host.clone(),
            port,
        }),
        _ => None,
    };
    let node = Arc::new(StandaloneNode::new(keys, server));

    let agent = Agent::start(node, config).await?;
    info!(
        server = %agent.server_endpoint(),
        upstream = %agent.upstream_endpoint(),
        "agent running"
    );

    shutdown_signal_handler().await;
    info!("shutdown signal received");
    agent.stop().await?;
    Ok(())
}

/// Load the node identity seed, generating and saving one when the file
/// does not exist yet. Without a path the identity is ephemeral.
fn load_identity(path: Option<&Path>) -> Result<SigningKeypair, AgentError> {
    let Some(path) = path else {
        warn!("no identity_file configured, using an ephemeral node identity");
        return Ok(SigningKeypair::generate());
    };

    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read identity file: {e}")))?;
        let seed: [u8; 32] = hex::decode(content.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                AgentError::Config("identity file must hold 64 hex characters".into())
            })?;
        return Ok(SigningKeypair::from_seed(&seed));
    }

    let keys = SigningKeypair::generate();
    std::fs::write(path, hex::encode(keys.to_seed()))
        .map_err(|e| AgentError::Config(format!("failed to write identity file: {e}")))?;
    info!(path = %path.display(), "generated new node identity");
    Ok(keys)
}

fn split_endpoint(s: &str) -> Result<(String, u16), AgentError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AgentError::Config(format!("expected host:port, got {s:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| AgentError::Config(format!("invalid port in {s:?}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(config: &LoggingConfig) {
    let base_level = config.level.as_deref().unwrap_or("info");
    let mut filter_str = base_level.to_string();

    for (module, level) in &config.filters {
        filter_str.push(',');
        filter_str.push_str(module);
        filter_str.push('=');
        filter_str.push_str(level);
    }

    let filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new("info"));

    let format = config.format.as_deref().unwrap_or("pretty");
    let output = config.output.as_deref().unwrap_or("stderr");

    match (format, output) {
        ("json", "stdout") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stdout))
                .init();
        }
        ("json", _) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        ("compact", "stdout") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(io::stdout))
                .init();
        }
        ("compact", _) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
        (_, "stdout") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stdout))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}
