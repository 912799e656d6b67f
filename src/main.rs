//! Entry point for the agentremote MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), builds the configured transport, starts the server, and
//! serves on stdin/stdout until the client disconnects or a termination
//! signal arrives.

use agentremote::config::{AuthMethodArg, Config};
use agentremote::server::AgentRemoteServer;
use agentremote::transport::local::LocalTransport;
use agentremote::transport::ssh::{SshAuth, SshConfig, SshTransport};
use agentremote::transport::Transport;
use anyhow::Result;
use rmcp::{transport::stdio, ServiceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

async fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    if config.local {
        return Ok(Arc::new(LocalTransport::new()));
    }

    let auth = match config.auth_method.as_ref().expect("validated by Config") {
        AuthMethodArg::Password => {
            SshAuth::Password(config.ssh_password.clone().expect("validated by Config"))
        }
        AuthMethodArg::Key => SshAuth::PrivateKeyPath(
            config.ssh_key_path.clone().expect("validated by Config"),
            config.ssh_key_passphrase.clone(),
        ),
        AuthMethodArg::Agent => {
            SshAuth::AgentSocket(config.ssh_agent_sock.clone().expect("validated by Config"))
        }
    };

    let ssh_config = SshConfig {
        host: config.ssh_host.clone().expect("validated by Config"),
        port: config.ssh_port,
        username: config.ssh_user.clone().expect("validated by Config"),
        auth,
    };

    let transport = SshTransport::connect(&ssh_config).await?;
    Ok(Arc::new(transport))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = Config::parse_and_validate();

    tracing::info!("starting agentremote MCP server v{}", env!("CARGO_PKG_VERSION"));

    let transport = build_transport(&config).await.inspect_err(|e| {
        tracing::error!("failed to establish transport: {e:#}");
    })?;

    let server = AgentRemoteServer::new(transport);
    let sessions = server.sessions();

    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {e:?}");
    })?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = service.waiting() => {
            result?;
            tracing::info!("agentremote client disconnected");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    sessions.kill_all("SIGTERM").await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    tracing::info!("agentremote server shut down");
    Ok(())
}
