//! Agent Stream Proxy
//!
//! HTTP front end for a coding-agent CLI. Each chat message runs the agent
//! once, and its structured output is relayed to clients as server-sent events.

mod agent;
mod config;
mod process;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use agent::{EventSink, ProcessSupervisor};
use config::{Overrides, ProxyConfig};
use process::{ProcessSpawner, TokioSpawner};
use server::{AppState, EventBroadcaster, ProxyServer, ServerConfig};

/// Agent Stream Proxy
///
/// Streams coding-agent output to HTTP clients over SSE
#[derive(Parser, Debug)]
#[command(name = "agent-stream-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on [default: 3000]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 127.0.0.1]
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file [default: ./agent-stream-proxy.toml if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent executable name or path [default: claude]
    #[arg(long)]
    executable: Option<String>,

    /// Working directory for the agent [default: current directory]
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Run in the background, logging to --log-file
    #[arg(long)]
    detach: bool,

    /// Log file used with --detach
    #[arg(long, default_value = "agent-stream-proxy.log")]
    log_file: PathBuf,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            port: self.port,
            executable: self.executable.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ProxyConfig::discover(args.config.as_deref())
        .context("Failed to load configuration")?;
    config.apply(args.overrides())?;

    if args.detach {
        let child_args = process::strip_detach_flag(std::env::args_os().skip(1));
        let pid = process::spawn_detached(&child_args, &args.log_file)
            .context("Failed to start detached server")?;
        println!(
            "agent-stream-proxy started in background (pid {}), logging to {}",
            pid,
            args.log_file.display()
        );
        return Ok(());
    }

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Agent Stream Proxy v{}", env!("CARGO_PKG_VERSION"));

    let command = config.agent_command()?;
    info!(
        "Agent: {} in {}",
        command.executable,
        command.working_dir.display()
    );

    let broadcaster = Arc::new(EventBroadcaster::new());
    let supervisor = Arc::new(ProcessSupervisor::new(
        command,
        Arc::new(TokioSpawner) as Arc<dyn ProcessSpawner>,
        Arc::clone(&broadcaster) as Arc<dyn EventSink>,
    ));
    supervisor.start().await?;

    let server_config = ServerConfig::new(config.server.bind.clone(), config.server.port);
    let server = Arc::new(ProxyServer::new(
        server_config,
        AppState::new(supervisor, broadcaster),
    ));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
