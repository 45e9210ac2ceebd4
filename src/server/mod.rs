//! HTTP server module
//!
//! Serves the chat, status and reset endpoints over axum and fans agent
//! events out to connected SSE clients.

mod broadcaster;
mod error;
mod protocol;
mod routes;

pub use broadcaster::*;
pub use routes::*;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::agent::StreamEvent;

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// The proxy's HTTP server
pub struct ProxyServer {
    config: ServerConfig,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// Subscribers get a `shutdown` status and their streams are closed as
    /// soon as shutdown starts. Any in-flight agent process is stopped before
    /// returning.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let app = create_router(self.state.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let broadcaster = self.state.broadcaster.clone();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, closing event streams");
                broadcaster.broadcast(StreamEvent::status("shutdown"));
                broadcaster.close_all();
            })
            .await?;

        self.state.supervisor.stop().await;
        info!("Server stopped");
        Ok(())
    }
}
