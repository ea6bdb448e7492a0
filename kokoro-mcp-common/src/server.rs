//! MCP server builder.
//!
//! Runs an `rmcp` server handler over the configured transport, stops on
//! SIGINT/SIGTERM or a programmatic shutdown signal, and then runs an optional
//! shutdown hook (used to cancel live streaming sessions).
//!
//! # Example
//!
//! ```ignore
//! use kokoro_mcp_common::server::McpServerBuilder;
//! use kokoro_mcp_common::transport::Transport;
//!
//! McpServerBuilder::new(handler)
//!     .with_transport(Transport::stdio())
//!     .on_shutdown(async move { registry.cancel_all().await })
//!     .run()
//!     .await?;
//! ```

use crate::transport::Transport;
use rmcp::{ServerHandler, ServiceExt};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

type ShutdownHook = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Errors that can occur when running an MCP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address
    #[error("Failed to bind to {addr}: {message}")]
    BindFailed { addr: String, message: String },

    /// Transport error during communication
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder for configuring and running MCP servers.
pub struct McpServerBuilder<H> {
    handler: H,
    transport: Transport,
    shutdown_rx: Option<oneshot::Receiver<()>>,
    shutdown_hook: Option<ShutdownHook>,
}

impl<H> McpServerBuilder<H>
where
    H: ServerHandler + Clone + Send + Sync + 'static,
{
    /// Create a new server builder with the given handler.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            transport: Transport::default(),
            shutdown_rx: None,
            shutdown_hook: None,
        }
    }

    /// Set the transport mode for the server.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Stop the server when `shutdown_rx` fires (or its sender is dropped)
    /// instead of waiting for a process signal.
    pub fn with_shutdown(mut self, shutdown_rx: oneshot::Receiver<()>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Run `hook` once the server has stopped serving.
    pub fn on_shutdown<F>(mut self, hook: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown_hook = Some(Box::pin(hook));
        self
    }

    /// Run the MCP server until shutdown.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(transport = %self.transport, "Starting MCP server");

        let Self {
            handler,
            transport,
            shutdown_rx,
            shutdown_hook,
        } = self;

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => wait_for_shutdown_signal().await,
            }
        };

        let result = match transport {
            Transport::Stdio => run_stdio(handler, shutdown).await,
            Transport::Http { host, port } => run_http(handler, &host, port, shutdown).await,
        };

        if let Some(hook) = shutdown_hook {
            tracing::debug!("Running shutdown hook");
            hook.await;
        }

        result
    }
}

async fn run_stdio<H, S>(handler: H, shutdown: S) -> Result<(), ServerError>
where
    H: ServerHandler + Clone + Send + Sync + 'static,
    S: Future<Output = ()> + Send,
{
    use rmcp::transport::io::stdio;

    let service = handler
        .serve(stdio())
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))?;

    tokio::select! {
        result = service.waiting() => {
            result.map_err(|e| ServerError::Transport(e.to_string()))?;
            tracing::info!("Client closed stdio transport");
            Ok(())
        }
        _ = shutdown => {
            tracing::info!("Received shutdown signal, stopping server");
            Ok(())
        }
    }
}

async fn run_http<H, S>(handler: H, host: &str, port: u16, shutdown: S) -> Result<(), ServerError>
where
    H: ServerHandler + Clone + Send + Sync + 'static,
    S: Future<Output = ()> + Send + 'static,
{
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpService,
    };

    let service = StreamableHttpService::new(
        move || Ok(handler.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let bind_addr = format!("{}:{}", host, port);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| ServerError::BindFailed {
            addr: bind_addr.clone(),
            message: e.to_string(),
        })?;

    tracing::info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C elsewhere).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Failed to register signal handlers, falling back to Ctrl+C");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C; shutdown only via channel");
            std::future::pending::<()>().await;
        }
    }
}

/// Create a programmatic shutdown channel for `McpServerBuilder::with_shutdown`.
pub fn shutdown_channel() -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
    oneshot::channel()
}
