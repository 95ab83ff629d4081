// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP front-end over the download queue.
//!
//! # Endpoints
//!
//! - `POST /api/store/download` - Enqueue a job
//! - `GET /api/store/tasks` - Running and queued jobs
//! - `POST /api/store/cancel/:task_id` - Cancel one job
//! - `POST /api/store/cancel-all` - Cancel everything
//! - `GET /api/store/history` - Ledger entries
//! - `DELETE /api/store/history` - Drop finished ledger entries
//! - `GET /api/store/owned` - Ownership index
//! - `GET /health` - Health check
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use romfetch::{DownloadManager, Server, Settings};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = Arc::new(Settings::load(None)?);
//! let manager = Arc::new(DownloadManager::new(settings.clone())?);
//! Server::new(manager, settings.server.port).start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;

use crate::config::DEFAULT_PORT;
use crate::download::persist::off_runtime;
use crate::download::{DownloadManager, LedgerEntry, OwnershipMap, TaskId, TaskView};
use crate::errors::ApiError;

// Maximum request body size (64KB, requests are a URL and two names)
const MAX_BODY_SIZE: usize = 64 * 1024;
// Handlers only touch the queue and the ledgers
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API server configuration.
#[derive(Clone)]
pub struct Server {
    manager: Arc<DownloadManager>,
    /// Port to listen on.
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .finish()
    }
}

impl Server {
    /// Create a server for `manager`. Binds to 127.0.0.1 unless told otherwise.
    pub fn new(manager: Arc<DownloadManager>, port: u16) -> Self {
        Self {
            manager,
            port,
            bind_address: "127.0.0.1".to_string(),
        }
    }

    /// Server on the default port.
    pub fn with_default_port(manager: Arc<DownloadManager>) -> Self {
        Self::new(manager, DEFAULT_PORT)
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        router(self.manager.clone())
    }

    /// Start the server with graceful shutdown.
    ///
    /// Running jobs are canceled once the listener stops.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!(target: "server", "Starting server on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                target: "server",
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Another romfetch server may be running; stop it or pass --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.manager.shutdown().await;
        tracing::info!(target: "server", "Cleanup complete, server stopped");
        Ok(())
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Routes over `manager`, without binding a listener.
pub fn router(manager: Arc<DownloadManager>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/store/download", post(download_handler))
        .route("/api/store/tasks", get(tasks_handler))
        .route("/api/store/cancel/:task_id", post(cancel_handler))
        .route("/api/store/cancel-all", post(cancel_all_handler))
        .route("/api/store/history", get(history_handler).delete(clear_history_handler))
        .route("/api/store/owned", get(owned_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(manager)
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active: usize,
    pub queued: usize,
}

/// Enqueue request. Missing fields read as empty and are rejected.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub force_extract: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuedResponse {
    pub status: String,
    pub task_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelAllResponse {
    pub canceled: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

// =============================================================================
// Handlers
// =============================================================================

type AppState = State<Arc<DownloadManager>>;

async fn health_handler(State(manager): AppState) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active: manager.active_count(),
        queued: manager.queued_count(),
    })
}

async fn download_handler(
    State(manager): AppState,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<QueuedResponse>, ApiError> {
    let missing: Vec<&str> = [
        ("url", &request.url),
        ("game_name", &request.game_name),
        ("platform", &request.platform),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect();
    if !missing.is_empty() {
        return Err(ApiError::invalid_request(format!("Missing required fields: {}", missing.join(", "))));
    }

    let handle = manager
        .enqueue(&request.url, &request.game_name, &request.platform, request.force_extract)
        .map_err(|e| ApiError::invalid_request(e.to_string()))?;
    Ok(Json(QueuedResponse {
        status: "queued".to_string(),
        task_id: handle.task_id,
    }))
}

async fn tasks_handler(State(manager): AppState) -> Json<TasksResponse> {
    Json(TasksResponse { tasks: manager.status() })
}

async fn cancel_handler(State(manager): AppState, Path(task_id): Path<TaskId>) -> Json<CancelResponse> {
    Json(CancelResponse {
        canceled: manager.cancel(task_id),
    })
}

async fn cancel_all_handler(State(manager): AppState) -> Json<CancelAllResponse> {
    Json(CancelAllResponse {
        canceled: manager.cancel_all(),
    })
}

async fn history_handler(State(manager): AppState) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    Ok(Json(off_runtime(move || manager.history()).await?))
}

async fn clear_history_handler(State(manager): AppState) -> Result<Json<ClearResponse>, ApiError> {
    Ok(Json(ClearResponse {
        cleared: off_runtime(move || manager.clear_history()).await?,
    }))
}

async fn owned_handler(State(manager): AppState) -> Result<Json<OwnershipMap>, ApiError> {
    Ok(Json(off_runtime(move || manager.owned()).await?))
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM on Unix, Ctrl+C elsewhere.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(target: "server", "Failed to install signal handlers: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!(target: "server", "Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!(target: "server", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "server", "Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!(target: "server", "Received Ctrl+C, initiating graceful shutdown...");
    }
}
