//! HTTP API Server
//!
//! Read-only JSON snapshots of membership, the file index and controller
//! health for operators and `dsctl`.

use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ApiConfig;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::state::{FileEntry, NodeId};

/// Shared application state
pub struct AppState {
    pub controller: Arc<Controller>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, controller: Arc<Controller>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { controller }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/nodes", get(handle_nodes))
            .route("/files", get(handle_files))
            .route("/files/:name", get(handle_file))
            .with_state(Arc::clone(&self.state))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub live_nodes: usize,
    pub replication_factor: usize,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub replication_factor: usize,
    pub timeout_ms: u64,
    pub rebalance_period_ms: u64,
    pub live_nodes: usize,
    pub files: usize,
    pub complete_files: usize,
    pub pending_operations: usize,
    pub uptime_seconds: u64,
}

/// One node with its replica count
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: NodeId,
    pub address: String,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub alive: bool,
    pub files: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let controller = &state.controller;
    let live_nodes = controller.membership().live_count().await;
    let replication_factor = controller.config().replication_factor;

    Json(HealthResponse {
        healthy: live_nodes >= replication_factor,
        live_nodes,
        replication_factor,
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let controller = &state.controller;
    let config = controller.config();

    Json(StatusResponse {
        replication_factor: config.replication_factor,
        timeout_ms: config.timeout.as_millis() as u64,
        rebalance_period_ms: config.rebalance_period.as_millis() as u64,
        live_nodes: controller.membership().live_count().await,
        files: controller.index().len().await,
        complete_files: controller.index().list_complete().await.len(),
        pending_operations: controller.acks().pending(),
        uptime_seconds: controller.uptime().as_secs(),
    })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let loads = state.controller.index().node_loads().await;
    let nodes: Vec<NodeResponse> = state
        .controller
        .membership()
        .infos()
        .await
        .into_iter()
        .map(|info| NodeResponse {
            files: loads.get(&info.id).copied().unwrap_or(0),
            id: info.id,
            address: info.address,
            joined_at: info.joined_at,
            alive: info.alive,
        })
        .collect();
    Json(nodes)
}

async fn handle_files(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let files: Vec<FileEntry> = state.controller.index().snapshot().await;
    Json(files)
}

async fn handle_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.controller.index().get(&name).await {
        Some(slot) => Json(slot.snapshot()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("File {} not found", name),
                code: "FILE_NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
    }
}
