//! HTTP control plane.
//!
//! A thin dispatch adapter: each route parses the request body, calls the
//! matching registry operation, and maps its error kinds onto status codes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::api::{AllocationRequest, InitializeRequest, RunRequest};
use crate::registry::{Registry, RegistryError};

/// Control-plane server handle.
pub struct AgentServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl AgentServer {
    /// Bind the listener and serve the control plane in the background.
    pub async fn start(addr: SocketAddr, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control plane listener on {addr}"))?;
        let actual_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let app = build_router(registry);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!(addr = %actual_addr, "control plane started");
        Ok(Self {
            addr: actual_addr,
            shutdown_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Clone)]
struct AgentState {
    registry: Arc<Registry>,
}

pub fn build_router(registry: Arc<Registry>) -> Router {
    use axum::routing::post;

    Router::new()
        .route("/containers", get(list_containers))
        .route(
            "/containers/{guid}",
            get(get_container)
                .post(allocate_container)
                .delete(delete_container),
        )
        .route("/containers/{guid}/initialize", post(initialize_container))
        .route("/containers/{guid}/run", post(run_actions))
        .with_state(AgentState { registry })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
        RegistryError::InsufficientResources => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::InvalidState { .. } => StatusCode::CONFLICT,
        RegistryError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RegistryError::Transform(_) => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn list_containers(State(state): State<AgentState>) -> Response {
    Json(state.registry.list()).into_response()
}

async fn get_container(State(state): State<AgentState>, Path(guid): Path<String>) -> Response {
    match state.registry.get(&guid) {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

async fn allocate_container(
    State(state): State<AgentState>,
    Path(guid): Path<String>,
    Json(request): Json<AllocationRequest>,
) -> Response {
    match state.registry.allocate(&guid, request) {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn initialize_container(
    State(state): State<AgentState>,
    Path(guid): Path<String>,
    Json(request): Json<InitializeRequest>,
) -> Response {
    match state.registry.initialize(&guid, request).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

async fn run_actions(
    State(state): State<AgentState>,
    Path(guid): Path<String>,
    Json(request): Json<RunRequest>,
) -> Response {
    match state.registry.run(&guid, request) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_container(State(state): State<AgentState>, Path(guid): Path<String>) -> Response {
    match state.registry.delete(&guid).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}
