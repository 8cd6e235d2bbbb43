//! HTTP front end for creating sandboxes on demand.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flow::{FlowOptions, SandboxFlow, Variant};
use crate::repos::Registry;
use crate::sandbox::SandboxApi;

pub const USAGE: &str = "POST /sandbox/:name to create a sandbox";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    api: Arc<dyn SandboxApi>,
    registry: Arc<Registry>,
    options: FlowOptions,
}

impl AppState {
    pub fn new(api: Arc<dyn SandboxApi>, registry: Registry, options: FlowOptions) -> Self {
        Self {
            api,
            registry: Arc::new(registry),
            options,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexResponse {
    pub available: Vec<String>,
    pub usage: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxCreated {
    pub url: String,
    pub ssh: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/sandbox/", post(missing_name))
        .route("/sandbox/{*name}", post(create_sandbox))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Json<IndexResponse> {
    Json(IndexResponse {
        available: state.registry.names().into_iter().map(String::from).collect(),
        usage: USAGE.to_string(),
    })
}

fn invalid_name(registry: &Registry) -> Response {
    error(
        StatusCode::BAD_REQUEST,
        format!("Invalid sandbox name. Valid: {}", registry.names().join(", ")),
    )
}

async fn missing_name(State(state): State<AppState>) -> Response {
    tracing::warn!("rejected empty sandbox name");
    invalid_name(&state.registry)
}

async fn create_sandbox(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(repo) = state.registry.get(&name) else {
        tracing::warn!(name = %name, "rejected unknown sandbox name");
        return invalid_name(&state.registry);
    };

    let flow = SandboxFlow::new(
        Arc::clone(&state.api),
        Variant::Snapshot(repo.clone()),
        state.options.clone(),
    );

    match flow.create_and_start().await {
        Ok(info) => Json(SandboxCreated {
            ssh: info.ssh_command(),
            url: info.url,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(name = %name, error = %e, "failed to create sandbox");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create sandbox")
        }
    }
}

async fn not_found() -> Response {
    error(StatusCode::NOT_FOUND, "Not found")
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
