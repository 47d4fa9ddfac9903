//! REST API handlers for the provisioning server
//!
//! This module defines the API routes and handlers. Every handler delegates
//! to [`NodeLifecycleManager`](super::manager::NodeLifecycleManager) and maps
//! library errors to HTTP status codes via [`status_for`].

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCategory};
use crate::metrics;

use super::server::AppState;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Body of `POST /api/v1/oven`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BakeRequest {
    pub template_name: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Body of `POST /api/v1/nodes/{id}/disks`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDiskRequest {
    pub disk_id: String,
}

/// Body of `POST /api/v1/disks`
#[derive(Debug, Deserialize)]
pub struct CreateDiskRequest {
    /// Size in MiB
    pub size: i64,
}

// ============================================================================
// Error Mapping
// ============================================================================

/// HTTP status for a library error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidState { .. } => StatusCode::CONFLICT,
        Error::ProtectedResource { .. } => StatusCode::FORBIDDEN,
        _ => match err.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn error_response(err: &Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    } else {
        tracing::debug!(error = %err, status = status.as_u16(), "Request rejected");
    }
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

fn respond<T: Serialize>(result: crate::Result<T>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, Json(ApiResponse::success(data))).into_response(),
        Err(e) => error_response(&e),
    }
}

fn respond_bytes(result: crate::Result<Vec<u8>>) -> Response {
    match result {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            content,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes();

    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        // Fridge and oven
        .route("/api/v1/fridge", get(list_fridge))
        .route("/api/v1/oven", get(list_oven).post(bake_node))
        .route("/api/v1/oven/{id}", axum::routing::delete(unbake_node))
        // Nodes
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/{id}", get(get_node).post(register_node))
        .route("/api/v1/nodes/{id}/reboot", post(reboot_node))
        .route("/api/v1/nodes/{id}/disks", post(attach_disk))
        .route(
            "/api/v1/nodes/{id}/disks/{disk_id}",
            axum::routing::delete(detach_disk),
        )
        .route(
            "/api/v1/nodes/{id}/files/{*path}",
            put(upload_node_file).get(download_node_file),
        )
        // Disks
        .route("/api/v1/disks", get(list_disks).post(create_disk))
        .route("/api/v1/disks/{id}", get(get_disk).delete(destroy_disk))
        // Templates
        .route("/api/v1/templates", get(list_templates))
        .route(
            "/api/v1/templates/{name}",
            put(upload_template)
                .delete(delete_template)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        // Boot files
        .route("/api/v1/boot/{id}/{*file}", get(boot_file))
        // Exports
        .route("/api/v1/exports", get(export_status))
        .with_state(state)
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
    }))
}

async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to encode metrics: {e}"))),
        )
            .into_response(),
    }
}

// ============================================================================
// Fridge / Oven Handlers
// ============================================================================

async fn list_fridge(State(state): State<AppState>) -> Response {
    respond(state.manager.list_available(), StatusCode::OK)
}

async fn list_oven(State(state): State<AppState>) -> Response {
    respond(state.manager.list_active(), StatusCode::OK)
}

/// Start a bake in the background; answers with the node snapshot
async fn bake_node(State(state): State<AppState>, Json(request): Json<BakeRequest>) -> Response {
    let result = state
        .manager
        .start_bake(&request.template_name, request.node_id.as_deref())
        .await;
    respond(result, StatusCode::ACCEPTED)
}

async fn unbake_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.manager.unbake(&id).await, StatusCode::OK)
}

// ============================================================================
// Node Handlers
// ============================================================================

async fn list_nodes(State(state): State<AppState>) -> Response {
    respond(state.manager.list_all(), StatusCode::OK)
}

async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.manager.get_node(&id), StatusCode::OK)
}

async fn register_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.manager.register_node(&id).await, StatusCode::OK)
}

async fn reboot_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = state
        .manager
        .power_cycle_node(&id)
        .await
        .map(|()| format!("Node {} power cycled", id));
    respond(result, StatusCode::OK)
}

async fn attach_disk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AttachDiskRequest>,
) -> Response {
    respond(
        state.manager.attach_disk(&id, &request.disk_id).await,
        StatusCode::OK,
    )
}

async fn detach_disk(
    State(state): State<AppState>,
    Path((id, disk_id)): Path<(String, String)>,
) -> Response {
    respond(state.manager.detach_disk(&id, &disk_id).await, StatusCode::OK)
}

async fn upload_node_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = state
        .manager
        .put_node_file(&id, &path, &body)
        .await
        .map(|()| path);
    respond(result, StatusCode::CREATED)
}

async fn download_node_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> Response {
    respond_bytes(state.manager.get_node_file(&id, &path).await)
}

// ============================================================================
// Disk Handlers
// ============================================================================

async fn list_disks(State(state): State<AppState>) -> Response {
    respond(Ok(state.manager.disks().list().await), StatusCode::OK)
}

async fn create_disk(
    State(state): State<AppState>,
    Json(request): Json<CreateDiskRequest>,
) -> Response {
    respond(state.manager.create_disk(request.size).await, StatusCode::CREATED)
}

async fn get_disk(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.manager.disks().get(&id).await, StatusCode::OK)
}

async fn destroy_disk(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = state.manager.destroy_disk(&id).await.map(|()| id);
    respond(result, StatusCode::OK)
}

// ============================================================================
// Template Handlers
// ============================================================================

async fn list_templates(State(state): State<AppState>) -> Response {
    respond(Ok(state.manager.templates().list().await), StatusCode::OK)
}

async fn upload_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    respond(
        state.manager.templates().upload(&name, &body).await,
        StatusCode::CREATED,
    )
}

async fn delete_template(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let result = state.manager.delete_template(&name).await.map(|()| name);
    respond(result, StatusCode::OK)
}

// ============================================================================
// Boot / Export Handlers
// ============================================================================

/// Serve one boot artifact to a network-booting node
async fn boot_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> Response {
    respond_bytes(state.manager.read_boot_file(&id, &file).await)
}

async fn export_status(State(state): State<AppState>) -> Response {
    respond(Ok(state.manager.exports().status().await), StatusCode::OK)
}

// ============================================================================
// Tests
// ============================================================================
