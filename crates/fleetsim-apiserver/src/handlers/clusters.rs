use crate::error::{ApiError, Result};
use crate::response::{status_accepted, ApiResponse, CreateClusterResponse};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Body of `POST /clusters`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
}

/// GET /clusters
pub async fn list_clusters(State(state): State<Arc<AppState>>) -> Result<Response> {
    let clusters = state.orchestrator.list_clusters();
    Ok(ApiResponse::ok(clusters).into_response())
}

/// GET /clusters/{name}
pub async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response> {
    let detail = state.orchestrator.get_cluster(&name)?;
    Ok(ApiResponse::ok(detail).into_response())
}

/// POST /clusters
///
/// Returns as soon as the cluster is tracked; provisioning continues in
/// the background.
pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<CreateClusterRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    info!("Creating cluster: {}", request.name);

    let cluster = state.orchestrator.create_cluster(&request.name).await?;

    Ok(ApiResponse::created(CreateClusterResponse {
        success: true,
        message: format!("Cluster {} accepted", cluster.name),
        cluster_id: cluster.id,
    })
    .into_response())
}

/// DELETE /clusters/{name}
pub async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response> {
    info!("Deleting cluster: {}", name);

    state.orchestrator.delete_cluster(&name).await?;

    Ok(status_accepted(&format!("Cluster {} deleted", name)))
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
