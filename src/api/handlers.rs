//! API request handlers

use super::models::{DeployResponse, HealthResponse, PortResponse, StopResponse};
use super::routes::AppState;
use crate::error::ApiError;
use crate::lifecycle::{ModelStatus, StartOptions};
use crate::model::ModelIdentity;
use crate::records::ContainerStatus;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /models - Status of every model
pub async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelStatus>>, ApiError> {
    Ok(Json(state.manager.statuses().await?))
}

/// GET /models/{model} - Status of one model
pub async fn get_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<ModelStatus>, ApiError> {
    let model: ModelIdentity = model.parse()?;
    Ok(Json(state.manager.status(model).await?))
}

/// GET /models/{model}/port - Port serving the model
pub async fn get_port(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<PortResponse>, ApiError> {
    let model: ModelIdentity = model.parse()?;
    let port = state.manager.get_port(model).await?;
    Ok(Json(PortResponse { model, port }))
}

/// POST /models/{model}/deploy - Pull and start the model's container
///
/// Returns once the container is launched; it may still be loading weights.
pub async fn deploy_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
    body: Option<Json<StartOptions>>,
) -> Result<Json<DeployResponse>, ApiError> {
    let model: ModelIdentity = model.parse()?;
    let options = body.map(|Json(options)| options).unwrap_or_default();

    let port = state.manager.deploy(model, options).await?;
    let status = state
        .manager
        .records()
        .get(model)
        .await
        .map(|r| r.status)
        .unwrap_or(ContainerStatus::Starting);

    Ok(Json(DeployResponse {
        model,
        port,
        status,
    }))
}

/// POST /models/{model}/stop - Stop the model's container
pub async fn stop_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let model: ModelIdentity = model.parse()?;
    state.manager.stop(model, false).await?;

    Ok(Json(StopResponse {
        model,
        status: ContainerStatus::Absent,
    }))
}
