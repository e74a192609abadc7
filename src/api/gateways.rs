use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{correlation_id, error::ApiError};
use crate::gateways::{GatewayRecord, GatewayRegistrationRequest};
use crate::AppServices;

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/gateways", post(register))
        .route("/gateways/{id}/health", get(health))
}

/// `POST /api/gateways`: validate against the merged allowlist, register,
/// and run the first health probe.
async fn register(
    State(state): State<AppServices>,
    headers: HeaderMap,
    Json(request): Json<GatewayRegistrationRequest>,
) -> Result<(StatusCode, Json<GatewayRecord>), ApiError> {
    let correlation = correlation_id(&headers);
    let record = state
        .gateways
        .register_gateway(request, correlation.as_deref())
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.clone()))?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /api/gateways/{id}/health`: run a probe now and return the result.
async fn health(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<GatewayRecord>, ApiError> {
    Ok(Json(state.gateways.healthcheck(&id).await?))
}
