use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{correlation_id, error::ApiError};
use crate::remote::{RemoteServer, TestConnectionResult};
use crate::AppServices;

#[derive(Deserialize)]
struct RegisterRequest {
    catalog_item_id: String,
    name: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    delete_credentials: bool,
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/remote-servers", get(list).post(register))
        .route("/remote-servers/{id}", get(get_one).delete(remove))
        .route("/remote-servers/{id}/connect", post(connect))
        .route("/remote-servers/{id}/test", post(test))
        .route("/remote-servers/{id}/enable", post(enable))
        .route("/remote-servers/{id}/disable", post(disable))
}

/// `POST /api/remote-servers`: 201 on success.
async fn register(
    State(state): State<AppServices>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RemoteServer>), ApiError> {
    let correlation = correlation_id(&headers);
    let server = state
        .remote
        .register_server(
            &request.catalog_item_id,
            &request.name,
            &request.endpoint,
            correlation.as_deref(),
        )
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.clone()))?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn list(
    State(state): State<AppServices>,
) -> Result<Json<Vec<RemoteServer>>, ApiError> {
    Ok(Json(state.remote.list_servers().await?))
}

async fn get_one(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<RemoteServer>, ApiError> {
    let server = state
        .remote
        .get_server(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("remote server not found: {id}")))?;
    Ok(Json(server))
}

async fn remove(
    State(state): State<AppServices>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    let correlation = correlation_id(&headers);
    state
        .remote
        .delete_server(&id, query.delete_credentials, correlation.as_deref())
        .await?;
    Ok(Json(json!({"success": true})))
}

/// `POST /api/remote-servers/{id}/connect`: establish the event-stream
/// session and return advertised capabilities.
async fn connect(
    State(state): State<AppServices>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let correlation = correlation_id(&headers);
    let capabilities = state
        .remote
        .connect(&id)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation))?;
    Ok(Json(json!({
        "server_id": id,
        "capabilities": capabilities,
    })))
}

/// `POST /api/remote-servers/{id}/test`: reachability probe without a
/// long-lived session.
async fn test(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let result: TestConnectionResult = state.remote.test_connection(&id).await?;
    let mut body = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
    body["server_id"] = json!(id);
    Ok(Json(body))
}

async fn enable(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<RemoteServer>, ApiError> {
    Ok(Json(state.remote.enable_server(&id).await?))
}

async fn disable(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<RemoteServer>, ApiError> {
    Ok(Json(state.remote.disable_server(&id).await?))
}
