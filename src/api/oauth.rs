use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{correlation_id, error::ApiError};
use crate::oauth::{RefreshOutcome, StartAuthResult};
use crate::AppServices;

#[derive(Deserialize)]
struct StartRequest {
    server_id: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
    #[serde(default)]
    server_id: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
}

#[derive(Deserialize)]
struct RefreshRequest {
    server_id: String,
    credential_key: String,
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/oauth/start", post(start))
        .route("/oauth/callback", get(callback))
        .route("/oauth/refresh", post(refresh))
}

/// `POST /api/oauth/start`
async fn start(
    State(state): State<AppServices>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartAuthResult>, ApiError> {
    let correlation = correlation_id(&headers);
    let result = state
        .oauth
        .start_auth(
            &request.server_id,
            request.scopes,
            request.code_challenge,
            request.code_challenge_method,
        )
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation))?;
    Ok(Json(result))
}

/// `GET /api/oauth/callback`
async fn callback(
    State(state): State<AppServices>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ApiError> {
    let correlation = correlation_id(&headers);
    let grant = state
        .oauth
        .exchange_token(
            &query.code,
            &query.state,
            query.server_id.as_deref(),
            query.code_verifier.as_deref(),
        )
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation))?;

    Ok(Json(json!({
        "success": true,
        "status": grant.status,
        "scope": grant.scope,
        "expires_in": grant.expires_in,
        "credential_key": grant.credential_key,
        "expires_at": grant.expires_at,
    })))
}

/// `POST /api/oauth/refresh`
async fn refresh(
    State(state): State<AppServices>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshOutcome>, ApiError> {
    let correlation = correlation_id(&headers);
    let outcome = state
        .oauth
        .refresh_token(&request.server_id, &request.credential_key)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation))?;
    Ok(Json(outcome))
}
