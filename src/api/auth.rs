use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::{bearer_token, error::ApiError};
use crate::auth::LoginRequest;
use crate::AppServices;

#[derive(Serialize)]
struct LoginResponse {
    session_id: String,
    user_email: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/session", get(session))
}

/// `POST /api/auth/login`: authenticate against the vault and mint a
/// session. The unlock handle itself never appears in the response; the
/// session id is the bearer token.
async fn login(
    State(state): State<AppServices>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let session = state.auth.login(&request).await?;
    Ok(Json(LoginResponse {
        session_id: session.session_id,
        user_email: session.user_email,
        created_at: session.created_at,
        expires_at: session.expires_at,
    }))
}

/// `POST /api/auth/logout`
async fn logout(
    State(state): State<AppServices>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers).ok_or_else(ApiError::unauthorized)?;
    let success = state.auth.logout(&token).await?;
    Ok(Json(json!({"success": success})))
}

/// `GET /api/auth/session`: validate the bearer token.
async fn session(
    State(state): State<AppServices>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers).ok_or_else(ApiError::unauthorized)?;
    let session = state
        .auth
        .get_session(&token)
        .await?
        .ok_or_else(ApiError::unauthorized)?;
    Ok(Json(json!({
        "valid": true,
        "session_id": session.session_id,
        "user_email": session.user_email,
        "created_at": session.created_at,
        "expires_at": session.expires_at,
    })))
}
