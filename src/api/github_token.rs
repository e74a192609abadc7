use axum::extract::{Extension, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use crate::github_token::{GitHubTokenStatus, VaultItemSummary};
use crate::store::AuthSessionRecord;
use crate::AppServices;

#[derive(Deserialize)]
struct SaveRequest {
    item_id: String,
    field: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route(
            "/github-token",
            get(get_status).post(save).delete(delete_token),
        )
        .route("/github-token/search", get(search))
        .route("/github-token/status", get(get_status))
}

/// `GET /api/github-token` / `GET /api/github-token/status`
async fn get_status(
    State(state): State<AppServices>,
) -> Result<Json<GitHubTokenStatus>, ApiError> {
    Ok(Json(state.github_token.get_status()?))
}

/// `POST /api/github-token`: resolve the named vault field and store the
/// encrypted token.
async fn save(
    State(state): State<AppServices>,
    Extension(session): Extension<AuthSessionRecord>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<GitHubTokenStatus>, ApiError> {
    let status = state
        .github_token
        .save_from_vault(
            &session.session_id,
            &session.vault_unlock_handle,
            &session.user_email,
            &request.item_id,
            &request.field,
        )
        .await?;
    Ok(Json(status))
}

/// `DELETE /api/github-token`
async fn delete_token(State(state): State<AppServices>) -> Result<Json<Value>, ApiError> {
    state.github_token.delete_token()?;
    Ok(Json(json!({"success": true})))
}

/// `GET /api/github-token/search?q=`: vault items and their field names.
async fn search(
    State(state): State<AppServices>,
    Extension(session): Extension<AuthSessionRecord>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<VaultItemSummary>>, ApiError> {
    let items = state
        .github_token
        .search_items(&query.q, &session.vault_unlock_handle, query.limit)
        .await?;
    Ok(Json(items))
}
