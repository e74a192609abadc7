use std::collections::HashMap;

use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::{correlation_id, error::ApiError};
use crate::sessions::{
    ExecOutcome, JobStatus, SignaturePolicy, DEFAULT_IDLE_MINUTES,
};
use crate::store::{AuthSessionRecord, ExecSessionRecord};
use crate::AppServices;

#[derive(Deserialize)]
struct CreateSessionRequest {
    server_id: String,
    image: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    idle_minutes: Option<i64>,
}

#[derive(Deserialize)]
struct UpdateConfigRequest {
    #[serde(default)]
    max_run_seconds: Option<u64>,
    #[serde(default)]
    output_bytes_limit: Option<usize>,
}

#[derive(Deserialize)]
struct ExecRequest {
    tool: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, rename = "async")]
    async_mode: bool,
    #[serde(default)]
    max_run_seconds: Option<u64>,
    #[serde(default)]
    output_bytes_limit: Option<usize>,
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/sessions", post(create))
        .route("/sessions/{id}/config", patch(update_config))
        .route("/sessions/{id}/exec", post(exec))
        .route("/sessions/{id}/jobs/{job_id}", get(job_status))
}

/// `POST /api/sessions`: start an exec session. Any stored signature
/// policy for the server is applied.
async fn create(
    State(state): State<AppServices>,
    Extension(session): Extension<AuthSessionRecord>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<ExecSessionRecord>, ApiError> {
    let correlation = correlation_id(&headers).unwrap_or_else(|| Uuid::new_v4().to_string());

    let policy = state
        .store
        .get_signature_policy(&request.server_id)?
        .and_then(|record| serde_json::from_value::<SignaturePolicy>(record.payload).ok());

    let record = state
        .sessions
        .create_session(
            &request.server_id,
            &request.image,
            request.env,
            &session.vault_unlock_handle,
            &correlation,
            request.idle_minutes.unwrap_or(DEFAULT_IDLE_MINUTES),
            policy.as_ref(),
        )
        .await?;
    Ok(Json(record))
}

/// `PATCH /api/sessions/{id}/config`
async fn update_config(
    State(state): State<AppServices>,
    Path(id): Path<String>,
    Json(request): Json<UpdateConfigRequest>,
) -> Result<Json<ExecSessionRecord>, ApiError> {
    let record = state
        .sessions
        .update_session_config(&id, request.max_run_seconds, request.output_bytes_limit)
        .await?;
    Ok(Json(record))
}

/// `POST /api/sessions/{id}/exec`: sync result or async job descriptor.
async fn exec(
    State(state): State<AppServices>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecOutcome>, ApiError> {
    let outcome = state
        .sessions
        .execute_command(
            &id,
            &request.tool,
            request.args,
            request.async_mode,
            request.max_run_seconds,
            request.output_bytes_limit,
        )
        .await?;
    Ok(Json(outcome))
}

/// `GET /api/sessions/{id}/jobs/{job_id}`
async fn job_status(
    State(state): State<AppServices>,
    Path((_id, job_id)): Path<(String, String)>,
) -> Result<Json<JobStatus>, ApiError> {
    let status = state
        .sessions
        .get_job_status(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {job_id}")))?;
    Ok(Json(status))
}
