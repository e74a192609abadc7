use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use super::error::ApiError;
use crate::AppServices;

pub fn routes() -> Router<AppServices> {
    Router::new().route("/inspector/{container_id}/{surface}", get(inspect))
}

/// `GET /api/inspector/{container_id}/{tools|resources|prompts|capabilities}`
async fn inspect(
    State(state): State<AppServices>,
    Path((container_id, surface)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let result = match surface.as_str() {
        "tools" => state.inspector.list_tools(&container_id).await?,
        "resources" => state.inspector.list_resources(&container_id).await?,
        "prompts" => state.inspector.list_prompts(&container_id).await?,
        "capabilities" => state.inspector.capabilities(&container_id).await?,
        other => {
            return Err(ApiError::validation(format!(
                "unknown inspector surface: {other} (use tools, resources, prompts, or capabilities)"
            )))
        }
    };
    Ok(Json(result))
}
