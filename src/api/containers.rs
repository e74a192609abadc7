use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, Query, State};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use crate::containers::{ContainerConfig, ContainerInfo};
use crate::store::AuthSessionRecord;
use crate::AppServices;

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/containers", get(list).post(create))
        .route("/containers/install", post(create))
        .route("/containers/{id}/start", post(start))
        .route("/containers/{id}/stop", post(stop))
        .route("/containers/{id}/restart", post(restart))
        .route("/containers/{id}", delete(remove))
        .route("/containers/{id}/logs", get(logs))
}

async fn list(
    State(state): State<AppServices>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerInfo>>, ApiError> {
    Ok(Json(state.containers.list_containers(query.all).await?))
}

/// `POST /api/containers` (and the `/install` alias): create + start.
async fn create(
    State(state): State<AppServices>,
    Extension(session): Extension<AuthSessionRecord>,
    Json(config): Json<ContainerConfig>,
) -> Result<Json<Value>, ApiError> {
    let container_id = state
        .containers
        .create_container(&config, &session.session_id, &session.vault_unlock_handle)
        .await?;
    Ok(Json(json!({
        "container_id": container_id,
        "name": config.name,
        "status": "running",
    })))
}

async fn start(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.containers.start_container(&id).await?;
    Ok(Json(json!({"success": true})))
}

async fn stop(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.containers.stop_container(&id).await?;
    Ok(Json(json!({"success": true})))
}

async fn restart(
    State(state): State<AppServices>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.containers.restart_container(&id).await?;
    Ok(Json(json!({"success": true})))
}

async fn remove(
    State(state): State<AppServices>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    state.containers.delete_container(&id, query.force).await?;
    Ok(Json(json!({"success": true})))
}

/// `GET /api/containers/{id}/logs`: WebSocket log stream. The first client
/// message must be `{"session_id": …}`; each server message is one
/// `{timestamp, message, stream}` entry.
async fn logs(
    State(state): State<AppServices>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_to_socket(state, id, socket))
}

#[derive(Deserialize)]
struct LogHello {
    session_id: String,
}

async fn stream_to_socket(state: AppServices, container_id: String, mut socket: WebSocket) {
    let authorized = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<LogHello>(text.as_str()) {
            Ok(hello) => state
                .auth
                .validate_session(&hello.session_id)
                .await
                .unwrap_or(false),
            Err(_) => false,
        },
        _ => false,
    };
    if !authorized {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    match state.containers.stream_logs(&container_id, true, 100).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next().await {
                let payload = match serde_json::to_string(&entry) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            let payload = json!({"error": e.to_string()}).to_string();
            let _ = socket.send(Message::Text(payload.into())).await;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
