pub mod auth;
pub mod catalog;
pub mod containers;
pub mod error;
pub mod gateways;
pub mod github_token;
pub mod inspector;
pub mod oauth;
pub mod remote;
pub mod sessions;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::AppServices;
use error::ApiError;

/// Pull the login session id from `Authorization: Bearer` or the legacy
/// `X-Session-ID` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
        let mut parts = value.splitn(2, ' ');
        if parts.next().is_some_and(|s| s.eq_ignore_ascii_case("bearer")) {
            if let Some(token) = parts.next() {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    headers
        .get("X-Session-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub fn correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Bearer middleware for the protected route groups. The validated login
/// session rides along as a request extension.
async fn require_session(
    State(state): State<AppServices>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or_else(ApiError::unauthorized)?;
    let session = state
        .auth
        .get_session(&token)
        .await?
        .ok_or_else(ApiError::unauthorized)?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

/// Build the full application router.
pub fn router(state: AppServices) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .merge(containers::routes())
        .merge(sessions::routes())
        .merge(inspector::routes())
        .merge(github_token::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let public = Router::new()
        .merge(auth::routes())
        .merge(oauth::routes())
        .merge(remote::routes())
        .merge(gateways::routes())
        .merge(catalog::routes());

    Router::new()
        .nest("/api", public.merge(protected))
        .layer(cors)
        .with_state(state)
}
