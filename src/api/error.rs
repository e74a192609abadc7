use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;
use crate::catalog::CatalogError;
use crate::containers::ContainerError;
use crate::gateways::GatewayError;
use crate::github_token::GitHubTokenError;
use crate::inspector::InspectorError;
use crate::oauth::OAuthError;
use crate::remote::RemoteMcpError;
use crate::secrets::SecretError;
use crate::sessions::SessionError;
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// The single switch-site turning component error kinds into the wire
/// envelope `{error_code, message, detail?, retry_after_seconds?,
/// correlation_id?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_code: &'static str,
    pub message: String,
    pub detail: Option<String>,
    pub retry_after_seconds: Option<u64>,
    pub correlation_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error_code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code,
            message: message.into(),
            detail: None,
            retry_after_seconds: None,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_ERROR",
            "a valid bearer session is required",
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "VALIDATION_ERROR", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("Internal error surfaced to client: {}", message);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: "INTERNAL_ERROR",
            message: "an internal error occurred".to_string(),
            detail: None,
            retry_after_seconds: None,
            correlation_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code,
            message: &self.message,
            detail: self.detail.as_deref(),
            retry_after_seconds: self.retry_after_seconds,
            correlation_id: self.correlation_id.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Component error mappings
// ---------------------------------------------------------------------------

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Failed(_) => {
                ApiError::new(StatusCode::UNAUTHORIZED, "AUTH_ERROR", e.to_string())
            }
            AuthError::InvalidRequest(m) => ApiError::validation(m),
            AuthError::Store(inner) => inner.into(),
        }
    }
}

impl From<SecretError> for ApiError {
    fn from(e: SecretError) -> Self {
        let status = match &e {
            SecretError::Parse(_) => StatusCode::BAD_REQUEST,
            SecretError::FieldNotFound { .. } => StatusCode::NOT_FOUND,
            SecretError::Vault(_) => StatusCode::BAD_GATEWAY,
        };
        ApiError::new(status, "SECRET_ERROR", e.to_string())
    }
}

impl From<ContainerError> for ApiError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Unavailable(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "CONTAINER_UNAVAILABLE",
                e.to_string(),
            ),
            ContainerError::AlreadyExists {
                ref container_id,
                ref status,
                ..
            } => {
                let detail = match (container_id, status) {
                    (Some(id), Some(status)) => {
                        Some(format!("existing container {id} is {status}"))
                    }
                    (Some(id), None) => Some(format!("existing container {id}")),
                    _ => None,
                };
                ApiError {
                    status: StatusCode::CONFLICT,
                    error_code: "CONTAINER_ALREADY_EXISTS",
                    message: e.to_string(),
                    detail,
                    retry_after_seconds: None,
                    correlation_id: None,
                }
            }
            ContainerError::NotFound(_) | ContainerError::ImageNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "CONTAINER_ERROR", e.to_string())
            }
            ContainerError::Secret(inner) => inner.into(),
            ContainerError::Other(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONTAINER_ERROR",
                e.to_string(),
            ),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => ApiError::not_found(e.to_string()),
            SessionError::SignatureRejected(_) => {
                ApiError::new(StatusCode::FORBIDDEN, "CONTAINER_ERROR", e.to_string())
            }
            SessionError::Container(inner) => inner.into(),
            SessionError::Mtls(inner) => ApiError::internal(inner.to_string()),
            SessionError::Store(inner) => inner.into(),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::StateMismatch => ApiError::new(
                StatusCode::BAD_REQUEST,
                "OAUTH_STATE_MISMATCH",
                e.to_string(),
            ),
            OAuthError::ProviderError => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "OAUTH_PROVIDER_ERROR",
                e.to_string(),
            ),
            OAuthError::ProviderUnavailable => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "OAUTH_PROVIDER_UNAVAILABLE",
                e.to_string(),
            ),
            OAuthError::InvalidGrant => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "OAUTH_INVALID_GRANT",
                e.to_string(),
            ),
            OAuthError::ScopeNotAllowed { .. } | OAuthError::ScopeUpdateForbidden => {
                ApiError::new(StatusCode::FORBIDDEN, "SCOPE_NOT_ALLOWED", e.to_string())
            }
            OAuthError::CredentialNotFound(_) => ApiError::new(
                StatusCode::NOT_FOUND,
                "CREDENTIAL_NOT_FOUND",
                e.to_string(),
            ),
            OAuthError::InvalidRequest(m) => ApiError::validation(m),
            OAuthError::Config(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                e.to_string(),
            ),
            OAuthError::Store(inner) => inner.into(),
            OAuthError::Cipher(inner) => ApiError::internal(inner.to_string()),
        }
    }
}

impl From<RemoteMcpError> for ApiError {
    fn from(e: RemoteMcpError) -> Self {
        match e {
            RemoteMcpError::EndpointNotAllowed(_) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "ENDPOINT_NOT_ALLOWED",
                e.to_string(),
            ),
            RemoteMcpError::Duplicate(_) => {
                ApiError::new(StatusCode::CONFLICT, "VALIDATION_ERROR", e.to_string())
            }
            RemoteMcpError::NotFound(_) => ApiError::new(
                StatusCode::NOT_FOUND,
                "REMOTE_SERVER_NOT_FOUND",
                e.to_string(),
            ),
            RemoteMcpError::CredentialNotFound(_) => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_NOT_FOUND",
                e.to_string(),
            ),
            RemoteMcpError::TooManyConnections => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "TOO_MANY_CONNECTIONS",
                e.to_string(),
            ),
            RemoteMcpError::Validation(m) => ApiError::validation(m),
            RemoteMcpError::Connect(_) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "REMOTE_CONNECT_FAILED",
                e.to_string(),
            ),
            RemoteMcpError::Store(inner) => inner.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Allowlist(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "GATEWAY_ALLOWLIST", e.to_string())
            }
            GatewayError::NotFound(_) => ApiError::not_found(e.to_string()),
            GatewayError::Store(inner) => inner.into(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::InvalidSource(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_source", e.to_string())
            }
            CatalogError::RateLimited {
                retry_after_seconds,
            } => ApiError {
                status: StatusCode::TOO_MANY_REQUESTS,
                error_code: "rate_limited",
                message: "upstream registry rate limited the request".to_string(),
                detail: None,
                retry_after_seconds,
                correlation_id: None,
            },
            CatalogError::UpstreamUnavailable(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "upstream_unavailable",
                e.to_string(),
            ),
            CatalogError::Fetch(_) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "CATALOG_ERROR", e.to_string())
            }
        }
    }
}

impl From<GitHubTokenError> for ApiError {
    fn from(e: GitHubTokenError) -> Self {
        match e {
            GitHubTokenError::NotConfigured => ApiError::not_found(e.to_string()),
            GitHubTokenError::EmptyToken => ApiError::validation(e.to_string()),
            GitHubTokenError::Secret(inner) => inner.into(),
            GitHubTokenError::Vault(inner) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "SECRET_ERROR",
                inner.to_string(),
            ),
            GitHubTokenError::Cipher(inner) => ApiError::internal(inner.to_string()),
            GitHubTokenError::Store(inner) => inner.into(),
        }
    }
}

impl From<InspectorError> for ApiError {
    fn from(e: InspectorError) -> Self {
        let status = match &e {
            InspectorError::ContainerNotFound(_) => StatusCode::NOT_FOUND,
            InspectorError::Unreachable(_) | InspectorError::Protocol(_) => StatusCode::BAD_GATEWAY,
            InspectorError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, "INSPECTOR_ERROR", e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_rate_limit_carries_retry_after() {
        let err: ApiError = CatalogError::RateLimited {
            retry_after_seconds: Some(42),
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_code, "rate_limited");
        assert_eq!(err.retry_after_seconds, Some(42));
    }

    #[test]
    fn internal_errors_hide_detail_from_clients() {
        let err: ApiError = StoreError::Timestamp("secret path /x/y".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_code, "INTERNAL_ERROR");
        assert!(!err.message.contains("/x/y"));
    }

    #[test]
    fn too_many_connections_is_429() {
        let err: ApiError = RemoteMcpError::TooManyConnections.into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_code, "TOO_MANY_CONNECTIONS");
    }

    #[test]
    fn conflict_carries_existing_container_detail() {
        let err: ApiError = ContainerError::AlreadyExists {
            name: "demo".into(),
            container_id: Some("abc".into()),
            status: Some("running".into()),
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.error_code, "CONTAINER_ALREADY_EXISTS");
        assert_eq!(err.detail.as_deref(), Some("existing container abc is running"));
    }

    #[test]
    fn scope_denial_maps_to_403() {
        let err: ApiError = OAuthError::ScopeNotAllowed {
            missing: vec!["repo:write".into()],
        }
        .into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.error_code, "SCOPE_NOT_ALLOWED");
        assert!(err.message.contains("repo:write"));
    }
}
