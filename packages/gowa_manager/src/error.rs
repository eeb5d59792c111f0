//! API-boundary error type and its `{error, success:false}` envelope.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// One variant per error kind in §7. Internal glue code elsewhere uses
/// `anyhow::Result` with `.context(...)`; this type exists only at the
/// HTTP boundary, where a status code and message must be chosen.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("version unavailable: {0}")]
    VersionUnavailable(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("instance is not running")]
    UpstreamNotRunning,
    #[error("{0}")]
    TransientNetwork(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::BAD_REQUEST,
            AppError::VersionUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let status = self.status();
        let body = Json(json!({ "error": self.to_string(), "success": false }));
        (status, body).into_response()
    }
}

/// 401 response for missing/invalid admin credentials, carrying the
/// `WWW-Authenticate` challenge required by §6.
pub fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "authentication required", "success": false })),
    )
        .into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"GOWA Manager\""),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert_eq!(AppError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::UpstreamUnreachable("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::UpstreamNotRunning.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
