//! API error taxonomy and its HTTP mapping.
//!
//! Known error kinds map to their status and a structured
//! `{"error": {"message", "code"}}` body. Anything that reaches the 5xx
//! branch is logged with full detail server-side and surfaced to the caller
//! as an opaque message.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// All errors a request handler can surface.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input, local to one request.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid dashboard session.
    #[error("{0}")]
    Unauthorized(String),

    /// Signed-request authenticator failure (unregistered, untrusted,
    /// stale timestamp, bad signature).
    #[error("{0}")]
    Forbidden(String),

    /// Unknown id.
    #[error("{0}")]
    NotFound(String),

    /// Illegal state transition (e.g. approving a rejected registration).
    #[error("{0}")]
    Conflict(String),

    /// Failure during catalog or note reconciliation, with cause.
    #[error("synchronization failed: {0}")]
    Synchronization(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Storage failure. Fatal to the request; transactions have rolled back.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Unclassified failure.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Wrap a reconciliation cause.
    pub fn sync(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Synchronization(Box::new(cause))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Synchronization(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Synchronization(_) => "synchronization",
            Self::Database(_) => "database",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Full detail stays in the log; callers get an opaque message.
            tracing::error!(error = %self, cause = ?std::error::Error::source(&self), "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "code": self.code(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Forbidden("untrusted".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Conflict("not pending".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
