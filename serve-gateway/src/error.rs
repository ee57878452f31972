//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serve_common::ErrorResponse;

/// Everything that can go wrong between the HTTP edge and the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed client input. Never retried.
    #[error("{0}")]
    Validation(String),

    /// No engine is loaded, or the loaded one has shut down.
    #[error("Engine not available: {0}")]
    EngineUnavailable(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    /// A delta stream was requested twice for the same handle.
    #[error("Stream already consumed for {0}")]
    StreamAlreadyConsumed(String),

    /// A new engine could not be brought up; the previous one stays active.
    #[error("Reconfigure failed: {0}")]
    Reconfigure(String),

    /// The engine failed mid-generation.
    #[error("Engine error: {0}")]
    UpstreamEngine(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::StreamAlreadyConsumed(_)
            | Error::Reconfigure(_)
            | Error::UpstreamEngine(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::EngineUnavailable(_) => "EngineUnavailable",
            Error::NotFound(_) => "NotFound",
            Error::StreamAlreadyConsumed(_) => "StreamAlreadyConsumed",
            Error::Reconfigure(_) => "ReconfigureError",
            Error::UpstreamEngine(_) => "UpstreamEngineError",
            Error::Timeout(_) => "Timeout",
            Error::Internal(_) => "InternalError",
        }
    }

    /// Client-facing body. Server-side failures get a generic message so no
    /// engine or internal detail leaks out.
    pub fn to_body(&self) -> ErrorResponse {
        let message = match self {
            Error::Validation(_)
            | Error::EngineUnavailable(_)
            | Error::NotFound(_)
            | Error::Timeout(_) => self.to_string(),
            Error::Reconfigure(_) => "Reconfigure failed; previous engine remains active".to_string(),
            Error::UpstreamEngine(_) => "The engine failed while generating".to_string(),
            Error::StreamAlreadyConsumed(_) | Error::Internal(_) => {
                "Internal server error".to_string()
            }
        };
        ErrorResponse::new(message, self.error_type(), self.status().as_u16())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error_type = self.error_type(), "{}", self);
        } else {
            tracing::debug!(error_type = self.error_type(), "{}", self);
        }

        (status, Json(self.to_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::EngineUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(Error::Timeout(5).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            Error::StreamAlreadyConsumed("gen-1".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_not_found_body() {
        let body = Error::NotFound("unknown".into()).to_body();
        assert_eq!(body.error_type, "NotFound");
        assert_eq!(body.code, 404);
        assert_eq!(body.message, "Model not found: unknown");
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let body = Error::Internal("mutex poisoned at registry.rs:42".into()).to_body();
        assert_eq!(body.code, 500);
        assert_eq!(body.message, "Internal server error");

        let body = Error::UpstreamEngine("connection reset by 10.0.0.7".into()).to_body();
        assert!(!body.message.contains("10.0.0.7"));
    }
}
