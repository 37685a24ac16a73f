use crate::protocol::{ErrorBody, ErrorCode};
use axum::Json;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures the relay can hit while serving one request.
///
/// The `Display` text is for server logs only. Callers receive the fixed
/// message and code from [`RelayError::safe`].
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("COACH_UPSTREAM_API_KEY is not configured")]
    MissingCredential,

    #[error("upstream responded with {0}")]
    UpstreamStatus(StatusCode),

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed request body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error("failed to read request body: {0}")]
    UnreadableBody(#[from] BytesRejection),
}

/// What a caller is allowed to see about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeError {
    pub message: &'static str,
    pub code: ErrorCode,
    pub status: StatusCode,
}

impl RelayError {
    pub fn safe(&self) -> SafeError {
        let (message, code, status) = match self {
            RelayError::InvalidInput(message) => {
                (*message, ErrorCode::InvalidInput, StatusCode::BAD_REQUEST)
            }
            RelayError::Unauthorized => (
                "Unauthorized",
                ErrorCode::Unauthorized,
                StatusCode::UNAUTHORIZED,
            ),
            RelayError::MissingCredential => (
                "Service configuration error",
                ErrorCode::ServiceError,
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            RelayError::UpstreamStatus(upstream) => match upstream.as_u16() {
                429 => (
                    "Too many requests. Please try again later.",
                    ErrorCode::RateLimit,
                    StatusCode::TOO_MANY_REQUESTS,
                ),
                402 => (
                    "Service temporarily unavailable.",
                    ErrorCode::ServiceUnavailable,
                    StatusCode::SERVICE_UNAVAILABLE,
                ),
                _ => (
                    "Unable to process request.",
                    ErrorCode::ServiceError,
                    StatusCode::INTERNAL_SERVER_ERROR,
                ),
            },
            RelayError::Transport(err) if err.is_connect() || err.is_timeout() => (
                "Unable to connect to AI service",
                ErrorCode::ConnectionError,
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            RelayError::Transport(_)
            | RelayError::MalformedBody(_)
            | RelayError::UnreadableBody(_) => (
                "An unexpected error occurred",
                ErrorCode::UnknownError,
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        };

        SafeError {
            message,
            code,
            status,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let safe = self.safe();
        match &self {
            RelayError::InvalidInput(_) | RelayError::Unauthorized => {
                tracing::warn!(code = ?safe.code, "rejected relay request");
            }
            _ => {
                tracing::error!(error = %self, code = ?safe.code, "relay request failed");
            }
        }

        let body = Json(ErrorBody {
            error: safe.message.to_string(),
            code: safe.code,
        });
        (safe.status, body).into_response()
    }
}
