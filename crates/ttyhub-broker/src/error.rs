use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Unknown session, or a session owned by someone else. The two cases
    /// share one message so non-owners learn nothing about existence.
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session limit reached ({limit} per owner)")]
    CapacityExceeded { limit: usize },
    #[error("attach token is invalid or expired")]
    InvalidToken,
    #[error("invalid terminal geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },
    #[error("session mode '{0}' is disabled")]
    ModeDisabled(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("missing caller identity")]
    Unauthorized,
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::InvalidToken | BrokerError::Unauthorized => StatusCode::UNAUTHORIZED,
            BrokerError::InvalidGeometry { .. } | BrokerError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::ModeDisabled(_) => StatusCode::FORBIDDEN,
            BrokerError::Spawn(_) | BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NotFound(_) => "not_found",
            BrokerError::CapacityExceeded { .. } => "capacity_exceeded",
            BrokerError::InvalidToken => "invalid_token",
            BrokerError::InvalidGeometry { .. } => "invalid_geometry",
            BrokerError::ModeDisabled(_) => "mode_disabled",
            BrokerError::BadRequest(_) => "bad_request",
            BrokerError::Unauthorized => "unauthorized",
            BrokerError::Spawn(_) => "spawn_failed",
            BrokerError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_codes() {
        assert_eq!(BrokerError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            BrokerError::CapacityExceeded { limit: 8 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(BrokerError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            BrokerError::InvalidGeometry { cols: 1, rows: 1 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(BrokerError::ModeDisabled("tmux".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            BrokerError::Spawn("nope".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn not_found_message_does_not_leak_ownership() {
        let err = BrokerError::NotFound("abc".into());
        assert_eq!(err.to_string(), "session abc not found");
        assert_eq!(err.code(), "not_found");
    }
}
