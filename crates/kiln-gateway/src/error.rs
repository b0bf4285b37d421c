//! The wire error envelope: `{code, message, stack?}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_engine::ExecError;
use serde::Serialize;

/// Error body returned by every endpoint. The HTTP status mirrors the code
/// when it is a valid status, otherwise 500.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        if (400..600).contains(&self.code) {
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ExecError> for ErrorEnvelope {
    fn from(err: ExecError) -> Self {
        let err = err.into_public();
        Self {
            code: err.code(),
            message: err.message(),
            stack: err.stack().map(str::to_string),
        }
    }
}

impl IntoResponse for ErrorEnvelope {
    fn into_response(self) -> Response {
        tracing::debug!(code = self.code, message = %self.message, "request failed");
        (self.status(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mirrors_code_in_http_range() {
        assert_eq!(ErrorEnvelope::new(404, "x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorEnvelope::new(408, "x").status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ErrorEnvelope::new(200, "x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorEnvelope::new(999, "x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn exec_errors_collapse_to_public_codes() {
        let envelope = ErrorEnvelope::from(ExecError::NoSuchMethod);
        assert_eq!(envelope.code, 404);

        let envelope = ErrorEnvelope::from(ExecError::Terminated);
        assert_eq!(envelope.code, 408);
        assert!(envelope.message.contains("shouldn't be blocking"));
    }

    #[test]
    fn stack_is_omitted_from_json_when_absent() {
        let body = serde_json::to_string(&ErrorEnvelope::new(500, "boom")).unwrap();
        assert!(!body.contains("stack"));
    }
}
