//! Errors of the HTTP relay as JSON `{"message": ...}` responses.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ipns_publisher::{IngestError, RejectReason};
use serde_json::json;

pub(crate) type HttpResult<T, E = HttpError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl ToString) -> HttpError {
        Self {
            status,
            message: message.to_string(),
        }
    }

    pub fn not_found() -> HttpError {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    pub fn bad_request(message: impl ToString) -> HttpError {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl ToString) -> HttpError {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl ToString) -> HttpError {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<RejectReason> for HttpError {
    fn from(reason: RejectReason) -> Self {
        if reason.is_embedded_key_mismatch() {
            return Self::new(StatusCode::NOT_FOUND, reason);
        }
        Self::bad_request(reason)
    }
}

impl From<IngestError> for HttpError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Rejected(reason) => reason.into(),
            error => Self::bad_request(error),
        }
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}
