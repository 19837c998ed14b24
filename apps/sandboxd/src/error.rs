//! Maps `sandbox_core::CoreError` onto the HTTP status codes spec §7 names,
//! the way route handlers here turn orchestrator errors into
//! `(StatusCode, Json<ErrorBody>)` rather than leaking source error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sandbox_core::{CoreError, ErrorKind};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let msg = self.0.to_string();
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            // Spec §7/§8 S5: quota exhaustion is 429; other conflicts (e.g.
            // snapshot cpu/mem mismatch) are 409. The orchestrator's
            // `CoreError::Conflict` doesn't carry a sub-kind, so the quota
            // message shape is the discriminator here.
            ErrorKind::Conflict if msg.contains("reached max") => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::TransientTransport => StatusCode::BAD_GATEWAY,
            ErrorKind::ProtocolViolation => StatusCode::BAD_GATEWAY,
            ErrorKind::SubprocessFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::FatalState => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: msg })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
