//! HTTP error mapping.
//!
//! Every error produces a JSON body with a machine-readable `error` field and
//! a human-readable `message`. Core error kinds map onto status codes here
//! and nowhere else.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use ovs_domain::CoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub struct AppError(pub CoreError);

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidTransition(_) => StatusCode::CONFLICT,
            CoreError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::PreconditionViolated(_) => StatusCode::CONFLICT,
            CoreError::ResourceConflict(_) => StatusCode::CONFLICT,
            CoreError::SubprocessFailure(_) => StatusCode::CONFLICT,
            CoreError::PushNotFastForward(_) => StatusCode::CONFLICT,
            CoreError::ArtifactPathDenied(_) => StatusCode::FORBIDDEN,
            CoreError::ConfigurationError(_)
            | CoreError::HealthCheckFailed(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "internal error in handler");
        }

        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<CoreError>,
{
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

/// Handler result alias.
pub type ApiResult<T> = Result<T, AppError>;
