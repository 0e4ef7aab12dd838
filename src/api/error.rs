use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::Error;

/// REST-facing wrapper over the crate error taxonomy.
///
/// Handlers return `Result<T, ApiError>`; the `From<Error>` impl lets them
/// use `?` on any component call. The response body is always
/// `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError(Error::NotFound(what.into()))
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(Error::Protocol(msg.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Configuration(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadState(_) => StatusCode::CONFLICT,
            Error::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::RateLimited(_) | Error::CapExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::HostDriver(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self.0, Error::Internal(_)) {
            tracing::error!(error = %self.0, "internal error surfaced to client");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
