//! API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use headmail_common::Error;
use serde::Serialize;
use tracing::error;

/// Wrapper turning service errors into JSON error responses with the status
/// code the error kind maps to.
pub struct ApiError(pub Error);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let resp = ApiError(Error::not_found("campaign", "x")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError(Error::UniqueConstraint("dup".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError(Error::Validation("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
