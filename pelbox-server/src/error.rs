//! HTTP error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use pelbox_core::{CommandResponse, ErrorKind, GatewayError};

/// Error returned by every handler, rendered as `{success: false, message}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match e.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("command failed: {}", e);
            "Something went wrong".to_string()
        } else {
            e.to_string()
        };

        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(CommandResponse::error(self.message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pelbox_core::sequence::SequenceError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(GatewayError::SessionInactive).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(GatewayError::MissingField("access_token")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::from(GatewayError::DeviceNotFound(3)).status(), StatusCode::NOT_FOUND);

        let worker = SequenceError::Worker("panicked".into());
        let internal = ApiError::from(GatewayError::Sequence(worker));
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "Something went wrong");
    }
}
