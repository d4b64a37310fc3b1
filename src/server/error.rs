//! HTTP error responses
//!
//! Every failure leaves the service as `{"detail": "<message>"}`, which is what the
//! frontend displays.

use crate::error::LayerFlowError;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

/// Error returned by the request handlers
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    #[must_use]
    pub fn new<S: Into<String>>(status: StatusCode, detail: S) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Failure while streaming the multipart body
    ///
    /// Oversized bodies keep their 413; anything else is a malformed form.
    pub(crate) fn from_multipart(error: &MultipartError) -> Self {
        let status = match error.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        log::warn!("Rejected multipart body: {}", error.body_text());
        Self::new(status, error.body_text())
    }
}

impl From<LayerFlowError> for ApiError {
    fn from(error: LayerFlowError) -> Self {
        let status = StatusCode::from_u16(error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            log::error!("Request failed ({}): {error}", status.as_u16());
        } else {
            log::warn!("Request rejected ({}): {error}", status.as_u16());
        }

        Self::new(status, error.client_message())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        LayerFlowError::invalid_request(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_error_kind() {
        let cases = [
            (LayerFlowError::validation("x"), StatusCode::BAD_REQUEST),
            (LayerFlowError::auth("x"), StatusCode::UNAUTHORIZED),
            (LayerFlowError::invalid_request("x"), StatusCode::UNPROCESSABLE_ENTITY),
            (LayerFlowError::capability("x"), StatusCode::SERVICE_UNAVAILABLE),
            (LayerFlowError::NoLayers, StatusCode::BAD_GATEWAY),
            (LayerFlowError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status(), expected);
        }
    }

    #[test]
    fn test_detail_uses_client_message() {
        let error = ApiError::from(LayerFlowError::capability("CUDA execution provider missing"));
        assert_eq!(
            error.detail(),
            "Local mode needs GPU. Set FAL_KEY for cloud inference."
        );

        let error = ApiError::from(LayerFlowError::NoLayers);
        assert_eq!(error.detail(), "Decomposition failed: No layers returned");
    }
}
