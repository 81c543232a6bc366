//! Per-request errors and their HTTP mapping
//!
//! Every failed `/ocr` request returns
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ocr_provider::ImageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Pool(#[from] key_pool::Error),
}

impl From<ImageError> for ApiError {
    fn from(e: ImageError) -> Self {
        ApiError::InvalidRequest(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pool(e) => match e {
                key_pool::Error::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                key_pool::Error::Provider(_) => StatusCode::BAD_GATEWAY,
                key_pool::Error::Cancelled => StatusCode::GATEWAY_TIMEOUT,
                key_pool::Error::Store(_) | key_pool::Error::Accounting(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Value of the `error.type` field
    pub fn kind(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "invalid_request",
            StatusCode::SERVICE_UNAVAILABLE => "pool_exhausted",
            StatusCode::BAD_GATEWAY => "provider_error",
            StatusCode::GATEWAY_TIMEOUT => "timeout",
            _ => "internal_error",
        }
    }

    /// Client-facing message. Store failures stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::Pool(key_pool::Error::Cancelled) => "OCR request timed out".to_string(),
            ApiError::Pool(key_pool::Error::Store(_) | key_pool::Error::Accounting(_)) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.public_message(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
