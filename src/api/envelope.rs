//! `{data, meta}` / `{error, meta}` bodies shared by every handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stamped on every body so clients can tell which build answered.
#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub service: &'static str,
    pub version: &'static str,
    pub generated_at: DateTime<Utc>,
}

impl ResponseMeta {
    fn now() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            generated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Response {
        let body = Self {
            data,
            meta: ResponseMeta::now(),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Machine-readable failure class; each maps to one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request, e.g. an alert key without `subject:kind`
    BadRequest,
    /// Incident store read failed
    StoreError,
    /// Stream processor stopped or did not answer in time
    ProcessorUnavailable,
}

impl ErrorCode {
    const fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ProcessorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub error: ErrorDetail,
    pub meta: ResponseMeta,
}

impl ApiErrorResponse {
    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Response {
        let body = Self {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
            meta: ResponseMeta::now(),
        };
        (code.status(), Json(body)).into_response()
    }

    pub fn bad_request(message: impl Into<String>) -> Response {
        Self::with_code(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Response {
        Self::with_code(ErrorCode::StoreError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Response {
        Self::with_code(ErrorCode::ProcessorUnavailable, message)
    }
}
