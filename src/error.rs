//! Unified service-layer error type for keyharbor
//!
//! `ServiceError` bridges the gap between DB-layer errors (`sqlx::Error`,
//! `BoxError`) and HTTP responses. It enables `?` propagation without manual
//! `.map_err(|e| { tracing::error!(...); ... })` boilerplate in handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Database error (auto-logged, mapped to 500)
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Infrastructure error (AWS SDK, serde, reqwest, etc.)
    #[error("internal error: {0}")]
    Internal(#[from] BoxError),

    /// Business-rule error with the HTTP status the client should see
    #[error("{1}")]
    App(StatusCode, String),
}

impl ServiceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ServiceError::App(StatusCode::BAD_REQUEST, msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::App(StatusCode::NOT_FOUND, msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::App(StatusCode::CONFLICT, msg.into())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ServiceError::Db(e) => {
                tracing::error!(error = %e, "Service database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            ServiceError::Internal(e) => {
                tracing::error!(error = %e, "Service infrastructure error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            ServiceError::App(status, message) => (status, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Convenience type alias for service-layer results
pub type ServiceResult<T> = Result<T, ServiceError>;
