use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Rate limit exceeded")]
    RateLimited {
        limit: u32,
        reset_at: i64,
        retry_after: i64,
    },

    #[error("Invalid signature")]
    SignatureInvalid,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for faults that indicate a broken service rather than a bad
    /// request. These get a security audit entry at the call site.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Pool(_) | AppError::Internal(_)
        )
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    timestamp: i64,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "ValidationError", Some(msg.clone()))
            }
            AppError::InvalidState(msg) => {
                (StatusCode::BAD_REQUEST, "InvalidState", Some(msg.clone()))
            }
            AppError::LimitExceeded(msg) => {
                (StatusCode::FORBIDDEN, "LimitExceeded", Some(msg.clone()))
            }
            AppError::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "RateLimitExceeded", None)
            }
            AppError::SignatureInvalid => {
                // No detail: nothing about the expected signature leaks to the caller
                (StatusCode::UNAUTHORIZED, "SignatureInvalid", None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "ValidationError",
                    Some("Invalid JSON".to_string()),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
            timestamp: chrono::Utc::now().timestamp(),
        };

        let mut response = (status, Json(body)).into_response();

        // 429 responses carry the standard backoff headers
        if let AppError::RateLimited {
            limit,
            reset_at,
            retry_after,
        } = self
        {
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&retry_after.max(0).to_string()) {
                headers.insert("retry-after", v);
            }
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("x-ratelimit-limit", v);
            }
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            if let Ok(v) = HeaderValue::from_str(&reset_at.to_string()) {
                headers.insert("x-ratelimit-reset", v);
            }
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
