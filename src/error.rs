//! Error taxonomy shared across the pipeline and the HTTP surface.
//!
//! Each variant maps to an HTTP status code and a `{error, detail}` JSON
//! body; internal callers match on the kind to decide whether a failure
//! is recoverable.

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsatisfiable range")]
    UnsatisfiableRange,

    #[error("timeout")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("startup not ready")]
    StartupNotReady,
}

impl AppError {
    pub fn status(&self) -> u16 {
        match self {
            AppError::InvalidInput(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::NotFound => 404,
            AppError::Conflict(_) => 409,
            AppError::UnsatisfiableRange => 416,
            AppError::Timeout => 504,
            AppError::UpstreamUnavailable(_) => 502,
            AppError::RateLimited => 429,
            AppError::Internal(_) => 500,
            AppError::StartupNotReady => 503,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::UnsatisfiableRange => "unsatisfiable_range",
            AppError::Timeout => "timeout",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::RateLimited => "rate_limited",
            AppError::Internal(_) => "internal",
            AppError::StartupNotReady => "startup_not_ready",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let status = axum::http::StatusCode::from_u16(self.status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "error": self.kind(), "detail": self.to_string() }));
        (status, body).into_response()
    }
}
