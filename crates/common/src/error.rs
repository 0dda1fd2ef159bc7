use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::types::Channel;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited on {channel}: limit {limit}, retry after {retry_after_seconds}s")]
    RateLimited {
        channel: Channel,
        limit: u64,
        retry_after_seconds: u64,
    },

    #[error("Template '{template}' targets {actual}, not {expected}")]
    ChannelMismatch {
        template: String,
        expected: Channel,
        actual: Channel,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable name, used in bulk failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::ChannelMismatch { .. } | AppError::InvalidRequest(_) => "invalid_request",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Serialization(_)
            | AppError::Transport(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::ChannelMismatch { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let mut body = json!({ "error": message, "kind": self.kind() });

        if let AppError::RateLimited {
            channel,
            limit,
            retry_after_seconds,
        } = &self
        {
            body["channel"] = json!(channel);
            body["limit"] = json!(limit);
            body["retry_after_seconds"] = json!(retry_after_seconds);

            let mut response = (status, Json(body)).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            return response;
        }

        (status, Json(body)).into_response()
    }
}
