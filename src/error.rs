//! Error types for the moderation service.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::moderation::model::ModerationStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Image could not be loaded: {0}")]
    Image(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::RequestFailed { reason, .. } => {
                reason.contains("timed out") || reason.starts_with("HTTP 5")
            }
            _ => false,
        }
    }
}

/// Moderation workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("Photo {id} not found")]
    NotFound { id: Uuid },

    #[error("Photo {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ModerationStatus,
        to: ModerationStatus,
    },

    #[error("Analysis attempt {attempt} for photo {id} was superseded by attempt {current}")]
    SupersededAttempt { id: Uuid, attempt: u32, current: u32 },

    #[error("Rejection requires a non-empty reason")]
    MissingReason,

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] LlmError),

    #[error("Storage failed: {0}")]
    Storage(#[from] DatabaseError),
}

impl IntoResponse for ModerationError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } | Self::SupersededAttempt { .. } => {
                StatusCode::CONFLICT
            }
            Self::MissingReason | Self::InvalidSubmission(_) => StatusCode::BAD_REQUEST,
            Self::Analysis(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
