//! Error types for the automation engine and its HTTP surface.
//!
//! `EngineError` is what the engine core returns; `AppError` is what handlers
//! return and knows how to render itself as the JSON error envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::integrations::CollaboratorError;

pub type FieldErrors = HashMap<String, Vec<String>>;

/// Failure taxonomy of the engine core.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0:?}")]
    Validation(FieldErrors),
    #[error("{0} not found")]
    NotFound(String),
    #[error("message dispatch failed: {0}")]
    Dispatch(String),
    #[error("infrastructure unavailable: {0}")]
    TransientInfra(String),
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert(field.into(), vec![message.into()]);
        Self::Validation(details)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Dispatch(_) => "dispatch",
            Self::TransientInfra(_) => "transient_infra",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::TransientInfra(format!("database: {}", err)),
        }
    }
}

impl From<CollaboratorError> for EngineError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::NotFound(what) => Self::NotFound(what),
            other => Self::TransientInfra(other.to_string()),
        }
    }
}

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            path: None,
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    ValidationError { details: FieldErrors },
    DispatchError(String),
    TransientInfra(String),
    InternalError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DispatchError(_) => StatusCode::BAD_GATEWAY,
            Self::TransientInfra(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DispatchError(_) => "DISPATCH_ERROR",
            Self::TransientInfra(_) => "TRANSIENT_INFRA_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::BadRequest(msg) => msg.clone(),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::DispatchError(msg) => {
                tracing::error!("Dispatch error: {}", msg);
                "Message dispatch failed".to_string()
            }
            Self::TransientInfra(msg) => {
                tracing::error!("Infrastructure error: {}", msg);
                "A backing service is unavailable".to_string()
            }
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details } = self {
            error.details = Some(details);
        }

        (status, Json(error)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(details) => Self::ValidationError { details },
            EngineError::NotFound(what) => Self::NotFound(what),
            EngineError::Dispatch(msg) => Self::DispatchError(msg),
            EngineError::TransientInfra(msg) => Self::TransientInfra(msg),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                Self::Unauthorized("Authentication token has expired".to_string())
            }
            _ => Self::Unauthorized(format!("Invalid token: {}", err)),
        }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Collects field errors before failing a request.
pub struct ValidationBuilder {
    details: FieldErrors,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self {
            details: HashMap::new(),
        }
    }

    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.push(field, message);
        self
    }

    pub fn push(&mut self, field: &str, message: &str) {
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }

    pub fn build(self) -> Option<EngineError> {
        if self.details.is_empty() {
            None
        } else {
            Some(EngineError::Validation(self.details))
        }
    }

    /// `Ok(value)` when nothing was collected.
    pub fn finish<T>(self, value: T) -> EngineResult<T> {
        match self.build() {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

impl Default for ValidationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
