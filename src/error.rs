use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodeboxError>;

/// Error taxonomy surfaced to clients as `{"error": {"code", "detail"}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    PolicyViolation,
    Conflict,
    ContainerError,
    ResourceExceeded,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::PolicyViolation => "POLICY_VIOLATION",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ContainerError => "CONTAINER_ERROR",
            ErrorCode::ResourceExceeded => "RESOURCE_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest | ErrorCode::PolicyViolation | ErrorCode::ResourceExceeded => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::ContainerError => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CodeboxError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Policy violation: {0}")]
    Policy(String),

    /// Signature or expiry check failed on a signed artifact URL.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("VM error: {0}")]
    Vm(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Grading store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl CodeboxError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container(msg.into())
    }

    pub fn vm(msg: impl Into<String>) -> Self {
        Self::Vm(msg.into())
    }

    pub fn resource_exceeded(msg: impl Into<String>) -> Self {
        Self::ResourceExceeded(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Taxonomy code reported to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            CodeboxError::BadRequest(_) | CodeboxError::Json(_) | CodeboxError::Base64(_) => {
                ErrorCode::BadRequest
            }
            CodeboxError::Policy(_) | CodeboxError::Forbidden(_) => ErrorCode::PolicyViolation,
            CodeboxError::Conflict(_) => ErrorCode::Conflict,
            CodeboxError::Container(_) | CodeboxError::Vm(_) | CodeboxError::Docker(_) => {
                ErrorCode::ContainerError
            }
            CodeboxError::ResourceExceeded(_) => ErrorCode::ResourceExceeded,
            CodeboxError::NotFound(_) => ErrorCode::NotFound,
            CodeboxError::Config(_)
            | CodeboxError::Store(_)
            | CodeboxError::Internal(_)
            | CodeboxError::Io(_)
            | CodeboxError::Toml(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CodeboxError::Forbidden(_) => StatusCode::FORBIDDEN,
            other => other.code().status(),
        }
    }

    /// Human readable detail without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            CodeboxError::BadRequest(msg)
            | CodeboxError::Policy(msg)
            | CodeboxError::Forbidden(msg)
            | CodeboxError::Conflict(msg)
            | CodeboxError::Container(msg)
            | CodeboxError::Vm(msg)
            | CodeboxError::ResourceExceeded(msg)
            | CodeboxError::NotFound(msg)
            | CodeboxError::Config(msg)
            | CodeboxError::Store(msg)
            | CodeboxError::Internal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for CodeboxError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code(), "request failed: {}", self);
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "detail": self.detail(),
            }
        });
        (status, Json(body)).into_response()
    }
}
