//! Error handling for jobforge.
//!
//! This module provides:
//! - Stable, machine-readable error codes for API responses
//! - HTTP status code mapping for the admin surface
//! - User-friendly messages separated from internal detail
//! - `IntoResponse` so handlers can return `Result<_, ForgeError>` directly

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// A specialized Result type for jobforge operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job queue errors
    UnknownJobType,
    BrokerUnavailable,
    HandlerFailed,

    // Scheduler errors
    TaskNotFound,
    InvalidCronExpression,

    // Backup/restore errors
    StoreUnavailable,
    BackupInProgress,
    ArtifactNotFound,
    InvalidArtifactFormat,
    BackupIoError,

    // Validation errors
    ValidationError,
    MissingRequiredField,

    // Serialization errors
    SerializationError,

    // Configuration errors
    ConfigurationError,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Caller errors (400)
            Self::UnknownJobType
            | Self::ValidationError
            | Self::MissingRequiredField
            | Self::InvalidCronExpression
            | Self::InvalidArtifactFormat => StatusCode::BAD_REQUEST,

            // Not Found (404)
            Self::TaskNotFound | Self::ArtifactNotFound => StatusCode::NOT_FOUND,

            // Conflict (409)
            Self::BackupInProgress => StatusCode::CONFLICT,

            // Service Unavailable (503)
            Self::BrokerUnavailable | Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            // Internal Server Error (500)
            Self::HandlerFailed
            | Self::BackupIoError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is transient and worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable | Self::StoreUnavailable | Self::BackupInProgress
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for jobforge.
///
/// Carries a stable error code, a message safe to expose to clients, and an
/// optional internal message that only ever reaches the logs.
#[derive(Error, Debug)]
pub struct ForgeError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    internal_message: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ForgeError {
    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        }
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Attach the source error that caused this error.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a missing-field error.
    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
    }

    /// Create an unknown-job-type error listing the valid types.
    pub fn unknown_job_type(requested: &str, valid: &[&str]) -> Self {
        Self::new(
            ErrorCode::UnknownJobType,
            format!(
                "Invalid job type '{}'. Valid types: {}",
                requested,
                valid.join(", ")
            ),
        )
    }

    /// Create a broker-unavailable error.
    pub fn broker_unavailable(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BrokerUnavailable,
            "Job broker is unavailable",
            detail,
        )
    }

    /// Create a store-unavailable error.
    pub fn store_unavailable() -> Self {
        Self::new(ErrorCode::StoreUnavailable, "Data store connection not established")
    }

    /// Create a backup-in-progress error.
    pub fn backup_in_progress() -> Self {
        Self::new(
            ErrorCode::BackupInProgress,
            "A backup run is already in progress",
        )
    }

    /// Create an artifact-not-found error.
    pub fn artifact_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::ArtifactNotFound,
            format!("Backup artifact not found: {}", name),
        )
    }

    /// Create an invalid-artifact-format error.
    pub fn invalid_artifact(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidArtifactFormat,
            "Backup artifact could not be parsed",
            detail,
        )
    }

    /// Create a task-not-found error.
    pub fn task_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Scheduled task not found: {}", name),
        )
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message, if any.
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Serialization failed",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<redis::RedisError> for ForgeError {
    fn from(err: redis::RedisError) -> Self {
        Self::broker_unavailable(err.to_string()).with_source(err)
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        Self::with_internal(
            ErrorCode::BackupIoError,
            "Backup storage I/O failed",
            err.to_string(),
        )
        .with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

/// Wire shape of an API error body.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    error_code: ErrorCode,
}

impl IntoResponse for ForgeError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();

        if status.is_server_error() {
            tracing::error!(
                code = %self.code,
                internal = self.internal_message.as_deref().unwrap_or(""),
                "{}",
                self.user_message
            );
        } else {
            tracing::warn!(code = %self.code, "{}", self.user_message);
        }

        let body = ErrorBody {
            success: false,
            error: self.user_message.into_owned(),
            error_code: self.code,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            ErrorCode::UnknownJobType.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorCode::ArtifactNotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ErrorCode::BackupInProgress.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::BrokerUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::BrokerUnavailable.is_retryable());
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(!ErrorCode::UnknownJobType.is_retryable());
        assert!(!ErrorCode::InvalidArtifactFormat.is_retryable());
    }

    #[test]
    fn test_user_vs_internal_message() {
        let err = ForgeError::broker_unavailable("connection refused on 127.0.0.1:6379");
        assert_eq!(err.user_message(), "Job broker is unavailable");
        assert!(err.internal_message().unwrap().contains("127.0.0.1"));
    }

    #[test]
    fn test_unknown_job_type_lists_valid_types() {
        let err = ForgeError::unknown_job_type("not_a_type", &["daily_reminder", "weekly_summary"]);
        assert_eq!(err.code(), ErrorCode::UnknownJobType);
        assert!(err.user_message().contains("not_a_type"));
        assert!(err.user_message().contains("daily_reminder"));
    }
}
