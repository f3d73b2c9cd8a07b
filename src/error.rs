//! Error handling for the chronod core.
//!
//! This module provides:
//! - A central error type with machine-readable codes
//! - HTTP status mapping for the external API layer
//! - User-friendly messages vs detailed internal messages
//! - Severity-based logging with tracing integration
//! - Metrics integration for error tracking

use std::borrow::Cow;
use std::fmt;

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for chronod operations.
pub type Result<T> = std::result::Result<T, ChronodError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by API clients for programmatic
/// error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Scheduling errors (1000-1099)
    JobNotFound,
    ExecutionNotFound,
    InvalidSchedule,
    IllegalStateTransition,

    // Dispatch errors (1100-1199)
    QueueUnavailable,
    TimeoutElapsed,
    AdapterFailure,

    // Store errors (2000-2099)
    StoreUnavailable,
    DatabaseError,
    RecordConflict,

    // Serialization errors (2200-2299)
    SerializationError,

    // Configuration errors (5000-5099)
    ConfigurationError,

    // Internal errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::ExecutionNotFound => 1001,
            Self::InvalidSchedule => 1002,
            Self::IllegalStateTransition => 1003,

            Self::QueueUnavailable => 1100,
            Self::TimeoutElapsed => 1101,
            Self::AdapterFailure => 1102,

            Self::StoreUnavailable => 2000,
            Self::DatabaseError => 2001,
            Self::RecordConflict => 2002,

            Self::SerializationError => 2200,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// HTTP status the external API layer should answer with.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::JobNotFound | Self::ExecutionNotFound => 404,
            Self::InvalidSchedule => 422,
            Self::IllegalStateTransition | Self::RecordConflict => 409,
            Self::QueueUnavailable | Self::StoreUnavailable => 503,
            Self::TimeoutElapsed => 504,
            Self::AdapterFailure => 502,
            Self::DatabaseError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => 500,
        }
    }

    /// Check if an operation hitting this error is worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueUnavailable
                | Self::StoreUnavailable
                | Self::DatabaseError
                | Self::TimeoutElapsed
                | Self::AdapterFailure
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "scheduling",
            1100..=1199 => "dispatch",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, rejected transitions)
    Low,
    /// Operational issues (timeouts, adapter failures)
    Medium,
    /// System errors (store failures, critical bugs)
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::ExecutionNotFound
            | ErrorCode::InvalidSchedule
            | ErrorCode::IllegalStateTransition
            | ErrorCode::RecordConflict => Self::Low,

            ErrorCode::TimeoutElapsed | ErrorCode::AdapterFailure => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::QueueUnavailable
            | ErrorCode::StoreUnavailable
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the chronod core.
///
/// Supports structured error codes, user-friendly vs internal messages,
/// source-error chaining and HTTP status mapping.
#[derive(Error, Debug)]
pub struct ChronodError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ChronodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ChronodError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
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

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a job-not-found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("job not found: {}", job_id))
    }

    /// Create an execution-not-found error.
    pub fn execution_not_found(execution_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ExecutionNotFound,
            format!("execution not found: {}", execution_id),
        )
    }

    /// Create an invalid-schedule error.
    pub fn invalid_schedule(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidSchedule, message)
    }

    /// Create an illegal-state-transition error.
    pub fn illegal_transition(action: &str, status: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::IllegalStateTransition,
            format!("cannot {} a job in status '{}'", action, status),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add an internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "critical error"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "high severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "low severity error"
                );
            }
        }
    }

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "chronod_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions from library errors
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for ChronodError {
    fn from(error: sqlx::Error) -> Self {
        let code = match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ErrorCode::StoreUnavailable
            }
            _ => ErrorCode::DatabaseError,
        };
        Self::with_internal(code, "store operation failed", error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for ChronodError {
    fn from(error: redis::RedisError) -> Self {
        Self::with_internal(
            ErrorCode::QueueUnavailable,
            "queue operation failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for ChronodError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "serialization failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<reqwest::Error> for ChronodError {
    fn from(error: reqwest::Error) -> Self {
        let code = if error.is_timeout() {
            ErrorCode::TimeoutElapsed
        } else {
            ErrorCode::AdapterFailure
        };
        Self::with_internal(code, "http request failed", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for ChronodError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::TimeoutElapsed, "operation timed out", error.to_string())
    }
}

impl From<std::io::Error> for ChronodError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "i/o failure", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for ChronodError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "configuration is invalid",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::JobNotFound.http_status(), 404);
        assert_eq!(ErrorCode::InvalidSchedule.http_status(), 422);
        assert_eq!(ErrorCode::IllegalStateTransition.http_status(), 409);
        assert_eq!(ErrorCode::QueueUnavailable.http_status(), 503);
        assert_eq!(ErrorCode::StoreUnavailable.http_status(), 503);
        assert_eq!(ErrorCode::TimeoutElapsed.http_status(), 504);
        assert_eq!(ErrorCode::AdapterFailure.http_status(), 502);
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::QueueUnavailable.is_retryable());
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(!ErrorCode::InvalidSchedule.is_retryable());
        assert!(!ErrorCode::IllegalStateTransition.is_retryable());
    }

    #[test]
    fn display_includes_internal_message() {
        let err = ChronodError::with_internal(
            ErrorCode::DatabaseError,
            "store operation failed",
            "connection refused",
        );
        let text = err.to_string();
        assert!(text.contains("DatabaseError"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn illegal_transition_message() {
        let err = ChronodError::illegal_transition("trigger", "paused");
        assert_eq!(err.code(), ErrorCode::IllegalStateTransition);
        assert!(err.user_message().contains("trigger"));
        assert!(err.user_message().contains("paused"));
    }
}
