use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerError;

/// Application-wide error types for perch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// The provider answered, but with a failure.
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// HTTP request to the provider failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// A circuit breaker rejected the call without reaching the provider.
    #[error("Circuit breaker '{name}' is open (retry after {retry_after_secs}s): {last_error}")]
    CircuitOpen {
        name: String,
        retry_after_secs: u64,
        last_error: String,
    },

    /// The author profile lookup gave up.
    #[error("Author lookup unavailable for {0}")]
    LookupUnavailable(u64),

    /// Scheduling resource could not be started or torn down.
    #[error("Scheduling error: {0}")]
    SchedulingError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::ProviderError(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true for synthetic rejections raised by an open breaker.
    ///
    /// Rejections must not be reported back to the breaker as new failures.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AppError::CircuitOpen { .. })
    }
}

impl From<CircuitBreakerError<AppError>> for AppError {
    fn from(err: CircuitBreakerError<AppError>) -> Self {
        match err {
            CircuitBreakerError::Open {
                name,
                retry_after,
                last_error,
            } => AppError::CircuitOpen {
                name,
                retry_after_secs: retry_after.as_secs(),
                last_error: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no recorded error".to_string()),
            },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}
