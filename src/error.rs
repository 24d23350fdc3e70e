//! Error types for the Turnstile admission layer.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::BackendKind;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cost amount that is not a finite, non-negative number
    #[error("Invalid cost amount: {0}")]
    InvalidCost(f64),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Failure of a single call against the shared store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store no longer has the cached script body.
    #[error("script not cached by the store")]
    NoScript,

    /// The call did not complete within the configured bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or server-side failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The store answered with something the client could not interpret.
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::NoScriptError => StoreError::NoScript,
            redis::ErrorKind::TypeError => StoreError::Protocol(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// A limiter backend could not evaluate a request.
///
/// This is never an allow/deny answer; the caller decides what to do with it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{backend} rate limiter unavailable: {reason}")]
pub struct LimiterUnavailable {
    /// The backend that failed
    pub backend: BackendKind,
    /// Human-readable cause
    pub reason: String,
}

impl LimiterUnavailable {
    pub fn new(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }
}
