//! Error types for the Turnstile service.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while checking a quota.
///
/// Every variant is indeterminate: the store could not tell us whether the
/// client is over quota. A rejection is never an error, it is a normal
/// [`QuotaResult`](crate::quota::QuotaResult) with `allowed == false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// The transaction could not be submitted (connection failure).
    #[error("Quota store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store accepted the call but the transaction itself errored.
    #[error("Quota transaction failed: {0}")]
    TransactionFailed(String),

    /// The store did not answer before the caller's deadline.
    #[error("Quota store did not answer within {0:?}")]
    DeadlineExceeded(Duration),
}

impl QuotaError {
    /// Whether the caller must apply its fail policy for this error.
    ///
    /// Always true today; kept as a method so the boundary layer does not
    /// match on variants.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            QuotaError::StoreUnavailable(_)
                | QuotaError::TransactionFailed(_)
                | QuotaError::DeadlineExceeded(_)
        )
    }

    /// Short machine-readable label, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            QuotaError::StoreUnavailable(_) => "store_unavailable",
            QuotaError::TransactionFailed(_) => "transaction_failed",
            QuotaError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quota store errors surfaced outside a request (start-up, sweeps)
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
