//! Quota policy and the decision artifact handed back to callers.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Longest window whose length still fits in signed epoch milliseconds.
pub const MAX_WINDOW_SECS: u64 = (i64::MAX / 1000) as u64;

/// How many requests an identifier may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Maximum requests admitted per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl QuotaPolicy {
    /// Create a policy, rejecting a zero limit, a zero window, or a window
    /// longer than [`MAX_WINDOW_SECS`].
    pub fn new(limit: u64, window_secs: u64) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "quota limit must be a positive integer".to_string(),
            ));
        }
        if window_secs == 0 {
            return Err(TurnstileError::Config(
                "quota window must be at least one second".to_string(),
            ));
        }
        if window_secs > MAX_WINDOW_SECS {
            return Err(TurnstileError::Config(format!(
                "quota window must not exceed {MAX_WINDOW_SECS} seconds"
            )));
        }
        Ok(Self { limit, window_secs })
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// Build the result for a count returned by the store.
    ///
    /// The request that pushes the count past the limit is itself rejected,
    /// and its increment stays recorded.
    pub fn evaluate(&self, count: u64) -> QuotaResult {
        QuotaResult {
            allowed: count <= self.limit,
            count,
            limit: self.limit,
            window_secs: self.window_secs,
        }
    }
}

/// Outcome of one quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests counted in the current window, this one included
    pub count: u64,
    /// Configured maximum requests per window
    pub limit: u64,
    /// Window length in seconds
    #[serde(rename = "window_seconds")]
    pub window_secs: u64,
}

impl QuotaResult {
    /// Requests still available in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}
