//! Strategy selection and the per-deployment limiter handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::clock::Clock;
use super::fixed_window::FixedWindow;
use super::result::{QuotaPolicy, QuotaResult};
use super::sliding_window::SlidingWindow;
use super::strategy::QuotaStrategy;
use crate::error::QuotaError;
use crate::store::AtomicStore;

/// Which counting strategy a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum Mode {
    /// Calendar-aligned buckets, O(1) per identifier
    Fixed,
    /// Moving interval backed by a request log
    #[default]
    Sliding,
}

impl Mode {
    /// Parse a configured mode. Only `"fixed"` selects the fixed window;
    /// anything else, including an empty value, selects the sliding window.
    pub fn parse_lenient(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("fixed") {
            return Mode::Fixed;
        }
        if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("sliding") {
            warn!(mode = %trimmed, "Unrecognised quota mode, using sliding window");
        }
        Mode::Sliding
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Fixed => "fixed",
            Mode::Sliding => "sliding",
        }
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        Mode::parse_lenient(&value)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy bound to one policy and one store deadline.
///
/// This is what the request-handling boundary holds: it only has to supply
/// the identifier.
#[derive(Clone)]
pub struct Limiter {
    strategy: Arc<dyn QuotaStrategy>,
    policy: QuotaPolicy,
    timeout: Duration,
}

impl Limiter {
    pub fn new(strategy: Arc<dyn QuotaStrategy>, policy: QuotaPolicy, timeout: Duration) -> Self {
        Self {
            strategy,
            policy,
            timeout,
        }
    }

    /// Count one request for `identifier`.
    pub async fn check(&self, identifier: &str) -> Result<QuotaResult, QuotaError> {
        let deadline = Instant::now() + self.timeout;
        self.strategy.check(identifier, &self.policy, deadline).await
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("strategy", &self.strategy.name())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Build the limiter for `mode`.
pub fn resolve(
    mode: Mode,
    policy: QuotaPolicy,
    timeout: Duration,
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
) -> Limiter {
    let strategy: Arc<dyn QuotaStrategy> = match mode {
        Mode::Fixed => Arc::new(FixedWindow::new(store)),
        Mode::Sliding => Arc::new(SlidingWindow::new(store, clock)),
    };

    debug!(
        mode = %mode,
        limit = policy.limit,
        window_secs = policy.window_secs,
        timeout_ms = timeout.as_millis() as u64,
        "Resolved quota strategy"
    );

    Limiter::new(strategy, policy, timeout)
}
