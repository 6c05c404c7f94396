//! Fixed-window counter strategy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::key::QuotaKey;
use super::result::{QuotaPolicy, QuotaResult};
use super::strategy::QuotaStrategy;
use super::run_before;
use crate::error::QuotaError;
use crate::store::{AtomicStore, Transaction};

/// Counts requests per identifier inside discrete windows.
///
/// The first request of a window creates the counter and arms its expiry;
/// the window ends when the store expires the key, and the next request
/// starts a new one at 1. Bookkeeping is one integer per active identifier.
///
/// Two adjacent windows may each admit `limit` requests, so a burst that
/// straddles a boundary can see up to `2 * limit` admissions in a short
/// interval. Use [`SlidingWindow`](super::SlidingWindow) when that matters.
pub struct FixedWindow {
    store: Arc<dyn AtomicStore>,
}

impl FixedWindow {
    /// Create a fixed-window strategy over `store`.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QuotaStrategy for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn check(
        &self,
        identifier: &str,
        policy: &QuotaPolicy,
        deadline: Instant,
    ) -> Result<QuotaResult, QuotaError> {
        let transaction = Transaction::IncrementWindow {
            key: QuotaKey::fixed(identifier),
            ttl_secs: policy.window_secs,
        };

        trace!(key = %transaction.key(), "Checking fixed window");

        let count = run_before(deadline, self.store.execute(&transaction)).await?;
        let result = policy.evaluate(count.max(0) as u64);

        if !result.allowed {
            debug!(
                identifier = %identifier,
                count = result.count,
                limit = result.limit,
                "Fixed window quota exceeded"
            );
        }

        Ok(result)
    }
}
