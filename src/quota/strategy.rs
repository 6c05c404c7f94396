//! Quota strategy trait shared by the fixed and sliding implementations.

use async_trait::async_trait;
use tokio::time::Instant;

use super::result::{QuotaPolicy, QuotaResult};
use crate::error::QuotaError;

/// Trait for quota strategy implementations.
///
/// Implementations hold no per-identifier state: every call derives its
/// decision from one fresh store transaction, so any number of tasks (and
/// any number of processes pointed at the same store) may call `check`
/// concurrently.
#[async_trait]
pub trait QuotaStrategy: Send + Sync {
    /// Short algorithm name used in logs (`"fixed"` or `"sliding"`).
    fn name(&self) -> &'static str;

    /// Count one request for `identifier` and decide whether it is admitted.
    ///
    /// The store round-trip must finish before `deadline`; otherwise the
    /// call returns [`QuotaError::DeadlineExceeded`] rather than a rejection.
    async fn check(
        &self,
        identifier: &str,
        policy: &QuotaPolicy,
        deadline: Instant,
    ) -> Result<QuotaResult, QuotaError>;
}
