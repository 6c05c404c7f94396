//! Quota accounting: strategies, their shared contract, and the selector
//! the boundary layer plugs into.

mod clock;
mod decision;
mod fixed_window;
mod key;
mod result;
mod selector;
mod sliding_window;
mod strategy;

use std::future::Future;

use tokio::time::Instant;

use crate::error::QuotaError;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, FailPolicy};
pub use fixed_window::FixedWindow;
pub use key::QuotaKey;
pub use result::{QuotaPolicy, QuotaResult, MAX_WINDOW_SECS};
pub use selector::{resolve, Limiter, Mode};
pub use sliding_window::SlidingWindow;
pub use strategy::QuotaStrategy;

/// Await a store round-trip, giving up at `deadline`.
async fn run_before<T, F>(deadline: Instant, round_trip: F) -> Result<T, QuotaError>
where
    F: Future<Output = Result<T, QuotaError>>,
{
    let started = Instant::now();
    match tokio::time::timeout_at(deadline, round_trip).await {
        Ok(outcome) => outcome,
        Err(_) => Err(QuotaError::DeadlineExceeded(started.elapsed())),
    }
}
