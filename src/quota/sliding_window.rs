//! Sliding-window log strategy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::clock::Clock;
use super::key::QuotaKey;
use super::result::{QuotaPolicy, QuotaResult};
use super::strategy::QuotaStrategy;
use super::run_before;
use crate::error::QuotaError;
use crate::store::{AtomicStore, Transaction};

/// Seconds the log outlives the window once traffic stops.
const EXPIRY_SLACK_SECS: u64 = 1;

/// Counts requests per identifier inside a continuously moving interval.
///
/// Every attempt, admitted or not, adds one timestamped entry to the
/// identifier's log. Entries older than the window are pruned before
/// counting, so there is no boundary burst, at the cost of one entry per
/// request still inside the window.
pub struct SlidingWindow {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Create a sliding-window strategy over `store`, scoring entries with
    /// `clock`.
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

/// Unique log member. The score may repeat within a millisecond; the uuid
/// suffix keeps members distinct.
fn log_member(now_ms: i64) -> String {
    format!("{now_ms}:{}", Uuid::new_v4().simple())
}

#[async_trait]
impl QuotaStrategy for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding"
    }

    async fn check(
        &self,
        identifier: &str,
        policy: &QuotaPolicy,
        deadline: Instant,
    ) -> Result<QuotaResult, QuotaError> {
        let now_ms = self.clock.now_ms();
        let transaction = Transaction::SlidingLog {
            key: QuotaKey::sliding(identifier),
            now_ms,
            window_ms: policy.window_ms(),
            member: log_member(now_ms),
            ttl_secs: policy.window_secs.saturating_add(EXPIRY_SLACK_SECS),
        };

        trace!(key = %transaction.key(), now_ms, "Checking sliding window");

        let count = run_before(deadline, self.store.execute(&transaction)).await?;
        let result = policy.evaluate(count.max(0) as u64);

        if !result.allowed {
            debug!(
                identifier = %identifier,
                count = result.count,
                limit = result.limit,
                "Sliding window quota exceeded"
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ManualClock;
    use crate::store::{MemoryStore, Record};
    use std::time::Duration;

    const START_MS: i64 = 1_700_000_000_000;

    fn sliding_with_store() -> (SlidingWindow, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (
            SlidingWindow::new(store.clone(), clock.clone()),
            store,
            clock,
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_log_members_are_unique() {
        assert_ne!(log_member(5), log_member(5));
        assert!(log_member(5).starts_with("5:"));
    }

    #[tokio::test]
    async fn test_sliding_window_counts_then_rejects() {
        let (sliding, _store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(3, 60).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let result = sliding.check("10.0.0.1", &policy, deadline()).await.unwrap();
            outcomes.push((result.allowed, result.count));
            clock.advance(Duration::from_secs(1));
        }

        assert_eq!(
            outcomes,
            vec![(true, 1), (true, 2), (true, 3), (false, 4)]
        );
    }

    #[tokio::test]
    async fn test_sliding_window_prunes_old_entries() {
        let (sliding, _store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(2, 1).unwrap();

        let at = |offset_ms: i64| clock.set(START_MS + offset_ms);

        at(0);
        assert!(sliding.check("client", &policy, deadline()).await.unwrap().allowed);
        at(900);
        assert!(sliding.check("client", &policy, deadline()).await.unwrap().allowed);

        at(1_100);
        let third = sliding.check("client", &policy, deadline()).await.unwrap();
        assert!(third.allowed);
        assert_eq!(third.count, 2, "entry at t=0.0 should be pruned");

        at(1_200);
        let fourth = sliding.check("client", &policy, deadline()).await.unwrap();
        assert!(!fourth.allowed);
        assert_eq!(fourth.count, 3);
    }

    #[tokio::test]
    async fn test_sliding_window_keeps_entries_inside_window() {
        let (sliding, _store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(10, 1).unwrap();

        sliding.check("client", &policy, deadline()).await.unwrap();
        clock.advance(Duration::from_millis(999));
        assert_eq!(
            sliding.check("client", &policy, deadline()).await.unwrap().count,
            2
        );

        clock.set(START_MS + 1_001);
        assert_eq!(
            sliding.check("client", &policy, deadline()).await.unwrap().count,
            2,
            "only the first entry has left the window"
        );
    }

    #[tokio::test]
    async fn test_sliding_window_log_expires_when_idle() {
        let (sliding, store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(5, 2).unwrap();

        sliding.check("idle", &policy, deadline()).await.unwrap();
        let stored = store.get("rate:idle").unwrap();
        assert!(matches!(stored.record, Record::Log(ref log) if log.len() == 1));
        assert_eq!(stored.expires_at_ms, Some(START_MS + 3_000));

        clock.advance(Duration::from_secs(3));
        assert!(store.get("rate:idle").is_none());
    }

    #[tokio::test]
    async fn test_sliding_window_rejected_requests_still_logged() {
        let (sliding, _store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(1, 1).unwrap();

        sliding.check("client", &policy, deadline()).await.unwrap();
        // Hammering every 600ms keeps at least one recent attempt in the
        // log, so the client never gets back under the limit.
        for _ in 0..5 {
            clock.advance(Duration::from_millis(600));
            assert!(!sliding.check("client", &policy, deadline()).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_sliding_window_does_not_read_fixed_counters() {
        let (sliding, store, _clock) = sliding_with_store();
        let fixed = crate::quota::FixedWindow::new(store);
        let policy = QuotaPolicy::new(1, 60).unwrap();

        fixed.check("shared", &policy, deadline()).await.unwrap();
        fixed.check("shared", &policy, deadline()).await.unwrap();

        let result = sliding.check("shared", &policy, deadline()).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_identifiers_are_independent() {
        let (sliding, _store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(2, 60).unwrap();

        for _ in 0..3 {
            sliding.check("10.0.0.1", &policy, deadline()).await.unwrap();
            clock.advance(Duration::from_millis(10));
        }
        assert!(!sliding.check("10.0.0.1", &policy, deadline()).await.unwrap().allowed);

        let other = sliding.check("10.0.0.2", &policy, deadline()).await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.count, 1);

        let again = sliding.check("10.0.0.1", &policy, deadline()).await.unwrap();
        assert_eq!(again.count, 5);
    }

    #[tokio::test]
    async fn test_sliding_window_widest_window_still_limits() {
        let (sliding, _store, clock) = sliding_with_store();
        let policy = QuotaPolicy::new(1, crate::quota::MAX_WINDOW_SECS).unwrap();

        let first = sliding.check("a", &policy, deadline()).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        let second = sliding.check("a", &policy, deadline()).await.unwrap();
        assert_eq!((first.allowed, first.count), (true, 1));
        assert_eq!((second.allowed, second.count), (false, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sliding_window_concurrent_same_millisecond() {
        let (sliding, _store, _clock) = sliding_with_store();
        let sliding = Arc::new(sliding);
        let policy = QuotaPolicy::new(25, 60).unwrap();

        // The manual clock never moves: every entry shares one score.
        let handles: Vec<_> = (0..300)
            .map(|_| {
                let sliding = Arc::clone(&sliding);
                tokio::spawn(async move { sliding.check("hot", &policy, deadline()).await })
            })
            .collect();

        let results: Vec<QuotaResult> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.allowed).count(), 25);

        let mut counts: Vec<u64> = results.iter().map(|r| r.count).collect();
        counts.sort_unstable();
        assert_eq!(counts, (1..=300).collect::<Vec<u64>>());
    }
}
