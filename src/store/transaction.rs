//! The two scripted transactions the quota strategies run, and their
//! reference semantics for in-process backends.

use std::collections::BTreeSet;

use crate::error::QuotaError;
use crate::quota::QuotaKey;

/// One multi-step operation that must execute without interleaving with any
/// other transaction on the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Increment the counter (creating it at 1) and, when the result is 1,
    /// arm the expiry. Returns the counter value.
    IncrementWindow { key: QuotaKey, ttl_secs: u64 },

    /// Drop log entries scored strictly before `now_ms - window_ms`, insert
    /// `member` at `now_ms`, refresh the expiry, return the log size.
    SlidingLog {
        key: QuotaKey,
        now_ms: i64,
        window_ms: i64,
        member: String,
        ttl_secs: u64,
    },
}

impl Transaction {
    /// The key this transaction reads and writes.
    pub fn key(&self) -> &QuotaKey {
        match self {
            Transaction::IncrementWindow { key, .. } => key,
            Transaction::SlidingLog { key, .. } => key,
        }
    }

    /// Run the transaction against the record stored under its key.
    ///
    /// `slot` is `None` when the key is absent; an expired record is treated
    /// as absent. `store_now_ms` is the store's own clock, used for expiry.
    /// On error the slot is left exactly as it was.
    pub fn apply(
        &self,
        slot: &mut Option<StoredRecord>,
        store_now_ms: i64,
    ) -> Result<i64, QuotaError> {
        if slot
            .as_ref()
            .is_some_and(|stored| stored.is_expired(store_now_ms))
        {
            *slot = None;
        }

        match self {
            Transaction::IncrementWindow { key, ttl_secs } => {
                let stored = slot.get_or_insert_with(|| StoredRecord::new(Record::Counter(0)));
                let Record::Counter(count) = &mut stored.record else {
                    return Err(wrong_type(key));
                };
                *count = count.checked_add(1).ok_or_else(|| {
                    QuotaError::TransactionFailed(format!("counter overflow at {key}"))
                })?;
                if *count == 1 {
                    stored.expires_at_ms = Some(expiry(store_now_ms, *ttl_secs));
                }
                Ok(*count)
            }
            Transaction::SlidingLog {
                key,
                now_ms,
                window_ms,
                member,
                ttl_secs,
            } => {
                let stored =
                    slot.get_or_insert_with(|| StoredRecord::new(Record::Log(BTreeSet::new())));
                let Record::Log(log) = &mut stored.record else {
                    return Err(wrong_type(key));
                };
                let cutoff = now_ms.saturating_sub(*window_ms);
                *log = log.split_off(&LogEntry::floor(cutoff));
                log.insert(LogEntry {
                    score_ms: *now_ms,
                    member: member.clone(),
                });
                stored.expires_at_ms = Some(expiry(store_now_ms, *ttl_secs));
                Ok(log.len() as i64)
            }
        }
    }
}

fn expiry(now_ms: i64, ttl_secs: u64) -> i64 {
    let ttl_ms = i64::try_from(ttl_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    now_ms.saturating_add(ttl_ms)
}

fn wrong_type(key: &QuotaKey) -> QuotaError {
    QuotaError::TransactionFailed(format!(
        "WRONGTYPE operation against {key} holding the wrong kind of value"
    ))
}

/// A record plus its optional expiry instant (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: Record,
    pub expires_at_ms: Option<i64>,
}

impl StoredRecord {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            expires_at_ms: None,
        }
    }

    /// A record expires once the clock reaches its expiry instant.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Value shapes the quota transactions operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Fixed-window request counter
    Counter(i64),
    /// Sliding-window request log, ordered by score then member
    Log(BTreeSet<LogEntry>),
}

/// One request attempt in a sliding log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogEntry {
    /// Request time in epoch milliseconds
    pub score_ms: i64,
    /// Unique token; two entries may share a score but never a member
    pub member: String,
}

impl LogEntry {
    /// Smallest possible entry with the given score.
    fn floor(score_ms: i64) -> Self {
        Self {
            score_ms,
            member: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn increment(ttl_secs: u64) -> Transaction {
        Transaction::IncrementWindow {
            key: QuotaKey::fixed("client"),
            ttl_secs,
        }
    }

    fn log_at(now_ms: i64, member: &str) -> Transaction {
        Transaction::SlidingLog {
            key: QuotaKey::sliding("client"),
            now_ms,
            window_ms: 1_000,
            member: member.to_string(),
            ttl_secs: 2,
        }
    }

    #[test]
    fn test_increment_creates_counter_and_arms_expiry_once() {
        let mut slot = None;

        assert_eq!(increment(60).apply(&mut slot, 0).unwrap(), 1);
        assert_eq!(slot.as_ref().unwrap().expires_at_ms, Some(60_000));

        // Later increments do not push the expiry out.
        assert_eq!(increment(60).apply(&mut slot, 30_000).unwrap(), 2);
        assert_eq!(slot.as_ref().unwrap().expires_at_ms, Some(60_000));
    }

    #[test]
    fn test_increment_restarts_after_expiry() {
        let mut slot = None;
        increment(1).apply(&mut slot, 0).unwrap();
        increment(1).apply(&mut slot, 999).unwrap();

        assert_eq!(increment(1).apply(&mut slot, 1_000).unwrap(), 1);
        assert_eq!(slot.as_ref().unwrap().expires_at_ms, Some(2_000));
    }

    #[test]
    fn test_log_prunes_strictly_older_entries() {
        let mut slot = None;
        log_at(0, "a").apply(&mut slot, 0).unwrap();
        log_at(500, "b").apply(&mut slot, 500).unwrap();

        // cutoff = 500: the entry at 0 goes, the entry at exactly 500 stays
        assert_eq!(log_at(1_500, "c").apply(&mut slot, 1_500).unwrap(), 2);
    }

    #[test]
    fn test_log_keeps_same_millisecond_members() {
        let mut slot = None;
        log_at(10, "x").apply(&mut slot, 10).unwrap();
        assert_eq!(log_at(10, "y").apply(&mut slot, 10).unwrap(), 2);
    }

    #[test]
    fn test_log_refreshes_expiry() {
        let mut slot = None;
        log_at(0, "a").apply(&mut slot, 0).unwrap();
        log_at(700, "b").apply(&mut slot, 700).unwrap();
        assert_eq!(slot.unwrap().expires_at_ms, Some(2_700));
    }

    #[test]
    fn test_huge_ttl_saturates_instead_of_expiring() {
        let mut slot = None;
        increment(u64::MAX).apply(&mut slot, 1_000).unwrap();
        assert_eq!(slot.as_ref().unwrap().expires_at_ms, Some(i64::MAX));

        assert_eq!(increment(u64::MAX).apply(&mut slot, 2_000).unwrap(), 2);
    }

    #[test]
    fn test_wrong_type_leaves_record_untouched() {
        let mut slot = Some(StoredRecord::new(Record::Counter(7)));
        let err = log_at(0, "a").apply(&mut slot, 0).unwrap_err();

        assert!(matches!(err, QuotaError::TransactionFailed(_)));
        assert_eq!(slot, Some(StoredRecord::new(Record::Counter(7))));
    }
}
