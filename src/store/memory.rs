//! In-process transactional store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::transaction::{Record, StoredRecord, Transaction};
use super::AtomicStore;
use crate::error::QuotaError;
use crate::quota::Clock;

/// Store backed by a `DashMap`.
///
/// A transaction runs while the map holds the write lock for its key's
/// shard, so two transactions on the same key never interleave. State lives
/// in this process only: several gateway instances each using their own
/// `MemoryStore` do not share quotas.
#[derive(Clone)]
pub struct MemoryStore {
    records: Arc<DashMap<String, StoredRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store that expires records by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let before = self.records.len();
        self.records.retain(|_, stored| !stored.is_expired(now_ms));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Purged expired quota records");
        }
        removed
    }

    /// Number of records currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of the record under `key`, if present and live.
    pub fn get(&self, key: &str) -> Option<StoredRecord> {
        let now_ms = self.clock.now_ms();
        self.records
            .get(key)
            .filter(|stored| !stored.is_expired(now_ms))
            .map(|stored| stored.value().clone())
    }

    fn execute_locked(&self, transaction: &Transaction) -> Result<i64, QuotaError> {
        let now_ms = self.clock.now_ms();
        match self.records.entry(transaction.key().as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                // Edited in place; `apply` leaves the slot as it was on error.
                let current = std::mem::replace(
                    occupied.get_mut(),
                    StoredRecord::new(Record::Counter(0)),
                );
                let mut slot = Some(current);
                let outcome = transaction.apply(&mut slot, now_ms);
                match slot {
                    Some(stored) => {
                        *occupied.get_mut() = stored;
                    }
                    None => {
                        occupied.remove();
                    }
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                let count = transaction.apply(&mut slot, now_ms)?;
                if let Some(stored) = slot {
                    vacant.insert(stored);
                }
                Ok(count)
            }
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn execute(&self, transaction: &Transaction) -> Result<i64, QuotaError> {
        let count = self.execute_locked(transaction)?;
        trace!(key = %transaction.key(), count, "Executed in-memory transaction");
        Ok(count)
    }

    async fn ping(&self) -> Result<(), QuotaError> {
        Ok(())
    }
}
