//! Compare-and-swap fallback for stores without multi-step transactions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::transaction::{StoredRecord, Transaction};
use super::AtomicStore;
use crate::error::QuotaError;
use crate::quota::Clock;

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub stored: StoredRecord,
}

/// A key-value backend that offers single-key compare-and-swap but no
/// scripted transactions.
#[async_trait]
pub trait VersionedBackend: Send + Sync {
    /// Read the current record and its version.
    async fn load(&self, key: &str) -> Result<Option<Versioned>, QuotaError>;

    /// Replace the record if its version is still `expected`
    /// (`None` meaning "the key must be absent"). Returns whether the swap
    /// happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        stored: StoredRecord,
    ) -> Result<bool, QuotaError>;
}

/// Runs quota transactions over a [`VersionedBackend`] with a retry loop.
///
/// Each attempt reads the record, applies the transaction to a private
/// copy, then tries to swap it in. A concurrent writer makes the swap fail
/// and the attempt starts over, so contention costs latency instead of
/// lost or doubled counts. The loop has no attempt cap of its own: the
/// strategy's deadline bounds it.
pub struct CasStore<B> {
    backend: B,
    clock: Arc<dyn Clock>,
}

impl<B: VersionedBackend> CasStore<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: VersionedBackend> AtomicStore for CasStore<B> {
    async fn execute(&self, transaction: &Transaction) -> Result<i64, QuotaError> {
        let key = transaction.key().as_str();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let current = self.backend.load(key).await?;
            let expected = current.as_ref().map(|v| v.version);
            let mut slot = current.map(|v| v.stored);

            let count = transaction.apply(&mut slot, self.clock.now_ms())?;
            let Some(stored) = slot else {
                return Err(QuotaError::TransactionFailed(format!(
                    "transaction on {key} produced no record"
                )));
            };

            if self.backend.compare_and_swap(key, expected, stored).await? {
                trace!(key, count, attempts, "Committed compare-and-swap transaction");
                return Ok(count);
            }

            tokio::task::yield_now().await;
        }
    }

    async fn ping(&self) -> Result<(), QuotaError> {
        self.backend.load("rate:ping").await.map(|_| ())
    }
}

/// In-process [`VersionedBackend`].
///
/// Only single-key reads and swaps are exposed, which is exactly the
/// contract of a non-transactional key-value service.
#[derive(Debug, Default)]
pub struct VersionedMemory {
    records: Mutex<HashMap<String, Versioned>>,
}

impl VersionedMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionedBackend for VersionedMemory {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, QuotaError> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        stored: StoredRecord,
    ) -> Result<bool, QuotaError> {
        let mut records = self.records.lock();
        let current = records.get(key).map(|v| v.version);
        if current != expected {
            return Ok(false);
        }
        let version = current.map_or(1, |v| v + 1);
        records.insert(key.to_string(), Versioned { version, stored });
        Ok(true)
    }
}
