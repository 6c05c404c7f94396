//! Atomic counter store backends.
//!
//! The quota strategies never talk to a database directly. They build a
//! [`Transaction`] and hand it to an [`AtomicStore`], which must run it as one
//! indivisible step with respect to every other transaction on the same key.
//! Three backends are provided:
//!
//! - [`RedisStore`]: production backend, one embedded Lua script per transaction.
//! - [`MemoryStore`]: in-process map with per-key locking, for single-instance
//!   deployments and tests.
//! - [`CasStore`]: adapts a non-transactional, versioned key-value backend with
//!   a compare-and-swap retry loop.

use async_trait::async_trait;

use crate::error::QuotaError;

mod cas;
mod memory;
mod redis;
mod transaction;

pub use cas::{CasStore, VersionedBackend, Versioned, VersionedMemory};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use transaction::{LogEntry, Record, StoredRecord, Transaction};

/// Trait for store implementations.
///
/// This is the only shared mutable resource in the system: implementations
/// provide the isolation, callers hold no locks and cache nothing.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Execute one transaction and return the count it produced.
    async fn execute(&self, transaction: &Transaction) -> Result<i64, QuotaError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), QuotaError>;
}
