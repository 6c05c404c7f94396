//! Quota key generation.

use std::fmt;

/// Prefix shared by every key this crate writes.
const KEY_PREFIX: &str = "rate";

/// A store key that uniquely identifies one (algorithm, identifier) pair.
///
/// The fixed window namespaces its counters under `rate:fixed:` while the
/// sliding log lives directly under `rate:`. Client addresses never start
/// with `fixed:`, so the two namespaces stay disjoint; if they ever did
/// meet, the store rejects a counter transaction on a log record and vice
/// versa instead of mixing the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey(String);

impl QuotaKey {
    /// Key for the fixed-window counter of `identifier`.
    pub fn fixed(identifier: &str) -> Self {
        Self(format!("{KEY_PREFIX}:fixed:{identifier}"))
    }

    /// Key for the sliding-window log of `identifier`.
    pub fn sliding(identifier: &str) -> Self {
        Self(format!("{KEY_PREFIX}:{identifier}"))
    }

    /// The raw key as sent to the store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QuotaKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
