//! Turning a quota check outcome into an admit/reject decision.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::result::QuotaResult;
use crate::error::QuotaError;

/// What to do when the store cannot tell whether a client is over quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Surface the failure as a server error
    #[default]
    Closed,
    /// Let the request through
    Open,
}

/// Final verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed downstream. `None` when admitted by fail-open policy.
    Admit(Option<QuotaResult>),
    /// Over quota
    Reject(QuotaResult),
    /// The store failed and the policy is fail-closed
    Indeterminate(QuotaError),
}

impl Decision {
    pub fn from_outcome(outcome: Result<QuotaResult, QuotaError>, fail_policy: FailPolicy) -> Self {
        match outcome {
            Ok(result) if result.allowed => Decision::Admit(Some(result)),
            Ok(result) => Decision::Reject(result),
            Err(err) => match fail_policy {
                FailPolicy::Closed => Decision::Indeterminate(err),
                FailPolicy::Open => {
                    warn!(error = %err, kind = err.kind(), "Quota store failed, admitting request");
                    Decision::Admit(None)
                }
            },
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit(_))
    }
}
