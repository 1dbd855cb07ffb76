//! Per-item failure isolation.
//!
//! Wraps item transformation so one bad record becomes a recorded
//! [`Failure`] value instead of aborting the run. Run-level errors (missing
//! credentials, pagination integrity, exhausted retries) always pass
//! through regardless of policy.

use tracing::warn;

use crate::error::SyncError;
use crate::models::{Failure, Item, ItemOrFailure};

/// How per-item errors are handled.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    /// Default: record a `Failure` and keep going. When false, the first
    /// per-item error aborts the run (after already-assembled output is
    /// flushed by the session).
    pub continue_on_failure: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            continue_on_failure: true,
        }
    }
}

impl FailurePolicy {
    pub fn strict() -> Self {
        Self {
            continue_on_failure: false,
        }
    }
}

/// Convert a per-item transformation result into a batch slot.
///
/// Under the default policy an item-level error becomes a [`Failure`]
/// carrying the item id and message. Under the strict policy it is
/// re-raised. Run-fatal errors are never swallowed.
pub fn isolate(
    policy: FailurePolicy,
    item_id: &str,
    result: Result<Item, SyncError>,
) -> Result<ItemOrFailure, SyncError> {
    match result {
        Ok(item) => Ok(ItemOrFailure::Item(item)),
        Err(err) if err.is_run_fatal() => Err(err),
        Err(err) if policy.continue_on_failure => {
            warn!(item_id, error = %err, "item failed, continuing");
            Ok(ItemOrFailure::Failure(Failure {
                item_id: item_id.to_string(),
                message: err.to_string(),
                cause: Some(format!("{err:?}")),
            }))
        }
        Err(err) => Err(err),
    }
}
