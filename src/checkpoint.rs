//! Checkpoint types and the opaque-blob persistence contract.
//!
//! A checkpoint is the unit of resumable state for one source instance. The
//! connector owns its shape; the scheduler only ever sees the serialized
//! JSON blob, stores it uninterpreted, and passes it back unchanged on the
//! next invocation.
//!
//! Lifecycle: created fresh (`has_more = true`, no progress) before the
//! first call, mutated by every call, persisted between calls, discarded on
//! a full-resync request or configuration change.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncError;

/// Resumable state for one source instance.
///
/// Implementations add their own cursor fields; the framework only needs
/// the continuation flag and a way to build the initial "dummy" checkpoint.
pub trait SyncCheckpoint:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    /// The initial checkpoint: work remaining, no progress recorded.
    fn fresh() -> Self;

    /// Whether another sync call is needed to drain the source.
    fn has_more(&self) -> bool;

    fn set_has_more(&mut self, has_more: bool);
}

/// Serialize a checkpoint to its opaque blob form.
pub fn serialize_blob<C: SyncCheckpoint>(checkpoint: &C) -> Result<String, SyncError> {
    serde_json::to_string(checkpoint)
        .map_err(|e| SyncError::Checkpoint(format!("failed to serialize checkpoint: {e}")))
}

/// Validate and deserialize a checkpoint blob.
///
/// Malformed blobs are rejected with a typed [`SyncError::Checkpoint`],
/// never an unstructured panic.
pub fn validate_blob<C: SyncCheckpoint>(blob: &str) -> Result<C, SyncError> {
    serde_json::from_str(blob)
        .map_err(|e| SyncError::Checkpoint(format!("invalid checkpoint blob: {e}")))
}

/// Where a checkpoint sits in the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    /// No progress recorded yet.
    Fresh,
    /// A cursor is held or a sub-resource has been advanced past.
    InProgress,
    /// Nothing left: no cursor, no unvisited sub-resource.
    Exhausted,
}

/// The standard checkpoint shape for cursor-paginated sources: an opaque
/// server-issued cursor plus an index into the source's independently
/// paginated partitions (workspaces, teams, day buckets).
///
/// Invariant, maintained by [`crate::pagination::fetch_one_page`]:
/// `has_more == false` iff `cursor == None` and no sub-resource remains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorCheckpoint {
    pub cursor: Option<String>,
    #[serde(default)]
    pub sub_resource: usize,
    pub has_more: bool,
}

impl CursorCheckpoint {
    pub fn state(&self) -> CheckpointState {
        if !self.has_more {
            CheckpointState::Exhausted
        } else if self.cursor.is_some() || self.sub_resource > 0 {
            CheckpointState::InProgress
        } else {
            CheckpointState::Fresh
        }
    }
}

impl SyncCheckpoint for CursorCheckpoint {
    fn fresh() -> Self {
        Self {
            cursor: None,
            sub_resource: 0,
            has_more: true,
        }
    }

    fn has_more(&self) -> bool {
        self.has_more
    }

    fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }
}

/// Checkpoint shape for sources without server-side cursor pagination:
/// progress is addressed by the start of the current day-bucket sub-window
/// instead (see [`crate::window::day_buckets`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowCheckpoint {
    pub current_bucket_start: Option<DateTime<Utc>>,
    pub has_more: bool,
}

impl SyncCheckpoint for WindowCheckpoint {
    fn fresh() -> Self {
        Self {
            current_bucket_start: None,
            has_more: true,
        }
    }

    fn has_more(&self) -> bool {
        self.has_more
    }

    fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips_unchanged() {
        let checkpoint = CursorCheckpoint {
            cursor: Some("tok-1".into()),
            sub_resource: 2,
            has_more: true,
        };
        let blob = serialize_blob(&checkpoint).unwrap();
        let restored: CursorCheckpoint = validate_blob(&blob).unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn malformed_blob_is_a_typed_error() {
        let err = validate_blob::<CursorCheckpoint>("not json at all").unwrap_err();
        assert!(matches!(err, SyncError::Checkpoint(_)));
    }

    #[test]
    fn state_machine_classification() {
        let fresh = CursorCheckpoint::fresh();
        assert_eq!(fresh.state(), CheckpointState::Fresh);

        let in_progress = CursorCheckpoint {
            cursor: Some("tok".into()),
            sub_resource: 0,
            has_more: true,
        };
        assert_eq!(in_progress.state(), CheckpointState::InProgress);

        // Advancing a sub-resource counts as progress even without a cursor.
        let advanced = CursorCheckpoint {
            cursor: None,
            sub_resource: 1,
            has_more: true,
        };
        assert_eq!(advanced.state(), CheckpointState::InProgress);

        let exhausted = CursorCheckpoint {
            cursor: None,
            sub_resource: 3,
            has_more: false,
        };
        assert_eq!(exhausted.state(), CheckpointState::Exhausted);
    }

    #[test]
    fn window_checkpoint_fresh_has_more() {
        let checkpoint = WindowCheckpoint::fresh();
        assert!(checkpoint.has_more());
        assert!(checkpoint.current_bucket_start.is_none());
    }
}
