//! The sync session: drives a checkpointed connector and assembles its
//! output into bounded, restartable batches.
//!
//! One session covers one Fresh→Exhausted run (or one resumed segment of
//! it). `next_batch` pulls enough sync calls to fill a batch, then yields
//! the batch together with the checkpoint blob that is safe to persist once
//! the batch has been applied downstream. Memory stays O(batch size)
//! regardless of source size.
//!
//! The blob attached to a batch is always the one preceding the oldest item
//! still unflushed, so a crash after persisting it can only cause re-fetch
//! (safe under idempotent upsert), never loss. A mid-run fatal error is
//! deferred until already-assembled output has been flushed, then surfaced.

use tracing::debug;

use crate::connector::DynCheckpointed;
use crate::error::SyncError;
use crate::models::{Batch, ItemOrFailure};
use crate::window::TimeWindow;

/// One yielded batch plus the checkpoint blob to persist after applying it.
#[derive(Debug)]
pub struct SessionBatch {
    pub batch: Batch,
    /// Safe to persist once `batch` has been applied downstream.
    pub checkpoint_blob: String,
    /// Whether the run has more work after this batch.
    pub has_more: bool,
}

/// Pull-based batch assembler over one checkpointed connector.
#[derive(Debug)]
pub struct SyncSession<'a> {
    connector: &'a dyn DynCheckpointed,
    window: TimeWindow,
    batch_size: usize,
    /// Latest checkpoint blob returned by the connector.
    blob: String,
    /// Blob preceding the oldest item still sitting in `pending`.
    pending_origin_blob: String,
    has_more: bool,
    pending: Vec<ItemOrFailure>,
    deferred: Option<SyncError>,
    finished: bool,
}

impl<'a> SyncSession<'a> {
    /// Start (or resume) a session. `blob = None` starts from the fresh
    /// checkpoint; a stored blob is validated before any network call.
    pub fn new(
        connector: &'a dyn DynCheckpointed,
        window: TimeWindow,
        batch_size: usize,
        blob: Option<String>,
    ) -> Result<Self, SyncError> {
        if batch_size == 0 {
            return Err(SyncError::Configuration("batch_size must be > 0".into()));
        }
        let blob = match blob {
            Some(blob) => {
                connector.validate_blob(&blob)?;
                blob
            }
            None => connector.fresh_blob()?,
        };
        Ok(Self {
            connector,
            window,
            batch_size,
            pending_origin_blob: blob.clone(),
            blob,
            has_more: true,
            pending: Vec::new(),
            deferred: None,
            finished: false,
        })
    }

    /// The latest checkpoint blob. After the session ends cleanly this is
    /// the exhausted checkpoint and must be persisted by the caller.
    pub fn checkpoint_blob(&self) -> &str {
        &self.blob
    }

    /// Pull the next batch, driving as many sync calls as needed to fill
    /// it. Returns `Ok(None)` when the run is exhausted and fully flushed.
    pub async fn next_batch(&mut self) -> Result<Option<SessionBatch>, SyncError> {
        loop {
            if self.pending.len() >= self.batch_size {
                return Ok(Some(self.flush()));
            }

            if let Some(err) = self.deferred.take() {
                if self.pending.is_empty() {
                    self.finished = true;
                    return Err(err);
                }
                // Flush partial progress first; the error surfaces on the
                // next pull.
                self.deferred = Some(err);
                return Ok(Some(self.flush()));
            }

            if self.finished || !self.has_more {
                if self.pending.is_empty() {
                    self.finished = true;
                    return Ok(None);
                }
                return Ok(Some(self.flush()));
            }

            if self.pending.is_empty() {
                self.pending_origin_blob = self.blob.clone();
            }
            match self.connector.sync_blob(self.window, Some(&self.blob)).await {
                Ok(step) => {
                    debug!(
                        outcomes = step.outcomes.len(),
                        has_more = step.has_more,
                        "sync call complete"
                    );
                    self.pending.extend(step.outcomes);
                    self.blob = step.blob;
                    self.has_more = step.has_more;
                }
                Err(err) => {
                    self.deferred = Some(err);
                }
            }
        }
    }

    fn flush(&mut self) -> SessionBatch {
        let batch: Batch = if self.pending.len() > self.batch_size {
            self.pending.drain(..self.batch_size).collect()
        } else {
            std::mem::take(&mut self.pending)
        };

        // Only advance the persisted position when nothing produced before
        // or alongside this batch is still waiting to be delivered. A
        // deferred error never advanced `self.blob`, so a drained buffer
        // makes it safe to persist even then.
        let drained = self.pending.is_empty();
        let checkpoint_blob = if drained {
            self.blob.clone()
        } else {
            self.pending_origin_blob.clone()
        };
        let has_more = if drained && self.deferred.is_none() {
            self.has_more
        } else {
            true
        };

        SessionBatch {
            batch,
            checkpoint_blob,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CursorCheckpoint, SyncCheckpoint};
    use crate::connector::{BaseConnector, CheckpointedConnector, SyncStep};
    use crate::models::Item;
    use async_trait::async_trait;

    /// Emits `pages` of synthetic items, one page per sync call, driving a
    /// CursorCheckpoint through the standard transitions.
    struct Paged {
        pages: Vec<Vec<&'static str>>,
    }

    fn item(id: &str) -> ItemOrFailure {
        ItemOrFailure::Item(Item {
            id: id.into(),
            sections: Vec::new(),
            source: "test:paged".into(),
            semantic_identifier: id.into(),
            updated_at: None,
            metadata: Default::default(),
            owners: Vec::new(),
            access: None,
        })
    }

    impl BaseConnector for Paged {
        fn name(&self) -> &str {
            "paged"
        }
        fn source_type(&self) -> &str {
            "test"
        }
    }

    #[async_trait]
    impl CheckpointedConnector for Paged {
        type Checkpoint = CursorCheckpoint;

        async fn sync(
            &self,
            _window: TimeWindow,
            checkpoint: CursorCheckpoint,
        ) -> Result<SyncStep<CursorCheckpoint>, SyncError> {
            let index = checkpoint
                .cursor
                .as_deref()
                .map(|c| c.parse::<usize>().unwrap())
                .unwrap_or(0);
            let outcomes = self.pages[index].iter().map(|id| item(id)).collect();
            let next = index + 1;
            let checkpoint = if next < self.pages.len() {
                CursorCheckpoint {
                    cursor: Some(next.to_string()),
                    sub_resource: 0,
                    has_more: true,
                }
            } else {
                CursorCheckpoint {
                    cursor: None,
                    sub_resource: 1,
                    has_more: false,
                }
            };
            Ok(SyncStep {
                outcomes,
                checkpoint,
            })
        }
    }

    #[tokio::test]
    async fn batches_are_bounded_and_run_drains() {
        let connector = Paged {
            pages: vec![vec!["a", "b", "c"], vec!["d", "e"]],
        };
        let mut session =
            SyncSession::new(&connector, TimeWindow::unbounded(), 2, None).unwrap();

        let mut ids = Vec::new();
        while let Some(session_batch) = session.next_batch().await.unwrap() {
            assert!(session_batch.batch.len() <= 2);
            for slot in &session_batch.batch {
                ids.push(slot.item_id().to_string());
            }
        }
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);

        let final_cp: CursorCheckpoint =
            crate::checkpoint::validate_blob(session.checkpoint_blob()).unwrap();
        assert!(!final_cp.has_more());
    }

    #[tokio::test]
    async fn mid_page_batches_carry_a_replay_safe_blob() {
        // Page of 3 items, batch size 2: the first batch leaves one item
        // pending, so its blob must still point before the page.
        let connector = Paged {
            pages: vec![vec!["a", "b", "c"]],
        };
        let mut session =
            SyncSession::new(&connector, TimeWindow::unbounded(), 2, None).unwrap();

        let first = session.next_batch().await.unwrap().unwrap();
        assert_eq!(first.batch.len(), 2);
        assert!(first.has_more);
        let cp: CursorCheckpoint = crate::checkpoint::validate_blob(&first.checkpoint_blob).unwrap();
        assert_eq!(cp, CursorCheckpoint::fresh());

        let second = session.next_batch().await.unwrap().unwrap();
        assert_eq!(second.batch.len(), 1);
        assert!(!second.has_more);
        let cp: CursorCheckpoint =
            crate::checkpoint::validate_blob(&second.checkpoint_blob).unwrap();
        assert!(!cp.has_more());

        assert!(session.next_batch().await.unwrap().is_none());
    }

    /// Fails on the second sync call, after one good page.
    struct FailsLater;

    impl BaseConnector for FailsLater {
        fn name(&self) -> &str {
            "fails-later"
        }
        fn source_type(&self) -> &str {
            "test"
        }
    }

    #[async_trait]
    impl CheckpointedConnector for FailsLater {
        type Checkpoint = CursorCheckpoint;

        async fn sync(
            &self,
            _window: TimeWindow,
            checkpoint: CursorCheckpoint,
        ) -> Result<SyncStep<CursorCheckpoint>, SyncError> {
            if checkpoint.cursor.is_some() {
                return Err(SyncError::PaginationIntegrity {
                    sub_resource: 0,
                    page_len: 100,
                });
            }
            Ok(SyncStep {
                outcomes: vec![item("a")],
                checkpoint: CursorCheckpoint {
                    cursor: Some("tok".into()),
                    sub_resource: 0,
                    has_more: true,
                },
            })
        }
    }

    #[tokio::test]
    async fn fatal_error_surfaces_after_flushing_partial_progress() {
        let connector = FailsLater;
        let mut session =
            SyncSession::new(&connector, TimeWindow::unbounded(), 10, None).unwrap();

        // The partial batch from the good page comes out first, carrying
        // the good page's checkpoint...
        let partial = session.next_batch().await.unwrap().unwrap();
        assert_eq!(partial.batch.len(), 1);
        assert!(partial.has_more);
        let cp: CursorCheckpoint =
            crate::checkpoint::validate_blob(&partial.checkpoint_blob).unwrap();
        assert_eq!(cp.cursor.as_deref(), Some("tok"));

        // ...then the fatal error.
        let err = session.next_batch().await.unwrap_err();
        assert!(matches!(err, SyncError::PaginationIntegrity { .. }));
    }

    #[tokio::test]
    async fn malformed_resume_blob_is_rejected_before_any_call() {
        let connector = Paged { pages: vec![] };
        let err = SyncSession::new(
            &connector,
            TimeWindow::unbounded(),
            2,
            Some("{{not json".into()),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn zero_batch_size_is_a_configuration_error() {
        let connector = Paged { pages: vec![] };
        let err = SyncSession::new(&connector, TimeWindow::unbounded(), 0, None).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
