//! Pagination adapter and the single-page state-machine driver.
//!
//! [`PageFetcher`] normalizes whatever a source calls paging — offset/limit,
//! opaque marker, cursor token — behind one "fetch the next unit" operation.
//! [`fetch_one_page`] performs exactly one checkpoint transition: fetch one
//! page for the current sub-resource and compute the successor checkpoint.
//!
//! The transition rules are deliberately conservative. A full page with a
//! server-issued continuation token continues the same sub-resource. A
//! short page (or explicit completion) advances to the next sub-resource.
//! A full page *without* a token is a [`SyncError::PaginationIntegrity`]
//! violation and halts the run: the framework never manufactures its own
//! continuation token from item identity, because that skips, duplicates,
//! or loops on some upstream APIs.

use async_trait::async_trait;
use tracing::debug;

use crate::checkpoint::CursorCheckpoint;
use crate::error::SyncError;

/// One page of raw records from a source.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Server-issued continuation token, if any. Never client-derived.
    pub next_cursor: Option<String>,
    /// Whether the source filled the page to its size limit.
    pub page_full: bool,
}

/// Result of one page fetch.
#[derive(Debug, Clone)]
pub enum PageOutcome<T> {
    Page(Page<T>),
    /// The sub-resource does not exist for this query (e.g. an HTTP 404 for
    /// a workspace with no records in the window). Treated as zero items,
    /// advance — never as an error.
    SubResourceGone,
}

/// Source-specific page mechanics behind one operation.
///
/// Implementations are responsible for clamping the source's page size to
/// the configured maximum and for applying item-level time filters when the
/// source cannot filter server-side.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    type Raw: Send;

    /// Number of independently-paginated partitions (workspaces, teams,
    /// day buckets). Sources without partitions report 1.
    fn sub_resource_count(&self) -> usize;

    async fn fetch(
        &self,
        sub_resource: usize,
        cursor: Option<&str>,
    ) -> Result<PageOutcome<Self::Raw>, SyncError>;
}

/// The raw items of one transition plus the successor checkpoint.
#[derive(Debug)]
pub struct PageStep<T> {
    pub items: Vec<T>,
    pub checkpoint: CursorCheckpoint,
}

/// Perform one checkpoint transition: fetch one page for the current
/// sub-resource and return the successor checkpoint.
///
/// Sub-resources that are gone are skipped in the same call (a skip is not
/// a unit of network work worth a full scheduler round-trip). On a
/// pagination integrity violation the passed checkpoint is left untouched,
/// so the caller's persisted state still describes the position before the
/// bad page.
pub async fn fetch_one_page<F: PageFetcher>(
    fetcher: &F,
    checkpoint: &CursorCheckpoint,
) -> Result<PageStep<F::Raw>, SyncError> {
    let total = fetcher.sub_resource_count();
    let mut next = checkpoint.clone();
    let mut index = checkpoint.sub_resource;

    while index < total {
        // Only the sub-resource the checkpoint was parked on resumes from
        // its cursor; later ones start from their beginning.
        let cursor = if index == checkpoint.sub_resource {
            checkpoint.cursor.as_deref()
        } else {
            None
        };

        match fetcher.fetch(index, cursor).await? {
            PageOutcome::SubResourceGone => {
                debug!(sub_resource = index, "sub-resource gone, advancing");
                index += 1;
            }
            PageOutcome::Page(page) => {
                if page.page_full && page.next_cursor.is_none() {
                    return Err(SyncError::PaginationIntegrity {
                        sub_resource: index,
                        page_len: page.items.len(),
                    });
                }

                match page.next_cursor {
                    Some(token) => {
                        next.cursor = Some(token);
                        next.sub_resource = index;
                        next.has_more = true;
                    }
                    None => {
                        next.cursor = None;
                        next.sub_resource = index + 1;
                        next.has_more = index + 1 < total;
                    }
                }
                return Ok(PageStep {
                    items: page.items,
                    checkpoint: next,
                });
            }
        }
    }

    // Every remaining sub-resource was gone.
    next.cursor = None;
    next.sub_resource = total;
    next.has_more = false;
    Ok(PageStep {
        items: Vec::new(),
        checkpoint: next,
    })
}
