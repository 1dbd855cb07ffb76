//! Error taxonomy for the sync framework.
//!
//! The split that matters here is run-fatal vs. item-level. Run-fatal errors
//! (missing credentials, bad configuration, a pagination integrity violation)
//! abort the whole sync cycle. Item-level errors are caught by the failure
//! isolator and recorded as [`crate::models::Failure`] values so one bad
//! record never sinks an entire run.
//!
//! A lease that cannot be acquired is *not* an error — [`crate::lock`]
//! expresses that as a `false` return and the scheduler skips the cycle.

use thiserror::Error;

/// All errors produced by the sync framework.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Required credentials are absent. Raised pre-flight, before any
    /// network call is attempted.
    #[error("missing credentials for source '{0}'")]
    MissingCredential(String),

    /// Invalid configuration, including requesting a capability a source
    /// does not implement. Raised pre-flight.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A source returned a full page with no continuation token. The
    /// framework never derives its own cursor from item identity (that has
    /// been observed to skip, duplicate, or loop on some upstream APIs),
    /// so the run halts instead.
    #[error(
        "pagination integrity violation in sub-resource {sub_resource}: \
         full page of {page_len} items with no continuation token"
    )]
    PaginationIntegrity { sub_resource: usize, page_len: usize },

    /// A checkpoint blob failed validation.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A transient upstream lookup was retried until the budget ran out.
    #[error("retries exhausted after {attempts} attempts: {detail}")]
    RetriesExhausted { attempts: u32, detail: String },

    /// Non-transient upstream/API failure.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A single item could not be transformed. Isolated by default.
    #[error("item processing failed: {0}")]
    ItemProcessing(String),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local persistence (checkpoint store, lease store, sink) failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Local filesystem failure while scanning a source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Errors that always abort the run, regardless of failure policy.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::MissingCredential(_)
                | SyncError::Configuration(_)
                | SyncError::PaginationIntegrity { .. }
                | SyncError::Checkpoint(_)
                | SyncError::RetriesExhausted { .. }
                | SyncError::Store(_)
        )
    }

    /// Errors worth retrying with backoff before escalating.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Http(_) | SyncError::Upstream(_))
    }
}
