//! Capability traits for connectors and the per-instance runtime.
//!
//! A source implements some subset of the capability traits:
//!
//! | Capability | Trait | Contract |
//! |------------|-------|----------|
//! | Load | [`LoadConnector`] | pull everything, ignoring time |
//! | Poll | [`PollConnector`] | pull one modified-time window, not resumable within the call |
//! | Checkpointed | [`CheckpointedConnector`] | resumable: one unit of work per call, returns an updated checkpoint |
//! | Slim | [`SlimConnector`] | enumerate ids + access metadata only |
//! | PermSync | [`PermSyncConnector`] | attach current access metadata to indexed items |
//!
//! The scheduler dispatches on which capabilities a [`SourceRuntime`] was
//! registered with. Requesting an absent capability is a configuration
//! error raised before any network call — there is no runtime type
//! inspection anywhere in the dispatch path.
//!
//! [`DynCheckpointed`] is the object-safe, blob-level view of a
//! checkpointed connector. The scheduler only ever sees serialized
//! checkpoint blobs through it, which is what makes the "store the blob
//! uninterpreted, pass it back unchanged" persistence contract structural
//! rather than a convention.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::checkpoint::{self, SyncCheckpoint};
use crate::error::SyncError;
use crate::models::{AccessDescriptor, ItemOrFailure, SlimItem};
use crate::window::TimeWindow;

/// Identity and pre-flight validation shared by every capability.
pub trait BaseConnector: Send + Sync {
    /// Instance name (e.g. `"support"`, `"runbooks"`).
    fn name(&self) -> &str;

    /// Source type identifier (e.g. `"feed"`, `"filesystem"`).
    fn source_type(&self) -> &str;

    /// Label used to tag items from this instance: `"{type}:{name}"`.
    fn source_label(&self) -> String {
        format!("{}:{}", self.source_type(), self.name())
    }

    /// Pre-flight settings/credential check. Must surface
    /// [`SyncError::MissingCredential`] or [`SyncError::Configuration`]
    /// before any paginated work begins.
    fn validate_settings(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Pull everything the source has, ignoring time.
#[async_trait]
pub trait LoadConnector: BaseConnector {
    async fn load_all(&self) -> Result<Vec<ItemOrFailure>, SyncError>;
}

/// Pull one modified-time window in a single, non-resumable call.
#[async_trait]
pub trait PollConnector: BaseConnector {
    async fn poll(&self, window: TimeWindow) -> Result<Vec<ItemOrFailure>, SyncError>;
}

/// Output of one checkpointed sync call.
#[derive(Debug)]
pub struct SyncStep<C> {
    pub outcomes: Vec<ItemOrFailure>,
    pub checkpoint: C,
}

/// Resumable sync: each call performs exactly one unit of network work
/// (one page, one day bucket) and returns the successor checkpoint. The
/// caller invokes it repeatedly until `checkpoint.has_more()` is false.
#[async_trait]
pub trait CheckpointedConnector: BaseConnector {
    type Checkpoint: SyncCheckpoint;

    async fn sync(
        &self,
        window: TimeWindow,
        checkpoint: Self::Checkpoint,
    ) -> Result<SyncStep<Self::Checkpoint>, SyncError>;
}

/// Enumerate ids and access metadata only, for deletion/permission sweeps.
/// Yielded in batches; never carries content.
#[async_trait]
pub trait SlimConnector: BaseConnector {
    async fn enumerate_all(
        &self,
        window: Option<TimeWindow>,
    ) -> Result<Vec<Vec<SlimItem>>, SyncError>;
}

/// Attach current access-control metadata to already-indexed items.
///
/// Permission sweeps run on their own cadence, separate from content sync:
/// an item whose content has not changed can still change visibility.
#[async_trait]
pub trait PermSyncConnector: BaseConnector {
    /// Current access descriptors for the requested ids. Ids the source no
    /// longer knows are simply absent from the result (the pruning sweep
    /// owns deletions).
    async fn fetch_access(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, AccessDescriptor>, SyncError>;
}

/// One blob-level checkpointed transition.
#[derive(Debug)]
pub struct BlobStep {
    pub outcomes: Vec<ItemOrFailure>,
    /// Serialized successor checkpoint — opaque to the caller.
    pub blob: String,
    pub has_more: bool,
}

/// Object-safe, checkpoint-erased view of [`CheckpointedConnector`].
///
/// Implemented for every checkpointed connector via a blanket impl; never
/// implemented by hand.
#[async_trait]
pub trait DynCheckpointed: BaseConnector {
    /// Run one transition. `blob = None` starts from the fresh (dummy)
    /// checkpoint; malformed blobs are rejected with a typed error.
    async fn sync_blob(
        &self,
        window: TimeWindow,
        blob: Option<&str>,
    ) -> Result<BlobStep, SyncError>;

    /// Validate a stored blob without running anything.
    fn validate_blob(&self, blob: &str) -> Result<(), SyncError>;

    /// The serialized fresh checkpoint.
    fn fresh_blob(&self) -> Result<String, SyncError>;
}

impl std::fmt::Debug for dyn DynCheckpointed + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DynCheckpointed({})", self.name())
    }
}

#[async_trait]
impl<T> DynCheckpointed for T
where
    T: CheckpointedConnector,
{
    async fn sync_blob(
        &self,
        window: TimeWindow,
        blob: Option<&str>,
    ) -> Result<BlobStep, SyncError> {
        let current = match blob {
            Some(blob) => checkpoint::validate_blob::<T::Checkpoint>(blob)?,
            None => T::Checkpoint::fresh(),
        };
        let step = self.sync(window, current).await?;
        let has_more = step.checkpoint.has_more();
        Ok(BlobStep {
            outcomes: step.outcomes,
            blob: checkpoint::serialize_blob(&step.checkpoint)?,
            has_more,
        })
    }

    fn validate_blob(&self, blob: &str) -> Result<(), SyncError> {
        checkpoint::validate_blob::<T::Checkpoint>(blob).map(|_| ())
    }

    fn fresh_blob(&self) -> Result<String, SyncError> {
        checkpoint::serialize_blob(&T::Checkpoint::fresh())
    }
}

/// Capability tags a source instance can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Load,
    Poll,
    Checkpointed,
    Slim,
    PermSync,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Load => "load",
            Capability::Poll => "poll",
            Capability::Checkpointed => "checkpointed",
            Capability::Slim => "slim",
            Capability::PermSync => "perm-sync",
        }
    }
}

/// A registered source instance and the capability set it was built with.
///
/// Absent capabilities are `None`; `require_*` turns an absent capability
/// into a [`SyncError::Configuration`] before any network work happens.
#[derive(Clone)]
pub struct SourceRuntime {
    label: String,
    load: Option<Arc<dyn LoadConnector>>,
    poll: Option<Arc<dyn PollConnector>>,
    checkpointed: Option<Arc<dyn DynCheckpointed>>,
    slim: Option<Arc<dyn SlimConnector>>,
    perm_sync: Option<Arc<dyn PermSyncConnector>>,
}

impl std::fmt::Debug for SourceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRuntime")
            .field("label", &self.label)
            .field("load", &self.load.is_some())
            .field("poll", &self.poll.is_some())
            .field("checkpointed", &self.checkpointed.is_some())
            .field("slim", &self.slim.is_some())
            .field("perm_sync", &self.perm_sync.is_some())
            .finish()
    }
}

impl SourceRuntime {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            load: None,
            poll: None,
            checkpointed: None,
            slim: None,
            perm_sync: None,
        }
    }

    pub fn with_load(mut self, connector: Arc<dyn LoadConnector>) -> Self {
        self.load = Some(connector);
        self
    }

    pub fn with_poll(mut self, connector: Arc<dyn PollConnector>) -> Self {
        self.poll = Some(connector);
        self
    }

    pub fn with_checkpointed(mut self, connector: Arc<dyn DynCheckpointed>) -> Self {
        self.checkpointed = Some(connector);
        self
    }

    pub fn with_slim(mut self, connector: Arc<dyn SlimConnector>) -> Self {
        self.slim = Some(connector);
        self
    }

    pub fn with_perm_sync(mut self, connector: Arc<dyn PermSyncConnector>) -> Self {
        self.perm_sync = Some(connector);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.load.is_some() {
            caps.push(Capability::Load);
        }
        if self.poll.is_some() {
            caps.push(Capability::Poll);
        }
        if self.checkpointed.is_some() {
            caps.push(Capability::Checkpointed);
        }
        if self.slim.is_some() {
            caps.push(Capability::Slim);
        }
        if self.perm_sync.is_some() {
            caps.push(Capability::PermSync);
        }
        caps
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Run the pre-flight check against whichever connector objects are
    /// registered (they may all be the same underlying instance).
    pub fn validate_settings(&self) -> Result<(), SyncError> {
        if let Some(c) = &self.checkpointed {
            c.validate_settings()?;
        } else if let Some(c) = &self.poll {
            c.validate_settings()?;
        } else if let Some(c) = &self.load {
            c.validate_settings()?;
        } else if let Some(c) = &self.slim {
            c.validate_settings()?;
        } else if let Some(c) = &self.perm_sync {
            c.validate_settings()?;
        }
        Ok(())
    }

    pub fn require_load(&self) -> Result<&dyn LoadConnector, SyncError> {
        self.load
            .as_deref()
            .ok_or_else(|| self.unsupported(Capability::Load))
    }

    pub fn require_poll(&self) -> Result<&dyn PollConnector, SyncError> {
        self.poll
            .as_deref()
            .ok_or_else(|| self.unsupported(Capability::Poll))
    }

    pub fn require_checkpointed(&self) -> Result<&dyn DynCheckpointed, SyncError> {
        self.checkpointed
            .as_deref()
            .ok_or_else(|| self.unsupported(Capability::Checkpointed))
    }

    pub fn require_slim(&self) -> Result<&dyn SlimConnector, SyncError> {
        self.slim
            .as_deref()
            .ok_or_else(|| self.unsupported(Capability::Slim))
    }

    pub fn require_perm_sync(&self) -> Result<&dyn PermSyncConnector, SyncError> {
        self.perm_sync
            .as_deref()
            .ok_or_else(|| self.unsupported(Capability::PermSync))
    }

    fn unsupported(&self, capability: Capability) -> SyncError {
        SyncError::Configuration(format!(
            "source '{}' does not support the '{}' capability",
            self.label,
            capability.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CursorCheckpoint;

    struct Nothing;

    impl BaseConnector for Nothing {
        fn name(&self) -> &str {
            "none"
        }
        fn source_type(&self) -> &str {
            "test"
        }
    }

    #[async_trait]
    impl CheckpointedConnector for Nothing {
        type Checkpoint = CursorCheckpoint;

        async fn sync(
            &self,
            _window: TimeWindow,
            mut checkpoint: CursorCheckpoint,
        ) -> Result<SyncStep<CursorCheckpoint>, SyncError> {
            checkpoint.set_has_more(false);
            Ok(SyncStep {
                outcomes: Vec::new(),
                checkpoint,
            })
        }
    }

    #[test]
    fn unsupported_capability_is_a_configuration_error() {
        let runtime = SourceRuntime::new("test:none");
        let err = runtime.require_checkpointed().unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(err.is_run_fatal());
    }

    #[test]
    fn capability_tags_reflect_registration() {
        let connector = Arc::new(Nothing);
        let runtime = SourceRuntime::new("test:none").with_checkpointed(connector);
        assert!(runtime.supports(Capability::Checkpointed));
        assert!(!runtime.supports(Capability::Slim));
        assert_eq!(runtime.capabilities(), vec![Capability::Checkpointed]);
    }

    #[tokio::test]
    async fn blob_erasure_round_trips_through_dyn_view() {
        let connector = Nothing;
        let dyn_view: &dyn DynCheckpointed = &connector;

        let fresh = dyn_view.fresh_blob().unwrap();
        dyn_view.validate_blob(&fresh).unwrap();
        assert!(dyn_view.validate_blob("garbage").is_err());

        let step = dyn_view
            .sync_blob(TimeWindow::unbounded(), Some(&fresh))
            .await
            .unwrap();
        assert!(!step.has_more);
        dyn_view.validate_blob(&step.blob).unwrap();
    }
}
