//! Local filesystem connector.
//!
//! Walks a directory tree, filters by include/exclude globs, and turns each
//! file into an [`Item`] keyed by its relative path. The filesystem has no
//! server-side cursor, so the checkpointed variant splits the effective
//! window into calendar-day sub-windows over file mtimes and checkpoints at
//! the day boundary (see [`crate::window::day_buckets`]).
//!
//! # Configuration
//!
//! ```toml
//! [sources.filesystem.docs]
//! root = "/srv/docs"
//! include_globs = ["**/*.md"]
//! floor_date = "2024-01-01"
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use std::time::Duration;
use walkdir::WalkDir;

use crate::checkpoint::{SyncCheckpoint, WindowCheckpoint};
use crate::config::FsSourceConfig;
use crate::connector::{
    BaseConnector, CheckpointedConnector, LoadConnector, PermSyncConnector, PollConnector,
    SlimConnector, SyncStep,
};
use crate::error::SyncError;
use crate::failure::{isolate, FailurePolicy};
use crate::models::{stable_item_id, AccessDescriptor, Item, ItemOrFailure, Section, SlimItem};
use crate::window::{day_buckets, effective_window, TimeWindow};

pub struct FsConnector {
    name: String,
    config: FsSourceConfig,
    include: GlobSet,
    exclude: GlobSet,
    floor: Option<DateTime<Utc>>,
    lookback: Duration,
    policy: FailurePolicy,
}

struct ScanEntry {
    rel_path: String,
    abs_path: PathBuf,
    modified: DateTime<Utc>,
}

impl FsConnector {
    pub fn new(
        name: String,
        config: FsSourceConfig,
        default_lookback: Duration,
        policy: FailurePolicy,
    ) -> Result<Self, SyncError> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        let floor = config
            .floor_date
            .as_deref()
            .map(parse_floor_date)
            .transpose()?;
        let lookback = config
            .lookback_secs
            .map(Duration::from_secs)
            .unwrap_or(default_lookback);

        Ok(Self {
            name,
            config,
            include,
            exclude,
            floor,
            lookback,
            policy,
        })
    }

    /// Walk the tree, returning matching entries whose mtime falls inside
    /// `filter` (when given). Content is read later, per item, so a single
    /// unreadable file is isolated instead of failing the scan.
    fn scan(&self, filter: Option<TimeWindow>) -> Result<Vec<ScanEntry>, SyncError> {
        let root = &self.config.root;
        if !root.exists() {
            return Err(SyncError::Configuration(format!(
                "filesystem source root does not exist: {}",
                root.display()
            )));
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let metadata = entry.metadata().map_err(std::io::Error::from)?;
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if let Some(window) = filter {
                if !window.contains(modified) {
                    continue;
                }
            }

            entries.push(ScanEntry {
                rel_path: rel_str,
                abs_path: path.to_path_buf(),
                modified,
            });
        }

        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(entries)
    }

    fn entry_id(&self, entry: &ScanEntry) -> String {
        stable_item_id(&self.source_label(), &[&entry.rel_path])
    }

    fn entry_to_item(&self, entry: &ScanEntry) -> Result<Item, SyncError> {
        let body = std::fs::read_to_string(&entry.abs_path)
            .map_err(|e| SyncError::ItemProcessing(format!("unreadable file: {e}")))?;
        Ok(Item {
            id: self.entry_id(entry),
            sections: vec![Section {
                text: body,
                link: Some(format!("file://{}", entry.abs_path.display())),
            }],
            source: self.source_label(),
            semantic_identifier: entry.rel_path.clone(),
            updated_at: Some(entry.modified),
            metadata: Default::default(),
            owners: Vec::new(),
            access: None,
        })
    }

    fn collect(&self, filter: Option<TimeWindow>) -> Result<Vec<ItemOrFailure>, SyncError> {
        let mut outcomes = Vec::new();
        for entry in self.scan(filter)? {
            let id = self.entry_id(&entry);
            outcomes.push(isolate(self.policy, &id, self.entry_to_item(&entry))?);
        }
        Ok(outcomes)
    }
}

impl BaseConnector for FsConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "filesystem"
    }

    fn validate_settings(&self) -> Result<(), SyncError> {
        if !self.config.root.exists() {
            return Err(SyncError::Configuration(format!(
                "filesystem source root does not exist: {}",
                self.config.root.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LoadConnector for FsConnector {
    async fn load_all(&self) -> Result<Vec<ItemOrFailure>, SyncError> {
        self.collect(None)
    }
}

#[async_trait]
impl PollConnector for FsConnector {
    async fn poll(&self, window: TimeWindow) -> Result<Vec<ItemOrFailure>, SyncError> {
        let effective = effective_window(window, self.floor, self.lookback);
        self.collect(Some(effective))
    }
}

#[async_trait]
impl CheckpointedConnector for FsConnector {
    type Checkpoint = WindowCheckpoint;

    /// One day bucket per call. The checkpoint records the start of the
    /// next unprocessed bucket; a restarted run re-derives the same bucket
    /// list from the window and resumes there.
    async fn sync(
        &self,
        window: TimeWindow,
        checkpoint: WindowCheckpoint,
    ) -> Result<SyncStep<WindowCheckpoint>, SyncError> {
        let effective = effective_window(window, self.floor, self.lookback);
        let buckets = day_buckets(effective);

        let index = match checkpoint.current_bucket_start {
            Some(start) => buckets
                .iter()
                .position(|bucket| bucket.start >= start)
                .unwrap_or(buckets.len()),
            None => 0,
        };

        let mut next = checkpoint.clone();
        if index >= buckets.len() {
            next.current_bucket_start = None;
            next.set_has_more(false);
            return Ok(SyncStep {
                outcomes: Vec::new(),
                checkpoint: next,
            });
        }

        let bucket = buckets[index];
        let outcomes = self.collect(Some(bucket))?;

        let has_more = index + 1 < buckets.len();
        next.current_bucket_start = if has_more {
            Some(buckets[index + 1].start)
        } else {
            None
        };
        next.set_has_more(has_more);

        Ok(SyncStep {
            outcomes,
            checkpoint: next,
        })
    }
}

#[async_trait]
impl SlimConnector for FsConnector {
    async fn enumerate_all(
        &self,
        window: Option<TimeWindow>,
    ) -> Result<Vec<Vec<SlimItem>>, SyncError> {
        let entries = self.scan(window)?;
        let batch: Vec<SlimItem> = entries
            .iter()
            .map(|entry| SlimItem {
                id: self.entry_id(entry),
                access: None,
            })
            .collect();
        if batch.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![batch])
        }
    }
}

#[async_trait]
impl PermSyncConnector for FsConnector {
    /// Access from file mode bits: world-readable files are public. Ids
    /// with no matching file are omitted; deletion is the pruning sweep's
    /// concern.
    async fn fetch_access(
        &self,
        ids: &[String],
    ) -> Result<std::collections::HashMap<String, AccessDescriptor>, SyncError> {
        let entries = self.scan(None)?;
        let by_id: std::collections::HashMap<String, &ScanEntry> = entries
            .iter()
            .map(|entry| (self.entry_id(entry), entry))
            .collect();

        let mut out = std::collections::HashMap::new();
        for id in ids {
            if let Some(entry) = by_id.get(id) {
                out.insert(id.clone(), file_access(&entry.abs_path)?);
            }
        }
        Ok(out)
    }
}

#[cfg(unix)]
fn file_access(path: &std::path::Path) -> Result<AccessDescriptor, SyncError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    Ok(AccessDescriptor {
        is_public: mode & 0o004 != 0,
        allowed: Vec::new(),
    })
}

#[cfg(not(unix))]
fn file_access(_path: &std::path::Path) -> Result<AccessDescriptor, SyncError> {
    Ok(AccessDescriptor {
        is_public: true,
        allowed: Vec::new(),
    })
}

fn parse_floor_date(date: &str) -> Result<DateTime<Utc>, SyncError> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| SyncError::Configuration(format!("invalid floor_date '{date}': {e}")))?;
    Ok(parsed.and_hms_opt(0, 0, 0).unwrap().and_utc())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| SyncError::Configuration(format!("invalid glob '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| SyncError::Configuration(format!("invalid glob set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(root: &std::path::Path) -> FsConnector {
        FsConnector::new(
            "docs".into(),
            FsSourceConfig {
                root: root.to_path_buf(),
                include_globs: vec!["**/*.md".into()],
                exclude_globs: vec![],
                follow_symlinks: false,
                floor_date: None,
                lookback_secs: Some(0),
            },
            Duration::ZERO,
            FailurePolicy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn load_all_yields_matching_files_with_stable_ids() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("alpha.md"), "# Alpha").unwrap();
        std::fs::write(tmp.path().join("beta.txt"), "ignored").unwrap();

        let connector = connector(tmp.path());
        let first = connector.load_all().await.unwrap();
        assert_eq!(first.len(), 1);

        // Same file, same id, across scans.
        let second = connector.load_all().await.unwrap();
        assert_eq!(first[0].item_id(), second[0].item_id());
    }

    #[tokio::test]
    async fn slim_enumeration_carries_no_content() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("alpha.md"), "# Alpha").unwrap();

        let connector = connector(tmp.path());
        let batches = connector.enumerate_all(None).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert!(!batches[0][0].id.is_empty());
    }

    #[tokio::test]
    async fn missing_root_fails_validation_pre_flight() {
        let connector = FsConnector::new(
            "ghost".into(),
            FsSourceConfig {
                root: PathBuf::from("/definitely/not/here"),
                include_globs: vec!["**/*.md".into()],
                exclude_globs: vec![],
                follow_symlinks: false,
                floor_date: None,
                lookback_secs: None,
            },
            Duration::ZERO,
            FailurePolicy::default(),
        )
        .unwrap();
        assert!(matches!(
            connector.validate_settings(),
            Err(SyncError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn checkpointed_sync_walks_day_buckets_to_exhaustion() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("alpha.md"), "# Alpha").unwrap();

        let connector = connector(tmp.path());
        // A two-day window ending now: the file (mtime = now) falls in the
        // final bucket.
        let window = TimeWindow::new(Utc::now() - chrono::Duration::days(2), Utc::now());

        let mut checkpoint = WindowCheckpoint::fresh();
        let mut seen = Vec::new();
        let mut calls = 0;
        while checkpoint.has_more() {
            let step = connector.sync(window, checkpoint).await.unwrap();
            for outcome in &step.outcomes {
                seen.push(outcome.item_id().to_string());
            }
            checkpoint = step.checkpoint;
            calls += 1;
            assert!(calls < 10, "runaway bucket loop");
        }
        assert_eq!(seen.len(), 1);
        assert!(checkpoint.current_bucket_start.is_none());
    }

    #[test]
    fn invalid_floor_date_is_a_configuration_error() {
        let err = parse_floor_date("03/10/2024").unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
