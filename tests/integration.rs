//! End-to-end tests over a real (temporary) SQLite database: full sync
//! cycles, crash-resumption, failure isolation, lease exclusion, pruning.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ingest_harness::checkpoint::{CursorCheckpoint, SyncCheckpoint};
use ingest_harness::config::FsSourceConfig;
use ingest_harness::connector::{BaseConnector, CheckpointedConnector, SourceRuntime, SyncStep};
use ingest_harness::connector_fs::FsConnector;
use ingest_harness::db;
use ingest_harness::error::SyncError;
use ingest_harness::failure::FailurePolicy;
use ingest_harness::lock::{LeaseStore, SqliteLeaseStore};
use ingest_harness::migrate;
use ingest_harness::models::{Failure, Item, ItemOrFailure};
use ingest_harness::runner::SyncSession;
use ingest_harness::scheduler::{
    prune_source, run_source_cycle, sync_permissions, CycleOptions, CycleOutcome, PermSyncOutcome,
    PruneOutcome, SyncDeps,
};
use ingest_harness::store::{CheckpointStore, SqliteSink};
use ingest_harness::window::TimeWindow;

async fn test_deps(dir: &Path) -> (SyncDeps, sqlx::SqlitePool) {
    let pool = db::connect(&dir.join("ingest.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let deps = SyncDeps {
        checkpoints: Arc::new(CheckpointStore::new(pool.clone())),
        leases: Arc::new(SqliteLeaseStore::new(pool.clone())),
        sink: Arc::new(SqliteSink::new(pool.clone())),
    };
    (deps, pool)
}

fn options(batch_size: usize) -> CycleOptions {
    CycleOptions {
        batch_size,
        lease_ttl: Duration::from_secs(60),
        full_resync: false,
    }
}

fn item(id: &str) -> ItemOrFailure {
    ItemOrFailure::Item(Item {
        id: id.to_string(),
        sections: Vec::new(),
        source: "test:paged".to_string(),
        semantic_identifier: id.to_string(),
        updated_at: None,
        metadata: Default::default(),
        owners: Vec::new(),
        access: None,
    })
}

/// Emits synthetic items in fixed-size pages, one page per sync call,
/// counting the calls it receives.
struct Paged {
    pages: Vec<Vec<ItemOrFailure>>,
    calls: AtomicUsize,
}

impl Paged {
    fn of_ids(ids: &[String], per_page: usize) -> Self {
        let pages = ids
            .chunks(per_page)
            .map(|chunk| chunk.iter().map(|id| item(id)).collect())
            .collect();
        Self {
            pages,
            calls: AtomicUsize::new(0),
        }
    }
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = checkpoint
            .cursor
            .as_deref()
            .map(|c| c.parse::<usize>().unwrap())
            .unwrap_or(0);

        let outcomes = self.pages.get(index).cloned().unwrap_or_default();
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

async fn doc_count(pool: &sqlx::SqlitePool, source: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE source = ?")
        .bind(source)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn checkpointed_cycle_delivers_everything_exactly_once_per_run() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    // 145 items in pages of 100: a full page and a short one.
    let ids: Vec<String> = (0..145).map(|n| format!("item-{n:03}")).collect();
    let connector = Arc::new(Paged::of_ids(&ids, 100));
    let runtime = SourceRuntime::new("test:paged").with_checkpointed(connector);

    let outcome = run_source_cycle(&runtime, TimeWindow::unbounded(), options(64), &deps)
        .await
        .unwrap();
    match outcome {
        CycleOutcome::Completed(report) => {
            assert_eq!(report.items, 145);
            assert_eq!(report.failures, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(doc_count(&pool, "test:paged").await, 145);

    // The stored checkpoint is exhausted.
    let blob = deps.checkpoints.get("test:paged").await.unwrap().unwrap();
    let checkpoint: CursorCheckpoint = ingest_harness::checkpoint::validate_blob(&blob).unwrap();
    assert!(!checkpoint.has_more());

    // A second cycle re-upserts without duplicating rows.
    run_source_cycle(&runtime, TimeWindow::unbounded(), options(64), &deps)
        .await
        .unwrap();
    assert_eq!(doc_count(&pool, "test:paged").await, 145);
}

#[tokio::test]
async fn restart_after_every_batch_loses_nothing() {
    // Simulate a worker that crashes after persisting each batch: a new
    // session resumes from the stored blob every time. Every item must
    // still be delivered at least once.
    let ids: Vec<String> = (0..30).map(|n| format!("item-{n:02}")).collect();
    let connector = Paged::of_ids(&ids, 7);

    let mut delivered: Vec<String> = Vec::new();
    let mut blob: Option<String> = None;
    loop {
        let mut session =
            SyncSession::new(&connector, TimeWindow::unbounded(), 7, blob.clone()).unwrap();
        match session.next_batch().await.unwrap() {
            Some(batch) => {
                for slot in &batch.batch {
                    delivered.push(slot.item_id().to_string());
                }
                // "Crash" here: only the persisted blob survives.
                blob = Some(batch.checkpoint_blob);
                if !batch.has_more {
                    break;
                }
            }
            None => break,
        }
    }

    let unique: std::collections::HashSet<&String> = delivered.iter().collect();
    assert_eq!(unique.len(), 30, "every item delivered at least once");
    // Re-delivery after a restart is allowed; loss is not.
    assert!(delivered.len() >= 30);
}

/// Two good items with a per-item failure between them.
struct Mixed;

impl BaseConnector for Mixed {
    fn name(&self) -> &str {
        "mixed"
    }
    fn source_type(&self) -> &str {
        "test"
    }
}

#[async_trait]
impl CheckpointedConnector for Mixed {
    type Checkpoint = CursorCheckpoint;

    async fn sync(
        &self,
        _window: TimeWindow,
        mut checkpoint: CursorCheckpoint,
    ) -> Result<SyncStep<CursorCheckpoint>, SyncError> {
        checkpoint.set_has_more(false);
        Ok(SyncStep {
            outcomes: vec![
                item("good-1"),
                ItemOrFailure::Failure(Failure {
                    item_id: "bad-1".to_string(),
                    message: "unparseable record".to_string(),
                    cause: None,
                }),
                item("good-2"),
            ],
            checkpoint,
        })
    }
}

#[tokio::test]
async fn per_item_failures_are_recorded_without_aborting() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    let runtime = SourceRuntime::new("test:mixed").with_checkpointed(Arc::new(Mixed));
    let outcome = run_source_cycle(&runtime, TimeWindow::unbounded(), options(10), &deps)
        .await
        .unwrap();
    match outcome {
        CycleOutcome::Completed(report) => {
            assert_eq!(report.items, 2);
            assert_eq!(report.failures, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(doc_count(&pool, "test:mixed").await, 2);
    let failures: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures WHERE source = ?")
        .bind("test:mixed")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(failures, 1);
}

/// One good page, then a pagination integrity violation.
struct BreaksOnSecondPage;

impl BaseConnector for BreaksOnSecondPage {
    fn name(&self) -> &str {
        "breaks"
    }
    fn source_type(&self) -> &str {
        "test"
    }
}

#[async_trait]
impl CheckpointedConnector for BreaksOnSecondPage {
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
            outcomes: vec![item("page-1-item")],
            checkpoint: CursorCheckpoint {
                cursor: Some("tok".to_string()),
                sub_resource: 0,
                has_more: true,
            },
        })
    }
}

#[tokio::test]
async fn integrity_violation_halts_but_keeps_partial_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    let runtime = SourceRuntime::new("test:breaks").with_checkpointed(Arc::new(BreaksOnSecondPage));
    let err = run_source_cycle(&runtime, TimeWindow::unbounded(), options(10), &deps)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::PaginationIntegrity { .. }));
    assert!(err.is_run_fatal());

    // The good page was applied and its checkpoint persisted, so the next
    // run resumes instead of restarting.
    assert_eq!(doc_count(&pool, "test:breaks").await, 1);
    let blob = deps.checkpoints.get("test:breaks").await.unwrap().unwrap();
    let checkpoint: CursorCheckpoint = ingest_harness::checkpoint::validate_blob(&blob).unwrap();
    assert_eq!(checkpoint.cursor.as_deref(), Some("tok"));
    assert!(checkpoint.has_more());

    // The lease was released despite the error.
    assert!(deps
        .leases
        .acquire("sync:test:breaks", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn held_lease_skips_the_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    // Another worker (a different store instance, hence different owner)
    // holds the sync lease.
    let other = SqliteLeaseStore::new(pool.clone());
    assert!(other
        .acquire("sync:test:paged", Duration::from_secs(60))
        .await
        .unwrap());

    let connector = Arc::new(Paged::of_ids(&["only".to_string()], 10));
    let runtime = SourceRuntime::new("test:paged").with_checkpointed(connector.clone());
    let outcome = run_source_cycle(&runtime, TimeWindow::unbounded(), options(10), &deps)
        .await
        .unwrap();
    assert!(matches!(outcome, CycleOutcome::SkippedLocked));
    assert_eq!(connector.calls.load(Ordering::SeqCst), 0);

    // Releasing frees the source again.
    other.release("sync:test:paged").await.unwrap();
    let outcome = run_source_cycle(&runtime, TimeWindow::unbounded(), options(10), &deps)
        .await
        .unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
}

#[tokio::test]
async fn expired_leases_can_be_claimed_by_anyone() {
    let tmp = tempfile::tempdir().unwrap();
    let (_, pool) = test_deps(tmp.path()).await;

    let crashed = SqliteLeaseStore::new(pool.clone());
    let successor = SqliteLeaseStore::new(pool.clone());

    // A zero-TTL lease is expired the moment it is written, standing in
    // for a crashed worker whose lease ran out.
    assert!(crashed.acquire("sync:x", Duration::ZERO).await.unwrap());
    assert!(successor
        .acquire("sync:x", Duration::from_secs(60))
        .await
        .unwrap());

    // The crashed worker can no longer renew what it lost.
    assert!(!crashed.renew("sync:x", Duration::from_secs(60)).await.unwrap());
    assert!(successor
        .renew("sync:x", Duration::from_secs(60))
        .await
        .unwrap());

    // Release by a non-owner is a no-op.
    crashed.release("sync:x").await.unwrap();
    assert!(successor
        .renew("sync:x", Duration::from_secs(60))
        .await
        .unwrap());
}

fn fs_connector(root: &Path) -> Arc<FsConnector> {
    Arc::new(
        FsConnector::new(
            "docs".to_string(),
            FsSourceConfig {
                root: root.to_path_buf(),
                include_globs: vec!["**/*.md".to_string()],
                exclude_globs: vec![],
                follow_symlinks: false,
                floor_date: None,
                lookback_secs: Some(0),
            },
            Duration::ZERO,
            FailurePolicy::default(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn filesystem_source_syncs_and_prunes_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    let docs = tmp.path().join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("alpha.md"), "# Alpha").unwrap();
    std::fs::write(docs.join("beta.md"), "# Beta").unwrap();

    let connector = fs_connector(&docs);
    let runtime = SourceRuntime::new("filesystem:docs")
        .with_checkpointed(connector.clone())
        .with_slim(connector);

    run_source_cycle(&runtime, TimeWindow::unbounded(), options(10), &deps)
        .await
        .unwrap();
    assert_eq!(doc_count(&pool, "filesystem:docs").await, 2);

    // One file disappears at the source; pruning removes its document.
    std::fs::remove_file(docs.join("beta.md")).unwrap();
    let outcome = prune_source(&runtime, options(10), &deps).await.unwrap();
    match outcome {
        PruneOutcome::Completed(report) => {
            assert_eq!(report.live, 1);
            assert_eq!(report.deleted, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(doc_count(&pool, "filesystem:docs").await, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn permission_sweep_refreshes_access_metadata() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    let docs = tmp.path().join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    let file = docs.join("alpha.md");
    std::fs::write(&file, "# Alpha").unwrap();
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

    let connector = fs_connector(&docs);
    let runtime = SourceRuntime::new("filesystem:docs")
        .with_checkpointed(connector.clone())
        .with_perm_sync(connector);

    run_source_cycle(&runtime, TimeWindow::unbounded(), options(10), &deps)
        .await
        .unwrap();

    // The file stops being world-readable; a permission sweep must reflect
    // that without re-syncing content.
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();
    let outcome = sync_permissions(&runtime, options(10), &deps).await.unwrap();
    match outcome {
        PermSyncOutcome::Completed(report) => {
            assert_eq!(report.checked, 1);
            assert_eq!(report.updated, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let access_json: String = sqlx::query_scalar(
        "SELECT access_json FROM documents WHERE source = ? AND semantic_identifier = ?",
    )
    .bind("filesystem:docs")
    .bind("alpha.md")
    .fetch_one(&pool)
    .await
    .unwrap();
    let access: serde_json::Value = serde_json::from_str(&access_json).unwrap();
    assert_eq!(access["is_public"], serde_json::Value::Bool(false));
}

#[tokio::test]
async fn full_resync_discards_the_stored_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, _pool) = test_deps(tmp.path()).await;

    // Park a bogus in-progress checkpoint; a full resync must ignore it
    // rather than trying to resume from it.
    deps.checkpoints
        .set(
            "test:paged",
            "{\"cursor\":\"stale\",\"sub_resource\":0,\"has_more\":true}",
        )
        .await
        .unwrap();

    let ids: Vec<String> = (0..3).map(|n| format!("item-{n}")).collect();
    let connector = Arc::new(Paged::of_ids(&ids, 10));
    let runtime = SourceRuntime::new("test:paged").with_checkpointed(connector);

    let outcome = run_source_cycle(
        &runtime,
        TimeWindow::unbounded(),
        CycleOptions {
            batch_size: 10,
            lease_ttl: Duration::from_secs(60),
            full_resync: true,
        },
        &deps,
    )
    .await
    .unwrap();
    match outcome {
        CycleOutcome::Completed(report) => assert_eq!(report.items, 3),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let blob = deps.checkpoints.get("test:paged").await.unwrap().unwrap();
    let checkpoint: CursorCheckpoint = ingest_harness::checkpoint::validate_blob(&blob).unwrap();
    assert!(!checkpoint.has_more());
    assert_eq!(checkpoint.cursor, None);
}

#[tokio::test]
async fn idempotent_upsert_updates_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let (deps, pool) = test_deps(tmp.path()).await;

    let first = Item {
        id: "doc-1".to_string(),
        sections: Vec::new(),
        source: "test:x".to_string(),
        semantic_identifier: "old title".to_string(),
        updated_at: None,
        metadata: Default::default(),
        owners: Vec::new(),
        access: None,
    };
    let mut second = first.clone();
    second.semantic_identifier = "new title".to_string();

    deps.sink.upsert(&[first]).await.unwrap();
    deps.sink.upsert(&[second]).await.unwrap();

    assert_eq!(doc_count(&pool, "test:x").await, 1);
    let title: String = sqlx::query_scalar(
        "SELECT semantic_identifier FROM documents WHERE source = ? AND doc_id = ?",
    )
    .bind("test:x")
    .bind("doc-1")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(title, "new title");
}
