//! The worker loop around a source instance.
//!
//! One cycle = acquire the instance lease, load (or create) the checkpoint,
//! pull batches from the sync session handing each to the index sink,
//! persist the returned checkpoint blob after every batch, renew the lease
//! as a heartbeat, release on the way out. A crash between calls loses at
//! most the in-flight call's unpersisted batches, which at-least-once
//! delivery plus idempotent upsert makes safe.
//!
//! Independent source instances run as separate tokio tasks; within one
//! instance there is no parallelism, since pagination is inherently
//! sequential per sub-resource.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::connector::{Capability, SourceRuntime};
use crate::error::SyncError;
use crate::lock::LeaseStore;
use crate::models::{Batch, Failure, Item, ItemOrFailure};
use crate::runner::SyncSession;
use crate::store::{CheckpointStore, IndexSink};
use crate::window::TimeWindow;

/// Shared collaborators for scheduler work.
#[derive(Clone)]
pub struct SyncDeps {
    pub checkpoints: Arc<CheckpointStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub sink: Arc<dyn IndexSink>,
}

/// Per-cycle knobs.
#[derive(Debug, Clone, Copy)]
pub struct CycleOptions {
    pub batch_size: usize,
    pub lease_ttl: Duration,
    /// Discard the stored checkpoint and restart from the dummy one.
    pub full_resync: bool,
}

/// Counters from one completed cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub items: u64,
    pub failures: u64,
    pub batches: u64,
}

/// How one cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another worker holds the lease; not an error.
    SkippedLocked,
}

fn sync_lease_key(label: &str) -> String {
    format!("sync:{label}")
}

/// Run one sync cycle for a source instance, dispatching on its
/// capability set: Checkpointed when available, otherwise Poll, otherwise
/// Load. No capability at all is a configuration error.
pub async fn run_source_cycle(
    source: &SourceRuntime,
    window: TimeWindow,
    options: CycleOptions,
    deps: &SyncDeps,
) -> Result<CycleOutcome, SyncError> {
    let label = source.label().to_string();
    let lease_key = sync_lease_key(&label);

    if !deps.leases.acquire(&lease_key, options.lease_ttl).await? {
        info!(source = %label, "lease held elsewhere, skipping cycle");
        return Ok(CycleOutcome::SkippedLocked);
    }

    let result = run_locked_cycle(source, window, options, deps, &label).await;
    deps.leases.release(&lease_key).await?;
    result
}

async fn run_locked_cycle(
    source: &SourceRuntime,
    window: TimeWindow,
    options: CycleOptions,
    deps: &SyncDeps,
    label: &str,
) -> Result<CycleOutcome, SyncError> {
    // Pre-flight: settings and credentials, before any paginated work.
    source.validate_settings()?;

    let report = if source.supports(Capability::Checkpointed) {
        run_checkpointed(source, window, options, deps, label).await?
    } else if source.supports(Capability::Poll) {
        let outcomes = source.require_poll()?.poll(window).await?;
        apply_outcomes(outcomes, options.batch_size, deps, label).await?
    } else if source.supports(Capability::Load) {
        let outcomes = source.require_load()?.load_all().await?;
        apply_outcomes(outcomes, options.batch_size, deps, label).await?
    } else {
        return Err(SyncError::Configuration(format!(
            "source '{label}' has no sync capability"
        )));
    };

    info!(
        source = %label,
        items = report.items,
        failures = report.failures,
        batches = report.batches,
        "sync cycle complete"
    );
    Ok(CycleOutcome::Completed(report))
}

async fn run_checkpointed(
    source: &SourceRuntime,
    window: TimeWindow,
    options: CycleOptions,
    deps: &SyncDeps,
    label: &str,
) -> Result<CycleReport, SyncError> {
    let connector = source.require_checkpointed()?;
    let lease_key = sync_lease_key(label);

    let blob = if options.full_resync {
        deps.checkpoints.clear(label).await?;
        None
    } else {
        deps.checkpoints.get(label).await?
    };

    let mut session = SyncSession::new(connector, window, options.batch_size, blob)?;
    let mut report = CycleReport::default();

    while let Some(session_batch) = session.next_batch().await? {
        apply_batch(session_batch.batch, deps, label, &mut report).await?;
        deps.checkpoints
            .set(label, &session_batch.checkpoint_blob)
            .await?;
        report.batches += 1;

        // Heartbeat: a live worker keeps its lease fresh between batches.
        if !deps.leases.renew(&lease_key, options.lease_ttl).await? {
            warn!(source = %label, "lease lost mid-run, aborting cycle");
            return Err(SyncError::Upstream(format!(
                "lease for '{label}' was lost mid-run"
            )));
        }
    }

    // Persist the exhausted checkpoint even when the final call produced
    // no batch (e.g. an empty source).
    deps.checkpoints.set(label, session.checkpoint_blob()).await?;
    Ok(report)
}

async fn apply_outcomes(
    outcomes: Vec<ItemOrFailure>,
    batch_size: usize,
    deps: &SyncDeps,
    label: &str,
) -> Result<CycleReport, SyncError> {
    let mut report = CycleReport::default();
    let mut outcomes = outcomes;
    while !outcomes.is_empty() {
        let rest = outcomes.split_off(outcomes.len().min(batch_size));
        apply_batch(outcomes, deps, label, &mut report).await?;
        report.batches += 1;
        outcomes = rest;
    }
    Ok(report)
}

async fn apply_batch(
    batch: Batch,
    deps: &SyncDeps,
    label: &str,
    report: &mut CycleReport,
) -> Result<(), SyncError> {
    let mut items: Vec<Item> = Vec::new();
    let mut failures: Vec<Failure> = Vec::new();
    for slot in batch {
        match slot {
            ItemOrFailure::Item(item) => items.push(item),
            ItemOrFailure::Failure(failure) => failures.push(failure),
        }
    }

    deps.sink.upsert(&items).await?;
    for failure in &failures {
        deps.sink.record_failure(label, failure).await?;
    }

    report.items += items.len() as u64;
    report.failures += failures.len() as u64;
    Ok(())
}

/// Counters from one pruning sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneReport {
    pub live: u64,
    pub deleted: u64,
}

/// How one pruning sweep ended.
#[derive(Debug)]
pub enum PruneOutcome {
    Completed(PruneReport),
    SkippedLocked,
}

/// Deletion sweep: enumerate the source's live ids through its slim
/// capability and delete indexed ids the source no longer has.
pub async fn prune_source(
    source: &SourceRuntime,
    options: CycleOptions,
    deps: &SyncDeps,
) -> Result<PruneOutcome, SyncError> {
    let label = source.label().to_string();
    let lease_key = format!("prune:{label}");

    if !deps.leases.acquire(&lease_key, options.lease_ttl).await? {
        info!(source = %label, "prune lease held elsewhere, skipping");
        return Ok(PruneOutcome::SkippedLocked);
    }

    let result = async {
        let slim = source.require_slim()?;
        slim.validate_settings()?;

        let mut live: std::collections::HashSet<String> = std::collections::HashSet::new();
        for batch in slim.enumerate_all(None).await? {
            live.extend(batch.into_iter().map(|slim_item| slim_item.id));
        }

        let known = deps.sink.known_ids(&label).await?;
        let stale: Vec<String> = known.difference(&live).cloned().collect();
        let deleted = if stale.is_empty() {
            0
        } else {
            deps.sink.delete_ids(&label, &stale).await?
        };

        info!(source = %label, live = live.len(), deleted, "prune sweep complete");
        Ok(PruneOutcome::Completed(PruneReport {
            live: live.len() as u64,
            deleted,
        }))
    }
    .await;

    deps.leases.release(&lease_key).await?;
    result
}

/// Counters from one permission sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermSyncReport {
    pub checked: u64,
    pub updated: u64,
}

/// How one permission sweep ended.
#[derive(Debug)]
pub enum PermSyncOutcome {
    Completed(PermSyncReport),
    SkippedLocked,
}

/// Permission sweep: refresh the stored access descriptor of every indexed
/// item from the source, independent of content sync. Ids the source no
/// longer reports are left for the pruning sweep.
pub async fn sync_permissions(
    source: &SourceRuntime,
    options: CycleOptions,
    deps: &SyncDeps,
) -> Result<PermSyncOutcome, SyncError> {
    let label = source.label().to_string();
    let lease_key = format!("perms:{label}");

    if !deps.leases.acquire(&lease_key, options.lease_ttl).await? {
        info!(source = %label, "permission lease held elsewhere, skipping");
        return Ok(PermSyncOutcome::SkippedLocked);
    }

    let result = async {
        let connector = source.require_perm_sync()?;
        connector.validate_settings()?;

        let mut ids: Vec<String> = deps.sink.known_ids(&label).await?.into_iter().collect();
        ids.sort();

        let mut report = PermSyncReport::default();
        for chunk in ids.chunks(options.batch_size.max(1)) {
            let access = connector.fetch_access(chunk).await?;
            for (id, descriptor) in &access {
                report.updated += deps.sink.update_access(&label, id, descriptor).await?;
            }
            report.checked += chunk.len() as u64;

            if !deps.leases.renew(&lease_key, options.lease_ttl).await? {
                warn!(source = %label, "permission lease lost mid-sweep, aborting");
                return Err(SyncError::Upstream(format!(
                    "lease for '{label}' was lost mid-run"
                )));
            }
        }

        info!(
            source = %label,
            checked = report.checked,
            updated = report.updated,
            "permission sweep complete"
        );
        Ok(PermSyncOutcome::Completed(report))
    }
    .await;

    deps.leases.release(&lease_key).await?;
    result
}

/// Run a cycle for every source concurrently, each as its own tokio task.
/// Mutual exclusion comes from the lease store, so overlapping schedulers
/// are safe: a held instance is simply skipped.
pub async fn run_all(
    sources: Vec<SourceRuntime>,
    window: TimeWindow,
    options: CycleOptions,
    deps: SyncDeps,
) -> Vec<(String, Result<CycleOutcome, SyncError>)> {
    let mut handles = Vec::new();
    for source in sources {
        let deps = deps.clone();
        let label = source.label().to_string();
        handles.push((
            label,
            tokio::spawn(async move {
                run_source_cycle(&source, window, options, &deps).await
            }),
        ));
    }

    let mut results = Vec::new();
    for (label, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(SyncError::Upstream(format!(
                "sync task for '{label}' panicked: {join_err}"
            ))),
        };
        results.push((label, result));
    }
    results
}
