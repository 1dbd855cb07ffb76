//! Checkpoint persistence and the downstream index sink.
//!
//! The checkpoint store treats blobs as uninterpreted strings: whatever the
//! connector serialized is what comes back on the next cycle. The sink is
//! the seam to the downstream indexing collaborator; the SQLite
//! implementation upserts idempotently by `(source, item id)`, which is the
//! property that makes at-least-once re-delivery safe.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::error::SyncError;
use crate::models::{AccessDescriptor, Failure, Item};

/// Opaque checkpoint blob storage, one row per source instance.
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, source: &str) -> Result<Option<String>, SyncError> {
        let blob: Option<String> =
            sqlx::query_scalar("SELECT blob FROM checkpoints WHERE source = ?")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob)
    }

    pub async fn set(&self, source: &str, blob: &str) -> Result<(), SyncError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, blob, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                blob = excluded.blob,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(blob)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Discard the stored checkpoint (full-resync request or source
    /// configuration change).
    pub async fn clear(&self, source: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM checkpoints WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// The downstream indexing collaborator.
///
/// Consumers must upsert idempotently by item id; batches may be
/// re-delivered after a resume or because of the lookback overlap.
#[async_trait]
pub trait IndexSink: Send + Sync {
    async fn upsert(&self, items: &[Item]) -> Result<(), SyncError>;

    async fn record_failure(&self, source: &str, failure: &Failure) -> Result<(), SyncError>;

    /// All item ids currently indexed for a source instance. Used by the
    /// pruning sweep to detect source-side deletions.
    async fn known_ids(&self, source: &str) -> Result<HashSet<String>, SyncError>;

    async fn delete_ids(&self, source: &str, ids: &[String]) -> Result<u64, SyncError>;

    /// Overwrite the stored access descriptor for one item. Returns the
    /// number of rows touched (zero when the item is not indexed).
    async fn update_access(
        &self,
        source: &str,
        item_id: &str,
        access: &AccessDescriptor,
    ) -> Result<u64, SyncError>;
}

/// SQLite-backed sink.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexSink for SqliteSink {
    async fn upsert(&self, items: &[Item]) -> Result<(), SyncError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for item in items {
            let sections_json = serde_json::to_string(&item.sections)
                .map_err(|e| SyncError::ItemProcessing(format!("unserializable sections: {e}")))?;
            let metadata_json = serde_json::to_string(&item.metadata)
                .map_err(|e| SyncError::ItemProcessing(format!("unserializable metadata: {e}")))?;
            let owners_json = serde_json::to_string(&item.owners)
                .map_err(|e| SyncError::ItemProcessing(format!("unserializable owners: {e}")))?;
            let access_json = item
                .access
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| SyncError::ItemProcessing(format!("unserializable access: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO documents
                    (source, doc_id, semantic_identifier, sections_json, metadata_json,
                     owners_json, access_json, updated_at, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source, doc_id) DO UPDATE SET
                    semantic_identifier = excluded.semantic_identifier,
                    sections_json = excluded.sections_json,
                    metadata_json = excluded.metadata_json,
                    owners_json = excluded.owners_json,
                    access_json = excluded.access_json,
                    updated_at = excluded.updated_at,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&item.source)
            .bind(&item.id)
            .bind(&item.semantic_identifier)
            .bind(&sections_json)
            .bind(&metadata_json)
            .bind(&owners_json)
            .bind(&access_json)
            .bind(item.updated_at.map(|t| t.timestamp()))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(&self, source: &str, failure: &Failure) -> Result<(), SyncError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO sync_failures (source, item_id, message, cause, occurred_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source)
        .bind(&failure.item_id)
        .bind(&failure.message)
        .bind(&failure.cause)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn known_ids(&self, source: &str) -> Result<HashSet<String>, SyncError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT doc_id FROM documents WHERE source = ?")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn update_access(
        &self,
        source: &str,
        item_id: &str,
        access: &AccessDescriptor,
    ) -> Result<u64, SyncError> {
        let access_json = serde_json::to_string(access)
            .map_err(|e| SyncError::ItemProcessing(format!("unserializable access: {e}")))?;
        let result =
            sqlx::query("UPDATE documents SET access_json = ? WHERE source = ? AND doc_id = ?")
                .bind(&access_json)
                .bind(source)
                .bind(item_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_ids(&self, source: &str, ids: &[String]) -> Result<u64, SyncError> {
        let mut deleted = 0u64;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let result = sqlx::query("DELETE FROM documents WHERE source = ? AND doc_id = ?")
                .bind(source)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }
}
