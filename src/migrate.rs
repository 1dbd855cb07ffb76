//! Schema migrations. Idempotent — safe to run on every startup.

use sqlx::SqlitePool;

use crate::error::SyncError;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SyncError> {
    // Indexed documents, upserted idempotently by (source, doc_id).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            source TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            semantic_identifier TEXT NOT NULL,
            sections_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            owners_json TEXT NOT NULL DEFAULT '[]',
            access_json TEXT,
            updated_at INTEGER,
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (source, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Opaque checkpoint blobs, one per source instance.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            blob TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Non-blocking, TTL-bounded leases for mutual exclusion.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            key TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-item failures recorded by sync runs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_failures (
            source TEXT NOT NULL,
            item_id TEXT NOT NULL,
            message TEXT NOT NULL,
            cause TEXT,
            occurred_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
