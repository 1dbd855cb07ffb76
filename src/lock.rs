//! Non-blocking, TTL-bounded leases for mutual exclusion.
//!
//! Every scheduler task acquires a lease keyed by its unit of work before
//! touching a checkpoint. Acquisition never blocks: a `false` return means
//! another worker owns that unit and this task skips the cycle. Leases
//! expire on their own, so a crashed worker's lease self-heals without
//! manual intervention; a live worker renews its lease between batches.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::SyncError;

/// The lock contract. `acquire` and `renew` report success as `bool`;
/// failure to acquire is normal control flow, not an error.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, SyncError>;
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, SyncError>;
    async fn release(&self, key: &str) -> Result<(), SyncError>;
}

static OWNER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lease store backed by the shared SQLite database.
///
/// Each store instance carries its own owner token; only the owner can
/// renew or release a live lease, while anyone may claim an expired one.
pub struct SqliteLeaseStore {
    pool: SqlitePool,
    owner: String,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        let owner = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            OWNER_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self { pool, owner }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, SyncError> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;

        // Claim if absent, expired, or already ours (re-acquire extends).
        let result = sqlx::query(
            r#"
            INSERT INTO leases (key, owner, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ? OR leases.owner = excluded.owner
            "#,
        )
        .bind(key)
        .bind(&self.owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, SyncError> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE leases SET expires_at = ? WHERE key = ? AND owner = ? AND expires_at > ?",
        )
        .bind(expires_at)
        .bind(key)
        .bind(&self.owner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM leases WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
