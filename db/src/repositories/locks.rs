//! ABOUTME: Lock repository - raw compare-and-swap rows backing the distributed lock (§3.1, §4.2, §6.3)
//!
//! This module only exposes the atomic row operations the fast-KV-store contract
//! requires (set-if-absent-with-ttl, compare-and-delete, compare-and-pexpire). The
//! acquire/retry/auto-refresh policy built on top of these lives in the scheduler crate.

use cronmesh_core::{time::now_iso8601, Error, Result};
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockRow {
    pub key: String,
    pub value: String,
    pub status: String,
    pub expires_at: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct LockRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> LockRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<LockRow>> {
        sqlx::query_as::<_, LockRow>("SELECT * FROM locks WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to read lock row: {}", e)))
    }

    /// `SETNX`-style acquire: succeeds if the key is absent, or if present but expired or
    /// released. Returns `false` (no row changed) when a live lock is held by someone else.
    ///
    /// A single `INSERT ... ON CONFLICT DO UPDATE` so two replicas racing on a brand-new key
    /// can't both observe "absent" and both attempt a raw insert — the loser's conflict is
    /// resolved by the `WHERE` guard on the `DO UPDATE` clause instead of a unique-key error.
    pub async fn try_insert(&self, key: &str, value: &str, expires_at: &str) -> Result<bool> {
        let now = now_iso8601();

        let result = sqlx::query(
            r#"
            INSERT INTO locks (key, value, status, expires_at, created_at, updated_at)
            VALUES (?, ?, 'acquired', ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                status = 'acquired',
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            WHERE locks.status != 'acquired' OR locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to acquire lock row: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Atomic compare-with-value then delete. Returns `false` if `value` no longer matches
    /// the holder (already released, expired and retaken, or never held).
    pub async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE key = ? AND value = ? AND status = 'acquired'")
            .bind(key)
            .bind(value)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to release lock: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Atomic compare-with-value then set a new expiry, used by `refresh`/`auto_refresh`.
    pub async fn compare_and_extend(&self, key: &str, value: &str, new_expires_at: &str) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE locks SET expires_at = ?, updated_at = ? WHERE key = ? AND value = ? AND status = 'acquired'",
        )
        .bind(new_expires_at)
        .bind(&now)
        .bind(key)
        .bind(value)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to refresh lock: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// HTTP-issued-lock support (§4.2): release by value alone, no in-memory handle.
    pub async fn release_by_value(&self, key: &str, value: &str) -> Result<bool> {
        self.compare_and_delete(key, value).await
    }

    /// `check(key, value)`: true if currently held and, when given, matching `value`.
    pub async fn check(&self, key: &str, value: Option<&str>) -> Result<bool> {
        let now = now_iso8601();
        match self.get(key).await? {
            Some(row) if row.status == "acquired" && row.expires_at.as_str() > now.as_str() => {
                Ok(value.map(|v| v == row.value).unwrap_or(true))
            }
            _ => Ok(false),
        }
    }

    /// Periodic janitor for long-expired rows so the table doesn't grow without bound.
    pub async fn delete_expired_before(&self, cutoff: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at < ?")
            .bind(cutoff)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to clean up expired locks: {}", e)))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::create_test_db;

    #[tokio::test]
    async fn second_acquire_on_live_lock_fails() {
        let db = create_test_db().await.unwrap();
        let repo = LockRepository::new(db.pool());

        let future = "2999-01-01T00:00:00Z";
        assert!(repo.try_insert("dispatch:t1", "holder-a", future).await.unwrap());
        assert!(!repo.try_insert("dispatch:t1", "holder-b", future).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_after_expiry_succeeds() {
        let db = create_test_db().await.unwrap();
        let repo = LockRepository::new(db.pool());

        let past = "2000-01-01T00:00:00Z";
        let future = "2999-01-01T00:00:00Z";

        assert!(repo.try_insert("dispatch:t1", "holder-a", past).await.unwrap());
        assert!(repo.try_insert("dispatch:t1", "holder-b", future).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_value() {
        let db = create_test_db().await.unwrap();
        let repo = LockRepository::new(db.pool());

        let future = "2999-01-01T00:00:00Z";
        repo.try_insert("task:lock:t1", "holder-a", future).await.unwrap();

        assert!(!repo.compare_and_delete("task:lock:t1", "holder-b").await.unwrap());
        assert!(repo.compare_and_delete("task:lock:t1", "holder-a").await.unwrap());
    }
}
