//! ABOUTME: Distributed lock (C2) - compare-and-swap leases backing dispatch and task locks
//! ABOUTME: Generalises the old per-job lock table into a keyed lease store (§4.2, §6.3)

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cronmesh_core::{Error, Id, Result};
use cronmesh_db::LockRepository;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies who is holding a lease, so a handle lost to a crash can still be released or
/// inspected by value alone (§4.2 "HTTP-issued locks").
#[derive(Debug, Clone, PartialEq)]
pub struct HolderId(String);

impl HolderId {
    pub fn new() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self(format!("{}:{}:{}", hostname, std::process::id(), Id::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retry policy for blocking `acquire` calls, mirroring the `lock.*` configuration keys.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_lease_seconds: i64,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: 30,
            max_retries: 3,
            retry_interval_ms: 100,
        }
    }
}

/// Coordinates lease acquisition for one process. One `LockManager` is shared across the
/// dispatch loop, retry engine, and any HTTP handler that needs a named lock.
#[derive(Clone)]
pub struct LockManager {
    pool: SqlitePool,
    holder: HolderId,
    config: LockConfig,
}

impl LockManager {
    pub fn new(pool: SqlitePool, config: LockConfig) -> Self {
        let holder = HolderId::new();
        info!(holder = %holder, "distributed lock manager ready");
        Self { pool, holder, config }
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    fn repo(&self) -> LockRepository<'_> {
        LockRepository::new(&self.pool)
    }

    /// Single non-blocking attempt. `Ok(None)` means someone else holds a live lease.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(self.config.default_lease_seconds));
        let value = self.holder.as_str();

        let acquired = self.repo().try_insert(key, value, &expires_at.to_rfc3339()).await?;
        if !acquired {
            debug!(key, "lock already held by another holder");
            return Ok(None);
        }

        info!(key, holder = %self.holder, expires_at = %expires_at, "lock acquired");
        Ok(Some(LockHandle {
            pool: self.pool.clone(),
            key: key.to_string(),
            value: value.to_string(),
            expires_at,
        }))
    }

    /// Blocking acquire with bounded retries and a fixed delay between attempts (§4.2).
    /// Returns `Error::LockAlreadyAcquired` once the retry budget is exhausted.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        let mut attempt = 0;
        loop {
            if let Some(handle) = self.try_acquire(key, ttl).await? {
                return Ok(handle);
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(Error::LockAlreadyAcquired(key.to_string()));
            }

            tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
        }
    }

    /// Releases a lease known only by its key/value, e.g. from an HTTP request that never
    /// held an in-process `LockHandle`.
    pub async fn release_by_value(&self, key: &str, value: &str) -> Result<bool> {
        self.repo().release_by_value(key, value).await
    }

    /// `true` if `key` is currently held, optionally scoped to a specific holder value.
    pub async fn check(&self, key: &str, value: Option<&str>) -> Result<bool> {
        self.repo().check(key, value).await
    }

    /// Garbage-collects lease rows expired before `cutoff`, keeping the table bounded.
    pub async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.repo().delete_expired_before(&cutoff.to_rfc3339()).await
    }
}

/// An acquired lease. Dropping it without calling `release` leaves the row to expire
/// naturally; callers that need deterministic release should call it explicitly.
pub struct LockHandle {
    pool: SqlitePool,
    key: String,
    value: String,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub async fn release(self) -> Result<bool> {
        let repo = LockRepository::new(&self.pool);
        let released = repo.compare_and_delete(&self.key, &self.value).await?;
        if released {
            debug!(key = %self.key, "lock released");
        } else {
            warn!(key = %self.key, "lock was already released or taken over before explicit release");
        }
        Ok(released)
    }

    /// Extends the lease in place. `Ok(false)` means the lease was lost (expired and taken
    /// over by someone else) before the extension landed.
    pub async fn refresh(&mut self, ttl: Duration) -> Result<bool> {
        let new_expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(30));
        let repo = LockRepository::new(&self.pool);
        let extended = repo
            .compare_and_extend(&self.key, &self.value, &new_expires_at.to_rfc3339())
            .await?;
        if extended {
            self.expires_at = new_expires_at;
        }
        Ok(extended)
    }

    /// Spawns a background renewer that refreshes the lease every `interval` until
    /// `cancel` fires or a refresh is lost. Used by long-running holds such as an
    /// `auto_refresh`ed worker-session lock.
    pub fn auto_refresh(mut self, ttl: Duration, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<LockHandle> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match self.refresh(ttl).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(key = %self.key, "auto-refresh lost the lease, stopping renewal");
                                break;
                            }
                            Err(e) => {
                                warn!(key = %self.key, error = %e, "auto-refresh failed, stopping renewal");
                                break;
                            }
                        }
                    }
                }
            }
            self
        })
    }
}
