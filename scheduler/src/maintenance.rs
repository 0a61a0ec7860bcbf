//! ABOUTME: Maintenance Scheduler (C9) - cron-driven housekeeping under C2-protected leases (§4.8)

use crate::lock::LockManager;
use chrono::{SecondsFormat, Utc};
use cronmesh_db::WorkerRepository;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WORKER_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
const WORKER_STALE_THRESHOLD: chrono::Duration = chrono::Duration::minutes(5);
const MAINTENANCE_LOCK_TTL: Duration = Duration::from_secs(60);

const BOOTSTRAP_CRON: &str = "0 */10 * * * *";
const STATS_ROLLUP_CRON: &str = "0 0 1 * * *";
const SHARDING_CRON: &str = "0 0 2 * * *";

#[derive(Clone, Copy)]
enum MaintenanceJob {
    Bootstrap,
    StatsRollup,
    Sharding,
}

impl MaintenanceJob {
    fn cron_expr(self) -> &'static str {
        match self {
            Self::Bootstrap => BOOTSTRAP_CRON,
            Self::StatsRollup => STATS_ROLLUP_CRON,
            Self::Sharding => SHARDING_CRON,
        }
    }

    fn lock_key(self) -> &'static str {
        match self {
            Self::Bootstrap => "cronjob:init:last_plan",
            Self::StatsRollup => "cronjob:stats:rollup",
            Self::Sharding => "cronjob:sharding:maintenance",
        }
    }
}

pub struct MaintenanceScheduler {
    pool: SqlitePool,
    locks: LockManager,
}

impl MaintenanceScheduler {
    pub fn new(pool: SqlitePool, locks: LockManager) -> Self {
        Self { pool, locks }
    }

    /// Runs the bootstrap job once immediately (§4.5 "a one-shot run ... fires on server
    /// startup"), then drives all cron-scheduled housekeeping plus the liveness sweep until
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if let Err(e) = self.bootstrap_null_next_plans().await {
            warn!(error = %e, "startup bootstrap of null next-plan cursors failed");
        }

        let mut cron_scheduler = match self.build_cron_scheduler().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to build maintenance cron scheduler");
                return;
            }
        };

        if let Err(e) = cron_scheduler.start().await {
            warn!(error = %e, "failed to start maintenance cron scheduler");
            return;
        }

        self.run_liveness_sweep(cancel).await;

        if let Err(e) = cron_scheduler.shutdown().await {
            warn!(error = %e, "failed to shut down maintenance cron scheduler cleanly");
        }
    }

    async fn run_job(&self, job: MaintenanceJob) -> cronmesh_core::Result<()> {
        match job {
            MaintenanceJob::Bootstrap => self.bootstrap_null_next_plans().await,
            MaintenanceJob::StatsRollup => self.stats_rollup_stub().await,
            MaintenanceJob::Sharding => self.sharding_stub().await,
        }
    }

    /// Builds a `tokio_cron_scheduler::JobScheduler` with one job per `MaintenanceJob`
    /// variant, each guarded by the named distributed lease so only one replica runs it.
    async fn build_cron_scheduler(&self) -> cronmesh_core::Result<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| cronmesh_core::Error::Config(format!("failed to create cron scheduler: {}", e)))?;

        for job in [MaintenanceJob::Bootstrap, MaintenanceJob::StatsRollup, MaintenanceJob::Sharding] {
            let pool = self.pool.clone();
            let locks = self.locks.clone();

            let cron_job = Job::new_async(job.cron_expr(), move |_uuid, _lock| {
                let pool = pool.clone();
                let locks = locks.clone();
                Box::pin(async move {
                    let lock_key = job.lock_key();
                    let runner = MaintenanceScheduler::new(pool, locks);
                    match runner.locks.try_acquire(lock_key, MAINTENANCE_LOCK_TTL).await {
                        Ok(Some(handle)) => {
                            if let Err(e) = runner.run_job(job).await {
                                warn!(lock_key, error = %e, "maintenance job failed");
                            }
                            let _ = handle.release().await;
                        }
                        Ok(None) => debug!(lock_key, "maintenance job lock held by a peer, skipping"),
                        Err(e) => warn!(lock_key, error = %e, "failed to acquire maintenance job lock"),
                    }
                })
            })
            .map_err(|e| cronmesh_core::Error::Config(format!("failed to create cron job {}: {}", job.lock_key(), e)))?;

            scheduler
                .add(cron_job)
                .await
                .map_err(|e| cronmesh_core::Error::Config(format!("failed to register cron job {}: {}", job.lock_key(), e)))?;
        }

        Ok(scheduler)
    }

    async fn run_liveness_sweep(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(WORKER_LIVENESS_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("worker liveness sweep observed cancellation, exiting");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.liveness_sweep().await {
                        warn!(error = %e, "worker liveness sweep failed");
                    }
                }
            }
        }
    }

    /// Batch-initialises templates whose next_plan cursor is still null (§4.5 bootstrap).
    async fn bootstrap_null_next_plans(&self) -> cronmesh_core::Result<()> {
        let now = fmt(Utc::now());
        let affected = cronmesh_db::TemplateRepository::new(&self.pool)
            .batch_initialise_null_next_plan(&now)
            .await?;
        if affected > 0 {
            info!(affected, "bootstrapped null next-plan cursors");
        }
        Ok(())
    }

    /// External-collaborator stub (§1, §4.8): stats roll-up is out of scope for this core.
    async fn stats_rollup_stub(&self) -> cronmesh_core::Result<()> {
        debug!("stats roll-up stub invoked (no-op; external collaborator owns the implementation)");
        Ok(())
    }

    /// External-collaborator stub (§1, §4.8): table-sharding maintenance is out of scope.
    async fn sharding_stub(&self) -> cronmesh_core::Result<()> {
        debug!("table-sharding maintenance stub invoked (no-op; external collaborator owns the implementation)");
        Ok(())
    }

    /// Deactivates workers whose `last_active` is older than the liveness threshold (§4.8).
    pub async fn liveness_sweep(&self) -> cronmesh_core::Result<()> {
        let cutoff = fmt(Utc::now() - WORKER_STALE_THRESHOLD);
        let affected = WorkerRepository::new(&self.pool).deactivate_stale(&cutoff).await?;
        if affected > 0 {
            info!(affected, "deactivated stale workers");
        }
        Ok(())
    }
}

fn fmt(instant: chrono::DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use cronmesh_db::{CreateTemplateRequest, Db, TemplateRepository};

    async fn create_test_db() -> Db {
        let path = format!("test_maintenance_{}.db", cronmesh_core::Id::new());
        Db::new(&path).await.expect("failed to create test db")
    }

    #[tokio::test]
    async fn bootstrap_initialises_only_null_cursors() {
        let db = create_test_db().await;
        let repo = TemplateRepository::new(db.pool());
        repo.create(CreateTemplateRequest {
            tenant: "default".into(),
            project: "proj-a".into(),
            category: "http".into(),
            name: "fresh".into(),
            cron_expr: "0 0 12 * * * *".into(),
            command: "curl".into(),
            args: "[]".into(),
            timeout_seconds: Some(60),
            max_retry: Some(2),
            retryable: true,
        })
        .await
        .unwrap();

        let locks = LockManager::new(db.pool().clone(), LockConfig::default());
        let scheduler = MaintenanceScheduler::new(db.pool().clone(), locks);

        scheduler.bootstrap_null_next_plans().await.unwrap();

        let templates = repo.list_with_filter(&[]).await.unwrap();
        assert!(templates.iter().all(|t| t.next_plan.is_some()));
    }

    #[tokio::test]
    async fn liveness_sweep_deactivates_only_stale_workers() {
        let db = create_test_db().await;
        let workers = WorkerRepository::new(db.pool());
        let fresh = workers.get_or_create("fresh-worker", "{}").await.unwrap();
        let stale = workers.get_or_create("stale-worker", "{}").await.unwrap();
        workers.touch_last_active(&stale.id, "2000-01-01T00:00:00Z").await.unwrap();

        let locks = LockManager::new(db.pool().clone(), LockConfig::default());
        let scheduler = MaintenanceScheduler::new(db.pool().clone(), locks);
        scheduler.liveness_sweep().await.unwrap();

        let fresh_after = workers.find_by_id(&fresh.id).await.unwrap().unwrap();
        let stale_after = workers.find_by_id(&stale.id).await.unwrap().unwrap();
        assert!(fresh_after.is_active);
        assert!(!stale_after.is_active);
    }
}
