//! ABOUTME: Distributed cron scheduler - composes the dispatch, monitor, retry and
//! ABOUTME: maintenance engines behind one owned `Scheduler` with a start/stop lifecycle.

use cronmesh_core::Result;
use cronmesh_db::Db;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod cron;
pub mod dispatch;
pub mod lock;
pub mod maintenance;
pub mod metrics;
pub mod monitor;
pub mod queues;
pub mod retry;
pub mod types;

pub use dispatch::{DispatchConfig, DispatchLoop};
pub use lock::{HolderId, LockConfig, LockHandle, LockManager};
pub use maintenance::MaintenanceScheduler;
pub use metrics::{QueueHealth, QueueHealthSnapshot};
pub use monitor::TaskMonitor;
pub use queues::{DispatchBus, PendingSender, StopSender};
pub use retry::{RetryConfig, RetryEngine};
pub use types::{TaskMetadata, TaskStatus, WorkerMetadata};

/// Top-level tunables for the scheduler core (`scheduler.*` configuration keys, §6.4a).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub lock: LockConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

/// Owns the dispatch/monitor/retry/maintenance loops and the `DispatchBus` they share with
/// the worker fan-out hub. Callers outside this crate obtain a `PendingSender`/`StopSender`
/// from the bus before handing the scheduler to [`Scheduler::start`].
pub struct Scheduler {
    pool: SqlitePool,
    locks: LockManager,
    config: SchedulerConfig,
    bus: DispatchBus,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    metrics: Arc<QueueHealth>,
}

impl Scheduler {
    pub fn new(db: &Db, config: SchedulerConfig) -> Self {
        let pool = db.pool().clone();
        let locks = LockManager::new(pool.clone(), config.lock.clone());
        Self {
            pool,
            locks,
            config,
            bus: DispatchBus::new(),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            metrics: QueueHealth::new(),
        }
    }

    /// Hands out a cloneable, non-blocking producer for tasks that have just become due.
    /// The worker fan-out hub's ingest path and C6's materialisation step both use this.
    pub fn pending_sender(&self) -> PendingSender {
        self.bus.pending_sender()
    }

    pub fn stop_sender(&self) -> StopSender {
        self.bus.stop_sender()
    }

    /// Hands the single-consumer ends of the bus to the worker fan-out hub. Must be called
    /// exactly once, before [`Scheduler::start`], or the monitor's dispatch sweep has nowhere
    /// to deliver tasks.
    pub fn take_bus_receivers(&mut self) -> (tokio::sync::mpsc::Receiver<cronmesh_db::Task>, tokio::sync::mpsc::Receiver<String>) {
        (self.bus.take_pending_receiver(), self.bus.take_stop_receiver())
    }

    /// Spawns the dispatch loop, task monitor, retry engine and maintenance scheduler as
    /// independent tasks sharing one cancellation token. Idempotent guard: calling this twice
    /// on the same instance would double-spawn, so callers own the single call site.
    pub async fn start(&mut self) -> Result<()> {
        info!("starting scheduler core");

        let dispatch = DispatchLoop::new(self.pool.clone(), self.locks.clone(), self.config.dispatch.clone(), self.metrics.clone());
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move { dispatch.run(cancel).await }));

        let monitor = TaskMonitor::new(self.pool.clone(), self.locks.clone(), self.bus.pending_sender(), self.metrics.clone());
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move { monitor.run(cancel).await }));

        let retry = RetryEngine::new(self.pool.clone(), self.locks.clone(), self.config.retry.clone(), self.metrics.clone());
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move { retry.run(cancel).await }));

        let maintenance = MaintenanceScheduler::new(self.pool.clone(), self.locks.clone());
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move { maintenance.run(cancel).await }));

        info!("scheduler core started");
        Ok(())
    }

    /// Signals every loop to stop and waits up to 30s for a clean drain (§5), aborting any
    /// stragglers past that deadline.
    pub async fn stop(&mut self) {
        info!("stopping scheduler core");
        self.cancel.cancel();

        let drain = tokio::time::timeout(Duration::from_secs(30), async {
            for handle in self.handles.drain(..) {
                let _ = handle.await;
            }
        });

        if drain.await.is_err() {
            tracing::warn!("scheduler core did not drain within 30s, aborting remaining loops");
        }

        info!("scheduler core stopped");
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap, database-free queue-health snapshot (§6.5).
    pub fn queue_health(&self) -> QueueHealthSnapshot {
        self.metrics.snapshot()
    }

    /// A throwaway `RetryEngine` sharing this scheduler's pool, locks and metrics, for
    /// operator-initiated manual retries (§6.5) outside the periodic sweep.
    pub fn retry_engine(&self) -> RetryEngine {
        RetryEngine::new(self.pool.clone(), self.locks.clone(), self.config.retry.clone(), self.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_db() -> Db {
        let path = format!("test_scheduler_lib_{}.db", cronmesh_core::Id::new());
        Db::new(&path).await.expect("failed to create test db")
    }

    #[tokio::test]
    async fn start_and_stop_drains_all_loops_cleanly() {
        let db = create_test_db().await;
        let mut scheduler = Scheduler::new(&db, SchedulerConfig::default());
        let _receivers = scheduler.take_bus_receivers();

        scheduler.start().await.unwrap();
        scheduler.stop().await;
    }
}
