//! ABOUTME: Task Monitor (C7) - timeout sweep and pending-to-queue dispatch sweep (§4.6)

use crate::lock::LockManager;
use crate::metrics::QueueHealth;
use crate::queues::PendingSender;
use chrono::{SecondsFormat, Utc};
use cronmesh_db::{Filter, FilterValue, TaskRepository};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DISPATCH_SWEEP_INTERVAL: Duration = Duration::from_secs(3);
const SWEEP_BATCH_SIZE: usize = 50;
const TASK_LOCK_TTL: Duration = Duration::from_secs(100);

pub struct TaskMonitor {
    pool: SqlitePool,
    locks: LockManager,
    pending: PendingSender,
    metrics: Arc<QueueHealth>,
}

impl TaskMonitor {
    pub fn new(pool: SqlitePool, locks: LockManager, pending: PendingSender, metrics: Arc<QueueHealth>) -> Self {
        Self { pool, locks, pending, metrics }
    }

    /// Runs both cadences under one task (§4.6's "two cadences... same task but with distinct
    /// tickers") until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut timeout_ticker = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
        let mut dispatch_ticker = tokio::time::interval(DISPATCH_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("task monitor observed cancellation, exiting");
                    return;
                }
                _ = timeout_ticker.tick() => {
                    if let Err(e) = self.timeout_sweep().await {
                        warn!(error = %e, "timeout sweep failed, will retry next cadence");
                    }
                }
                _ = dispatch_ticker.tick() => {
                    if let Err(e) = self.dispatch_sweep().await {
                        warn!(error = %e, "dispatch sweep failed, will retry next cadence");
                    }
                }
            }
        }
    }

    /// Every 30s: flip overdue `pending` tasks to `timeout` (§4.6, §9 open question: only
    /// `pending` is swept, never `running`).
    pub async fn timeout_sweep(&self) -> cronmesh_core::Result<()> {
        let now = fmt(Utc::now());

        let overdue = TaskRepository::new(&self.pool)
            .list_with_filter(&[
                Filter::eq("status", FilterValue::Text("pending".into())),
                Filter::le("deadline", FilterValue::Text(now.clone())),
            ])
            .await?;

        for task in overdue.into_iter().take(SWEEP_BATCH_SIZE) {
            let lock_key = format!("task:lock:{}", task.id);
            let Some(handle) = self.locks.try_acquire(&lock_key, TASK_LOCK_TTL).await? else {
                debug!(task_id = %task.id, "task lock contended during timeout sweep, skipping");
                continue;
            };

            let flipped = TaskRepository::new(&self.pool)
                .update_status_if(&task.id, "pending", "timeout", Some(&now))
                .await?;
            if flipped {
                self.metrics.record_timed_out();
                info!(task_id = %task.id, "task timed out");
            }

            let _ = handle.release().await;
        }

        Ok(())
    }

    /// Every 3s: offer tasks whose plan has arrived but deadline has not yet elapsed to C3.
    pub async fn dispatch_sweep(&self) -> cronmesh_core::Result<()> {
        let now = fmt(Utc::now());

        let due = TaskRepository::new(&self.pool)
            .list_with_filter(&[
                Filter::eq("status", FilterValue::Text("pending".into())),
                Filter::le("plan", FilterValue::Text(now.clone())),
            ])
            .await?;

        for task in due.into_iter().take(SWEEP_BATCH_SIZE) {
            if task.deadline.as_str() <= now.as_str() {
                continue;
            }
            self.pending.offer(task);
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
    use crate::queues::DispatchBus;
    use chrono::Duration as ChronoDuration;
    use cronmesh_db::{CreateTaskRequest, Db};

    async fn create_test_db() -> Db {
        let path = format!("test_monitor_{}.db", cronmesh_core::Id::new());
        Db::new(&path).await.expect("failed to create test db")
    }

    fn request(plan: &str, deadline: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            template_id: None,
            tenant: "default".into(),
            project: "proj-a".into(),
            category: "http".into(),
            name: "t".into(),
            command: "curl".into(),
            args: "[]".into(),
            plan: plan.into(),
            deadline: deadline.into(),
            retry_count: 0,
            max_retry: Some(2),
            retryable: true,
            timeout_seconds: Some(60),
            next_retry_time: None,
            metadata: "{}".into(),
        }
    }

    #[tokio::test]
    async fn pending_task_past_deadline_is_timed_out() {
        let db = create_test_db().await;
        let now = Utc::now();
        let task = TaskRepository::new(db.pool())
            .create(request(
                &fmt(now - ChronoDuration::seconds(60)),
                &fmt(now - ChronoDuration::seconds(10)),
            ))
            .await
            .unwrap();

        let locks = LockManager::new(db.pool().clone(), LockConfig::default());
        let bus = DispatchBus::new();
        let monitor = TaskMonitor::new(db.pool().clone(), locks, bus.pending_sender(), QueueHealth::new());

        monitor.timeout_sweep().await.unwrap();

        let reloaded = TaskRepository::new(db.pool()).find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, "timeout");
        assert!(reloaded.time_end.is_some());
    }

    #[tokio::test]
    async fn deadline_equal_to_now_is_timed_out() {
        let db = create_test_db().await;
        let now = fmt(Utc::now());
        let task = TaskRepository::new(db.pool())
            .create(request(&now, &now))
            .await
            .unwrap();

        let locks = LockManager::new(db.pool().clone(), LockConfig::default());
        let bus = DispatchBus::new();
        let monitor = TaskMonitor::new(db.pool().clone(), locks, bus.pending_sender(), QueueHealth::new());
        monitor.timeout_sweep().await.unwrap();

        let reloaded = TaskRepository::new(db.pool()).find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, "timeout");
    }

    #[tokio::test]
    async fn due_pending_task_is_offered_to_pending_queue() {
        let db = create_test_db().await;
        let now = Utc::now();
        TaskRepository::new(db.pool())
            .create(request(
                &fmt(now - ChronoDuration::seconds(5)),
                &fmt(now + ChronoDuration::seconds(60)),
            ))
            .await
            .unwrap();

        let locks = LockManager::new(db.pool().clone(), LockConfig::default());
        let mut bus = DispatchBus::new();
        let mut receiver = bus.take_pending_receiver();
        let monitor = TaskMonitor::new(db.pool().clone(), locks, bus.pending_sender(), QueueHealth::new());

        monitor.dispatch_sweep().await.unwrap();

        let offered = receiver.try_recv().expect("a due task should have been offered");
        assert_eq!(offered.status, "pending");
    }
}
