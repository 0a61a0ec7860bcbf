//! ABOUTME: Retry Engine (C8) - resurrects terminal failures into fresh pending tasks (§4.7)

use crate::lock::LockManager;
use crate::metrics::QueueHealth;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use cronmesh_core::Error;
use cronmesh_db::{CreateTaskRequest, Filter, FilterValue, Task, TaskRepository};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `retry.enabled` / `retry.check_interval_seconds` (§6.4a).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub check_interval_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { enabled: true, check_interval_seconds: 30 }
    }
}

const RETRY_LOCK_TTL: Duration = Duration::from_secs(30);
const RETRY_BATCH_SIZE: usize = 1000;
const DEFAULT_TIMEOUT_SECONDS: i64 = 300;

pub struct RetryEngine {
    pool: SqlitePool,
    locks: LockManager,
    config: RetryConfig,
    metrics: Arc<QueueHealth>,
}

impl RetryEngine {
    pub fn new(pool: SqlitePool, locks: LockManager, config: RetryConfig, metrics: Arc<QueueHealth>) -> Self {
        Self { pool, locks, config, metrics }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("retry engine disabled by configuration, not starting sweep");
            return;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.check_interval_seconds));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("retry engine observed cancellation, exiting");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "retry sweep failed, will retry next cadence");
                    }
                }
            }
        }
    }

    /// Periodic sweep: `status ∈ {failed, error, timeout} ∧ retryable ∧ next_retry_time ≤ now`.
    pub async fn sweep(&self) -> cronmesh_core::Result<()> {
        let now = fmt(Utc::now());

        let candidates = TaskRepository::new(&self.pool)
            .list_with_filter(&[
                Filter::in_list("status", vec!["failed".into(), "error".into(), "timeout".into()]),
                Filter::eq("retryable", FilterValue::Bool(true)),
                Filter::le("next_retry_time", FilterValue::Text(now.clone())),
            ])
            .await?;

        for task in candidates.into_iter().take(RETRY_BATCH_SIZE) {
            if task.retry_count >= task.max_retry.unwrap_or(0) {
                continue;
            }

            let lock_key = format!("task:retry:{}", task.id);
            let Some(handle) = self.locks.try_acquire(&lock_key, RETRY_LOCK_TTL).await? else {
                debug!(task_id = %task.id, "retry lock contended, skipping this sweep");
                continue;
            };

            // Re-fetch to confirm conditions still hold (another replica may have already retried it).
            let Some(current) = TaskRepository::new(&self.pool).find_by_id(&task.id).await? else {
                let _ = handle.release().await;
                continue;
            };
            if current.retry_count >= current.max_retry.unwrap_or(0) || !current.retryable {
                let _ = handle.release().await;
                continue;
            }

            match self.fork_retry(&current, &now).await {
                Ok(created) => info!(task_id = %current.id, new_task_id = %created.id, "retried task"),
                Err(e) => warn!(task_id = %current.id, error = %e, "failed to fork retry task"),
            }

            let _ = handle.release().await;
        }

        Ok(())
    }

    /// Manual retry (§6.5, §4.7): ignores `next_retry_time`, reports `Preconditions` when the
    /// retry budget is exhausted or the task is not retryable.
    pub async fn manual_retry(&self, task_id: &str) -> cronmesh_core::Result<Task> {
        let task = TaskRepository::new(&self.pool)
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {} not found", task_id)))?;

        if !task.retryable {
            return Err(Error::Preconditions(format!("task {} is not retryable", task.id)));
        }
        if task.retry_count >= task.max_retry.unwrap_or(0) {
            return Err(Error::Preconditions(format!("task {} has exhausted its retry budget", task.id)));
        }

        let now = fmt(Utc::now());
        self.fork_retry(&task, &now).await
    }

    async fn fork_retry(&self, task: &Task, now: &str) -> cronmesh_core::Result<Task> {
        let timeout_seconds = task.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let now_instant = Utc::now();
        let deadline = fmt(now_instant + ChronoDuration::seconds(timeout_seconds));
        let new_retry_count = task.retry_count + 1;

        let created = TaskRepository::new(&self.pool)
            .create(CreateTaskRequest {
                template_id: task.template_id.clone(),
                tenant: task.tenant.clone(),
                project: task.project.clone(),
                category: task.category.clone(),
                name: format!("{}-retry-{}", task.name, new_retry_count),
                command: task.command.clone(),
                args: task.args.clone(),
                plan: now.to_string(),
                deadline,
                retry_count: new_retry_count,
                max_retry: task.max_retry,
                retryable: task.retryable,
                timeout_seconds: task.timeout_seconds,
                // Immediate baseline (§4.7 step 3): if this attempt also fails, the next sweep
                // retries again right away.
                next_retry_time: Some(now.to_string()),
                metadata: task.metadata.clone(),
            })
            .await?;

        self.metrics.record_retried();
        Ok(created)
    }
}

fn fmt(instant: chrono::DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}
