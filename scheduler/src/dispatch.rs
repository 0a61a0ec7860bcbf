//! ABOUTME: Dispatch Loop (C6) - materialises template -> task at the correct wall-clock moment
//! ABOUTME: Ticks roughly every second; each template's materialisation is serialised by C2 (§4.5)

use crate::cron;
use crate::lock::LockManager;
use crate::metrics::QueueHealth;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use cronmesh_db::{CreateTaskRequest, Filter, FilterValue, TaskRepository, TemplateRepository};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for C6, surfaced as `dispatch.lookahead_seconds` / `dispatch.batch_size` (§6.4a).
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub lookahead_seconds: i64,
    pub batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { lookahead_seconds: 10, batch_size: 50 }
    }
}

const DISPATCH_LOCK_TTL: Duration = Duration::from_secs(10);

pub struct DispatchLoop {
    pool: SqlitePool,
    locks: LockManager,
    config: DispatchConfig,
    metrics: Arc<QueueHealth>,
}

impl DispatchLoop {
    pub fn new(pool: SqlitePool, locks: LockManager, config: DispatchConfig, metrics: Arc<QueueHealth>) -> Self {
        Self { pool, locks, config, metrics }
    }

    /// Runs the 1s-tick loop until cancelled. Intended to be `tokio::spawn`ed once.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatch loop observed cancellation, exiting");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "dispatch tick failed, will retry next second");
                    }
                }
            }
        }
    }

    /// One pass over due templates (§4.5 steps 1-3). Exposed directly so tests can drive it
    /// against a virtual clock without waiting on the real interval.
    pub async fn tick(&self) -> cronmesh_core::Result<()> {
        let now = Utc::now();
        let lookahead = now + ChronoDuration::seconds(self.config.lookahead_seconds);

        let templates = TemplateRepository::new(&self.pool)
            .list_with_filter(&[
                Filter::eq("is_active", FilterValue::Bool(true)),
                Filter::le("next_plan", FilterValue::Text(fmt(lookahead))),
            ])
            .await?;

        for template in templates.into_iter().take(self.config.batch_size) {
            let Some(next_plan_str) = template.next_plan.as_deref() else { continue };
            let next_plan: DateTime<Utc> = match next_plan_str.parse() {
                Ok(v) => v,
                Err(e) => {
                    warn!(template_id = %template.id, error = %e, "unparsable next_plan cursor, skipping");
                    continue;
                }
            };
            if next_plan > now {
                continue;
            }

            let lock_key = format!("dispatch:{}", template.id);
            let handle = match self.locks.try_acquire(&lock_key, DISPATCH_LOCK_TTL).await? {
                Some(h) => h,
                None => {
                    debug!(template_id = %template.id, "dispatch lock held by a peer, skipping this tick");
                    continue;
                }
            };

            let plan = match cron::next(&template.cron_expr, next_plan) {
                Ok(p) => p,
                Err(e) => {
                    warn!(template_id = %template.id, error = %e, "failed to compute plan instant, skipping");
                    let _ = handle.release().await;
                    continue;
                }
            };

            let existing = TaskRepository::new(&self.pool)
                .find_by_template_since_plan(&template.id, &fmt(plan))
                .await?;
            if !existing.is_empty() {
                debug!(template_id = %template.id, "a peer already materialised this plan, skipping");
                let _ = handle.release().await;
                continue;
            }

            let deadline = cron::next(&template.cron_expr, plan).unwrap_or_else(|e| {
                warn!(template_id = %template.id, error = %e, "failed to compute deadline, falling back to plan+1h");
                plan + ChronoDuration::hours(1)
            });

            let task = TaskRepository::new(&self.pool)
                .create(CreateTaskRequest {
                    template_id: Some(template.id.clone()),
                    tenant: template.tenant.clone(),
                    project: template.project.clone(),
                    category: template.category.clone(),
                    name: format!("{}-{}", template.name, plan.format("%Y%m%d-%H%M%S")),
                    command: template.command.clone(),
                    args: template.args.clone(),
                    plan: fmt(plan),
                    deadline: fmt(deadline),
                    retry_count: 0,
                    max_retry: template.max_retry,
                    retryable: template.retryable,
                    timeout_seconds: template.timeout_seconds,
                    next_retry_time: None,
                    metadata: "{}".to_string(),
                })
                .await?;

            TemplateRepository::new(&self.pool).set_next_plan(&template.id, &fmt(plan)).await?;
            self.metrics.record_materialized();

            info!(template_id = %template.id, task_id = %task.id, plan = %plan, "materialised task from template");

            let _ = handle.release().await;
        }

        Ok(())
    }
}

fn fmt(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use cronmesh_db::{CreateTemplateRequest, Db};

    async fn create_test_db() -> Db {
        let path = format!("test_dispatch_{}.db", cronmesh_core::Id::new());
        Db::new(&path).await.expect("failed to create test db")
    }

    #[tokio::test]
    async fn single_tick_materialises_exactly_one_task_and_advances_cursor() {
        let db = create_test_db().await;
        let template = TemplateRepository::new(db.pool())
            .create(CreateTemplateRequest {
                tenant: "default".into(),
                project: "proj-a".into(),
                category: "http".into(),
                name: "noon-check".into(),
                cron_expr: "0 0 12 * * * *".into(),
                command: "curl".into(),
                args: "[]".into(),
                timeout_seconds: Some(60),
                max_retry: Some(2),
                retryable: true,
            })
            .await
            .unwrap();

        let now = Utc::now();
        TemplateRepository::new(db.pool())
            .set_next_plan(&template.id, &fmt(now - ChronoDuration::seconds(5)))
            .await
            .unwrap();

        let locks = LockManager::new(db.pool().clone(), LockConfig::default());
        let dispatch = DispatchLoop::new(db.pool().clone(), locks, DispatchConfig::default(), QueueHealth::new());

        dispatch.tick().await.unwrap();
        dispatch.tick().await.unwrap();

        let tasks = TaskRepository::new(db.pool())
            .list_with_filter(&[Filter::eq("template_id", FilterValue::Text(template.id.clone()))])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1, "idempotent re-tick must not create a second task");

        let reloaded = TemplateRepository::new(db.pool()).find_by_id(&template.id).await.unwrap().unwrap();
        assert!(reloaded.next_plan.is_some());
        assert_ne!(reloaded.next_plan.as_deref(), Some(fmt(now - ChronoDuration::seconds(5)).as_str()));
    }

    #[tokio::test]
    async fn two_racing_loops_on_one_template_produce_one_task() {
        let db = create_test_db().await;
        let template = TemplateRepository::new(db.pool())
            .create(CreateTemplateRequest {
                tenant: "default".into(),
                project: "proj-a".into(),
                category: "http".into(),
                name: "race".into(),
                cron_expr: "* * * * * * *".into(),
                command: "curl".into(),
                args: "[]".into(),
                timeout_seconds: Some(60),
                max_retry: Some(0),
                retryable: false,
            })
            .await
            .unwrap();

        TemplateRepository::new(db.pool())
            .set_next_plan(&template.id, &fmt(Utc::now() - ChronoDuration::seconds(5)))
            .await
            .unwrap();

        let locks_a = LockManager::new(db.pool().clone(), LockConfig::default());
        let locks_b = LockManager::new(db.pool().clone(), LockConfig::default());
        let loop_a = DispatchLoop::new(db.pool().clone(), locks_a, DispatchConfig::default(), QueueHealth::new());
        let loop_b = DispatchLoop::new(db.pool().clone(), locks_b, DispatchConfig::default(), QueueHealth::new());

        let (r1, r2) = tokio::join!(loop_a.tick(), loop_b.tick());
        r1.unwrap();
        r2.unwrap();

        let tasks = TaskRepository::new(db.pool())
            .list_with_filter(&[Filter::eq("template_id", FilterValue::Text(template.id.clone()))])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
