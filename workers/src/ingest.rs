//! ABOUTME: Ingest loop - applies worker-reported state to task rows (§4.4.5)

use crate::protocol::WireEvent;
use cronmesh_core::{time::now_iso8601, Error, Result};
use cronmesh_db::{TaskRepository, WorkerRepository};
use cronmesh_scheduler::TaskStatus;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, warn};

/// Applies one worker-originated report frame: updates the task row, validates the status
/// transition against §4.9's state machine, and refreshes the worker's liveness timestamp.
pub async fn apply_report(pool: &SqlitePool, worker_id: &str, event: &WireEvent) -> Result<()> {
    let now = now_iso8601();

    WorkerRepository::new(pool).touch_last_active(worker_id, &now).await?;

    for reported in &event.tasks {
        let Some(new_status_str) = reported.status.as_deref() else {
            debug!(task_id = %reported.id, "report frame carried no status, ignoring");
            continue;
        };

        let tasks = TaskRepository::new(pool);
        let Some(current) = tasks.find_by_id(&reported.id).await? else {
            warn!(task_id = %reported.id, "worker reported a task that no longer exists, ignoring");
            continue;
        };

        let current_status = TaskStatus::from_str(&current.status)?;
        let new_status = TaskStatus::from_str(new_status_str)?;
        if !current_status.can_transition_to(new_status) {
            warn!(
                task_id = %reported.id,
                from = %current_status,
                to = %new_status,
                "worker reported an illegal status transition, ignoring"
            );
            continue;
        }

        let time_start = matches!(new_status, TaskStatus::Running).then(|| now.clone());
        let time_end = new_status.is_terminal().then(|| now.clone());

        tasks
            .update_status(&reported.id, new_status.as_str(), time_start.as_deref(), time_end.as_deref())
            .await?;

        if let Some(output) = &reported.output {
            tasks.update_output(&reported.id, worker_id, output).await?;
        }
    }

    Ok(())
}

pub fn validate_status(raw: &str) -> Result<TaskStatus> {
    TaskStatus::from_str(raw).map_err(|_| Error::BadRequest(format!("unknown task status '{}'", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Action, WireTask};
    use cronmesh_db::{CreateTaskRequest, Db};

    async fn create_test_db() -> Db {
        let path = format!("test_ingest_{}.db", cronmesh_core::Id::new());
        Db::new(&path).await.expect("failed to create test db")
    }

    fn request() -> CreateTaskRequest {
        CreateTaskRequest {
            template_id: None,
            tenant: "default".into(),
            project: "proj-a".into(),
            category: "http".into(),
            name: "t".into(),
            command: "curl".into(),
            args: "[]".into(),
            plan: now_iso8601(),
            deadline: now_iso8601(),
            retry_count: 0,
            max_retry: Some(2),
            retryable: true,
            timeout_seconds: Some(60),
            next_retry_time: None,
            metadata: "{}".into(),
        }
    }

    #[tokio::test]
    async fn legal_transition_updates_status_and_output() {
        let db = create_test_db().await;
        let worker = WorkerRepository::new(db.pool()).get_or_create("worker-1", "{}").await.unwrap();
        let task = TaskRepository::new(db.pool()).create(request()).await.unwrap();

        let mut wire = WireTask::from_task(&task);
        wire.status = Some("running".into());
        let event = WireEvent::new(Action::Report, vec![wire]);

        apply_report(db.pool(), &worker.id, &event).await.unwrap();

        let reloaded = TaskRepository::new(db.pool()).find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, "running");
        assert!(reloaded.time_start.is_some());
    }

    #[tokio::test]
    async fn illegal_transition_is_ignored_not_errored() {
        let db = create_test_db().await;
        let worker = WorkerRepository::new(db.pool()).get_or_create("worker-1", "{}").await.unwrap();
        let task = TaskRepository::new(db.pool()).create(request()).await.unwrap();

        let mut wire = WireTask::from_task(&task);
        wire.status = Some("success".into()); // pending -> success is illegal
        let event = WireEvent::new(Action::Report, vec![wire]);

        apply_report(db.pool(), &worker.id, &event).await.unwrap();

        let reloaded = TaskRepository::new(db.pool()).find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, "pending");
    }
}
