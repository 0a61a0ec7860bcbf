//! ABOUTME: Task repository - one execution instance per row (§3.1, §6.2)

use super::filter::{push_filters, Filter};
use cronmesh_core::{time::now_iso8601, Error, Id, Result};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub template_id: Option<String>,
    pub tenant: String,
    pub project: String,
    pub category: String,
    pub name: String,
    pub command: String,
    pub args: String,
    pub status: String,
    pub plan: String,
    pub deadline: String,
    pub worker_id: Option<String>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    pub output: Option<String>,
    pub retry_count: i64,
    pub max_retry: Option<i64>,
    pub retryable: bool,
    pub timeout_seconds: Option<i64>,
    pub next_retry_time: Option<String>,
    pub metadata: String,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub template_id: Option<String>,
    pub tenant: String,
    pub project: String,
    pub category: String,
    pub name: String,
    pub command: String,
    pub args: String,
    pub plan: String,
    pub deadline: String,
    pub retry_count: i64,
    pub max_retry: Option<i64>,
    pub retryable: bool,
    pub timeout_seconds: Option<i64>,
    pub next_retry_time: Option<String>,
    pub metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    pub command: Option<String>,
    pub args: Option<String>,
    pub max_retry: Option<i64>,
    pub retryable: Option<bool>,
    pub timeout_seconds: Option<i64>,
    pub metadata: Option<String>,
}

pub struct TaskRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TaskRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, req: CreateTaskRequest) -> Result<Task> {
        let id = Id::new().to_string();
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, template_id, tenant, project, category, name, command, args,
                 status, plan, deadline, retry_count, max_retry, retryable,
                 timeout_seconds, next_retry_time, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.template_id)
        .bind(&req.tenant)
        .bind(&req.project)
        .bind(&req.category)
        .bind(&req.name)
        .bind(&req.command)
        .bind(&req.args)
        .bind(&req.plan)
        .bind(&req.deadline)
        .bind(req.retry_count)
        .bind(req.max_retry)
        .bind(req.retryable)
        .bind(req.timeout_seconds)
        .bind(&req.next_retry_time)
        .bind(&req.metadata)
        .bind(&now)
        .bind(&now)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to insert task: {}", e)))?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| Error::Database("task vanished immediately after insert".into()))
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to find task by id: {}", e)))
    }

    /// Tasks already materialised for a template at or after a given plan instant — used by
    /// C6 step (b) to detect a peer replica winning the race (invariant 1).
    pub async fn find_by_template_since_plan(
        &self,
        template_id: &str,
        plan: &str,
    ) -> Result<Vec<Task>> {
        sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE template_id = ? AND deadline >= ? AND deleted_at IS NULL",
        )
        .bind(template_id)
        .bind(plan)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to query tasks by template/plan: {}", e)))
    }

    pub async fn list_with_filter(&self, filters: &[Filter]) -> Result<Vec<Task>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM tasks WHERE deleted_at IS NULL");
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY plan ASC");

        builder
            .build_query_as::<Task>()
            .fetch_all(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to list tasks: {}", e)))
    }

    /// Unconditional status flip used by C7's timeout sweep and operator cancel.
    pub async fn update_status(
        &self,
        id: &str,
        status: &str,
        time_start: Option<&str>,
        time_end: Option<&str>,
    ) -> Result<()> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                time_start = COALESCE(?, time_start),
                time_end = COALESCE(?, time_end),
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(status)
        .bind(time_start)
        .bind(time_end)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to update task status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task {} not found", id)));
        }
        Ok(())
    }

    /// Status transition guarded by an expected current status, so concurrent sweeps can't
    /// both "win" the same transition (used for the timeout sweep's compare-and-swap).
    pub async fn update_status_if(
        &self,
        id: &str,
        expected_status: &str,
        new_status: &str,
        time_end: Option<&str>,
    ) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, time_end = COALESCE(?, time_end), updated_at = ?
            WHERE id = ? AND status = ? AND deleted_at IS NULL
            "#,
        )
        .bind(new_status)
        .bind(time_end)
        .bind(&now)
        .bind(id)
        .bind(expected_status)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to conditionally update task status: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Patches the mutable, pre-dispatch attributes of a task (command/args/retry policy/
    /// metadata). Never touches `status`, `worker_id`, or the timing columns — those go
    /// through `update_status`/`update_status_if`/`update_output`.
    pub async fn update(&self, id: &str, req: UpdateTaskRequest) -> Result<Task> {
        let current = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {} not found", id)))?;

        let now = now_iso8601();
        sqlx::query(
            r#"
            UPDATE tasks
            SET command = ?, args = ?, max_retry = ?, retryable = ?,
                timeout_seconds = ?, metadata = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(req.command.unwrap_or(current.command))
        .bind(req.args.unwrap_or(current.args))
        .bind(req.max_retry.or(current.max_retry))
        .bind(req.retryable.unwrap_or(current.retryable))
        .bind(req.timeout_seconds.or(current.timeout_seconds))
        .bind(req.metadata.unwrap_or(current.metadata))
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to update task: {}", e)))?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {} not found after update", id)))
    }

    pub async fn update_output(&self, id: &str, worker_id: &str, output: &str) -> Result<()> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE tasks SET output = ?, worker_id = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(output)
        .bind(worker_id)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to update task output: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task {} not found", id)));
        }
        Ok(())
    }

    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE tasks SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to soft-delete task: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task {} not found", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::create_test_db;

    fn sample_request(plan: &str, deadline: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            template_id: None,
            tenant: "default".into(),
            project: "proj-a".into(),
            category: "http".into(),
            name: "manual-run".into(),
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
    async fn create_and_find_roundtrip() {
        let db = create_test_db().await.unwrap();
        let repo = TaskRepository::new(db.pool());

        let task = repo
            .create(sample_request("2024-01-01T12:00:00Z", "2024-01-02T12:00:00Z"))
            .await
            .unwrap();

        assert_eq!(task.status, "pending");
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn update_patches_only_given_fields() {
        let db = create_test_db().await.unwrap();
        let repo = TaskRepository::new(db.pool());

        let task = repo
            .create(sample_request("2024-01-01T12:00:00Z", "2024-01-02T12:00:00Z"))
            .await
            .unwrap();

        let updated = repo
            .update(
                &task.id,
                UpdateTaskRequest {
                    retryable: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!updated.retryable);
        assert_eq!(updated.command, task.command);
        assert_eq!(updated.args, task.args);
    }

    #[tokio::test]
    async fn conditional_status_update_only_succeeds_once() {
        let db = create_test_db().await.unwrap();
        let repo = TaskRepository::new(db.pool());

        let task = repo
            .create(sample_request("2024-01-01T12:00:00Z", "2024-01-02T12:00:00Z"))
            .await
            .unwrap();

        let first = repo
            .update_status_if(&task.id, "pending", "timeout", Some("2024-01-02T12:00:00Z"))
            .await
            .unwrap();
        assert!(first);

        let second = repo
            .update_status_if(&task.id, "pending", "timeout", Some("2024-01-02T12:00:01Z"))
            .await
            .unwrap();
        assert!(!second, "a task already out of `pending` must not match again");
    }
}
