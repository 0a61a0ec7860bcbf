//! ABOUTME: Template repository - recurring job definitions (§3.1, §6.2)

use super::filter::{push_filters, Filter};
use cronmesh_core::{time::now_iso8601, Error, Id, Result};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Template {
    pub id: String,
    pub tenant: String,
    pub project: String,
    pub category: String,
    pub name: String,
    pub cron_expr: String,
    pub command: String,
    pub args: String,
    pub timeout_seconds: Option<i64>,
    pub max_retry: Option<i64>,
    pub retryable: bool,
    pub is_active: bool,
    pub next_plan: Option<String>,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateTemplateRequest {
    pub tenant: String,
    pub project: String,
    pub category: String,
    pub name: String,
    pub cron_expr: String,
    pub command: String,
    pub args: String,
    pub timeout_seconds: Option<i64>,
    pub max_retry: Option<i64>,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTemplateRequest {
    pub cron_expr: Option<String>,
    pub command: Option<String>,
    pub args: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub max_retry: Option<i64>,
    pub retryable: Option<bool>,
    pub is_active: Option<bool>,
}

pub struct TemplateRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TemplateRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, req: CreateTemplateRequest) -> Result<Template> {
        let id = Id::new().to_string();
        let now = now_iso8601();

        let existing = self.find_by_project_and_name(&req.project, &req.name).await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!(
                "template '{}' already exists in project '{}'",
                req.name, req.project
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO templates
                (id, tenant, project, category, name, cron_expr, command, args,
                 timeout_seconds, max_retry, retryable, is_active, next_plan,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.tenant)
        .bind(&req.project)
        .bind(&req.category)
        .bind(&req.name)
        .bind(&req.cron_expr)
        .bind(&req.command)
        .bind(&req.args)
        .bind(req.timeout_seconds)
        .bind(req.max_retry)
        .bind(req.retryable)
        .bind(&now)
        .bind(&now)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to insert template: {}", e)))?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| Error::Database("template vanished immediately after insert".into()))
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>(
            "SELECT * FROM templates WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to find template by id: {}", e)))
    }

    pub async fn find_by_project_and_name(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>(
            "SELECT * FROM templates WHERE project = ? AND name = ? AND deleted_at IS NULL",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to find template by project/name: {}", e)))
    }

    pub async fn list_with_filter(&self, filters: &[Filter]) -> Result<Vec<Template>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM templates WHERE deleted_at IS NULL");
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY next_plan ASC");

        builder
            .build_query_as::<Template>()
            .fetch_all(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to list templates: {}", e)))
    }

    pub async fn update(&self, id: &str, req: UpdateTemplateRequest) -> Result<Template> {
        let current = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {} not found", id)))?;

        let now = now_iso8601();
        sqlx::query(
            r#"
            UPDATE templates
            SET cron_expr = ?, command = ?, args = ?, timeout_seconds = ?,
                max_retry = ?, retryable = ?, is_active = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(req.cron_expr.unwrap_or(current.cron_expr))
        .bind(req.command.unwrap_or(current.command))
        .bind(req.args.unwrap_or(current.args))
        .bind(req.timeout_seconds.or(current.timeout_seconds))
        .bind(req.max_retry.or(current.max_retry))
        .bind(req.retryable.unwrap_or(current.retryable))
        .bind(req.is_active.unwrap_or(current.is_active))
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to update template: {}", e)))?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {} not found after update", id)))
    }

    /// Advances the dispatch cursor. Only C6 calls this (§4.5 step e).
    pub async fn set_next_plan(&self, id: &str, next_plan: &str) -> Result<()> {
        let now = now_iso8601();
        sqlx::query("UPDATE templates SET next_plan = ?, updated_at = ? WHERE id = ?")
            .bind(next_plan)
            .bind(&now)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to advance next_plan: {}", e)))?;
        Ok(())
    }

    /// Batch-initialises null next-plan cursors to `now` (§4.5 bootstrap, run by C9).
    pub async fn batch_initialise_null_next_plan(&self, now: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE templates SET next_plan = ?, updated_at = ? WHERE next_plan IS NULL AND deleted_at IS NULL AND is_active = 1",
        )
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to bootstrap next_plan cursors: {}", e)))?;

        Ok(result.rows_affected())
    }

    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE templates SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to soft-delete template: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("template {} not found", id)));
        }
        Ok(())
    }

    /// Raw count of live rows, used by the queue-health surface (§6.5).
    pub async fn count_active(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM templates WHERE is_active = 1 AND deleted_at IS NULL")
            .fetch_one(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to count templates: {}", e)))?;
        Ok(row.get("count"))
    }
}
