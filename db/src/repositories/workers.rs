//! ABOUTME: Worker repository - execution nodes registered over the channel (§3.1, §6.2)

use super::filter::{push_filters, Filter};
use cronmesh_core::{time::now_iso8601, Error, Id, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub last_active: String,
    pub metadata: String,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateWorkerRequest {
    pub name: String,
    pub metadata: String,
}

pub struct WorkerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorkerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Worker>> {
        sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to find worker by id: {}", e)))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Worker>> {
        sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE name = ? AND deleted_at IS NULL")
            .bind(name)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to find worker by name: {}", e)))
    }

    pub async fn list_with_filter(&self, filters: &[Filter]) -> Result<Vec<Worker>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM workers WHERE deleted_at IS NULL");
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY name ASC");

        builder
            .build_query_as::<Worker>()
            .fetch_all(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to list workers: {}", e)))
    }

    pub async fn create(&self, req: CreateWorkerRequest) -> Result<Worker> {
        let id = Id::new().to_string();
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO workers (id, name, is_active, last_active, metadata, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(&now)
        .bind(&req.metadata)
        .bind(&now)
        .bind(&now)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to insert worker: {}", e)))?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| Error::Database("worker vanished immediately after insert".into()))
    }

    /// Looks up a worker by name, registering it on first connect (§4.4.1 step b).
    pub async fn get_or_create(&self, name: &str, metadata: &str) -> Result<Worker> {
        if let Some(existing) = self.find_by_name(name).await? {
            return Ok(existing);
        }

        match self
            .create(CreateWorkerRequest {
                name: name.to_string(),
                metadata: metadata.to_string(),
            })
            .await
        {
            Ok(worker) => Ok(worker),
            Err(Error::Database(_)) => {
                // Lost a create race against another connection handler for the same name.
                self.find_by_name(name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("worker {} not found after race", name)))
            }
            Err(other) => Err(other),
        }
    }

    pub async fn touch_last_active(&self, id: &str, at: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET last_active = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(at)
            .bind(at)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to touch worker last_active: {}", e)))?;
        Ok(())
    }

    pub async fn update_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let now = now_iso8601();
        sqlx::query("UPDATE workers SET metadata = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(metadata)
            .bind(&now)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to update worker metadata: {}", e)))?;
        Ok(())
    }

    /// Flips `is_active = false` for workers stale past the liveness threshold (§4.8 C9).
    pub async fn deactivate_stale(&self, cutoff: &str) -> Result<u64> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE workers SET is_active = 0, updated_at = ? WHERE is_active = 1 AND last_active < ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(cutoff)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to deactivate stale workers: {}", e)))?;

        Ok(result.rows_affected())
    }

    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE workers SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to soft-delete worker: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("worker {} not found", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::create_test_db;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let db = create_test_db().await.unwrap();
        let repo = WorkerRepository::new(db.pool());

        let first = repo.get_or_create("worker-west", "{}").await.unwrap();
        let second = repo.get_or_create("worker-west", "{}").await.unwrap();

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn deactivate_stale_flips_only_workers_past_cutoff() {
        let db = create_test_db().await.unwrap();
        let repo = WorkerRepository::new(db.pool());

        let fresh = repo.get_or_create("worker-fresh", "{}").await.unwrap();
        let stale = repo.get_or_create("worker-stale", "{}").await.unwrap();
        repo.touch_last_active(&stale.id, "2020-01-01T00:00:00Z").await.unwrap();

        let affected = repo.deactivate_stale("2024-01-01T00:00:00Z").await.unwrap();
        assert_eq!(affected, 1);

        let fresh_after = repo.find_by_id(&fresh.id).await.unwrap().unwrap();
        let stale_after = repo.find_by_id(&stale.id).await.unwrap().unwrap();
        assert!(fresh_after.is_active);
        assert!(!stale_after.is_active);
    }
}
