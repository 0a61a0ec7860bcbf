//! ABOUTME: Database layer with SQLite, migrations, and repositories
//! ABOUTME: Handles all data persistence and database operations

use cronmesh_core::{Error, Result};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, Sqlite, SqlitePool,
};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Database connection retry configuration
#[derive(Debug, Clone)]
pub struct DatabaseRetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for DatabaseRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl DatabaseRetryConfig {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
        }
    }

    /// Calculate delay for a given attempt number with exponential backoff and jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = delay_ms.min(self.max_delay_ms as f64);

        let jitter = {
            use std::time::SystemTime;
            let nanos = SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos();
            0.9 + ((nanos % 201) as f64 / 1000.0)
        };

        Duration::from_millis((capped_delay * jitter) as u64)
    }
}

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Create a new database connection with migrations and default retry configuration
    #[instrument(skip(db_path))]
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::new_with_retry(db_path, DatabaseRetryConfig::default()).await
    }

    /// Create a new database connection with migrations and custom retry configuration
    #[instrument(skip(db_path, retry_config))]
    pub async fn new_with_retry(db_path: &str, retry_config: DatabaseRetryConfig) -> Result<Self> {
        info!(
            "initializing database at: {} (max_attempts: {}, initial_delay: {}ms)",
            db_path, retry_config.max_attempts, retry_config.initial_delay_ms
        );

        let database_url = format!("sqlite://{}", db_path);
        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                let delay = retry_config.calculate_delay(attempt - 1);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = retry_config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "database connection failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_initialize(db_path, &database_url).await {
                Ok(db) => match db.migrate().await {
                    Ok(_) => {
                        info!(attempts = attempt + 1, "database initialized and migrated successfully");
                        return Ok(db);
                    }
                    Err(e) => {
                        warn!(attempt = attempt + 1, error = %e, "database migration failed, will retry initialization");
                        last_error = Some(e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "database initialization failed");
                    last_error = Some(e);
                    continue;
                }
            }
        }

        let error_msg = match last_error {
            Some(e) => format!("failed to initialize database after {} attempts: {}", retry_config.max_attempts, e),
            None => format!("failed to initialize database after {} attempts", retry_config.max_attempts),
        };

        Err(Error::Database(error_msg))
    }

    async fn try_initialize(db_path: &str, database_url: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            debug!("creating database: {}", database_url);
            Sqlite::create_database(database_url)
                .await
                .map_err(|e| Error::Database(format!("failed to create database: {}", e)))?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true)
            .pragma("foreign_keys", "ON")
            .pragma("synchronous", "NORMAL")
            .pragma("cache_size", "10000")
            .pragma("temp_store", "memory")
            .pragma("busy_timeout", "30000")
            .pragma("mmap_size", "268435456");

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| Error::Database(format!("failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        info!("running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;

        info!("database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a Db instance from an existing pool (for testing/reuse)
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<()> {
        debug!("performing database health check");

        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("health check failed: {}", e)))?;

        debug!("database health check passed");
        Ok(())
    }

    /// Backs the queue-health surface (§6.5) — a cheap cross-table row count.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<DatabaseStats> {
        debug!("gathering database statistics");

        let tables = ["templates", "tasks", "workers", "locks"];
        let mut table_counts = std::collections::HashMap::new();

        for table in tables {
            let query = format!("SELECT COUNT(*) as count FROM {}", table);
            let row = sqlx::query(&query)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("failed to get count for {}: {}", table, e)))?;

            let count: i64 = row.get("count");
            table_counts.insert(table.to_string(), count);
        }

        debug!("database statistics gathered successfully");
        Ok(DatabaseStats { table_counts })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseStats {
    pub table_counts: std::collections::HashMap<String, i64>,
}

pub mod repositories;

pub use repositories::{
    CreateTaskRequest, CreateTemplateRequest, CreateWorkerRequest, Filter, FilterOp, FilterValue,
    LockRepository, Task, TaskRepository, Template, TemplateRepository, UpdateTaskRequest,
    UpdateTemplateRequest, Worker, WorkerRepository,
};

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use cronmesh_core::Id;
    use tokio::fs;

    /// Create a test database with a unique name; every repository test module uses this.
    pub async fn create_test_db() -> Result<Db> {
        let test_id = Id::new().to_string();
        let db_path = format!("test_cronmesh_{}.db", test_id);

        let _ = fs::remove_file(&db_path).await;

        Db::new(&db_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::create_test_db;

    #[tokio::test]
    async fn test_database_initialization() {
        let db = create_test_db().await.expect("failed to create test database");

        db.health_check().await.expect("health check should pass");

        let stats = db.stats().await.expect("stats should be available");
        assert!(stats.table_counts.contains_key("templates"));
        assert_eq!(stats.table_counts["templates"], 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = create_test_db().await.expect("failed to create test database");

        db.migrate().await.expect("migrations should run successfully a second time");

        let stats = db.stats().await.expect("stats should be available");
        for table in ["templates", "tasks", "workers", "locks"] {
            assert!(stats.table_counts.contains_key(table), "table {} should exist", table);
        }
    }
}
