use actix_web::{web, App, HttpServer};
use app::auth::PermissiveAuthGate;
use app::state::AppState;
use clap::{Parser, Subcommand};
use cronmesh_config::Config;
use cronmesh_core::telemetry;
use cronmesh_db::Db;
use cronmesh_scheduler::{DispatchConfig, LockConfig, RetryConfig, Scheduler, SchedulerConfig};
use cronmesh_workers::WorkerRegistry;
use std::process;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "cronmesh")]
#[command(about = "Distributed cron-style job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending migrations and exit
    Migrate,
    /// Start the scheduler core and the HTTP surface (default)
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = std::env::var("CRONMESH_ENV").unwrap_or_else(|_| "development".to_string());
    telemetry::init_tracing(&env, "cronmesh");

    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let db = match Db::new(&config.database.url).await {
        Ok(db) => {
            tracing::info!("database initialized successfully");
            db
        }
        Err(e) => {
            tracing::error!("failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = db.health_check().await {
        tracing::error!("database health check failed: {}", e);
        process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            tracing::info!("migrations applied, exiting");
        }
        Commands::Serve => {
            if let Err(e) = serve(config, db).await {
                tracing::error!("cronmesh exited with error: {}", e);
                process::exit(1);
            }
        }
    }
}

async fn serve(config: Config, db: Db) -> cronmesh_core::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        db_url = %config.database.url,
        "cronmesh configured and ready"
    );

    let scheduler_config = SchedulerConfig {
        dispatch: DispatchConfig {
            lookahead_seconds: config.dispatch.lookahead_seconds as i64,
            batch_size: config.dispatch.batch_size as usize,
        },
        retry: RetryConfig {
            enabled: config.retry.enabled,
            check_interval_seconds: config.retry.check_interval_seconds,
        },
        lock: LockConfig {
            default_lease_seconds: config.lock.default_lease_seconds as i64,
            max_retries: config.lock.max_retries,
            retry_interval_ms: config.lock.retry_interval_ms,
        },
    };

    let mut scheduler = Scheduler::new(&db, scheduler_config);
    let (mut pending_rx, mut stop_rx) = scheduler.take_bus_receivers();
    scheduler.start().await?;
    let scheduler = Arc::new(Mutex::new(scheduler));

    let registry = Arc::new(WorkerRegistry::new());

    // Bridges C3's hand-off queues to the worker fan-out hub (§4.4, §4.6): every task the
    // monitor's dispatch sweep offers gets broadcast to eligible connected workers.
    {
        let registry = registry.clone();
        let pool = db.pool().clone();
        tokio::spawn(async move {
            while let Some(task) = pending_rx.recv().await {
                let metadata = match cronmesh_scheduler::TaskMetadata::decode(&task.metadata) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "unparsable task metadata, broadcasting with no whitelist");
                        cronmesh_scheduler::TaskMetadata::default()
                    }
                };
                if let Err(e) = registry.broadcast(cronmesh_workers::Action::Run, &[(task, metadata)]).await {
                    tracing::warn!(error = %e, "failed to broadcast run action");
                }
            }
        });

        let registry = registry.clone();
        let pool_for_stop = pool.clone();
        tokio::spawn(async move {
            while let Some(task_id) = stop_rx.recv().await {
                let Ok(Some(task)) = cronmesh_db::TaskRepository::new(&pool_for_stop).find_by_id(&task_id).await else {
                    continue;
                };
                if let Some(worker_id) = &task.worker_id {
                    if let Err(e) = registry.send_action(worker_id, cronmesh_workers::Action::Stop, &task).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to deliver stop action");
                    }
                }
            }
        });
    }

    let auth: Arc<dyn app::auth::AuthGate> = Arc::new(PermissiveAuthGate);
    let app_state = AppState {
        db: db.clone(),
        scheduler: scheduler.clone(),
        registry: registry.clone(),
        auth,
    };

    let pool = db.pool().clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting HTTP surface");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(registry.clone()))
            .configure(app::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| cronmesh_core::Error::External(format!("failed to bind {}: {}", bind_addr, e)))?
    .run();

    let server_handle = server.handle();
    let result = tokio::select! {
        res = server => {
            tracing::warn!("HTTP server exited on its own");
            res
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, draining scheduler");
            server_handle.stop(true).await;
            Ok(())
        }
    };

    scheduler.lock().await.stop().await;

    result.map_err(|e| cronmesh_core::Error::External(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    // Integration-level coverage for the HTTP surface lives in tests/e2e_smoke.rs, which
    // exercises execute/cancel/retry/queue-health against a running instance.
}
