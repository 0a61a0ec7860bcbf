//! ABOUTME: Shared actix-web application state for the thin operator surface (§6.6)

use crate::auth::AuthGate;
use cronmesh_db::Db;
use cronmesh_scheduler::Scheduler;
use cronmesh_workers::WorkerRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub scheduler: Arc<Mutex<Scheduler>>,
    pub registry: Arc<WorkerRegistry>,
    pub auth: Arc<dyn AuthGate>,
}
