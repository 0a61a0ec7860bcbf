//! ABOUTME: Library half of the cronmesh binary - route wiring factored out so tests/e2e_smoke.rs
//! ABOUTME: can bind a real HTTP surface instead of exercising handlers through indirection

pub mod auth;
pub mod handlers;
pub mod state;

use actix_web::web;
use state::AppState;

/// Registers the §6.5 operator surface and the §4.4 worker channel on an actix-web service
/// config. Shared by the binary's `HttpServer::new` closure and integration tests, so both
/// exercise the exact same route table.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/templates/{id}/execute", web::post().to(handlers::execute_template))
        .route("/tasks/{id}/cancel", web::post().to(handlers::cancel_task))
        .route("/tasks/{id}/retry", web::post().to(handlers::retry_task))
        .route("/queue/health", web::get().to(handlers::queue_health))
        .route("/ws/worker", web::get().to(cronmesh_workers::worker_channel));
}
