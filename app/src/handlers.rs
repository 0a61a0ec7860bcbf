//! ABOUTME: Thin HTTP binding over the §6.5 operator surface - execute/cancel/retry/queue-health
//! ABOUTME: Full CRUD is explicitly out of scope (§1); this only exercises the core end-to-end

use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use cronmesh_core::{time::now_iso8601, Error, Result};
use cronmesh_db::{CreateTaskRequest, Task, TaskRepository, TemplateRepository};
use serde::Serialize;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECONDS: i64 = 300;
const TASK_LOCK_TTL: Duration = Duration::from_secs(100);

fn to_response<T: Serialize>(result: Result<T>) -> HttpResponse {
    match result {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(Error::BadRequest(msg)) => HttpResponse::BadRequest().json(ErrorBody { error: msg }),
        Err(Error::NotFound(msg)) => HttpResponse::NotFound().json(ErrorBody { error: msg }),
        Err(Error::Conflict(msg)) => HttpResponse::Conflict().json(ErrorBody { error: msg }),
        Err(Error::LockAlreadyAcquired(msg)) => HttpResponse::Conflict().json(ErrorBody { error: msg }),
        Err(Error::Preconditions(msg)) => HttpResponse::PreconditionFailed().json(ErrorBody { error: msg }),
        Err(Error::Validation(msg)) => HttpResponse::BadRequest().json(ErrorBody { error: msg }),
        Err(e) => HttpResponse::InternalServerError().json(ErrorBody { error: e.to_string() }),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn require_auth(req: &HttpRequest, state: &AppState) -> Result<()> {
    state.auth.check(req).await
}

/// `POST /templates/{id}/execute` (§6.5): a fresh task with plan=now, deadline=now+timeout,
/// inheriting the template's attributes.
pub async fn execute_template(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(e) = require_auth(&req, &state).await {
        return to_response::<Task>(Err(e));
    }

    let template_id = path.into_inner();
    let result = async {
        let template = TemplateRepository::new(state.db.pool())
            .find_by_id(&template_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {} not found", template_id)))?;

        let now = Utc::now();
        let timeout_seconds = template.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let deadline = now + ChronoDuration::seconds(timeout_seconds);

        TaskRepository::new(state.db.pool())
            .create(CreateTaskRequest {
                template_id: Some(template.id.clone()),
                tenant: template.tenant.clone(),
                project: template.project.clone(),
                category: template.category.clone(),
                name: format!("{}-manual-{}", template.name, now.format("%Y%m%d-%H%M%S")),
                command: template.command.clone(),
                args: template.args.clone(),
                plan: fmt(now),
                deadline: fmt(deadline),
                retry_count: 0,
                max_retry: template.max_retry,
                retryable: template.retryable,
                timeout_seconds: template.timeout_seconds,
                next_retry_time: None,
                metadata: "{}".to_string(),
            })
            .await
    }
    .await;

    to_response(result)
}

/// `POST /tasks/{id}/cancel` (§6.5): acquire the task lock, require `status=pending`, flip to
/// `canceled`, set `time_end=now`.
pub async fn cancel_task(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(e) = require_auth(&req, &state).await {
        return to_response::<Task>(Err(e));
    }

    let task_id = path.into_inner();
    let locks = {
        let scheduler = state.scheduler.lock().await;
        scheduler.locks().clone()
    };

    let result = async {
        let lock_key = format!("task:lock:{}", task_id);
        let handle = locks
            .acquire(&lock_key, TASK_LOCK_TTL)
            .await?;

        let task = TaskRepository::new(state.db.pool())
            .find_by_id(&task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {} not found", task_id)))?;

        if task.status != "pending" {
            let _ = handle.release().await;
            return Err(Error::Preconditions(format!(
                "task {} is not pending (status={})",
                task_id, task.status
            )));
        }

        let now = now_iso8601();
        let flipped = TaskRepository::new(state.db.pool())
            .update_status_if(&task_id, "pending", "canceled", Some(&now))
            .await?;
        let _ = handle.release().await;

        if !flipped {
            return Err(Error::Preconditions(format!("task {} changed state concurrently", task_id)));
        }

        TaskRepository::new(state.db.pool())
            .find_by_id(&task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {} vanished after cancel", task_id)))
    }
    .await;

    to_response(result)
}

/// `POST /tasks/{id}/retry` (§6.5): manually retry a terminal task, ignoring `next_retry_time`.
pub async fn retry_task(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(e) = require_auth(&req, &state).await {
        return to_response::<Task>(Err(e));
    }

    let task_id = path.into_inner();
    let engine = {
        let scheduler = state.scheduler.lock().await;
        scheduler.retry_engine()
    };
    let result = engine.manual_retry(&task_id).await;

    to_response(result)
}

/// `GET /queue/health` (§6.5): zero-database-cost atomic snapshot.
pub async fn queue_health(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(e) = require_auth(&req, &state).await {
        return to_response::<()>(Err(e));
    }

    let scheduler = state.scheduler.lock().await;
    HttpResponse::Ok().json(scheduler.queue_health())
}

fn fmt(instant: chrono::DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}
