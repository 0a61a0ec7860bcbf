//! ABOUTME: Worker session registry - broadcast/filtering fan-out (§4.4.1, §4.4.3, §4.4.4)
//! ABOUTME: Transport-agnostic: sessions are addressed by an outbound mpsc sender

use crate::protocol::{Action, WireEvent, WireTask, MAX_TASKS_PER_FRAME};
use cronmesh_core::{Error, Result};
use cronmesh_db::Task;
use cronmesh_scheduler::TaskMetadata;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const SESSION_OUTBOUND_CAPACITY: usize = 100;

/// A live worker connection, as far as the registry is concerned. The actual socket write
/// loop lives on the transport side and drains `outbound`.
#[derive(Clone)]
pub struct Session {
    pub client_id: String,
    pub worker_id: String,
    pub worker_name: String,
    pub categories: Vec<String>,
    outbound: mpsc::Sender<WireEvent>,
}

impl Session {
    pub fn new(client_id: String, worker_id: String, worker_name: String, categories: Vec<String>) -> (Self, mpsc::Receiver<WireEvent>) {
        let (tx, rx) = mpsc::channel(SESSION_OUTBOUND_CAPACITY);
        (
            Self { client_id, worker_id, worker_name, categories, outbound: tx },
            rx,
        )
    }

    /// True if `candidate` names this session by worker id, worker name, or client id
    /// (§4.4.3's three-way whitelist match).
    fn matches_whitelist_entry(&self, candidate: &str) -> bool {
        candidate == self.worker_id || candidate == self.worker_name || candidate == self.client_id
    }

    fn allowed_by_whitelist(&self, metadata: &TaskMetadata) -> bool {
        metadata.worker_select.is_empty() || metadata.worker_select.iter().any(|w| self.matches_whitelist_entry(w))
    }

    fn offer(&self, event: WireEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.outbound.try_send(event) {
            warn!(client_id = %self.client_id, "session outbound queue full, dropping event");
        }
    }
}

/// Owns the live session set. One instance shared across every connection handler and the
/// dispatch/retry/cancel call sites that need to reach a worker (§5: read/write mutex, reads
/// dominate since broadcast runs far more often than connect/disconnect).
pub struct WorkerRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, session: Session) {
        info!(client_id = %session.client_id, worker_id = %session.worker_id, "worker session registered");
        self.sessions.write().await.insert(session.client_id.clone(), session);
    }

    pub async fn unregister(&self, client_id: &str) {
        if self.sessions.write().await.remove(client_id).is_some() {
            info!(client_id, "worker session unregistered");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Filters `tasks` per-session against declared categories and each task's worker-select
    /// whitelist, and offers the surviving subset (§4.4.3). Tasks a session isn't eligible for
    /// are silently excluded from its frame, not treated as an error.
    pub async fn broadcast(&self, action: Action, tasks: &[(Task, TaskMetadata)]) -> Result<()> {
        let sessions = self.sessions.read().await;

        for session in sessions.values() {
            let eligible: Vec<WireTask> = tasks
                .iter()
                .filter(|(task, metadata)| session.categories.iter().any(|c| c == &task.category) && session.allowed_by_whitelist(metadata))
                .map(|(task, _)| WireTask::from_task(task))
                .collect();

            if eligible.is_empty() {
                continue;
            }

            for chunk in eligible.chunks(MAX_TASKS_PER_FRAME) {
                session.offer(WireEvent::new(action, chunk.to_vec()));
            }
        }

        Ok(())
    }

    /// Operator-initiated stop/kill targeted at one worker (§4.4.4). `NotFound` if offline.
    pub async fn send_action(&self, worker_id: &str, action: Action, task: &Task) -> Result<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .values()
            .find(|s| s.worker_id == worker_id)
            .ok_or_else(|| Error::NotFound(format!("worker {} is not connected", worker_id)))?;

        session.offer(WireEvent::new(action, vec![WireTask::from_task(task)]));
        debug!(worker_id, task_id = %task.id, ?action, "targeted action sent");
        Ok(())
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(category: &str, metadata: &str) -> Task {
        Task {
            id: "t1".into(),
            template_id: None,
            tenant: "default".into(),
            project: "proj-a".into(),
            category: category.into(),
            name: "sample".into(),
            command: "curl".into(),
            args: "[]".into(),
            status: "pending".into(),
            plan: "2024-01-01T00:00:00Z".into(),
            deadline: "2024-01-01T01:00:00Z".into(),
            worker_id: None,
            time_start: None,
            time_end: None,
            output: None,
            retry_count: 0,
            max_retry: Some(2),
            retryable: true,
            timeout_seconds: Some(60),
            next_retry_time: None,
            metadata: metadata.into(),
            deleted_at: None,
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn broadcast_skips_sessions_without_the_category() {
        let registry = WorkerRegistry::new();
        let (session, mut rx) = Session::new("c1".into(), "w1".into(), "worker-1".into(), vec!["script".into()]);
        registry.register(session).await;

        let task = sample_task("http", "{}");
        let metadata = TaskMetadata::decode(&task.metadata).unwrap();
        registry.broadcast(Action::Run, &[(task, metadata)]).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_delivers_to_matching_category_with_no_whitelist() {
        let registry = WorkerRegistry::new();
        let (session, mut rx) = Session::new("c1".into(), "w1".into(), "worker-1".into(), vec!["http".into()]);
        registry.register(session).await;

        let task = sample_task("http", "{}");
        let metadata = TaskMetadata::decode(&task.metadata).unwrap();
        registry.broadcast(Action::Run, &[(task, metadata)]).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.tasks.len(), 1);
    }

    #[tokio::test]
    async fn worker_select_whitelist_excludes_non_listed_sessions() {
        let registry = WorkerRegistry::new();
        let (session_a, mut rx_a) = Session::new("c1".into(), "w1".into(), "worker-west".into(), vec!["http".into()]);
        let (session_b, mut rx_b) = Session::new("c2".into(), "w2".into(), "worker-east".into(), vec!["http".into()]);
        registry.register(session_a).await;
        registry.register(session_b).await;

        let task = sample_task("http", r#"{"worker_select": ["worker-west"]}"#);
        let metadata = TaskMetadata::decode(&task.metadata).unwrap();
        registry.broadcast(Action::Run, &[(task, metadata)]).await.unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_action_reports_not_found_when_worker_offline() {
        let registry = WorkerRegistry::new();
        let task = sample_task("http", "{}");
        let result = registry.send_action("missing-worker", Action::Kill, &task).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn batch_larger_than_frame_limit_splits_into_multiple_frames() {
        let registry = WorkerRegistry::new();
        let (session, mut rx) = Session::new("c1".into(), "w1".into(), "worker-1".into(), vec!["http".into()]);
        registry.register(session).await;

        let tasks: Vec<(Task, TaskMetadata)> = (0..7)
            .map(|i| {
                let mut t = sample_task("http", "{}");
                t.id = format!("t{}", i);
                let metadata = TaskMetadata::decode(&t.metadata).unwrap();
                (t, metadata)
            })
            .collect();

        registry.broadcast(Action::Run, &tasks).await.unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.tasks.len(), MAX_TASKS_PER_FRAME);
        assert_eq!(second.tasks.len(), 2);
    }
}
