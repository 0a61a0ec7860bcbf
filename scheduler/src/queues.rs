//! ABOUTME: Task Queues (C3) - bounded hand-off channels between the monitor and the fan-out hub
//! ABOUTME: Replaces the source's process-wide globals with an owned DispatchBus value (§9)

use cronmesh_db::Task;
use tokio::sync::mpsc;
use tracing::warn;

const QUEUE_CAPACITY: usize = 1024;

/// Owns the `pending` and `stop` hand-off channels (§4.3). Created once at server bootstrap
/// and passed by construction to whichever components need a sender or the single receiver.
pub struct DispatchBus {
    pending_tx: mpsc::Sender<Task>,
    pending_rx: Option<mpsc::Receiver<Task>>,
    stop_tx: mpsc::Sender<String>,
    stop_rx: Option<mpsc::Receiver<String>>,
}

impl DispatchBus {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            pending_tx,
            pending_rx: Some(pending_rx),
            stop_tx,
            stop_rx: Some(stop_rx),
        }
    }

    pub fn pending_sender(&self) -> PendingSender {
        PendingSender(self.pending_tx.clone())
    }

    pub fn stop_sender(&self) -> StopSender {
        StopSender(self.stop_tx.clone())
    }

    /// Takes the single-consumer receiver. Panics if called twice — C5's fan-out loop is the
    /// only consumer and owns it for the process lifetime.
    pub fn take_pending_receiver(&mut self) -> mpsc::Receiver<Task> {
        self.pending_rx.take().expect("pending receiver already taken")
    }

    pub fn take_stop_receiver(&mut self) -> mpsc::Receiver<String> {
        self.stop_rx.take().expect("stop receiver already taken")
    }
}

impl Default for DispatchBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking producer handle for the `pending` queue (C7's dispatch sweep, and C6 at
/// creation time per §4.6's "also offered by C6" note).
#[derive(Clone)]
pub struct PendingSender(mpsc::Sender<Task>);

impl PendingSender {
    /// Offers a task non-blocking; drops with a warning on overflow (§4.3, §4.10) — the next
    /// sweep will rediscover it since it remains `pending` in storage.
    pub fn offer(&self, task: Task) {
        if let Err(mpsc::error::TrySendError::Full(task)) = self.0.try_send(task) {
            warn!(task_id = %task.id, "pending queue full, dropping offer; next sweep will retry");
        }
    }
}

/// Non-blocking producer handle for the `stop` queue (operator-initiated cancel/kill).
#[derive(Clone)]
pub struct StopSender(mpsc::Sender<String>);

impl StopSender {
    pub fn offer(&self, task_id: String) {
        if let Err(mpsc::error::TrySendError::Full(task_id)) = self.0.try_send(task_id) {
            warn!(task_id, "stop queue full, dropping offer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            template_id: None,
            tenant: "default".into(),
            project: "proj-a".into(),
            category: "http".into(),
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
            metadata: "{}".into(),
            deleted_at: None,
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn offered_task_is_received_by_the_single_consumer() {
        let mut bus = DispatchBus::new();
        let sender = bus.pending_sender();
        let mut receiver = bus.take_pending_receiver();

        sender.offer(sample_task("t1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.id, "t1");
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let mut bus = DispatchBus::new();
        let sender = bus.pending_sender();
        let _receiver = bus.take_pending_receiver();

        for i in 0..(QUEUE_CAPACITY + 10) {
            sender.offer(sample_task(&format!("t{}", i)));
        }
    }

    #[test]
    #[should_panic(expected = "already taken")]
    fn taking_the_pending_receiver_twice_panics() {
        let mut bus = DispatchBus::new();
        let _first = bus.take_pending_receiver();
        let _second = bus.take_pending_receiver();
    }
}
