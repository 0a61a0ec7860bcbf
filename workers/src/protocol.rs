//! ABOUTME: Wire framing for the worker channel - sentinel-delimited JSON frames (§4.4.2, §6.1)

use cronmesh_core::{Error, Result};
use cronmesh_db::Task;
use serde::{Deserialize, Serialize};

/// `\x00` followed by the ASCII run `223399AABB2233CC`, repeated on both sides of the frame.
pub const SENTINEL: &[u8] = b"\x00223399AABB2233CC";

/// Maximum tasks carried in a single outbound frame (§6.1 backpressure).
pub const MAX_TASKS_PER_FRAME: usize = 5;

/// Server→worker and worker→server actions (§4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Run,
    Stop,
    Kill,
    Timeout,
    Retry,
    /// Worker-originated state report; the task list carries one updated task.
    Report,
}

/// A task as it appears on the wire — the persistence row's shape narrowed to what a worker
/// needs (§6.1), independent of the storage column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTask {
    pub id: String,
    pub name: String,
    pub category: String,
    pub command: String,
    pub args: String,
    pub time_plan: String,
    pub timeout_at: String,
    pub metadata: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

impl WireTask {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            category: task.category.clone(),
            command: task.command.clone(),
            args: task.args.clone(),
            time_plan: task.plan.clone(),
            timeout_at: task.deadline.clone(),
            metadata: task.metadata.clone(),
            status: Some(task.status.clone()),
            output: task.output.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub action: Action,
    pub tasks: Vec<WireTask>,
}

impl WireEvent {
    pub fn new(action: Action, tasks: Vec<WireTask>) -> Self {
        Self { action, tasks }
    }

    /// Encodes a frame: `SENTINEL + JSON + SENTINEL` (§6.1).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self).map_err(|e| Error::Validation(format!("failed to encode wire event: {}", e)))?;
        let mut framed = Vec::with_capacity(SENTINEL.len() * 2 + body.len());
        framed.extend_from_slice(SENTINEL);
        framed.extend_from_slice(&body);
        framed.extend_from_slice(SENTINEL);
        Ok(framed)
    }

    /// Decodes a frame, tolerating the JSON body with or without the surrounding sentinels so
    /// a transport that already strips framing (e.g. a raw text message) still parses.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut body = frame;
        if let Some(stripped) = body.strip_prefix(SENTINEL) {
            body = stripped;
        }
        if let Some(stripped) = body.strip_suffix(SENTINEL) {
            body = stripped;
        }
        serde_json::from_slice(body).map_err(|e| Error::Validation(format!("failed to decode wire event: {}", e)))
    }
}
