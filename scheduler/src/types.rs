//! ABOUTME: Task status state machine and the decode-on-demand metadata blob (§4.9, §9)

use cronmesh_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A task's lifecycle state (§4.9). `Retrying` is accepted as a status string for
/// forward-compatibility with manually-tagged rows but the engines here never set it —
/// a retry always materialises as a brand new `Pending` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Error,
    Timeout,
    Canceled,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Retrying => "retrying",
        }
    }

    /// Terminal states mutate no further except via retry, which creates a new task (§3.2.3).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Error | Self::Timeout | Self::Canceled
        )
    }

    /// Whether `self -> next` is a legal transition per §4.9's state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Timeout | Self::Canceled),
            Self::Running => matches!(
                next,
                Self::Success | Self::Failed | Self::Error | Self::Timeout
            ),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "canceled" => Ok(Self::Canceled),
            "retrying" => Ok(Self::Retrying),
            other => Err(Error::BadRequest(format!("unknown task status '{}'", other))),
        }
    }
}

/// The decoded shape of a task's opaque `metadata` JSON blob (§9 "JSON-in-JSON metadata").
/// Unknown fields are ignored rather than rejected, matching source behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub worker_select: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl TaskMetadata {
    pub fn decode(blob: &str) -> Result<Self> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(blob)
            .map_err(|e| Error::Validation(format!("invalid task metadata blob: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Validation(format!("failed to encode task metadata: {}", e)))
    }

    /// True if `worker_select` is empty (no whitelist) or contains `candidate` (§3.2.5).
    pub fn allows_worker(&self, candidate: &str) -> bool {
        self.worker_select.is_empty() || self.worker_select.iter().any(|w| w == candidate)
    }
}

/// The decoded shape of a worker's declared `metadata` blob (§9): the category set it's
/// willing to serve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetadata {
    #[serde(default)]
    pub tasks: Vec<String>,
}

impl WorkerMetadata {
    pub fn decode(blob: &str) -> Result<Self> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(blob)
            .map_err(|e| Error::Validation(format!("invalid worker metadata blob: {}", e)))
    }

    pub fn supports_category(&self, category: &str) -> bool {
        self.tasks.iter().any(|c| c == category)
    }
}
