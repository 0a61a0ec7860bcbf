//! ABOUTME: Worker registry and channel fan-out (C4 + C5) - §4.4
//! ABOUTME: protocol/registry are transport-agnostic; ws carries the actix-web socket

pub mod ingest;
pub mod protocol;
pub mod registry;
pub mod ws;

pub use protocol::{Action, WireEvent, WireTask, MAX_TASKS_PER_FRAME, SENTINEL};
pub use registry::{Session, WorkerRegistry};
pub use ws::{worker_channel, ConnectQuery, WorkerSession};
