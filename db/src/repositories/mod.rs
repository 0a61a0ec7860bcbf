//! ABOUTME: Repository layer implementing the persistence contract (§6.2)
//! ABOUTME: One module per entity, each wrapping a `&SqlitePool`

pub mod filter;
pub mod locks;
pub mod tasks;
pub mod templates;
pub mod workers;

pub use filter::{Filter, FilterOp, FilterValue};
pub use locks::LockRepository;
pub use tasks::{CreateTaskRequest, Task, TaskRepository, UpdateTaskRequest};
pub use templates::{CreateTemplateRequest, Template, TemplateRepository, UpdateTemplateRequest};
pub use workers::{CreateWorkerRequest, Worker, WorkerRepository};
