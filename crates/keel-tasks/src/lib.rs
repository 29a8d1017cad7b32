//! Task runtime for the keel control plane.
//!
//! - `TaskQueue`: four priority levels, per-priority FIFO, sequential lanes,
//!   at-least-once delivery with 24 h result retention
//! - `Scheduler`: deferred tasks (SLA timers, retries) and periodic
//!   declarations
//! - `WorkerPool`: horizontally-scaled workers with jittered retry backoff

pub mod error;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use error::{TaskError, TaskResult};
pub use queue::{TaskEnvelope, TaskQueue, TaskState, RESULT_RETENTION};
pub use retry::{backoff_delay, MAX_RETRY_DELAY};
pub use scheduler::Scheduler;
pub use worker::{TaskHandler, WorkerConfig, WorkerPool};
