//! Background job system: queue, handlers, worker and scheduler.

pub mod handlers;
pub mod job;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use job::{
    HandlerError, JobHandle, JobPriority, JobRecord, JobStatus, JobType, QueueStats,
    RetryPolicy, SubmitOptions,
};
pub use queue::{JobQueue, QueueHealth};
pub use registry::{JobHandler, JobHandlerRegistry};
pub use scheduler::{TaskScheduler, TaskStatus};
pub use worker::{JobWorker, WorkerHandle};
