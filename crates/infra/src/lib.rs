//! Infrastructure layer: task stores, scheduling, runners and the queue facade.

pub mod config;
pub mod error;
pub mod processor;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use config::{ConfigError, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use processor::{
    ProcessorError, ProcessorFactory, ProcessorRegistry, ProcessorResult, RunTask, TaskInput,
    TaskProcessor,
};
pub use queue::{ShutdownOutcome, TaskQueue};
pub use runner::{Runner, RunnerConfig, RunnerHandle, RunnerState, ScanReport};
pub use scheduler::{ScheduleOptions, Scheduler};
pub use store::{
    InMemoryTaskStore, PostgresTaskStore, Reschedule, TaskFilter, TaskStore, TaskStoreError,
};
