//! Enqueue validation and the rescheduling rules for failed and repeating tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use taskforge_core::{RetryStrategy, Task, TaskId, time};

use crate::error::{QueueError, QueueResult};
use crate::store::{Reschedule, TaskStore, TaskStoreError};

/// Optional scheduling constraints for [`Scheduler::schedule`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleOptions {
    /// Caller-supplied identifier; a UUIDv7 is generated when absent.
    pub task_id: Option<String>,
    pub group: Option<String>,
    /// Defaults to the scheduling instant.
    pub start_at: Option<DateTime<Utc>>,
    pub repeat_every: Duration,
    /// Textual retry strategy; `pow1` when absent.
    pub retry_strategy: Option<String>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn repeating_every(mut self, every: Duration) -> Self {
        self.repeat_every = every;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.retry_strategy = Some(strategy.into());
        self
    }
}

/// Creates tasks and computes their next start time after a run.
#[derive(Debug, Clone)]
pub struct Scheduler<S> {
    store: S,
}

impl<S: TaskStore> Scheduler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate and insert a new task.
    ///
    /// Every validation error is raised before the store is touched.
    pub async fn schedule(
        &self,
        name: &str,
        data: JsonValue,
        options: ScheduleOptions,
    ) -> QueueResult<Task> {
        let task = build_task(name, data, options, Utc::now())?;

        let task = self.store.insert_unique(task).await.map_err(QueueError::from)?;
        info!(
            task_id = %task.id,
            task_name = %task.name,
            group = task.group.as_deref().unwrap_or(""),
            start_at = %task.start_at,
            "task scheduled"
        );
        Ok(task)
    }

    /// Backoff for a task whose failure has already been recorded.
    pub fn compute_backoff(task: &Task) -> Option<Duration> {
        task.retry_strategy.backoff(task.retries)
    }

    /// Move a failed task to its next attempt and release its lease.
    ///
    /// Tasks with the `none` strategy are parked instead; they stay out of
    /// reach until an operator reschedules them.
    pub async fn reschedule_failed(&self, task: &Task) -> Result<Option<Task>, TaskStoreError> {
        let start_at = match Self::compute_backoff(task) {
            Some(delay) => time::after(Utc::now(), delay),
            None => Task::parked_until(),
        };
        debug!(
            task_id = %task.id,
            retries = task.retries,
            start_at = %start_at,
            "rescheduling failed task"
        );

        self.store
            .reschedule(&task.id, Reschedule::at(start_at).releasing_lease())
            .await
    }

    /// Schedule the next run of a repeating task, keeping its lease in place.
    pub async fn reschedule_repeatable(
        &self,
        task: &Task,
        result: JsonValue,
    ) -> Result<Option<Task>, TaskStoreError> {
        let start_at = time::after(Utc::now(), task.repeat_every);
        debug!(task_id = %task.id, start_at = %start_at, "rescheduling repeating task");

        self.store
            .reschedule(&task.id, Reschedule::at(start_at).recording_result(result))
            .await
    }
}

fn build_task(
    name: &str,
    data: JsonValue,
    options: ScheduleOptions,
    now: DateTime<Utc>,
) -> QueueResult<Task> {
    if name.trim().is_empty() {
        return Err(QueueError::InvalidArgument(
            "task name must be a non-empty string".to_string(),
        ));
    }

    let id = match options.task_id {
        Some(raw) => TaskId::new(raw)?,
        None => TaskId::generate(),
    };

    let retry_strategy = match options.retry_strategy {
        Some(raw) => raw.parse::<RetryStrategy>()?,
        None => RetryStrategy::default(),
    };

    let mut task = Task::new(id, name, data, now)
        .starting_at(options.start_at.unwrap_or(now))
        .repeating_every(options.repeat_every)
        .with_retry_strategy(retry_strategy);
    task.group = options.group;

    task.validate()?;
    Ok(task)
}
