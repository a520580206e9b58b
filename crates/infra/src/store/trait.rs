use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use taskforge_core::{Task, TaskId};

use super::filter::TaskFilter;

/// Task store operation error.
///
/// These are **infrastructure errors** (storage, connectivity, identity
/// collisions) as opposed to domain errors (validation).
#[derive(Debug, Clone, Error)]
pub enum TaskStoreError {
    #[error("task already exists: {0}")]
    DuplicateId(TaskId),

    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt task record: {0}")]
    Corrupt(String),

    #[error("invalid store configuration: {0}")]
    Invalid(String),
}

/// New scheduling state written by [`TaskStore::reschedule`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reschedule {
    pub start_at: DateTime<Utc>,
    /// Reset `locked_at` to the Unix epoch so the task is leasable as soon as it is due.
    pub reset_lease: bool,
    /// Reset `retries` to zero.
    pub reset_retries: bool,
    /// Result of the run that triggered the reschedule (repeating tasks).
    pub result: Option<JsonValue>,
}

impl Reschedule {
    pub fn at(start_at: DateTime<Utc>) -> Self {
        Self {
            start_at,
            reset_lease: false,
            reset_retries: false,
            result: None,
        }
    }

    pub fn releasing_lease(mut self) -> Self {
        self.reset_lease = true;
        self
    }

    pub fn clearing_retries(mut self) -> Self {
        self.reset_retries = true;
        self
    }

    pub fn recording_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    /// Apply this reschedule to an in-memory record.
    pub fn apply(&self, task: &mut Task) {
        task.start_at = self.start_at;
        if self.reset_lease {
            task.locked_at = DateTime::<Utc>::UNIX_EPOCH;
        }
        if self.reset_retries {
            task.retries = 0;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
    }
}

/// Durable, shared collection of task records.
///
/// The store is the **only** coordination point between runners. Every
/// mutation is a single atomic record operation; concurrent callers never
/// observe a torn intermediate state.
///
/// ## Leasing
///
/// `lease_next()` is the sole mutual-exclusion primitive. It must select and
/// lock in one indivisible step (compare-and-swap on `locked_at`), picking the
/// oldest record by creation order among those that are:
/// - not processed
/// - due (`start_at <= now`)
/// - not locked (`locked_at < now - lease`)
///
/// Leases expire on their own; a crashed runner never blocks a task for longer
/// than the lease duration.
///
/// ## Ordering
///
/// Creation order is `created_at` ascending, with ties broken by insertion
/// order, so it is a strict total order over the records of a store.
///
/// ## Mutations
///
/// `mark_failed`, `mark_processed` and `reschedule` return the updated record,
/// or `None` if it no longer exists (removed by maintenance mid-flight).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the backing collection and its indexes if they are missing.
    async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        Ok(())
    }

    /// Insert a new record; fails with `DuplicateId` if the id is taken.
    async fn insert_unique(&self, task: Task) -> Result<Task, TaskStoreError>;

    /// Atomically lease the oldest eligible task, returning it as it was before the lease.
    async fn lease_next(&self, lease: Duration) -> Result<Option<Task>, TaskStoreError>;

    /// The task of `group` immediately before `successor` in creation order.
    async fn find_predecessor(
        &self,
        group: &str,
        successor: &TaskId,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// Record a failed attempt: `failed_at = now`, `error_msg`, `retries += 1`.
    async fn mark_failed(
        &self,
        id: &TaskId,
        message: &str,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// Record final success; leaves an already processed record untouched.
    async fn mark_processed(
        &self,
        id: &TaskId,
        result: JsonValue,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// Move a task's start time, optionally releasing its lease.
    async fn reschedule(
        &self,
        id: &TaskId,
        reschedule: Reschedule,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// First record (in creation order) matching the filter.
    async fn find(&self, filter: &TaskFilter) -> Result<Option<Task>, TaskStoreError>;

    /// Delete every record matching the filter; returns how many were removed.
    async fn remove(&self, filter: &TaskFilter) -> Result<u64, TaskStoreError>;

    /// Release underlying connections.
    async fn close(&self) {}
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        (**self).ensure_schema().await
    }

    async fn insert_unique(&self, task: Task) -> Result<Task, TaskStoreError> {
        (**self).insert_unique(task).await
    }

    async fn lease_next(&self, lease: Duration) -> Result<Option<Task>, TaskStoreError> {
        (**self).lease_next(lease).await
    }

    async fn find_predecessor(
        &self,
        group: &str,
        successor: &TaskId,
    ) -> Result<Option<Task>, TaskStoreError> {
        (**self).find_predecessor(group, successor).await
    }

    async fn mark_failed(
        &self,
        id: &TaskId,
        message: &str,
    ) -> Result<Option<Task>, TaskStoreError> {
        (**self).mark_failed(id, message).await
    }

    async fn mark_processed(
        &self,
        id: &TaskId,
        result: JsonValue,
    ) -> Result<Option<Task>, TaskStoreError> {
        (**self).mark_processed(id, result).await
    }

    async fn reschedule(
        &self,
        id: &TaskId,
        reschedule: Reschedule,
    ) -> Result<Option<Task>, TaskStoreError> {
        (**self).reschedule(id, reschedule).await
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Option<Task>, TaskStoreError> {
        (**self).find(filter).await
    }

    async fn remove(&self, filter: &TaskFilter) -> Result<u64, TaskStoreError> {
        (**self).remove(filter).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
