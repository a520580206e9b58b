//! The persisted task record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;
use crate::retry::RetryStrategy;
use crate::time;

/// A unit of work stored in the queue.
///
/// ## Lifecycle
///
/// A task is inserted once and afterwards only mutated by a runner while it
/// holds the lease:
///
/// 1. **Lease**: `locked_at` is set to the lease time
/// 2. **Commit**: exactly one of
///    - `processed_at` + `result` (one-shot success)
///    - `failed_at` + `error_msg` + `retries` (failure, followed by a backoff reschedule)
///    - `start_at` moved forward (repeat, blocked group member)
///
/// `created_at` never changes and orders tasks both for leasing and inside a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub data: JsonValue,
    pub group: Option<String>,
    pub start_at: DateTime<Utc>,
    /// Zero for one-shot tasks.
    pub repeat_every: Duration,
    pub retry_strategy: RetryStrategy,
    /// Last lease acquisition; the Unix epoch when never leased.
    pub locked_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub retries: u32,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh, never-leased task that is due at `created_at`.
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        data: JsonValue,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            data,
            group: None,
            start_at: created_at,
            repeat_every: Duration::ZERO,
            retry_strategy: RetryStrategy::default(),
            locked_at: DateTime::<Utc>::UNIX_EPOCH,
            processed_at: None,
            failed_at: None,
            error_msg: None,
            retries: 0,
            result: None,
            created_at,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = at;
        self
    }

    pub fn repeating_every(mut self, every: Duration) -> Self {
        self.repeat_every = every;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Instant a parked task is moved to; far enough out that no lease window reaches it.
    pub fn parked_until() -> DateTime<Utc> {
        // 9999-12-31T00:00:00Z
        DateTime::<Utc>::from_timestamp(253_402_214_400, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check the record-level invariants.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::invalid_argument("task name must be a non-empty string"));
        }
        if let Some(group) = &self.group {
            if group.is_empty() {
                return Err(DomainError::invalid_argument("task group must not be empty"));
            }
            if self.is_repeating() {
                return Err(DomainError::invalid_argument(
                    "a repeating task cannot belong to a group",
                ));
            }
        }
        Ok(())
    }

    pub fn is_repeating(&self) -> bool {
        !self.repeat_every.is_zero()
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_parked(&self) -> bool {
        self.start_at >= Self::parked_until()
    }

    /// Whether a lease taken at `locked_at` is still held at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.locked_at >= time::before(now, lease)
    }

    /// The leasing predicate: unprocessed, due, and not currently locked.
    pub fn is_leasable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.processed_at.is_none() && self.start_at <= now && !self.is_locked(now, lease)
    }

    /// Prior-attempt state handed to processors.
    pub fn extended_info(&self) -> ExtendedInfo {
        ExtendedInfo {
            failed_at: self.failed_at,
            error_msg: self.error_msg.clone(),
            retries: self.retries,
            created_at: self.created_at,
        }
    }
}

/// What a processor can see about earlier attempts of the task it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedInfo {
    /// When the previous attempt failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Message of the previous failure.
    pub error_msg: Option<String>,
    /// Number of failed attempts so far.
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}
