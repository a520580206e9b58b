//! `taskforge-core`: task model building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or runtime
//! concerns): the persisted task record, its identifier, the retry grammar and
//! the validation errors raised before anything touches a store.

pub mod error;
pub mod id;
pub mod retry;
pub mod task;
pub mod time;

pub use error::{DomainError, DomainResult};
pub use id::TaskId;
pub use retry::{DelayUnit, FixedDelay, RetryStrategy};
pub use task::{ExtendedInfo, Task};
