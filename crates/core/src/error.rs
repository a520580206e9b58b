//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Only deterministic input failures live here. Storage and processor
/// failures belong to the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An argument failed validation (e.g. empty name, group on a repeating task).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A retry strategy did not match `none|pow<N>|<N>m|<N>h|<N>d`.
    #[error("invalid retry strategy {0:?}: expected one of none, pow<N>, <N>m, <N>h, <N>d")]
    InvalidRetryStrategy(String),

    /// An identifier was invalid (e.g. empty string).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_retry_strategy(raw: impl Into<String>) -> Self {
        Self::InvalidRetryStrategy(raw.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
