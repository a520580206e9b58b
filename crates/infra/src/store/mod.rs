//! Durable task store boundary.
//!
//! One collection of task records, mutated only through atomic single-record
//! operations. Runners coordinate exclusively through this boundary.

pub mod filter;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use filter::TaskFilter;
pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use r#trait::{Reschedule, TaskStore, TaskStoreError};
