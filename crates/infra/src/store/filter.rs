//! Maintenance/inspection filters over task records.

use taskforge_core::{Task, TaskId};

/// Conjunction of optional predicates; the empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub id: Option<TaskId>,
    pub name: Option<String>,
    pub group: Option<String>,
    /// `Some(true)`: only processed tasks; `Some(false)`: only unprocessed ones.
    pub processed: Option<bool>,
    /// `Some(true)`: only tasks that failed at least once.
    pub failed: Option<bool>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: TaskId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn failed(mut self, failed: bool) -> Self {
        self.failed = Some(failed);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.id.as_ref().is_none_or(|id| &task.id == id)
            && self.name.as_ref().is_none_or(|name| &task.name == name)
            && self
                .group
                .as_ref()
                .is_none_or(|group| task.group.as_ref() == Some(group))
            && self.processed.is_none_or(|p| task.is_processed() == p)
            && self.failed.is_none_or(|f| task.failed_at.is_some() == f)
    }
}
