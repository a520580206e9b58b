//! Task logic plug-in points.
//!
//! A runner resolves a [`TaskProcessor`] by task name through a
//! [`ProcessorFactory`] and invokes it with a [`TaskInput`]. Both processor
//! shapes produce a JSON result or a [`ProcessorError`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use thiserror::Error;

use taskforge_core::{ExtendedInfo, Task, TaskId};

/// Failure reported by task logic; recorded on the task as `error_msg`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessorError {
    message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ProcessorError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProcessorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid task data: {err}"))
    }
}

pub type ProcessorResult = Result<JsonValue, ProcessorError>;

/// Everything a processor gets to see about the task it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInput {
    pub task_id: TaskId,
    pub name: String,
    pub data: JsonValue,
    /// Result of the group predecessor, if any.
    pub previous_result: Option<JsonValue>,
    pub info: ExtendedInfo,
}

impl TaskInput {
    pub fn from_task(task: &Task, previous_result: Option<JsonValue>) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            data: task.data.clone(),
            previous_result,
            info: task.extended_info(),
        }
    }
}

/// Object-style processor.
#[async_trait]
pub trait RunTask: Send + Sync {
    async fn run(&self, input: TaskInput) -> ProcessorResult;
}

type DirectFn = dyn Fn(TaskInput) -> BoxFuture<'static, ProcessorResult> + Send + Sync;

/// A resolved processor: either a plain async function or a [`RunTask`] object.
#[derive(Clone)]
pub enum TaskProcessor {
    Direct(Arc<DirectFn>),
    Method(Arc<dyn RunTask>),
}

impl TaskProcessor {
    pub fn direct<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessorResult> + Send + 'static,
    {
        Self::Direct(Arc::new(move |input| Box::pin(f(input))))
    }

    pub fn method<R>(runner: R) -> Self
    where
        R: RunTask + 'static,
    {
        Self::Method(Arc::new(runner))
    }

    pub async fn invoke(&self, input: TaskInput) -> ProcessorResult {
        match self {
            TaskProcessor::Direct(f) => f(input).await,
            TaskProcessor::Method(runner) => runner.run(input).await,
        }
    }
}

impl fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskProcessor::Direct(_) => f.write_str("TaskProcessor::Direct"),
            TaskProcessor::Method(_) => f.write_str("TaskProcessor::Method"),
        }
    }
}

/// Resolves a task name to its processor.
///
/// Resolution failures are treated like processor failures: the task is
/// marked failed and retried according to its strategy.
pub trait ProcessorFactory: Send + Sync {
    fn processor(&self, name: &str) -> Result<TaskProcessor, ProcessorError>;
}

impl<F> ProcessorFactory for F
where
    F: Fn(&str) -> Result<TaskProcessor, ProcessorError> + Send + Sync,
{
    fn processor(&self, name: &str) -> Result<TaskProcessor, ProcessorError> {
        self(name)
    }
}

/// Name-keyed processor table.
///
/// Lookup order: exact name, then the longest matching `prefix.*` category
/// pattern, then the `*` wildcard.
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, TaskProcessor>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, processor: TaskProcessor) -> &mut Self {
        self.processors.insert(pattern.into(), processor);
        self
    }

    pub fn with(mut self, pattern: impl Into<String>, processor: TaskProcessor) -> Self {
        self.register(pattern, processor);
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Option<&TaskProcessor> {
        if let Some(p) = self.processors.get(name) {
            return Some(p);
        }

        // Category match ("mail.*" matches "mail.send")
        let category = self
            .processors
            .iter()
            .filter_map(|(pattern, p)| {
                let prefix = pattern.strip_suffix('*')?;
                (prefix.ends_with('.') && name.starts_with(prefix)).then_some((prefix.len(), p))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, p)| p);
        if category.is_some() {
            return category;
        }

        self.processors.get("*")
    }
}

impl ProcessorFactory for ProcessorRegistry {
    fn processor(&self, name: &str) -> Result<TaskProcessor, ProcessorError> {
        self.resolve(name)
            .cloned()
            .ok_or_else(|| ProcessorError::new(format!("no processor registered for task {name:?}")))
    }
}
