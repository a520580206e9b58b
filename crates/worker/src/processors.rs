//! Built-in processors shipped with the worker.

use serde_json::json;
use tracing::info;

use taskforge_infra::{ProcessorRegistry, TaskInput, TaskProcessor};

/// `echo` returns its data; `log` logs data and previous result.
pub fn builtin() -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with(
            "echo",
            TaskProcessor::direct(|input: TaskInput| async move { Ok(input.data) }),
        )
        .with("log", TaskProcessor::direct(log))
}

async fn log(input: TaskInput) -> taskforge_infra::ProcessorResult {
    info!(
        task_id = %input.task_id,
        retries = input.info.retries,
        data = %input.data,
        previous_result = ?input.previous_result,
        "log task"
    );
    Ok(json!({ "logged": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskforge_core::{Task, TaskId};
    use taskforge_infra::ProcessorFactory;

    fn input(name: &str) -> TaskInput {
        let task = Task::new(TaskId::new("t").unwrap(), name, json!({"k": "v"}), Utc::now());
        TaskInput::from_task(&task, None)
    }

    #[tokio::test]
    async fn echo_returns_its_data() {
        let echo = builtin().processor("echo").unwrap();
        assert_eq!(echo.invoke(input("echo")).await.unwrap(), json!({"k": "v"}));
    }

    #[tokio::test]
    async fn log_acknowledges() {
        let log = builtin().processor("log").unwrap();
        assert_eq!(log.invoke(input("log")).await.unwrap(), json!({"logged": true}));
        assert!(builtin().processor("other").is_err());
    }
}
