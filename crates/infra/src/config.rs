//! Environment-driven configuration for workers embedding the queue.

use std::time::Duration;

use thiserror::Error;

use crate::runner::RunnerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Queue and runner settings.
///
/// | Variable | Default |
/// |---|---|
/// | `TASKFORGE_DATABASE_URL` (or `DATABASE_URL`) | unset: in-memory store |
/// | `TASKFORGE_TABLE` | `tasks` |
/// | `TASKFORGE_SCAN_INTERVAL_SECS` | 60 |
/// | `TASKFORGE_LOCK_INTERVAL_SECS` | 60 |
/// | `TASKFORGE_GROUP_INTERVAL_SECS` | 5 |
/// | `TASKFORGE_TASKS_PER_SCAN` | 1000 |
/// | `TASKFORGE_SHUTDOWN_TIMEOUT_SECS` | 30 |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub database_url: Option<String>,
    pub table: String,
    pub scan_interval: Duration,
    pub lock_interval: Duration,
    pub group_interval: Duration,
    pub tasks_per_scan: usize,
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            database_url: None,
            table: "tasks".to_string(),
            scan_interval: runner.scan_interval,
            lock_interval: runner.lock_interval,
            group_interval: runner.group_interval,
            tasks_per_scan: runner.tasks_per_scan,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            database_url: get("TASKFORGE_DATABASE_URL").or_else(|| get("DATABASE_URL")),
            table: get("TASKFORGE_TABLE").unwrap_or(defaults.table),
            scan_interval: secs(get("TASKFORGE_SCAN_INTERVAL_SECS"), "TASKFORGE_SCAN_INTERVAL_SECS")?
                .unwrap_or(defaults.scan_interval),
            lock_interval: secs(get("TASKFORGE_LOCK_INTERVAL_SECS"), "TASKFORGE_LOCK_INTERVAL_SECS")?
                .unwrap_or(defaults.lock_interval),
            group_interval: secs(
                get("TASKFORGE_GROUP_INTERVAL_SECS"),
                "TASKFORGE_GROUP_INTERVAL_SECS",
            )?
            .unwrap_or(defaults.group_interval),
            tasks_per_scan: number(get("TASKFORGE_TASKS_PER_SCAN"), "TASKFORGE_TASKS_PER_SCAN")?
                .map(|n| (n as usize).max(1))
                .unwrap_or(defaults.tasks_per_scan),
            shutdown_timeout: secs(
                get("TASKFORGE_SHUTDOWN_TIMEOUT_SECS"),
                "TASKFORGE_SHUTDOWN_TIMEOUT_SECS",
            )?
            .unwrap_or(defaults.shutdown_timeout),
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_scan_interval(self.scan_interval)
            .with_lock_interval(self.lock_interval)
            .with_group_interval(self.group_interval)
            .with_tasks_per_scan(self.tasks_per_scan)
    }
}

fn number(raw: Option<String>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid { key, value })
    })
    .transpose()
}

fn secs(raw: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(number(raw, key)?.map(Duration::from_secs))
}
