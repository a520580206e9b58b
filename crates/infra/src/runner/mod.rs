//! The scan loop: lease, sequence, execute, commit.
//!
//! A [`Runner`] processes one task at a time. Any number of runners (in one
//! process or many) may share a store; they coordinate only through
//! [`TaskStore::lease_next`].
//!
//! ## Lifecycle
//!
//! `Idle -> Scanning -> (Idle | Stopped)`. The current state is published on a
//! watch channel and observed through [`RunnerHandle`]. Stopping cancels the
//! pending sleep; an in-flight scan finishes the task it holds and halts.
//!
//! ## Failure boundary
//!
//! Processor errors, processor panics and factory resolution failures are all
//! recorded on the task (`mark_failed` + backoff) and never escape the loop.
//! Store errors abort the current iteration only; the next tick retries.

pub mod sequencer;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskforge_core::Task;

use crate::processor::{ProcessorError, ProcessorFactory, ProcessorResult, TaskInput};
use crate::scheduler::Scheduler;
use crate::store::{TaskStore, TaskStoreError};

pub use sequencer::{GroupSequencer, Sequencing};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Pause between scan iterations.
    pub scan_interval: Duration,
    /// Lease duration; a task locked more recently than this is skipped.
    pub lock_interval: Duration,
    /// Delay added when a grouped task is blocked by its predecessor.
    pub group_interval: Duration,
    /// Upper bound on tasks leased per scan iteration; a scan always handles at least one.
    pub tasks_per_scan: usize,
    /// Name for logging
    pub name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            lock_interval: Duration::from_secs(60),
            group_interval: Duration::from_secs(5),
            tasks_per_scan: 1000,
            name: "task-runner".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_lock_interval(mut self, interval: Duration) -> Self {
        self.lock_interval = interval;
        self
    }

    pub fn with_group_interval(mut self, interval: Duration) -> Self {
        self.group_interval = interval;
        self
    }

    pub fn with_tasks_per_scan(mut self, max: usize) -> Self {
        self.tasks_per_scan = max.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Scanning,
    Stopped,
}

/// Counters for one scan iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanReport {
    pub leased: usize,
    pub processed: usize,
    pub repeated: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// Handle to control a spawned runner.
#[derive(Debug)]
pub struct RunnerHandle {
    name: String,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<RunnerState>,
    first_scan: Option<oneshot::Receiver<()>>,
    join: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown; returns immediately.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Whether the loop has exited, cleanly or not.
    pub fn is_stopped(&self) -> bool {
        self.state() == RunnerState::Stopped
            || self.join.as_ref().is_none_or(|join| join.is_finished())
    }

    /// Wait until the first scan iteration has completed (or the runner is gone).
    pub async fn first_scan(&mut self) {
        if let Some(rx) = self.first_scan.take() {
            let _ = rx.await;
        }
    }

    /// Wait until the runner reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        while *state.borrow_and_update() != RunnerState::Stopped {
            if state.changed().await.is_err() {
                // Runner task is gone (finished or panicked).
                break;
            }
        }
    }

    /// Stop and wait for the loop task to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(runner = %self.name, error = %e, "task runner terminated abnormally");
            }
        }
    }
}

/// Scan loop over a shared task store.
pub struct Runner<S> {
    store: S,
    scheduler: Scheduler<S>,
    sequencer: GroupSequencer<S>,
    factory: Arc<dyn ProcessorFactory>,
    config: RunnerConfig,
    stop: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<RunnerState>>,
}

impl<S> Runner<S>
where
    S: TaskStore + Clone + 'static,
{
    pub fn new(store: S, config: RunnerConfig, factory: Arc<dyn ProcessorFactory>) -> Self {
        let (stop, _) = watch::channel(false);
        let (state, _) = watch::channel(RunnerState::Idle);
        Self {
            scheduler: Scheduler::new(store.clone()),
            sequencer: GroupSequencer::new(store.clone(), config.group_interval),
            store,
            factory,
            config,
            stop: Arc::new(stop),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Spawn the scan loop on the current tokio runtime.
    pub fn spawn(self) -> RunnerHandle {
        let (first_scan_tx, first_scan_rx) = oneshot::channel();
        let handle_name = self.config.name.clone();
        let stop = self.stop.clone();
        let state = self.state.subscribe();

        let join = tokio::spawn(self.run_loop(first_scan_tx));

        RunnerHandle {
            name: handle_name,
            stop,
            state,
            first_scan: Some(first_scan_rx),
            join: Some(join),
        }
    }

    async fn run_loop(self, first_scan: oneshot::Sender<()>) {
        info!(runner = %self.config.name, "task runner started");
        let mut stop_rx = self.stop.subscribe();
        let mut first_scan = Some(first_scan);

        while !*stop_rx.borrow_and_update() {
            self.state.send_replace(RunnerState::Scanning);

            match self.scan().await {
                Ok(report) if report.leased > 0 => {
                    info!(runner = %self.config.name, ?report, "scan iteration finished");
                }
                Ok(_) => {
                    debug!(runner = %self.config.name, "scan iteration found no eligible task");
                }
                Err(e) => {
                    error!(runner = %self.config.name, error = %e, "scan iteration aborted");
                }
            }

            if let Some(tx) = first_scan.take() {
                let _ = tx.send(());
            }

            if *stop_rx.borrow_and_update() {
                break;
            }
            self.state.send_replace(RunnerState::Idle);

            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = stop_rx.changed() => {}
            }
        }

        self.state.send_replace(RunnerState::Stopped);
        info!(runner = %self.config.name, "task runner stopped");
    }

    /// Run one scan iteration.
    ///
    /// Leases and processes tasks until the queue has no eligible task, the
    /// per-scan budget is spent, or a stop is requested.
    pub async fn scan(&self) -> Result<ScanReport, TaskStoreError> {
        let mut report = ScanReport::default();

        let budget = self.config.tasks_per_scan.max(1);
        while report.leased < budget && !self.stop_requested() {
            let Some(task) = self.store.lease_next(self.config.lock_interval).await? else {
                break;
            };
            report.leased += 1;
            debug!(
                runner = %self.config.name,
                task_id = %task.id,
                task_name = %task.name,
                retries = task.retries,
                "leased task"
            );

            self.process(task, &mut report).await?;
        }

        Ok(report)
    }

    async fn process(&self, task: Task, report: &mut ScanReport) -> Result<(), TaskStoreError> {
        let previous_result = match task.group.as_deref() {
            Some(group) => match self.sequencer.check(&task, group).await? {
                Sequencing::Ready { previous_result } => previous_result,
                Sequencing::Blocked { blocked_by, until } => {
                    warn!(
                        task_id = %task.id,
                        group,
                        blocked_by = %blocked_by,
                        until = %until,
                        "grouped task blocked by unfinished predecessor"
                    );
                    report.blocked += 1;
                    return Ok(());
                }
            },
            None => None,
        };

        match self.invoke(&task, previous_result).await {
            Ok(result) if task.is_repeating() => {
                let next = self.scheduler.reschedule_repeatable(&task, result).await?;
                self.warn_if_vanished(&task, next.is_none());
                report.repeated += 1;
            }
            Ok(result) => {
                let done = self.store.mark_processed(&task.id, result).await?;
                self.warn_if_vanished(&task, done.is_none());
                debug!(task_id = %task.id, task_name = %task.name, "task processed");
                report.processed += 1;
            }
            Err(err) => {
                error!(
                    task_id = %task.id,
                    task_name = %task.name,
                    retries = task.retries,
                    error = %err,
                    "task processor failed"
                );
                match self.store.mark_failed(&task.id, err.message()).await? {
                    Some(failed) => {
                        let next = self.scheduler.reschedule_failed(&failed).await?;
                        self.warn_if_vanished(&task, next.is_none());
                    }
                    None => self.warn_if_vanished(&task, true),
                }
                report.failed += 1;
            }
        }

        Ok(())
    }

    /// Resolve and run the processor inside the failure boundary.
    async fn invoke(&self, task: &Task, previous_result: Option<JsonValue>) -> ProcessorResult {
        let resolved =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.factory.processor(&task.name)));
        let processor = match resolved {
            Ok(processor) => processor?,
            Err(panic) => return Err(panicked(panic)),
        };

        let input = TaskInput::from_task(task, previous_result);
        match AssertUnwindSafe(processor.invoke(input)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(panicked(panic)),
        }
    }

    fn warn_if_vanished(&self, task: &Task, vanished: bool) {
        if vanished {
            warn!(task_id = %task.id, task_name = %task.name, "task removed while it was being processed");
        }
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> ProcessorError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    ProcessorError::new(format!("processor panicked: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{ProcessorRegistry, TaskProcessor};
    use crate::store::{InMemoryTaskStore, TaskFilter};
    use chrono::Utc;
    use serde_json::json;
    use taskforge_core::TaskId;

    fn runner(store: Arc<InMemoryTaskStore>, registry: ProcessorRegistry) -> Runner<Arc<InMemoryTaskStore>> {
        Runner::new(
            store,
            RunnerConfig::default().with_scan_interval(Duration::from_millis(20)),
            Arc::new(registry),
        )
    }

    async fn insert(store: &InMemoryTaskStore, id: &str, name: &str) -> TaskId {
        let id = TaskId::new(id).unwrap();
        let task = Task::new(id.clone(), name, json!({"id": id.as_str()}), Utc::now());
        store.insert_unique(task).await.unwrap();
        id
    }

    async fn get(store: &InMemoryTaskStore, id: &TaskId) -> Task {
        store.find(&TaskFilter::by_id(id.clone())).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn scan_processes_tasks_and_reports() {
        let store = InMemoryTaskStore::arc();
        let a = insert(&store, "a", "echo").await;
        let b = insert(&store, "b", "echo").await;
        let registry = ProcessorRegistry::new().with(
            "echo",
            TaskProcessor::direct(|input: TaskInput| async move { Ok(input.data) }),
        );

        let report = runner(store.clone(), registry).scan().await.unwrap();
        assert_eq!(report.leased, 2);
        assert_eq!(report.processed, 2);

        let a = get(&store, &a).await;
        assert!(a.is_processed());
        assert_eq!(a.result, Some(json!({"id": "a"})));
        assert!(get(&store, &b).await.is_processed());
    }

    #[tokio::test]
    async fn panics_and_missing_processors_are_recorded_as_failures() {
        let store = InMemoryTaskStore::arc();
        let boom = insert(&store, "boom", "explode").await;
        let lost = insert(&store, "lost", "unknown").await;
        let registry = ProcessorRegistry::new().with(
            "explode",
            TaskProcessor::direct(|_input: TaskInput| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(json!(null))
            }),
        );

        let report = runner(store.clone(), registry).scan().await.unwrap();
        assert_eq!(report.failed, 2);

        let boom = get(&store, &boom).await;
        assert_eq!(boom.retries, 1);
        assert!(boom.error_msg.as_deref().unwrap().contains("kaboom"));
        assert!(boom.start_at > Utc::now());

        let lost = get(&store, &lost).await;
        assert!(lost.error_msg.as_deref().unwrap().contains("no processor"));
    }

    #[tokio::test]
    async fn budget_limits_tasks_per_scan() {
        let store = InMemoryTaskStore::arc();
        for id in ["a", "b", "c"] {
            insert(&store, id, "echo").await;
        }
        let registry = ProcessorRegistry::new()
            .with("*", TaskProcessor::direct(|_: TaskInput| async { Ok(json!(null)) }));
        let runner = Runner::new(
            store.clone(),
            RunnerConfig::default().with_tasks_per_scan(2),
            Arc::new(registry),
        );

        assert_eq!(runner.scan().await.unwrap().leased, 2);
        assert_eq!(runner.scan().await.unwrap().leased, 1);
        assert_eq!(runner.scan().await.unwrap().leased, 0);
    }

    #[tokio::test]
    async fn zero_budget_still_handles_one_task() {
        let store = InMemoryTaskStore::arc();
        for id in ["a", "b"] {
            insert(&store, id, "echo").await;
        }
        let registry = ProcessorRegistry::new()
            .with("*", TaskProcessor::direct(|_: TaskInput| async { Ok(json!(null)) }));
        let mut config = RunnerConfig::default();
        config.tasks_per_scan = 0;
        assert_eq!(RunnerConfig::default().with_tasks_per_scan(0).tasks_per_scan, 1);

        let runner = Runner::new(store.clone(), config, Arc::new(registry));
        assert_eq!(runner.scan().await.unwrap().processed, 1);
        assert_eq!(runner.scan().await.unwrap().processed, 1);
    }

    #[tokio::test]
    async fn spawned_runner_stops_gracefully() {
        let store = InMemoryTaskStore::arc();
        let id = insert(&store, "a", "echo").await;
        let registry = ProcessorRegistry::new()
            .with("*", TaskProcessor::direct(|_: TaskInput| async { Ok(json!("done")) }));

        let mut handle = runner(store.clone(), registry).spawn();
        handle.first_scan().await;
        assert!(get(&store, &id).await.is_processed());
        assert_ne!(handle.state(), RunnerState::Stopped);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
        assert_eq!(handle.state(), RunnerState::Stopped);
        handle.shutdown().await;
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = panicked(Box::new("static"));
        assert_eq!(err.message(), "processor panicked: static");
        let err = panicked(Box::new(String::from("owned")));
        assert_eq!(err.message(), "processor panicked: owned");
        let err = panicked(Box::new(7_u8));
        assert_eq!(err.message(), "processor panicked: unknown panic payload");
    }
}
