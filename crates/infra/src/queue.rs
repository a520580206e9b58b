//! `TaskQueue` facade: store lifecycle, enqueue/maintenance API and runners.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{info, warn};

use taskforge_core::{Task, TaskId};

use crate::error::QueueResult;
use crate::processor::ProcessorFactory;
use crate::runner::{Runner, RunnerConfig, RunnerHandle};
use crate::scheduler::{ScheduleOptions, Scheduler};
use crate::store::{PostgresTaskStore, Reschedule, TaskFilter, TaskStore};

/// How a [`TaskQueue::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every runner reached `Stopped` before the deadline.
    Graceful,
    /// The deadline passed with `remaining` runners still busy.
    TimedOut { remaining: usize },
}

/// Entry point for producers and workers.
///
/// Holds the store client explicitly; `connect` and `close` bracket its
/// lifetime. All runners started through [`TaskQueue::run`] are tracked so
/// that [`TaskQueue::stop`] can shut them down together.
pub struct TaskQueue<S> {
    store: Arc<S>,
    scheduler: Scheduler<Arc<S>>,
    runners: Mutex<Vec<RunnerHandle>>,
}

impl TaskQueue<PostgresTaskStore> {
    /// Connect to Postgres and make sure the task table exists.
    pub async fn connect(database_url: &str, table: &str) -> QueueResult<Self> {
        let store = PostgresTaskStore::connect(database_url, table).await?;
        info!(table = %store.table(), "connected to postgres task store");
        Ok(Self::new(store))
    }
}

impl<S> TaskQueue<S>
where
    S: TaskStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone()),
            store,
            runners: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Enqueue a task; see [`Scheduler::schedule`].
    pub async fn schedule(
        &self,
        name: &str,
        data: JsonValue,
        options: ScheduleOptions,
    ) -> QueueResult<Task> {
        self.scheduler.schedule(name, data, options).await
    }

    pub async fn find_task(&self, filter: &TaskFilter) -> QueueResult<Option<Task>> {
        Ok(self.store.find(filter).await?)
    }

    pub async fn remove(&self, filter: &TaskFilter) -> QueueResult<u64> {
        let removed = self.store.remove(filter).await?;
        info!(removed, "removed tasks");
        Ok(removed)
    }

    /// Operator re-admission: move a task to `start_at` with a fresh lease and
    /// retry count. This is how parked tasks are brought back.
    pub async fn reschedule(
        &self,
        id: &TaskId,
        start_at: DateTime<Utc>,
    ) -> QueueResult<Option<Task>> {
        let reschedule = Reschedule::at(start_at).releasing_lease().clearing_retries();
        Ok(self.store.reschedule(id, reschedule).await?)
    }

    /// Start a runner and return once its first scan iteration has completed.
    pub async fn run(
        &self,
        config: RunnerConfig,
        factory: Arc<dyn ProcessorFactory>,
    ) -> QueueResult<()> {
        let mut handle = Runner::new(self.store.clone(), config, factory).spawn();
        handle.first_scan().await;
        info!(runner = %handle.name(), "runner started");
        self.runners.lock().await.push(handle);
        Ok(())
    }

    /// Number of runners started and not yet stopped.
    pub async fn running(&self) -> usize {
        self.runners
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_stopped())
            .count()
    }

    /// Stop every runner, waiting up to `deadline` for in-flight tasks.
    ///
    /// Concurrent calls queue behind the first one and then observe its outcome.
    pub async fn stop(&self, deadline: Duration) -> ShutdownOutcome {
        let mut runners = self.runners.lock().await;
        for handle in runners.iter() {
            handle.stop();
        }

        let all_stopped = futures::future::join_all(runners.iter().map(|h| h.stopped()));
        let outcome = match tokio::time::timeout(deadline, all_stopped).await {
            Ok(_) => ShutdownOutcome::Graceful,
            Err(_) => {
                let remaining = runners
                    .iter()
                    .filter(|h| !h.is_stopped())
                    .count();
                warn!(remaining, "runners did not stop before the deadline");
                ShutdownOutcome::TimedOut { remaining }
            }
        };

        runners.retain(|h| !h.is_stopped());
        outcome
    }

    /// Release the store's connections. Call after [`TaskQueue::stop`].
    pub async fn close(&self) {
        self.store.close().await;
        info!("task queue closed");
    }
}
