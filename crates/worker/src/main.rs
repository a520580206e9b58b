mod processors;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use taskforge_infra::{
    InMemoryTaskStore, ProcessorFactory, QueueConfig, ShutdownOutcome, TaskQueue, TaskStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = QueueConfig::from_env().context("invalid worker configuration")?;
    let factory: Arc<dyn ProcessorFactory> = Arc::new(processors::builtin());

    let outcome = match config.database_url.as_deref() {
        Some(url) => {
            let queue = TaskQueue::connect(url, &config.table)
                .await
                .context("failed to connect to the task store")?;
            serve(queue, &config, factory).await?
        }
        None => {
            warn!("TASKFORGE_DATABASE_URL not set; using in-memory task store");
            serve(TaskQueue::new(InMemoryTaskStore::new()), &config, factory).await?
        }
    };

    if let ShutdownOutcome::TimedOut { remaining } = outcome {
        error!(remaining, "graceful shutdown timed out; forcing exit");
        std::process::exit(1);
    }
    Ok(())
}

async fn serve<S>(
    queue: TaskQueue<S>,
    config: &QueueConfig,
    factory: Arc<dyn ProcessorFactory>,
) -> anyhow::Result<ShutdownOutcome>
where
    S: TaskStore + 'static,
{
    let runner = config
        .runner_config()
        .with_name(format!("worker-{}", std::process::id()));
    queue.run(runner, factory).await?;
    info!("worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(timeout_secs = config.shutdown_timeout.as_secs(), "shutdown requested");

    let outcome = queue.stop(config.shutdown_timeout).await;
    if outcome == ShutdownOutcome::Graceful {
        queue.close().await;
        info!("worker stopped");
    }
    Ok(outcome)
}
