//! taskq-demo - enqueue a few tasks and drain them with a worker group.
//!
//! Uses PostgreSQL when `TASKQ__DATABASE__URL` is set, otherwise the
//! in-memory store. `TASKQ_CONFIG` may name a config file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use taskq_core::config::LogConfig;
use taskq_core::impls::InMemoryTaskStore;
use taskq_core::ports::TaskStore;
use taskq_core::{
    ConcurrencyStrategy, EnqueueOptions, Handler, HandlerError, Payload, TaskArgs, TaskOptions,
    TaskQueue, TaskQueueBuilder, TaskqConfig,
};
use taskq_pg::PgTaskStore;

#[derive(Debug, Serialize, Deserialize)]
struct HelloArgs {
    name: String,
}

impl TaskArgs for HelloArgs {
    const KEY: &'static str = "demo.hello";
}

/// Fails a fixed number of times before greeting.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<HelloArgs> for HelloHandler {
    type Output = String;

    async fn handle(&self, args: HelloArgs) -> Result<String, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }
        Ok(format!("Hello, {}!", args.name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReportArgs {
    account: String,
}

impl TaskArgs for ReportArgs {
    const KEY: &'static str = "demo.report";
}

/// Slow enough that concurrent workers would overlap without UNIQUE.
struct ReportHandler;

#[async_trait]
impl Handler<ReportArgs> for ReportHandler {
    type Output = serde_json::Value;

    async fn handle(&self, args: ReportArgs) -> Result<serde_json::Value, HandlerError> {
        sleep(Duration::from_millis(200)).await;
        Ok(serde_json::json!({ "account": args.account, "rows": 42 }))
    }
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.level))?;
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}

async fn open_store(config: &TaskqConfig) -> anyhow::Result<Arc<dyn TaskStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PgTaskStore::connect(
                url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await?;
            store.migrate().await?;
            tracing::info!("Connected to database");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("No database configured, using the in-memory store");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
    }
}

async fn wait_until_drained(queue: &TaskQueue) -> anyhow::Result<()> {
    loop {
        let counts = queue.counts().await?;
        if counts.pending() == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("TASKQ_CONFIG") {
        Ok(path) => TaskqConfig::from_file(&path)?,
        Err(_) => TaskqConfig::load()?,
    };
    init_tracing(&config.log)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting taskq demo");

    let store = open_store(&config).await?;
    let queue = TaskQueueBuilder::new()
        .store(store)
        .config(config)
        .register_task::<HelloArgs, _>(HelloHandler::new(2), TaskOptions::new().retries(3))
        .register_task::<ReportArgs, _>(
            ReportHandler,
            TaskOptions::new()
                .strategy(ConcurrencyStrategy::Unique)
                .priority(5),
        )
        .register(
            "demo.ping",
            taskq_core::typed::FnHandler::new(|payload: Payload| async move {
                Ok::<_, HandlerError>(payload.to_json())
            }),
            TaskOptions::new(),
        )
        .expect_handlers(&[HelloArgs::KEY, ReportArgs::KEY, "demo.ping"])
        .build()?;

    queue
        .enqueue_task(&HelloArgs {
            name: "taskq".to_string(),
        })
        .await?;
    for account in ["acme", "acme", "globex"] {
        queue
            .enqueue_with(
                ReportArgs::KEY,
                ReportArgs {
                    account: account.to_string(),
                }
                .to_payload()?,
                EnqueueOptions::new().mutex(format!("report:{account}")),
            )
            .await?;
    }
    queue
        .enqueue("demo.ping", Payload::new().arg(1).kwarg("from", "demo"))
        .await?;

    let group = queue.spawn_workers();
    tracing::info!(workers = group.len(), "workers running, Ctrl-C to stop");

    tokio::select! {
        res = wait_until_drained(&queue) => res?,
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Interrupted");
        }
    }
    group.shutdown_and_join().await;

    for task in queue.tasks(true).await? {
        let runs = queue.runs(task.id).await?;
        let last = runs.last().and_then(|run| run.output.clone());
        tracing::info!(
            task_id = %task.id,
            handler = %task.handler,
            status = %task.status,
            runs = runs.len(),
            output = ?last,
            "task"
        );
    }
    let counts = queue.counts().await?;
    tracing::info!(?counts, "done");
    Ok(())
}
