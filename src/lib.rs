//! Process wiring for the batchflow service: open the database, run
//! migrations, recover stale work, start the worker pool and outbox pump,
//! and serve the ingress HTTP API (spec §4.9, §5, §6).

pub mod http;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use batchflow_actions::{
    BatchBuilder, CancelHandler, CheckDeliveryCompletionHandler, CreateProviderBatchHandler, DeleteExpiredHandler,
    DeliverHandler, DownloadAndParseHandler, DrainCapacityHandler, ExpireStaleBuildingBatchesHandler, OutboxPump,
    PollBatchStatusHandler, RedeliverHandler, Recovery, UploadHandler, WorkflowActions,
};
use batchflow_config::Settings;
use batchflow_filestore::BatchFileStore;
use batchflow_provider::{HttpAmqpPublisher, MessagePublisher, ProviderClient, ReqwestProviderClient};
use batchflow_queue::{JobQueue, WorkerPool};
use batchflow_store::Store;

/// Everything a running process needs, assembled once at startup and then
/// handed to the HTTP server and the background tasks.
#[derive(Clone)]
pub struct App {
    pub store: Store,
    pub queue: JobQueue,
    pub files: BatchFileStore,
    pub builder: Arc<BatchBuilder>,
    pub actions: WorkflowActions,
}

/// `DATABASE_URL` is deliberately outside `Settings`: the pool is opened
/// once at process start and is never part of the per-job hot-reload path.
pub async fn connect_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    Ok(PgPoolOptions::new().max_connections(20).connect(&database_url).await?)
}

pub async fn bootstrap(pool: sqlx::PgPool, settings: &Settings) -> anyhow::Result<App> {
    let store = Store::new(pool.clone());
    store.migrate().await?;

    let queue = JobQueue::new(pool);
    let files = BatchFileStore::new(settings.base_dir.clone(), settings.min_free_space_bytes);

    let provider: Arc<dyn ProviderClient> = Arc::new(ReqwestProviderClient::new(
        settings.provider_base_url.clone(),
        settings.provider_api_key.clone(),
        settings.webhook_read_timeout,
    )?);

    let http = reqwest::Client::builder()
        .connect_timeout(settings.webhook_connect_timeout)
        .timeout(settings.webhook_read_timeout)
        .build()?;
    let publisher: Arc<dyn MessagePublisher> =
        Arc::new(HttpAmqpPublisher::connect(http, settings.amqp_url.as_deref()).await?);

    let actions = WorkflowActions {
        store: store.clone(),
        files: files.clone(),
        provider,
        publisher,
        queue: queue.clone(),
    };
    let builder = Arc::new(BatchBuilder::new(store.clone(), files.clone()));

    Ok(App { store, queue, files, builder, actions })
}

/// Re-arms the job queue for every non-terminal batch left over from a
/// previous process (spec §4.7 C8).
pub async fn recover(app: &App) -> anyhow::Result<u64> {
    Ok(Recovery::recover_stale_work(&app.store, &app.queue).await?)
}

/// Registers every job kind's handler and starts the bounded worker pool
/// (spec §5). Runs until `shutdown` reports `true`.
pub fn spawn_worker_pool(app: &App, settings: &Settings, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let mut pool = WorkerPool::new(app.queue.clone(), worker_id(), settings.default_queue_concurrency);

    macro_rules! register {
        ($kind:expr, $handler:ident) => {
            pool.register($kind, settings.concurrency_for($kind), Arc::new($handler(app.actions.clone())));
        };
    }
    register!("upload", UploadHandler);
    register!("create_provider_batch", CreateProviderBatchHandler);
    register!("poll_batch_status", PollBatchStatusHandler);
    register!("download_and_parse", DownloadAndParseHandler);
    register!("deliver", DeliverHandler);
    register!("check_delivery_completion", CheckDeliveryCompletionHandler);
    register!("redeliver", RedeliverHandler);
    register!("cancel", CancelHandler);
    register!("delete_expired", DeleteExpiredHandler);
    register!("drain_capacity", DrainCapacityHandler);
    register!("expire_stale_building_batches", ExpireStaleBuildingBatchesHandler);

    tokio::spawn(async move { pool.run(shutdown).await })
}

pub fn spawn_outbox_pump(
    app: &App,
    eventing: Arc<batchflow_actions::Eventing>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let pump = OutboxPump::new(app.store.clone(), app.queue.clone(), eventing);
    tokio::spawn(async move { pump.run(shutdown).await })
}

fn worker_id() -> String {
    format!("{}-{}", hostname(), uuid::Uuid::new_v4())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "batchflow".to_string())
}
