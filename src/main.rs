//! batchflow: durable orchestration service for provider-native batch
//! inference (spec §1, §2).

use std::sync::Arc;

use batchflow::{bootstrap, connect_pool, recover, spawn_outbox_pump, spawn_worker_pool};
use batchflow_actions::Eventing;
use batchflow_config::{load_settings, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    init_tracing(settings.log_format);

    let pool = connect_pool().await?;
    let app = bootstrap(pool, &settings).await?;

    let recovered = recover(&app).await?;
    tracing::info!(recovered, "startup recovery complete");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let eventing = Arc::new(Eventing::default());

    let worker_pool = spawn_worker_pool(&app, &settings, shutdown_rx.clone());
    let outbox_pump = spawn_outbox_pump(&app, eventing, shutdown_rx.clone());

    let listen_addr = std::env::var("BATCHFLOW_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(listen_addr, "batchflow listening");

    let router = batchflow::http::router(app, settings);
    let server = axum::serve(listener, router).with_graceful_shutdown(wait_for_ctrl_c());
    server.await?;

    let _ = shutdown_tx.send(true);
    let _ = worker_pool.await;
    let _ = outbox_pump.await;

    Ok(())
}

async fn wait_for_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
