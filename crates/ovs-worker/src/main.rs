//! ovs-worker entry point: the poll loop plus a tiny health listener.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use tracing::{error, info};

use ovs_config::Settings;
use ovs_worker::WorkerOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = Settings::from_env().context("load settings")?;
    let pool = ovs_db::connect(&settings.database_url).await?;
    ovs_db::migrate(&pool).await?;

    tokio::spawn(serve_health(health_addr_from_env()));

    let poll_interval = settings.worker.poll_interval;
    let orchestrator = WorkerOrchestrator::new(pool, settings);
    info!(poll_interval_seconds = poll_interval.as_secs(), "worker started");

    loop {
        match orchestrator.process_next_run().await {
            Ok(true) => info!("worker cycle processed run"),
            Ok(false) => info!("worker heartbeat"),
            Err(err) => error!(error = %format!("{err:#}"), "worker cycle failed"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn health_addr_from_env() -> SocketAddr {
    std::env::var("WORKER_HEALTH_ADDR")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8090)))
}

async fn serve_health(addr: SocketAddr) {
    let app = Router::new().route("/health", get(|| async { "ok\n" }));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "worker health listener started");
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "worker health listener crashed");
            }
        }
        Err(err) => error!(error = %err, %addr, "worker health listener failed to bind"),
    }
}
