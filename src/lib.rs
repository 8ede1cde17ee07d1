//! meshtest -- throughput test orchestration for mesh networks.
//!
//! This crate provides the core library for scheduling network test
//! campaigns, driving traffic sessions through the control plane, and
//! recording per-session results.

pub mod api;
pub mod config;
pub mod controlplane;
pub mod network_test;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::MeshtestConfig;
use crate::controlplane::HttpControlPlane;

/// Start the meshtest daemon: recovery, schedule tasks, and API server.
pub async fn serve(config: &MeshtestConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.database.path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let pool = storage::open_pool(db_path)?;

    // 2. Initialize Scheduler and reconcile leftovers from the last run
    let control_plane = Arc::new(HttpControlPlane::new(&config.control_plane)?);
    let scheduler = scheduler::Scheduler::new(pool, control_plane);
    scheduler.restart().await?;

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let app = api::router(api::state::AppState::new(scheduler.clone()));

    tracing::info!(%addr, "meshtest listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 4. Stop schedule tasks and live executions
    scheduler.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
