use std::sync::Arc;

use slot_watcher::api;
use slot_watcher::config::ServiceConfig;
use slot_watcher::manager::{BroadcastHub, WorkerCommand, WorkerManager};
use slot_watcher::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env()?;

    eprintln!("📅 Slot Watcher v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/clients", config.port);
    eprintln!("   Status WS: ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   Worker: {}", config.worker_bin.display());
    if config.dry_run {
        eprintln!("   Dry run: workers will not book");
    }
    eprintln!();

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    // ── Manager ──────────────────────────────────────────────────────────
    let mut command = WorkerCommand::new(&config.worker_bin).with_dry_run(config.dry_run);
    if let Some(filter) = &config.worker_log_filter {
        command = command.with_env("RUST_LOG", filter.as_str());
    }
    let hub = Arc::new(BroadcastHub::new());
    let manager = WorkerManager::new(db, hub, command);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(manager.clone(), config.static_dir.as_deref());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    tracing::info!("Server closed");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop every worker and release observers.
async fn shutdown_signal(manager: WorkerManager) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }

    manager.stop_all().await;
    manager.hub().disconnect_all().await;
}
