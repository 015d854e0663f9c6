mod config;
mod demo;
mod error;
mod handlers;
mod models;
mod router;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use config::Config;
use market_data::{run_ingress, Engine, SubscriberHub};
use persistence::{SqliteStore, SwapStore};
use router::create_router;
use state::AppState;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if config.dedupe_ttl_raised {
        tracing::warn!("DEDUPE_TTL shorter than the 24h window, raised to 24h");
    }
    tracing::info!(
        store = %config.store_path.display(),
        addr = %config.http_addr,
        dedupe_ttl_secs = config.dedupe_ttl.as_secs(),
        "Starting swap stats service"
    );

    // Without the store nothing can be deduplicated; refuse to start.
    let store = Arc::new(
        SqliteStore::open(&config.store_path, config.dedupe_ttl)
            .with_context(|| format!("opening store at {}", config.store_path.display()))?,
    );
    store.ping().await.context("store health check")?;

    let (hub, reaper) = SubscriberHub::new(config.dead_queue_capacity);
    let engine = Arc::new(
        Engine::new(store.clone() as Arc<dyn SwapStore>).with_publisher(Arc::new(hub.clone())),
    );

    match engine.load().await {
        Ok(tokens) => tracing::info!(tokens, "Restored window state"),
        Err(e) => tracing::error!(error = %e, "Failed to restore window state, starting empty"),
    }
    match store.last_event_id().await {
        Ok(Some(id)) => tracing::info!(last_event_id = %id, "Last checkpointed event"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Could not read event checkpoint"),
    }

    let cancel = CancellationToken::new();

    tokio::spawn(reaper.run());
    tokio::spawn(purge_dedupe_markers(
        store.clone() as Arc<dyn SwapStore>,
        config.dedupe_purge_interval,
        cancel.clone(),
    ));

    let (tx, rx) = mpsc::channel(config.event_buffer);
    let ingress = tokio::spawn(run_ingress(Arc::clone(&engine), rx, cancel.clone()));
    if config.demo_producer {
        tokio::spawn(demo::run_demo_producer(tx, config.demo_interval, cancel.clone()));
    } else {
        drop(tx);
    }

    let state = AppState::new(engine, hub, config.ws_keepalive);
    let app = create_router(state);

    let listener = TcpListener::bind(config.http_addr).await?;
    tracing::info!("Listening on {}", config.http_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Err(e) = ingress.await {
        tracing::warn!(error = %e, "Ingress task ended abnormally");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn purge_dedupe_markers(
    store: Arc<dyn SwapStore>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store.purge_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Purged expired dedup markers"),
            Err(e) => tracing::warn!(error = %e, "Dedup marker purge failed"),
        }
    }
}

async fn shutdown_signal() {
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "Shutdown signal received"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "Shutdown signal received"),
    }
}
