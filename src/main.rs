mod api;
mod clients;
mod collectors;
mod config;
mod daemon;
mod error;
mod health;
mod rate_limit;
mod storage;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::clients::{ClobClient, GammaClient};
use crate::collectors::{
    BookCollector, Collector, MetadataCollector, PriceCollector, ResolutionCollector,
};
use crate::config::Config;
use crate::daemon::Daemon;
use crate::error::{AppError, Result};
use crate::health::HealthRegistry;
use crate::rate_limit::RateLimiter;
use crate::storage::Storage;
use crate::stream::{TradeListener, TRADE_LISTENER_UNIT};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready");

    let storage = Arc::new(Storage::new(pool));
    let gamma = Arc::new(GammaClient::new(cfg.gamma_api_url.clone())?);
    let clob = Arc::new(ClobClient::new(cfg.clob_api_url.clone())?);
    let limiter = Arc::new(RateLimiter::new());

    // --- Bootstrap: one metadata sync so every other unit starts against a
    // populated market catalog. Failure here is fatal.
    let metadata = Arc::new(MetadataCollector::new(
        Arc::clone(&gamma),
        Arc::clone(&storage),
        Arc::clone(&limiter),
        Duration::from_secs(cfg.metadata_interval_secs),
    ));
    let upserted = metadata
        .collect_once()
        .await
        .map_err(|e| AppError::Bootstrap(format!("initial metadata sync failed: {e}")))?;
    info!(markets = upserted, "Bootstrap complete");

    // --- Supervised units ---
    let health = Arc::new(HealthRegistry::new());
    let daemon = Arc::new(Daemon::new(Arc::clone(&health)));

    daemon.add_collector(metadata).await;
    daemon
        .add_collector(Arc::new(PriceCollector::new(
            Arc::clone(&gamma),
            Arc::clone(&storage),
            Arc::clone(&limiter),
            Duration::from_secs(cfg.price_interval_secs),
        )))
        .await;
    daemon
        .add_collector(Arc::new(BookCollector::new(
            Arc::clone(&clob),
            Arc::clone(&storage),
            Arc::clone(&limiter),
            Duration::from_secs(cfg.book_interval_secs),
            cfg.book_markets_limit,
        )))
        .await;
    daemon
        .add_collector(Arc::new(ResolutionCollector::new(
            Arc::clone(&storage),
            Duration::from_secs(cfg.resolution_interval_secs),
        )))
        .await;

    // The listener rebuilds its token universe from the catalog on every
    // (re)start, so a restart also picks up newly listed markets.
    let listener_storage = Arc::clone(&storage);
    let listener_health = Arc::clone(&health);
    let ws_url = cfg.ws_url.clone();
    let stream_max_markets = cfg.stream_max_markets;
    daemon
        .add_stream(
            TRADE_LISTENER_UNIT,
            Arc::new(move |shutdown: watch::Receiver<bool>| {
                let storage = Arc::clone(&listener_storage);
                let health = Arc::clone(&listener_health);
                let ws_url = ws_url.clone();
                tokio::spawn(async move {
                    let markets = match storage.get_active_markets(stream_max_markets).await {
                        Ok(m) => m,
                        Err(e) => {
                            error!("trade listener could not load token universe: {e}");
                            return;
                        }
                    };
                    let universe: Vec<String> = markets
                        .into_iter()
                        .flat_map(|m| m.clob_token_ids)
                        .collect();
                    TradeListener::new(ws_url, storage, health, universe)
                        .run(shutdown)
                        .await;
                })
            }),
        )
        .await;

    // --- HTTP API server ---
    let app = router(ApiState { daemon: Arc::clone(&daemon) });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP API server error: {e}");
        }
    });

    // --- Run until signalled ---
    let supervisor = Arc::clone(&daemon);
    let supervisor_task = tokio::spawn(async move { supervisor.run().await });

    shutdown_signal().await;
    info!("Shutdown signal received");

    daemon.stop().await;
    supervisor_task.abort();
    let _ = supervisor_task.await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
