// =============================================================================
// pulsefeed — Bybit linear market screener with breadth index
// =============================================================================
//
// Startup order matters: persistence is opened and the index history
// restored first, then the cold-start loader seeds the full market state,
// and only then do the live subsystems (ingestion workers, broadcaster,
// index aggregator, downstream server) come up. Shutdown cancels them in
// the reverse dependency order and releases persistence last.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bootstrap;
mod bybit;
mod config;
mod index;
mod market;
mod persist;
mod types;

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ClientRegistry;
use crate::app_state::AppState;
use crate::bybit::BybitClient;
use crate::config::Settings;
use crate::market::MarketStore;
use crate::persist::CandleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        pulsefeed — Starting Up                          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Settings::load("pulsefeed.json");
    info!(
        bind = %settings.bind_addr,
        quote = %settings.quote_coin,
        debounce_ms = settings.debounce_ms,
        "configuration resolved"
    );

    // ── 2. Persistence & index history ───────────────────────────────────
    let store = Arc::new(MarketStore::new());
    let persist = Arc::new(CandleStore::connect(&settings.redis_url).await);
    info!(durable = persist.is_durable(), "persistence ready");
    store.restore_index(persist.load().await);

    // ── 3. Cold start ────────────────────────────────────────────────────
    let client = BybitClient::new();
    bootstrap::run_cold_start(&client, &store, &settings).await?;

    // ── 4. Downstream server ─────────────────────────────────────────────
    let registry = Arc::new(ClientRegistry::new());
    let app_state = Arc::new(AppState::new(
        settings.clone(),
        store.clone(),
        registry.clone(),
    ));
    let bind_addr = settings.bind_addr.clone();
    let server = tokio::spawn(async move {
        let app = api::ws::router(app_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind downstream server");
        info!(addr = %bind_addr, "downstream server listening");
        axum::serve(listener, app)
            .await
            .expect("downstream server failed");
    });

    // ── 5. Ingestion workers ─────────────────────────────────────────────
    let topics = bybit::stream::build_topics(&store.symbols());
    let buckets = bybit::stream::partition_topics(topics, bybit::stream::MAX_TOPICS_PER_CONN);
    info!(workers = buckets.len(), "launching ingestion workers");

    let mut workers = Vec::with_capacity(buckets.len());
    for (worker_id, bucket) in buckets.into_iter().enumerate() {
        let store = store.clone();
        workers.push(tokio::spawn(bybit::stream::run_ingest_worker(
            worker_id, bucket, store,
        )));
    }

    // ── 6. Broadcaster & index aggregator ────────────────────────────────
    let broadcaster = tokio::spawn(api::broadcast::run_broadcaster(
        store.clone(),
        registry.clone(),
        Duration::from_millis(settings.debounce_ms),
    ));
    let aggregator = tokio::spawn(index::aggregator::run_index_aggregator(
        store.clone(),
        persist.clone(),
        settings.index_poll_secs,
    ));

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    broadcaster.abort();
    aggregator.abort();
    for worker in &workers {
        worker.abort();
    }
    server.abort();
    persist.close().await;

    info!("pulsefeed shut down complete");
    Ok(())
}
