// =============================================================================
// Cold-start loader — seed the store before any live ingestion begins
// =============================================================================
//
// Ordering matters: the instrument universe defines which symbols exist, the
// ticker snapshot gives every entry a starting price, and the two most recent
// candles per (symbol, timeframe) seed the prev-close table plus the live
// metric. Ingestion workers are only spawned after this completes; the
// service must not run with an unseeded state, so any terminal REST failure
// aborts startup.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use tracing::info;

use crate::bybit::BybitClient;
use crate::config::Settings;
use crate::market::{KlineCandle, MarketStore};
use crate::types::Timeframe;

/// Instrument status required for inclusion in the universe.
const TRADING_STATUS: &str = "Trading";
/// Candles fetched per (symbol, timeframe): the closed one and the live one.
const SEED_KLINE_LIMIT: u32 = 2;

pub async fn run_cold_start(
    client: &BybitClient,
    store: &Arc<MarketStore>,
    settings: &Settings,
) -> Result<()> {
    // ── 1. Instrument universe ──────────────────────────────────────────
    let instruments = client
        .instruments()
        .await
        .context("cold start: instruments fetch failed")?;

    for inst in &instruments {
        if inst.quote_coin == settings.quote_coin && inst.status == TRADING_STATUS {
            store.seed_entry(&inst.symbol, &inst.base_coin, &inst.quote_coin);
        }
    }
    let symbols = store.symbols();
    if symbols.is_empty() {
        anyhow::bail!(
            "cold start: no {} instruments in {} status",
            settings.quote_coin,
            TRADING_STATUS
        );
    }
    info!(
        fetched = instruments.len(),
        tracked = symbols.len(),
        quote = %settings.quote_coin,
        "instrument universe selected"
    );

    // ── 2. Ticker snapshot ──────────────────────────────────────────────
    let tickers = client
        .tickers()
        .await
        .context("cold start: tickers fetch failed")?;
    for ticker in &tickers {
        // Unknown symbols (non-universe contracts) no-op inside the store.
        store.apply_ticker(&ticker.symbol, ticker.last_price, ticker.ts);
    }
    info!(count = tickers.len(), "ticker snapshot seeded");

    // ── 3. Candle seeding, bounded concurrency ──────────────────────────
    let pairs: Vec<(String, Timeframe)> = symbols
        .iter()
        .flat_map(|s| Timeframe::ALL.iter().map(move |&tf| (s.clone(), tf)))
        .collect();
    let total = pairs.len();

    let results: Vec<Result<()>> = stream::iter(pairs)
        .map(|(symbol, tf)| {
            let client = client.clone();
            let store = store.clone();
            async move {
                let candles = client
                    .recent_klines(&symbol, tf, SEED_KLINE_LIMIT)
                    .await
                    .with_context(|| format!("cold start: kline fetch {symbol}/{tf} failed"))?;
                seed_klines(&store, &symbol, tf, &candles);
                Ok(())
            }
        })
        .buffer_unordered(settings.kline_seed_concurrency.max(1))
        .collect()
        .await;

    for result in results {
        result?;
    }

    // ── 4. First overview ───────────────────────────────────────────────
    store.recompute_overview();
    info!(symbols = symbols.len(), series = total, "cold start complete");
    Ok(())
}

/// Seed one (symbol, timeframe) series from its most recent candles, assumed
/// sorted ascending by start. With two candles the earlier one's close
/// becomes the prev-close and the later one becomes the live metric; with
/// one candle the prev-close stays unknown.
pub(crate) fn seed_klines(
    store: &MarketStore,
    symbol: &str,
    tf: Timeframe,
    candles: &[KlineCandle],
) {
    match candles {
        [] => {}
        [only] => store.apply_kline(symbol, tf, only, false),
        [.., prev, last] => {
            store.seed_prev_close(symbol, tf, prev.close);
            store.apply_kline(symbol, tf, last, false);
        }
    }
}
