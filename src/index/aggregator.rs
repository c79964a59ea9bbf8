// =============================================================================
// Index aggregator — periodic D1 breadth computation and bucket persistence
// =============================================================================
//
// Once per minute (and once at startup with `force` set) the aggregator
// computes the D1 cross-sectional statistic, advances the hourly bucket, and
// hands any freshly frozen bucket to the persistence adapter. Persistence
// happens outside the store lock.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::market::store::MarketStore;
use crate::persist::CandleStore;
use crate::types::now_ms;

/// Run the aggregator until cancelled.
pub async fn run_index_aggregator(
    store: Arc<MarketStore>,
    persist: Arc<CandleStore>,
    poll_secs: u64,
) {
    info!(poll_secs, "index aggregator starting");

    // Forced startup tick so a bucket exists before the first minute elapses.
    tick_once(&store, &persist, now_ms(), true).await;

    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
    // The first interval tick fires immediately; the startup tick covered it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        tick_once(&store, &persist, now_ms(), false).await;
    }
}

/// One aggregator tick at time `now`.
pub async fn tick_once(store: &MarketStore, persist: &CandleStore, now: i64, force: bool) {
    let outcome = store.apply_index_tick(now, force);

    if let Some(frozen) = &outcome.frozen {
        info!(
            slot = frozen.start_time,
            close = frozen.close,
            count = frozen.count,
            "index bucket closed"
        );
        persist.put(frozen).await;
    }

    if outcome.updated || outcome.frozen.is_some() {
        store.mark_dirty();
        debug!(updated = outcome.updated, "index tick applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::state::SLOT_MS;
    use crate::market::candle::KlineCandle;
    use crate::types::Timeframe;

    fn store_with_d1_move(open: f64, close: f64) -> MarketStore {
        let store = MarketStore::new();
        store.seed_entry("XUSDT", "X", "USDT");
        let candle = KlineCandle {
            start: 0,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            turnover: close,
            confirm: false,
        };
        store.apply_kline("XUSDT", Timeframe::D1, &candle, false);
        store
    }

    #[tokio::test]
    async fn tick_marks_store_dirty_when_bucket_moves() {
        let store = store_with_d1_move(100.0, 105.0);
        let persist = CandleStore::memory();
        store.clear_dirty();

        tick_once(&store, &persist, 30_000, false).await;
        assert!(store.clear_dirty());

        // A +5% market move means the bearishness index closes at +5.
        let summary = store.build_snapshot().index_summary;
        assert!((summary.latest - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn idle_tick_stays_quiet() {
        let store = MarketStore::new();
        let persist = CandleStore::memory();
        store.clear_dirty();

        tick_once(&store, &persist, 30_000, false).await;
        assert!(!store.clear_dirty());
        assert!(store.build_snapshot().index_history.is_empty());
    }

    #[tokio::test]
    async fn rollover_survives_dead_backend() {
        let store = store_with_d1_move(100.0, 102.0);
        let persist = CandleStore::memory();

        tick_once(&store, &persist, SLOT_MS - 1_000, true).await;
        tick_once(&store, &persist, SLOT_MS + 1_000, false).await;

        let snapshot = store.build_snapshot();
        // One closed bucket plus the new active one, all in memory.
        assert_eq!(snapshot.index_history.len(), 2);
        assert_eq!(snapshot.index_history[0].start_time, 0);
        assert_eq!(snapshot.index_history[1].start_time, SLOT_MS);
    }
}
