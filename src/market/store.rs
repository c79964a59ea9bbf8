// =============================================================================
// Market state store — the single mutable hub of the service
// =============================================================================
//
// Canonical in-memory view of every tracked contract: per-symbol entries with
// one metric slot per timeframe, the per-(symbol, timeframe) prev-close
// table, the per-timeframe gainer/loser overview, and the breadth index
// state. Everything sits behind one mutex; every operation does only
// in-memory work under the lock and never suspends while holding it.
//
// Mutations mark the store dirty; the broadcaster coalesces any number of
// dirty marks into one debounced snapshot push.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::index::state::{d1_stat, IndexCandle, IndexState, IndexSummary, TickOutcome};
use crate::market::candle::KlineCandle;
use crate::types::{now_ms, Timeframe};

// =============================================================================
// Serialisable state types
// =============================================================================

/// Per-(symbol, timeframe) price-change metrics for the current candle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TfMetric {
    pub timeframe: Timeframe,
    /// Start of the current (possibly open) candle.
    pub open_time: i64,
    pub open_price: Option<f64>,
    /// Always equals `open_price`; kept as its own field in the wire format.
    pub baseline_price: Option<f64>,
    /// Close of the candle immediately preceding `open_time`, when known.
    pub prev_close: Option<f64>,
    pub change_percent: Option<f64>,
    pub close_to_close_percent: Option<f64>,
    pub volume: f64,
    pub turnover: f64,
    pub updated_at: i64,
}

impl TfMetric {
    fn empty(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            open_time: 0,
            open_price: None,
            baseline_price: None,
            prev_close: None,
            change_percent: None,
            close_to_close_percent: None,
            volume: 0.0,
            turnover: 0.0,
            updated_at: 0,
        }
    }
}

/// One tracked contract. Identity fields are immutable after cold start; the
/// metrics map always holds exactly one slot per timeframe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    pub last_price: Option<f64>,
    pub last_price_updated_at: i64,
    pub metrics: BTreeMap<Timeframe, TfMetric>,
}

impl Entry {
    fn new(symbol: String, base_coin: String, quote_coin: String) -> Self {
        let metrics = Timeframe::ALL
            .iter()
            .map(|&tf| (tf, TfMetric::empty(tf)))
            .collect();
        Self {
            symbol,
            base_coin,
            quote_coin,
            last_price: None,
            last_price_updated_at: 0,
            metrics,
        }
    }
}

/// Gainer/loser counts for one timeframe across the whole universe.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewRow {
    pub timeframe: Timeframe,
    pub gainers: usize,
    pub losers: usize,
}

/// Full serialised state pushed to every downstream client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub entries: Vec<Entry>,
    pub overview: Vec<OverviewRow>,
    pub index_summary: IndexSummary,
    pub index_history: Vec<IndexCandle>,
    pub updated_at: i64,
}

// =============================================================================
// MarketStore
// =============================================================================

struct StoreInner {
    entries: BTreeMap<String, Entry>,
    prev_close: HashMap<(String, Timeframe), f64>,
    overview: BTreeMap<Timeframe, OverviewRow>,
    index: IndexState,
}

impl StoreInner {
    fn new() -> Self {
        let overview = Timeframe::ALL
            .iter()
            .map(|&tf| {
                (
                    tf,
                    OverviewRow {
                        timeframe: tf,
                        gainers: 0,
                        losers: 0,
                    },
                )
            })
            .collect();
        Self {
            entries: BTreeMap::new(),
            prev_close: HashMap::new(),
            overview,
            index: IndexState::new(),
        }
    }
}

/// Shared market state. All async tasks hold `Arc<MarketStore>`.
pub struct MarketStore {
    inner: Mutex<StoreInner>,
    dirty: AtomicBool,
    dirty_notify: Notify,
}

impl MarketStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::new()),
            dirty: AtomicBool::new(false),
            dirty_notify: Notify::new(),
        }
    }

    // ── Cold-start seeding ──────────────────────────────────────────────

    /// Register a contract. First registration wins; repeats are ignored so
    /// duplicate instrument rows cannot reset live metrics.
    pub fn seed_entry(&self, symbol: &str, base_coin: &str, quote_coin: &str) {
        let mut inner = self.inner.lock();
        inner
            .entries
            .entry(symbol.to_string())
            .or_insert_with(|| Entry::new(symbol.into(), base_coin.into(), quote_coin.into()));
    }

    /// Seed the prev-close table from a cold-start candle fetch.
    pub fn seed_prev_close(&self, symbol: &str, tf: Timeframe, close: f64) {
        let mut inner = self.inner.lock();
        inner.prev_close.insert((symbol.to_string(), tf), close);
    }

    // ── Live mutation ───────────────────────────────────────────────────

    /// Apply a ticker update. Unknown symbols are a no-op.
    pub fn apply_ticker(&self, symbol: &str, last_price: Option<f64>, ts: Option<i64>) {
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(symbol) else {
                return;
            };
            if let Some(price) = last_price {
                entry.last_price = Some(price);
            }
            entry.last_price_updated_at = ts.unwrap_or_else(now_ms);
        }
        self.mark_dirty();
    }

    /// Apply a kline update to one (symbol, timeframe) metric slot.
    ///
    /// On a confirmed candle the prev-close table is written after the metric
    /// update, so the next incoming open candle reads the just-closed value.
    /// Unknown symbols are a no-op.
    pub fn apply_kline(&self, symbol: &str, tf: Timeframe, candle: &KlineCandle, confirmed: bool) {
        {
            let mut inner = self.inner.lock();
            if !inner.entries.contains_key(symbol) {
                return;
            }
            let prev_close = inner.prev_close.get(&(symbol.to_string(), tf)).copied();

            let entry = inner
                .entries
                .get_mut(symbol)
                .expect("presence checked above");
            let metric = entry
                .metrics
                .get_mut(&tf)
                .expect("every timeframe slot exists");

            metric.open_time = candle.start;
            metric.open_price = Some(candle.open);
            metric.baseline_price = Some(candle.open);
            metric.prev_close = prev_close;
            metric.change_percent = if candle.open > 0.0 {
                Some((candle.close - candle.open) / candle.open * 100.0)
            } else {
                None
            };
            metric.close_to_close_percent = prev_close
                .filter(|pc| *pc > 0.0)
                .map(|pc| (candle.close - pc) / pc * 100.0);
            metric.volume = candle.volume;
            metric.turnover = candle.turnover;
            metric.updated_at = now_ms();

            if confirmed {
                inner
                    .prev_close
                    .insert((symbol.to_string(), tf), candle.close);
            }
        }
        self.mark_dirty();
    }

    /// Rebuild the six overview rows from a full entry scan. Called before
    /// each snapshot build rather than on every mutation.
    pub fn recompute_overview(&self) {
        let mut inner = self.inner.lock();
        let mut rows: BTreeMap<Timeframe, OverviewRow> = Timeframe::ALL
            .iter()
            .map(|&tf| {
                (
                    tf,
                    OverviewRow {
                        timeframe: tf,
                        gainers: 0,
                        losers: 0,
                    },
                )
            })
            .collect();

        for entry in inner.entries.values() {
            for (tf, metric) in &entry.metrics {
                let Some(change) = metric.change_percent else {
                    continue;
                };
                let row = rows.get_mut(tf).expect("row per timeframe");
                if change > 0.0 {
                    row.gainers += 1;
                } else if change < 0.0 {
                    row.losers += 1;
                }
            }
        }
        inner.overview = rows;
    }

    /// Consistent point-in-time copy of the whole state. Holds the lock for
    /// the entire build; all work is in-memory copying.
    pub fn build_snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            entries: inner.entries.values().cloned().collect(),
            overview: inner.overview.values().copied().collect(),
            index_summary: inner.index.summary(),
            index_history: inner.index.export_history(),
            updated_at: now_ms(),
        }
    }

    // ── Index integration ───────────────────────────────────────────────

    /// Replace the index state from persisted history at startup.
    pub fn restore_index(&self, candles: Vec<IndexCandle>) {
        let mut inner = self.inner.lock();
        inner.index = IndexState::restore(candles);
    }

    /// Compute the D1 cross-sectional statistic and advance the index bucket
    /// under one lock acquisition. Returns the tick outcome so the caller
    /// can persist a frozen candle outside the lock.
    pub fn apply_index_tick(&self, now: i64, force: bool) -> TickOutcome {
        let mut inner = self.inner.lock();
        let stat = d1_stat(
            inner
                .entries
                .values()
                .filter_map(|e| e.metrics.get(&Timeframe::D1))
                .filter_map(|m| m.change_percent)
                .filter(|c| c.is_finite()),
        );
        inner.index.tick(now, force, &stat)
    }

    // ── Dirty signal ────────────────────────────────────────────────────

    /// Flag that state changed. Any number of marks between broadcasts
    /// coalesce into one wake-up.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.dirty_notify.notify_one();
    }

    /// Wait until the store is dirty. Wakes spuriously only to re-check the
    /// flag, never returns while it is clear.
    pub async fn wait_dirty(&self) {
        loop {
            if self.dirty.load(Ordering::SeqCst) {
                return;
            }
            self.dirty_notify.notified().await;
        }
    }

    /// Clear the dirty flag. The broadcaster calls this before building a
    /// snapshot so mutations racing the build schedule a follow-up.
    pub fn clear_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }
}

impl Default for MarketStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(start: i64, open: f64, close: f64) -> KlineCandle {
        KlineCandle {
            start,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            turnover: close,
            confirm: false,
        }
    }

    fn seeded_store() -> MarketStore {
        let store = MarketStore::new();
        store.seed_entry("XUSDT", "X", "USDT");
        store
    }

    fn metric(store: &MarketStore, symbol: &str, tf: Timeframe) -> TfMetric {
        let inner = store.inner.lock();
        inner.entries[symbol].metrics[&tf].clone()
    }

    #[test]
    fn every_entry_has_all_timeframe_slots() {
        let store = seeded_store();
        let inner = store.inner.lock();
        let entry = &inner.entries["XUSDT"];
        assert_eq!(entry.metrics.len(), Timeframe::ALL.len());
        for tf in Timeframe::ALL {
            assert_eq!(entry.metrics[&tf].timeframe, tf);
        }
    }

    #[test]
    fn seed_entry_first_registration_wins() {
        let store = seeded_store();
        store.apply_ticker("XUSDT", Some(10.0), Some(5));
        store.seed_entry("XUSDT", "OTHER", "USDT");
        let inner = store.inner.lock();
        assert_eq!(inner.entries["XUSDT"].base_coin, "X");
        assert_eq!(inner.entries["XUSDT"].last_price, Some(10.0));
    }

    #[test]
    fn single_kline_scenario() {
        let store = seeded_store();
        store.apply_kline("XUSDT", Timeframe::M5, &kline(0, 100.0, 110.0), false);

        let m = metric(&store, "XUSDT", Timeframe::M5);
        assert_eq!(m.change_percent, Some(10.0));
        assert_eq!(m.prev_close, None);
        assert_eq!(m.close_to_close_percent, None);
        assert_eq!(m.open_price, m.baseline_price);

        store.recompute_overview();
        let snapshot = store.build_snapshot();
        let row = snapshot
            .overview
            .iter()
            .find(|r| r.timeframe == Timeframe::M5)
            .unwrap();
        assert_eq!(row.gainers, 1);
        assert_eq!(row.losers, 0);
    }

    #[test]
    fn prev_close_seeding_scenario() {
        let store = seeded_store();
        store.seed_prev_close("XUSDT", Timeframe::M5, 100.0);
        store.apply_kline("XUSDT", Timeframe::M5, &kline(300_000, 105.0, 107.0), false);

        let m = metric(&store, "XUSDT", Timeframe::M5);
        assert_eq!(m.open_time, 300_000);
        assert_eq!(m.prev_close, Some(100.0));
        let ctc = m.close_to_close_percent.unwrap();
        assert!((ctc - 7.0).abs() < 1e-9);
    }

    #[test]
    fn confirm_rolls_prev_close() {
        let store = seeded_store();
        store.apply_kline("XUSDT", Timeframe::M5, &kline(0, 100.0, 120.0), true);
        store.apply_kline("XUSDT", Timeframe::M5, &kline(300_000, 120.0, 126.0), false);

        let m = metric(&store, "XUSDT", Timeframe::M5);
        assert!((m.change_percent.unwrap() - 5.0).abs() < 1e-9);
        assert!((m.close_to_close_percent.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(m.prev_close, Some(120.0));
    }

    #[test]
    fn apply_is_idempotent() {
        // Re-applying the same live candle must not move the metric. A
        // confirmed candle is excluded here: its close rolls into the
        // prev-close table, which is the confirm/roll behaviour instead.
        let store = seeded_store();
        let candle = kline(0, 100.0, 103.0);
        store.apply_kline("XUSDT", Timeframe::H1, &candle, false);
        let first = metric(&store, "XUSDT", Timeframe::H1);
        store.apply_kline("XUSDT", Timeframe::H1, &candle, false);
        let second = metric(&store, "XUSDT", Timeframe::H1);

        assert_eq!(first.open_time, second.open_time);
        assert_eq!(first.open_price, second.open_price);
        assert_eq!(first.change_percent, second.change_percent);
        assert_eq!(first.close_to_close_percent, second.close_to_close_percent);
        assert_eq!(first.volume, second.volume);
    }

    #[test]
    fn later_kline_overwrites_earlier() {
        let store = seeded_store();
        store.apply_kline("XUSDT", Timeframe::M1, &kline(0, 100.0, 101.0), false);
        store.apply_kline("XUSDT", Timeframe::M1, &kline(60_000, 200.0, 190.0), false);

        let m = metric(&store, "XUSDT", Timeframe::M1);
        assert_eq!(m.open_time, 60_000);
        assert_eq!(m.open_price, Some(200.0));
        assert!((m.change_percent.unwrap() + 5.0).abs() < 1e-9);
    }

    #[test]
    fn zero_open_yields_no_change_percent() {
        let store = seeded_store();
        store.apply_kline("XUSDT", Timeframe::M1, &kline(0, 0.0, 5.0), false);
        let m = metric(&store, "XUSDT", Timeframe::M1);
        assert_eq!(m.change_percent, None);
    }

    #[test]
    fn close_to_close_requires_positive_prev_close() {
        let store = seeded_store();
        store.seed_prev_close("XUSDT", Timeframe::M1, 0.0);
        store.apply_kline("XUSDT", Timeframe::M1, &kline(0, 1.0, 2.0), false);
        let m = metric(&store, "XUSDT", Timeframe::M1);
        assert_eq!(m.prev_close, Some(0.0));
        assert_eq!(m.close_to_close_percent, None);
    }

    #[test]
    fn unknown_symbol_is_noop() {
        let store = seeded_store();
        store.clear_dirty();
        store.apply_ticker("NOPEUSDT", Some(1.0), None);
        store.apply_kline("NOPEUSDT", Timeframe::M1, &kline(0, 1.0, 2.0), true);
        assert_eq!(store.entry_count(), 1);
        assert!(!store.clear_dirty());
    }

    #[test]
    fn ticker_updates_price_and_timestamp() {
        let store = seeded_store();
        store.apply_ticker("XUSDT", Some(42.5), Some(1_700_000_000_000));
        {
            let inner = store.inner.lock();
            let entry = &inner.entries["XUSDT"];
            assert_eq!(entry.last_price, Some(42.5));
            assert_eq!(entry.last_price_updated_at, 1_700_000_000_000);
        }
        // Price absent: keep the old price, refresh the timestamp.
        store.apply_ticker("XUSDT", None, Some(1_700_000_000_500));
        let inner = store.inner.lock();
        let entry = &inner.entries["XUSDT"];
        assert_eq!(entry.last_price, Some(42.5));
        assert_eq!(entry.last_price_updated_at, 1_700_000_000_500);
    }

    #[test]
    fn overview_counts_match_change_signs() {
        let store = MarketStore::new();
        for (sym, open, close) in [
            ("AUSDT", 100.0, 110.0),
            ("BUSDT", 100.0, 95.0),
            ("CUSDT", 100.0, 100.0),
            ("DUSDT", 0.0, 5.0),
        ] {
            store.seed_entry(sym, &sym[..1], "USDT");
            store.apply_kline(sym, Timeframe::D1, &kline(0, open, close), false);
        }
        store.recompute_overview();
        let snapshot = store.build_snapshot();
        let row = snapshot
            .overview
            .iter()
            .find(|r| r.timeframe == Timeframe::D1)
            .unwrap();
        // CUSDT has zero change, DUSDT has undefined change: neither counts.
        assert_eq!(row.gainers, 1);
        assert_eq!(row.losers, 1);
        assert_eq!(snapshot.overview.len(), Timeframe::ALL.len());
    }

    #[test]
    fn mutations_mark_dirty_and_clear_resets() {
        let store = seeded_store();
        store.clear_dirty();
        store.apply_ticker("XUSDT", Some(1.0), None);
        assert!(store.clear_dirty());
        assert!(!store.clear_dirty());
    }

    #[tokio::test]
    async fn burst_of_marks_coalesces_into_one_wakeup() {
        let store = std::sync::Arc::new(seeded_store());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_dirty().await })
        };

        // A burst of updates within one debounce window.
        for i in 0..100i64 {
            store.apply_ticker("XUSDT", Some(100.0 + i as f64), Some(i));
        }
        waiter.await.expect("waiter task");

        // One clear drains the whole burst, and the snapshot carries the
        // last applied price.
        assert!(store.clear_dirty());
        assert!(!store.clear_dirty());
        let snapshot = store.build_snapshot();
        assert_eq!(snapshot.entries[0].last_price, Some(199.0));
    }

    #[test]
    fn index_tick_uses_d1_changes_only() {
        let store = MarketStore::new();
        for (sym, close) in [("AUSDT", 104.0), ("BUSDT", 98.0), ("CUSDT", 100.0)] {
            store.seed_entry(sym, &sym[..1], "USDT");
            store.apply_kline(sym, Timeframe::D1, &kline(0, 100.0, close), false);
            // H1 moves must not leak into the D1 statistic.
            store.apply_kline(sym, Timeframe::H1, &kline(0, 100.0, 150.0), false);
        }
        let outcome = store.apply_index_tick(30_000, true);
        assert!(outcome.updated);

        let snapshot = store.build_snapshot();
        let summary = snapshot.index_summary;
        // positive 4, negative 2, count 3 => net = -2/3, latest = 2/3.
        assert_eq!(summary.count, 3);
        assert!((summary.positive_sum - 4.0).abs() < 1e-9);
        assert!((summary.negative_sum - 2.0).abs() < 1e-9);
        assert!((summary.latest - 0.6667).abs() < 1e-9);
    }

    #[test]
    fn snapshot_json_shape() {
        let store = seeded_store();
        store.apply_ticker("XUSDT", Some(7.0), Some(1));
        store.recompute_overview();
        let json = serde_json::to_value(store.build_snapshot()).unwrap();

        assert!(json["entries"].is_array());
        assert_eq!(json["overview"].as_array().unwrap().len(), 6);
        assert_eq!(json["indexSummary"]["slotDuration"], 3_600_000);
        assert!(json["indexHistory"].is_array());
        assert!(json["updatedAt"].is_i64());

        let entry = &json["entries"][0];
        assert_eq!(entry["symbol"], "XUSDT");
        assert_eq!(entry["lastPrice"], 7.0);
        // Metric slots are keyed by timeframe label with null optionals.
        assert!(entry["metrics"]["1m"]["openPrice"].is_null());
        assert_eq!(entry["metrics"]["1d"]["timeframe"], "1d");
    }
}
