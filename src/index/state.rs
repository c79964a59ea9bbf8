// =============================================================================
// Breadth index state — hourly OHLC buckets over the D1 change distribution
// =============================================================================
//
// The index measures market bearishness: netPercent is positive when
// decliners outweigh gainers, and the candle close is defined as -netPercent
// so that upward candle ticks correspond to a gaining market.
//
// All mutation happens through `tick`, which takes the current wall-clock
// time as a parameter so tests can drive a simulated clock.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Width of one index bucket in milliseconds (one hour).
pub const SLOT_MS: i64 = 3_600_000;
/// Index value before any bucket has closed.
pub const BASE_VALUE: f64 = 0.0;
/// Closed candles retained in memory.
pub const HISTORY_CAP: usize = 1000;
/// Closed candles exported per snapshot (plus the active candle).
pub const EXPORT_CAP: usize = 720;

/// Round to 4 decimal places, the precision of every exported index value.
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Data types
// =============================================================================

/// One hourly OHLC bucket of the breadth index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCandle {
    /// Slot start, always a multiple of [`SLOT_MS`].
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub net_percent: f64,
    #[serde(default)]
    pub positive_sum: f64,
    #[serde(default)]
    pub negative_sum: f64,
    #[serde(default)]
    pub count: usize,
}

/// Cross-sectional statistic over the universe's D1 change percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct D1Stat {
    /// Sum of positive changes.
    pub positive_sum: f64,
    /// Sum of absolute negative changes (always non-negative).
    pub negative_sum: f64,
    /// Number of contributing entries.
    pub count: usize,
}

impl D1Stat {
    /// `(negativeSum - positiveSum) / count`, 0 when no entry contributes.
    pub fn net_percent(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.negative_sum - self.positive_sum) / self.count as f64
        }
    }
}

/// Fold finite D1 change percentages into the cross-sectional statistic.
/// Zero changes contribute to the count but to neither sum.
pub fn d1_stat(changes: impl Iterator<Item = f64>) -> D1Stat {
    let mut stat = D1Stat::default();
    for change in changes {
        if change > 0.0 {
            stat.positive_sum += change;
        } else {
            stat.negative_sum += -change;
        }
        stat.count += 1;
    }
    stat
}

/// Index summary block included in every snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub latest: f64,
    pub base_value: f64,
    pub last_slot: i64,
    pub net_percent: f64,
    pub positive_sum: f64,
    pub negative_sum: f64,
    pub count: usize,
    pub slot_duration: i64,
}

/// Outcome of one aggregator tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Candle frozen out of the active slot this tick, to be persisted.
    pub frozen: Option<IndexCandle>,
    /// Whether any candle was created or updated.
    pub updated: bool,
}

// =============================================================================
// IndexState
// =============================================================================

/// Closed history plus at most one active bucket.
#[derive(Debug)]
pub struct IndexState {
    history: Vec<IndexCandle>,
    active: Option<IndexCandle>,
    prev_close_value: f64,
}

impl IndexState {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            active: None,
            prev_close_value: BASE_VALUE,
        }
    }

    /// Rebuild state from persisted candles. Rows are sorted by slot,
    /// de-duplicated keeping the last write per slot, and bounded to
    /// [`HISTORY_CAP`]; `prev_close_value` picks up the final close.
    pub fn restore(candles: Vec<IndexCandle>) -> Self {
        let mut by_slot = std::collections::BTreeMap::new();
        for candle in candles {
            by_slot.insert(candle.start_time, candle);
        }
        let mut history: Vec<IndexCandle> = by_slot.into_values().collect();
        if history.len() > HISTORY_CAP {
            history.drain(..history.len() - HISTORY_CAP);
        }
        let prev_close_value = history.last().map_or(BASE_VALUE, |c| c.close);
        Self {
            history,
            active: None,
            prev_close_value,
        }
    }

    /// Advance the index by one tick.
    ///
    /// Rolls the active bucket when `now` has crossed a slot boundary,
    /// creates a bucket on demand (unconditionally when `force` is set,
    /// otherwise only when the statistic has contributors), then folds the
    /// statistic into the active bucket.
    pub fn tick(&mut self, now: i64, force: bool, stat: &D1Stat) -> TickOutcome {
        let slot = now.div_euclid(SLOT_MS) * SLOT_MS;
        let mut outcome = TickOutcome::default();

        // Freeze an active bucket whose slot has passed.
        if let Some(active) = self.active.take() {
            if active.start_time < slot {
                self.prev_close_value = active.close;
                self.history.push(active.clone());
                if self.history.len() > HISTORY_CAP {
                    let excess = self.history.len() - HISTORY_CAP;
                    self.history.drain(..excess);
                }
                outcome.frozen = Some(active);
            } else {
                self.active = Some(active);
            }
        }

        if self.active.is_none() {
            if stat.count == 0 && !force {
                return outcome;
            }
            let open = round4(self.prev_close_value);
            self.active = Some(IndexCandle {
                start_time: slot,
                open,
                high: open,
                low: open,
                close: open,
                net_percent: 0.0,
                positive_sum: 0.0,
                negative_sum: 0.0,
                count: 0,
            });
        }

        let active = self.active.as_mut().expect("active candle exists here");
        let close = round4(-stat.net_percent());
        active.close = close;
        active.high = active.high.max(close).max(active.open);
        active.low = active.low.min(close).min(active.open);
        active.net_percent = stat.net_percent();
        active.positive_sum = stat.positive_sum;
        active.negative_sum = stat.negative_sum;
        active.count = stat.count;
        outcome.updated = true;

        outcome
    }

    /// Summary block for the snapshot. Statistics come from the active
    /// bucket when one exists, otherwise from the most recently closed one.
    pub fn summary(&self) -> IndexSummary {
        let current = self.active.as_ref().or_else(|| self.history.last());
        IndexSummary {
            latest: round4(current.map_or(self.prev_close_value, |c| c.close)),
            base_value: BASE_VALUE,
            last_slot: current.map_or(0, |c| c.start_time),
            net_percent: current.map_or(0.0, |c| c.net_percent),
            positive_sum: current.map_or(0.0, |c| c.positive_sum),
            negative_sum: current.map_or(0.0, |c| c.negative_sum),
            count: current.map_or(0, |c| c.count),
            slot_duration: SLOT_MS,
        }
    }

    /// Bounded history for the snapshot: the last [`EXPORT_CAP`] closed
    /// candles plus the active one, oldest first.
    pub fn export_history(&self) -> Vec<IndexCandle> {
        let start = self.history.len().saturating_sub(EXPORT_CAP);
        let mut out: Vec<IndexCandle> = self.history[start..].to_vec();
        if let Some(active) = &self.active {
            out.push(active.clone());
        }
        out
    }

}

impl Default for IndexState {
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

    fn stat(positive: f64, negative: f64, count: usize) -> D1Stat {
        D1Stat {
            positive_sum: positive,
            negative_sum: negative,
            count,
        }
    }

    #[test]
    fn net_percent_zero_when_empty() {
        assert_eq!(stat(0.0, 0.0, 0).net_percent(), 0.0);
    }

    #[test]
    fn d1_stat_folds_signs_and_zeros() {
        let s = d1_stat([2.5, -1.0, 0.0, -0.5].into_iter());
        assert!((s.positive_sum - 2.5).abs() < 1e-9);
        assert!((s.negative_sum - 1.5).abs() < 1e-9);
        assert_eq!(s.count, 4);
    }

    #[test]
    fn net_percent_sign_convention() {
        // Decliners dominate: net positive (bearish).
        let s = stat(1.0, 7.0, 3);
        assert!((s.net_percent() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_tick_without_force_creates_nothing() {
        let mut idx = IndexState::new();
        let outcome = idx.tick(10_000, false, &stat(0.0, 0.0, 0));
        assert!(outcome.frozen.is_none());
        assert!(!outcome.updated);
        assert!(idx.active.is_none());
    }

    #[test]
    fn forced_tick_creates_bucket_at_base_value() {
        let mut idx = IndexState::new();
        let outcome = idx.tick(10_000, true, &stat(0.0, 0.0, 0));
        assert!(outcome.updated);
        let active = idx.active.as_ref().expect("bucket created");
        assert_eq!(active.start_time, 0);
        assert_eq!(active.open, BASE_VALUE);
        assert_eq!(active.close, 0.0);
    }

    #[test]
    fn close_is_negated_net_percent_rounded() {
        let mut idx = IndexState::new();
        // positive 10, negative 4, count 3 => net = -2.0 => close = +2.0
        idx.tick(0, true, &stat(10.0, 4.0, 3));
        let active = idx.active.as_ref().unwrap();
        assert!((active.close - 2.0).abs() < 1e-9);
        assert!((active.net_percent + 2.0).abs() < 1e-9);
        assert!((active.positive_sum - 10.0).abs() < 1e-9);
        assert!((active.negative_sum - 4.0).abs() < 1e-9);
        assert_eq!(active.count, 3);
    }

    #[test]
    fn high_low_envelope_contains_open_and_close() {
        let mut idx = IndexState::new();
        idx.tick(0, true, &stat(0.0, 15.0, 3)); // close = -5
        idx.tick(60_000, false, &stat(9.0, 0.0, 3)); // close = +3
        idx.tick(120_000, false, &stat(0.0, 3.0, 3)); // close = -1
        let active = idx.active.as_ref().unwrap();
        assert!(active.low <= active.open && active.open <= active.high);
        assert!(active.low <= active.close && active.close <= active.high);
        assert!((active.high - 3.0).abs() < 1e-9);
        assert!((active.low + 5.0).abs() < 1e-9);
    }

    #[test]
    fn rollover_freezes_and_seeds_next_open() {
        let mut idx = IndexState::new();

        // Active bucket in slot 0 closing at -5.0.
        idx.tick(SLOT_MS - 1000, true, &stat(15.0, 0.0, 3));
        assert!((idx.active.as_ref().unwrap().close - 5.0).abs() < 1e-9);
        // Pull the close down to -5.0.
        idx.tick(SLOT_MS - 500, false, &stat(0.0, 15.0, 3));
        assert!((idx.active.as_ref().unwrap().close + 5.0).abs() < 1e-9);

        // Cross the hour boundary with netPercent = 2.0.
        let outcome = idx.tick(SLOT_MS + 1000, false, &stat(0.0, 6.0, 3));
        let frozen = outcome.frozen.expect("previous bucket frozen");
        assert_eq!(frozen.start_time, 0);
        assert!((frozen.close + 5.0).abs() < 1e-9);

        let active = idx.active.as_ref().expect("new bucket started");
        assert_eq!(active.start_time, SLOT_MS);
        assert!((active.open + 5.0).abs() < 1e-9);
        assert!((active.close + 2.0).abs() < 1e-9);
        assert_eq!(idx.history.len(), 1);
    }

    #[test]
    fn rollover_without_data_freezes_but_starts_nothing() {
        let mut idx = IndexState::new();
        idx.tick(0, true, &stat(3.0, 0.0, 1));
        let outcome = idx.tick(SLOT_MS + 1, false, &stat(0.0, 0.0, 0));
        assert!(outcome.frozen.is_some());
        assert!(!outcome.updated);
        assert!(idx.active.is_none());
        // The frozen close carries forward as the next open.
        idx.tick(SLOT_MS + 2, true, &stat(0.0, 0.0, 0));
        assert!((idx.active.as_ref().unwrap().open - 3.0).abs() < 1e-9);
    }

    #[test]
    fn history_start_times_strictly_increasing_and_aligned() {
        let mut idx = IndexState::new();
        for hour in 0..5 {
            let now = hour * SLOT_MS + 30_000;
            idx.tick(now, true, &stat(hour as f64, 0.0, 2));
        }
        let export = idx.export_history();
        // Four closed + one active.
        assert_eq!(export.len(), 5);
        for pair in export.windows(2) {
            assert!(pair[0].start_time < pair[1].start_time);
        }
        for candle in &export {
            assert_eq!(candle.start_time % SLOT_MS, 0);
        }
    }

    #[test]
    fn history_bounded_to_cap() {
        let mut idx = IndexState::new();
        for hour in 0..(HISTORY_CAP as i64 + 50) {
            idx.tick(hour * SLOT_MS, true, &stat(1.0, 0.0, 1));
        }
        assert_eq!(idx.history.len(), HISTORY_CAP);
        // Export stays within its own bound plus the active candle.
        assert_eq!(idx.export_history().len(), EXPORT_CAP + 1);
    }

    #[test]
    fn restore_sorts_dedups_and_picks_prev_close() {
        let mk = |slot: i64, close: f64| IndexCandle {
            start_time: slot * SLOT_MS,
            open: 0.0,
            high: close.max(0.0),
            low: close.min(0.0),
            close,
            net_percent: -close,
            positive_sum: 0.0,
            negative_sum: 0.0,
            count: 1,
        };
        let idx = IndexState::restore(vec![mk(2, 1.5), mk(0, -1.0), mk(2, 2.5), mk(1, 0.5)]);
        assert_eq!(idx.history.len(), 3);
        let summary = idx.summary();
        assert!((summary.latest - 2.5).abs() < 1e-9);
        assert_eq!(summary.last_slot, 2 * SLOT_MS);
    }

    #[test]
    fn summary_of_empty_state() {
        let summary = IndexState::new().summary();
        assert_eq!(summary.latest, BASE_VALUE);
        assert_eq!(summary.last_slot, 0);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.slot_duration, SLOT_MS);
    }

    #[test]
    fn candle_json_is_camel_case() {
        let candle = IndexCandle {
            start_time: SLOT_MS,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            net_percent: -1.5,
            positive_sum: 4.5,
            negative_sum: 0.0,
            count: 3,
        };
        let json = serde_json::to_value(&candle).unwrap();
        assert_eq!(json["startTime"], SLOT_MS);
        assert_eq!(json["netPercent"], -1.5);
        assert_eq!(json["positiveSum"], 4.5);
        let back: IndexCandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, candle);
    }
}
