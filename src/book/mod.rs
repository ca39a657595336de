//! Authoritative L2 depth state with gap-driven resync.
//!
//! Sequencing follows the exchange's diff-depth contract: stale events are
//! ignored, the first event after a snapshot must straddle
//! `last_update_id + 1`, and any later gap invalidates the book until a
//! fresh snapshot is applied. A crossed book after an applied delta is
//! treated the same way.

pub mod passive;

use crate::config::OrderBookConfig;
use crate::error::EngineError;
use crate::feed::pacer::SnapshotPacer;
use crate::feed::{parse_level, DepthSnapshot, DepthUpdateEvent, SnapshotFetcher};
use crate::num::fixed::FixedPoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One price level of the book, both sides.
///
/// Created on the first depth update touching its price; mutated only by
/// `OrderBookState`; destroyed by the pruner or a resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassiveLevel {
    pub price: FixedPoint,
    pub bid: FixedPoint,
    pub ask: FixedPoint,
    pub timestamp_ms: i64,
    pub added_bid: FixedPoint,
    pub consumed_bid: FixedPoint,
    pub added_ask: FixedPoint,
    pub consumed_ask: FixedPoint,
}

impl PassiveLevel {
    fn new(price: FixedPoint, timestamp_ms: i64) -> Self {
        Self {
            price,
            bid: FixedPoint::ZERO,
            ask: FixedPoint::ZERO,
            timestamp_ms,
            added_bid: FixedPoint::ZERO,
            consumed_bid: FixedPoint::ZERO,
            added_ask: FixedPoint::ZERO,
            consumed_ask: FixedPoint::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bid.is_zero() && self.ask.is_zero()
    }
}

/// Derived read-only view used by the preprocessor.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub timestamp_ms: i64,
    pub best_bid: FixedPoint,
    pub best_ask: FixedPoint,
    pub spread: FixedPoint,
    pub mid_price: FixedPoint,
    pub depth: BTreeMap<FixedPoint, PassiveLevel>,
    pub passive_bid_volume: FixedPoint,
    pub passive_ask_volume: FixedPoint,
    /// `(bid - ask) / (bid + ask)` over the banded depth.
    pub imbalance: FixedPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot applied yet.
    Unsynced,
    Synced,
    /// Gap detected; all deltas dropped until a fresh snapshot lands.
    Resyncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// `final_update_id` at or before the book's cursor.
    DroppedStale,
    /// Book not in `Synced` state; delta discarded.
    DroppedUnsynced,
    /// Sequence gap (or crossed book); book moved to `Resyncing`.
    GapDetected,
    /// Unparseable entries; delta discarded and counted.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookHealthStatus {
    Ok,
    Degraded,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookHealth {
    pub status: BookHealthStatus,
    pub last_update_ms: i64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub stream_connected: bool,
    /// Effective staleness threshold (widened 10x while disconnected).
    pub timeout_threshold_ms: i64,
    pub resyncs: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BookCounters {
    pub applied: u64,
    pub dropped_stale: u64,
    pub dropped_unsynced: u64,
    pub malformed: u64,
    pub resyncs: u64,
}

pub struct OrderBookState {
    symbol: String,
    cfg: OrderBookConfig,
    tick_size: FixedPoint,
    levels: BTreeMap<FixedPoint, PassiveLevel>,
    bid_prices: BTreeSet<FixedPoint>,
    ask_prices: BTreeSet<FixedPoint>,
    last_update_id: i64,
    first_delta_applied: bool,
    sync: SyncState,
    stream_connected: bool,
    last_update_ms: i64,
    counters: BookCounters,
}

impl OrderBookState {
    pub fn new(symbol: &str, cfg: OrderBookConfig, tick_size: FixedPoint) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            cfg,
            tick_size,
            levels: BTreeMap::new(),
            bid_prices: BTreeSet::new(),
            ask_prices: BTreeSet::new(),
            last_update_id: 0,
            first_delta_applied: false,
            sync: SyncState::Unsynced,
            stream_connected: false,
            last_update_ms: 0,
            counters: BookCounters::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub fn counters(&self) -> BookCounters {
        self.counters
    }

    pub fn is_synced(&self) -> bool {
        self.sync == SyncState::Synced
    }

    /// Fetch a snapshot through the injected feed and rebuild the map.
    ///
    /// Must succeed before any update is accepted. Bubbles
    /// `SnapshotUnavailable` after the configured attempt budget.
    pub async fn initialize(
        &mut self,
        fetcher: &dyn SnapshotFetcher,
        pacer: &SnapshotPacer,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.cfg.snapshot_attempts.max(1) {
            if let Err(e) = pacer.acquire().await {
                last_reason = e.to_string();
                continue;
            }
            let fetch = tokio::time::timeout(
                Duration::from_millis(self.cfg.snapshot_timeout_ms),
                fetcher.fetch_depth_snapshot(&self.symbol),
            )
            .await;
            match fetch {
                Ok(Ok(snapshot)) => {
                    self.apply_snapshot(&snapshot, now_ms)?;
                    info!(
                        symbol = %self.symbol,
                        update_id = self.last_update_id,
                        bid_levels = self.bid_prices.len(),
                        ask_levels = self.ask_prices.len(),
                        "order book initialized"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(symbol = %self.symbol, attempt, error = %e, "snapshot fetch failed");
                    last_reason = e.to_string();
                }
                Err(_) => {
                    warn!(
                        symbol = %self.symbol,
                        attempt,
                        timeout_ms = self.cfg.snapshot_timeout_ms,
                        "snapshot fetch timed out"
                    );
                    last_reason = format!("timeout after {}ms", self.cfg.snapshot_timeout_ms);
                }
            }
        }
        Err(EngineError::SnapshotUnavailable {
            symbol: self.symbol.clone(),
            reason: last_reason,
        })
    }

    /// Rebuild the level map from a full snapshot.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &DepthSnapshot,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        self.levels.clear();
        self.bid_prices.clear();
        self.ask_prices.clear();

        for entry in &snapshot.bids {
            let (price, qty) = parse_level(entry)?;
            if qty.is_zero() {
                continue;
            }
            let level = self
                .levels
                .entry(price)
                .or_insert_with(|| PassiveLevel::new(price, now_ms));
            level.bid = qty;
            level.timestamp_ms = now_ms;
            self.bid_prices.insert(price);
        }
        for entry in &snapshot.asks {
            let (price, qty) = parse_level(entry)?;
            if qty.is_zero() {
                continue;
            }
            let level = self
                .levels
                .entry(price)
                .or_insert_with(|| PassiveLevel::new(price, now_ms));
            level.ask = qty;
            level.timestamp_ms = now_ms;
            self.ask_prices.insert(price);
        }

        self.last_update_id = snapshot.last_update_id;
        self.first_delta_applied = false;
        self.sync = SyncState::Synced;
        self.last_update_ms = now_ms;
        Ok(())
    }

    /// Apply one differential update under the sequencing rules.
    pub fn apply(&mut self, delta: &DepthUpdateEvent, now_ms: i64) -> ApplyOutcome {
        if self.sync != SyncState::Synced {
            self.counters.dropped_unsynced += 1;
            return ApplyOutcome::DroppedUnsynced;
        }

        if delta.final_update_id <= self.last_update_id {
            self.counters.dropped_stale += 1;
            debug!(
                symbol = %self.symbol,
                final_id = delta.final_update_id,
                cursor = self.last_update_id,
                "dropping stale depth update"
            );
            return ApplyOutcome::DroppedStale;
        }

        let expected = self.last_update_id + 1;
        let in_sequence = if self.first_delta_applied {
            delta.first_update_id <= expected
        } else {
            delta.first_update_id <= expected && expected <= delta.final_update_id
        };
        if !in_sequence {
            warn!(
                symbol = %self.symbol,
                expected,
                first_id = delta.first_update_id,
                final_id = delta.final_update_id,
                "depth sequence gap, resyncing"
            );
            self.begin_resync();
            return ApplyOutcome::GapDetected;
        }

        // Parse everything before mutating so a malformed delta leaves the
        // book untouched.
        let mut bid_changes = Vec::with_capacity(delta.bids.len());
        for entry in &delta.bids {
            match parse_level(entry) {
                Ok(pq) => bid_changes.push(pq),
                Err(e) => {
                    self.counters.malformed += 1;
                    warn!(symbol = %self.symbol, error = %e, "malformed bid entry, delta dropped");
                    return ApplyOutcome::Malformed;
                }
            }
        }
        let mut ask_changes = Vec::with_capacity(delta.asks.len());
        for entry in &delta.asks {
            match parse_level(entry) {
                Ok(pq) => ask_changes.push(pq),
                Err(e) => {
                    self.counters.malformed += 1;
                    warn!(symbol = %self.symbol, error = %e, "malformed ask entry, delta dropped");
                    return ApplyOutcome::Malformed;
                }
            }
        }

        for (price, qty) in bid_changes {
            self.set_bid(price, qty, delta.event_time);
        }
        for (price, qty) in ask_changes {
            self.set_ask(price, qty, delta.event_time);
        }

        self.last_update_id = delta.final_update_id;
        self.first_delta_applied = true;
        self.last_update_ms = now_ms;
        self.counters.applied += 1;

        // Crossed book means a silent corruption slipped through; force a
        // resync rather than serving bad data.
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                warn!(
                    symbol = %self.symbol,
                    best_bid = %bid,
                    best_ask = %ask,
                    "crossed book after update, resyncing"
                );
                self.begin_resync();
                return ApplyOutcome::GapDetected;
            }
        }

        ApplyOutcome::Applied
    }

    fn begin_resync(&mut self) {
        self.sync = SyncState::Resyncing;
        self.counters.resyncs += 1;
    }

    fn set_bid(&mut self, price: FixedPoint, qty: FixedPoint, ts_ms: i64) {
        if qty.is_zero() {
            if let Some(level) = self.levels.get_mut(&price) {
                level.consumed_bid += level.bid;
                level.bid = FixedPoint::ZERO;
                level.timestamp_ms = ts_ms;
                self.bid_prices.remove(&price);
                if level.is_empty() {
                    self.levels.remove(&price);
                }
            }
            return;
        }
        let level = self
            .levels
            .entry(price)
            .or_insert_with(|| PassiveLevel::new(price, ts_ms));
        if qty > level.bid {
            level.added_bid += qty - level.bid;
        } else {
            level.consumed_bid += level.bid - qty;
        }
        level.bid = qty;
        level.timestamp_ms = ts_ms;
        self.bid_prices.insert(price);
    }

    fn set_ask(&mut self, price: FixedPoint, qty: FixedPoint, ts_ms: i64) {
        if qty.is_zero() {
            if let Some(level) = self.levels.get_mut(&price) {
                level.consumed_ask += level.ask;
                level.ask = FixedPoint::ZERO;
                level.timestamp_ms = ts_ms;
                self.ask_prices.remove(&price);
                if level.is_empty() {
                    self.levels.remove(&price);
                }
            }
            return;
        }
        let level = self
            .levels
            .entry(price)
            .or_insert_with(|| PassiveLevel::new(price, ts_ms));
        if qty > level.ask {
            level.added_ask += qty - level.ask;
        } else {
            level.consumed_ask += level.ask - qty;
        }
        level.ask = qty;
        level.timestamp_ms = ts_ms;
        self.ask_prices.insert(price);
    }

    pub fn best_bid(&self) -> Option<FixedPoint> {
        self.bid_prices.iter().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<FixedPoint> {
        self.ask_prices.iter().next().copied()
    }

    pub fn spread(&self) -> Option<FixedPoint> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    pub fn mid_price(&self) -> Option<FixedPoint> {
        let two = FixedPoint::from_int(2);
        Some((self.best_ask()? + self.best_bid()?) / two)
    }

    pub fn level(&self, price: FixedPoint) -> Option<&PassiveLevel> {
        self.levels.get(&price)
    }

    pub fn bid_levels(&self) -> usize {
        self.bid_prices.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.ask_prices.len()
    }

    /// Levels with `min <= price < max`, ascending.
    pub fn levels_in(
        &self,
        min: FixedPoint,
        max: FixedPoint,
    ) -> impl Iterator<Item = &PassiveLevel> {
        self.levels.range(min..max).map(|(_, level)| level)
    }

    /// Levels within `band_ticks` of mid, ascending by price.
    pub fn depth_band(&self, band_ticks: u32) -> Vec<PassiveLevel> {
        let Some(mid) = self.mid_price() else {
            return Vec::new();
        };
        let band = self.tick_size.mul_int(band_ticks as i64);
        self.levels
            .range(mid - band..=mid + band)
            .map(|(_, level)| *level)
            .collect()
    }

    /// Banded snapshot for the preprocessor; rejected when crossed or empty.
    pub fn snapshot(&self, band_ticks: u32, now_ms: i64) -> Option<BookSnapshot> {
        let best_bid = self.best_bid()?;
        let best_ask = self.best_ask()?;
        if best_bid >= best_ask {
            return None;
        }
        let mid = (best_bid + best_ask) / FixedPoint::from_int(2);
        let band = self.tick_size.mul_int(band_ticks as i64);
        let mut depth = BTreeMap::new();
        let mut passive_bid = FixedPoint::ZERO;
        let mut passive_ask = FixedPoint::ZERO;
        for (price, level) in self.levels.range(mid - band..=mid + band) {
            passive_bid += level.bid;
            passive_ask += level.ask;
            depth.insert(*price, *level);
        }
        let imbalance = (passive_bid - passive_ask).safe_div(passive_bid + passive_ask);
        Some(BookSnapshot {
            timestamp_ms: now_ms,
            best_bid,
            best_ask,
            spread: best_ask - best_bid,
            mid_price: mid,
            depth,
            passive_bid_volume: passive_bid,
            passive_ask_volume: passive_ask,
            imbalance,
        })
    }

    pub fn on_stream_connected(&mut self) {
        self.stream_connected = true;
        info!(symbol = %self.symbol, "depth stream connected");
    }

    pub fn on_stream_disconnected(&mut self, reason: &str) {
        self.stream_connected = false;
        warn!(symbol = %self.symbol, reason, "depth stream disconnected");
    }

    pub fn stream_connected(&self) -> bool {
        self.stream_connected
    }

    /// Periodic maintenance: drop empty and far-away levels, cap the total
    /// level count by furthest-from-mid eviction.
    pub fn prune(&mut self) {
        let Some(mid) = self.mid_price() else {
            return;
        };
        let max_distance = self
            .tick_size
            .mul_int(self.cfg.max_price_distance_ticks as i64);

        let doomed: Vec<FixedPoint> = self
            .levels
            .iter()
            .filter(|(price, level)| {
                level.is_empty() || (**price - mid).abs() > max_distance
            })
            .map(|(price, _)| *price)
            .collect();
        for price in doomed {
            self.remove_level(price);
        }

        if self.levels.len() > self.cfg.max_levels {
            let mut by_distance: Vec<(FixedPoint, FixedPoint)> = self
                .levels
                .keys()
                .map(|p| ((*p - mid).abs(), *p))
                .collect();
            by_distance.sort_unstable();
            let excess = self.levels.len() - self.cfg.max_levels;
            let evict: Vec<FixedPoint> = by_distance
                .iter()
                .rev()
                .take(excess)
                .map(|(_, p)| *p)
                .collect();
            for price in evict {
                self.remove_level(price);
            }
            debug!(
                symbol = %self.symbol,
                evicted = excess,
                remaining = self.levels.len(),
                "pruned book to level cap"
            );
        }
    }

    fn remove_level(&mut self, price: FixedPoint) {
        self.levels.remove(&price);
        self.bid_prices.remove(&price);
        self.ask_prices.remove(&price);
    }

    /// Full wire-format snapshot of the current book, best levels first.
    pub fn full_snapshot(&self) -> DepthSnapshot {
        let bids = self
            .bid_prices
            .iter()
            .rev()
            .filter_map(|p| {
                let level = self.levels.get(p)?;
                Some([p.to_string(), level.bid.to_string()])
            })
            .collect();
        let asks = self
            .ask_prices
            .iter()
            .filter_map(|p| {
                let level = self.levels.get(p)?;
                Some([p.to_string(), level.ask.to_string()])
            })
            .collect();
        DepthSnapshot {
            last_update_id: self.last_update_id,
            bids,
            asks,
        }
    }

    pub fn health(&self, now_ms: i64) -> BookHealth {
        let threshold = if self.stream_connected {
            self.cfg.stale_threshold_ms
        } else {
            self.cfg.stale_threshold_ms * 10
        };
        let age = now_ms.saturating_sub(self.last_update_ms);
        let status = if self.sync != SyncState::Synced {
            BookHealthStatus::Degraded
        } else if age > threshold {
            BookHealthStatus::Stale
        } else if !self.stream_connected {
            BookHealthStatus::Degraded
        } else {
            BookHealthStatus::Ok
        };
        BookHealth {
            status,
            last_update_ms: self.last_update_ms,
            bid_levels: self.bid_prices.len(),
            ask_levels: self.ask_prices.len(),
            stream_connected: self.stream_connected,
            timeout_threshold_ms: threshold,
            resyncs: self.counters.resyncs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> FixedPoint {
        FixedPoint::parse(s).unwrap()
    }

    fn snapshot(last_update_id: i64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: vec![
                ["89.00".into(), "100".into()],
                ["88.99".into(), "50".into()],
            ],
            asks: vec![
                ["89.01".into(), "80".into()],
                ["89.02".into(), "60".into()],
            ],
        }
    }

    fn delta(first: i64, last: i64, bids: Vec<[&str; 2]>, asks: Vec<[&str; 2]>) -> DepthUpdateEvent {
        DepthUpdateEvent {
            event_time: 1_000,
            first_update_id: first,
            final_update_id: last,
            bids: bids
                .into_iter()
                .map(|[p, q]| [p.to_string(), q.to_string()])
                .collect(),
            asks: asks
                .into_iter()
                .map(|[p, q]| [p.to_string(), q.to_string()])
                .collect(),
        }
    }

    fn synced_book() -> OrderBookState {
        let mut book = OrderBookState::new("btcusdt", OrderBookConfig::default(), fp("0.01"));
        book.apply_snapshot(&snapshot(100), 0).unwrap();
        book
    }

    #[test]
    fn test_snapshot_rebuild() {
        let book = synced_book();
        assert_eq!(book.symbol(), "BTCUSDT");
        assert_eq!(book.best_bid(), Some(fp("89.00")));
        assert_eq!(book.best_ask(), Some(fp("89.01")));
        assert_eq!(book.spread(), Some(fp("0.01")));
        assert_eq!(book.mid_price(), Some(fp("89.005")));
        assert!(book.is_synced());
    }

    #[test]
    fn test_rejects_updates_before_sync() {
        let mut book = OrderBookState::new("BTCUSDT", OrderBookConfig::default(), fp("0.01"));
        let out = book.apply(&delta(1, 2, vec![["89.00", "1"]], vec![]), 0);
        assert_eq!(out, ApplyOutcome::DroppedUnsynced);
    }

    #[test]
    fn test_stale_update_dropped() {
        let mut book = synced_book();
        let out = book.apply(&delta(99, 100, vec![["89.00", "1"]], vec![]), 0);
        assert_eq!(out, ApplyOutcome::DroppedStale);
        assert_eq!(book.level(fp("89.00")).unwrap().bid, fp("100"));
    }

    #[test]
    fn test_first_delta_must_straddle_cursor() {
        let mut book = synced_book();
        // Covers 98..=105, straddles 101: accepted.
        let out = book.apply(&delta(98, 105, vec![["89.00", "42"]], vec![]), 0);
        assert_eq!(out, ApplyOutcome::Applied);
        assert_eq!(book.level(fp("89.00")).unwrap().bid, fp("42"));
        assert_eq!(book.last_update_id(), 105);
    }

    #[test]
    fn test_gap_triggers_exactly_one_resync() {
        let mut book = synced_book();
        assert_eq!(
            book.apply(&delta(101, 101, vec![["89.00", "90"]], vec![]), 0),
            ApplyOutcome::Applied
        );
        // 103 skips 102: gap.
        let out = book.apply(&delta(103, 103, vec![["89.00", "80"]], vec![]), 0);
        assert_eq!(out, ApplyOutcome::GapDetected);
        assert_eq!(book.sync_state(), SyncState::Resyncing);
        assert_eq!(book.counters().resyncs, 1);
        // The gapped delta did not mutate the book.
        assert_eq!(book.level(fp("89.00")).unwrap().bid, fp("90"));
        // Everything is dropped until a fresh snapshot.
        let out = book.apply(&delta(104, 104, vec![["89.00", "70"]], vec![]), 0);
        assert_eq!(out, ApplyOutcome::DroppedUnsynced);
        assert_eq!(book.counters().resyncs, 1);

        book.apply_snapshot(&snapshot(200), 1).unwrap();
        assert_eq!(
            book.apply(&delta(199, 201, vec![["89.00", "60"]], vec![]), 2),
            ApplyOutcome::Applied
        );
        assert_eq!(book.level(fp("89.00")).unwrap().bid, fp("60"));
    }

    #[test]
    fn test_zero_quantity_deletes_level() {
        let mut book = synced_book();
        book.apply(&delta(101, 101, vec![["88.99", "0"]], vec![]), 0);
        assert!(book.level(fp("88.99")).is_none());
        assert_eq!(book.bid_levels(), 1);
    }

    #[test]
    fn test_added_consumed_tracking() {
        let mut book = synced_book();
        book.apply(&delta(101, 101, vec![["89.00", "150"]], vec![]), 0);
        let level = book.level(fp("89.00")).unwrap();
        assert_eq!(level.added_bid, fp("50"));
        book.apply(&delta(102, 102, vec![["89.00", "30"]], vec![]), 0);
        let level = book.level(fp("89.00")).unwrap();
        assert_eq!(level.consumed_bid, fp("120"));
    }

    #[test]
    fn test_crossed_book_forces_resync() {
        let mut book = synced_book();
        // A bid through the best ask crosses the book.
        let out = book.apply(&delta(101, 101, vec![["89.05", "10"]], vec![]), 0);
        assert_eq!(out, ApplyOutcome::GapDetected);
        assert_eq!(book.sync_state(), SyncState::Resyncing);
    }

    #[test]
    fn test_malformed_delta_leaves_book_untouched() {
        let mut book = synced_book();
        let out = book.apply(
            &delta(101, 101, vec![["89.00", "nope"]], vec![["89.01", "5"]]),
            0,
        );
        assert_eq!(out, ApplyOutcome::Malformed);
        assert_eq!(book.level(fp("89.00")).unwrap().bid, fp("100"));
        assert_eq!(book.level(fp("89.01")).unwrap().ask, fp("80"));
        assert_eq!(book.counters().malformed, 1);
    }

    #[test]
    fn test_prune_drops_far_levels_and_caps_size() {
        let cfg = OrderBookConfig {
            max_levels: 3,
            max_price_distance_ticks: 100,
            ..Default::default()
        };
        let mut book = OrderBookState::new("BTCUSDT", cfg, fp("0.01"));
        book.apply_snapshot(
            &DepthSnapshot {
                last_update_id: 1,
                bids: vec![
                    ["89.00".into(), "10".into()],
                    ["88.99".into(), "10".into()],
                    ["88.00".into(), "10".into()], // > 100 ticks from mid
                ],
                asks: vec![
                    ["89.01".into(), "10".into()],
                    ["89.02".into(), "10".into()],
                ],
            },
            0,
        )
        .unwrap();
        book.prune();
        assert!(book.level(fp("88.00")).is_none());
        assert!(book.levels.len() <= 3);
        // Best levels survive the cap.
        assert_eq!(book.best_bid(), Some(fp("89.00")));
        assert_eq!(book.best_ask(), Some(fp("89.01")));
    }

    #[test]
    fn test_health_staleness_and_disconnect_widening() {
        let mut book = synced_book();
        book.on_stream_connected();
        let h = book.health(1_000);
        assert_eq!(h.status, BookHealthStatus::Ok);
        assert_eq!(h.timeout_threshold_ms, 5_000);

        let h = book.health(10_000);
        assert_eq!(h.status, BookHealthStatus::Stale);

        // Disconnected: threshold widens 10x, same age is merely degraded.
        book.on_stream_disconnected("ws close");
        let h = book.health(10_000);
        assert_eq!(h.status, BookHealthStatus::Degraded);
        assert_eq!(h.timeout_threshold_ms, 50_000);
    }

    #[test]
    fn test_snapshot_view_rejects_crossed() {
        let book = synced_book();
        let view = book.snapshot(20, 5).unwrap();
        assert_eq!(view.best_bid, fp("89.00"));
        assert_eq!(view.passive_bid_volume, fp("150"));
        assert_eq!(view.passive_ask_volume, fp("140"));
        assert!(view.imbalance.is_positive());

        let empty = OrderBookState::new("BTCUSDT", OrderBookConfig::default(), fp("0.01"));
        assert!(empty.snapshot(20, 5).is_none());
    }
}
