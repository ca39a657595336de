//! Trade enrichment pipeline.
//!
//! Every aggressive trade is annotated with the passive liquidity it hit,
//! banded passive volumes around it, and one aggregate per configured
//! tick-window (the "zones"). All detectors consume this output; the
//! preprocessor is the only component that constructs it.

use crate::book::passive::PassiveVolumeTracker;
use crate::book::OrderBookState;
use crate::feed::AggressiveTrade;
use crate::num::fixed::FixedPoint;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Inclusive lower / exclusive upper bound of a zone. The traded price
/// always satisfies `min <= price <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBoundaries {
    pub min: FixedPoint,
    pub max: FixedPoint,
}

/// Aggregate of trades and passive liquidity inside one tick-window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Center price of the zone.
    pub price_level: FixedPoint,
    /// Window size in ticks (5/10/20 by default).
    pub zone_ticks: u32,
    pub aggressive_volume: FixedPoint,
    pub aggressive_buy_volume: FixedPoint,
    pub aggressive_sell_volume: FixedPoint,
    pub passive_volume: FixedPoint,
    pub passive_bid_volume: FixedPoint,
    pub passive_ask_volume: FixedPoint,
    pub trade_count: u64,
    pub timespan_ms: i64,
    pub boundaries: ZoneBoundaries,
    pub first_update_ms: i64,
    pub last_update_ms: i64,
    pub volume_weighted_price: FixedPoint,
    /// Lowest / highest traded price seen inside the zone.
    pub traded_low: FixedPoint,
    pub traded_high: FixedPoint,
    #[serde(skip)]
    pv_sum: FixedPoint,
    #[serde(skip)]
    qty_sum: FixedPoint,
}

impl ZoneSnapshot {
    fn blank() -> Self {
        let zero_bounds = ZoneBoundaries {
            min: FixedPoint::ZERO,
            max: FixedPoint::ZERO,
        };
        ZoneSnapshot {
            price_level: FixedPoint::ZERO,
            zone_ticks: 0,
            aggressive_volume: FixedPoint::ZERO,
            aggressive_buy_volume: FixedPoint::ZERO,
            aggressive_sell_volume: FixedPoint::ZERO,
            passive_volume: FixedPoint::ZERO,
            passive_bid_volume: FixedPoint::ZERO,
            passive_ask_volume: FixedPoint::ZERO,
            trade_count: 0,
            timespan_ms: 0,
            boundaries: zero_bounds,
            first_update_ms: 0,
            last_update_ms: 0,
            volume_weighted_price: FixedPoint::ZERO,
            traded_low: FixedPoint::ZERO,
            traded_high: FixedPoint::ZERO,
            pv_sum: FixedPoint::ZERO,
            qty_sum: FixedPoint::ZERO,
        }
    }

    fn reset(&mut self, zone_ticks: u32, boundaries: ZoneBoundaries, now_ms: i64) {
        *self = ZoneSnapshot {
            price_level: (boundaries.min + boundaries.max) / FixedPoint::from_int(2),
            zone_ticks,
            aggressive_volume: FixedPoint::ZERO,
            aggressive_buy_volume: FixedPoint::ZERO,
            aggressive_sell_volume: FixedPoint::ZERO,
            passive_volume: FixedPoint::ZERO,
            passive_bid_volume: FixedPoint::ZERO,
            passive_ask_volume: FixedPoint::ZERO,
            trade_count: 0,
            timespan_ms: 0,
            boundaries,
            first_update_ms: now_ms,
            last_update_ms: now_ms,
            volume_weighted_price: FixedPoint::ZERO,
            traded_low: FixedPoint::ZERO,
            traded_high: FixedPoint::ZERO,
            pv_sum: FixedPoint::ZERO,
            qty_sum: FixedPoint::ZERO,
        };
    }

    fn record_trade(&mut self, trade: &AggressiveTrade) {
        self.trade_count += 1;
        self.aggressive_volume += trade.quantity;
        if trade.is_aggressive_buy() {
            self.aggressive_buy_volume += trade.quantity;
        } else {
            self.aggressive_sell_volume += trade.quantity;
        }
        self.pv_sum += trade.price * trade.quantity;
        self.qty_sum += trade.quantity;
        self.volume_weighted_price = self.pv_sum.safe_div(self.qty_sum);
        if self.traded_low.is_zero() || trade.price < self.traded_low {
            self.traded_low = trade.price;
        }
        if trade.price > self.traded_high {
            self.traded_high = trade.price;
        }
        self.last_update_ms = trade.timestamp_ms;
        self.timespan_ms = self.last_update_ms - self.first_update_ms;
    }

    fn refresh_passives(&mut self, bid: FixedPoint, ask: FixedPoint) {
        self.passive_bid_volume = bid;
        self.passive_ask_volume = ask;
        self.passive_volume = bid + ask;
    }

    /// Observed traded price range inside the zone.
    pub fn price_range(&self) -> FixedPoint {
        if self.traded_low.is_zero() {
            FixedPoint::ZERO
        } else {
            self.traded_high - self.traded_low
        }
    }
}

/// Trade enriched with book context and all configured zone views,
/// ordered by ascending tick-window.
#[derive(Debug, Clone)]
pub struct EnrichedTradeEvent {
    pub trade: AggressiveTrade,
    /// Passive quantities resting at the traded price.
    pub passive_bid_volume: FixedPoint,
    pub passive_ask_volume: FixedPoint,
    /// Passive quantities within the configured band around the trade.
    pub zone_passive_bid_volume: FixedPoint,
    pub zone_passive_ask_volume: FixedPoint,
    pub best_bid: Option<FixedPoint>,
    pub best_ask: Option<FixedPoint>,
    pub zone_data: Vec<ZoneSnapshot>,
}

impl EnrichedTradeEvent {
    fn empty() -> Self {
        Self {
            trade: AggressiveTrade {
                trade_id: 0,
                pair: String::new(),
                price: FixedPoint::ZERO,
                quantity: FixedPoint::ZERO,
                timestamp_ms: 0,
                buyer_is_maker: false,
            },
            passive_bid_volume: FixedPoint::ZERO,
            passive_ask_volume: FixedPoint::ZERO,
            zone_passive_bid_volume: FixedPoint::ZERO,
            zone_passive_ask_volume: FixedPoint::ZERO,
            best_bid: None,
            best_ask: None,
            zone_data: Vec::new(),
        }
    }

    /// Zone view for a specific tick-window, if configured.
    pub fn zone(&self, zone_ticks: u32) -> Option<&ZoneSnapshot> {
        self.zone_data.iter().find(|z| z.zone_ticks == zone_ticks)
    }
}

/// Zones for one tick-window size, keyed by `floor(price / width)`.
///
/// Retired snapshots return to a free list so steady-state processing does
/// not allocate.
struct ZoneCache {
    zone_ticks: u32,
    width: FixedPoint,
    zones: HashMap<i128, ZoneSnapshot>,
    pool: Vec<ZoneSnapshot>,
    max_zones: usize,
    time_window_ms: i64,
    retired: u64,
}

impl ZoneCache {
    fn new(zone_ticks: u32, tick_size: FixedPoint, max_zones: usize, time_window_ms: i64) -> Self {
        Self {
            zone_ticks,
            width: tick_size.mul_int(zone_ticks as i64),
            zones: HashMap::new(),
            pool: Vec::new(),
            max_zones: max_zones.max(1),
            time_window_ms,
            retired: 0,
        }
    }

    fn index_of(&self, price: FixedPoint) -> i128 {
        price.raw().div_euclid(self.width.raw())
    }

    fn boundaries_of(&self, index: i128) -> ZoneBoundaries {
        let min = FixedPoint::from_raw(index * self.width.raw());
        ZoneBoundaries {
            min,
            max: min + self.width,
        }
    }

    fn get_or_create(&mut self, price: FixedPoint, now_ms: i64) -> &mut ZoneSnapshot {
        let index = self.index_of(price);
        if !self.zones.contains_key(&index) {
            if self.zones.len() >= self.max_zones {
                self.evict_oldest();
            }
            let boundaries = self.boundaries_of(index);
            let mut zone = self.pool.pop().unwrap_or_else(ZoneSnapshot::blank);
            zone.reset(self.zone_ticks, boundaries, now_ms);
            self.zones.insert(index, zone);
        }
        self.zones.get_mut(&index).expect("zone inserted above")
    }

    fn evict_oldest(&mut self) {
        if let Some((&oldest, _)) = self
            .zones
            .iter()
            .min_by_key(|(_, z)| z.last_update_ms)
        {
            if let Some(zone) = self.zones.remove(&oldest) {
                self.pool.push(zone);
                self.retired += 1;
            }
        }
    }

    fn retire_stale(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.time_window_ms;
        let stale: Vec<i128> = self
            .zones
            .iter()
            .filter(|(_, z)| z.last_update_ms < cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(zone) = self.zones.remove(&key) {
                self.pool.push(zone);
                self.retired += 1;
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PreprocessorCounters {
    pub trades_processed: u64,
    pub zones_retired: u64,
}

pub struct OrderFlowPreprocessor {
    zone_ticks: Vec<u32>,
    band_ticks: u32,
    tick_size: FixedPoint,
    caches: Vec<ZoneCache>,
    event: EnrichedTradeEvent,
    counters: PreprocessorCounters,
}

impl OrderFlowPreprocessor {
    pub fn new(
        zone_ticks: &[u32],
        band_ticks: u32,
        tick_size: FixedPoint,
        max_zones_per_window: usize,
        time_window_ms: i64,
    ) -> Self {
        let caches = zone_ticks
            .iter()
            .map(|&ticks| ZoneCache::new(ticks, tick_size, max_zones_per_window, time_window_ms))
            .collect();
        Self {
            zone_ticks: zone_ticks.to_vec(),
            band_ticks,
            tick_size,
            caches,
            event: EnrichedTradeEvent::empty(),
            counters: PreprocessorCounters::default(),
        }
    }

    /// Enrich one trade. The returned reference borrows internal storage
    /// that is reused for the next trade; detectors must not hold onto it.
    pub fn process(
        &mut self,
        trade: AggressiveTrade,
        book: &OrderBookState,
        passives: &mut PassiveVolumeTracker,
    ) -> &EnrichedTradeEvent {
        let now_ms = trade.timestamp_ms;

        // 1. Book context at the traded price.
        let (level_bid, level_ask) = book
            .level(trade.price)
            .map(|l| (l.bid, l.ask))
            .unwrap_or((FixedPoint::ZERO, FixedPoint::ZERO));
        let best_bid = book.best_bid();
        let best_ask = book.best_ask();

        // 2. Banded passives around the traded price.
        let band = self.tick_size.mul_int(self.band_ticks as i64);
        let (band_bid, band_ask) = self.sum_band(book, trade.price, band);

        // 3. Zone aggregates, one per configured tick-window.
        self.event.zone_data.clear();
        for cache in &mut self.caches {
            let zone = cache.get_or_create(trade.price, now_ms);
            zone.record_trade(&trade);
            let (zone_bid, zone_ask) =
                sum_levels_in(book, zone.boundaries.min, zone.boundaries.max);
            zone.refresh_passives(zone_bid, zone_ask);
            self.event.zone_data.push(*zone);
        }

        // 4. Feed the passive history.
        passives.push_sample(trade.price, level_bid, level_ask, now_ms);

        // 5. Assemble the event in place.
        self.event.passive_bid_volume = level_bid;
        self.event.passive_ask_volume = level_ask;
        self.event.zone_passive_bid_volume = band_bid;
        self.event.zone_passive_ask_volume = band_ask;
        self.event.best_bid = best_bid;
        self.event.best_ask = best_ask;
        self.event.trade = trade;
        self.counters.trades_processed += 1;

        &self.event
    }

    fn sum_band(
        &self,
        book: &OrderBookState,
        center: FixedPoint,
        band: FixedPoint,
    ) -> (FixedPoint, FixedPoint) {
        sum_levels_in(book, center - band, center + band)
    }

    /// Retire zones untouched for the configured window. Runs at the
    /// cooperative checkpoint between trades.
    pub fn retire_stale_zones(&mut self, now_ms: i64) {
        for cache in &mut self.caches {
            cache.retire_stale(now_ms);
        }
        self.counters.zones_retired = self.caches.iter().map(|c| c.retired).sum();
        debug!(retired = self.counters.zones_retired, "zone retirement pass");
    }

    pub fn counters(&self) -> PreprocessorCounters {
        self.counters
    }

    pub fn zone_windows(&self) -> &[u32] {
        &self.zone_ticks
    }
}

fn sum_levels_in(
    book: &OrderBookState,
    min: FixedPoint,
    max: FixedPoint,
) -> (FixedPoint, FixedPoint) {
    let mut bid = FixedPoint::ZERO;
    let mut ask = FixedPoint::ZERO;
    for level in book.levels_in(min, max) {
        bid += level.bid;
        ask += level.ask;
    }
    (bid, ask)
}

/// Drop-oldest fan-out for consumers that run outside the synchronous
/// detector pass (archival, dashboards). The book and the passive tracker
/// stay authoritative; a slow consumer only loses enrichments.
pub struct EnrichmentFanout {
    consumers: Vec<ConsumerQueue>,
}

struct ConsumerQueue {
    name: &'static str,
    capacity: usize,
    queue: VecDeque<EnrichedTradeEvent>,
    dropped: u64,
}

impl EnrichmentFanout {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, capacity: usize) {
        self.consumers.push(ConsumerQueue {
            name,
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            dropped: 0,
        });
    }

    pub fn publish(&mut self, event: &EnrichedTradeEvent) {
        for consumer in &mut self.consumers {
            if consumer.queue.len() >= consumer.capacity {
                consumer.queue.pop_front();
                consumer.dropped += 1;
                debug!(consumer = consumer.name, "dropped oldest unread enrichment");
            }
            consumer.queue.push_back(event.clone());
        }
    }

    pub fn drain(&mut self, name: &str) -> Vec<EnrichedTradeEvent> {
        self.consumers
            .iter_mut()
            .find(|c| c.name == name)
            .map(|c| c.queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn dropped(&self, name: &str) -> u64 {
        self.consumers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.dropped)
            .unwrap_or(0)
    }
}

impl Default for EnrichmentFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrderBookConfig;
    use crate::feed::DepthSnapshot;

    fn fp(s: &str) -> FixedPoint {
        FixedPoint::parse(s).unwrap()
    }

    fn trade(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> AggressiveTrade {
        AggressiveTrade {
            trade_id: id,
            pair: "BTCUSDT".into(),
            price: fp(price),
            quantity: fp(qty),
            timestamp_ms: ts,
            buyer_is_maker,
        }
    }

    fn book() -> OrderBookState {
        let mut book = OrderBookState::new("BTCUSDT", OrderBookConfig::default(), fp("0.01"));
        book.apply_snapshot(
            &DepthSnapshot {
                last_update_id: 1,
                bids: vec![
                    ["89.00".into(), "2000".into()],
                    ["88.98".into(), "300".into()],
                ],
                asks: vec![
                    ["89.01".into(), "100".into()],
                    ["89.03".into(), "150".into()],
                ],
            },
            0,
        )
        .unwrap();
        book
    }

    fn preprocessor() -> OrderFlowPreprocessor {
        OrderFlowPreprocessor::new(&[5, 10, 20], 20, fp("0.01"), 64, 90_000)
    }

    #[test]
    fn test_enrichment_carries_book_context() {
        let book = book();
        let mut passives = PassiveVolumeTracker::new(64, 60_000);
        let mut pre = preprocessor();

        let ev = pre.process(trade(1, "89.00", "60", 1_000, true), &book, &mut passives);
        assert_eq!(ev.passive_bid_volume, fp("2000"));
        assert_eq!(ev.passive_ask_volume, FixedPoint::ZERO);
        assert_eq!(ev.best_bid, Some(fp("89.00")));
        assert_eq!(ev.best_ask, Some(fp("89.01")));
        assert_eq!(ev.zone_data.len(), 3);
        // Band of 20 ticks around 89.00 covers every seeded level.
        assert_eq!(ev.zone_passive_bid_volume, fp("2300"));
        assert_eq!(ev.zone_passive_ask_volume, fp("250"));
    }

    #[test]
    fn test_zone_volume_invariants() {
        let book = book();
        let mut passives = PassiveVolumeTracker::new(64, 60_000);
        let mut pre = preprocessor();

        pre.process(trade(1, "89.00", "60", 1_000, true), &book, &mut passives);
        pre.process(trade(2, "89.00", "40", 1_500, false), &book, &mut passives);
        let ev = pre
            .process(trade(3, "89.005", "25", 2_000, true), &book, &mut passives)
            .clone();

        for zone in &ev.zone_data {
            assert_eq!(
                zone.aggressive_volume,
                zone.aggressive_buy_volume + zone.aggressive_sell_volume
            );
            assert_eq!(
                zone.passive_volume,
                zone.passive_bid_volume + zone.passive_ask_volume
            );
            assert!(zone.boundaries.min <= ev.trade.price);
            assert!(ev.trade.price <= zone.boundaries.max);
            assert!(zone.boundaries.min <= zone.price_level);
            assert!(zone.price_level <= zone.boundaries.max);
        }
    }

    #[test]
    fn test_vwap_tracks_running_sums() {
        let book = book();
        let mut passives = PassiveVolumeTracker::new(64, 60_000);
        let mut pre = preprocessor();

        pre.process(trade(1, "89.00", "10", 1_000, true), &book, &mut passives);
        let ev = pre.process(trade(2, "89.02", "30", 1_200, true), &book, &mut passives);
        let zone = ev.zone(20).unwrap();
        // (89.00*10 + 89.02*30) / 40 = 89.015
        assert_eq!(zone.volume_weighted_price, fp("89.015"));
        assert_eq!(zone.trade_count, 2);
        assert_eq!(zone.timespan_ms, 200);
        assert_eq!(zone.price_range(), fp("0.02"));
    }

    #[test]
    fn test_same_zone_is_reused_across_trades() {
        let book = book();
        let mut passives = PassiveVolumeTracker::new(64, 60_000);
        let mut pre = preprocessor();

        pre.process(trade(1, "89.00", "10", 1_000, true), &book, &mut passives);
        let ev = pre.process(trade(2, "89.001", "5", 1_100, true), &book, &mut passives);
        // 5-tick window is 0.05 wide; both prices land in the same zone.
        let zone = ev.zone(5).unwrap();
        assert_eq!(zone.trade_count, 2);
        assert_eq!(zone.aggressive_volume, fp("15"));
    }

    #[test]
    fn test_stale_zones_are_retired_and_pooled() {
        let book = book();
        let mut passives = PassiveVolumeTracker::new(64, 60_000);
        let mut pre = OrderFlowPreprocessor::new(&[5], 20, fp("0.01"), 64, 10_000);

        pre.process(trade(1, "89.00", "10", 1_000, true), &book, &mut passives);
        pre.retire_stale_zones(20_000);
        assert_eq!(pre.counters().zones_retired, 1);

        // The next trade starts a fresh aggregate.
        let ev = pre.process(trade(2, "89.00", "5", 21_000, true), &book, &mut passives);
        assert_eq!(ev.zone(5).unwrap().trade_count, 1);
    }

    #[test]
    fn test_fanout_drops_oldest_when_full() {
        let book = book();
        let mut passives = PassiveVolumeTracker::new(64, 60_000);
        let mut pre = preprocessor();
        let mut fanout = EnrichmentFanout::new();
        fanout.register("archive", 2);

        for i in 0..5 {
            let ev = pre.process(
                trade(i, "89.00", "1", 1_000 + i as i64, true),
                &book,
                &mut passives,
            );
            fanout.publish(ev);
        }
        assert_eq!(fanout.dropped("archive"), 3);
        let drained = fanout.drain("archive");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].trade.trade_id, 3);
        assert_eq!(drained[1].trade.trade_id, 4);
    }
}
