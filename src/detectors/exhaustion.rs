//! Exhaustion detector: collapse of the passive side that had been
//! absorbing flow.
//!
//! Keeps a rolling series of zone passive totals per primary zone and
//! scores depletion, refill failure, imbalance, spread expansion and
//! depletion velocity as additive bonuses, clamped to [0, 1]. The signal
//! opposes the exhausting passive side.

use crate::config::ExhaustionConfig;
use crate::detectors::{CooldownTracker, MarketLens, SignalCandidate, SignalData};
use crate::error::EngineError;
use crate::num::fixed::FixedPoint;
use crate::num::rolling::RollingWindow;
use crate::pipeline::EnrichedTradeEvent;
use crate::book::passive::RefillStatus;
use crate::types::{BookSide, EnhancementMode, SignalType};
use std::collections::HashMap;
use tracing::debug;

const SERIES_CAPACITY: usize = 64;

/// Sample-count floor below which the score is discounted.
const THIN_SERIES_FLOOR: usize = 5;
const THIN_SERIES_PENALTY: f64 = 0.7;

struct ZoneSeries {
    totals: RollingWindow,
    bids: RollingWindow,
    asks: RollingWindow,
    aggressive: RollingWindow,
}

impl ZoneSeries {
    fn new(window_ms: i64) -> Self {
        Self {
            totals: RollingWindow::new(SERIES_CAPACITY, window_ms),
            bids: RollingWindow::new(SERIES_CAPACITY, window_ms),
            asks: RollingWindow::new(SERIES_CAPACITY, window_ms),
            aggressive: RollingWindow::new(SERIES_CAPACITY, window_ms),
        }
    }
}

pub struct ExhaustionDetector {
    cfg: ExhaustionConfig,
    primary_zone_ticks: u32,
    window_ms: i64,
    mode: EnhancementMode,
    cooldowns: CooldownTracker,
    series: HashMap<i128, ZoneSeries>,
    pub emitted: u64,
}

impl ExhaustionDetector {
    pub const ID: &'static str = "exhaustion";

    pub fn new(cfg: ExhaustionConfig, primary_zone_ticks: u32, window_ms: i64) -> Self {
        let cooldowns = CooldownTracker::new(cfg.event_cooldown_ms);
        Self {
            cfg,
            primary_zone_ticks,
            window_ms,
            mode: EnhancementMode::Production,
            cooldowns,
            series: HashMap::new(),
            emitted: 0,
        }
    }

    pub fn set_enhancement_mode(&mut self, mode: EnhancementMode) {
        self.mode = mode;
    }

    pub fn on_trade(
        &mut self,
        event: &EnrichedTradeEvent,
        lens: &MarketLens<'_>,
    ) -> Result<Vec<SignalCandidate>, EngineError> {
        if lens.book_stale || event.best_bid.is_none() || event.best_ask.is_none() {
            return Ok(Vec::new());
        }
        let Some(zone) = event.zone(self.primary_zone_ticks) else {
            return Ok(Vec::new());
        };
        let trade = &event.trade;
        let now_ms = trade.timestamp_ms;
        let zone_key = zone.boundaries.min.raw();

        let window_ms = self.window_ms;
        let series = self
            .series
            .entry(zone_key)
            .or_insert_with(|| ZoneSeries::new(window_ms));
        series.totals.push(now_ms, zone.passive_volume);
        series.bids.push(now_ms, zone.passive_bid_volume);
        series.asks.push(now_ms, zone.passive_ask_volume);
        series.aggressive.push(now_ms, trade.quantity);

        if series.totals.len() < 2 {
            return Ok(Vec::new());
        }

        let current = zone.passive_volume;
        let peak = series.totals.max().unwrap_or(FixedPoint::ZERO);
        let avg = series.totals.mean();
        let recent_aggressive = series.aggressive.sum();

        // Pre-gates from configuration.
        let depletion = recent_aggressive.safe_div(current.max(FixedPoint::from_raw(1)));
        let passive_ratio = current.safe_div(peak);
        if depletion < FixedPoint::from_f64(self.cfg.min_depletion_factor) {
            return Ok(Vec::new());
        }
        if passive_ratio > FixedPoint::from_f64(self.cfg.max_passive_ratio) {
            return Ok(Vec::new());
        }

        // Which side is collapsing: the one furthest below its own peak.
        let bid_ratio = zone
            .passive_bid_volume
            .safe_div(series.bids.max().unwrap_or(FixedPoint::ZERO));
        let ask_ratio = zone
            .passive_ask_volume
            .safe_div(series.asks.max().unwrap_or(FixedPoint::ZERO));
        let exhausted_side = if bid_ratio <= ask_ratio {
            BookSide::Bid
        } else {
            BookSide::Ask
        };
        let side = exhausted_side.opposing_signal();

        if !self.cooldowns.ready(zone_key, side, now_ms) {
            return Ok(Vec::new());
        }
        if lens.was_spoofed(trade.price, exhausted_side, now_ms) {
            return Ok(Vec::new());
        }
        let current_side_qty = match exhausted_side {
            BookSide::Bid => zone.passive_bid_volume,
            BookSide::Ask => zone.passive_ask_volume,
        };
        if lens.refill_status(trade.price, exhausted_side, current_side_qty)
            == RefillStatus::Refilled
        {
            debug!(price = %trade.price, side = ?exhausted_side, "exhaustion vetoed by refill");
            return Ok(Vec::new());
        }

        let score = score_series(
            &self.cfg,
            self.mode,
            event,
            series,
            zone.passive_bid_volume,
            zone.passive_ask_volume,
            depletion,
            passive_ratio,
            avg,
        );
        if score < FixedPoint::from_f64(self.cfg.exhaustion_threshold) {
            return Ok(Vec::new());
        }

        self.cooldowns.arm(zone_key, side, now_ms);
        self.emitted += 1;
        debug!(
            price = %trade.price,
            exhausted = ?exhausted_side,
            score = %score,
            depletion = %depletion,
            passive_ratio = %passive_ratio,
            "exhaustion signal"
        );
        Ok(vec![SignalCandidate::new(
            SignalType::Exhaustion,
            side,
            trade.price,
            score,
            now_ms,
            Self::ID,
            SignalData::Exhaustion {
                score,
                depletion_ratio: depletion,
                passive_ratio,
                exhausted_side,
            },
        )])
    }

    pub fn gc(&mut self, now_ms: i64) {
        let window = self.window_ms;
        self.series.retain(|_, s| {
            s.totals
                .last()
                .is_some_and(|l| now_ms - l.timestamp_ms <= window)
        });
        self.cooldowns.gc(now_ms);
    }
}

/// Additive bonus table, cumulative across crossed thresholds, clamped to
/// [0, 1], discounted for thin series.
#[allow(clippy::too_many_arguments)]
fn score_series(
    cfg: &ExhaustionConfig,
    mode: EnhancementMode,
    event: &EnrichedTradeEvent,
    series: &ZoneSeries,
    current_bid: FixedPoint,
    current_ask: FixedPoint,
    depletion: FixedPoint,
    passive_ratio: FixedPoint,
    avg: FixedPoint,
) -> FixedPoint {
    let fp = FixedPoint::from_f64;
    let mut score = FixedPoint::ZERO;

    for (threshold, bonus) in [(5.0, 0.15), (10.0, 0.25), (20.0, 0.35)] {
        if depletion >= fp(threshold) {
            score += fp(bonus);
        }
    }
    for (threshold, bonus) in [(0.6, 0.10), (0.4, 0.15), (0.2, 0.25)] {
        if passive_ratio <= fp(threshold) {
            score += fp(bonus);
        }
    }

    // Refill gap: the series ends below where it started.
    if let (Some(first), Some(last)) = (series.totals.first(), series.totals.last()) {
        let gap = last.value - first.value;
        if gap < -(avg * fp(0.5)) {
            score += fp(0.15);
        } else if gap.is_negative() {
            score += fp(0.10);
        }

        if cfg.features.depletion_velocity && mode != EnhancementMode::Disabled {
            let dt_ms = last.timestamp_ms - first.timestamp_ms;
            if dt_ms > 0 {
                let per_second = gap.mul_int(1_000).safe_div(FixedPoint::from_int(dt_ms));
                if per_second < fp(-100.0) {
                    score += fp(0.05);
                }
            }
        }
    }

    let total = current_bid + current_ask;
    let imbalance = (current_bid - current_ask).abs().safe_div(total);
    for (threshold, bonus) in [(0.6, 0.05), (0.8, 0.10)] {
        if imbalance > fp(threshold) {
            score += fp(bonus);
        }
    }

    if cfg.features.spread_expansion && mode != EnhancementMode::Disabled {
        if let (Some(bid), Some(ask)) = (event.best_bid, event.best_ask) {
            let mid = (bid + ask) / FixedPoint::from_int(2);
            let spread_frac = (ask - bid).safe_div(mid);
            for (threshold, bonus) in [(0.002, 0.03), (0.005, 0.05)] {
                if spread_frac > fp(threshold) {
                    score += fp(bonus);
                }
            }
        }
    }

    if series.totals.len() < THIN_SERIES_FLOOR {
        score = score * fp(THIN_SERIES_PENALTY);
    }
    score.clamp(FixedPoint::ZERO, FixedPoint::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::absorption::tests::{StubIceberg, StubSpoof};
    use crate::book::passive::PassiveVolumeTracker;
    use crate::feed::AggressiveTrade;
    use crate::pipeline::{OrderFlowPreprocessor, ZoneSnapshot};
    use crate::book::OrderBookState;
    use crate::config::OrderBookConfig;
    use crate::feed::{DepthSnapshot, DepthUpdateEvent};

    fn fp(s: &str) -> FixedPoint {
        FixedPoint::parse(s).unwrap()
    }

    /// Drive the real book/preprocessor through a bid-side collapse:
    /// passive bids 1000 -> 900 -> 700 -> 400 -> 150 over 10s while 800 of
    /// aggressive sell volume hits the zone.
    fn run_collapse(det: &mut ExhaustionDetector) -> Vec<SignalCandidate> {
        let mut book = OrderBookState::new("BTCUSDT", OrderBookConfig::default(), fp("0.01"));
        book.apply_snapshot(
            &DepthSnapshot {
                last_update_id: 1,
                bids: vec![["89.00".into(), "1000".into()]],
                asks: vec![["89.01".into(), "5".into()]],
            },
            0,
        )
        .unwrap();
        let mut passives = PassiveVolumeTracker::new(64, 90_000);
        let mut pre = OrderFlowPreprocessor::new(&[5, 10, 20], 20, fp("0.01"), 64, 90_000);
        let spoof = StubSpoof(false);
        let icebergs = StubIceberg(false);

        let mut signals = Vec::new();
        let levels = ["900", "700", "400", "150"];
        for (i, remaining) in levels.iter().enumerate() {
            let ts = (i as i64 + 1) * 2_500;
            // 200 sold into the bid, book steps down.
            let ev = pre
                .process(
                    AggressiveTrade {
                        trade_id: i as u64,
                        pair: "BTCUSDT".into(),
                        price: fp("89.00"),
                        quantity: fp("200"),
                        timestamp_ms: ts,
                        buyer_is_maker: true,
                    },
                    &book,
                    &mut passives,
                )
                .clone();
            let lens = MarketLens {
                spoofing: &spoof,
                icebergs: &icebergs,
                passives: &passives,
                book_stale: false,
            };
            signals.extend(det.on_trade(&ev, &lens).unwrap());

            book.apply(
                &DepthUpdateEvent {
                    event_time: ts,
                    first_update_id: i as i64 + 2,
                    final_update_id: i as i64 + 2,
                    bids: vec![["89.00".to_string(), remaining.to_string()]],
                    asks: vec![],
                },
                ts,
            );
        }
        // One more trade observes the 150 floor.
        let ev = pre
            .process(
                AggressiveTrade {
                    trade_id: 99,
                    pair: "BTCUSDT".into(),
                    price: fp("89.00"),
                    quantity: fp("1"),
                    timestamp_ms: 11_000,
                    buyer_is_maker: true,
                },
                &book,
                &mut passives,
            )
            .clone();
        let lens = MarketLens {
            spoofing: &spoof,
            icebergs: &icebergs,
            passives: &passives,
            book_stale: false,
        };
        signals.extend(det.on_trade(&ev, &lens).unwrap());
        signals
    }

    #[test]
    fn test_bid_collapse_emits_sell() {
        let mut det = ExhaustionDetector::new(ExhaustionConfig::default(), 10, 90_000);
        let signals = run_collapse(&mut det);
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::Exhaustion);
        assert_eq!(s.side, crate::types::Side::Sell);
        assert!(s.confidence >= fp("0.7"));
        match s.data {
            SignalData::Exhaustion {
                exhausted_side,
                depletion_ratio,
                passive_ratio,
                ..
            } => {
                assert_eq!(exhausted_side, BookSide::Bid);
                assert!(depletion_ratio >= fp("5"));
                assert!(passive_ratio <= fp("0.2"));
            }
            _ => panic!("unexpected payload"),
        }
    }

    #[test]
    fn test_cooldown_blocks_repeat() {
        let mut det = ExhaustionDetector::new(ExhaustionConfig::default(), 10, 90_000);
        let first = run_collapse(&mut det);
        assert_eq!(first.len(), 1);
        // Re-running the same collapse immediately hits the cooldown (the
        // detector state keeps the zone keyed cooldown armed).
        let second = run_collapse(&mut det);
        assert!(second.is_empty());
    }

    #[test]
    fn test_healthy_book_stays_silent() {
        let mut det = ExhaustionDetector::new(ExhaustionConfig::default(), 10, 90_000);
        let mut book = OrderBookState::new("BTCUSDT", OrderBookConfig::default(), fp("0.01"));
        book.apply_snapshot(
            &DepthSnapshot {
                last_update_id: 1,
                bids: vec![["89.00".into(), "1000".into()]],
                asks: vec![["89.01".into(), "900".into()]],
            },
            0,
        )
        .unwrap();
        let mut passives = PassiveVolumeTracker::new(64, 90_000);
        let mut pre = OrderFlowPreprocessor::new(&[5, 10, 20], 20, fp("0.01"), 64, 90_000);
        let spoof = StubSpoof(false);
        let icebergs = StubIceberg(false);

        for i in 0..10 {
            let ev = pre
                .process(
                    AggressiveTrade {
                        trade_id: i,
                        pair: "BTCUSDT".into(),
                        price: fp("89.00"),
                        quantity: fp("10"),
                        timestamp_ms: (i as i64 + 1) * 500,
                        buyer_is_maker: true,
                    },
                    &book,
                    &mut passives,
                )
                .clone();
            let lens = MarketLens {
                spoofing: &spoof,
                icebergs: &icebergs,
                passives: &passives,
                book_stale: false,
            };
            assert!(det.on_trade(&ev, &lens).unwrap().is_empty());
        }
    }

    #[test]
    fn test_zone_view_is_required() {
        let mut det = ExhaustionDetector::new(ExhaustionConfig::default(), 10, 90_000);
        let ev = EnrichedTradeEvent {
            trade: AggressiveTrade {
                trade_id: 1,
                pair: "BTCUSDT".into(),
                price: fp("89.00"),
                quantity: fp("10"),
                timestamp_ms: 1_000,
                buyer_is_maker: true,
            },
            passive_bid_volume: FixedPoint::ZERO,
            passive_ask_volume: FixedPoint::ZERO,
            zone_passive_bid_volume: FixedPoint::ZERO,
            zone_passive_ask_volume: FixedPoint::ZERO,
            best_bid: Some(fp("89.00")),
            best_ask: Some(fp("89.01")),
            zone_data: Vec::<ZoneSnapshot>::new(),
        };
        let passives = PassiveVolumeTracker::new(4, 1_000);
        let spoof = StubSpoof(false);
        let icebergs = StubIceberg(false);
        let lens = MarketLens {
            spoofing: &spoof,
            icebergs: &icebergs,
            passives: &passives,
            book_stale: false,
        };
        assert!(det.on_trade(&ev, &lens).unwrap().is_empty());
    }
}
