//! Delta-CVD detector: momentum from z-scored cumulative volume delta.
//!
//! Maintains the signed aggressive volume delta over a rolling window and
//! compares the current value against the window's own recent population.
//! An extreme z-score with enough trades and volume behind it becomes a
//! `cvd_confirmation` candidate in the direction of the delta.

use crate::config::DeltaCvdConfig;
use crate::detectors::{CooldownTracker, MarketLens, SignalCandidate, SignalData};
use crate::error::EngineError;
use crate::num::fixed::FixedPoint;
use crate::num::rolling::RollingWindow;
use crate::pipeline::EnrichedTradeEvent;
use crate::types::{Side, SignalType};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::VecDeque;
use tracing::debug;

/// Minimum delta samples before a z-score is meaningful.
const MIN_SAMPLES: usize = 30;

pub struct DeltaCvdDetector {
    cfg: DeltaCvdConfig,
    window_ms: i64,
    trades: VecDeque<(i64, FixedPoint)>,
    delta_sum: FixedPoint,
    volume_sum: FixedPoint,
    samples: RollingWindow,
    cooldowns: CooldownTracker,
    pub emitted: u64,
}

impl DeltaCvdDetector {
    pub const ID: &'static str = "deltacvd";

    pub fn new(cfg: DeltaCvdConfig, window_ms: i64) -> Self {
        let samples = RollingWindow::new(cfg.sample_capacity, window_ms * 4);
        let cooldowns = CooldownTracker::new(cfg.event_cooldown_ms);
        Self {
            cfg,
            window_ms,
            trades: VecDeque::new(),
            delta_sum: FixedPoint::ZERO,
            volume_sum: FixedPoint::ZERO,
            samples,
            cooldowns,
            emitted: 0,
        }
    }

    pub fn on_trade(
        &mut self,
        event: &EnrichedTradeEvent,
        lens: &MarketLens<'_>,
    ) -> Result<Vec<SignalCandidate>, EngineError> {
        if lens.book_stale {
            return Ok(Vec::new());
        }
        let trade = &event.trade;
        let now_ms = trade.timestamp_ms;

        let signed = if trade.is_aggressive_buy() {
            trade.quantity
        } else {
            -trade.quantity
        };
        self.trades.push_back((now_ms, signed));
        self.delta_sum += signed;
        self.volume_sum += signed.abs();
        let cutoff = now_ms - self.window_ms;
        while let Some(&(ts, qty)) = self.trades.front() {
            if ts >= cutoff {
                break;
            }
            self.trades.pop_front();
            self.delta_sum -= qty;
            self.volume_sum -= qty.abs();
        }

        let current = self.delta_sum;
        self.samples.push(now_ms, current);

        if (self.trades.len() as u64) < self.cfg.min_trades_per_window
            || self.volume_sum < FixedPoint::from_f64(self.cfg.min_volume_per_window)
            || self.samples.len() < MIN_SAMPLES
        {
            return Ok(Vec::new());
        }

        let mean = self.samples.mean();
        let std = self.samples.std_dev();
        if !std.is_positive() {
            return Ok(Vec::new());
        }
        let z = (current - mean).safe_div(std);
        if z.abs() < FixedPoint::from_f64(self.cfg.z_threshold) {
            return Ok(Vec::new());
        }

        let side = if z.is_positive() { Side::Buy } else { Side::Sell };
        if !self.cooldowns.ready(0, side, now_ms) {
            return Ok(Vec::new());
        }
        self.cooldowns.arm(0, side, now_ms);

        // Confidence maps |z| through the normal CDF: 2 * phi(|z|) - 1.
        let phi = Normal::new(0.0, 1.0)
            .map_err(|e| EngineError::DetectorComputation {
                detector_id: Self::ID,
                reason: e.to_string(),
            })?
            .cdf(z.abs().to_f64());
        let confidence = FixedPoint::from_f64(2.0 * phi - 1.0);

        self.emitted += 1;
        debug!(
            price = %trade.price,
            z = %z,
            delta = %current,
            side = ?side,
            "cvd confirmation"
        );
        Ok(vec![SignalCandidate::new(
            SignalType::CvdConfirmation,
            side,
            trade.price,
            confidence,
            now_ms,
            Self::ID,
            SignalData::CvdConfirmation {
                z_score: z,
                cumulative_delta: current,
                window_trades: self.trades.len() as u64,
            },
        )])
    }

    pub fn gc(&mut self, now_ms: i64) {
        self.cooldowns.gc(now_ms);
        self.samples.evict_older_than(now_ms - self.window_ms * 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::absorption::tests::{StubIceberg, StubSpoof};
    use crate::book::passive::PassiveVolumeTracker;
    use crate::feed::AggressiveTrade;

    fn fp(s: &str) -> FixedPoint {
        FixedPoint::parse(s).unwrap()
    }

    fn event(qty: &str, ts: i64, buy: bool) -> EnrichedTradeEvent {
        EnrichedTradeEvent {
            trade: AggressiveTrade {
                trade_id: ts as u64,
                pair: "BTCUSDT".into(),
                price: fp("89.00"),
                quantity: fp(qty),
                timestamp_ms: ts,
                buyer_is_maker: !buy,
            },
            passive_bid_volume: FixedPoint::ZERO,
            passive_ask_volume: FixedPoint::ZERO,
            zone_passive_bid_volume: FixedPoint::ZERO,
            zone_passive_ask_volume: FixedPoint::ZERO,
            best_bid: Some(fp("89.00")),
            best_ask: Some(fp("89.01")),
            zone_data: Vec::new(),
        }
    }

    fn run(det: &mut DeltaCvdDetector, events: impl Iterator<Item = EnrichedTradeEvent>) -> Vec<SignalCandidate> {
        let passives = PassiveVolumeTracker::new(4, 1_000);
        let spoof = StubSpoof(false);
        let icebergs = StubIceberg(false);
        let lens = MarketLens {
            spoofing: &spoof,
            icebergs: &icebergs,
            passives: &passives,
            book_stale: false,
        };
        let mut out = Vec::new();
        for ev in events {
            out.extend(det.on_trade(&ev, &lens).unwrap());
        }
        out
    }

    fn detector() -> DeltaCvdDetector {
        DeltaCvdDetector::new(
            DeltaCvdConfig {
                z_threshold: 2.0,
                min_trades_per_window: 10,
                min_volume_per_window: 50.0,
                event_cooldown_ms: 20_000,
                sample_capacity: 512,
            },
            60_000,
        )
    }

    #[test]
    fn test_buy_burst_confirms_up_momentum() {
        let mut det = detector();
        // Balanced chop to build the sample population...
        let balanced = (0..40).map(|i| event("5", 1_000 + i * 250, i % 2 == 0));
        assert!(run(&mut det, balanced).is_empty());
        // ...then a one-sided buy burst.
        let burst = (0..12).map(|i| event("40", 12_000 + i * 100, true));
        let signals = run(&mut det, burst);
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::CvdConfirmation);
        assert_eq!(s.side, Side::Buy);
        assert!(s.confidence >= fp("0.9"));
        match s.data {
            SignalData::CvdConfirmation { z_score, .. } => {
                assert!(z_score >= fp("2"));
            }
            _ => panic!("unexpected payload"),
        }
    }

    #[test]
    fn test_sell_burst_confirms_down_momentum() {
        let mut det = detector();
        let balanced = (0..40).map(|i| event("5", 1_000 + i * 250, i % 2 == 0));
        run(&mut det, balanced);
        let burst = (0..12).map(|i| event("40", 12_000 + i * 100, false));
        let signals = run(&mut det, burst);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
    }

    #[test]
    fn test_balanced_flow_stays_silent() {
        let mut det = detector();
        let balanced = (0..200).map(|i| event("10", 1_000 + i * 100, i % 2 == 0));
        assert!(run(&mut det, balanced).is_empty());
    }

    #[test]
    fn test_cooldown_limits_repeat_confirmations() {
        let mut det = detector();
        let balanced = (0..40).map(|i| event("5", 1_000 + i * 250, i % 2 == 0));
        run(&mut det, balanced);
        let burst = (0..40).map(|i| event("40", 12_000 + i * 100, true));
        let signals = run(&mut det, burst);
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn test_thin_tape_is_ignored() {
        let mut det = detector();
        // Strong one-way flow but too few trades in the window.
        let burst = (0..8).map(|i| event("100", 1_000 + i * 100, true));
        assert!(run(&mut det, burst).is_empty());
    }
}
