//! Spoofing detector: placed-then-cancelled walls near the traded price.
//!
//! A wall is a resting quantity at least `min_wall_size` within
//! `wall_ticks` of the current trade. When a tracked wall shrinks below the
//! cancel fraction of its peak without matching traded volume, the
//! disappearance is classified as a cancellation and the price
//! neighbourhood is tainted for `spoof_window_ms`.

use crate::book::OrderBookState;
use crate::config::SpoofingConfig;
use crate::detectors::anomaly::{AnomalyEvent, AnomalyKind, AnomalySeverity};
use crate::detectors::SpoofCapability;
use crate::num::fixed::FixedPoint;
use crate::pipeline::EnrichedTradeEvent;
use crate::types::BookSide;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

const MAX_EVENTS: usize = 256;

/// Fraction of a wall's disappearance that must be traded volume for the
/// shrink to count as consumption rather than cancellation.
const CONSUMED_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct WallTrack {
    peak_qty: FixedPoint,
    traded_against: FixedPoint,
    last_seen_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct SpoofEvent {
    price: FixedPoint,
    side: BookSide,
    timestamp_ms: i64,
}

pub struct SpoofingDetector {
    cfg: SpoofingConfig,
    tick_size: FixedPoint,
    min_wall_size: FixedPoint,
    walls: HashMap<(i128, BookSide), WallTrack>,
    events: VecDeque<SpoofEvent>,
    outbox: Vec<AnomalyEvent>,
    pub cancelled_walls: u64,
}

impl SpoofingDetector {
    pub const ID: &'static str = "spoofing";

    pub fn new(cfg: SpoofingConfig, tick_size: FixedPoint) -> Self {
        let min_wall_size = FixedPoint::from_f64(cfg.min_wall_size);
        Self {
            cfg,
            tick_size,
            min_wall_size,
            walls: HashMap::new(),
            events: VecDeque::new(),
            outbox: Vec::new(),
            cancelled_walls: 0,
        }
    }

    fn wall_band(&self, book: &OrderBookState) -> FixedPoint {
        let mut band = self.tick_size.mul_int(self.cfg.wall_ticks as i64);
        if self.cfg.dynamic_wall_width {
            if let Some(spread) = book.spread() {
                band += spread;
            }
        }
        band
    }

    /// Track walls around the trade and classify disappearances.
    pub fn on_trade(&mut self, event: &EnrichedTradeEvent, book: &OrderBookState) {
        let trade = &event.trade;
        let now_ms = trade.timestamp_ms;
        let band = self.wall_band(book);
        let min = trade.price - band;
        let max = trade.price + band;

        // Credit traded volume against walls at the exact traded price.
        // An aggressive sell consumes the bid wall and vice versa.
        let consumed_side = if trade.is_aggressive_buy() {
            BookSide::Ask
        } else {
            BookSide::Bid
        };
        if let Some(track) = self.walls.get_mut(&(trade.price.raw(), consumed_side)) {
            track.traded_against += trade.quantity;
        }

        // Refresh tracked walls and discover new ones inside the band.
        for level in book.levels_in(min, max) {
            for (side, qty) in [(BookSide::Bid, level.bid), (BookSide::Ask, level.ask)] {
                let key = (level.price.raw(), side);
                if qty >= self.min_wall_size {
                    let track = self.walls.entry(key).or_insert(WallTrack {
                        peak_qty: qty,
                        traded_against: FixedPoint::ZERO,
                        last_seen_ms: now_ms,
                    });
                    if qty > track.peak_qty {
                        track.peak_qty = qty;
                    }
                    track.last_seen_ms = now_ms;
                }
            }
        }

        // Walls inside the band that shrank below the cancel fraction. A
        // shrink mostly unexplained by traded volume is a cancellation;
        // either way the track is finished.
        let cancel_keep = FixedPoint::from_f64(self.cfg.cancel_fraction);
        let consumed_fraction = FixedPoint::from_f64(CONSUMED_FRACTION);
        let mut finished: Vec<((i128, BookSide), bool)> = Vec::new();
        for (&(price_raw, side), track) in &self.walls {
            let price = FixedPoint::from_raw(price_raw);
            if price < min || price > max {
                continue;
            }
            let current = book
                .level(price)
                .map(|l| match side {
                    BookSide::Bid => l.bid,
                    BookSide::Ask => l.ask,
                })
                .unwrap_or(FixedPoint::ZERO);
            if current >= track.peak_qty * cancel_keep {
                continue;
            }
            let gone = track.peak_qty - current;
            let spoofed = track.traded_against < gone * consumed_fraction;
            finished.push(((price_raw, side), spoofed));
        }

        for ((price_raw, side), spoofed) in finished {
            let Some(track) = self.walls.remove(&(price_raw, side)) else {
                continue;
            };
            if !spoofed {
                continue;
            }
            let price = FixedPoint::from_raw(price_raw);
            self.cancelled_walls += 1;
            debug!(
                price = %price,
                side = ?side,
                peak = %track.peak_qty,
                traded = %track.traded_against,
                "wall cancelled without matching volume"
            );
            if self.events.len() >= MAX_EVENTS {
                self.events.pop_front();
            }
            self.events.push_back(SpoofEvent {
                price,
                side,
                timestamp_ms: now_ms,
            });
            self.outbox.push(AnomalyEvent {
                kind: AnomalyKind::Spoofing,
                severity: AnomalySeverity::High,
                price: Some(price),
                timestamp_ms: now_ms,
            });
        }
    }

    /// Drain anomaly events for the outbound port.
    pub fn take_anomaly_events(&mut self) -> Vec<AnomalyEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Forget walls that left the window.
    pub fn gc(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.cfg.spoof_window_ms;
        self.walls.retain(|_, t| t.last_seen_ms >= cutoff);
        while self
            .events
            .front()
            .is_some_and(|e| e.timestamp_ms < cutoff)
        {
            self.events.pop_front();
        }
    }
}

impl SpoofCapability for SpoofingDetector {
    fn was_spoofed(&self, price: FixedPoint, side: BookSide, now_ms: i64) -> bool {
        let band = self.tick_size.mul_int(self.cfg.wall_ticks as i64);
        let cutoff = now_ms - self.cfg.spoof_window_ms;
        self.events.iter().any(|e| {
            e.side == side && e.timestamp_ms >= cutoff && (e.price - price).abs() <= band
        })
    }
}
