//! Per-price passive liquidity history and refill detection.
//!
//! Samples `(timestamp, bid, ask)` are pushed from the book on applied depth
//! updates and from the preprocessor on every trade. Detectors consume this
//! through the read-only refill capability.

use crate::num::fixed::FixedPoint;
use crate::num::rolling::RollingWindow;
use crate::types::BookSide;
use std::collections::HashMap;

/// Outcome of a refill probe at a price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillStatus {
    /// No meaningful depletion observed.
    Stable,
    /// Liquidity is draining against its recent average.
    Depleting,
    /// A drop was followed by a return to >= 80% of the pre-drop level.
    Refilled,
    /// Not enough history at this price.
    Unknown,
}

/// A level counts as dropped once it loses this fraction of its peak.
const DROP_FRACTION: f64 = 0.2;

/// Refill means returning to at least this fraction of the pre-drop peak.
const REFILL_FRACTION: f64 = 0.8;

/// Depleting means the current quantity is under this fraction of the
/// window mean.
const DEPLETION_FRACTION: f64 = 0.5;

struct PriceHistory {
    bid: RollingWindow,
    ask: RollingWindow,
    last_seen_ms: i64,
}

pub struct PassiveVolumeTracker {
    capacity: usize,
    retention_ms: i64,
    histories: HashMap<FixedPoint, PriceHistory>,
}

impl PassiveVolumeTracker {
    pub fn new(capacity: usize, retention_ms: i64) -> Self {
        Self {
            capacity,
            retention_ms,
            histories: HashMap::new(),
        }
    }

    pub fn push_sample(
        &mut self,
        price: FixedPoint,
        bid: FixedPoint,
        ask: FixedPoint,
        timestamp_ms: i64,
    ) {
        let capacity = self.capacity;
        let retention = self.retention_ms;
        let history = self.histories.entry(price).or_insert_with(|| PriceHistory {
            bid: RollingWindow::new(capacity, retention),
            ask: RollingWindow::new(capacity, retention),
            last_seen_ms: timestamp_ms,
        });
        history.bid.push(timestamp_ms, bid);
        history.ask.push(timestamp_ms, ask);
        history.last_seen_ms = timestamp_ms;
    }

    fn window(&self, price: FixedPoint, side: BookSide) -> Option<&RollingWindow> {
        let history = self.histories.get(&price)?;
        Some(match side {
            BookSide::Bid => &history.bid,
            BookSide::Ask => &history.ask,
        })
    }

    /// Mean passive quantity on one side over the trailing `window_ms`.
    pub fn average_passive(&self, price: FixedPoint, side: BookSide, window_ms: i64) -> FixedPoint {
        self.window(price, side)
            .map(|w| w.mean_within(window_ms))
            .unwrap_or(FixedPoint::ZERO)
    }

    /// True when the side dropped and then recovered to at least 80% of its
    /// pre-drop level inside the retained window.
    pub fn has_refilled(&self, price: FixedPoint, side: BookSide) -> bool {
        let Some(window) = self.window(price, side) else {
            return false;
        };
        let drop_keep = FixedPoint::from_f64(1.0 - DROP_FRACTION);
        let refill = FixedPoint::from_f64(REFILL_FRACTION);

        let mut peak = FixedPoint::ZERO;
        let mut dropped_from = FixedPoint::ZERO;
        for sample in window.iter() {
            let v = sample.value;
            if dropped_from.is_positive() && v >= dropped_from * refill {
                return true;
            }
            if peak.is_positive() && v < peak * drop_keep && dropped_from.is_zero() {
                dropped_from = peak;
            }
            if v > peak {
                peak = v;
            }
        }
        false
    }

    /// Classify the current quantity against the level's history.
    pub fn check_refill_status(
        &self,
        price: FixedPoint,
        side: BookSide,
        current_qty: FixedPoint,
    ) -> RefillStatus {
        let Some(window) = self.window(price, side) else {
            return RefillStatus::Unknown;
        };
        if window.len() < 3 {
            return RefillStatus::Unknown;
        }
        if self.has_refilled(price, side) {
            return RefillStatus::Refilled;
        }
        let mean = window.mean();
        if mean.is_positive() && current_qty < mean * FixedPoint::from_f64(DEPLETION_FRACTION) {
            return RefillStatus::Depleting;
        }
        RefillStatus::Stable
    }

    /// Drop histories whose newest sample fell out of retention.
    pub fn gc(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.retention_ms;
        self.histories.retain(|_, h| h.last_seen_ms >= cutoff);
    }

    pub fn tracked_prices(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(v: i64) -> FixedPoint {
        FixedPoint::from_int(v)
    }

    fn tracker_with(values: &[i64]) -> (PassiveVolumeTracker, FixedPoint) {
        let mut t = PassiveVolumeTracker::new(64, 60_000);
        let price = FixedPoint::parse("89.00").unwrap();
        for (i, v) in values.iter().enumerate() {
            t.push_sample(price, fp(*v), fp(10), (i as i64 + 1) * 100);
        }
        (t, price)
    }

    #[test]
    fn test_average_passive() {
        let (t, price) = tracker_with(&[100, 200, 300]);
        assert_eq!(t.average_passive(price, BookSide::Bid, 60_000), fp(200));
        assert_eq!(t.average_passive(price, BookSide::Ask, 60_000), fp(10));
        assert_eq!(
            t.average_passive(FixedPoint::parse("1.0").unwrap(), BookSide::Bid, 60_000),
            FixedPoint::ZERO
        );
    }

    #[test]
    fn test_has_refilled_detects_drop_and_return() {
        // 1000 -> 300 (drop) -> 900 (>= 80% of 1000).
        let (t, price) = tracker_with(&[1_000, 300, 900]);
        assert!(t.has_refilled(price, BookSide::Bid));
    }

    #[test]
    fn test_no_refill_without_recovery() {
        let (t, price) = tracker_with(&[1_000, 300, 400]);
        assert!(!t.has_refilled(price, BookSide::Bid));
    }

    #[test]
    fn test_no_refill_on_monotonic_growth() {
        let (t, price) = tracker_with(&[100, 200, 300, 400]);
        assert!(!t.has_refilled(price, BookSide::Bid));
    }

    #[test]
    fn test_refill_status_classification() {
        let (t, price) = tracker_with(&[1_000, 950, 900]);
        assert_eq!(
            t.check_refill_status(price, BookSide::Bid, fp(920)),
            RefillStatus::Stable
        );
        assert_eq!(
            t.check_refill_status(price, BookSide::Bid, fp(100)),
            RefillStatus::Depleting
        );

        let (t, price) = tracker_with(&[1_000, 300, 900]);
        assert_eq!(
            t.check_refill_status(price, BookSide::Bid, fp(900)),
            RefillStatus::Refilled
        );

        let (t, price) = tracker_with(&[1_000]);
        assert_eq!(
            t.check_refill_status(price, BookSide::Bid, fp(10)),
            RefillStatus::Unknown
        );
    }

    #[test]
    fn test_gc_drops_stale_histories() {
        let mut t = PassiveVolumeTracker::new(64, 1_000);
        t.push_sample(fp(89), fp(10), fp(10), 100);
        t.push_sample(fp(90), fp(10), fp(10), 5_000);
        t.gc(5_500);
        assert_eq!(t.tracked_prices(), 1);
    }
}
