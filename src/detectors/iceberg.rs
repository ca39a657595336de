//! Iceberg detector: fragmented large orders at one price level.
//!
//! A candidate accumulates "pieces" while consecutive fills at the same
//! `(price, passive side)` arrive within `max_refill_time_ms` of each
//! other. Qualification needs enough pieces, enough total size, uniform
//! piece sizes and a confident composite score.

use crate::config::IcebergConfig;
use crate::detectors::anomaly::{AnomalyEvent, AnomalyKind, AnomalySeverity};
use crate::detectors::{IcebergCapability, SignalCandidate, SignalData};
use crate::num::fixed::{FixedPoint, StatAccumulator};
use crate::pipeline::EnrichedTradeEvent;
use crate::types::{BookSide, Side, SignalType};
use std::collections::HashMap;
use tracing::{debug, info};

const MIN_CONFIDENCE: f64 = 0.6;

#[derive(Debug)]
struct IcebergCandidate {
    pieces: u32,
    total: FixedPoint,
    sizes: StatAccumulator,
    gaps: StatAccumulator,
    first_fill_ms: i64,
    last_fill_ms: i64,
    emitted: bool,
}

impl IcebergCandidate {
    fn start(qty: FixedPoint, now_ms: i64) -> Self {
        let mut sizes = StatAccumulator::new();
        sizes.push(qty);
        Self {
            pieces: 1,
            total: qty,
            sizes,
            gaps: StatAccumulator::new(),
            first_fill_ms: now_ms,
            last_fill_ms: now_ms,
            emitted: false,
        }
    }

    fn add_piece(&mut self, qty: FixedPoint, now_ms: i64) {
        self.gaps
            .push(FixedPoint::from_int(now_ms - self.last_fill_ms));
        self.pieces += 1;
        self.total += qty;
        self.sizes.push(qty);
        self.last_fill_ms = now_ms;
    }

    /// Coefficient of variation of piece sizes.
    fn size_cv(&self) -> FixedPoint {
        self.sizes.std_dev().safe_div(self.sizes.mean())
    }

    fn gap_cv(&self) -> FixedPoint {
        self.gaps.std_dev().safe_div(self.gaps.mean())
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveIceberg {
    price: FixedPoint,
    side: BookSide,
    qualified_ms: i64,
    total: FixedPoint,
}

pub struct IcebergDetector {
    cfg: IcebergConfig,
    min_total: FixedPoint,
    institutional_size: FixedPoint,
    candidates: HashMap<(i128, BookSide), IcebergCandidate>,
    active: Vec<ActiveIceberg>,
    outbox: Vec<AnomalyEvent>,
}

impl IcebergDetector {
    pub const ID: &'static str = "iceberg";

    pub fn new(cfg: IcebergConfig) -> Self {
        let min_total = FixedPoint::from_f64(cfg.min_total_size);
        let institutional_size = FixedPoint::from_f64(cfg.institutional_size_threshold);
        Self {
            cfg,
            min_total,
            institutional_size,
            candidates: HashMap::new(),
            active: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn on_trade(&mut self, event: &EnrichedTradeEvent) -> Vec<SignalCandidate> {
        let trade = &event.trade;
        let now_ms = trade.timestamp_ms;
        // The refilled order rests on the passive side being hit.
        let side = if trade.buyer_is_maker {
            BookSide::Bid
        } else {
            BookSide::Ask
        };
        let key = (trade.price.raw(), side);

        let max_refill_gap = self.cfg.max_refill_time_ms;
        let candidate = self
            .candidates
            .entry(key)
            .and_modify(|c| {
                if now_ms - c.last_fill_ms > max_refill_gap {
                    *c = IcebergCandidate::start(trade.quantity, now_ms);
                } else {
                    c.add_piece(trade.quantity, now_ms);
                }
            })
            .or_insert_with(|| IcebergCandidate::start(trade.quantity, now_ms));

        if candidate.emitted
            || candidate.pieces < self.cfg.min_refill_count
            || candidate.total < self.min_total
        {
            return Vec::new();
        }
        let size_cv = candidate.size_cv();
        if size_cv > FixedPoint::from_f64(self.cfg.max_size_variation) {
            return Vec::new();
        }

        let confidence = composite_confidence(candidate, size_cv, self.min_total, self.institutional_size);
        if confidence < FixedPoint::from_f64(MIN_CONFIDENCE) {
            return Vec::new();
        }

        candidate.emitted = true;
        let total = candidate.total;
        let pieces = candidate.pieces;
        info!(
            price = %trade.price,
            side = ?side,
            pieces,
            total = %total,
            confidence = %confidence,
            "iceberg qualified"
        );

        if self.active.len() >= self.cfg.max_active_icebergs {
            self.active.remove(0);
        }
        self.active.push(ActiveIceberg {
            price: trade.price,
            side,
            qualified_ms: now_ms,
            total,
        });
        self.outbox.push(AnomalyEvent {
            kind: AnomalyKind::Iceberg,
            severity: AnomalySeverity::Medium,
            price: Some(trade.price),
            timestamp_ms: now_ms,
        });

        // A hidden buyer refilling the bid is support; mirrored for asks.
        let signal_side = match side {
            BookSide::Bid => Side::Buy,
            BookSide::Ask => Side::Sell,
        };
        vec![SignalCandidate::new(
            SignalType::Iceberg,
            signal_side,
            trade.price,
            confidence,
            now_ms,
            Self::ID,
            SignalData::Iceberg {
                pieces,
                total_size: total,
                passive_side: side,
            },
        )]
    }

    pub fn take_anomaly_events(&mut self) -> Vec<AnomalyEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Retire candidates and active zones that left the tracking window.
    pub fn gc(&mut self, now_ms: i64) {
        let window = self.cfg.tracking_window_ms;
        let before = self.candidates.len();
        self.candidates
            .retain(|_, c| now_ms - c.last_fill_ms <= window);
        self.active.retain(|a| now_ms - a.qualified_ms <= window);
        if before != self.candidates.len() {
            debug!(
                retired = before - self.candidates.len(),
                "iceberg candidates retired"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Weighted composite of size consistency, piece count, total size,
/// institutional piece size and temporal consistency.
fn composite_confidence(
    candidate: &IcebergCandidate,
    size_cv: FixedPoint,
    min_total: FixedPoint,
    institutional_size: FixedPoint,
) -> FixedPoint {
    let one = FixedPoint::ONE;
    let size_consistency = (one - size_cv).max(FixedPoint::ZERO);
    let piece_score = FixedPoint::from_int(candidate.pieces as i64)
        .safe_div(FixedPoint::from_int(10))
        .min(one);
    let total_score = candidate.total.safe_div(min_total.mul_int(4)).min(one);
    let institutional = candidate.sizes.mean().safe_div(institutional_size).min(one);
    let temporal = (one - candidate.gap_cv()).max(FixedPoint::ZERO);

    size_consistency * FixedPoint::from_f64(0.30)
        + piece_score * FixedPoint::from_f64(0.20)
        + total_score * FixedPoint::from_f64(0.20)
        + institutional * FixedPoint::from_f64(0.20)
        + temporal * FixedPoint::from_f64(0.10)
}

impl IcebergCapability for IcebergDetector {
    fn iceberg_active_near(&self, price: FixedPoint, band: FixedPoint, now_ms: i64) -> bool {
        self.active.iter().any(|a| {
            (a.price - price).abs() <= band
                && now_ms - a.qualified_ms <= self.cfg.tracking_window_ms
        })
    }
}
