//! Pattern detectors and their shared surface.
//!
//! Detectors consume enriched trades and emit `SignalCandidate`s toward the
//! signal manager. Cross-detector knowledge flows through read-only
//! capability traits (`SpoofCapability`, `IcebergCapability`, the passive
//! tracker) bundled into a `MarketLens`, never through direct references
//! between detectors.

pub mod absorption;
pub mod anomaly;
pub mod deltacvd;
pub mod exhaustion;
pub mod iceberg;
pub mod spoofing;
pub mod zones;

use crate::book::passive::{PassiveVolumeTracker, RefillStatus};
use crate::num::fixed::FixedPoint;
use crate::types::{BookSide, Side, SignalType};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

pub use zones::ZoneSignalData;

/// Structured, type-specific payload carried by a candidate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalData {
    Absorption {
        efficiency: FixedPoint,
        passive_ratio: FixedPoint,
        dominant_side: BookSide,
        zone_confluence: u32,
        refill_boost_applied: bool,
    },
    Exhaustion {
        score: FixedPoint,
        depletion_ratio: FixedPoint,
        passive_ratio: FixedPoint,
        exhausted_side: BookSide,
    },
    Zone(ZoneSignalData),
    CvdConfirmation {
        z_score: FixedPoint,
        cumulative_delta: FixedPoint,
        window_trades: u64,
    },
    Iceberg {
        pieces: u32,
        total_size: FixedPoint,
        passive_side: BookSide,
    },
}

/// Directional candidate emitted by a detector.
#[derive(Debug, Clone, Serialize)]
pub struct SignalCandidate {
    pub id: Uuid,
    pub signal_type: SignalType,
    pub side: Side,
    pub price: FixedPoint,
    /// Confidence in [0, 1].
    pub confidence: FixedPoint,
    pub timestamp_ms: i64,
    pub detector_id: &'static str,
    pub data: SignalData,
}

impl SignalCandidate {
    pub fn new(
        signal_type: SignalType,
        side: Side,
        price: FixedPoint,
        confidence: FixedPoint,
        timestamp_ms: i64,
        detector_id: &'static str,
        data: SignalData,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_type,
            side,
            price,
            confidence: confidence.clamp(FixedPoint::ZERO, FixedPoint::ONE),
            timestamp_ms,
            detector_id,
            data,
        }
    }
}

/// Read-only spoofing knowledge exposed to other detectors.
pub trait SpoofCapability {
    /// Was a wall near `price` on `side` cancelled recently?
    fn was_spoofed(&self, price: FixedPoint, side: BookSide, now_ms: i64) -> bool;
}

/// Read-only iceberg knowledge exposed to the zone detector.
pub trait IcebergCapability {
    fn iceberg_active_near(&self, price: FixedPoint, band: FixedPoint, now_ms: i64) -> bool;
}

/// Capability bundle handed to each detector per event. Holding only
/// read-only references keeps the detector graph acyclic.
pub struct MarketLens<'a> {
    pub spoofing: &'a dyn SpoofCapability,
    pub icebergs: &'a dyn IcebergCapability,
    pub passives: &'a PassiveVolumeTracker,
    /// True while the book is stale; best-bid/ask dependent detectors
    /// short-circuit to no-ops.
    pub book_stale: bool,
}

impl<'a> MarketLens<'a> {
    pub fn was_spoofed(&self, price: FixedPoint, side: BookSide, now_ms: i64) -> bool {
        self.spoofing.was_spoofed(price, side, now_ms)
    }

    pub fn refill_status(
        &self,
        price: FixedPoint,
        side: BookSide,
        current_qty: FixedPoint,
    ) -> RefillStatus {
        self.passives.check_refill_status(price, side, current_qty)
    }

    pub fn has_refilled(&self, price: FixedPoint, side: BookSide) -> bool {
        self.passives.has_refilled(price, side)
    }

    pub fn average_passive(&self, price: FixedPoint, side: BookSide, window_ms: i64) -> FixedPoint {
        self.passives.average_passive(price, side, window_ms)
    }
}

/// Per-`(zone, side)` cooldown bookkeeping shared by the emitting detectors.
///
/// Guarantees two accepted emissions for the same key are separated by at
/// least the configured interval.
#[derive(Debug)]
pub struct CooldownTracker {
    interval_ms: i64,
    last_emitted: HashMap<(i128, Side), i64>,
}

impl CooldownTracker {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_emitted: HashMap::new(),
        }
    }

    pub fn ready(&self, zone_key: i128, side: Side, now_ms: i64) -> bool {
        match self.last_emitted.get(&(zone_key, side)) {
            Some(last) => now_ms - last >= self.interval_ms,
            None => true,
        }
    }

    pub fn arm(&mut self, zone_key: i128, side: Side, now_ms: i64) {
        self.last_emitted.insert((zone_key, side), now_ms);
    }

    /// Drop keys idle long enough that they cannot gate anything.
    pub fn gc(&mut self, now_ms: i64) {
        let interval = self.interval_ms;
        self.last_emitted
            .retain(|_, last| now_ms - *last < interval * 2);
    }
}
