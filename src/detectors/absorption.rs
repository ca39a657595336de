//! Absorption detector: aggressive flow soaked up by resting liquidity.
//!
//! Works on the primary tick-window view of each enriched trade. A signal
//! needs low price efficiency (the move is far smaller than the aggressive
//! volume should have produced), passive dominance on one side, a clean
//! spoofing check, and a weighted confidence above the configured floor.

use crate::config::AbsorptionConfig;
use crate::detectors::{CooldownTracker, MarketLens, SignalCandidate, SignalData};
use crate::error::EngineError;
use crate::num::fixed::FixedPoint;
use crate::pipeline::{EnrichedTradeEvent, ZoneSnapshot};
use crate::types::{BookSide, EnhancementMode, Side, SignalType};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Detector-side running flow per zone for the institutional fraction.
#[derive(Debug, Clone, Copy, Default)]
struct ZoneFlow {
    institutional: FixedPoint,
    total: FixedPoint,
    last_update_ms: i64,
}

pub struct AbsorptionDetector {
    cfg: AbsorptionConfig,
    tick_size: FixedPoint,
    primary_zone_ticks: u32,
    window_ms: i64,
    mode: EnhancementMode,
    cooldowns: CooldownTracker,
    zone_flows: HashMap<i128, ZoneFlow>,
    pub emitted: u64,
}

impl AbsorptionDetector {
    pub const ID: &'static str = "absorption";

    pub fn new(
        cfg: AbsorptionConfig,
        tick_size: FixedPoint,
        primary_zone_ticks: u32,
        window_ms: i64,
    ) -> Self {
        let cooldowns = CooldownTracker::new(cfg.event_cooldown_ms);
        Self {
            cfg,
            tick_size,
            primary_zone_ticks,
            window_ms,
            mode: EnhancementMode::Production,
            cooldowns,
            zone_flows: HashMap::new(),
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

        // Institutional fraction bookkeeping happens before any gate so the
        // aggregate is complete when a signal finally fires.
        let inst_threshold = FixedPoint::from_f64(self.cfg.institutional_volume_threshold);
        let zone_key = zone.boundaries.min.raw();
        let flow = self.zone_flows.entry(zone_key).or_default();
        if now_ms - flow.last_update_ms > self.window_ms {
            *flow = ZoneFlow::default();
        }
        flow.total += trade.quantity;
        if trade.quantity >= inst_threshold {
            flow.institutional += trade.quantity;
        }
        flow.last_update_ms = now_ms;
        let institutional_fraction = flow.institutional.safe_div(flow.total);

        // Volume gate, inclusive at the threshold.
        let min_agg = FixedPoint::from_f64(self.cfg.min_agg_volume);
        if zone.aggressive_volume < min_agg {
            return Ok(Vec::new());
        }

        // Passive dominance decides the signal side.
        let Some((dominant_side, side)) = self.dominant_side(zone) else {
            trace!(zone = %zone.price_level, "no dominant passive side");
            return Ok(Vec::new());
        };

        if !self.cooldowns.ready(zone_key, side, now_ms) {
            return Ok(Vec::new());
        }

        // Price efficiency: how far did price actually travel versus what
        // this much aggression should have moved it.
        let avg_passive = self.average_zone_passive(event, lens, zone);
        let expected_movement = zone
            .aggressive_volume
            .safe_div(avg_passive)
            * self.tick_size
            * FixedPoint::from_f64(self.cfg.expected_movement_scaling_factor);
        let efficiency = if expected_movement.is_zero() {
            FixedPoint::ZERO
        } else {
            zone.price_range().safe_div(expected_movement)
        };
        if efficiency >= FixedPoint::from_f64(self.cfg.price_efficiency_threshold) {
            return Ok(Vec::new());
        }

        // Passive dominance gates.
        let passive_ratio = zone.passive_volume.ratio_of_total(zone.aggressive_volume);
        if passive_ratio < FixedPoint::from_f64(self.cfg.passive_absorption_threshold) {
            return Ok(Vec::new());
        }
        if zone.passive_volume
            < zone.aggressive_volume * FixedPoint::from_f64(self.cfg.min_passive_multiplier)
        {
            return Ok(Vec::new());
        }

        // Reject absorption built on a cancelled wall.
        if lens.was_spoofed(trade.price, dominant_side, now_ms) {
            debug!(price = %trade.price, side = ?dominant_side, "absorption rejected by spoof filter");
            return Ok(Vec::new());
        }

        let confluence = self.confluence_count(event);
        let refill = lens.has_refilled(trade.price, dominant_side);
        let confidence = self.confidence(
            efficiency,
            passive_ratio,
            institutional_fraction,
            confluence,
            event.zone_data.len() as u32,
            refill,
        );
        if confidence < FixedPoint::from_f64(self.cfg.final_confidence_required) {
            return Ok(Vec::new());
        }

        self.cooldowns.arm(zone_key, side, now_ms);
        self.emitted += 1;
        debug!(
            price = %trade.price,
            side = ?side,
            efficiency = %efficiency,
            passive_ratio = %passive_ratio,
            confidence = %confidence,
            "absorption signal"
        );
        Ok(vec![SignalCandidate::new(
            SignalType::Absorption,
            side,
            trade.price,
            confidence,
            now_ms,
            Self::ID,
            SignalData::Absorption {
                efficiency,
                passive_ratio,
                dominant_side,
                zone_confluence: confluence,
                refill_boost_applied: refill,
            },
        )])
    }

    /// Bid-dominant passive books absorb sell pressure (sell signal);
    /// ask-dominant books absorb buy pressure (buy signal). Dominance needs
    /// a clear margin between the sides.
    fn dominant_side(&self, zone: &ZoneSnapshot) -> Option<(BookSide, Side)> {
        let total = zone.passive_volume;
        if total.is_zero() {
            return None;
        }
        let margin = (zone.passive_bid_volume - zone.passive_ask_volume)
            .abs()
            .safe_div(total);
        if margin <= FixedPoint::from_f64(self.cfg.dominance_margin) {
            return None;
        }
        if zone.passive_bid_volume > zone.passive_ask_volume {
            Some((BookSide::Bid, Side::Sell))
        } else {
            Some((BookSide::Ask, Side::Buy))
        }
    }

    /// Typical resting liquidity at the traded price, falling back to the
    /// zone's current passives before any history accumulates.
    fn average_zone_passive(
        &self,
        event: &EnrichedTradeEvent,
        lens: &MarketLens<'_>,
        zone: &ZoneSnapshot,
    ) -> FixedPoint {
        let avg = lens.average_passive(event.trade.price, BookSide::Bid, self.window_ms)
            + lens.average_passive(event.trade.price, BookSide::Ask, self.window_ms);
        if avg.is_positive() {
            avg
        } else {
            zone.passive_volume
        }
    }

    /// Number of tick-window views that independently show absorption
    /// pressure.
    fn confluence_count(&self, event: &EnrichedTradeEvent) -> u32 {
        let threshold = FixedPoint::from_f64(self.cfg.passive_absorption_threshold);
        event
            .zone_data
            .iter()
            .filter(|z| z.passive_volume.ratio_of_total(z.aggressive_volume) >= threshold)
            .count() as u32
    }

    /// Weighted aggregate per the configured weights. Disabled mode keeps
    /// only the base components (renormalized); testing mode computes the
    /// enhanced score but emits the base one.
    fn confidence(
        &self,
        efficiency: FixedPoint,
        passive_ratio: FixedPoint,
        institutional_fraction: FixedPoint,
        confluence: u32,
        views: u32,
        refill: bool,
    ) -> FixedPoint {
        let w = &self.cfg.weights;
        let inverse_efficiency = (FixedPoint::ONE - efficiency.min(FixedPoint::ONE))
            .max(FixedPoint::ZERO);
        let confluence_score = FixedPoint::from_int(confluence as i64)
            .safe_div(FixedPoint::from_int(views.max(1) as i64));

        let base = (inverse_efficiency * FixedPoint::from_f64(w.efficiency)
            + passive_ratio * FixedPoint::from_f64(w.passive_ratio))
        .safe_div(FixedPoint::from_f64(w.efficiency + w.passive_ratio));

        let mut enhanced = inverse_efficiency * FixedPoint::from_f64(w.efficiency)
            + passive_ratio * FixedPoint::from_f64(w.passive_ratio)
            + institutional_fraction * FixedPoint::from_f64(w.institutional)
            + confluence_score * FixedPoint::from_f64(w.confluence);
        if refill {
            enhanced += FixedPoint::from_f64(self.cfg.refill_confidence_boost);
        }
        enhanced = enhanced.clamp(FixedPoint::ZERO, FixedPoint::ONE);

        match self.mode {
            EnhancementMode::Disabled => base,
            EnhancementMode::Testing => {
                trace!(base = %base, enhanced = %enhanced, "absorption enhanced score (testing)");
                base
            }
            EnhancementMode::Production => enhanced,
        }
    }

    pub fn gc(&mut self, now_ms: i64) {
        let window = self.window_ms;
        self.zone_flows
            .retain(|_, f| now_ms - f.last_update_ms <= window);
        self.cooldowns.gc(now_ms);
    }
}
