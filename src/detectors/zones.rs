//! Accumulation/distribution zone detection and lifecycle management.
//!
//! Candidates aggregate trades at discretised price levels. A candidate
//! that sustains volume, one-sided flow, price stability and an
//! institutional footprint is promoted to an active zone. Active zones are
//! tracked through created/updated/strengthened/weakened/completed/
//! invalidated lifecycle events, each producing at most one zone signal.

use crate::config::ZoneDetectorConfig;
use crate::detectors::{MarketLens, SignalCandidate, SignalData};
use crate::error::EngineError;
use crate::num::fixed::{FixedPoint, StatAccumulator};
use crate::pipeline::EnrichedTradeEvent;
use crate::types::{Side, SignalType};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

const TRADE_HISTORY_CAP: usize = 100;

/// Price slack applied to zone boundaries before invalidation triggers.
const INVALIDATION_SLACK: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Accumulation,
    Distribution,
}

impl ZoneKind {
    fn signal_type(self) -> SignalType {
        match self {
            ZoneKind::Accumulation => SignalType::Accumulation,
            ZoneKind::Distribution => SignalType::Distribution,
        }
    }

    fn expected_direction(self) -> Side {
        match self {
            ZoneKind::Accumulation => Side::Buy,
            ZoneKind::Distribution => Side::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneLifecycle {
    Created,
    Updated,
    Strengthened,
    Weakened,
    Completed,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneAction {
    Entry,
    AddPosition,
    Monitor,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneUrgency {
    Low,
    Medium,
    High,
}

/// Trading guidance attached to every zone signal.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSignalData {
    pub lifecycle: ZoneLifecycle,
    pub action_type: ZoneAction,
    pub urgency: ZoneUrgency,
    pub expected_direction: Side,
    pub invalidation_level: FixedPoint,
    pub breakout_target: FixedPoint,
    pub stop_loss_level: FixedPoint,
    pub take_profit_level: FixedPoint,
    pub position_sizing: FixedPoint,
    pub zone_strength: FixedPoint,
    pub completion: FixedPoint,
    /// Signed strength delta since the previous lifecycle report.
    pub strength_change: FixedPoint,
}

#[derive(Debug, Clone, Copy)]
struct CandidateTrade {
    price: FixedPoint,
    quantity: FixedPoint,
    is_buy: bool,
}

/// Working aggregator at one discretised price level. Pooled and reused.
#[derive(Debug)]
struct ZoneCandidate {
    trades: VecDeque<CandidateTrade>,
    first_seen_ms: i64,
    last_update_ms: i64,
    buy_volume: FixedPoint,
    sell_volume: FixedPoint,
    pv_sum: FixedPoint,
    qty_sum: FixedPoint,
    sizes: StatAccumulator,
    large_block_volume: FixedPoint,
    price_low: FixedPoint,
    price_high: FixedPoint,
}

impl ZoneCandidate {
    fn blank() -> Self {
        Self {
            trades: VecDeque::with_capacity(TRADE_HISTORY_CAP),
            first_seen_ms: 0,
            last_update_ms: 0,
            buy_volume: FixedPoint::ZERO,
            sell_volume: FixedPoint::ZERO,
            pv_sum: FixedPoint::ZERO,
            qty_sum: FixedPoint::ZERO,
            sizes: StatAccumulator::new(),
            large_block_volume: FixedPoint::ZERO,
            price_low: FixedPoint::ZERO,
            price_high: FixedPoint::ZERO,
        }
    }

    fn reset(&mut self, now_ms: i64) {
        self.trades.clear();
        self.first_seen_ms = now_ms;
        self.last_update_ms = now_ms;
        self.buy_volume = FixedPoint::ZERO;
        self.sell_volume = FixedPoint::ZERO;
        self.pv_sum = FixedPoint::ZERO;
        self.qty_sum = FixedPoint::ZERO;
        self.sizes = StatAccumulator::new();
        self.large_block_volume = FixedPoint::ZERO;
        self.price_low = FixedPoint::ZERO;
        self.price_high = FixedPoint::ZERO;
    }

    fn record(&mut self, price: FixedPoint, quantity: FixedPoint, is_buy: bool, now_ms: i64, large_block: FixedPoint) {
        if self.trades.len() == TRADE_HISTORY_CAP {
            // Pop oldest and subtract its contribution.
            if let Some(old) = self.trades.pop_front() {
                if old.is_buy {
                    self.buy_volume -= old.quantity;
                } else {
                    self.sell_volume -= old.quantity;
                }
                self.pv_sum -= old.price * old.quantity;
                self.qty_sum -= old.quantity;
                self.sizes.remove(old.quantity);
                if old.quantity >= large_block {
                    self.large_block_volume -= old.quantity;
                }
            }
        }
        self.trades.push_back(CandidateTrade {
            price,
            quantity,
            is_buy,
        });
        if is_buy {
            self.buy_volume += quantity;
        } else {
            self.sell_volume += quantity;
        }
        self.pv_sum += price * quantity;
        self.qty_sum += quantity;
        self.sizes.push(quantity);
        if quantity >= large_block {
            self.large_block_volume += quantity;
        }
        if self.price_low.is_zero() || price < self.price_low {
            self.price_low = price;
        }
        if price > self.price_high {
            self.price_high = price;
        }
        self.last_update_ms = now_ms;
    }

    fn total_volume(&self) -> FixedPoint {
        self.buy_volume + self.sell_volume
    }

    fn vwap(&self) -> FixedPoint {
        self.pv_sum.safe_div(self.qty_sum)
    }

    fn buy_ratio(&self) -> FixedPoint {
        self.buy_volume.ratio_of_total(self.sell_volume)
    }

    /// `max(0, 1 - maxRelativeDeviation / maxPriceDeviation)`.
    fn price_stability(&self, max_price_deviation: f64) -> FixedPoint {
        let vwap = self.vwap();
        if !vwap.is_positive() {
            return FixedPoint::ZERO;
        }
        let dev_low = (vwap - self.price_low).abs().safe_div(vwap);
        let dev_high = (self.price_high - vwap).abs().safe_div(vwap);
        let max_rel_dev = dev_low.max(dev_high);
        (FixedPoint::ONE - max_rel_dev.safe_div(FixedPoint::from_f64(max_price_deviation)))
            .max(FixedPoint::ZERO)
    }
}

/// Promoted zone with lifecycle state.
#[derive(Debug, Clone, Copy)]
struct ActiveZone {
    id: Uuid,
    kind: ZoneKind,
    min_price: FixedPoint,
    max_price: FixedPoint,
    center: FixedPoint,
    created_ms: i64,
    last_update_ms: i64,
    strength: FixedPoint,
    completion: FixedPoint,
    last_reported_strength: FixedPoint,
    total_volume: FixedPoint,
    dominant_volume: FixedPoint,
    trades_since_report: u32,
}

pub struct ZoneDetector {
    cfg: ZoneDetectorConfig,
    zone_width: FixedPoint,
    institutional_threshold: FixedPoint,
    candidates: HashMap<i128, ZoneCandidate>,
    pool: Vec<ZoneCandidate>,
    active: Vec<ActiveZone>,
    pub evicted: u64,
}

impl ZoneDetector {
    pub const ID: &'static str = "zones";

    pub fn new(
        cfg: ZoneDetectorConfig,
        zone_width: FixedPoint,
        institutional_threshold: FixedPoint,
    ) -> Self {
        Self {
            cfg,
            zone_width,
            institutional_threshold,
            candidates: HashMap::new(),
            pool: Vec::new(),
            active: Vec::new(),
            evicted: 0,
        }
    }

    pub fn on_trade(
        &mut self,
        event: &EnrichedTradeEvent,
        lens: &MarketLens<'_>,
    ) -> Result<Vec<SignalCandidate>, EngineError> {
        let trade = &event.trade;
        let now_ms = trade.timestamp_ms;
        let mut signals = Vec::new();

        // Active zones first: in-zone trades update them, breaches
        // invalidate them.
        self.update_active_zones(trade.price, trade.quantity, trade.is_aggressive_buy(), now_ms, &mut signals);

        // Trades already explained by an active zone do not feed candidates.
        if self
            .active
            .iter()
            .any(|z| trade.price >= z.min_price && trade.price <= z.max_price)
        {
            return Ok(signals);
        }

        let key = trade.price.raw().div_euclid(self.zone_width.raw());
        let large_block = self.institutional_threshold;
        if !self.candidates.contains_key(&key) {
            let mut fresh = self.pool.pop().unwrap_or_else(ZoneCandidate::blank);
            fresh.reset(now_ms);
            self.candidates.insert(key, fresh);
        }
        let candidate = self
            .candidates
            .get_mut(&key)
            .expect("candidate inserted above");
        candidate.record(
            trade.price,
            trade.quantity,
            trade.is_aggressive_buy(),
            now_ms,
            large_block,
        );

        if let Some(kind) = self.promotion_kind(key, lens, now_ms) {
            signals.extend(self.promote(key, kind, now_ms));
        }

        Ok(signals)
    }

    /// Determine whether the candidate at `key` qualifies for promotion and
    /// as which kind.
    fn promotion_kind(&self, key: i128, lens: &MarketLens<'_>, now_ms: i64) -> Option<ZoneKind> {
        let candidate = self.candidates.get(&key)?;
        if candidate.last_update_ms - candidate.first_seen_ms < self.cfg.min_candidate_duration_ms
        {
            return None;
        }
        if candidate.total_volume() < FixedPoint::from_f64(self.cfg.min_zone_volume) {
            return None;
        }
        if (candidate.trades.len() as u64) < self.cfg.min_trade_count {
            return None;
        }
        let stability = candidate.price_stability(self.cfg.max_price_deviation);
        if stability < FixedPoint::from_f64(0.85) {
            return None;
        }

        let buy_ratio = candidate.buy_ratio();
        let kind = if buy_ratio >= FixedPoint::from_f64(self.cfg.min_buy_ratio) {
            ZoneKind::Accumulation
        } else if (FixedPoint::ONE - buy_ratio) >= FixedPoint::from_f64(self.cfg.min_sell_ratio) {
            ZoneKind::Distribution
        } else {
            return None;
        };

        let institutional = self.institutional_score(candidate, lens, now_ms);
        if institutional < FixedPoint::from_f64(0.4) {
            return None;
        }
        let composite = self.composite_score(candidate, kind, stability, institutional);
        if composite <= FixedPoint::from_f64(0.75) {
            return None;
        }
        Some(kind)
    }

    /// Weighted blend of large-block ratio, iceberg presence, volume
    /// consistency, price efficiency and order-size distribution.
    fn institutional_score(
        &self,
        candidate: &ZoneCandidate,
        lens: &MarketLens<'_>,
        now_ms: i64,
    ) -> FixedPoint {
        let fp = FixedPoint::from_f64;
        let one = FixedPoint::ONE;

        let large_block_ratio = candidate
            .large_block_volume
            .safe_div(candidate.total_volume());
        let iceberg_presence = if lens.icebergs.iceberg_active_near(
            candidate.vwap(),
            self.zone_width,
            now_ms,
        ) {
            one
        } else {
            FixedPoint::ZERO
        };
        let size_cv = candidate
            .sizes
            .std_dev()
            .safe_div(candidate.sizes.mean());
        let volume_consistency = (one - size_cv).max(FixedPoint::ZERO);
        let vwap = candidate.vwap();
        let span = (candidate.price_high - candidate.price_low).safe_div(vwap);
        let price_efficiency = (one
            - span.safe_div(fp(self.cfg.max_price_deviation)).min(one))
        .max(FixedPoint::ZERO);
        let size_distribution = candidate
            .sizes
            .mean()
            .safe_div(self.institutional_threshold)
            .min(one);

        large_block_ratio * fp(0.30)
            + iceberg_presence * fp(0.20)
            + volume_consistency * fp(0.20)
            + price_efficiency * fp(0.15)
            + size_distribution * fp(0.15)
    }

    fn composite_score(
        &self,
        candidate: &ZoneCandidate,
        kind: ZoneKind,
        stability: FixedPoint,
        institutional: FixedPoint,
    ) -> FixedPoint {
        let fp = FixedPoint::from_f64;
        let ratio = match kind {
            ZoneKind::Accumulation => candidate.buy_ratio(),
            ZoneKind::Distribution => FixedPoint::ONE - candidate.buy_ratio(),
        };
        let significance = candidate
            .total_volume()
            .safe_div(fp(self.cfg.min_zone_volume * 2.0))
            .min(FixedPoint::ONE);
        ratio * fp(0.35) + stability * fp(0.25) + institutional * fp(0.25) + significance * fp(0.15)
    }

    fn promote(&mut self, key: i128, kind: ZoneKind, now_ms: i64) -> Vec<SignalCandidate> {
        let Some(mut candidate) = self.candidates.remove(&key) else {
            return Vec::new();
        };
        let stability = candidate.price_stability(self.cfg.max_price_deviation);
        let buy_ratio = candidate.buy_ratio();
        let ratio = match kind {
            ZoneKind::Accumulation => buy_ratio,
            ZoneKind::Distribution => FixedPoint::ONE - buy_ratio,
        };
        // Strength folds flow dominance and stability together.
        let strength = (ratio * FixedPoint::from_f64(0.6)
            + stability * FixedPoint::from_f64(0.4))
        .clamp(FixedPoint::ZERO, FixedPoint::ONE);
        let dominant = match kind {
            ZoneKind::Accumulation => candidate.buy_volume,
            ZoneKind::Distribution => candidate.sell_volume,
        };

        let zone = ActiveZone {
            id: Uuid::new_v4(),
            kind,
            min_price: candidate.price_low,
            max_price: candidate.price_high.max(candidate.price_low + self.zone_width),
            center: candidate.vwap(),
            created_ms: now_ms,
            last_update_ms: now_ms,
            strength,
            completion: self.completion_of(candidate.total_volume()),
            last_reported_strength: strength,
            total_volume: candidate.total_volume(),
            dominant_volume: dominant,
            trades_since_report: 0,
        };
        candidate.reset(now_ms);
        self.pool.push(candidate);

        info!(
            kind = ?kind,
            center = %zone.center,
            strength = %zone.strength,
            "zone promoted"
        );

        let mut signals = Vec::new();
        if self.active.len() >= self.cfg.max_active_zones {
            self.evict_weakest();
        }
        let signal = self.zone_signal(&zone, ZoneLifecycle::Created, FixedPoint::ZERO, now_ms);
        self.active.push(zone);
        signals.push(signal);
        signals
    }

    /// Volume progress toward a mature zone.
    fn completion_of(&self, total_volume: FixedPoint) -> FixedPoint {
        total_volume
            .safe_div(FixedPoint::from_f64(self.cfg.min_zone_volume * 4.0))
            .min(FixedPoint::ONE)
    }

    /// Oldest-weakest active zone is evicted first.
    fn evict_weakest(&mut self) {
        if let Some(idx) = self
            .active
            .iter()
            .enumerate()
            .min_by_key(|(_, z)| (z.strength, z.created_ms))
            .map(|(i, _)| i)
        {
            let zone = self.active.remove(idx);
            self.evicted += 1;
            debug!(id = %zone.id, strength = %zone.strength, "evicted weakest zone");
        }
    }

    fn update_active_zones(
        &mut self,
        price: FixedPoint,
        quantity: FixedPoint,
        is_buy: bool,
        now_ms: i64,
        signals: &mut Vec<SignalCandidate>,
    ) {
        let slack = FixedPoint::from_f64(INVALIDATION_SLACK);
        let mut produced: Vec<SignalCandidate> = Vec::new();
        let cfg_change = FixedPoint::from_f64(self.cfg.strength_change_threshold);
        let completion_threshold = FixedPoint::from_f64(self.cfg.completion_threshold);
        let min_strength = FixedPoint::from_f64(self.cfg.min_zone_strength);

        let mut removed: Vec<usize> = Vec::new();
        for (idx, zone) in self.active.iter_mut().enumerate() {
            // Breach beyond the slack band invalidates.
            let breached = match zone.kind {
                ZoneKind::Accumulation => price < zone.min_price * (FixedPoint::ONE - slack),
                ZoneKind::Distribution => price > zone.max_price * (FixedPoint::ONE + slack),
            };
            if breached {
                produced.push(make_zone_signal(
                    zone,
                    ZoneLifecycle::Invalidated,
                    -zone.strength,
                    now_ms,
                    self.zone_width,
                ));
                removed.push(idx);
                continue;
            }

            if price < zone.min_price || price > zone.max_price {
                continue;
            }

            // In-zone flow: refresh strength from the dominant-side share.
            zone.total_volume += quantity;
            let supports = match zone.kind {
                ZoneKind::Accumulation => is_buy,
                ZoneKind::Distribution => !is_buy,
            };
            if supports {
                zone.dominant_volume += quantity;
            }
            let ratio = zone.dominant_volume.safe_div(zone.total_volume);
            let blended = zone.strength * FixedPoint::from_f64(0.7)
                + ratio * FixedPoint::from_f64(0.3);
            zone.strength = blended.clamp(FixedPoint::ZERO, FixedPoint::ONE);
            let volume_progress = zone
                .total_volume
                .safe_div(FixedPoint::from_f64(self.cfg.min_zone_volume * 4.0))
                .min(FixedPoint::ONE);
            zone.completion = zone.completion.max(volume_progress);
            zone.last_update_ms = now_ms;
            zone.trades_since_report += 1;

            let change = zone.strength - zone.last_reported_strength;
            if zone.completion >= completion_threshold {
                produced.push(make_zone_signal(
                    zone,
                    ZoneLifecycle::Completed,
                    change,
                    now_ms,
                    self.zone_width,
                ));
                zone.last_reported_strength = zone.strength;
                zone.trades_since_report = 0;
                removed.push(idx);
            } else if change >= cfg_change {
                produced.push(make_zone_signal(
                    zone,
                    ZoneLifecycle::Strengthened,
                    change,
                    now_ms,
                    self.zone_width,
                ));
                zone.last_reported_strength = zone.strength;
                zone.trades_since_report = 0;
            } else if change <= -cfg_change {
                let lifecycle = if zone.strength < min_strength {
                    ZoneLifecycle::Invalidated
                } else {
                    ZoneLifecycle::Weakened
                };
                produced.push(make_zone_signal(zone, lifecycle, change, now_ms, self.zone_width));
                zone.last_reported_strength = zone.strength;
                zone.trades_since_report = 0;
                if lifecycle == ZoneLifecycle::Invalidated {
                    removed.push(idx);
                }
            } else if zone.trades_since_report >= 25 {
                produced.push(make_zone_signal(
                    zone,
                    ZoneLifecycle::Updated,
                    change,
                    now_ms,
                    self.zone_width,
                ));
                zone.trades_since_report = 0;
            }
        }

        for idx in removed.into_iter().rev() {
            self.active.remove(idx);
        }
        signals.extend(produced);
    }

    fn zone_signal(
        &self,
        zone: &ActiveZone,
        lifecycle: ZoneLifecycle,
        strength_change: FixedPoint,
        now_ms: i64,
    ) -> SignalCandidate {
        make_zone_signal(zone, lifecycle, strength_change, now_ms, self.zone_width)
    }

    /// Timeout sweep; runs at cooperative checkpoints.
    pub fn on_timer(&mut self, now_ms: i64) -> Vec<SignalCandidate> {
        let timeout = self.cfg.zone_timeout_ms;
        let width = self.zone_width;
        let mut signals = Vec::new();
        let mut keep = Vec::with_capacity(self.active.len());
        for zone in self.active.drain(..) {
            if now_ms - zone.last_update_ms > timeout {
                signals.push(make_zone_signal(
                    &zone,
                    ZoneLifecycle::Invalidated,
                    -zone.strength,
                    now_ms,
                    width,
                ));
            } else {
                keep.push(zone);
            }
        }
        self.active = keep;

        // Stale candidates return to the pool.
        let stale_cutoff = now_ms - self.cfg.min_candidate_duration_ms * 4;
        let stale: Vec<i128> = self
            .candidates
            .iter()
            .filter(|(_, c)| c.last_update_ms < stale_cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(mut c) = self.candidates.remove(&key) {
                c.reset(now_ms);
                self.pool.push(c);
            }
        }
        signals
    }

    pub fn active_zones(&self) -> usize {
        self.active.len()
    }
}

fn make_zone_signal(
    zone: &ActiveZone,
    lifecycle: ZoneLifecycle,
    strength_change: FixedPoint,
    now_ms: i64,
    zone_width: FixedPoint,
) -> SignalCandidate {
    let span = (zone.max_price - zone.min_price).max(zone_width);
    let slack = FixedPoint::from_f64(INVALIDATION_SLACK);
    let (invalidation, breakout, stop, target) = match zone.kind {
        ZoneKind::Accumulation => {
            let invalidation = zone.min_price * (FixedPoint::ONE - slack);
            let breakout = zone.max_price + span;
            (invalidation, breakout, invalidation, breakout + span)
        }
        ZoneKind::Distribution => {
            let invalidation = zone.max_price * (FixedPoint::ONE + slack);
            let breakout = zone.min_price - span;
            (invalidation, breakout, invalidation, breakout - span)
        }
    };

    let (action, urgency) = match lifecycle {
        ZoneLifecycle::Created => (ZoneAction::Entry, ZoneUrgency::Medium),
        ZoneLifecycle::Completed => (ZoneAction::Entry, ZoneUrgency::High),
        ZoneLifecycle::Strengthened => (ZoneAction::AddPosition, ZoneUrgency::Medium),
        ZoneLifecycle::Updated => (ZoneAction::Monitor, ZoneUrgency::Low),
        ZoneLifecycle::Weakened => (ZoneAction::Monitor, ZoneUrgency::Low),
        ZoneLifecycle::Invalidated => (ZoneAction::Exit, ZoneUrgency::High),
    };

    let sizing = if zone.strength >= FixedPoint::from_f64(0.9) {
        FixedPoint::ONE
    } else if zone.strength >= FixedPoint::from_f64(0.75) {
        FixedPoint::from_f64(0.75)
    } else {
        FixedPoint::from_f64(0.5)
    };

    let confidence = match lifecycle {
        ZoneLifecycle::Invalidated => zone.strength.max(FixedPoint::from_f64(0.6)),
        ZoneLifecycle::Weakened | ZoneLifecycle::Updated => {
            zone.strength * FixedPoint::from_f64(0.8)
        }
        _ => zone.strength,
    };

    SignalCandidate::new(
        zone.kind.signal_type(),
        zone.kind.expected_direction(),
        zone.center,
        confidence,
        now_ms,
        ZoneDetector::ID,
        SignalData::Zone(ZoneSignalData {
            lifecycle,
            action_type: action,
            urgency,
            expected_direction: zone.kind.expected_direction(),
            invalidation_level: invalidation,
            breakout_target: breakout,
            stop_loss_level: stop,
            take_profit_level: target,
            position_sizing: sizing,
            zone_strength: zone.strength,
            completion: zone.completion,
            strength_change,
        }),
    )
}
