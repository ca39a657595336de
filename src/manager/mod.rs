//! Signal manager: the publication gate.
//!
//! Candidates enter a bounded priority queue; batches run each signal
//! through the breaker, the per-type threshold, the throttle, the
//! market-health gate, conflict resolution and the regime context
//! adjustment before publication. Exactly one `ProcessedSignal` leaves per
//! accepted candidate.

pub mod breaker;
pub mod queue;

use crate::config::SignalManagerConfig;
use crate::detectors::anomaly::{MarketHealth, Recommendation};
use crate::detectors::{SignalCandidate, SignalData};
use crate::num::fixed::FixedPoint;
use crate::types::{MarketRegime, Side, SignalType};
use breaker::CircuitBreaker;
use queue::{EnqueueOutcome, SignalQueue};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Confidence tie margin below which conflict resolution falls back to the
/// deterministic earlier-timestamp rule.
const CONFLICT_EPSILON: f64 = 1e-9;

/// Moving-average batch time above which adaptive sizing shrinks the batch.
const TARGET_BATCH_MS: f64 = 8.0;

/// Published signal.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedSignal {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub signal_type: SignalType,
    pub side: Side,
    pub price: FixedPoint,
    /// Manager-adjusted confidence.
    pub confidence: FixedPoint,
    pub raw_confidence: FixedPoint,
    pub priority_score: f64,
    pub timestamp_ms: i64,
    pub accepted_ms: i64,
    pub detector_id: &'static str,
    /// Position fraction after health adjustments.
    pub position_sizing: FixedPoint,
    pub data: SignalData,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total_received: u64,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub dropped_by_backpressure: u64,
    pub dropped_by_throttle: u64,
    pub circuit_breaker_rejects: u64,
    pub threshold_rejects: u64,
    pub health_rejects: u64,
    pub conflict_rejects: u64,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub high_watermark: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub processing: ProcessingStats,
    pub queue: QueueStats,
    pub per_detector: HashMap<String, u64>,
}

pub struct SignalManager {
    cfg: SignalManagerConfig,
    queue: SignalQueue,
    breakers: HashMap<&'static str, CircuitBreaker>,
    history: VecDeque<ProcessedSignal>,
    stats: ProcessingStats,
    per_detector_accepts: HashMap<String, u64>,
    batch_size: usize,
    batch_ms_ma: f64,
}

impl SignalManager {
    pub fn new(cfg: SignalManagerConfig) -> Self {
        let queue = SignalQueue::new(
            cfg.max_queue_size,
            cfg.backpressure_threshold,
            cfg.priority_queue_high_threshold,
        );
        let batch_size = cfg.processing_batch_size;
        Self {
            cfg,
            queue,
            breakers: HashMap::new(),
            history: VecDeque::new(),
            stats: ProcessingStats::default(),
            per_detector_accepts: HashMap::new(),
            batch_size,
            batch_ms_ma: 0.0,
        }
    }

    /// Queue admission. Returns the queue outcome so the engine can count
    /// drops.
    pub fn submit(&mut self, candidate: SignalCandidate, now_ms: i64) -> EnqueueOutcome {
        self.stats.total_received += 1;
        let score = self.priority_score(&candidate);
        let bypass = self.is_bypass(&candidate);
        let outcome = self.queue.offer(candidate, score, bypass, now_ms);
        match outcome {
            EnqueueOutcome::DroppedBackpressure | EnqueueOutcome::DroppedFull => {
                self.stats.dropped_by_backpressure += 1;
                self.stats.total_rejected += 1;
            }
            _ => {}
        }
        outcome
    }

    /// Priority blends the configured per-type weight with the candidate's
    /// confidence on a 0-10 scale.
    fn priority_score(&self, candidate: &SignalCandidate) -> f64 {
        let type_priority = self.cfg.signal_type_priorities.get(candidate.signal_type);
        let confidence_score = candidate.confidence.to_f64() * 10.0;
        type_priority * 0.6 + confidence_score * 0.4
    }

    fn is_bypass(&self, candidate: &SignalCandidate) -> bool {
        candidate.confidence.to_f64() * 10.0 >= self.cfg.high_priority_bypass_threshold
    }

    /// Dequeue and process up to one adaptive batch. The engine yields for
    /// `backpressure_yield_ms` between calls.
    pub fn process_batch(
        &mut self,
        health: &MarketHealth,
        regime: MarketRegime,
        now_ms: i64,
    ) -> Vec<ProcessedSignal> {
        let started = Instant::now();
        let mut published = Vec::new();
        for _ in 0..self.batch_size {
            let Some(queued) = self.queue.pop() else {
                break;
            };
            if let Some(signal) =
                self.process_one(queued.candidate, queued.priority_score, health, regime, now_ms)
            {
                published.push(signal);
            }
        }
        self.adapt_batch_size(started.elapsed().as_secs_f64() * 1_000.0);
        published
    }

    fn adapt_batch_size(&mut self, elapsed_ms: f64) {
        if !self.cfg.adaptive_batch_sizing {
            return;
        }
        self.batch_ms_ma = if self.batch_ms_ma == 0.0 {
            elapsed_ms
        } else {
            self.batch_ms_ma * 0.8 + elapsed_ms * 0.2
        };
        if self.batch_ms_ma > TARGET_BATCH_MS {
            self.batch_size = (self.batch_size / 2).max(self.cfg.min_adaptive_batch_size);
        } else if self.batch_ms_ma < TARGET_BATCH_MS / 2.0 {
            self.batch_size = (self.batch_size * 2).min(self.cfg.max_adaptive_batch_size);
        }
    }

    fn process_one(
        &mut self,
        candidate: SignalCandidate,
        priority_score: f64,
        health: &MarketHealth,
        regime: MarketRegime,
        now_ms: i64,
    ) -> Option<ProcessedSignal> {
        let detector = candidate.detector_id;

        // 1. Circuit breaker.
        if !self.breaker_for(detector).allow(now_ms) {
            self.stats.circuit_breaker_rejects += 1;
            self.stats.total_rejected += 1;
            return None;
        }

        // 2. Per-type confidence floor; exactly at the threshold is in.
        let threshold = self.cfg.detector_thresholds.get(candidate.signal_type);
        if candidate.confidence.to_f64() < threshold {
            self.stats.threshold_rejects += 1;
            self.stats.total_rejected += 1;
            return None;
        }

        // 3. Throttle: same type and side near the same price.
        if self.is_throttled(&candidate, now_ms) {
            self.stats.dropped_by_throttle += 1;
            self.stats.total_rejected += 1;
            return None;
        }

        // 4. Market-health gate.
        let mut sizing_factor = 1.0;
        match health.recommendation {
            Recommendation::ClosePositions => {
                self.stats.health_rejects += 1;
                self.stats.total_rejected += 1;
                return None;
            }
            Recommendation::Pause => {
                if !self.is_bypass(&candidate) {
                    self.stats.health_rejects += 1;
                    self.stats.total_rejected += 1;
                    return None;
                }
            }
            Recommendation::ReduceSize => {
                sizing_factor = self.cfg.position_sizing.reduced_size_factor;
            }
            Recommendation::Continue => {}
        }

        // 5. Conflict resolution.
        let mut confidence = candidate.confidence;
        if self.cfg.conflict_resolution.enabled {
            match self.resolve_conflict(&candidate, health, now_ms) {
                ConflictOutcome::NoConflict => {}
                ConflictOutcome::Lost => {
                    self.stats.conflict_rejects += 1;
                    self.stats.total_rejected += 1;
                    return None;
                }
                ConflictOutcome::Won { adjusted } => {
                    confidence = adjusted;
                }
            }
        }

        // 6. Regime context adjustment.
        let factors = match regime {
            MarketRegime::HighVolatility => &self.cfg.signal_priority_matrix.high_volatility,
            MarketRegime::LowVolatility => &self.cfg.signal_priority_matrix.low_volatility,
            MarketRegime::Balanced => &self.cfg.signal_priority_matrix.balanced,
        };
        confidence = (confidence * FixedPoint::from_f64(factors.get(candidate.signal_type)))
            .clamp(FixedPoint::ZERO, FixedPoint::ONE);

        // 7. Record and publish.
        let sizing = self.position_sizing(confidence) * FixedPoint::from_f64(sizing_factor);
        let signal = ProcessedSignal {
            id: candidate.id,
            correlation_id: Uuid::new_v4(),
            signal_type: candidate.signal_type,
            side: candidate.side,
            price: candidate.price,
            confidence,
            raw_confidence: candidate.confidence,
            priority_score,
            timestamp_ms: candidate.timestamp_ms,
            accepted_ms: now_ms,
            detector_id: detector,
            position_sizing: sizing,
            data: candidate.data,
        };

        if self.history.len() >= self.cfg.max_history_size {
            self.history.pop_front();
        }
        self.history.push_back(signal.clone());
        self.stats.total_accepted += 1;
        *self
            .per_detector_accepts
            .entry(detector.to_string())
            .or_insert(0) += 1;
        self.breaker_for(detector).record_success();
        info!(
            signal_type = ?signal.signal_type,
            side = ?signal.side,
            price = %signal.price,
            confidence = %signal.confidence,
            "signal published"
        );
        Some(signal)
    }

    fn breaker_for(&mut self, detector: &'static str) -> &mut CircuitBreaker {
        let cfg = &self.cfg;
        self.breakers.entry(detector).or_insert_with(|| {
            CircuitBreaker::new(
                cfg.circuit_breaker_threshold,
                cfg.circuit_breaker_window_ms,
                cfg.circuit_breaker_reset_ms,
            )
        })
    }

    /// Detector-side failures reported by the engine's fan-out.
    pub fn record_detector_failure(&mut self, detector: &'static str, now_ms: i64) {
        self.breaker_for(detector).record_failure(now_ms);
    }

    fn is_throttled(&self, candidate: &SignalCandidate, now_ms: i64) -> bool {
        let tolerance = self.cfg.price_tolerance_percent;
        self.history.iter().rev().any(|h| {
            h.signal_type == candidate.signal_type
                && h.side == candidate.side
                && now_ms - h.accepted_ms < self.cfg.signal_throttle_ms
                && relative_distance(candidate.price, h.price) < tolerance
        })
    }

    fn resolve_conflict(
        &mut self,
        candidate: &SignalCandidate,
        health: &MarketHealth,
        now_ms: i64,
    ) -> ConflictOutcome {
        let cr = &self.cfg.conflict_resolution;
        let window = self.cfg.correlation_window_ms;
        let opposite = candidate.side.opposite();

        let conflict_idx = self.history.iter().rposition(|h| {
            h.side == opposite
                && now_ms - h.accepted_ms <= window
                && now_ms - h.accepted_ms >= cr.minimum_separation_ms
                && relative_distance(candidate.price, h.price) < cr.price_tolerance
        });
        let Some(idx) = conflict_idx else {
            return ConflictOutcome::NoConflict;
        };

        // Penalty scales with realized volatility.
        let vol_weight = (health.metrics.volatility.to_f64()
            / cr.volatility_normalization_factor)
            .clamp(0.0, 1.0);
        let penalty = cr.contradiction_penalty_factor * vol_weight;
        let keep = FixedPoint::from_f64(1.0 - penalty);

        let prior = &self.history[idx];
        let adjusted_prior = prior.raw_confidence * keep;
        let adjusted_new = candidate.confidence * keep;

        let diff = adjusted_new.to_f64() - adjusted_prior.to_f64();
        let new_wins = if diff.abs() < CONFLICT_EPSILON {
            // Deterministic tiebreak: earlier timestamp wins.
            candidate.timestamp_ms < prior.timestamp_ms
        } else {
            diff > 0.0
        };

        if new_wins {
            debug!(
                winner = ?candidate.signal_type,
                loser = ?prior.signal_type,
                penalty,
                "conflict resolved for the incoming signal"
            );
            ConflictOutcome::Won {
                adjusted: adjusted_new,
            }
        } else {
            // The stored winner's published record carries the contradiction
            // penalty from now on.
            let prior = &mut self.history[idx];
            prior.confidence = adjusted_prior.min(prior.confidence);
            debug!(
                winner = ?prior.signal_type,
                adjusted = %prior.confidence,
                penalty,
                "conflict resolved for the prior signal"
            );
            ConflictOutcome::Lost
        }
    }

    fn position_sizing(&self, confidence: FixedPoint) -> FixedPoint {
        let ps = &self.cfg.position_sizing;
        let multiplier = if confidence.to_f64() >= 0.8 {
            ps.high_confidence_multiplier
        } else if confidence.to_f64() < 0.6 {
            ps.low_confidence_multiplier
        } else {
            1.0
        };
        FixedPoint::from_f64(ps.base_size * multiplier)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn history(&self) -> impl Iterator<Item = &ProcessedSignal> {
        self.history.iter()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            processing: self.stats,
            queue: QueueStats {
                size: self.queue.len(),
                high_watermark: self.queue.high_watermark,
            },
            per_detector: self.per_detector_accepts.clone(),
        }
    }
}

enum ConflictOutcome {
    NoConflict,
    Lost,
    Won { adjusted: FixedPoint },
}

fn relative_distance(a: FixedPoint, b: FixedPoint) -> f64 {
    if !b.is_positive() {
        return f64::MAX;
    }
    ((a - b).abs().safe_div(b)).to_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::anomaly::{HealthMetrics, MarketHealth};
    use crate::types::BookSide;

    fn health(recommendation: Recommendation, volatility: f64) -> MarketHealth {
        MarketHealth {
            is_healthy: recommendation == Recommendation::Continue,
            recommendation,
            recent_anomalies: 0,
            highest_severity: None,
            recent_anomaly_types: Vec::new(),
            metrics: HealthMetrics {
                volatility: FixedPoint::from_f64(volatility),
                spread_bps: FixedPoint::from_f64(1.0),
                flow_imbalance: FixedPoint::ZERO,
                last_update_age_ms: 0,
            },
        }
    }

    fn candidate(
        signal_type: SignalType,
        side: Side,
        price: &str,
        confidence: f64,
        ts: i64,
    ) -> SignalCandidate {
        SignalCandidate::new(
            signal_type,
            side,
            FixedPoint::parse(price).unwrap(),
            FixedPoint::from_f64(confidence),
            ts,
            "absorption",
            SignalData::Absorption {
                efficiency: FixedPoint::ZERO,
                passive_ratio: FixedPoint::ZERO,
                dominant_side: BookSide::Bid,
                zone_confluence: 0,
                refill_boost_applied: false,
            },
        )
    }

    fn manager() -> SignalManager {
        SignalManager::new(SignalManagerConfig::default())
    }

    fn submit_and_process(
        m: &mut SignalManager,
        c: SignalCandidate,
        h: &MarketHealth,
        now: i64,
    ) -> Vec<ProcessedSignal> {
        m.submit(c, now);
        m.process_batch(h, MarketRegime::Balanced, now)
    }

    #[test]
    fn test_publishes_confident_candidate() {
        let mut m = manager();
        let h = health(Recommendation::Continue, 0.0);
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.8, 1_000),
            &h,
            1_000,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, FixedPoint::from_f64(0.8));
        assert_eq!(m.stats().processing.total_accepted, 1);
    }

    #[test]
    fn test_threshold_boundary_is_admitted() {
        let mut m = manager();
        let h = health(Recommendation::Continue, 0.0);
        // Default absorption threshold is 0.6; exactly 0.6 passes.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.6, 1_000),
            &h,
            1_000,
        );
        assert_eq!(out.len(), 1);

        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Buy, "99.00", 0.59, 2_000),
            &h,
            2_000,
        );
        assert!(out.is_empty());
        assert_eq!(m.stats().processing.threshold_rejects, 1);
    }

    #[test]
    fn test_throttle_same_type_side_price() {
        let mut m = manager();
        let h = health(Recommendation::Continue, 0.0);
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.8, 1_000),
            &h,
            1_000,
        );
        assert_eq!(out.len(), 1);

        // Same type/side within tolerance and throttle window: rejected.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.01", 0.8, 5_000),
            &h,
            5_000,
        );
        assert!(out.is_empty());
        assert_eq!(m.stats().processing.dropped_by_throttle, 1);

        // Different side is free to publish (and wins its conflict check
        // outright on confidence).
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Buy, "89.01", 0.9, 6_000),
            &h,
            6_000,
        );
        assert_eq!(out.len(), 1);

        // Far price escapes the tolerance band.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "95.00", 0.8, 7_000),
            &h,
            7_000,
        );
        assert_eq!(out.len(), 1);

        // Past the throttle and correlation windows the original zone may
        // publish again.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.8, 70_000),
            &h,
            70_000,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_health_gates() {
        let mut m = manager();

        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.8, 1_000),
            &health(Recommendation::ClosePositions, 0.0),
            1_000,
        );
        assert!(out.is_empty());
        assert_eq!(m.stats().processing.health_rejects, 1);

        // Pause rejects ordinary signals but admits bypass confidence.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "99.00", 0.8, 2_000),
            &health(Recommendation::Pause, 0.0),
            2_000,
        );
        assert!(out.is_empty());
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "109.00", 0.9, 3_000),
            &health(Recommendation::Pause, 0.0),
            3_000,
        );
        assert_eq!(out.len(), 1);

        // ReduceSize halves the position sizing.
        let full = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "119.00", 0.8, 4_000),
            &health(Recommendation::Continue, 0.0),
            4_000,
        );
        let reduced = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "129.00", 0.8, 5_000),
            &health(Recommendation::ReduceSize, 0.0),
            5_000,
        );
        assert_eq!(
            reduced[0].position_sizing * FixedPoint::from_int(2),
            full[0].position_sizing
        );
    }

    #[test]
    fn test_conflict_resolution_confidence_weighted() {
        let mut m = manager();
        // Volatility at the normalization factor applies the full penalty.
        let h = health(Recommendation::Continue, 0.003);

        // S1: absorption BUY at 0.8.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Buy, "89.00", 0.8, 0),
            &h,
            0,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, FixedPoint::from_f64(0.8));

        // S2: opposite side within tolerance 15s later, weaker.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::CvdConfirmation, Side::Sell, "89.20", 0.6, 15_000),
            &h,
            15_000,
        );
        assert!(out.is_empty());
        assert_eq!(m.stats().processing.conflict_rejects, 1);

        // The surviving signal's record carries the contradiction penalty:
        // 0.8 * (1 - 0.5) = 0.4.
        let s1 = m.history().next().unwrap();
        assert_eq!(s1.confidence, FixedPoint::from_f64(0.4));
        assert_eq!(s1.raw_confidence, FixedPoint::from_f64(0.8));
    }

    #[test]
    fn test_conflict_incoming_winner_published_adjusted() {
        let mut m = manager();
        let h = health(Recommendation::Continue, 0.003);

        submit_and_process(
            &mut m,
            candidate(SignalType::CvdConfirmation, Side::Sell, "89.00", 0.62, 0),
            &h,
            0,
        );
        // Stronger opposite-side signal wins and publishes with the
        // penalty applied: 0.9 * 0.5 = 0.45.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Buy, "89.10", 0.9, 15_000),
            &h,
            15_000,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, FixedPoint::from_f64(0.45));
        assert_eq!(out[0].raw_confidence, FixedPoint::from_f64(0.9));
    }

    #[test]
    fn test_no_conflict_without_volatility_penalty_still_resolves() {
        let mut m = manager();
        // Zero volatility: no penalty, higher raw confidence simply wins.
        let h = health(Recommendation::Continue, 0.0);
        submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Buy, "89.00", 0.8, 0),
            &h,
            0,
        );
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::CvdConfirmation, Side::Sell, "89.00", 0.6, 15_000),
            &h,
            15_000,
        );
        assert!(out.is_empty());
        // Without penalty the stored record keeps its confidence.
        assert_eq!(
            m.history().next().unwrap().confidence,
            FixedPoint::from_f64(0.8)
        );
    }

    #[test]
    fn test_circuit_breaker_rejects_after_failures() {
        let mut m = manager();
        let h = health(Recommendation::Continue, 0.0);
        for _ in 0..5 {
            m.record_detector_failure("absorption", 1_000);
        }
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.8, 2_000),
            &h,
            2_000,
        );
        assert!(out.is_empty());
        assert_eq!(m.stats().processing.circuit_breaker_rejects, 1);

        // After the reset the probe is admitted and closes the breaker.
        let out = submit_and_process(
            &mut m,
            candidate(SignalType::Absorption, Side::Sell, "99.00", 0.8, 40_000),
            &h,
            40_000,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_regime_matrix_scales_confidence() {
        let mut cfg = SignalManagerConfig::default();
        cfg.signal_priority_matrix.high_volatility.absorption = 0.5;
        let mut m = SignalManager::new(cfg);
        let h = health(Recommendation::Continue, 0.0);
        m.submit(
            candidate(SignalType::Absorption, Side::Sell, "89.00", 0.8, 1_000),
            1_000,
        );
        let out = m.process_batch(&h, MarketRegime::HighVolatility, 1_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, FixedPoint::from_f64(0.4));
    }

    #[test]
    fn test_stats_track_queue_watermark() {
        let mut m = manager();
        for i in 0..10 {
            m.submit(
                candidate(SignalType::Absorption, Side::Sell, "89.00", 0.7, i),
                i,
            );
        }
        assert_eq!(m.stats().queue.high_watermark, 10);
        assert_eq!(m.stats().processing.total_received, 10);
    }
}
