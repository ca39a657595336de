//! Engine configuration.
//!
//! One `EngineConfig` value per symbol, deserialized from JSON/TOML by the
//! host and passed by value into each component. There is no global mutable
//! state; hot reload is a new config snapshot swapped between enrichment
//! events. Validation runs once at startup and is the only place
//! `ConfigInvalid` can originate.

use crate::error::EngineError;
use crate::types::SignalType;
use serde::{Deserialize, Serialize};

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_zone_ticks() -> Vec<u32> {
    vec![5, 10, 20]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Trading pair served by this engine instance.
    pub symbol: String,

    /// Decimal places of the displayed price.
    pub price_precision: u32,

    /// Price increment of the instrument.
    pub tick_size: f64,

    /// Default rolling-window span for averages and deltas.
    pub window_ms: i64,

    /// Tick-window sizes for zone aggregation, ascending.
    pub zone_ticks: Vec<u32>,

    /// Tick-window used by absorption/exhaustion as the primary view.
    pub primary_zone_ticks: u32,

    /// Band (in ticks) for the enriched trade's zone passive volumes.
    pub band_ticks: u32,

    pub order_book: OrderBookConfig,
    pub absorption: AbsorptionConfig,
    pub exhaustion: ExhaustionConfig,
    pub zones: ZoneDetectorConfig,
    pub iceberg: IcebergConfig,
    pub spoofing: SpoofingConfig,
    pub anomaly: AnomalyConfig,
    pub delta_cvd: DeltaCvdConfig,
    pub signal_manager: SignalManagerConfig,

    /// Deadline for a single persistence send.
    pub operation_timeout_ms: u64,

    /// Budget for draining the signal queue at shutdown.
    pub shutdown_drain_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            price_precision: 2,
            tick_size: 0.01,
            window_ms: 90_000,
            zone_ticks: default_zone_ticks(),
            primary_zone_ticks: 10,
            band_ticks: 20,
            order_book: OrderBookConfig::default(),
            absorption: AbsorptionConfig::default(),
            exhaustion: ExhaustionConfig::default(),
            zones: ZoneDetectorConfig::default(),
            iceberg: IcebergConfig::default(),
            spoofing: SpoofingConfig::default(),
            anomaly: AnomalyConfig::default(),
            delta_cvd: DeltaCvdConfig::default(),
            signal_manager: SignalManagerConfig::default(),
            operation_timeout_ms: 2_000,
            shutdown_drain_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Startup-only validation. Every reachable code path after this point
    /// may assume the config is internally consistent.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::ConfigInvalid(msg));

        if self.symbol.is_empty() {
            return fail("symbol must not be empty".into());
        }
        if self.tick_size <= 0.0 {
            return fail(format!("tickSize must be positive, got {}", self.tick_size));
        }
        if self.zone_ticks.is_empty() {
            return fail("zoneTicks must not be empty".into());
        }
        if self.zone_ticks.windows(2).any(|w| w[0] >= w[1]) {
            return fail("zoneTicks must be strictly ascending".into());
        }
        if !self.zone_ticks.contains(&self.primary_zone_ticks) {
            return fail(format!(
                "primaryZoneTicks {} must be one of zoneTicks {:?}",
                self.primary_zone_ticks, self.zone_ticks
            ));
        }
        if self.window_ms <= 0 {
            return fail("windowMs must be positive".into());
        }
        if self.order_book.max_levels == 0 {
            return fail("orderBookState.maxLevels must be positive".into());
        }

        for (name, v) in [
            (
                "absorption.passiveAbsorptionThreshold",
                self.absorption.passive_absorption_threshold,
            ),
            (
                "absorption.priceEfficiencyThreshold",
                self.absorption.price_efficiency_threshold,
            ),
            (
                "absorption.finalConfidenceRequired",
                self.absorption.final_confidence_required,
            ),
            (
                "exhaustion.exhaustionThreshold",
                self.exhaustion.exhaustion_threshold,
            ),
            ("zones.completionThreshold", self.zones.completion_threshold),
            (
                "signalManager.confidenceThreshold",
                self.signal_manager.confidence_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return fail(format!("{name} must be within [0, 1], got {v}"));
            }
        }

        let w = &self.absorption.weights;
        let sum = w.efficiency + w.passive_ratio + w.institutional + w.confluence;
        if (sum - 1.0).abs() > 1e-9 {
            return fail(format!(
                "absorption confidence weights must sum to 1, got {sum}"
            ));
        }

        let sm = &self.signal_manager;
        if sm.max_queue_size == 0 || sm.processing_batch_size == 0 {
            return fail("signalManager queue and batch sizes must be positive".into());
        }
        if sm.backpressure_threshold >= sm.max_queue_size {
            return fail(format!(
                "backpressureThreshold {} must be below maxQueueSize {}",
                sm.backpressure_threshold, sm.max_queue_size
            ));
        }
        if sm.min_adaptive_batch_size > sm.max_adaptive_batch_size {
            return fail("adaptive batch bounds are inverted".into());
        }
        if sm.conflict_resolution.contradiction_penalty_factor < 0.0
            || sm.conflict_resolution.contradiction_penalty_factor > 1.0
        {
            return fail("contradictionPenaltyFactor must be within [0, 1]".into());
        }

        if self.iceberg.min_refill_count == 0 {
            return fail("iceberg.minRefillCount must be positive".into());
        }
        if self.anomaly.window_size == 0 {
            return fail("anomaly.windowSize must be positive".into());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderBookConfig {
    /// Hard cap on tracked levels; furthest-from-mid evicted beyond it.
    pub max_levels: usize,
    /// Levels further than this many ticks from mid are pruned.
    pub max_price_distance_ticks: u32,
    pub prune_interval_ms: i64,
    /// Book age beyond which health degrades to stale (10x while the stream
    /// is disconnected).
    pub stale_threshold_ms: i64,
    pub max_error_rate: f64,
    /// Snapshot fetch attempts before `SnapshotUnavailable` escalates.
    pub snapshot_attempts: u32,
    pub snapshot_timeout_ms: u64,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            max_levels: 2_000,
            max_price_distance_ticks: 5_000,
            prune_interval_ms: 30_000,
            stale_threshold_ms: 5_000,
            max_error_rate: 0.05,
            snapshot_attempts: 3,
            snapshot_timeout_ms: 5_000,
        }
    }
}

/// Weights of the absorption confidence aggregate. Components are fixed by
/// the detector; the weighting is deliberately configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbsorptionWeights {
    pub efficiency: f64,
    pub passive_ratio: f64,
    pub institutional: f64,
    pub confluence: f64,
}

impl Default for AbsorptionWeights {
    fn default() -> Self {
        Self {
            efficiency: 0.35,
            passive_ratio: 0.30,
            institutional: 0.20,
            confluence: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbsorptionConfig {
    pub min_agg_volume: f64,
    pub passive_absorption_threshold: f64,
    pub min_passive_multiplier: f64,
    pub price_efficiency_threshold: f64,
    pub expected_movement_scaling_factor: f64,
    pub event_cooldown_ms: i64,
    pub final_confidence_required: f64,
    pub institutional_volume_threshold: f64,
    /// Passive-side dominance margin: |bid - ask| / total must exceed this.
    pub dominance_margin: f64,
    pub refill_confidence_boost: f64,
    pub weights: AbsorptionWeights,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume: 300.0,
            passive_absorption_threshold: 0.6,
            min_passive_multiplier: 1.5,
            price_efficiency_threshold: 0.45,
            expected_movement_scaling_factor: 1.0,
            event_cooldown_ms: 15_000,
            final_confidence_required: 0.6,
            institutional_volume_threshold: 50.0,
            dominance_margin: 0.2,
            refill_confidence_boost: 0.08,
            weights: AbsorptionWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExhaustionFeatures {
    pub spread_expansion: bool,
    pub depletion_velocity: bool,
}

impl Default for ExhaustionFeatures {
    fn default() -> Self {
        Self {
            spread_expansion: true,
            depletion_velocity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExhaustionConfig {
    pub exhaustion_threshold: f64,
    pub max_passive_ratio: f64,
    pub min_depletion_factor: f64,
    pub event_cooldown_ms: i64,
    pub features: ExhaustionFeatures,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            exhaustion_threshold: 0.7,
            max_passive_ratio: 0.6,
            min_depletion_factor: 5.0,
            event_cooldown_ms: 15_000,
            features: ExhaustionFeatures::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZoneDetectorConfig {
    pub min_zone_volume: f64,
    pub min_trade_count: u64,
    pub min_buy_ratio: f64,
    pub min_sell_ratio: f64,
    pub min_candidate_duration_ms: i64,
    /// Maximum relative price deviation tolerated inside a candidate.
    pub max_price_deviation: f64,
    pub min_zone_strength: f64,
    pub max_active_zones: usize,
    pub zone_timeout_ms: i64,
    pub completion_threshold: f64,
    pub strength_change_threshold: f64,
}

impl Default for ZoneDetectorConfig {
    fn default() -> Self {
        Self {
            min_zone_volume: 1_000.0,
            min_trade_count: 30,
            min_buy_ratio: 0.75,
            min_sell_ratio: 0.75,
            min_candidate_duration_ms: 60_000,
            max_price_deviation: 0.002,
            min_zone_strength: 0.5,
            max_active_zones: 5,
            zone_timeout_ms: 600_000,
            completion_threshold: 0.85,
            strength_change_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IcebergConfig {
    pub min_refill_count: u32,
    /// Max coefficient of variation across piece sizes.
    pub max_size_variation: f64,
    pub min_total_size: f64,
    pub max_refill_time_ms: i64,
    pub institutional_size_threshold: f64,
    pub tracking_window_ms: i64,
    pub max_active_icebergs: usize,
}

impl Default for IcebergConfig {
    fn default() -> Self {
        Self {
            min_refill_count: 4,
            max_size_variation: 0.25,
            min_total_size: 200.0,
            max_refill_time_ms: 10_000,
            institutional_size_threshold: 40.0,
            tracking_window_ms: 120_000,
            max_active_icebergs: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpoofingConfig {
    /// Wall search distance from the traded price, in ticks.
    pub wall_ticks: u32,
    pub min_wall_size: f64,
    /// Widen `wall_ticks` with the current spread.
    pub dynamic_wall_width: bool,
    /// How long a cancelled wall taints its price neighbourhood.
    pub spoof_window_ms: i64,
    /// A wall is considered cancelled when it shrinks below this fraction of
    /// its peak without matching traded volume.
    pub cancel_fraction: f64,
}

impl Default for SpoofingConfig {
    fn default() -> Self {
        Self {
            wall_ticks: 10,
            min_wall_size: 500.0,
            dynamic_wall_width: true,
            spoof_window_ms: 60_000,
            cancel_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnomalyConfig {
    /// Bound on retained anomaly events.
    pub window_size: usize,
    pub anomaly_cooldown_ms: i64,
    pub volume_imbalance_threshold: f64,
    pub normal_spread_bps: f64,
    pub order_size_anomaly_threshold: f64,
    /// Volatility (stddev of mid returns) above which the regime is
    /// high-volatility; below the low bound it is low-volatility.
    pub volatility_high_threshold: f64,
    pub volatility_low_threshold: f64,
    /// Recent high-severity events required to recommend a pause.
    pub pause_severity_count: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            anomaly_cooldown_ms: 10_000,
            volume_imbalance_threshold: 0.7,
            normal_spread_bps: 2.0,
            order_size_anomaly_threshold: 10.0,
            volatility_high_threshold: 0.003,
            volatility_low_threshold: 0.0005,
            pause_severity_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeltaCvdConfig {
    /// |z| of the windowed cumulative delta required to emit.
    pub z_threshold: f64,
    pub min_trades_per_window: u64,
    pub min_volume_per_window: f64,
    pub event_cooldown_ms: i64,
    /// Sampled delta population size backing the z-score.
    pub sample_capacity: usize,
}

impl Default for DeltaCvdConfig {
    fn default() -> Self {
        Self {
            z_threshold: 2.0,
            min_trades_per_window: 20,
            min_volume_per_window: 100.0,
            event_cooldown_ms: 20_000,
            sample_capacity: 512,
        }
    }
}

/// Per-type queue priorities on a 0-10 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalTypePriorities {
    pub absorption: f64,
    pub exhaustion: f64,
    pub deltacvd: f64,
    pub accumulation: f64,
    pub distribution: f64,
    pub iceberg: f64,
}

impl Default for SignalTypePriorities {
    fn default() -> Self {
        Self {
            absorption: 10.0,
            exhaustion: 9.0,
            deltacvd: 8.0,
            accumulation: 7.0,
            distribution: 7.0,
            iceberg: 6.0,
        }
    }
}

impl SignalTypePriorities {
    pub fn get(&self, t: SignalType) -> f64 {
        match t {
            SignalType::Absorption => self.absorption,
            SignalType::Exhaustion => self.exhaustion,
            SignalType::CvdConfirmation => self.deltacvd,
            SignalType::Accumulation => self.accumulation,
            SignalType::Distribution => self.distribution,
            SignalType::Iceberg => self.iceberg,
        }
    }
}

/// Minimum admitted confidence per signal type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorThresholds {
    pub absorption: f64,
    pub exhaustion: f64,
    pub deltacvd: f64,
    pub accumulation: f64,
    pub distribution: f64,
    pub iceberg: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            absorption: 0.6,
            exhaustion: 0.65,
            deltacvd: 0.55,
            accumulation: 0.6,
            distribution: 0.6,
            iceberg: 0.6,
        }
    }
}

impl DetectorThresholds {
    pub fn get(&self, t: SignalType) -> f64 {
        match t {
            SignalType::Absorption => self.absorption,
            SignalType::Exhaustion => self.exhaustion,
            SignalType::CvdConfirmation => self.deltacvd,
            SignalType::Accumulation => self.accumulation,
            SignalType::Distribution => self.distribution,
            SignalType::Iceberg => self.iceberg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PositionSizingConfig {
    /// Base position fraction attached to a published signal.
    pub base_size: f64,
    pub high_confidence_multiplier: f64,
    pub low_confidence_multiplier: f64,
    /// Factor applied when market health recommends reduced size.
    pub reduced_size_factor: f64,
}

impl Default for PositionSizingConfig {
    fn default() -> Self {
        Self {
            base_size: 0.02,
            high_confidence_multiplier: 1.5,
            low_confidence_multiplier: 0.5,
            reduced_size_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ConfidenceWeighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictResolutionConfig {
    pub enabled: bool,
    pub strategy: ConflictStrategy,
    pub minimum_separation_ms: i64,
    pub contradiction_penalty_factor: f64,
    /// Relative price tolerance for treating two signals as conflicting.
    pub price_tolerance: f64,
    /// Volatility at which the contradiction penalty applies in full.
    pub volatility_normalization_factor: f64,
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ConflictStrategy::ConfidenceWeighted,
            minimum_separation_ms: 1_000,
            contradiction_penalty_factor: 0.5,
            price_tolerance: 0.003,
            volatility_normalization_factor: 0.003,
        }
    }
}

/// Confidence multipliers per regime and signal type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegimeFactors {
    pub absorption: f64,
    pub exhaustion: f64,
    pub deltacvd: f64,
    pub accumulation: f64,
    pub distribution: f64,
    pub iceberg: f64,
}

impl Default for RegimeFactors {
    fn default() -> Self {
        Self {
            absorption: 1.0,
            exhaustion: 1.0,
            deltacvd: 1.0,
            accumulation: 1.0,
            distribution: 1.0,
            iceberg: 1.0,
        }
    }
}

impl RegimeFactors {
    pub fn get(&self, t: SignalType) -> f64 {
        match t {
            SignalType::Absorption => self.absorption,
            SignalType::Exhaustion => self.exhaustion,
            SignalType::CvdConfirmation => self.deltacvd,
            SignalType::Accumulation => self.accumulation,
            SignalType::Distribution => self.distribution,
            SignalType::Iceberg => self.iceberg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalPriorityMatrix {
    pub high_volatility: RegimeFactors,
    pub low_volatility: RegimeFactors,
    pub balanced: RegimeFactors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalManagerConfig {
    pub confidence_threshold: f64,
    pub max_queue_size: usize,
    pub processing_batch_size: usize,
    pub backpressure_threshold: usize,
    /// Priority score required for admission once backpressure engages.
    pub priority_queue_high_threshold: f64,
    /// Confidence (0-10 scale after scaling) granting unconditional entry.
    pub high_priority_bypass_threshold: f64,
    pub adaptive_batch_sizing: bool,
    pub min_adaptive_batch_size: usize,
    pub max_adaptive_batch_size: usize,
    pub backpressure_yield_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_window_ms: i64,
    pub circuit_breaker_reset_ms: i64,
    pub signal_type_priorities: SignalTypePriorities,
    pub detector_thresholds: DetectorThresholds,
    pub position_sizing: PositionSizingConfig,
    /// Relative price tolerance of the same-type throttle.
    pub price_tolerance_percent: f64,
    pub signal_throttle_ms: i64,
    pub correlation_window_ms: i64,
    pub max_history_size: usize,
    pub conflict_resolution: ConflictResolutionConfig,
    pub signal_priority_matrix: SignalPriorityMatrix,
}

impl Default for SignalManagerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            max_queue_size: 256,
            processing_batch_size: 16,
            backpressure_threshold: 192,
            priority_queue_high_threshold: 7.5,
            high_priority_bypass_threshold: 8.5,
            adaptive_batch_sizing: true,
            min_adaptive_batch_size: 4,
            max_adaptive_batch_size: 64,
            backpressure_yield_ms: 5,
            circuit_breaker_threshold: 5,
            circuit_breaker_window_ms: 60_000,
            circuit_breaker_reset_ms: 30_000,
            signal_type_priorities: SignalTypePriorities::default(),
            detector_thresholds: DetectorThresholds::default(),
            position_sizing: PositionSizingConfig::default(),
            price_tolerance_percent: 0.003,
            signal_throttle_ms: 30_000,
            correlation_window_ms: 60_000,
            max_history_size: 512,
            conflict_resolution: ConflictResolutionConfig::default(),
            signal_priority_matrix: SignalPriorityMatrix::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_tick_size() {
        let cfg = EngineConfig {
            tick_size: 0.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::ConfigInvalid(_))));
    }

    #[test]
    fn test_rejects_unsorted_zone_ticks() {
        let cfg = EngineConfig {
            zone_ticks: vec![10, 5, 20],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_primary_zone_outside_windows() {
        let cfg = EngineConfig {
            primary_zone_ticks: 7,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_backpressure_above_queue() {
        let mut cfg = EngineConfig::default();
        cfg.signal_manager.backpressure_threshold = cfg.signal_manager.max_queue_size;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_weights_not_summing_to_one() {
        let mut cfg = EngineConfig::default();
        cfg.absorption.weights.efficiency = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserializes_partial_json() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","tickSize":0.05,"signalManager":{"maxQueueSize":64,"backpressureThreshold":32}}"#,
        )
        .unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.signal_manager.max_queue_size, 64);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.zone_ticks, vec![5, 10, 20]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_priority_lookup() {
        let p = SignalTypePriorities::default();
        assert_eq!(p.get(SignalType::Absorption), 10.0);
        assert_eq!(p.get(SignalType::CvdConfirmation), 8.0);
    }
}
