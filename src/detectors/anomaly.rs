//! Anomaly aggregation and market health.
//!
//! Sinks events from the spoofing and iceberg detectors through their
//! outbound ports, derives volatility/spread/flow metrics of its own, and
//! answers the signal manager's health queries. Nothing here references a
//! concrete detector.

use crate::config::AnomalyConfig;
use crate::num::fixed::FixedPoint;
use crate::num::rolling::RollingWindow;
use crate::pipeline::EnrichedTradeEvent;
use crate::types::MarketRegime;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spoofing,
    Iceberg,
    Volatility,
    FlowImbalance,
    OrderSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnomalyEvent {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub price: Option<FixedPoint>,
    pub timestamp_ms: i64,
}

/// Publication guidance for the signal manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Continue,
    ReduceSize,
    Pause,
    ClosePositions,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// Stddev of mid-price returns over the rolling window.
    pub volatility: FixedPoint,
    pub spread_bps: FixedPoint,
    /// `(buy - sell) / (buy + sell)` aggressive volume over the window.
    pub flow_imbalance: FixedPoint,
    pub last_update_age_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketHealth {
    pub is_healthy: bool,
    pub recommendation: Recommendation,
    pub recent_anomalies: usize,
    pub highest_severity: Option<AnomalySeverity>,
    pub recent_anomaly_types: Vec<AnomalyKind>,
    pub metrics: HealthMetrics,
}

pub struct AnomalyDetector {
    cfg: AnomalyConfig,
    events: VecDeque<AnomalyEvent>,
    last_report: HashMap<AnomalyKind, i64>,
    mid_returns: RollingWindow,
    last_mid: Option<FixedPoint>,
    spread_bps: FixedPoint,
    buy_flow: RollingWindow,
    sell_flow: RollingWindow,
    trade_sizes: RollingWindow,
    last_update_ms: i64,
}

impl AnomalyDetector {
    pub const ID: &'static str = "anomaly";

    pub fn new(cfg: AnomalyConfig, window_ms: i64) -> Self {
        let cap = cfg.window_size;
        Self {
            cfg,
            events: VecDeque::with_capacity(cap),
            last_report: HashMap::new(),
            mid_returns: RollingWindow::new(cap, window_ms),
            last_mid: None,
            spread_bps: FixedPoint::ZERO,
            buy_flow: RollingWindow::new(cap * 4, window_ms),
            sell_flow: RollingWindow::new(cap * 4, window_ms),
            trade_sizes: RollingWindow::new(cap * 4, window_ms),
            last_update_ms: 0,
        }
    }

    /// Sink one event from an outbound detector port. Same-kind reports
    /// inside the cooldown are deduplicated.
    pub fn record(&mut self, event: AnomalyEvent) {
        if let Some(last) = self.last_report.get(&event.kind) {
            if event.timestamp_ms - last < self.cfg.anomaly_cooldown_ms {
                return;
            }
        }
        self.last_report.insert(event.kind, event.timestamp_ms);
        if self.events.len() >= self.cfg.window_size {
            self.events.pop_front();
        }
        debug!(kind = ?event.kind, severity = ?event.severity, "anomaly recorded");
        self.events.push_back(event);
    }

    /// Update flow and order-size metrics from an enriched trade.
    pub fn on_trade(&mut self, event: &EnrichedTradeEvent) {
        let trade = &event.trade;
        let now_ms = trade.timestamp_ms;
        self.last_update_ms = now_ms;

        if trade.is_aggressive_buy() {
            self.buy_flow.push(now_ms, trade.quantity);
        } else {
            self.sell_flow.push(now_ms, trade.quantity);
        }

        let mean_size = self.trade_sizes.mean();
        if self.trade_sizes.len() >= 20
            && mean_size.is_positive()
            && trade.quantity
                > mean_size * FixedPoint::from_f64(self.cfg.order_size_anomaly_threshold)
        {
            self.record(AnomalyEvent {
                kind: AnomalyKind::OrderSize,
                severity: AnomalySeverity::Low,
                price: Some(trade.price),
                timestamp_ms: now_ms,
            });
        }
        self.trade_sizes.push(now_ms, trade.quantity);

        let imbalance = self.flow_imbalance();
        if self.buy_flow.len() + self.sell_flow.len() >= 20
            && imbalance.abs() > FixedPoint::from_f64(self.cfg.volume_imbalance_threshold)
        {
            self.record(AnomalyEvent {
                kind: AnomalyKind::FlowImbalance,
                severity: AnomalySeverity::Medium,
                price: Some(trade.price),
                timestamp_ms: now_ms,
            });
        }

        if let (Some(bid), Some(ask)) = (event.best_bid, event.best_ask) {
            self.observe_quote(bid, ask, now_ms);
        }
    }

    /// Update volatility and spread tracking from the current top of book.
    pub fn observe_quote(&mut self, best_bid: FixedPoint, best_ask: FixedPoint, now_ms: i64) {
        if best_bid >= best_ask {
            return;
        }
        let mid = (best_bid + best_ask) / FixedPoint::from_int(2);
        self.spread_bps = (best_ask - best_bid)
            .safe_div(mid)
            .mul_int(10_000);

        if let Some(last) = self.last_mid {
            let ret = (mid - last).safe_div(last);
            self.mid_returns.push(now_ms, ret);

            let volatility = self.mid_returns.std_dev();
            if self.mid_returns.len() >= 10
                && volatility > FixedPoint::from_f64(self.cfg.volatility_high_threshold * 2.0)
            {
                self.record(AnomalyEvent {
                    kind: AnomalyKind::Volatility,
                    severity: AnomalySeverity::High,
                    price: Some(mid),
                    timestamp_ms: now_ms,
                });
            }
        }
        self.last_mid = Some(mid);
        self.last_update_ms = now_ms;
    }

    fn flow_imbalance(&self) -> FixedPoint {
        let buys = self.buy_flow.sum();
        let sells = self.sell_flow.sum();
        (buys - sells).safe_div(buys + sells)
    }

    pub fn volatility(&self) -> FixedPoint {
        self.mid_returns.std_dev()
    }

    /// Volatility regime for the signal manager's context adjustment.
    pub fn regime(&self) -> MarketRegime {
        let vol = self.volatility();
        if vol > FixedPoint::from_f64(self.cfg.volatility_high_threshold) {
            MarketRegime::HighVolatility
        } else if vol < FixedPoint::from_f64(self.cfg.volatility_low_threshold) {
            MarketRegime::LowVolatility
        } else {
            MarketRegime::Balanced
        }
    }

    pub fn get_market_health(&self, now_ms: i64) -> MarketHealth {
        let highest = self.events.iter().map(|e| e.severity).max();
        let mut kinds: Vec<AnomalyKind> = Vec::new();
        for event in &self.events {
            if !kinds.contains(&event.kind) {
                kinds.push(event.kind);
            }
        }

        let high_count = self
            .events
            .iter()
            .filter(|e| e.severity >= AnomalySeverity::High)
            .count();
        let recommendation = if highest == Some(AnomalySeverity::Critical) {
            Recommendation::ClosePositions
        } else if high_count >= self.cfg.pause_severity_count {
            Recommendation::Pause
        } else if high_count > 0 || highest == Some(AnomalySeverity::Medium) {
            Recommendation::ReduceSize
        } else {
            Recommendation::Continue
        };

        MarketHealth {
            is_healthy: recommendation == Recommendation::Continue,
            recommendation,
            recent_anomalies: self.events.len(),
            highest_severity: highest,
            recent_anomaly_types: kinds,
            metrics: HealthMetrics {
                volatility: self.volatility(),
                spread_bps: self.spread_bps,
                flow_imbalance: self.flow_imbalance(),
                last_update_age_ms: now_ms.saturating_sub(self.last_update_ms),
            },
        }
    }
}
