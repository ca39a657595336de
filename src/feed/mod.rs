//! Feed boundary: wire types and parsing.
//!
//! The exchange transport itself lives outside the engine; this module
//! defines the messages the core consumes and converts decimal strings into
//! `FixedPoint` exactly once, at ingestion. Field renames follow the
//! exchange's diff-depth and aggregate-trade payloads.

pub mod pacer;

use crate::error::EngineError;
use crate::num::fixed::FixedPoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Differential depth update.
///
/// Example payload:
/// ```json
/// {"E":1672531200000,"U":157,"u":160,
///  "b":[["89.00","12.5"]],"a":[["89.05","0"]]}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthUpdateEvent {
    /// Event timestamp (Unix milliseconds).
    #[serde(rename = "E")]
    pub event_time: i64,

    /// First update id covered by this event.
    #[serde(rename = "U")]
    pub first_update_id: i64,

    /// Final update id covered by this event.
    #[serde(rename = "u")]
    pub final_update_id: i64,

    /// Bid changes as `[price, qty]` decimal strings; zero qty deletes.
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,

    /// Ask changes as `[price, qty]` decimal strings; zero qty deletes.
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Full depth snapshot returned by the injected fetcher at init and resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Aggregate trade event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Aggregate trade id.
    #[serde(rename = "a")]
    pub trade_id: u64,

    /// Symbol, e.g. "BTCUSDT".
    #[serde(rename = "s")]
    pub symbol: String,

    /// Price as decimal string.
    #[serde(rename = "p")]
    pub price: String,

    /// Quantity as decimal string.
    #[serde(rename = "q")]
    pub quantity: String,

    /// Trade timestamp (Unix milliseconds).
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// True when the buyer was the passive side (aggressive sell).
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// Parsed, immutable aggressive trade. Constructed only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggressiveTrade {
    pub trade_id: u64,
    pub pair: String,
    pub price: FixedPoint,
    pub quantity: FixedPoint,
    pub timestamp_ms: i64,
    pub buyer_is_maker: bool,
}

impl AggressiveTrade {
    /// True when the aggressor bought (lifted the ask).
    pub fn is_aggressive_buy(&self) -> bool {
        !self.buyer_is_maker
    }
}

impl TryFrom<&TradeEvent> for AggressiveTrade {
    type Error = EngineError;

    fn try_from(ev: &TradeEvent) -> Result<Self, Self::Error> {
        let price = FixedPoint::parse(&ev.price)
            .map_err(|e| EngineError::InputMalformed(format!("trade price: {e}")))?;
        let quantity = FixedPoint::parse(&ev.quantity)
            .map_err(|e| EngineError::InputMalformed(format!("trade quantity: {e}")))?;
        if !price.is_positive() || !quantity.is_positive() {
            return Err(EngineError::InputMalformed(format!(
                "non-positive trade fields: price={} qty={}",
                ev.price, ev.quantity
            )));
        }
        Ok(AggressiveTrade {
            trade_id: ev.trade_id,
            pair: ev.symbol.clone(),
            price,
            quantity,
            timestamp_ms: ev.trade_time,
            buyer_is_maker: ev.buyer_is_maker,
        })
    }
}

/// Parse one `[price, qty]` wire level.
pub fn parse_level(level: &[String; 2]) -> Result<(FixedPoint, FixedPoint), EngineError> {
    let price = FixedPoint::parse(&level[0])
        .map_err(|e| EngineError::InputMalformed(format!("level price: {e}")))?;
    let qty = FixedPoint::parse(&level[1])
        .map_err(|e| EngineError::InputMalformed(format!("level qty: {e}")))?;
    if price.is_negative() || qty.is_negative() {
        return Err(EngineError::InputMalformed(format!(
            "negative level fields: {} {}",
            level[0], level[1]
        )));
    }
    Ok((price, qty))
}

/// Everything the ingress loop can receive, in feed order.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(TradeEvent),
    Depth(DepthUpdateEvent),
    StreamConnected,
    StreamDisconnected(String),
}

/// Injected depth snapshot source (REST-equivalent). The engine never talks
/// to the network itself.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_depth_snapshot(&self, symbol: &str) -> Result<DepthSnapshot, EngineError>;
}
