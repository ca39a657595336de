//! Shared enums used across the pipeline, detectors and the signal manager.

use serde::{Deserialize, Serialize};

/// Directional side of a signal or aggressive trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Passive side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn opposite(self) -> Self {
        match self {
            BookSide::Bid => BookSide::Ask,
            BookSide::Ask => BookSide::Bid,
        }
    }

    /// Signal direction that opposes pressure resting on this side.
    ///
    /// A collapsing bid means support is gone: sell. Mirrored for asks.
    pub fn opposing_signal(self) -> Side {
        match self {
            BookSide::Bid => Side::Sell,
            BookSide::Ask => Side::Buy,
        }
    }
}

/// Kind of a signal candidate. One enumerated channel per kind; detectors
/// expose typed outbound ports instead of dynamic topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Absorption,
    Exhaustion,
    Accumulation,
    Distribution,
    CvdConfirmation,
    Iceberg,
}

impl SignalType {
    pub const ALL: [SignalType; 6] = [
        SignalType::Absorption,
        SignalType::Exhaustion,
        SignalType::Accumulation,
        SignalType::Distribution,
        SignalType::CvdConfirmation,
        SignalType::Iceberg,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Absorption => "absorption",
            SignalType::Exhaustion => "exhaustion",
            SignalType::Accumulation => "accumulation",
            SignalType::Distribution => "distribution",
            SignalType::CvdConfirmation => "cvd_confirmation",
            SignalType::Iceberg => "iceberg",
        }
    }
}

/// Volatility regime used by the signal manager's context adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    HighVolatility,
    LowVolatility,
    Balanced,
}

/// Detector enhancement mode, toggled at runtime via the control surface.
///
/// `Testing` computes enhanced metrics and logs them without changing what
/// is emitted; `Production` applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementMode {
    Disabled,
    Testing,
    Production,
}

impl Default for EnhancementMode {
    fn default() -> Self {
        EnhancementMode::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_book_side_opposing_signal() {
        assert_eq!(BookSide::Bid.opposing_signal(), Side::Sell);
        assert_eq!(BookSide::Ask.opposing_signal(), Side::Buy);
    }

    #[test]
    fn test_signal_type_serialization() {
        let json = serde_json::to_string(&SignalType::CvdConfirmation).unwrap();
        assert_eq!(json, "\"cvd_confirmation\"");
    }
}
