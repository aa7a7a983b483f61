// =============================================================================
// Anomaly Detection Module
// =============================================================================
//
// Statistical whale / liquidation detection over rolling per-symbol windows:
// - Whale accumulation / distribution (order book + executed trades)
// - Liquidation cascades
// - Conflicting book pressure vs executed flow (spoofing suspicion)

pub mod detector;
pub mod window;

pub use detector::{whale_threshold, AnomalyDetector, FlowSummary};
pub use window::EventWindow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Whether an event was a voluntary trade or a forced liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trade,
    Liquidation,
}

/// A single executed trade or liquidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    /// Notional value. When zero the detector falls back to `price * size`.
    #[serde(default)]
    pub usd_value: f64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl MarketEvent {
    pub fn trade(
        symbol: impl Into<String>,
        side: Side,
        size: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            price,
            usd_value: size * price,
            timestamp,
            kind: EventKind::Trade,
        }
    }

    pub fn liquidation(
        symbol: impl Into<String>,
        side: Side,
        size: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EventKind::Liquidation,
            ..Self::trade(symbol, side, size, price, timestamp)
        }
    }

    /// Notional in USD, or `None` when the event carries no usable value.
    pub fn notional(&self) -> Option<f64> {
        let usd = if self.usd_value > 0.0 {
            self.usd_value
        } else {
            self.price * self.size
        };
        (usd.is_finite() && usd > 0.0).then_some(usd)
    }
}

/// One price level of an order book snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Resting orders at evaluation time. Bids are buy pressure, asks sell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

fn default_usd_threshold() -> f64 {
    100_000.0
}

fn default_imbalance_threshold() -> f64 {
    0.6
}

fn default_min_event_count() -> usize {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

/// Conjunctive alert thresholds for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyThresholdConfig {
    /// Minimum absolute net flow in USD.
    #[serde(default = "default_usd_threshold")]
    pub usd_threshold: f64,

    /// Minimum |net / total| flow imbalance in [0, 1].
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,

    /// Minimum number of qualifying events.
    #[serde(default = "default_min_event_count")]
    pub min_event_count: usize,

    /// Seconds during which an identical alert is suppressed.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for AnomalyThresholdConfig {
    fn default() -> Self {
        Self {
            usd_threshold: default_usd_threshold(),
            imbalance_threshold: default_imbalance_threshold(),
            min_event_count: default_min_event_count(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    WhaleAccumulation,
    WhaleDistribution,
    LiquidationCascade,
    /// Book pressure one way, executed whale flow the other way.
    ConflictingSignals,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WhaleAccumulation => write!(f, "whale_accumulation"),
            Self::WhaleDistribution => write!(f, "whale_distribution"),
            Self::LiquidationCascade => write!(f, "liquidation_cascade"),
            Self::ConflictingSignals => write!(f, "conflicting_signals"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub id: String,
    pub symbol: String,
    pub kind: AlertKind,
    pub direction: Side,
    pub usd_value: f64,
    pub imbalance: f64,
    pub event_count: usize,
    /// Size cut-off used to qualify whale events (0 for liquidations).
    pub whale_threshold: f64,
    pub detected_at: DateTime<Utc>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notional_falls_back_to_price_times_size() {
        let mut e = MarketEvent::trade("BTCUSDT", Side::Buy, 2.0, 50.0, Utc::now());
        assert_eq!(e.notional(), Some(100.0));
        e.usd_value = 0.0;
        assert_eq!(e.notional(), Some(100.0));
        e.price = f64::NAN;
        assert_eq!(e.notional(), None);
    }

    #[test]
    fn threshold_config_partial_json() {
        let cfg: AnomalyThresholdConfig =
            serde_json::from_str(r#"{ "usd_threshold": 250000.0 }"#).unwrap();
        assert!((cfg.usd_threshold - 250_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.min_event_count, 3);
        assert_eq!(cfg.cooldown_secs, 300);
    }
}
