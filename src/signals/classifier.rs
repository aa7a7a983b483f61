// =============================================================================
// Signal Classifier: Aggregate score + reliability to BUY / SELL / NEUTRAL
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Signal, SignalStrength};

/// Distance from 50 below which a score is `weak`.
const MEDIUM_BAND: f64 = 15.0;
/// Distance from 50 above which a score is `strong`.
const STRONG_BAND: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub signal: Signal,
    pub strength: SignalStrength,
}

#[derive(Debug, Clone)]
pub struct SignalClassifier {
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub min_reliability: f64,
    consistent: bool,
}

impl SignalClassifier {
    pub fn new(buy_threshold: f64, sell_threshold: f64, min_reliability: f64) -> Self {
        let consistent = buy_threshold.is_finite()
            && sell_threshold.is_finite()
            && min_reliability.is_finite()
            && buy_threshold > sell_threshold;

        if !consistent {
            warn!(
                buy_threshold,
                sell_threshold,
                min_reliability,
                "inconsistent classifier thresholds, every score will classify NEUTRAL"
            );
        }

        Self {
            buy_threshold,
            sell_threshold,
            min_reliability,
            consistent,
        }
    }

    pub fn classify(&self, score: f64, reliability: f64) -> Classification {
        Classification {
            signal: self.signal(score, reliability),
            strength: strength_band(score),
        }
    }

    fn signal(&self, score: f64, reliability: f64) -> Signal {
        if !self.consistent || !score.is_finite() || !reliability.is_finite() {
            return Signal::Neutral;
        }
        if reliability < self.min_reliability {
            return Signal::Neutral;
        }

        let buy = score >= self.buy_threshold;
        let sell = score <= self.sell_threshold;
        match (buy, sell) {
            (true, false) => Signal::Buy,
            (false, true) => Signal::Sell,
            _ => Signal::Neutral,
        }
    }
}

impl Default for SignalClassifier {
    fn default() -> Self {
        Self::new(65.0, 35.0, 0.4)
    }
}

/// `|score - 50|`: weak below 15, medium 15..=30, strong above 30.
pub fn strength_band(score: f64) -> SignalStrength {
    let distance = (score - 50.0).abs();
    if !distance.is_finite() || distance < MEDIUM_BAND {
        SignalStrength::Weak
    } else if distance <= STRONG_BAND {
        SignalStrength::Medium
    } else {
        SignalStrength::Strong
    }
}
