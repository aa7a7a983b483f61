// =============================================================================
// Confluence Scorer: context validation, aggregation and classification
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::aggregator::{AggregateStatus, ComponentAggregator, ComponentReading, ComponentScore};
use super::classifier::SignalClassifier;
use super::context::{ContextValidator, MarketContext};
use crate::types::{Signal, SignalStrength};

/// One symbol's confluence verdict for one analysis cycle.
///
/// Built once and never mutated; a recompute produces a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceResult {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub status: AggregateStatus,
    pub aggregate_score: f64,
    pub reliability: f64,
    pub signal: Signal,
    pub strength: SignalStrength,
    pub coverage: f64,
    pub components: BTreeMap<String, ComponentScore>,
}

impl ConfluenceResult {
    pub fn is_actionable(&self) -> bool {
        self.status == AggregateStatus::Ok && self.signal != Signal::Neutral
    }
}

/// Full scoring pipeline for one symbol snapshot.
#[derive(Debug, Clone)]
pub struct ConfluenceScorer {
    aggregator: ComponentAggregator,
    classifier: SignalClassifier,
}

impl ConfluenceScorer {
    pub fn new(aggregator: ComponentAggregator, classifier: SignalClassifier) -> Self {
        Self {
            aggregator,
            classifier,
        }
    }

    pub fn from_weights(
        weights: HashMap<String, f64>,
        buy_threshold: f64,
        sell_threshold: f64,
        min_reliability: f64,
    ) -> Self {
        Self::new(
            ComponentAggregator::new(weights),
            SignalClassifier::new(buy_threshold, sell_threshold, min_reliability),
        )
    }

    /// Context-adjust every present component, aggregate and classify.
    pub fn score(
        &self,
        symbol: &str,
        timestamp: DateTime<Utc>,
        components: Vec<ComponentScore>,
        context: &MarketContext,
    ) -> ConfluenceResult {
        let adjusted = components
            .into_iter()
            .map(|c| match c.reading {
                ComponentReading::Present { score, weight } if score.is_finite() => {
                    ComponentScore::present(c.name, ContextValidator::apply(score, context), weight)
                }
                _ => c,
            })
            .collect();

        let aggregate = self.aggregator.aggregate(adjusted);
        let classification = if aggregate.is_sufficient() {
            self.classifier.classify(aggregate.score, aggregate.reliability)
        } else {
            self.classifier.classify(50.0, 0.0)
        };

        debug!(
            symbol,
            status = ?aggregate.status,
            score = format!("{:.2}", aggregate.score),
            signal = %classification.signal,
            strength = %classification.strength,
            "confluence scored"
        );

        ConfluenceResult {
            symbol: symbol.to_string(),
            timestamp,
            status: aggregate.status,
            aggregate_score: aggregate.score,
            reliability: aggregate.reliability,
            signal: classification.signal,
            strength: classification.strength,
            coverage: aggregate.coverage,
            components: aggregate.components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> ConfluenceScorer {
        let weights = [
            "momentum",
            "volume",
            "orderflow",
            "orderbook",
            "sentiment",
            "price_structure",
        ]
        .iter()
        .map(|n| (n.to_string(), 1.0))
        .collect();
        ConfluenceScorer::from_weights(weights, 65.0, 35.0, 0.4)
    }

    fn components(values: [f64; 6]) -> Vec<ComponentScore> {
        [
            "momentum",
            "volume",
            "orderflow",
            "orderbook",
            "sentiment",
            "price_structure",
        ]
        .iter()
        .zip(values)
        .map(|(n, s)| ComponentScore::present(*n, s, 1.0))
        .collect()
    }

    #[test]
    fn moderate_agreement_is_neutral() {
        let r = scorer().score(
            "BTCUSDT",
            Utc::now(),
            components([70.0, 65.0, 60.0, 55.0, 50.0, 68.0]),
            &MarketContext::default(),
        );
        assert_eq!(r.status, AggregateStatus::Ok);
        assert!((r.aggregate_score - 61.33).abs() < 0.01);
        assert_eq!(r.signal, Signal::Neutral);
    }

    #[test]
    fn strong_agreement_is_buy() {
        let r = scorer().score(
            "BTCUSDT",
            Utc::now(),
            components([80.0, 75.0, 70.0, 78.0, 72.0, 76.0]),
            &MarketContext::default(),
        );
        assert!((r.aggregate_score - 75.17).abs() < 0.01);
        assert_eq!(r.signal, Signal::Buy);
        assert_eq!(r.strength, SignalStrength::Medium);
        assert!(r.is_actionable());
    }

    #[test]
    fn insufficient_coverage_never_signals() {
        let r = scorer().score(
            "ETHUSDT",
            Utc::now(),
            vec![
                ComponentScore::present("momentum", 100.0, 1.0),
                ComponentScore::present("volume", 100.0, 1.0),
            ],
            &MarketContext::default(),
        );
        assert_eq!(r.status, AggregateStatus::InsufficientData);
        assert_eq!(r.signal, Signal::Neutral);
        assert_eq!(r.reliability, 0.0);
        assert!(!r.is_actionable());
    }

    #[test]
    fn extreme_funding_neutralises_buy() {
        let ctx = MarketContext {
            funding_rate: Some(0.02),
            ..Default::default()
        };
        let r = scorer().score(
            "SOLUSDT",
            Utc::now(),
            components([80.0, 75.0, 70.0, 78.0, 72.0, 76.0]),
            &ctx,
        );
        assert!(r.aggregate_score <= 60.0);
        assert_eq!(r.signal, Signal::Neutral);
    }
}
