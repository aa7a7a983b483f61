// =============================================================================
// Component Aggregator: Coverage-aware weighted confluence scoring
// =============================================================================
//
// Combines independent indicator scores (0..100) into one confluence score.
//
//   coverage    = present required components / required components
//   raw_score   = sum(score_i * w_i) / sum(w_i)          (present only)
//   reliability = (1 - weighted_stddev / 25) * coverage   (clipped to 0..1)
//
// Below 50% coverage no score is produced at all: the aggregate carries the
// InsufficientData status, a neutral score and zero reliability.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AnalysisError;

/// Minimum fraction of required components needed to emit a score.
pub const MIN_COVERAGE: f64 = 0.5;

/// Weighted stddev at which agreement (and so base reliability) reaches zero.
const DISPERSION_SCALE: f64 = 25.0;

/// Outcome of one upstream indicator computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ComponentReading {
    Present { score: f64, weight: f64 },
    Missing { reason: String },
}

/// A named indicator score as handed to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub name: String,
    #[serde(flatten)]
    pub reading: ComponentReading,
}

impl ComponentScore {
    pub fn present(name: impl Into<String>, score: f64, weight: f64) -> Self {
        Self {
            name: name.into(),
            reading: ComponentReading::Present { score, weight },
        }
    }

    pub fn missing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reading: ComponentReading::Missing {
                reason: reason.into(),
            },
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self.reading, ComponentReading::Present { .. })
    }

    pub fn score(&self) -> Option<f64> {
        match self.reading {
            ComponentReading::Present { score, .. } => Some(score),
            ComponentReading::Missing { .. } => None,
        }
    }

    pub fn weight(&self) -> Option<f64> {
        match self.reading {
            ComponentReading::Present { weight, .. } => Some(weight),
            ComponentReading::Missing { .. } => None,
        }
    }

    /// Check a present reading for usability. Finite scores outside 0..100
    /// are clamped; NaN/infinite scores and unusable weights are rejected.
    fn validated(self) -> Result<Self, AnalysisError> {
        let (score, weight) = match self.reading {
            ComponentReading::Present { score, weight } => (score, weight),
            ComponentReading::Missing { .. } => return Ok(self),
        };

        if !score.is_finite() {
            return Err(AnalysisError::ValidationInput {
                component: self.name,
                reason: format!("score is not finite ({score})"),
            });
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(AnalysisError::ValidationInput {
                component: self.name,
                reason: format!("weight must be finite and >= 0 ({weight})"),
            });
        }

        Ok(Self {
            name: self.name,
            reading: ComponentReading::Present {
                score: score.clamp(0.0, 100.0),
                weight,
            },
        })
    }
}

/// Whether the aggregate carries a real score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Ok,
    InsufficientData,
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub status: AggregateStatus,
    pub score: f64,
    pub reliability: f64,
    pub coverage: f64,
    pub components: BTreeMap<String, ComponentScore>,
}

impl Aggregate {
    fn insufficient(coverage: f64, components: BTreeMap<String, ComponentScore>) -> Self {
        Self {
            status: AggregateStatus::InsufficientData,
            score: 50.0,
            reliability: 0.0,
            coverage: if coverage.is_finite() {
                coverage.clamp(0.0, 1.0)
            } else {
                0.0
            },
            components,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        self.status == AggregateStatus::Ok
    }
}

/// Weighted, coverage-aware combiner for component scores.
#[derive(Debug, Clone, Default)]
pub struct ComponentAggregator {
    /// Configured weights; the keys are the required component set.
    weights: HashMap<String, f64>,
}

impl ComponentAggregator {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &HashMap<String, f64> {
        &self.weights
    }

    /// Aggregate one symbol's component scores. Never fails: every error
    /// path resolves to the insufficient-data sentinel.
    pub fn aggregate(&self, components: Vec<ComponentScore>) -> Aggregate {
        let components = self.normalise(components);

        match Self::score(&components) {
            Ok((score, reliability, coverage)) => {
                debug!(
                    score = format!("{:.2}", score),
                    reliability = format!("{:.3}", reliability),
                    coverage = format!("{:.2}", coverage),
                    "confluence aggregate computed"
                );
                Aggregate {
                    status: AggregateStatus::Ok,
                    score,
                    reliability,
                    coverage,
                    components,
                }
            }
            Err(AnalysisError::InsufficientData { coverage }) => {
                debug!(
                    coverage = format!("{:.2}", coverage),
                    "insufficient component coverage, no score emitted"
                );
                Aggregate::insufficient(coverage, components)
            }
            Err(e) => {
                warn!(error = %e, "aggregation failed, returning sentinel");
                Aggregate::insufficient(0.0, components)
            }
        }
    }

    /// Restrict to the required set, apply configured weights, demote
    /// invalid readings to missing, and fill in unreported components.
    fn normalise(&self, components: Vec<ComponentScore>) -> BTreeMap<String, ComponentScore> {
        let use_configured = !self.weights.is_empty();
        let mut out = BTreeMap::new();

        for component in components {
            let configured = self.weights.get(&component.name).copied();
            if use_configured && configured.is_none() {
                debug!(component = %component.name, "component not in configured set, ignored");
                continue;
            }

            let component = match (component.reading, configured) {
                (ComponentReading::Present { score, .. }, Some(weight)) => {
                    ComponentScore::present(component.name, score, weight)
                }
                (reading, _) => ComponentScore {
                    name: component.name,
                    reading,
                },
            };

            let name = component.name.clone();
            let component = component.validated().unwrap_or_else(|e| {
                debug!(error = %e, "component reading rejected, treated as missing");
                ComponentScore::missing(name.clone(), e.to_string())
            });
            out.insert(name, component);
        }

        for name in self.weights.keys() {
            out.entry(name.clone())
                .or_insert_with(|| ComponentScore::missing(name.clone(), "not reported"));
        }

        out
    }

    /// `(score, reliability, coverage)` over normalised components.
    fn score(components: &BTreeMap<String, ComponentScore>) -> Result<(f64, f64, f64), AnalysisError> {
        let required = components.len();
        let present: Vec<(f64, f64)> = components
            .values()
            .filter_map(|c| match c.reading {
                ComponentReading::Present { score, weight } => Some((score, weight)),
                ComponentReading::Missing { .. } => None,
            })
            .collect();

        let coverage = if required == 0 {
            0.0
        } else {
            present.len() as f64 / required as f64
        };
        if coverage < MIN_COVERAGE {
            return Err(AnalysisError::InsufficientData { coverage });
        }

        let weight_total: f64 = present.iter().map(|(_, w)| w).sum();
        if weight_total <= f64::EPSILON {
            return Err(AnalysisError::InsufficientData { coverage: 0.0 });
        }

        let weighted_sum: f64 = present.iter().map(|(s, w)| s * w).sum();
        let raw_score = weighted_sum / weight_total;

        let variance = present
            .iter()
            .map(|(s, w)| w * (s - raw_score).powi(2))
            .sum::<f64>()
            / weight_total;
        let base_reliability = (1.0 - variance.sqrt() / DISPERSION_SCALE).clamp(0.0, 1.0);

        let confidence_multiplier = coverage.min(1.0);
        let reliability = (base_reliability * confidence_multiplier).clamp(0.0, 1.0);

        if !raw_score.is_finite() || !reliability.is_finite() {
            return Err(AnalysisError::InsufficientData { coverage: 0.0 });
        }

        Ok((raw_score.clamp(0.0, 100.0), reliability, coverage))
    }
}
