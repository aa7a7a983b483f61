// =============================================================================
// Analysis error taxonomy
// =============================================================================
//
// None of these cross the cache boundary. Each is recovered where it occurs:
// insufficient data becomes a sentinel result, a timeout becomes the
// "computing" placeholder, a transient failure is logged and not cached, and
// an invalid component reading is demoted to a missing component.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Fewer than half of the required components produced a score.
    #[error("insufficient data: coverage {coverage:.2} below floor")]
    InsufficientData { coverage: f64 },

    /// The computation behind a cache key exceeded its time budget.
    #[error("computation for {key} timed out after {timeout:?}")]
    ComputationTimeout { key: String, timeout: Duration },

    /// The computation behind a cache key failed or panicked.
    #[error("computation for {key} failed: {message}")]
    TransientComputation { key: String, message: String },

    /// A component reading was malformed (NaN score, negative weight, ...).
    #[error("invalid reading for component {component}: {reason}")]
    ValidationInput { component: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_subject() {
        let e = AnalysisError::ValidationInput {
            component: "momentum".into(),
            reason: "score is NaN".into(),
        };
        assert_eq!(
            e.to_string(),
            "invalid reading for component momentum: score is NaN"
        );

        let e = AnalysisError::InsufficientData { coverage: 0.333 };
        assert!(e.to_string().contains("0.33"));
    }
}
