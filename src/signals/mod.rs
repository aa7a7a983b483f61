// =============================================================================
// Signals Module
// =============================================================================
//
// Confluence scoring pipeline:
// - Market-context validation of raw component scores
// - Coverage-aware weighted aggregation
// - BUY / SELL / NEUTRAL classification with strength bands

pub mod aggregator;
pub mod classifier;
pub mod confluence;
pub mod context;

pub use aggregator::{
    Aggregate, AggregateStatus, ComponentAggregator, ComponentReading, ComponentScore,
};
pub use classifier::{Classification, SignalClassifier};
pub use confluence::{ConfluenceResult, ConfluenceScorer};
pub use context::{ContextValidator, MarketContext};
