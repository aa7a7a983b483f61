// =============================================================================
// Confluence Engine
// =============================================================================
//
// Multi-component signal confluence scoring, whale / liquidation anomaly
// detection and a single-flight result cache shared by every reader.
// =============================================================================

pub mod anomaly;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod signals;
pub mod source;
pub mod types;

pub use cache::{CacheResponse, CacheStats, SingleFlightCache};
pub use config::EngineConfig;
pub use engine::{AnalysisOutput, ConfluenceEngine, CycleReport};
pub use error::AnalysisError;
pub use source::{FileSnapshotSource, MarketSnapshot, SnapshotSource};
