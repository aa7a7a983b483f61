// =============================================================================
// Cache Module
// =============================================================================
//
// Single-flight computation cache shared by every reader of analysis results.

pub mod single_flight;
pub mod stats;

pub use single_flight::{CacheResponse, SingleFlightCache, DEFAULT_COMPUTE_TIMEOUT};
pub use stats::CacheStats;
