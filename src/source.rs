// =============================================================================
// Snapshot Source: where per-symbol market snapshots come from
// =============================================================================
//
// The engine never talks to an exchange.  Everything it analyses arrives as
// a `MarketSnapshot` from a `SnapshotSource`.  `FileSnapshotSource` reads
// `<dir>/<SYMBOL>.json`, which is how the binary is fed by an external
// collector.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anomaly::{MarketEvent, OrderBookSnapshot};
use crate::signals::{ComponentScore, MarketContext};

/// A raw component reading as delivered by the collector.
/// `score: null` (or absent) means the component could not be computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawComponent {
    pub name: String,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Everything known about one symbol at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    #[serde(default)]
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub components: Vec<RawComponent>,
    #[serde(default)]
    pub context: MarketContext,
    #[serde(default)]
    pub order_book: OrderBookSnapshot,
    #[serde(default)]
    pub trades: Vec<MarketEvent>,
    #[serde(default)]
    pub liquidations: Vec<MarketEvent>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            components: Vec::new(),
            context: MarketContext::default(),
            order_book: OrderBookSnapshot::default(),
            trades: Vec::new(),
            liquidations: Vec::new(),
        }
    }

    /// Builder-style helper used by collectors and tests.
    pub fn with_component(mut self, name: impl Into<String>, score: Option<f64>) -> Self {
        self.components.push(RawComponent {
            name: name.into(),
            score,
        });
        self
    }

    /// Component readings in aggregator form. Weights are assigned by the
    /// aggregator's configuration, so every present reading carries 1.0 here.
    pub fn component_scores(&self) -> Vec<ComponentScore> {
        self.components
            .iter()
            .map(|c| match c.score {
                Some(score) => ComponentScore::present(c.name.clone(), score, 1.0),
                None => ComponentScore::missing(c.name.clone(), "not reported"),
            })
            .collect()
    }

    /// Trades followed by liquidations.
    pub fn events(&self) -> impl Iterator<Item = &MarketEvent> {
        self.trades.iter().chain(&self.liquidations)
    }
}

/// Provider of market snapshots, one symbol at a time.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Latest snapshot for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be fetched or decoded.
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot>;
}

/// Reads `<dir>/<SYMBOL>.json` on every call.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    dir: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.json"))
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let path = self.path_for(symbol);

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read snapshot from {}", path.display()))?;

        let mut snapshot: MarketSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot from {}", path.display()))?;

        if snapshot.symbol.is_empty() {
            snapshot.symbol = symbol.to_string();
        } else if snapshot.symbol != symbol {
            bail!(
                "snapshot {} belongs to {}, expected {}",
                path.display(),
                snapshot.symbol,
                symbol
            );
        }

        debug!(
            symbol,
            components = snapshot.components.len(),
            trades = snapshot.trades.len(),
            liquidations = snapshot.liquidations.len(),
            "snapshot loaded"
        );

        Ok(snapshot)
    }
}
