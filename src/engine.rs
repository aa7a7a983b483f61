// =============================================================================
// Confluence Engine: per-symbol analysis cycle behind the single-flight cache
// =============================================================================
//
// One cycle for one symbol:
//
//   snapshot ──► confluence:<SYMBOL>  (context validation → aggregation →
//            │                         classification)
//            └─► whale:<SYMBOL>       (ingest new events → rule evaluation)
//
// Both results go through the shared `SingleFlightCache`, so any number of
// concurrent readers trigger at most one computation per key per TTL.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyAlert, AnomalyDetector, EventKind, MarketEvent};
use crate::cache::{CacheResponse, CacheStats, SingleFlightCache};
use crate::config::{CacheSettings, EngineConfig};
use crate::signals::{ConfluenceResult, ConfluenceScorer};
use crate::source::{MarketSnapshot, SnapshotSource};
use crate::types::Side;

pub fn confluence_key(symbol: &str) -> String {
    format!("confluence:{symbol}")
}

pub fn whale_key(symbol: &str) -> String {
    format!("whale:{symbol}")
}

/// Value stored under either key family.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AnalysisOutput {
    Confluence(ConfluenceResult),
    Anomalies(Vec<AnomalyAlert>),
}

impl AnalysisOutput {
    pub fn as_confluence(&self) -> Option<&ConfluenceResult> {
        match self {
            Self::Confluence(r) => Some(r),
            Self::Anomalies(_) => None,
        }
    }

    pub fn as_alerts(&self) -> Option<&[AnomalyAlert]> {
        match self {
            Self::Anomalies(a) => Some(a),
            Self::Confluence(_) => None,
        }
    }
}

/// Outcome of one `run_cycle`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub symbol: String,
    pub confluence: CacheResponse<AnalysisOutput>,
    pub anomalies: CacheResponse<AnalysisOutput>,
}

impl CycleReport {
    pub fn confluence_result(&self) -> Option<&ConfluenceResult> {
        self.confluence.value().and_then(|v| v.as_confluence())
    }

    /// Alerts of this cycle; empty while computing or after a failure.
    pub fn alerts(&self) -> &[AnomalyAlert] {
        self.anomalies
            .value()
            .and_then(|v| v.as_alerts())
            .unwrap_or(&[])
    }
}

/// Identity of an ingested event. Feeds repeat events across snapshots, so
/// this is what decides whether an event has been seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EventKey {
    timestamp: DateTime<Utc>,
    kind: EventKind,
    side: Side,
    size: u64,
    price: u64,
}

impl EventKey {
    fn of(event: &MarketEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            kind: event.kind,
            side: event.side,
            size: event.size.to_bits(),
            price: event.price.to_bits(),
        }
    }
}

pub struct ConfluenceEngine {
    scorer: ConfluenceScorer,
    detector: Arc<AnomalyDetector>,
    cache: SingleFlightCache<AnalysisOutput>,
    confluence_ttl: Duration,
    whale_ttl: Duration,
    /// Events already recorded per symbol, kept for one window span.
    seen: Mutex<HashMap<String, HashSet<EventKey>>>,
}

impl ConfluenceEngine {
    pub fn new(
        scorer: ConfluenceScorer,
        detector: Arc<AnomalyDetector>,
        cache: SingleFlightCache<AnalysisOutput>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            scorer,
            detector,
            cache,
            confluence_ttl: settings.confluence_ttl(),
            whale_ttl: settings.whale_ttl(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let scorer = ConfluenceScorer::from_weights(
            config.component_weights.clone(),
            config.buy_threshold,
            config.sell_threshold,
            config.min_reliability,
        );
        let detector = AnomalyDetector::new(config.anomaly.clone(), config.anomaly_window_minutes)
            .with_overrides(config.anomaly_overrides.clone());
        let cache = SingleFlightCache::new(config.cache.compute_timeout());

        Self::new(scorer, Arc::new(detector), cache, &config.cache)
    }

    pub fn cache(&self) -> &SingleFlightCache<AnalysisOutput> {
        &self.cache
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Confluence verdict for the snapshot's symbol, cached under
    /// `confluence:<SYMBOL>`.
    pub async fn confluence(&self, snapshot: &MarketSnapshot) -> CacheResponse<AnalysisOutput> {
        let key = confluence_key(&snapshot.symbol);
        let scorer = self.scorer.clone();
        let symbol = snapshot.symbol.clone();
        let timestamp = snapshot.timestamp;
        let components = snapshot.component_scores();
        let context = snapshot.context.clone();

        self.cache
            .get_or_compute(&key, self.confluence_ttl, move || async move {
                let result = scorer.score(&symbol, timestamp, components, &context);
                Ok(AnalysisOutput::Confluence(result))
            })
            .await
    }

    /// Whale / liquidation alerts for the snapshot's symbol, cached under
    /// `whale:<SYMBOL>`. New events are recorded even when the evaluation
    /// itself is served from cache.
    pub async fn anomalies(&self, snapshot: &MarketSnapshot) -> CacheResponse<AnalysisOutput> {
        let ingested = self.ingest(snapshot);
        if ingested > 0 {
            debug!(symbol = %snapshot.symbol, ingested, "events recorded");
        }

        let key = whale_key(&snapshot.symbol);
        let detector = Arc::clone(&self.detector);
        let symbol = snapshot.symbol.clone();
        let book = snapshot.order_book.clone();
        let now = snapshot.timestamp;

        self.cache
            .get_or_compute(&key, self.whale_ttl, move || async move {
                Ok(AnalysisOutput::Anomalies(detector.evaluate(&symbol, &book, now)))
            })
            .await
    }

    /// Fetch a snapshot and run both analyses concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error only if the snapshot cannot be obtained; analysis
    /// outcomes are carried in the report.
    pub async fn run_cycle(&self, source: &dyn SnapshotSource, symbol: &str) -> Result<CycleReport> {
        let snapshot = source
            .snapshot(symbol)
            .await
            .with_context(|| format!("no snapshot for {symbol}"))?;

        let (confluence, anomalies) =
            tokio::join!(self.confluence(&snapshot), self.anomalies(&snapshot));

        let report = CycleReport {
            symbol: symbol.to_string(),
            confluence,
            anomalies,
        };

        match report.confluence_result() {
            Some(r) => info!(
                symbol,
                signal = %r.signal,
                strength = %r.strength,
                score = format!("{:.2}", r.aggregate_score),
                reliability = format!("{:.3}", r.reliability),
                coverage = format!("{:.2}", r.coverage),
                "confluence"
            ),
            None => warn!(symbol, status = report.confluence.status(), "confluence not ready"),
        }
        if !report.alerts().is_empty() {
            info!(symbol, alerts = report.alerts().len(), "anomaly alerts active");
        }

        Ok(report)
    }

    /// Record events not seen in an earlier snapshot, so that a snapshot
    /// read twice does not count its events twice. Identical events inside
    /// one snapshot are all recorded. Returns how many were recorded.
    fn ingest(&self, snapshot: &MarketSnapshot) -> usize {
        let mut seen = self.seen.lock();
        let known = seen.entry(snapshot.symbol.clone()).or_default();

        let fresh: Vec<MarketEvent> = snapshot
            .events()
            .filter(|e| e.symbol == snapshot.symbol)
            .filter(|e| !known.contains(&EventKey::of(e)))
            .cloned()
            .collect();
        known.extend(fresh.iter().map(EventKey::of));

        // Keys older than the window are pruned by the detector anyway.
        if let Some(horizon) = snapshot.timestamp.checked_sub_signed(self.detector.span()) {
            known.retain(|k| k.timestamp >= horizon);
        }

        let count = fresh.len();
        self.detector.record_all(fresh);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AlertKind, AnomalyThresholdConfig};
    use crate::types::Signal;
    use async_trait::async_trait;
    use futures_util::future::join_all;

    const SYMBOL: &str = "BTCUSDT";
    const COMPONENTS: [&str; 6] = [
        "momentum",
        "volume",
        "orderflow",
        "orderbook",
        "sentiment",
        "price_structure",
    ];

    fn config() -> EngineConfig {
        EngineConfig {
            anomaly: AnomalyThresholdConfig {
                usd_threshold: 10_000.0,
                imbalance_threshold: 0.5,
                min_event_count: 3,
                cooldown_secs: 60,
            },
            ..EngineConfig::default()
        }
    }

    fn bullish_snapshot(now: DateTime<Utc>) -> MarketSnapshot {
        COMPONENTS
            .iter()
            .fold(MarketSnapshot::new(SYMBOL, now), |s, name| {
                s.with_component(*name, Some(80.0))
            })
    }

    /// Three $5k sell liquidations one minute before `now`.
    fn cascade_snapshot(now: DateTime<Utc>) -> MarketSnapshot {
        let mut snap = bullish_snapshot(now);
        snap.liquidations = (0..3)
            .map(|_| {
                MarketEvent::liquidation(
                    SYMBOL,
                    Side::Sell,
                    50.0,
                    100.0,
                    now - chrono::Duration::minutes(1),
                )
            })
            .collect();
        snap
    }

    struct FixedSource(MarketSnapshot);

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn snapshot(&self, _symbol: &str) -> Result<MarketSnapshot> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl SnapshotSource for BrokenSource {
        async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
            anyhow::bail!("collector offline for {symbol}")
        }
    }

    #[tokio::test]
    async fn concurrent_readers_compute_once() {
        let engine = ConfluenceEngine::from_config(&config());
        let snap = bullish_snapshot(Utc::now());

        let responses = join_all((0..20).map(|_| engine.confluence(&snap))).await;

        for r in &responses {
            let result = r.value().and_then(|v| v.as_confluence()).unwrap();
            assert_eq!(result.signal, Signal::Buy);
            assert!((result.aggregate_score - 80.0).abs() < 1e-9);
        }
        let stats = engine.cache_stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.coalesced, 19);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn missing_components_yield_insufficient_data() {
        let engine = ConfluenceEngine::from_config(&config());
        let snap = MarketSnapshot::new(SYMBOL, Utc::now())
            .with_component("momentum", Some(90.0))
            .with_component("volume", None);

        let r = engine.confluence(&snap).await;
        let result = r.value().and_then(|v| v.as_confluence()).unwrap();
        assert_eq!(result.signal, Signal::Neutral);
        assert!((result.aggregate_score - 50.0).abs() < f64::EPSILON);
        assert_eq!(result.reliability, 0.0);
    }

    #[tokio::test]
    async fn liquidation_cascade_is_cached_per_symbol() {
        let engine = ConfluenceEngine::from_config(&config());
        let snap = cascade_snapshot(Utc::now());

        let first = engine.anomalies(&snap).await;
        let alerts = first.value().and_then(|v| v.as_alerts()).unwrap().to_vec();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LiquidationCascade);
        assert_eq!(alerts[0].direction, Side::Sell);

        let second = engine.anomalies(&snap).await;
        let cached = second.value().and_then(|v| v.as_alerts()).unwrap();
        assert_eq!(cached[0].id, alerts[0].id);
        assert_eq!(engine.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn repeated_snapshot_events_are_ingested_once() {
        let engine = ConfluenceEngine::from_config(&config());
        let now = Utc::now();
        let snap = cascade_snapshot(now);

        assert_eq!(engine.ingest(&snap), 3);
        assert_eq!(engine.ingest(&snap), 0);
        assert_eq!(engine.detector().window_len(SYMBOL), 3);

        let mut later = cascade_snapshot(now + chrono::Duration::seconds(5));
        later.liquidations.truncate(1);
        assert_eq!(engine.ingest(&later), 1);
        assert_eq!(engine.detector().window_len(SYMBOL), 4);
    }

    #[tokio::test]
    async fn lagging_liquidation_is_still_ingested() {
        let engine = ConfluenceEngine::from_config(&config());
        let now = Utc::now();

        let mut first = MarketSnapshot::new(SYMBOL, now);
        first.trades = vec![MarketEvent::trade(SYMBOL, Side::Buy, 1.0, 100.0, now)];
        assert_eq!(engine.ingest(&first), 1);

        let mut second = MarketSnapshot::new(SYMBOL, now + chrono::Duration::seconds(1));
        second.trades = first.trades.clone();
        second.liquidations = vec![MarketEvent::liquidation(
            SYMBOL,
            Side::Sell,
            5.0,
            100.0,
            now - chrono::Duration::seconds(2),
        )];
        assert_eq!(engine.ingest(&second), 1);
        assert_eq!(engine.detector().window_len(SYMBOL), 2);
    }

    #[tokio::test]
    async fn distinct_events_sharing_a_timestamp_are_kept() {
        let engine = ConfluenceEngine::from_config(&config());
        let now = Utc::now();

        let mut first = MarketSnapshot::new(SYMBOL, now);
        first.trades = vec![MarketEvent::trade(SYMBOL, Side::Buy, 1.0, 100.0, now)];
        engine.ingest(&first);

        let mut second = MarketSnapshot::new(SYMBOL, now);
        second.trades = vec![
            MarketEvent::trade(SYMBOL, Side::Buy, 1.0, 100.0, now),
            MarketEvent::trade(SYMBOL, Side::Sell, 2.0, 100.0, now),
        ];
        assert_eq!(engine.ingest(&second), 1);
        assert_eq!(engine.detector().window_len(SYMBOL), 2);
    }

    #[test]
    fn oversized_anomaly_window_still_builds() {
        let cfg = EngineConfig {
            anomaly_window_minutes: i64::MAX,
            ..config()
        };
        let engine = ConfluenceEngine::from_config(&cfg);
        assert_eq!(engine.detector().span(), chrono::Duration::MAX);
    }

    #[tokio::test]
    async fn run_cycle_reports_both_analyses() {
        let engine = ConfluenceEngine::from_config(&config());
        let source = FixedSource(cascade_snapshot(Utc::now()));

        let report = engine.run_cycle(&source, SYMBOL).await.unwrap();
        assert_eq!(report.symbol, SYMBOL);
        assert!(report.confluence_result().unwrap().is_actionable());
        assert_eq!(report.alerts().len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["confluence"]["status"], "ready");
        assert_eq!(json["anomalies"]["data"][0]["kind"], "liquidation_cascade");
    }

    #[tokio::test]
    async fn run_cycle_propagates_source_errors() {
        let engine = ConfluenceEngine::from_config(&config());
        let err = engine.run_cycle(&BrokenSource, SYMBOL).await.unwrap_err();
        assert!(format!("{err:#}").contains("collector offline"));
        assert_eq!(engine.cache_stats().misses, 0);
    }

    #[test]
    fn cache_keys() {
        assert_eq!(confluence_key("ETHUSDT"), "confluence:ETHUSDT");
        assert_eq!(whale_key("ETHUSDT"), "whale:ETHUSDT");
    }
}
