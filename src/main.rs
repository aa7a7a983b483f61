// =============================================================================
// Confluence Engine: Main Entry Point
// =============================================================================
//
// Reads per-symbol snapshots from the snapshot directory every cycle, scores
// confluence, evaluates whale / liquidation rules and keeps the results in
// the shared single-flight cache.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use confluence_engine::{ConfluenceEngine, EngineConfig, FileSnapshotSource, SnapshotSource};

const CONFIG_PATH: &str = "confluence_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Confluence Engine starting up");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        snapshot_dir = %config.snapshot_dir,
        interval_secs = config.analysis_interval_secs,
        "Configured symbols"
    );

    // ── 2. Build engine & cache ──────────────────────────────────────────
    let engine = Arc::new(ConfluenceEngine::from_config(&config));
    let source: Arc<dyn SnapshotSource> =
        Arc::new(FileSnapshotSource::new(config.snapshot_dir.clone()));

    let cleanup = engine
        .cache()
        .spawn_cleanup(config.cache.cleanup_interval());

    // ── 3. Analysis loop ─────────────────────────────────────────────────
    let loop_engine = engine.clone();
    let symbols = config.symbols.clone();
    let every = Duration::from_secs(config.analysis_interval_secs.max(1));
    let analysis = tokio::spawn(async move {
        info!("Analysis loop starting");
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;

            let mut cycle = Vec::with_capacity(symbols.len());
            for symbol in &symbols {
                let engine = loop_engine.clone();
                let source = source.clone();
                let symbol = symbol.clone();
                cycle.push(tokio::spawn(async move {
                    if let Err(e) = engine.run_cycle(source.as_ref(), &symbol).await {
                        warn!(symbol = %symbol, error = %e, "analysis cycle skipped");
                    }
                }));
            }
            for handle in cycle {
                if let Err(e) = handle.await {
                    error!(error = %e, "analysis task panicked");
                }
            }
        }
    });

    // ── 4. Cache stats ───────────────────────────────────────────────────
    let stats_engine = engine.clone();
    let stats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = stats_engine.cache_stats();
            info!(
                hits = s.hits,
                misses = s.misses,
                coalesced = s.coalesced,
                timeouts = s.timeouts,
                failures = s.failures,
                entries = s.entries,
                hit_rate = format!("{:.3}", s.hit_rate),
                "cache stats"
            );
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");

    analysis.abort();
    stats.abort();
    cleanup.abort();

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("Confluence Engine shut down complete.");
    Ok(())
}
