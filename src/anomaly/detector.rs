// =============================================================================
// Anomaly Detector: Whale / liquidation threshold engine
// =============================================================================
//
// Whale qualification is statistical:
//
//   whale_threshold = mean(size) + 2 * stddev(size)
//
// computed separately over the current order-book levels and over the
// trades in the rolling window.  Qualifying flow is split by side and valued
// in USD:
//
//   net       = buy_usd - sell_usd
//   imbalance = net / (buy_usd + sell_usd)        (0 when nothing qualified)
//
// An alert needs ALL of |net| >= usd_threshold, count >= min_event_count and
// |imbalance| >= imbalance_threshold.  A fired alert is then silenced for
// `cooldown_secs` per symbol + kind + direction.
//
// Rules, in evaluation order:
//   1. Whale accumulation / distribution over book + trades combined.
//   2. Conflicting signals: whale book pressure one way while whale trades
//      execute the other way, each at half the configured thresholds.
//   3. Liquidation cascade over all liquidations in the window.
// Each rule is independent; more than one may fire in the same evaluation.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::window::EventWindow;
use super::{
    AlertKind, AnomalyAlert, AnomalyThresholdConfig, EventKind, MarketEvent, OrderBookSnapshot,
};
use crate::types::Side;

/// Fraction of the configured thresholds that counts as "moderate".
const MODERATE_FRACTION: f64 = 0.5;

/// `mean + 2 * stddev` (population) over finite, positive sizes.
pub fn whale_threshold<I>(sizes: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let sizes: Vec<f64> = sizes
        .into_iter()
        .filter(|s| s.is_finite() && *s > 0.0)
        .collect();
    if sizes.is_empty() {
        return None;
    }

    let n = sizes.len() as f64;
    let mean = sizes.iter().sum::<f64>() / n;
    let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    Some(mean + 2.0 * variance.sqrt())
}

/// Side-split USD flow of qualifying events.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowSummary {
    pub buy_usd: f64,
    pub sell_usd: f64,
    pub count: usize,
}

impl FlowSummary {
    pub fn add(&mut self, side: Side, usd: f64) {
        match side {
            Side::Buy => self.buy_usd += usd,
            Side::Sell => self.sell_usd += usd,
        }
        self.count += 1;
    }

    pub fn merged(self, other: Self) -> Self {
        Self {
            buy_usd: self.buy_usd + other.buy_usd,
            sell_usd: self.sell_usd + other.sell_usd,
            count: self.count + other.count,
        }
    }

    pub fn net(&self) -> f64 {
        self.buy_usd - self.sell_usd
    }

    pub fn imbalance(&self) -> f64 {
        let total = self.buy_usd + self.sell_usd;
        if total > f64::EPSILON {
            self.net() / total
        } else {
            0.0
        }
    }

    /// All three thresholds, scaled by `fraction`, hold at once.
    fn breaches(&self, cfg: &AnomalyThresholdConfig, fraction: f64) -> bool {
        let min_count = (cfg.min_event_count as f64 * fraction).ceil() as usize;
        self.net().abs() >= cfg.usd_threshold * fraction
            && self.count >= min_count.max(1)
            && self.imbalance().abs() >= cfg.imbalance_threshold * fraction
    }
}

/// Per-symbol rolling-window anomaly engine, shared as `Arc<AnomalyDetector>`.
pub struct AnomalyDetector {
    defaults: AnomalyThresholdConfig,
    overrides: HashMap<String, AnomalyThresholdConfig>,
    span: Duration,
    windows: RwLock<HashMap<String, EventWindow>>,
    last_fired: Mutex<HashMap<(String, AlertKind, Side), DateTime<Utc>>>,
}

impl AnomalyDetector {
    pub fn new(defaults: AnomalyThresholdConfig, window_minutes: i64) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            span: Duration::try_minutes(window_minutes.max(1)).unwrap_or(Duration::MAX),
            windows: RwLock::new(HashMap::new()),
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, AnomalyThresholdConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Length of every per-symbol event window.
    pub fn span(&self) -> Duration {
        self.span
    }

    pub fn thresholds(&self, symbol: &str) -> &AnomalyThresholdConfig {
        self.overrides.get(symbol).unwrap_or(&self.defaults)
    }

    pub fn record(&self, event: MarketEvent) {
        let mut windows = self.windows.write();
        windows
            .entry(event.symbol.clone())
            .or_insert_with(|| EventWindow::new(self.span))
            .push(event);
    }

    pub fn record_all<I>(&self, events: I)
    where
        I: IntoIterator<Item = MarketEvent>,
    {
        for event in events {
            self.record(event);
        }
    }

    pub fn window_len(&self, symbol: &str) -> usize {
        self.windows.read().get(symbol).map_or(0, EventWindow::len)
    }

    /// Run every rule for `symbol` at time `now`. Never fails: missing data
    /// simply yields no alerts.
    pub fn evaluate(
        &self,
        symbol: &str,
        book: &OrderBookSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyAlert> {
        let cfg = self.thresholds(symbol).clone();

        let (trades, liquidations) = {
            let mut windows = self.windows.write();
            match windows.get_mut(symbol) {
                Some(window) => {
                    let dropped = window.prune(now);
                    if dropped > 0 {
                        debug!(symbol, dropped, "stale events pruned");
                    }
                    (
                        window.of_kind(EventKind::Trade).cloned().collect::<Vec<_>>(),
                        window.of_kind(EventKind::Liquidation).cloned().collect::<Vec<_>>(),
                    )
                }
                None => (Vec::new(), Vec::new()),
            }
        };

        let (book_flow, book_cut) = book_whales(book);
        let (trade_flow, trade_cut) = trade_whales(&trades);
        let whale_cut = book_cut.max(trade_cut);

        let mut alerts = Vec::new();

        // ── Rule 1: whale accumulation / distribution ────────────────────
        let combined = book_flow.merged(trade_flow);
        if combined.breaches(&cfg, 1.0) {
            if let Some(direction) = Side::from_net(combined.net()) {
                let kind = match direction {
                    Side::Buy => AlertKind::WhaleAccumulation,
                    Side::Sell => AlertKind::WhaleDistribution,
                };
                let reason = format!(
                    "{} whale events, net ${:.0}, imbalance {:.2} (book {:.2}, trades {:.2})",
                    combined.count,
                    combined.net(),
                    combined.imbalance(),
                    book_flow.imbalance(),
                    trade_flow.imbalance()
                );
                alerts.push(self.alert(symbol, kind, direction, &combined, whale_cut, now, reason));
            }
        }

        // ── Rule 2: conflicting book pressure vs executed flow ───────────
        let book_side = Side::from_net(book_flow.net());
        let trade_side = Side::from_net(trade_flow.net());
        if let (Some(book_side), Some(trade_side)) = (book_side, trade_side) {
            if book_side != trade_side
                && book_flow.breaches(&cfg, MODERATE_FRACTION)
                && trade_flow.breaches(&cfg, MODERATE_FRACTION)
            {
                let reason = format!(
                    "book whales lean {} (imbalance {:.2}) while whale trades execute {} (imbalance {:.2}): possible spoofing",
                    book_side,
                    book_flow.imbalance(),
                    trade_side,
                    trade_flow.imbalance()
                );
                alerts.push(self.alert(
                    symbol,
                    AlertKind::ConflictingSignals,
                    trade_side,
                    &trade_flow,
                    whale_cut,
                    now,
                    reason,
                ));
            }
        }

        // ── Rule 3: liquidation cascade ──────────────────────────────────
        let mut liq_flow = FlowSummary::default();
        for event in &liquidations {
            if let Some(usd) = event.notional() {
                liq_flow.add(event.side, usd);
            }
        }
        if liq_flow.breaches(&cfg, 1.0) {
            if let Some(direction) = Side::from_net(liq_flow.net()) {
                let reason = format!(
                    "{} liquidations in window, net ${:.0} on the {} side",
                    liq_flow.count,
                    liq_flow.net().abs(),
                    direction
                );
                alerts.push(self.alert(
                    symbol,
                    AlertKind::LiquidationCascade,
                    direction,
                    &liq_flow,
                    0.0,
                    now,
                    reason,
                ));
            }
        }

        let alerts: Vec<AnomalyAlert> = alerts.into_iter().flatten().collect();

        debug!(
            symbol,
            book_events = book_flow.count,
            trade_events = trade_flow.count,
            liquidations = liq_flow.count,
            alerts = alerts.len(),
            "anomaly evaluation complete"
        );

        alerts
    }

    /// Build an alert unless the same symbol + kind + direction is cooling
    /// down.
    #[allow(clippy::too_many_arguments)]
    fn alert(
        &self,
        symbol: &str,
        kind: AlertKind,
        direction: Side,
        flow: &FlowSummary,
        whale_threshold: f64,
        now: DateTime<Utc>,
        reason: String,
    ) -> Option<AnomalyAlert> {
        let cooldown = i64::try_from(self.thresholds(symbol).cooldown_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let key = (symbol.to_string(), kind, direction);

        let mut last_fired = self.last_fired.lock();
        if let Some(prev) = last_fired.get(&key) {
            if now - *prev < cooldown {
                debug!(symbol, %kind, %direction, "alert suppressed by cooldown");
                return None;
            }
        }
        last_fired.insert(key, now);
        drop(last_fired);

        info!(
            symbol,
            %kind,
            %direction,
            usd = format!("{:.0}", flow.net().abs()),
            imbalance = format!("{:.2}", flow.imbalance()),
            events = flow.count,
            "anomaly alert"
        );

        Some(AnomalyAlert {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            kind,
            direction,
            usd_value: flow.net().abs(),
            imbalance: flow.imbalance(),
            event_count: flow.count,
            whale_threshold,
            detected_at: now,
            reason,
        })
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyThresholdConfig::default(), 30)
    }
}

/// Whale bids / asks of the snapshot and the size cut-off used.
fn book_whales(book: &OrderBookSnapshot) -> (FlowSummary, f64) {
    let sizes = book.bids.iter().chain(&book.asks).map(|l| l.size);
    let Some(cut) = whale_threshold(sizes) else {
        return (FlowSummary::default(), 0.0);
    };

    let mut flow = FlowSummary::default();
    let sides = book
        .bids
        .iter()
        .map(|l| (Side::Buy, l))
        .chain(book.asks.iter().map(|l| (Side::Sell, l)));
    for (side, level) in sides {
        let usd = level.price * level.size;
        if level.size > cut && usd.is_finite() && usd > 0.0 {
            flow.add(side, usd);
        }
    }
    (flow, cut)
}

/// Whale trades of the window and the size cut-off used.
fn trade_whales(trades: &[MarketEvent]) -> (FlowSummary, f64) {
    let Some(cut) = whale_threshold(trades.iter().map(|t| t.size)) else {
        return (FlowSummary::default(), 0.0);
    };

    let mut flow = FlowSummary::default();
    for trade in trades.iter().filter(|t| t.size > cut) {
        if let Some(usd) = trade.notional() {
            flow.add(trade.side, usd);
        }
    }
    (flow, cut)
}
