// =============================================================================
// Drift Monitor Loop — periodic re-sampling of completed analyses
// =============================================================================
//
// Runs as a background Tokio task, waking every tick to:
//   1. Enumerate analyses completed within the active window.
//   2. Re-sample market state per (analysis, symbol) and score the drift
//      against the state captured at analysis time.
//   3. Persist the snapshot (latest per symbol + append-only history).
//   4. Raise graded alerts for every dimension over its threshold and for a
//      composite at MEDIUM or above, deduplicated within the tick.
//   5. Publish each alert on the progress bus under the originating
//      analysis id.
//
// A per-symbol fetch failure is logged and skipped; it never stops the
// tick. A tick overrun simply delays the next tick.
//
// The monitor is designed to be spawned once at engine startup:
//
//   tokio::spawn(monitor.run());
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::drift::{
    grade_composite, DriftAlert, DriftKind, DriftSnapshot, COMPOSITE_MEDIUM,
    PRICE_DRIFT_THRESHOLD, SENTIMENT_DRIFT_THRESHOLD, VOLATILITY_DRIFT_THRESHOLD,
    VOLUME_DRIFT_THRESHOLD,
};
use crate::indicators::coefficient_of_variation;
use crate::market::MarketFetcher;
use crate::progress::{ProgressBus, ProgressEvent, ProgressEventKind};
use crate::runtime_config::RuntimeConfig;
use crate::store::{AnalysisRecord, ResultStore};
use crate::types::Severity;

/// Trading days in the volatility comparison window.
const VOLATILITY_WINDOW: usize = 5;

/// Daily-volatility baseline assumed when the analysis recorded none.
const VOLATILITY_BASELINE: f64 = 0.02;

/// Guard divisor for relative sentiment drift.
const SENTIMENT_EPSILON: f64 = 0.1;

/// A price move past this grades the price alert HIGH instead of MEDIUM.
const PRICE_HIGH_THRESHOLD: f64 = 0.10;

pub struct DriftMonitor {
    store: Arc<ResultStore>,
    bus: Arc<ProgressBus>,
    fetcher: Arc<dyn MarketFetcher>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl DriftMonitor {
    pub fn new(
        store: Arc<ResultStore>,
        bus: Arc<ProgressBus>,
        fetcher: Arc<dyn MarketFetcher>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            store,
            bus,
            fetcher,
            config,
        }
    }

    /// Run the monitor loop forever. Spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        let tick_seconds = self.config.read().drift_tick_seconds.max(1);
        info!(tick_seconds, "drift monitor started");

        let mut ticker = interval(Duration::from_secs(tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One full monitoring pass. Public so tests can drive it directly.
    pub async fn tick(&self) {
        let (window_hours, retention_days) = {
            let config = self.config.read();
            (config.drift_active_window_hours, config.drift_retention_days)
        };

        let active = self
            .store
            .completed_within(ChronoDuration::hours(window_hours));
        if active.is_empty() {
            debug!("drift tick: no active analyses");
        }

        // Alert dedup key: (analysis, symbol, kind, severity) per tick.
        let mut raised: HashSet<(String, String, DriftKind, Severity)> = HashSet::new();

        for record in &active {
            for symbol in &record.symbols {
                match self.sample(record, symbol).await {
                    Some(snapshot) => {
                        self.store.record_drift(&record.id, snapshot.clone());
                        self.raise_alerts(record, &snapshot, &mut raised);
                    }
                    None => {
                        debug!(analysis_id = %record.id, symbol = %symbol, "drift sample skipped");
                    }
                }
            }
        }

        let compacted = self
            .store
            .compact_drift_history(Utc::now() - ChronoDuration::days(retention_days));
        if compacted > 0 {
            debug!(compacted, "drift history compacted");
        }

        // Streams of terminal analyses that fell out of the active window
        // will never see another event; release their channels.
        let active_ids: HashSet<&str> = active.iter().map(|r| r.id.as_str()).collect();
        for channel_id in self.bus.channel_ids() {
            let terminal = self
                .store
                .get(&channel_id)
                .map(|record| record.status.is_terminal())
                .unwrap_or(false);
            if terminal && !active_ids.contains(channel_id.as_str()) {
                self.bus.retire(&channel_id);
            }
        }
    }

    // ── Sampling ────────────────────────────────────────────────────────

    /// Build one drift snapshot, or `None` when sampling was impossible.
    async fn sample(&self, record: &AnalysisRecord, symbol: &str) -> Option<DriftSnapshot> {
        let artifact = record
            .symbol_artifacts
            .get(symbol)
            .or(record.final_artifact.as_ref())?;
        let original_price = artifact.entry_price.value;
        if original_price <= 0.0 {
            return None;
        }

        let quote = match self.fetcher.quote(symbol).await {
            Ok(quote) => quote,
            Err(err) => {
                warn!(symbol, error = %err, "drift quote fetch failed — skipping symbol");
                return None;
            }
        };

        let price_drift = (quote.price - original_price).abs() / original_price;

        let volume_drift = match quote.avg_volume.filter(|avg| *avg > 0.0) {
            Some(avg) => (quote.volume - avg).abs() / avg,
            None => 0.0,
        };

        let volatility_drift = self
            .volatility_drift(record, symbol)
            .await
            .unwrap_or(0.0);

        let sentiment_drift = self.sentiment_drift(record, symbol).await;

        Some(DriftSnapshot::from_dimensions(
            symbol,
            price_drift,
            volume_drift,
            volatility_drift,
            sentiment_drift,
        ))
    }

    /// Current 5-day close volatility versus the level captured by the risk
    /// agent at analysis time (daily baseline assumed when absent).
    async fn volatility_drift(&self, record: &AnalysisRecord, symbol: &str) -> Option<f64> {
        let candles = match self.fetcher.history(symbol, "5d", "1d").await {
            Ok(candles) => candles,
            Err(err) => {
                warn!(symbol, error = %err, "drift history fetch failed");
                return None;
            }
        };
        let closes: Vec<f64> = candles
            .iter()
            .rev()
            .take(VOLATILITY_WINDOW)
            .rev()
            .map(|c| c.close)
            .collect();
        let current = coefficient_of_variation(&closes)?;

        let original = record
            .agent_executions
            .iter()
            .filter(|exec| exec.symbol == symbol)
            .filter_map(|exec| exec.output.as_ref())
            .find(|opinion| opinion.agent_id == "risk")
            .and_then(|opinion| opinion.metric("annual_volatility"))
            .map(|annual| annual / (252.0_f64).sqrt())
            .filter(|vol| *vol > 0.0)
            .unwrap_or(VOLATILITY_BASELINE);

        Some((current - original).abs() / original)
    }

    /// Relative sentiment move against the score recorded at analysis time;
    /// zero when either side has no sentiment source.
    async fn sentiment_drift(&self, record: &AnalysisRecord, symbol: &str) -> f64 {
        let original = record
            .agent_executions
            .iter()
            .filter(|exec| exec.symbol == symbol)
            .filter_map(|exec| exec.output.as_ref())
            .find(|opinion| opinion.agent_id == "sentiment")
            .and_then(|opinion| opinion.metric("sentiment_score"));

        let current = match self.fetcher.sentiment_score(symbol).await {
            Ok(score) => score,
            Err(_) => None,
        };

        match (original, current) {
            (Some(original), Some(current)) => {
                (current - original).abs() / original.abs().max(SENTIMENT_EPSILON)
            }
            _ => 0.0,
        }
    }

    // ── Alerting ────────────────────────────────────────────────────────

    fn raise_alerts(
        &self,
        record: &AnalysisRecord,
        snapshot: &DriftSnapshot,
        raised: &mut HashSet<(String, String, DriftKind, Severity)>,
    ) {
        let mut candidates: Vec<(DriftKind, Severity, String)> = Vec::new();

        if snapshot.price_drift > PRICE_DRIFT_THRESHOLD {
            let severity = if snapshot.price_drift > PRICE_HIGH_THRESHOLD {
                Severity::High
            } else {
                Severity::Medium
            };
            candidates.push((
                DriftKind::Price,
                severity,
                format!(
                    "{} price moved {:.1}% since analysis",
                    snapshot.symbol,
                    snapshot.price_drift * 100.0
                ),
            ));
        }

        if snapshot.volume_drift > VOLUME_DRIFT_THRESHOLD {
            candidates.push((
                DriftKind::Volume,
                Severity::Medium,
                format!(
                    "{} volume {:.0}% away from its average",
                    snapshot.symbol,
                    snapshot.volume_drift * 100.0
                ),
            ));
        }

        if snapshot.volatility_drift > VOLATILITY_DRIFT_THRESHOLD {
            candidates.push((
                DriftKind::Volatility,
                Severity::High,
                format!(
                    "{} volatility shifted {:.0}% against the analysis baseline",
                    snapshot.symbol,
                    snapshot.volatility_drift * 100.0
                ),
            ));
        }

        if snapshot.sentiment_drift > SENTIMENT_DRIFT_THRESHOLD {
            candidates.push((
                DriftKind::Sentiment,
                Severity::Medium,
                format!(
                    "{} sentiment moved {:.0}% since analysis",
                    snapshot.symbol,
                    snapshot.sentiment_drift * 100.0
                ),
            ));
        }

        if snapshot.composite_score > COMPOSITE_MEDIUM {
            candidates.push((
                DriftKind::Composite,
                grade_composite(snapshot.composite_score),
                format!(
                    "{} composite drift {:.0}% — analysis may be stale",
                    snapshot.symbol,
                    snapshot.composite_score * 100.0
                ),
            ));
        }

        for (kind, severity, message) in candidates {
            let key = (
                record.id.clone(),
                snapshot.symbol.clone(),
                kind,
                severity,
            );
            if !raised.insert(key) {
                continue;
            }

            let alert = DriftAlert {
                alert_id: uuid::Uuid::new_v4().to_string(),
                analysis_id: record.id.clone(),
                symbol: snapshot.symbol.clone(),
                kind,
                severity,
                message,
                snapshot: snapshot.clone(),
                triggered_at: Utc::now(),
            };

            info!(
                analysis_id = %alert.analysis_id,
                symbol = %alert.symbol,
                kind = %alert.kind,
                severity = %alert.severity,
                "drift alert raised"
            );

            self.store.record_alert(alert.clone());
            self.bus.publish(ProgressEvent::new(
                record.id.clone(),
                ProgressEventKind::DriftAlert { alert },
            ));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusResult;
    use crate::market::mock::MockFetcher;
    use crate::market::Candle;
    use crate::runtime_config::PositionRiskFractions;
    use crate::store::AnalysisRequest;
    use crate::synthesis::{FinalArtifact, SynthesisInputs, SynthesisStage};
    use std::collections::HashMap;

    fn artifact_with_entry(symbol: &str, entry: f64) -> FinalArtifact {
        let consensus = ConsensusResult::insufficient_data();
        SynthesisStage::new(2.0, 100_000.0, PositionRiskFractions::default())
            .synthesize(
                symbol,
                &SynthesisInputs {
                    consensus: &consensus,
                    risk_opinion: None,
                    technical_opinion: None,
                    fundamental_opinion: None,
                    entry_price: entry,
                    context_degraded: false,
                },
            )
            .unwrap()
    }

    fn flat_candles(price: f64) -> Vec<Candle> {
        (0..10)
            .map(|i| Candle::new(i, price, price, price, price, 1_000_000.0))
            .collect()
    }

    struct Rig {
        monitor: DriftMonitor,
        store: Arc<ResultStore>,
        bus: Arc<ProgressBus>,
        fetcher: Arc<MockFetcher>,
        analysis_id: String,
    }

    /// A completed analysis with entry 100 plus a scripted market.
    fn rig(symbol: &str, entry: f64) -> Rig {
        let store = Arc::new(ResultStore::new());
        let bus = Arc::new(ProgressBus::new(256));
        let fetcher = Arc::new(MockFetcher::new());

        let request = AnalysisRequest::new("drift case", vec![symbol.to_string()]);
        store.create(&request);
        let artifact = artifact_with_entry(symbol, entry);
        let mut by_symbol = HashMap::new();
        by_symbol.insert(symbol.to_string(), artifact.clone());
        store.complete(&request.id, artifact, by_symbol);

        let fetcher_dyn: Arc<dyn MarketFetcher> = fetcher.clone();
        let monitor = DriftMonitor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            fetcher_dyn,
            Arc::new(RwLock::new(RuntimeConfig::default())),
        );

        Rig {
            monitor,
            store,
            bus,
            fetcher,
            analysis_id: request.id,
        }
    }

    #[tokio::test]
    async fn price_move_raises_persisted_and_published_alert() {
        let r = rig("AAPL", 100.0);
        // 8% move; flat history keeps the other dimensions quiet enough.
        r.fetcher.set_quote("AAPL", 108.0, 1_000_000.0);
        r.fetcher.set_candles("AAPL", flat_candles(108.0));
        let mut rx = r.bus.subscribe(&r.analysis_id);

        r.monitor.tick().await;

        let alerts = r.store.alerts_for(&r.analysis_id);
        let price_alert = alerts
            .iter()
            .find(|alert| alert.kind == DriftKind::Price)
            .expect("price alert persisted");
        assert!(matches!(
            price_alert.severity,
            Severity::Medium | Severity::High
        ));
        assert!((price_alert.snapshot.price_drift - 0.08).abs() < 1e-9);

        // Published on the originating analysis channel.
        let mut saw_price_alert = false;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEventKind::DriftAlert { alert } = event.kind {
                if alert.kind == DriftKind::Price {
                    saw_price_alert = true;
                }
            }
        }
        assert!(saw_price_alert);

        // Latest snapshot lands on the record.
        let record = r.store.get(&r.analysis_id).unwrap();
        assert!(record.drift_status.contains_key("AAPL"));
    }

    #[tokio::test]
    async fn large_price_move_grades_high() {
        let r = rig("AAPL", 100.0);
        r.fetcher.set_quote("AAPL", 115.0, 1_000_000.0);
        r.fetcher.set_candles("AAPL", flat_candles(115.0));

        r.monitor.tick().await;

        let alerts = r.store.alerts_for(&r.analysis_id);
        let price_alert = alerts
            .iter()
            .find(|alert| alert.kind == DriftKind::Price)
            .unwrap();
        assert_eq!(price_alert.severity, Severity::High);
    }

    #[tokio::test]
    async fn quiet_market_raises_no_price_or_volume_alert() {
        let r = rig("AAPL", 100.0);
        r.fetcher.set_quote("AAPL", 100.5, 1_000_000.0);
        r.fetcher.set_candles("AAPL", flat_candles(100.5));

        r.monitor.tick().await;

        let alerts = r.store.alerts_for(&r.analysis_id);
        assert!(alerts.iter().all(|a| a.kind != DriftKind::Price));
        assert!(alerts.iter().all(|a| a.kind != DriftKind::Volume));
    }

    #[tokio::test]
    async fn volume_spike_raises_volume_alert() {
        let r = rig("AAPL", 100.0);
        r.fetcher
            .set_quote_with_avg("AAPL", 100.0, 2_000_000.0, 1_000_000.0);
        r.fetcher.set_candles("AAPL", flat_candles(100.0));

        r.monitor.tick().await;

        let alerts = r.store.alerts_for(&r.analysis_id);
        let volume_alert = alerts
            .iter()
            .find(|alert| alert.kind == DriftKind::Volume)
            .expect("volume alert");
        assert_eq!(volume_alert.severity, Severity::Medium);
        assert!((volume_alert.snapshot.volume_drift - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fetch_failure_skips_symbol_without_stopping_tick() {
        let r = rig("AAPL", 100.0);
        r.fetcher.fail_quote_with(
            "AAPL",
            crate::market::FetchError::Transient("provider down".into()),
        );

        // Must not panic, must not persist anything.
        r.monitor.tick().await;
        assert!(r.store.alerts_for(&r.analysis_id).is_empty());
        let record = r.store.get(&r.analysis_id).unwrap();
        assert!(record.drift_status.is_empty());
    }

    #[tokio::test]
    async fn duplicate_symbols_dedup_alerts_within_a_tick() {
        let store = Arc::new(ResultStore::new());
        let bus = Arc::new(ProgressBus::new(256));
        let fetcher = Arc::new(MockFetcher::new());

        // The same symbol listed twice on one analysis.
        let request =
            AnalysisRequest::new("dup case", vec!["AAPL".to_string(), "AAPL".to_string()]);
        store.create(&request);
        let artifact = artifact_with_entry("AAPL", 100.0);
        let mut by_symbol = HashMap::new();
        by_symbol.insert("AAPL".to_string(), artifact.clone());
        store.complete(&request.id, artifact, by_symbol);

        fetcher.set_quote("AAPL", 108.0, 1_000_000.0);
        fetcher.set_candles("AAPL", flat_candles(108.0));

        let fetcher_dyn: Arc<dyn MarketFetcher> = fetcher;
        let monitor = DriftMonitor::new(
            Arc::clone(&store),
            bus,
            fetcher_dyn,
            Arc::new(RwLock::new(RuntimeConfig::default())),
        );
        monitor.tick().await;

        let price_alerts: Vec<_> = store
            .alerts_for(&request.id)
            .into_iter()
            .filter(|alert| alert.kind == DriftKind::Price)
            .collect();
        assert_eq!(price_alerts.len(), 1, "same tick must dedup identical alerts");
    }

    #[tokio::test]
    async fn analyses_outside_window_are_ignored() {
        let r = rig("AAPL", 100.0);
        r.fetcher.set_quote("AAPL", 150.0, 1_000_000.0);
        r.fetcher.set_candles("AAPL", flat_candles(150.0));
        // Shrink the active window to zero.
        r.monitor.config.write().drift_active_window_hours = 0;

        r.monitor.tick().await;
        assert!(r.store.alerts_for(&r.analysis_id).is_empty());
    }
}
