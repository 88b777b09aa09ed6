// =============================================================================
// Result Store — analyses, artifacts, drift history, and alerts
// =============================================================================
//
// The durable record of everything the engine produces. One writer path per
// record: the orchestrator owns an analysis until it is terminal; the drift
// monitor only touches `drift_status` and the append-only drift collections,
// so the two never contend over the same fields.
//
// All mutation goes through the store, which serializes updates per record
// behind its locks and enforces the lifecycle invariants:
//   - status only moves forward: pending -> running -> completed | failed
//   - `completed` requires a final artifact; `failed` a non-empty message
//   - progress percentage never decreases
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agents::AgentExecution;
use crate::drift::{DriftAlert, DriftSnapshot};
use crate::synthesis::FinalArtifact;
use crate::types::AnalysisStatus;

// =============================================================================
// Request / record shapes
// =============================================================================

/// Immutable submission that seeds an analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: String,
    pub query: String,
    /// Ordered, non-empty; the first symbol is the primary subject.
    pub symbols: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

impl AnalysisRequest {
    pub fn new(query: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            symbols,
            requested_at: Utc::now(),
        }
    }

    pub fn primary_symbol(&self) -> &str {
        self.symbols.first().map(String::as_str).unwrap_or_default()
    }
}

/// Live progress block inside a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressState {
    pub percentage: u8,
    pub phase: String,
    pub active: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    pub pending: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            percentage: 0,
            phase: "queued".to_string(),
            active: BTreeSet::new(),
            completed: BTreeSet::new(),
            pending: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

/// The full lifecycle record of one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub query: String,
    pub symbols: Vec<String>,
    pub status: AnalysisStatus,
    pub agent_executions: Vec<AgentExecution>,
    pub progress: ProgressState,
    /// Artifact of the primary (first-listed) symbol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<FinalArtifact>,
    /// Artifacts for every analysed symbol.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub symbol_artifacts: HashMap<String, FinalArtifact>,
    /// Latest drift snapshot per symbol.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub drift_status: HashMap<String, DriftSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisRecord {
    fn from_request(request: &AnalysisRequest) -> Self {
        Self {
            id: request.id.clone(),
            query: request.query.clone(),
            symbols: request.symbols.clone(),
            status: AnalysisStatus::Pending,
            agent_executions: Vec::new(),
            progress: ProgressState::default(),
            final_artifact: None,
            symbol_artifacts: HashMap::new(),
            drift_status: HashMap::new(),
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Compact listing row for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub id: String,
    pub query: String,
    pub symbols: Vec<String>,
    pub status: AnalysisStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of append-only drift history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftHistoryEntry {
    pub analysis_id: String,
    pub snapshot: DriftSnapshot,
}

// =============================================================================
// ResultStore
// =============================================================================

#[derive(Default)]
pub struct ResultStore {
    analyses: RwLock<HashMap<String, AnalysisRecord>>,
    /// Denormalized primary artifacts for fast retrieval.
    results: RwLock<HashMap<String, FinalArtifact>>,
    /// Insertion order of analysis ids, oldest first.
    order: RwLock<Vec<String>>,
    drift_history: RwLock<Vec<DriftHistoryEntry>>,
    drift_alerts: RwLock<Vec<DriftAlert>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create the pending record for a submission.
    pub fn create(&self, request: &AnalysisRequest) -> AnalysisRecord {
        let record = AnalysisRecord::from_request(request);
        self.analyses
            .write()
            .insert(record.id.clone(), record.clone());
        self.order.write().push(record.id.clone());
        debug!(analysis_id = %record.id, "analysis record created");
        record
    }

    pub fn get(&self, analysis_id: &str) -> Option<AnalysisRecord> {
        self.analyses.read().get(analysis_id).cloned()
    }

    /// Denormalized primary artifact.
    pub fn result(&self, analysis_id: &str) -> Option<FinalArtifact> {
        self.results.read().get(analysis_id).cloned()
    }

    pub fn mark_running(&self, analysis_id: &str) {
        self.mutate(analysis_id, |record| {
            if record.status == AnalysisStatus::Pending {
                record.status = AnalysisStatus::Running;
            }
        });
    }

    /// Record a terminal agent execution.
    pub fn push_agent_execution(&self, analysis_id: &str, execution: AgentExecution) {
        self.mutate(analysis_id, |record| {
            record.agent_executions.push(execution);
        });
    }

    /// Update the progress block. The percentage is monotone: attempts to
    /// move it backwards are clamped to the current value.
    pub fn update_progress(
        &self,
        analysis_id: &str,
        percentage: u8,
        phase: &str,
        active: BTreeSet<String>,
        completed: BTreeSet<String>,
        pending: BTreeSet<String>,
    ) {
        self.mutate(analysis_id, |record| {
            let clamped = percentage.min(100).max(record.progress.percentage);
            record.progress = ProgressState {
                percentage: clamped,
                phase: phase.to_string(),
                active,
                completed,
                pending,
                updated_at: Utc::now(),
            };
        });
    }

    /// Transition to `completed` with the artifacts. A no-op on records that
    /// already reached a terminal state.
    pub fn complete(
        &self,
        analysis_id: &str,
        primary: FinalArtifact,
        symbol_artifacts: HashMap<String, FinalArtifact>,
    ) {
        let mut stored = false;
        self.mutate(analysis_id, |record| {
            if record.status.is_terminal() {
                warn!(analysis_id = %record.id, status = %record.status, "refusing to complete a terminal record");
                return;
            }
            record.status = AnalysisStatus::Completed;
            record.final_artifact = Some(primary.clone());
            record.symbol_artifacts = symbol_artifacts.clone();
            record.completed_at = Some(Utc::now());
            record.progress.percentage = 100;
            record.progress.phase = "completed".to_string();
            record.progress.updated_at = Utc::now();
            stored = true;
        });
        if stored {
            self.results
                .write()
                .insert(analysis_id.to_string(), primary);
        }
    }

    /// Transition to `failed`. The error message is always non-empty.
    pub fn fail(&self, analysis_id: &str, error: &str) {
        let message = if error.trim().is_empty() {
            "unspecified failure".to_string()
        } else {
            error.to_string()
        };
        self.mutate(analysis_id, |record| {
            if record.status.is_terminal() {
                warn!(analysis_id = %record.id, status = %record.status, "refusing to fail a terminal record");
                return;
            }
            record.status = AnalysisStatus::Failed;
            record.error_message = Some(message.clone());
            record.completed_at = Some(Utc::now());
            record.progress.phase = "failed".to_string();
            record.progress.updated_at = Utc::now();
        });
    }

    // ── Drift ───────────────────────────────────────────────────────────

    /// Record a drift sample: latest-per-symbol on the record plus a row of
    /// append-only history.
    pub fn record_drift(&self, analysis_id: &str, snapshot: DriftSnapshot) {
        self.mutate(analysis_id, |record| {
            record
                .drift_status
                .insert(snapshot.symbol.clone(), snapshot.clone());
        });
        self.drift_history.write().push(DriftHistoryEntry {
            analysis_id: analysis_id.to_string(),
            snapshot,
        });
    }

    pub fn record_alert(&self, alert: DriftAlert) {
        self.drift_alerts.write().push(alert);
    }

    /// Alerts for one analysis, newest first.
    pub fn alerts_for(&self, analysis_id: &str) -> Vec<DriftAlert> {
        let mut alerts: Vec<DriftAlert> = self
            .drift_alerts
            .read()
            .iter()
            .filter(|alert| alert.analysis_id == analysis_id)
            .cloned()
            .collect();
        alerts.reverse();
        alerts
    }

    pub fn drift_history_for(&self, analysis_id: &str) -> Vec<DriftSnapshot> {
        self.drift_history
            .read()
            .iter()
            .filter(|entry| entry.analysis_id == analysis_id)
            .map(|entry| entry.snapshot.clone())
            .collect()
    }

    /// Drop drift history older than the cutoff. Alerts and latest-status
    /// entries are kept.
    pub fn compact_drift_history(&self, cutoff: DateTime<Utc>) -> usize {
        let mut history = self.drift_history.write();
        let before = history.len();
        history.retain(|entry| entry.snapshot.sampled_at >= cutoff);
        before - history.len()
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Analyses completed within the trailing window — the drift monitor's
    /// working set.
    pub fn completed_within(&self, window: Duration) -> Vec<AnalysisRecord> {
        let cutoff = Utc::now() - window;
        self.analyses
            .read()
            .values()
            .filter(|record| {
                record.status == AnalysisStatus::Completed
                    && record.completed_at.is_some_and(|at| at >= cutoff)
            })
            .cloned()
            .collect()
    }

    /// Most recent submissions first.
    pub fn recent_summaries(&self, limit: usize) -> Vec<AnalysisSummary> {
        let analyses = self.analyses.read();
        self.order
            .read()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| analyses.get(id))
            .map(|record| AnalysisSummary {
                id: record.id.clone(),
                query: record.query.clone(),
                symbols: record.symbols.clone(),
                status: record.status,
                created_at: record.created_at,
                completed_at: record.completed_at,
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.analyses
            .read()
            .values()
            .filter(|record| record.status == AnalysisStatus::Running)
            .count()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn mutate(&self, analysis_id: &str, mutation: impl FnOnce(&mut AnalysisRecord)) {
        let mut analyses = self.analyses.write();
        match analyses.get_mut(analysis_id) {
            Some(record) => mutation(record),
            None => warn!(analysis_id, "mutation against unknown analysis id dropped"),
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
    use crate::runtime_config::PositionRiskFractions;
    use crate::synthesis::{SynthesisInputs, SynthesisStage};
    use crate::types::Severity;

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("analyze AAPL", vec!["AAPL".to_string()])
    }

    fn artifact() -> FinalArtifact {
        let consensus = ConsensusResult::insufficient_data();
        let stage = SynthesisStage::new(2.0, 100_000.0, PositionRiskFractions::default());
        stage
            .synthesize(
                "AAPL",
                &SynthesisInputs {
                    consensus: &consensus,
                    risk_opinion: None,
                    technical_opinion: None,
                    fundamental_opinion: None,
                    entry_price: 100.0,
                    context_degraded: false,
                },
            )
            .unwrap()
    }

    #[test]
    fn create_then_get_roundtrip() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);

        let record = store.get(&req.id).unwrap();
        assert_eq!(record.status, AnalysisStatus::Pending);
        assert_eq!(record.symbols, vec!["AAPL"]);
        assert!(record.final_artifact.is_none());
    }

    #[test]
    fn completed_record_carries_artifact_and_denormalized_copy() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);
        store.mark_running(&req.id);

        let art = artifact();
        let mut by_symbol = HashMap::new();
        by_symbol.insert("AAPL".to_string(), art.clone());
        store.complete(&req.id, art, by_symbol);

        let record = store.get(&req.id).unwrap();
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert!(record.final_artifact.is_some());
        assert!(record.completed_at.is_some());
        assert_eq!(record.progress.percentage, 100);
        assert!(store.result(&req.id).is_some());
    }

    #[test]
    fn failed_record_always_has_a_message() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);
        store.fail(&req.id, "");

        let record = store.get(&req.id).unwrap();
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert!(!record.error_message.as_deref().unwrap().is_empty());
    }

    #[test]
    fn terminal_states_never_revert() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);
        store.fail(&req.id, "context construction failed");

        // Attempts to complete or re-fail a terminal record are dropped.
        let art = artifact();
        store.complete(&req.id, art, HashMap::new());
        let record = store.get(&req.id).unwrap();
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert!(record.final_artifact.is_none());

        store.fail(&req.id, "second failure");
        let record = store.get(&req.id).unwrap();
        assert_eq!(
            record.error_message.as_deref(),
            Some("context construction failed")
        );
    }

    #[test]
    fn progress_percentage_is_monotone() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);

        store.update_progress(&req.id, 40, "agents", BTreeSet::new(), BTreeSet::new(), BTreeSet::new());
        store.update_progress(&req.id, 10, "agents", BTreeSet::new(), BTreeSet::new(), BTreeSet::new());

        let record = store.get(&req.id).unwrap();
        assert_eq!(record.progress.percentage, 40);
    }

    #[test]
    fn drift_status_keeps_latest_and_history_accretes() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);

        let first = DriftSnapshot::from_dimensions("AAPL", 0.01, 0.0, 0.0, 0.0);
        let second = DriftSnapshot::from_dimensions("AAPL", 0.40, 0.6, 0.4, 0.3);
        store.record_drift(&req.id, first);
        store.record_drift(&req.id, second.clone());

        let record = store.get(&req.id).unwrap();
        assert_eq!(record.drift_status["AAPL"].severity, second.severity);
        assert_eq!(record.drift_status["AAPL"].severity, Severity::Critical);
        assert_eq!(store.drift_history_for(&req.id).len(), 2);
    }

    #[test]
    fn drift_history_compaction_respects_cutoff() {
        let store = ResultStore::new();
        let req = request();
        store.create(&req);
        store.record_drift(&req.id, DriftSnapshot::from_dimensions("AAPL", 0.01, 0.0, 0.0, 0.0));

        // Nothing is older than "now - 1 day".
        let removed = store.compact_drift_history(Utc::now() - Duration::days(1));
        assert_eq!(removed, 0);
        // Everything is older than "now + 1 day".
        let removed = store.compact_drift_history(Utc::now() + Duration::days(1));
        assert_eq!(removed, 1);
        assert!(store.drift_history_for(&req.id).is_empty());
    }

    #[test]
    fn completed_within_filters_by_window_and_status() {
        let store = ResultStore::new();
        let done = request();
        store.create(&done);
        store.complete(&done.id, artifact(), HashMap::new());

        let still_running = request();
        store.create(&still_running);
        store.mark_running(&still_running.id);

        let active = store.completed_within(Duration::hours(24));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, done.id);
    }

    #[test]
    fn summaries_are_newest_first() {
        let store = ResultStore::new();
        let first = request();
        let second = request();
        store.create(&first);
        store.create(&second);

        let summaries = store.recent_summaries(10);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, second.id);
        assert_eq!(summaries[1].id, first.id);
    }

    #[test]
    fn alerts_filter_by_analysis_and_reverse_order() {
        let store = ResultStore::new();
        let snap = DriftSnapshot::from_dimensions("AAPL", 0.2, 0.0, 0.0, 0.0);
        for (i, analysis_id) in ["a1", "a1", "a2"].iter().enumerate() {
            store.record_alert(DriftAlert {
                alert_id: format!("alert-{i}"),
                analysis_id: analysis_id.to_string(),
                symbol: "AAPL".to_string(),
                kind: crate::drift::DriftKind::Price,
                severity: Severity::Medium,
                message: "price moved".to_string(),
                snapshot: snap.clone(),
                triggered_at: Utc::now(),
            });
        }

        let alerts = store.alerts_for("a1");
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_id, "alert-1");
    }
}
