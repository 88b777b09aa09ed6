// =============================================================================
// Orchestrator — two-phase DAG over the agent fleet
// =============================================================================
//
// Phase A fans the whole roster out concurrently per symbol under two
// admission limits (per-run and global). Phase B is sequential: consensus
// over the surviving opinions, synthesis of the trade plan, then the
// critique pass, then persistence.
//
// Failure containment:
//   - a failed / timed-out agent contributes nothing and aborts nothing
//   - a synthesis error installs the conservative fallback artifact
//   - the run itself fails only on fatal context loss or cancellation
//
// Progress is a monotone function of completed agents (up to 75%) with fixed
// checkpoints for synthesis (80%), critique (95%), and completion (100%).
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::{
    AgentContext, AgentExecution, AgentOpinion, AgentRegistry, AgentRuntime,
};
use crate::consensus::ConsensusEngine;
use crate::market::{FetchError, MarketFetcher};
use crate::progress::{ProgressBus, ProgressEvent, ProgressEventKind};
use crate::runtime_config::RuntimeConfig;
use crate::store::{AnalysisRecord, AnalysisRequest, ResultStore};
use crate::synthesis::{CritiqueStage, FinalArtifact, SynthesisInputs, SynthesisStage};
use crate::types::AgentStatus;

/// Progress share consumed by the fan-out phase.
const AGENT_PHASE_SPAN: f64 = 70.0;
const CONTEXT_CHECKPOINT: u8 = 5;
const SYNTHESIS_CHECKPOINT: u8 = 80;
const CRITIQUE_CHECKPOINT: u8 = 95;

pub struct Orchestrator {
    store: Arc<ResultStore>,
    bus: Arc<ProgressBus>,
    registry: Arc<AgentRegistry>,
    fetcher: Arc<dyn MarketFetcher>,
    config: Arc<RwLock<RuntimeConfig>>,
    /// Admission limit across all runs.
    global_limit: Arc<Semaphore>,
    /// Cancellation tokens for in-flight runs.
    cancels: RwLock<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ResultStore>,
        bus: Arc<ProgressBus>,
        registry: Arc<AgentRegistry>,
        fetcher: Arc<dyn MarketFetcher>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        let global = config.read().global_parallelism.max(1);
        Self {
            store,
            bus,
            registry,
            fetcher,
            config,
            global_limit: Arc::new(Semaphore::new(global)),
            cancels: RwLock::new(HashMap::new()),
        }
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Create the pending record and launch the run in the background.
    pub fn submit(self: &Arc<Self>, request: AnalysisRequest) -> AnalysisRecord {
        let record = self.store.create(&request);
        let cancel = CancellationToken::new();
        self.cancels
            .write()
            .insert(request.id.clone(), cancel.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run(request, cancel).await;
        });

        record
    }

    /// Cancel an in-flight run. Returns false when nothing is in flight.
    pub fn cancel(&self, analysis_id: &str) -> bool {
        match self.cancels.read().get(analysis_id) {
            Some(token) => {
                info!(analysis_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ── The run itself ──────────────────────────────────────────────────

    pub async fn run(&self, request: AnalysisRequest, cancel: CancellationToken) {
        let analysis_id = request.id.clone();
        info!(
            analysis_id = %analysis_id,
            symbols = ?request.symbols,
            "analysis run starting"
        );

        self.store.mark_running(&analysis_id);
        self.bus.publish(ProgressEvent::new(
            analysis_id.as_str(),
            ProgressEventKind::AnalysisStarted,
        ));

        let outcome = self.run_pipeline(&request, &cancel).await;
        self.cancels.write().remove(&analysis_id);

        match outcome {
            Ok(()) => {
                self.bus.publish(ProgressEvent::new(
                    analysis_id.as_str(),
                    ProgressEventKind::AnalysisCompleted,
                ));
                info!(analysis_id = %analysis_id, "analysis run completed");
            }
            Err(message) => {
                self.store.fail(&analysis_id, &message);
                self.bus.publish(ProgressEvent::new(
                    analysis_id.as_str(),
                    ProgressEventKind::AnalysisFailed {
                        error: message.clone(),
                    },
                ));
                warn!(analysis_id = %analysis_id, error = %message, "analysis run failed");
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let analysis_id = request.id.as_str();

        if self.registry.is_empty() {
            return Err("no agents registered".to_string());
        }

        // ── Context construction ────────────────────────────────────────
        self.publish_phase(analysis_id, "context");
        let mut contexts: Vec<Arc<AgentContext>> = Vec::new();
        for symbol in &request.symbols {
            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            match self.build_context(symbol).await {
                Ok(ctx) => contexts.push(Arc::new(ctx)),
                Err(reason) => {
                    warn!(analysis_id = %analysis_id, symbol = %symbol, reason = %reason, "context construction failed for symbol");
                }
            }
        }
        if contexts.is_empty() {
            return Err("context construction failed for every requested symbol".to_string());
        }
        self.store.update_progress(
            analysis_id,
            CONTEXT_CHECKPOINT,
            "context",
            BTreeSet::new(),
            BTreeSet::new(),
            self.execution_keys(&contexts),
        );

        // ── Phase A: fan-out ────────────────────────────────────────────
        self.publish_phase(analysis_id, "agents");
        let executions = self.fan_out(analysis_id, &contexts, cancel).await;
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }

        // ── Phase B: consensus → synthesis → critique, per symbol ───────
        let config = self.config.read().clone();
        let engine = ConsensusEngine::new(config.consensus_base_weights.clone());
        let synthesis = SynthesisStage::from_config(&config);
        let critique = CritiqueStage::new(config.stop_loss_atr_multiplier);

        self.bus.publish(ProgressEvent::new(
            analysis_id,
            ProgressEventKind::SynthesisStarted,
        ));
        self.checkpoint(analysis_id, SYNTHESIS_CHECKPOINT, "synthesis");

        let mut artifacts: HashMap<String, FinalArtifact> = HashMap::new();
        for ctx in &contexts {
            let opinions: Vec<AgentOpinion> = executions
                .iter()
                .filter(|exec| {
                    exec.symbol == ctx.symbol && exec.status == AgentStatus::Completed
                })
                .filter_map(|exec| exec.output.clone())
                .collect();

            let consensus = engine.evaluate(&opinions);
            let entry_price = ctx.last_price().unwrap_or(0.0);

            let risk_opinion = opinions.iter().find(|o| o.agent_id == "risk");
            let technical_opinion = opinions.iter().find(|o| o.agent_id == "technical");
            let fundamental_opinion = opinions.iter().find(|o| o.agent_id == "fundamental");

            let inputs = SynthesisInputs {
                consensus: &consensus,
                risk_opinion,
                technical_opinion,
                fundamental_opinion,
                entry_price,
                context_degraded: ctx.degraded,
            };

            let mut artifact = match synthesis.synthesize(&ctx.symbol, &inputs) {
                Ok(artifact) => artifact,
                Err(err) => {
                    error!(
                        analysis_id = %analysis_id,
                        symbol = %ctx.symbol,
                        error = %err,
                        "synthesis failed — installing conservative fallback"
                    );
                    synthesis.fallback_artifact(&ctx.symbol, entry_price, &consensus)
                }
            };

            self.bus.publish(ProgressEvent::new(
                analysis_id,
                ProgressEventKind::CritiqueStarted,
            ));
            self.checkpoint(analysis_id, CRITIQUE_CHECKPOINT, "critique");

            let atr = technical_opinion.and_then(|o| o.metric("atr"));
            critique.review(&mut artifact, risk_opinion, atr);

            artifacts.insert(ctx.symbol.clone(), artifact);
        }

        // ── Persist ─────────────────────────────────────────────────────
        let primary_symbol = request.primary_symbol();
        let primary = artifacts
            .get(primary_symbol)
            .or_else(|| artifacts.values().next())
            .cloned()
            .ok_or_else(|| "no artifact produced".to_string())?;
        self.store.complete(analysis_id, primary, artifacts);

        Ok(())
    }

    /// Launch every (symbol, agent) pair under both admission limits and
    /// wait for all of them to reach a terminal state, bounded by the
    /// whole-run deadline.
    async fn fan_out(
        &self,
        analysis_id: &str,
        contexts: &[Arc<AgentContext>],
        cancel: &CancellationToken,
    ) -> Vec<AgentExecution> {
        let config = self.config.read().clone();
        let per_run = Arc::new(Semaphore::new(config.per_run_parallelism.max(1)));
        let runtime = Arc::new(AgentRuntime::from_config(&config));
        let whole_run_deadline = Duration::from_millis(config.whole_run_timeout_ms);
        // Child token: a whole-run timeout cancels the phase without
        // cancelling the analysis.
        let phase_cancel = cancel.child_token();

        let multi_symbol = contexts.len() > 1;
        let mut join_set: JoinSet<AgentExecution> = JoinSet::new();
        let total = contexts.len() * self.registry.len();

        for ctx in contexts {
            for agent in self.registry.roster() {
                let per_run = Arc::clone(&per_run);
                let global = Arc::clone(&self.global_limit);
                let runtime = Arc::clone(&runtime);
                let bus = Arc::clone(&self.bus);
                let ctx = Arc::clone(ctx);
                let token = phase_cancel.clone();
                let analysis_id = analysis_id.to_string();

                join_set.spawn(async move {
                    // Both permits must be held for the execution to start.
                    let _run_permit = per_run.acquire_owned().await.ok();
                    let _global_permit = global.acquire_owned().await.ok();
                    runtime.run(&analysis_id, agent, ctx, &bus, &token).await
                });
            }
        }

        let all_keys = self.execution_keys(contexts);
        let mut executions: Vec<AgentExecution> = Vec::new();
        let mut deadline_expired = false;
        let mut grace_armed = false;
        let grace_period = Duration::from_millis(config.cancel_grace_ms.max(1));
        let deadline = tokio::time::sleep(whole_run_deadline);
        tokio::pin!(deadline);
        // Armed only once the phase is cancelled; the initial duration is a
        // placeholder that is never polled before then.
        let grace = tokio::time::sleep(Duration::from_secs(3_600));
        tokio::pin!(grace);

        while executions.len() < total {
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(mut execution)) => {
                            // Tasks unwound by the expired deadline report a
                            // cancellation; record them as whole-run timeouts.
                            if deadline_expired
                                && execution.error.as_deref() == Some("cancelled")
                            {
                                execution.status = AgentStatus::TimedOut;
                                execution.error =
                                    Some("whole-run deadline exceeded".to_string());
                            }
                            self.record_execution(
                                analysis_id,
                                execution,
                                &mut executions,
                                &all_keys,
                                multi_symbol,
                            );
                        }
                        Some(Err(join_err)) => {
                            error!(analysis_id, error = %join_err, "agent task panicked");
                        }
                        None => break,
                    }
                }
                _ = &mut deadline, if !deadline_expired => {
                    warn!(analysis_id, "whole-run deadline expired — remaining agents become timed_out");
                    deadline_expired = true;
                    phase_cancel.cancel();
                }
                _ = phase_cancel.cancelled(), if !grace_armed => {
                    grace_armed = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + grace_period);
                }
                _ = &mut grace, if grace_armed => {
                    warn!(
                        analysis_id,
                        grace_ms = grace_period.as_millis() as u64,
                        "cancellation grace expired — abandoning remaining agents"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }

        // Anything abandoned past the grace period still gets a terminal
        // execution record.
        self.backfill_abandoned(analysis_id, contexts, &mut executions, deadline_expired);

        executions
    }

    /// Record a terminal execution for every (agent, symbol) pair that never
    /// reported back before the fan-out was abandoned.
    fn backfill_abandoned(
        &self,
        analysis_id: &str,
        contexts: &[Arc<AgentContext>],
        executions: &mut Vec<AgentExecution>,
        deadline_expired: bool,
    ) {
        let seen: std::collections::HashSet<(String, String)> = executions
            .iter()
            .map(|exec| (exec.agent_id.clone(), exec.symbol.clone()))
            .collect();

        for ctx in contexts {
            for agent_id in self.registry.ids() {
                if seen.contains(&(agent_id.clone(), ctx.symbol.clone())) {
                    continue;
                }
                let now = chrono::Utc::now();
                let (status, error) = if deadline_expired {
                    (
                        AgentStatus::TimedOut,
                        "whole-run deadline exceeded".to_string(),
                    )
                } else {
                    (
                        AgentStatus::Failed,
                        "agent task never reported a result".to_string(),
                    )
                };
                let execution = AgentExecution {
                    agent_id,
                    symbol: ctx.symbol.clone(),
                    status,
                    started_at: now,
                    ended_at: Some(now),
                    attempts: 0,
                    error: Some(error),
                    output: None,
                };
                self.store
                    .push_agent_execution(analysis_id, execution.clone());
                executions.push(execution);
            }
        }
    }

    fn record_execution(
        &self,
        analysis_id: &str,
        execution: AgentExecution,
        executions: &mut Vec<AgentExecution>,
        all_keys: &BTreeSet<String>,
        multi_symbol: bool,
    ) {
        let total = all_keys.len();
        self.store
            .push_agent_execution(analysis_id, execution.clone());
        executions.push(execution);

        let completed: BTreeSet<String> = executions
            .iter()
            .map(|exec| execution_key(exec.agent_id.as_str(), &exec.symbol, multi_symbol))
            .collect();
        let pending: BTreeSet<String> = all_keys.difference(&completed).cloned().collect();
        let percentage =
            CONTEXT_CHECKPOINT + (AGENT_PHASE_SPAN * executions.len() as f64 / total as f64) as u8;

        self.store.update_progress(
            analysis_id,
            percentage,
            "agents",
            BTreeSet::new(),
            completed.clone(),
            pending.clone(),
        );
        self.bus.publish(ProgressEvent::new(
            analysis_id,
            ProgressEventKind::ProgressUpdate {
                percentage,
                phase: "agents".to_string(),
                active: Vec::new(),
                completed: completed.into_iter().collect(),
                pending: pending.into_iter().collect(),
            },
        ));
    }

    // ── Context ─────────────────────────────────────────────────────────

    /// Assemble one symbol's context. Fatal only when so much is missing
    /// that two or more of the mandatory agents (fundamental, technical,
    /// risk) could not run.
    async fn build_context(&self, symbol: &str) -> Result<AgentContext, String> {
        let mut ctx = AgentContext::new(symbol);

        match self.fetch_with_retry(|| self.fetcher.quote(symbol)).await {
            Ok(quote) => ctx.quote = Some(quote),
            Err(err) => {
                warn!(symbol, error = %err, "quote fetch failed");
                ctx.degraded = true;
            }
        }

        match self
            .fetch_with_retry(|| self.fetcher.history(symbol, "1y", "1d"))
            .await
        {
            Ok(candles) => ctx.candles = candles,
            Err(err) => {
                warn!(symbol, error = %err, "history fetch failed");
                ctx.degraded = true;
            }
        }

        match self
            .fetch_with_retry(|| self.fetcher.fundamentals(symbol))
            .await
        {
            Ok(fundamentals) => {
                ctx.sector = fundamentals.sector.clone();
                ctx.fundamentals = Some(fundamentals);
            }
            Err(err) => {
                warn!(symbol, error = %err, "fundamentals fetch failed");
                ctx.degraded = true;
            }
        }

        // Best-effort; absence is not degradation.
        if let Ok(score) = self.fetcher.sentiment_score(symbol).await {
            ctx.sentiment_hint = score;
        }

        let price_known = ctx.last_price().is_some();
        let mut unrunnable = 0;
        if ctx.fundamentals.is_none() || !price_known {
            unrunnable += 1; // fundamental
        }
        if ctx.candles.is_empty() {
            unrunnable += 2; // technical and risk both read history
        }
        if unrunnable >= 2 {
            return Err(format!(
                "{symbol}: context too degraded ({unrunnable} of 3 mandatory agents cannot run)"
            ));
        }

        Ok(ctx)
    }

    /// Retry transient/rate-limited fetches on the configured backoff
    /// schedule; permanent failures return immediately.
    async fn fetch_with_retry<T, F, Fut>(&self, mut fetch: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let policy = crate::agents::runtime::RetryPolicy::from_config(&self.config.read());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match fetch().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn execution_keys(&self, contexts: &[Arc<AgentContext>]) -> BTreeSet<String> {
        let multi = contexts.len() > 1;
        contexts
            .iter()
            .flat_map(|ctx| {
                self.registry
                    .ids()
                    .into_iter()
                    .map(move |id| execution_key(&id, &ctx.symbol, multi))
            })
            .collect()
    }

    fn publish_phase(&self, analysis_id: &str, phase: &str) {
        self.bus.publish(ProgressEvent::new(
            analysis_id,
            ProgressEventKind::PhaseStarted {
                phase: phase.to_string(),
            },
        ));
    }

    fn checkpoint(&self, analysis_id: &str, percentage: u8, phase: &str) {
        self.store.update_progress(
            analysis_id,
            percentage,
            phase,
            BTreeSet::new(),
            BTreeSet::new(),
            BTreeSet::new(),
        );
        self.bus.publish(ProgressEvent::new(
            analysis_id,
            ProgressEventKind::ProgressUpdate {
                percentage,
                phase: phase.to_string(),
                active: Vec::new(),
                completed: Vec::new(),
                pending: Vec::new(),
            },
        ));
    }
}

fn execution_key(agent_id: &str, symbol: &str, multi_symbol: bool) -> String {
    if multi_symbol {
        format!("{agent_id}:{symbol}")
    } else {
        agent_id.to_string()
    }
}

// =============================================================================
// End-to-end scenario tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentError, FnAgent};
    use crate::market::mock::MockFetcher;
    use crate::progress::ProgressEventKind;
    use crate::types::{
        AnalysisStatus, Recommendation, RiskLevel, SentimentLabel, Signal,
    };

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<ResultStore>,
        bus: Arc<ProgressBus>,
        fetcher: Arc<MockFetcher>,
    }

    fn harness(registry: AgentRegistry) -> Harness {
        let mut config = RuntimeConfig::default();
        config.per_agent_timeout_ms = 2_000;
        config.whole_run_timeout_ms = 5_000;
        config.backoff_initial_ms = 1;
        config.backoff_cap_ms = 5;

        let fetcher = Arc::new(MockFetcher::new());
        fetcher.seed_symbol("AAPL", 100.0);

        let store = Arc::new(ResultStore::new());
        let bus = Arc::new(ProgressBus::new(1_024));
        let fetcher_dyn: Arc<dyn MarketFetcher> = fetcher.clone();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::new(registry),
            fetcher_dyn,
            Arc::new(RwLock::new(config)),
        ));
        Harness {
            orchestrator,
            store,
            bus,
            fetcher,
        }
    }

    fn scale_agent(id: &'static str, rec: Recommendation, confidence: f64) -> Arc<FnAgent> {
        FnAgent::new(id, move |ctx: AgentContext| async move {
            Ok(AgentOpinion::new(id, ctx.symbol, Signal::Scale(rec), confidence))
        })
    }

    fn technical_agent(rec: Recommendation, confidence: f64, atr: f64) -> Arc<FnAgent> {
        FnAgent::new("technical", move |ctx: AgentContext| async move {
            Ok(
                AgentOpinion::new("technical", ctx.symbol, Signal::Scale(rec), confidence)
                    .with_metric("atr", atr),
            )
        })
    }

    fn risk_agent(level: RiskLevel, sharpe: f64, confidence: f64) -> Arc<FnAgent> {
        FnAgent::new("risk", move |ctx: AgentContext| async move {
            Ok(
                AgentOpinion::new("risk", ctx.symbol, Signal::Risk(level), confidence)
                    .with_metric("risk_level", level.to_string())
                    .with_metric("sharpe_ratio", sharpe)
                    .with_metric("max_drawdown", 0.1)
                    .with_metric("var_95", 2_000.0),
            )
        })
    }

    async fn run_to_terminal(h: &Harness, request: AnalysisRequest) -> AnalysisRecord {
        h.orchestrator.submit(request.clone());
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(record) = h.store.get(&request.id) {
                if record.status.is_terminal() {
                    return record;
                }
            }
        }
        panic!("analysis did not reach a terminal state");
    }

    #[tokio::test]
    async fn unanimous_buy_produces_actionable_plan() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.8));
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));
        registry.register(FnAgent::new("sentiment", |ctx: AgentContext| async move {
            Ok(AgentOpinion::new(
                "sentiment",
                ctx.symbol,
                Signal::Sentiment(SentimentLabel::Bullish),
                0.8,
            ))
        }));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.8));

        let h = harness(registry);
        let record = run_to_terminal(&h, AnalysisRequest::new("buy case", vec!["AAPL".into()])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let artifact = record.final_artifact.unwrap();
        assert_eq!(artifact.action, Recommendation::Buy);
        assert!((artifact.stop_loss.value - 96.0).abs() < 1e-9);
        assert!(artifact.target_price.value >= 110.0);
        assert!(artifact.risk_reward_ratio.value >= 1.0);
        assert!(artifact.consensus.agreement_level >= 0.9);
        assert!(artifact.consensus.dissenters.is_empty());
        assert_eq!(record.progress.percentage, 100);
    }

    #[tokio::test]
    async fn risk_override_forces_hold() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::StrongBuy, 0.9));
        registry.register(technical_agent(Recommendation::Buy, 0.85, 2.0));
        registry.register(FnAgent::new("sentiment", |ctx: AgentContext| async move {
            Ok(AgentOpinion::new(
                "sentiment",
                ctx.symbol,
                Signal::Sentiment(SentimentLabel::Bullish),
                0.8,
            ))
        }));
        registry.register(risk_agent(RiskLevel::High, 0.3, 0.8));

        let h = harness(registry);
        let record =
            run_to_terminal(&h, AnalysisRequest::new("risky case", vec!["AAPL".into()])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let artifact = record.final_artifact.unwrap();
        assert_eq!(artifact.action, Recommendation::Hold);
        assert!((artifact.consensus.consensus_score - 0.5).abs() < 1e-9);
        assert!(!artifact.consensus.conflicts_resolved.is_empty());
        assert!(!artifact
            .quality_flags
            .contains(&"synthesis_fallback".to_string()));
    }

    #[tokio::test]
    async fn one_failing_agent_does_not_abort_the_run() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.8));
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.8));
        registry.register(FnAgent::new("sentiment", |_ctx: AgentContext| async move {
            Err::<AgentOpinion, _>(AgentError::Permanent("sentiment source rejected symbol".into()))
        }));

        let h = harness(registry);
        let record =
            run_to_terminal(&h, AnalysisRequest::new("partial case", vec!["AAPL".into()])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        assert!(record.final_artifact.is_some());

        let sentiment_exec = record
            .agent_executions
            .iter()
            .find(|exec| exec.agent_id == "sentiment")
            .unwrap();
        assert_eq!(sentiment_exec.status, AgentStatus::Failed);
        assert!(!sentiment_exec.error.as_deref().unwrap().is_empty());

        // Consensus was computed from the remaining three.
        let artifact = record.final_artifact.unwrap();
        assert_eq!(artifact.consensus.agent_breakdown.len(), 3);
    }

    #[tokio::test]
    async fn malformed_opinion_is_contained() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.8));
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.8));
        // Confidence is NaN: the contract validator rejects it.
        registry.register(FnAgent::new("sentiment", |ctx: AgentContext| async move {
            Ok(AgentOpinion::new(
                "sentiment",
                ctx.symbol,
                Signal::Sentiment(SentimentLabel::Bullish),
                f64::NAN,
            ))
        }));

        let h = harness(registry);
        let record =
            run_to_terminal(&h, AnalysisRequest::new("malformed case", vec!["AAPL".into()])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let exec = record
            .agent_executions
            .iter()
            .find(|exec| exec.agent_id == "sentiment")
            .unwrap();
        assert_eq!(exec.status, AgentStatus::Failed);
        assert_eq!(exec.attempts, 1, "contract violations must not retry");
    }

    #[tokio::test]
    async fn progress_percentages_are_monotone_over_the_stream() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.8));
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.8));

        let h = harness(registry);
        let request = AnalysisRequest::new("progress case", vec!["AAPL".into()]);
        let mut rx = h.bus.subscribe(&request.id);
        let _ = run_to_terminal(&h, request).await;

        let mut last = 0u8;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event.kind {
                ProgressEventKind::ProgressUpdate { percentage, .. } => {
                    assert!(percentage >= last, "progress went backwards: {last} -> {percentage}");
                    last = percentage;
                }
                ProgressEventKind::AnalysisCompleted => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn fatal_context_loss_fails_the_run_early() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.8));

        let h = harness(registry);
        // An unknown symbol: every fetch fails permanently.
        let record = run_to_terminal(
            &h,
            AnalysisRequest::new("missing symbol", vec!["ZZZZ".into()]),
        )
        .await;

        assert_eq!(record.status, AnalysisStatus::Failed);
        assert!(!record.error_message.unwrap().is_empty());
        assert!(record.final_artifact.is_none());
    }

    #[tokio::test]
    async fn degraded_context_still_completes_with_cap() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.9));
        registry.register(technical_agent(Recommendation::Buy, 0.9, 2.0));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.9));

        let h = harness(registry);
        // Quote fails transiently forever; history and fundamentals remain.
        h.fetcher
            .fail_quote_with("AAPL", FetchError::Transient("quote feed down".into()));

        let record =
            run_to_terminal(&h, AnalysisRequest::new("degraded case", vec!["AAPL".into()])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let artifact = record.final_artifact.unwrap();
        assert!(artifact
            .quality_flags
            .contains(&"context_degraded".to_string()));
        assert!(artifact.confidence <= 0.5);
    }

    #[tokio::test]
    async fn cancellation_persists_a_failed_record() {
        let registry = AgentRegistry::new();
        registry.register(FnAgent::new("fundamental", |ctx: AgentContext| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(AgentOpinion::new(
                "fundamental",
                ctx.symbol,
                Signal::Scale(Recommendation::Buy),
                0.8,
            ))
        }));
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));

        let h = harness(registry);
        let request = AnalysisRequest::new("cancel case", vec!["AAPL".into()]);
        h.orchestrator.submit(request.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.orchestrator.cancel(&request.id));

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if h
                .store
                .get(&request.id)
                .is_some_and(|record| record.status.is_terminal())
            {
                break;
            }
        }
        let record = h.store.get(&request.id).unwrap();
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn whole_run_deadline_converts_stragglers_to_timeouts() {
        let registry = AgentRegistry::new();
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.8));
        // Slower than the whole-run deadline but within its own.
        registry.register(FnAgent::new("macro", |ctx: AgentContext| async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            Ok(AgentOpinion::new(
                "macro",
                ctx.symbol,
                Signal::Scale(Recommendation::Buy),
                0.5,
            ))
        }));

        let registry_harness = harness(registry);
        registry_harness
            .orchestrator
            .config
            .write()
            .whole_run_timeout_ms = 300;
        registry_harness
            .orchestrator
            .config
            .write()
            .per_agent_timeout_ms = 5_000;

        let record = run_to_terminal(
            &registry_harness,
            AnalysisRequest::new("deadline case", vec!["AAPL".into()]),
        )
        .await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let macro_exec = record
            .agent_executions
            .iter()
            .find(|exec| exec.agent_id == "macro")
            .unwrap();
        assert_eq!(macro_exec.status, AgentStatus::TimedOut);

        // The survivors still fed consensus.
        let artifact = record.final_artifact.unwrap();
        assert_eq!(artifact.consensus.agent_breakdown.len(), 2);
    }

    #[tokio::test]
    async fn multi_symbol_run_produces_artifact_per_symbol() {
        let registry = AgentRegistry::new();
        registry.register(scale_agent("fundamental", Recommendation::Buy, 0.8));
        registry.register(technical_agent(Recommendation::Buy, 0.8, 2.0));
        registry.register(risk_agent(RiskLevel::Low, 1.5, 0.8));

        let h = harness(registry);
        h.fetcher.seed_symbol("MSFT", 300.0);

        let record = run_to_terminal(
            &h,
            AnalysisRequest::new("pair case", vec!["AAPL".into(), "MSFT".into()]),
        )
        .await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        assert_eq!(record.symbol_artifacts.len(), 2);
        // Primary artifact belongs to the first-listed symbol.
        assert_eq!(record.final_artifact.unwrap().symbol, "AAPL");
        assert!((record.symbol_artifacts["MSFT"].entry_price.value - 300.0).abs() < 1e-9);
    }
}
