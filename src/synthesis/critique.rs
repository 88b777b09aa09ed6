// =============================================================================
// Critique Stage — independent validation of the synthesized plan
// =============================================================================
//
// Last line of defense for the artifact invariants. Each check either
// auto-corrects the artifact (recomputing from the synthesis defaults) or
// downgrades the action, and every intervention leaves a flag:
//
//   1. stop/entry/target ordering per direction
//   2. risk/reward floor for actionable plans
//   3. the stop is a positive PRICE and not a VaR dollar figure
//   4. the sharpe/risk-level override really held
//   5. low-agreement confidence cap
//   6. degraded-context confidence cap
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agents::AgentOpinion;
use crate::synthesis::{FinalArtifact, OrderPlan};
use crate::types::{Recommendation, RiskLevel, UnitValue};

/// Stop distance fallback fraction, matching the synthesis default.
const FALLBACK_STOP_FRACTION: f64 = 0.02;

/// Confidence cap when the consensus was contested.
const LOW_AGREEMENT_CONFIDENCE_CAP: f64 = 0.6;

/// Confidence cap when the market context was degraded.
const DEGRADED_CONFIDENCE_CAP: f64 = 0.5;

/// Equality tolerance for the stop-vs-VaR confusion check.
const VAR_EPSILON: f64 = 1e-6;

/// Outcome of the critique pass, merged into the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueResult {
    /// True when no correction was necessary.
    pub passed: bool,
    pub corrections: Vec<String>,
    pub flags: Vec<String>,
    /// Final confidence minus the confidence synthesis proposed.
    pub confidence_delta: f64,
}

pub struct CritiqueStage {
    atr_multiplier: f64,
}

impl CritiqueStage {
    pub fn new(atr_multiplier: f64) -> Self {
        Self { atr_multiplier }
    }

    /// Validate and repair `artifact` in place; the returned result is also
    /// recorded on the artifact itself.
    pub fn review(
        &self,
        artifact: &mut FinalArtifact,
        risk_opinion: Option<&AgentOpinion>,
        atr: Option<f64>,
    ) -> CritiqueResult {
        let initial_confidence = artifact.confidence;
        let initial_stop = artifact.stop_loss.value;
        let mut corrections: Vec<String> = Vec::new();
        let mut flags: Vec<String> = Vec::new();

        let entry = artifact.entry_price.value;
        let stop_distance = match atr.filter(|a| a.is_finite() && *a > 0.0) {
            Some(atr) => self.atr_multiplier * atr,
            None => FALLBACK_STOP_FRACTION * entry,
        };

        let var_95 = risk_opinion.and_then(|o| o.metric("var_95"));
        let sharpe = risk_opinion.and_then(|o| o.metric("sharpe_ratio"));
        let risk_level = risk_opinion
            .and_then(|o| o.metric_str("risk_level"))
            .and_then(RiskLevel::parse);

        // ── 1. Price ordering ───────────────────────────────────────────
        let ordering_ok = match artifact.action {
            action if action.is_buy() => {
                artifact.stop_loss.value < entry && entry < artifact.target_price.value
            }
            action if action.is_sell() => {
                artifact.target_price.value < entry && entry < artifact.stop_loss.value
            }
            _ => true,
        };
        if !ordering_ok {
            corrections.push(format!(
                "price ordering invalid for {} (stop {:.2}, entry {:.2}, target {:.2}) — recomputed from defaults",
                artifact.action, artifact.stop_loss.value, entry, artifact.target_price.value
            ));
            flags.push("synthesis_corrected".to_string());
            self.recompute_levels(artifact, entry, stop_distance);
        }

        // ── 2. Risk/reward floor ────────────────────────────────────────
        let rr = directional_rr(artifact);
        artifact.risk_reward_ratio = UnitValue::ratio(rr, "reward per unit of risk");
        if (artifact.action.is_buy() || artifact.action.is_sell()) && rr < 1.0 {
            corrections.push(format!(
                "risk/reward {rr:.2} below 1.0 — {} downgraded to HOLD",
                artifact.action
            ));
            flags.push("rr_below_one".to_string());
            downgrade_to_hold(artifact);
        }

        // ── 3. Stop is a price, not a dollar loss ───────────────────────
        if artifact.stop_loss.value <= 0.0 {
            corrections.push(format!(
                "stop loss {:.2} is not a positive price — recomputed",
                artifact.stop_loss.value
            ));
            flags.push("synthesis_corrected".to_string());
            self.recompute_levels(artifact, entry, stop_distance);
        }
        if let Some(var) = var_95 {
            // Compare against the stop as synthesized: the ordering repair
            // above may already have papered over the confusion.
            if (initial_stop - var).abs() < VAR_EPSILON
                || (artifact.stop_loss.value - var).abs() < VAR_EPSILON
            {
                warn!(
                    symbol = %artifact.symbol,
                    var_95 = var,
                    "stop loss equals the VaR dollar figure — unit confusion repaired"
                );
                corrections.push(format!(
                    "stop loss {:.2} equals var_95 — a dollar loss is not a price; recomputed",
                    var
                ));
                flags.push("stop_equals_var95".to_string());
                self.recompute_levels(artifact, entry, stop_distance);
            }
        }

        // ── 4. Sharpe / risk-level override re-verified ─────────────────
        if artifact.action.is_buy() {
            let poor_sharpe = sharpe.is_some_and(|s| s < 0.5);
            let elevated = risk_level.is_some_and(|l| l.is_elevated());
            if poor_sharpe && elevated {
                corrections.push(format!(
                    "sharpe {:.2} with {} risk cannot support {} — downgraded to HOLD",
                    sharpe.unwrap_or_default(),
                    risk_level.map(|l| l.to_string()).unwrap_or_default(),
                    artifact.action
                ));
                flags.push("risk_override_enforced".to_string());
                downgrade_to_hold(artifact);
            }
        }

        // ── 5. Contested consensus caps confidence ──────────────────────
        if artifact.consensus.agreement_level < 0.3
            && (artifact.action.is_buy() || artifact.action.is_sell())
            && artifact.confidence > LOW_AGREEMENT_CONFIDENCE_CAP
        {
            corrections.push(format!(
                "agreement {:.0}% too low for {:.0}% confidence — capped at {:.0}%",
                artifact.consensus.agreement_level * 100.0,
                artifact.confidence * 100.0,
                LOW_AGREEMENT_CONFIDENCE_CAP * 100.0
            ));
            flags.push("low_agreement_cap".to_string());
            artifact.confidence = LOW_AGREEMENT_CONFIDENCE_CAP;
        }

        // ── 6. Degraded context caps confidence ─────────────────────────
        if artifact.quality_flags.iter().any(|f| f == "context_degraded")
            && artifact.confidence > DEGRADED_CONFIDENCE_CAP
        {
            corrections.push(format!(
                "context degraded — confidence capped at {:.0}%",
                DEGRADED_CONFIDENCE_CAP * 100.0
            ));
            flags.push("degraded_confidence_cap".to_string());
            artifact.confidence = DEGRADED_CONFIDENCE_CAP;
        }

        let result = CritiqueResult {
            passed: corrections.is_empty(),
            corrections,
            flags: flags.clone(),
            confidence_delta: artifact.confidence - initial_confidence,
        };

        for flag in flags {
            artifact.push_flag(flag);
        }
        artifact.critique = Some(result.clone());

        if result.passed {
            info!(symbol = %artifact.symbol, "critique passed clean");
        } else {
            info!(
                symbol = %artifact.symbol,
                corrections = result.corrections.len(),
                "critique applied corrections"
            );
        }

        result
    }

    /// Rebuild stop and target from the synthesis defaults for the current
    /// action and direction.
    fn recompute_levels(&self, artifact: &mut FinalArtifact, entry: f64, stop_distance: f64) {
        let action = artifact.action;
        let stop = if action.is_sell() {
            entry + stop_distance
        } else {
            entry - stop_distance
        };
        let score = artifact.consensus.consensus_score;
        let target = if action.is_buy() {
            entry * (1.0 + (0.10 + 0.05 * score).min(0.25))
        } else if action.is_sell() {
            entry * (1.0 - (0.10 + 0.05 * (1.0 - score)).min(0.25))
        } else {
            entry
        };

        artifact.stop_loss = UnitValue::usd(stop, "stop loss price");
        artifact.target_price = UnitValue::usd(target, "target price");
        artifact.risk_reward_ratio =
            UnitValue::ratio(directional_rr(artifact), "reward per unit of risk");
    }
}

/// Risk/reward from the artifact's current levels.
fn directional_rr(artifact: &FinalArtifact) -> f64 {
    let entry = artifact.entry_price.value;
    let stop = artifact.stop_loss.value;
    let target = artifact.target_price.value;
    let (reward, risk) = if artifact.action.is_sell() {
        (entry - target, stop - entry)
    } else {
        (target - entry, entry - stop)
    };
    if risk <= 0.0 {
        return 0.0;
    }
    (reward / risk).max(0.0)
}

/// Downgrade an actionable plan to HOLD and swap its bracket for watch
/// levels around entry.
fn downgrade_to_hold(artifact: &mut FinalArtifact) {
    artifact.action = Recommendation::Hold;
    let entry = artifact.entry_price.value;
    artifact.target_price = UnitValue::usd(entry, "target price");
    artifact.orders = OrderPlan::Watch {
        support: UnitValue::usd(entry * 0.95, "support watch level"),
        resistance: UnitValue::usd(entry * 1.05, "resistance watch level"),
    };
    artifact.risk_reward_ratio =
        UnitValue::ratio(directional_rr(artifact), "reward per unit of risk");
}
