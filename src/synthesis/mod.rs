// =============================================================================
// Synthesis Stage — from consensus to a complete trade plan
// =============================================================================
//
// Consumes the consensus verdict plus the structured metrics of the risk,
// technical, and fundamental opinions, and derives the final artifact:
// action, entry/stop/target, risk-reward, three position-sizing scenarios,
// and an order scaffold.
//
// Every numeric in the artifact is a `UnitValue` — a stop-loss is a PRICE in
// dollars and must never be confused with a dollar loss figure such as VaR.
//
// Hard rules enforced here (and re-checked by the critique stage):
//   - stops are ATR-scaled: 2 x ATR from entry, 2% of entry when no ATR
//   - a BUY/SELL plan whose risk-reward falls below 1.0 degrades to HOLD
// =============================================================================

pub mod critique;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agents::AgentOpinion;
use crate::consensus::ConsensusResult;
use crate::runtime_config::{PositionRiskFractions, RuntimeConfig};
use crate::types::{Recommendation, RiskLevel, TimeHorizon, UnitValue};

pub use critique::{CritiqueResult, CritiqueStage};

/// Stop distance as a fraction of entry when no usable ATR exists.
const FALLBACK_STOP_FRACTION: f64 = 0.02;

/// Target formula bounds: 10% base move, 25% cap.
const TARGET_BASE_MOVE: f64 = 0.10;
const TARGET_MOVE_CAP: f64 = 0.25;

/// Sanity window for an intrinsic-value target, relative to entry.
const INTRINSIC_FLOOR_RATIO: f64 = 0.5;
const INTRINSIC_CEIL_RATIO: f64 = 3.0;

/// Watch levels emitted for HOLD plans.
const WATCH_SUPPORT_RATIO: f64 = 0.95;
const WATCH_RESISTANCE_RATIO: f64 = 1.05;

// =============================================================================
// Artifact types
// =============================================================================

/// One position-sizing scenario under a fixed-fractional risk budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionScenario {
    pub label: String,
    pub risk_fraction: f64,
    pub shares: UnitValue,
    pub position_value: UnitValue,
    pub capital_at_risk: UnitValue,
    pub position_pct_of_account: UnitValue,
}

/// The three standard scenarios plus which one is recommended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizing {
    pub conservative: PositionScenario,
    pub moderate: PositionScenario,
    pub aggressive: PositionScenario,
    /// Label of the recommended scenario.
    pub recommended: String,
}

impl PositionSizing {
    pub fn recommended_scenario(&self) -> &PositionScenario {
        match self.recommended.as_str() {
            "conservative" => &self.conservative,
            "aggressive" => &self.aggressive,
            _ => &self.moderate,
        }
    }
}

/// Order scaffold: a full bracket for actionable plans, watch levels for HOLD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderPlan {
    Bracket {
        side: Recommendation,
        entry: UnitValue,
        take_profit: UnitValue,
        stop_loss: UnitValue,
        quantity: UnitValue,
    },
    Watch {
        support: UnitValue,
        resistance: UnitValue,
    },
}

/// The finished product of one analysis for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub symbol: String,
    pub action: Recommendation,
    pub confidence: f64,
    pub entry_price: UnitValue,
    pub stop_loss: UnitValue,
    pub target_price: UnitValue,
    pub time_horizon: TimeHorizon,
    pub risk_reward_ratio: UnitValue,
    pub position_sizing: PositionSizing,
    pub orders: OrderPlan,
    pub rationale: String,
    pub key_risks: Vec<String>,
    pub quality_flags: Vec<String>,
    pub consensus: ConsensusResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critique: Option<CritiqueResult>,
    pub generated_at: DateTime<Utc>,
}

impl FinalArtifact {
    pub fn push_flag(&mut self, flag: impl Into<String>) {
        let flag = flag.into();
        if !self.quality_flags.contains(&flag) {
            self.quality_flags.push(flag);
        }
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// Structured inputs the synthesis consumes. Risk and technical opinions are
/// the mandatory ones; their absence degrades the derivations to fallbacks.
pub struct SynthesisInputs<'a> {
    pub consensus: &'a ConsensusResult,
    pub risk_opinion: Option<&'a AgentOpinion>,
    pub technical_opinion: Option<&'a AgentOpinion>,
    pub fundamental_opinion: Option<&'a AgentOpinion>,
    /// Current price; the plan's entry.
    pub entry_price: f64,
    /// True when context construction was partially degraded.
    pub context_degraded: bool,
}

impl SynthesisInputs<'_> {
    fn atr(&self) -> Option<f64> {
        self.technical_opinion
            .and_then(|o| o.metric("atr"))
            .or_else(|| self.risk_opinion.and_then(|o| o.metric("atr")))
            .filter(|atr| atr.is_finite() && *atr > 0.0)
    }

    fn risk_level(&self) -> Option<RiskLevel> {
        self.risk_opinion
            .and_then(|o| o.metric_str("risk_level"))
            .and_then(RiskLevel::parse)
    }

    fn intrinsic_value(&self) -> Option<f64> {
        self.fundamental_opinion
            .and_then(|o| o.metric("intrinsic_value_per_share"))
            .filter(|v| v.is_finite() && *v > 0.0)
    }
}

// =============================================================================
// SynthesisStage
// =============================================================================

pub struct SynthesisStage {
    atr_multiplier: f64,
    account_value: f64,
    risk_fractions: PositionRiskFractions,
}

impl SynthesisStage {
    pub fn new(
        atr_multiplier: f64,
        account_value: f64,
        risk_fractions: PositionRiskFractions,
    ) -> Self {
        Self {
            atr_multiplier,
            account_value,
            risk_fractions,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.stop_loss_atr_multiplier,
            config.account_value,
            config.position_risk_fractions.clone(),
        )
    }

    /// Derive the complete artifact. Fails only on unusable inputs (bad
    /// entry price); the orchestrator answers a failure with the
    /// conservative fallback artifact.
    pub fn synthesize(
        &self,
        symbol: &str,
        inputs: &SynthesisInputs<'_>,
    ) -> anyhow::Result<FinalArtifact> {
        let entry = inputs.entry_price;
        if !entry.is_finite() || entry <= 0.0 {
            anyhow::bail!("unusable entry price {entry} for {symbol}");
        }

        let mut action = inputs.consensus.recommendation;
        let mut quality_flags = Vec::new();

        // ── Stop-loss: ATR-scaled, always a price ───────────────────────
        let stop_distance = self.stop_distance(entry, inputs.atr());
        if inputs.atr().is_none() {
            quality_flags.push("atr_unavailable".to_string());
        }
        let stop_loss = stop_price(action, entry, stop_distance);

        // ── Target price ────────────────────────────────────────────────
        let (mut target, target_from_intrinsic) =
            self.target_price(action, entry, inputs.consensus.consensus_score, inputs);

        // ── Risk/reward with the floor rule ─────────────────────────────
        let mut risk_reward = risk_reward_ratio(action, entry, stop_loss, target);
        if (action.is_buy() || action.is_sell()) && risk_reward < 1.0 {
            warn!(
                symbol,
                risk_reward, "risk/reward below floor — downgrading to HOLD"
            );
            quality_flags.push("rr_floor_violated".to_string());
            action = Recommendation::Hold;
            target = entry;
            risk_reward = risk_reward_ratio(action, entry, stop_loss, target);
        }

        if inputs.context_degraded {
            quality_flags.push("context_degraded".to_string());
        }

        // ── Position sizing and orders ──────────────────────────────────
        let sizing = self.position_sizing(
            entry,
            stop_distance,
            risk_reward,
            inputs.consensus.confidence,
            inputs.risk_level(),
        );
        let orders = self.order_plan(action, entry, target, stop_loss, &sizing);

        // ── Horizon and narrative ───────────────────────────────────────
        let time_horizon = if target_from_intrinsic {
            TimeHorizon::LongTerm
        } else if matches!(
            action,
            Recommendation::StrongBuy | Recommendation::StrongSell
        ) {
            TimeHorizon::ShortTerm
        } else {
            TimeHorizon::MediumTerm
        };

        let mut key_risks = Vec::new();
        if let Some(risk) = inputs.risk_opinion {
            if !risk.rationale.is_empty() {
                key_risks.push(risk.rationale.clone());
            }
            if let Some(level) = inputs.risk_level() {
                if level.is_elevated() {
                    key_risks.push(format!("{level} risk grade"));
                }
            }
        }

        debug!(
            symbol,
            action = %action,
            entry,
            stop = stop_loss,
            target,
            risk_reward,
            "synthesis complete"
        );

        Ok(FinalArtifact {
            symbol: symbol.to_string(),
            action,
            confidence: inputs.consensus.confidence,
            entry_price: UnitValue::usd(entry, "entry price"),
            stop_loss: UnitValue::usd(stop_loss, "stop loss price"),
            target_price: UnitValue::usd(target, "target price"),
            time_horizon,
            risk_reward_ratio: UnitValue::ratio(risk_reward, "reward per unit of risk"),
            position_sizing: sizing,
            orders,
            rationale: inputs.consensus.reasoning.clone(),
            key_risks,
            quality_flags,
            consensus: inputs.consensus.clone(),
            critique: None,
            generated_at: Utc::now(),
        })
    }

    /// Conservative stand-in installed when synthesis itself blows up:
    /// HOLD at low confidence with a wide protective band.
    pub fn fallback_artifact(
        &self,
        symbol: &str,
        entry_price: f64,
        consensus: &ConsensusResult,
    ) -> FinalArtifact {
        let entry = if entry_price.is_finite() && entry_price > 0.0 {
            entry_price
        } else {
            1.0
        };
        let stop_loss = entry * 0.9;
        let target = entry * 1.05;
        let stop_distance = entry - stop_loss;
        let sizing = self.position_sizing(entry, stop_distance, 0.5, 0.3, None);
        let orders = self.order_plan(Recommendation::Hold, entry, target, stop_loss, &sizing);

        FinalArtifact {
            symbol: symbol.to_string(),
            action: Recommendation::Hold,
            confidence: 0.3,
            entry_price: UnitValue::usd(entry, "entry price"),
            stop_loss: UnitValue::usd(stop_loss, "stop loss price"),
            target_price: UnitValue::usd(target, "target price"),
            time_horizon: TimeHorizon::MediumTerm,
            risk_reward_ratio: UnitValue::ratio(
                risk_reward_ratio(Recommendation::Hold, entry, stop_loss, target),
                "reward per unit of risk",
            ),
            position_sizing: sizing,
            orders,
            rationale: "synthesis failed — conservative HOLD installed".to_string(),
            key_risks: Vec::new(),
            quality_flags: vec!["synthesis_fallback".to_string()],
            consensus: consensus.clone(),
            critique: None,
            generated_at: Utc::now(),
        }
    }

    /// ATR-scaled stop distance, 2% of entry without a usable ATR.
    pub fn stop_distance(&self, entry: f64, atr: Option<f64>) -> f64 {
        match atr {
            Some(atr) => self.atr_multiplier * atr,
            None => FALLBACK_STOP_FRACTION * entry,
        }
    }

    /// Target selection: a sane, direction-consistent intrinsic value wins;
    /// otherwise the consensus-scaled move formula. Returns the price and
    /// whether the intrinsic estimate drove it.
    fn target_price(
        &self,
        action: Recommendation,
        entry: f64,
        consensus_score: f64,
        inputs: &SynthesisInputs<'_>,
    ) -> (f64, bool) {
        if let Some(value) = inputs.intrinsic_value() {
            let within_window =
                value >= entry * INTRINSIC_FLOOR_RATIO && value <= entry * INTRINSIC_CEIL_RATIO;
            // The estimate must also point the same way as the action: an
            // intrinsic value below entry is no BUY target.
            let direction_ok = (action.is_buy() && value > entry)
                || (action.is_sell() && value < entry)
                || action == Recommendation::Hold;
            if within_window && direction_ok {
                return (value, true);
            }
        }

        let target = if action.is_buy() {
            let move_pct = (TARGET_BASE_MOVE + 0.05 * consensus_score).min(TARGET_MOVE_CAP);
            entry * (1.0 + move_pct)
        } else if action.is_sell() {
            let move_pct = (TARGET_BASE_MOVE + 0.05 * (1.0 - consensus_score)).min(TARGET_MOVE_CAP);
            entry * (1.0 - move_pct)
        } else {
            entry
        };
        (target, false)
    }

    /// Fixed-fractional scenarios. The aggressive budget is a Kelly-style
    /// fraction `p - (1 - p) / rr` bounded by the configured cap.
    fn position_sizing(
        &self,
        entry: f64,
        stop_distance: f64,
        risk_reward: f64,
        confidence: f64,
        risk_level: Option<RiskLevel>,
    ) -> PositionSizing {
        let kelly = if risk_reward > 0.0 {
            (confidence - (1.0 - confidence) / risk_reward).max(0.0)
        } else {
            0.0
        };
        let aggressive_fraction = kelly
            .max(self.risk_fractions.moderate)
            .min(self.risk_fractions.aggressive);

        let conservative =
            self.scenario("conservative", self.risk_fractions.conservative, entry, stop_distance);
        let moderate = self.scenario("moderate", self.risk_fractions.moderate, entry, stop_distance);
        let aggressive = self.scenario("aggressive", aggressive_fraction, entry, stop_distance);

        let recommended = match risk_level {
            Some(level) if level.is_elevated() => "conservative",
            _ => "moderate",
        };

        PositionSizing {
            conservative,
            moderate,
            aggressive,
            recommended: recommended.to_string(),
        }
    }

    fn scenario(
        &self,
        label: &str,
        risk_fraction: f64,
        entry: f64,
        stop_distance: f64,
    ) -> PositionScenario {
        let risk_budget = self.account_value * risk_fraction;
        let shares = if stop_distance > 0.0 {
            (risk_budget / stop_distance).floor()
        } else {
            0.0
        };
        // Never size beyond the account itself.
        let shares = shares.min((self.account_value / entry).floor()).max(0.0);
        let position_value = shares * entry;
        let capital_at_risk = shares * stop_distance;
        let pct = if self.account_value > 0.0 {
            position_value / self.account_value * 100.0
        } else {
            0.0
        };

        PositionScenario {
            label: label.to_string(),
            risk_fraction,
            shares: UnitValue::shares(shares, format!("{label} share count")),
            position_value: UnitValue::usd(position_value, "position notional"),
            capital_at_risk: UnitValue::usd(capital_at_risk, "loss if stopped out"),
            position_pct_of_account: UnitValue::percent(pct, "share of account"),
        }
    }

    fn order_plan(
        &self,
        action: Recommendation,
        entry: f64,
        target: f64,
        stop_loss: f64,
        sizing: &PositionSizing,
    ) -> OrderPlan {
        if action.is_buy() || action.is_sell() {
            OrderPlan::Bracket {
                side: action,
                entry: UnitValue::usd(entry, "entry leg"),
                take_profit: UnitValue::usd(target, "take profit leg"),
                stop_loss: UnitValue::usd(stop_loss, "stop loss leg"),
                quantity: UnitValue::shares(
                    sizing.recommended_scenario().shares.value,
                    "bracket quantity",
                ),
            }
        } else {
            OrderPlan::Watch {
                support: UnitValue::usd(entry * WATCH_SUPPORT_RATIO, "support watch level"),
                resistance: UnitValue::usd(entry * WATCH_RESISTANCE_RATIO, "resistance watch level"),
            }
        }
    }
}

/// Stop on the protective side of entry for the action.
fn stop_price(action: Recommendation, entry: f64, stop_distance: f64) -> f64 {
    if action.is_sell() {
        entry + stop_distance
    } else {
        // BUY variants and HOLD (informational) stop below entry.
        entry - stop_distance
    }
}

/// Directional risk/reward. HOLD plans report the buy-side formula as an
/// informational figure.
fn risk_reward_ratio(action: Recommendation, entry: f64, stop_loss: f64, target: f64) -> f64 {
    let (reward, risk) = if action.is_sell() {
        (entry - target, stop_loss - entry)
    } else {
        (target - entry, entry - stop_loss)
    };
    if risk <= 0.0 {
        return 0.0;
    }
    (reward / risk).max(0.0)
}
