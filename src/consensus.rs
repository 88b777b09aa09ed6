// =============================================================================
// Consensus Engine — weighted merge of heterogeneous agent opinions
// =============================================================================
//
// Pipeline (per symbol):
//   1. Normalize every opinion onto the five-point scale.
//   2. Weight each agent: base_weight * confidence * historical_accuracy,
//      L1-normalised so the weights sum to 1.
//   3. Tally weighted votes per class.
//   4. Map the vote mass to a consensus score in [0, 1] and bucket it back
//      onto the scale. The score is the primary signal; raw vote mass only
//      breaks ties between adjacent buckets.
//   5. Apply the risk-adjusted downgrade ladder when the risk agent reports
//      poor risk-adjusted returns.
//   6. Score agreement, collect dissenters, compose the reasoning line, and
//      derive the final confidence.
//
// Zero usable opinions produce a conservative HOLD fallback instead of an
// error; the orchestrator always gets something synthesis can work with.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agents::AgentOpinion;
use crate::types::{Recommendation, RiskLevel};

/// Weight applied to agents missing from the base-weight table.
const FALLBACK_BASE_WEIGHT: f64 = 0.10;

/// Score distance beyond which an opinion counts as dissent. One full class
/// on the five-point scale is 0.25, so anything a class or more away from
/// the consensus is flagged.
const DISSENT_THRESHOLD: f64 = 0.2;

/// Agreement below this level is treated as a live conflict: the final
/// confidence takes a 30% haircut.
const LOW_AGREEMENT: f64 = 0.3;

// =============================================================================
// Result types
// =============================================================================

/// Per-agent entry in the consensus breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVote {
    pub agent_id: String,
    pub recommendation: Recommendation,
    pub confidence: f64,
    /// Normalised weight in [0, 1].
    pub weight: f64,
}

/// An opinion that landed far from the consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dissenter {
    pub agent_id: String,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub weight: f64,
    /// `|score(opinion) - score(consensus)|` on the 0-1 scale.
    pub divergence: f64,
}

/// The merged verdict over one symbol's opinions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub recommendation: Recommendation,
    /// Weighted sentiment scalar in [0, 1]: 1 = maximally bullish.
    pub consensus_score: f64,
    /// Weighted share of agents aligned with the final recommendation.
    pub agreement_level: f64,
    /// Final conviction in [0.1, 0.95].
    pub confidence: f64,
    /// Vote mass per class; sums to 1 within 1e-6.
    pub weighted_votes: HashMap<Recommendation, f64>,
    /// Sorted by descending weight.
    pub dissenters: Vec<Dissenter>,
    pub conflicts_resolved: Vec<String>,
    pub reasoning: String,
    pub agent_breakdown: Vec<AgentVote>,
}

impl ConsensusResult {
    /// Conservative verdict when no usable opinions exist.
    pub fn insufficient_data() -> Self {
        let mut weighted_votes = HashMap::new();
        weighted_votes.insert(Recommendation::Hold, 1.0);
        Self {
            recommendation: Recommendation::Hold,
            consensus_score: 0.5,
            agreement_level: 0.0,
            confidence: 0.3,
            weighted_votes,
            dissenters: Vec::new(),
            conflicts_resolved: Vec::new(),
            reasoning: "insufficient data: no usable agent opinions".to_string(),
            agent_breakdown: Vec::new(),
        }
    }
}

// =============================================================================
// Risk inputs
// =============================================================================

/// The slice of the risk opinion the downgrade ladder consumes.
#[derive(Debug, Clone, Copy, Default)]
struct RiskReadout {
    sharpe_ratio: Option<f64>,
    max_drawdown: Option<f64>,
    level: Option<RiskLevel>,
}

impl RiskReadout {
    fn from_opinions(opinions: &[AgentOpinion]) -> Self {
        let Some(risk) = opinions.iter().find(|o| o.agent_id == "risk") else {
            return Self::default();
        };

        let level = risk
            .metric_str("risk_level")
            .and_then(RiskLevel::parse)
            .or(match &risk.signal {
                crate::types::Signal::Risk(level) => Some(*level),
                _ => None,
            });

        Self {
            sharpe_ratio: risk.metric("sharpe_ratio"),
            max_drawdown: risk.metric("max_drawdown"),
            level,
        }
    }
}

// =============================================================================
// ConsensusEngine
// =============================================================================

pub struct ConsensusEngine {
    base_weights: HashMap<String, f64>,
}

impl ConsensusEngine {
    pub fn new(base_weights: HashMap<String, f64>) -> Self {
        Self { base_weights }
    }

    fn base_weight(&self, agent_id: &str) -> f64 {
        self.base_weights
            .get(agent_id)
            .copied()
            .unwrap_or(FALLBACK_BASE_WEIGHT)
    }

    /// Merge a symbol's opinions into one `ConsensusResult`.
    pub fn evaluate(&self, opinions: &[AgentOpinion]) -> ConsensusResult {
        if opinions.is_empty() {
            info!("consensus: no usable opinions — returning HOLD fallback");
            return ConsensusResult::insufficient_data();
        }

        // ── Steps 1-2: normalize and weight ─────────────────────────────
        let raw_weights: Vec<f64> = opinions
            .iter()
            .map(|o| self.base_weight(&o.agent_id) * o.confidence * o.historical_accuracy)
            .collect();
        let total: f64 = raw_weights.iter().sum();

        // All-zero confidence degenerates to equal weighting.
        let weights: Vec<f64> = if total > 0.0 {
            raw_weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / opinions.len() as f64; opinions.len()]
        };

        let canonical: Vec<Recommendation> =
            opinions.iter().map(|o| o.signal.canonical()).collect();

        // ── Step 3: weighted vote tally ─────────────────────────────────
        let mut weighted_votes: HashMap<Recommendation, f64> = HashMap::new();
        for (rec, weight) in canonical.iter().zip(&weights) {
            *weighted_votes.entry(*rec).or_insert(0.0) += weight;
        }

        // ── Step 4: score and bucket ────────────────────────────────────
        let mut consensus_score: f64 = weighted_votes
            .iter()
            .map(|(rec, votes)| votes * rec.score())
            .sum();
        let mut recommendation = Recommendation::from_score(consensus_score);

        debug!(
            score = consensus_score,
            recommendation = %recommendation,
            "consensus vote tally complete"
        );

        // ── Step 5: risk-adjusted downgrade ─────────────────────────────
        let mut conflicts_resolved = Vec::new();
        let risk = RiskReadout::from_opinions(opinions);
        if recommendation.is_buy() {
            let elevated = risk.level.is_some_and(|level| level.is_elevated());
            let poor_sharpe = risk.sharpe_ratio.is_some_and(|sharpe| sharpe < 0.5);
            let deep_drawdown = risk.max_drawdown.is_some_and(|dd| dd > 0.30);

            if poor_sharpe && elevated {
                conflicts_resolved.push(format!(
                    "risk override: sharpe {:.2} below 0.5 with {} risk — {} downgraded to HOLD",
                    risk.sharpe_ratio.unwrap_or_default(),
                    risk.level.map(|l| l.to_string()).unwrap_or_default(),
                    recommendation
                ));
                recommendation = Recommendation::Hold;
                consensus_score = 0.5;
            } else if deep_drawdown && elevated {
                conflicts_resolved.push(format!(
                    "risk override: max drawdown {:.0}% with {} risk — {} downgraded to HOLD",
                    risk.max_drawdown.unwrap_or_default() * 100.0,
                    risk.level.map(|l| l.to_string()).unwrap_or_default(),
                    recommendation
                ));
                recommendation = Recommendation::Hold;
                consensus_score = (consensus_score - 0.2).max(0.5);
            } else if risk.level == Some(RiskLevel::High) {
                conflicts_resolved
                    .push("elevated risk: consensus score dampened by 20%".to_string());
                consensus_score *= 0.8;
            }
        }

        // ── Step 6: agreement ───────────────────────────────────────────
        let agreement_level: f64 = canonical
            .iter()
            .zip(&weights)
            .map(|(rec, weight)| weight * match_score(*rec, recommendation))
            .sum();

        // ── Step 7: dissenters, sorted by descending weight ─────────────
        let mut dissenters: Vec<Dissenter> = opinions
            .iter()
            .zip(&canonical)
            .zip(&weights)
            .filter_map(|((opinion, rec), weight)| {
                let divergence = (rec.score() - recommendation.score()).abs();
                (divergence > DISSENT_THRESHOLD).then(|| Dissenter {
                    agent_id: opinion.agent_id.clone(),
                    recommendation: *rec,
                    confidence: opinion.confidence,
                    weight: *weight,
                    divergence,
                })
            })
            .collect();
        dissenters.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // ── Step 8: final confidence ────────────────────────────────────
        let weighted_confidence: f64 = opinions
            .iter()
            .zip(&weights)
            .map(|(o, w)| w * o.confidence)
            .sum();
        let decisiveness = 2.0 * (consensus_score - 0.5).abs();
        let mut confidence =
            0.4 * agreement_level + 0.4 * weighted_confidence + 0.2 * decisiveness;
        if agreement_level < LOW_AGREEMENT {
            confidence *= 0.7;
        }
        let confidence = confidence.clamp(0.1, 0.95);

        // ── Step 9: breakdown and reasoning ─────────────────────────────
        let mut agent_breakdown: Vec<AgentVote> = opinions
            .iter()
            .zip(&canonical)
            .zip(&weights)
            .map(|((opinion, rec), weight)| AgentVote {
                agent_id: opinion.agent_id.clone(),
                recommendation: *rec,
                confidence: opinion.confidence,
                weight: *weight,
            })
            .collect();
        agent_breakdown.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let reasoning = compose_reasoning(
            recommendation,
            &weighted_votes,
            agreement_level,
            weighted_confidence,
            &agent_breakdown,
            &dissenters,
        );

        ConsensusResult {
            recommendation,
            consensus_score,
            agreement_level,
            confidence,
            weighted_votes,
            dissenters,
            conflicts_resolved,
            reasoning,
            agent_breakdown,
        }
    }
}

/// 1.0 for an exact class match, 0.5 for same direction, 0 otherwise.
fn match_score(opinion: Recommendation, consensus: Recommendation) -> f64 {
    if opinion == consensus {
        1.0
    } else if opinion.same_direction(&consensus) {
        0.5
    } else {
        0.0
    }
}

fn compose_reasoning(
    recommendation: Recommendation,
    votes: &HashMap<Recommendation, f64>,
    agreement: f64,
    weighted_confidence: f64,
    breakdown: &[AgentVote],
    dissenters: &[Dissenter],
) -> String {
    let mut vote_parts: Vec<String> = Recommendation::ALL
        .iter()
        .filter_map(|rec| {
            votes
                .get(rec)
                .filter(|mass| **mass > 0.0)
                .map(|mass| format!("{rec} {:.0}%", mass * 100.0))
        })
        .collect();
    if vote_parts.is_empty() {
        vote_parts.push("no votes".to_string());
    }

    let leaders: Vec<&str> = breakdown
        .iter()
        .take(3)
        .map(|vote| vote.agent_id.as_str())
        .collect();

    let mut reasoning = format!(
        "{recommendation} consensus ({}), agreement {:.0}%, avg confidence {:.0}%; led by {}",
        vote_parts.join(", "),
        agreement * 100.0,
        weighted_confidence * 100.0,
        leaders.join(", "),
    );

    if !dissenters.is_empty() {
        let names: Vec<&str> = dissenters.iter().map(|d| d.agent_id.as_str()).collect();
        reasoning.push_str(&format!("; dissent from {}", names.join(", ")));
    }

    reasoning
}
