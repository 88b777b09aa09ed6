// =============================================================================
// Fundamental Agent — valuation and quality read from the fundamentals snapshot
// =============================================================================
//
// Scores the company on valuation (P/E), growth, profitability, and leverage,
// and exposes a per-share intrinsic value estimate for the synthesis stage.
// Only the per-share figure is ever published; enterprise-level valuations
// stay internal to whatever produced the snapshot.
// =============================================================================

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};
use crate::types::{Recommendation, Signal};

/// Sanity window applied to the intrinsic value before it is exposed:
/// values outside [0.5x, 3x] of the current price are withheld.
const INTRINSIC_FLOOR_RATIO: f64 = 0.5;
const INTRINSIC_CEIL_RATIO: f64 = 3.0;

#[derive(Debug, Default)]
pub struct FundamentalAgent;

impl FundamentalAgent {
    /// Graham-style per-share value: `EPS * (8.5 + 2 * growth%)`, bounded by
    /// the sanity window around the current price.
    fn intrinsic_value_per_share(
        eps: Option<f64>,
        revenue_growth: Option<f64>,
        price: f64,
    ) -> Option<f64> {
        let eps = eps.filter(|e| *e > 0.0)?;
        let growth_pct = (revenue_growth.unwrap_or(0.0).clamp(0.0, 0.25)) * 100.0;
        let value = eps * (8.5 + 2.0 * growth_pct);

        (value.is_finite()
            && value >= price * INTRINSIC_FLOOR_RATIO
            && value <= price * INTRINSIC_CEIL_RATIO)
            .then_some(value)
    }
}

#[async_trait]
impl Agent for FundamentalAgent {
    fn id(&self) -> &str {
        "fundamental"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        let fundamentals = ctx
            .fundamentals
            .as_ref()
            .ok_or_else(|| AgentError::Permanent(format!("{}: no fundamentals in context", ctx.symbol)))?;
        let price = ctx
            .last_price()
            .ok_or_else(|| AgentError::Permanent(format!("{}: no price in context", ctx.symbol)))?;

        // Composite score in [0, 1]; each pillar nudges it off neutral.
        let mut score: f64 = 0.5;
        let mut notes: Vec<String> = Vec::new();

        if let Some(pe) = fundamentals.pe_ratio.filter(|pe| *pe > 0.0) {
            if pe < 15.0 {
                score += 0.12;
                notes.push(format!("P/E {pe:.1} below value threshold"));
            } else if pe > 40.0 {
                score -= 0.12;
                notes.push(format!("P/E {pe:.1} rich"));
            }
        }

        if let Some(growth) = fundamentals.revenue_growth {
            if growth > 0.15 {
                score += 0.12;
                notes.push(format!("revenue growth {:.0}%", growth * 100.0));
            } else if growth < 0.0 {
                score -= 0.12;
                notes.push("revenue contracting".to_string());
            }
        }

        if let Some(margin) = fundamentals.profit_margin {
            if margin > 0.15 {
                score += 0.08;
                notes.push(format!("profit margin {:.0}%", margin * 100.0));
            } else if margin < 0.0 {
                score -= 0.10;
                notes.push("unprofitable".to_string());
            }
        }

        if let Some(leverage) = fundamentals.debt_to_equity {
            // Providers report this one as a percentage.
            if leverage > 200.0 {
                score -= 0.08;
                notes.push(format!("debt/equity {leverage:.0}% elevated"));
            }
        }

        let intrinsic = Self::intrinsic_value_per_share(
            fundamentals.eps,
            fundamentals.revenue_growth,
            price,
        );
        if let Some(value) = intrinsic {
            if value > price * 1.15 {
                score += 0.10;
                notes.push(format!("trading below intrinsic estimate {value:.2}"));
            } else if value < price * 0.85 {
                score -= 0.10;
                notes.push(format!("trading above intrinsic estimate {value:.2}"));
            }
        }

        let recommendation = Recommendation::from_score(score.clamp(0.0, 1.0));
        // Conviction grows with the number of pillars that actually reported.
        let coverage = [
            fundamentals.pe_ratio.is_some(),
            fundamentals.revenue_growth.is_some(),
            fundamentals.profit_margin.is_some(),
            fundamentals.eps.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        let confidence = (0.35 + 0.12 * coverage as f64).min(0.85);

        let mut opinion = AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Scale(recommendation),
            confidence,
        )
        .with_rationale(if notes.is_empty() {
            "fundamentals inconclusive".to_string()
        } else {
            notes.join("; ")
        });

        if let Some(value) = intrinsic {
            opinion = opinion.with_metric("intrinsic_value_per_share", value);
        }
        if let Some(target) = fundamentals.analyst_target_price {
            opinion = opinion.with_metric("analyst_target_price", target);
        }
        if let Some(pe) = fundamentals.pe_ratio {
            opinion = opinion.with_metric("pe_ratio", pe);
        }

        Ok(opinion)
    }
}
