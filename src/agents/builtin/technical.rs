// =============================================================================
// Technical Agent — trend, momentum, and volatility over daily bars
// =============================================================================

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};
use crate::indicators::{self, rsi::RsiCondition, Trend};
use crate::types::{Recommendation, Signal};

/// Minimum daily bars for a meaningful trend read (slow EMA window).
const MIN_BARS: usize = 50;

#[derive(Debug, Default)]
pub struct TechnicalAgent;

#[async_trait]
impl Agent for TechnicalAgent {
    fn id(&self) -> &str {
        "technical"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        if ctx.candles.len() < MIN_BARS {
            return Err(AgentError::Permanent(format!(
                "{}: {} bars insufficient for technical read (need {MIN_BARS})",
                ctx.symbol,
                ctx.candles.len()
            )));
        }

        let closes = ctx.closes();
        let trend = indicators::trend(&closes);
        let rsi = indicators::latest_rsi(&closes, 14);
        let atr = indicators::average_true_range(&ctx.candles, indicators::atr::DEFAULT_PERIOD);

        // Trend sets the direction; RSI extremes veto chasing it.
        let (recommendation, rationale) = match (trend, rsi) {
            (Some(Trend::Up(strength)), Some((rsi_value, condition))) => match condition {
                RsiCondition::Overbought => (
                    Recommendation::Hold,
                    format!("uptrend but RSI {rsi_value:.0} overbought — wait for pullback"),
                ),
                _ if strength > 0.05 => (
                    Recommendation::StrongBuy,
                    format!("strong uptrend (EMA spread {:.1}%), RSI {rsi_value:.0}", strength * 100.0),
                ),
                _ => (
                    Recommendation::Buy,
                    format!("uptrend intact, RSI {rsi_value:.0}"),
                ),
            },
            (Some(Trend::Down(strength)), Some((rsi_value, condition))) => match condition {
                RsiCondition::Oversold => (
                    Recommendation::Hold,
                    format!("downtrend but RSI {rsi_value:.0} oversold — bounce risk"),
                ),
                _ if strength > 0.05 => (
                    Recommendation::StrongSell,
                    format!("strong downtrend (EMA spread {:.1}%), RSI {rsi_value:.0}", strength * 100.0),
                ),
                _ => (
                    Recommendation::Sell,
                    format!("downtrend intact, RSI {rsi_value:.0}"),
                ),
            },
            _ => (
                Recommendation::Hold,
                "no directional trend on daily bars".to_string(),
            ),
        };

        // Conviction scales with how cleanly the signals agree.
        let confidence = match recommendation {
            Recommendation::StrongBuy | Recommendation::StrongSell => 0.8,
            Recommendation::Buy | Recommendation::Sell => 0.7,
            Recommendation::Hold => 0.5,
        };

        let mut opinion = AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Scale(recommendation),
            confidence,
        )
        .with_rationale(rationale)
        .with_metric(
            "trend",
            trend.map(|t| t.label()).unwrap_or("unknown"),
        );

        if let Some((rsi_value, _)) = rsi {
            opinion = opinion.with_metric("rsi", rsi_value);
        }
        if let Some(atr_value) = atr {
            opinion = opinion.with_metric("atr", atr_value);
        }

        Ok(opinion)
    }
}
