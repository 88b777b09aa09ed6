// =============================================================================
// Sentiment Agent — aggregate crowd mood, provider-fed or momentum-proxied
// =============================================================================
//
// When the context carries a provider sentiment score it is passed through
// on the numeric [-1, 1] dialect. Without a provider the agent falls back to
// a weak price-momentum proxy at reduced confidence rather than failing —
// sentiment absence should not cost the run an execution slot.
// =============================================================================

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};
use crate::types::Signal;

/// Look-back for the momentum proxy, in trading days.
const PROXY_WINDOW: usize = 10;

#[derive(Debug, Default)]
pub struct SentimentAgent;

#[async_trait]
impl Agent for SentimentAgent {
    fn id(&self) -> &str {
        "sentiment"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        if let Some(score) = ctx.sentiment_hint {
            if !(-1.0..=1.0).contains(&score) || !score.is_finite() {
                return Err(AgentError::Permanent(format!(
                    "{}: sentiment score {score} outside [-1, 1]",
                    ctx.symbol
                )));
            }
            let confidence = 0.4 + 0.4 * score.abs();
            return Ok(AgentOpinion::new(
                self.id(),
                &ctx.symbol,
                Signal::Score(score),
                confidence,
            )
            .with_rationale(format!("aggregate source sentiment {score:+.2}"))
            .with_metric("sentiment_score", score));
        }

        // Momentum proxy: recent return scaled onto [-1, 1].
        let closes = ctx.closes();
        if closes.len() <= PROXY_WINDOW {
            return Err(AgentError::Permanent(format!(
                "{}: no sentiment source and insufficient history for proxy",
                ctx.symbol
            )));
        }
        let recent = closes[closes.len() - 1 - PROXY_WINDOW];
        let last = closes[closes.len() - 1];
        let momentum = if recent > 0.0 { last / recent - 1.0 } else { 0.0 };
        let score = (momentum * 10.0).clamp(-1.0, 1.0);

        Ok(AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Score(score),
            0.35,
        )
        .with_rationale(format!(
            "no sentiment source wired — {PROXY_WINDOW}d momentum proxy {score:+.2}"
        ))
        .with_metric("sentiment_score", score))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Candle;
    use crate::types::Recommendation;

    #[tokio::test]
    async fn provider_score_passes_through() {
        let mut ctx = AgentContext::new("AAPL");
        ctx.sentiment_hint = Some(0.6);
        let opinion = SentimentAgent.analyze(&ctx).await.unwrap();
        assert_eq!(opinion.signal, Signal::Score(0.6));
        assert_eq!(opinion.signal.canonical(), Recommendation::Buy);
        assert!(opinion.confidence > 0.5);
    }

    #[tokio::test]
    async fn out_of_range_provider_score_is_rejected() {
        let mut ctx = AgentContext::new("AAPL");
        ctx.sentiment_hint = Some(3.0);
        assert!(matches!(
            SentimentAgent.analyze(&ctx).await,
            Err(AgentError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn momentum_proxy_runs_at_low_confidence() {
        let mut ctx = AgentContext::new("AAPL");
        ctx.candles = (0..30)
            .map(|i| {
                let c = 100.0 + i as f64;
                Candle::new(i as i64, c, c, c, c, 1_000.0)
            })
            .collect();
        let opinion = SentimentAgent.analyze(&ctx).await.unwrap();
        assert!(opinion.confidence <= 0.4);
        assert_eq!(opinion.signal.canonical(), Recommendation::Buy);
    }

    #[tokio::test]
    async fn no_source_and_no_history_fails() {
        let ctx = AgentContext::new("AAPL");
        assert!(SentimentAgent.analyze(&ctx).await.is_err());
    }
}
