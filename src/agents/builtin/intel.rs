// =============================================================================
// Intelligence agents — news, macro context, catalyst tracking
// =============================================================================
//
// These three lean on external feeds in a full deployment. The standing
// implementations extract what they can from the shared context so the
// roster stays complete without any provider keys.
// =============================================================================

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};
use crate::indicators;
use crate::types::{SentimentLabel, Signal};

// =============================================================================
// News intelligence
// =============================================================================

/// Interprets the aggregate news/sentiment feed when present; stays neutral
/// at low conviction otherwise.
pub struct NewsIntelligenceAgent;

#[async_trait]
impl Agent for NewsIntelligenceAgent {
    fn id(&self) -> &str {
        "news"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        match ctx.sentiment_hint {
            Some(score) if score.is_finite() => {
                let label = if score > 0.3 {
                    SentimentLabel::Positive
                } else if score < -0.3 {
                    SentimentLabel::Negative
                } else {
                    SentimentLabel::Neutral
                };
                Ok(AgentOpinion::new(
                    self.id(),
                    &ctx.symbol,
                    Signal::Sentiment(label),
                    0.45 + 0.3 * score.abs().min(1.0),
                )
                .with_rationale(format!("news flow scored {score:+.2}"))
                .with_metric("news_score", score))
            }
            _ => Ok(AgentOpinion::new(
                self.id(),
                &ctx.symbol,
                Signal::Sentiment(SentimentLabel::Neutral),
                0.3,
            )
            .with_rationale("no news source configured")),
        }
    }
}

// =============================================================================
// Macro context
// =============================================================================

/// Judges how hospitable the current volatility regime is to adding
/// exposure. A rates/FX/indices feed replaces the proxy in production.
pub struct MacroContextAgent;

#[async_trait]
impl Agent for MacroContextAgent {
    fn id(&self) -> &str {
        "macro"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        let closes = ctx.closes();
        if closes.len() < 30 {
            return Err(AgentError::Permanent(format!(
                "{}: insufficient history for regime read",
                ctx.symbol
            )));
        }

        let window = &closes[closes.len() - 21..];
        let cv = indicators::coefficient_of_variation(window).unwrap_or(0.0);

        // Calm tape is permissive; a stressed one argues for de-risking.
        let (label, rationale) = if cv > 0.06 {
            (
                SentimentLabel::Bearish,
                format!("stressed volatility regime (cv {cv:.3}) — risk-off"),
            )
        } else if cv < 0.02 {
            (
                SentimentLabel::Positive,
                format!("calm volatility regime (cv {cv:.3})"),
            )
        } else {
            (
                SentimentLabel::Neutral,
                format!("ordinary volatility regime (cv {cv:.3})"),
            )
        };

        Ok(AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Sentiment(label),
            0.45,
        )
        .with_rationale(rationale)
        .with_metric("regime_cv", cv))
    }
}

// =============================================================================
// Catalyst tracking
// =============================================================================

/// Counts gap events in recent history as a proxy for scheduled catalysts
/// (earnings, guidance). Frequent gapping argues for smaller, later entries.
pub struct CatalystTrackingAgent;

#[async_trait]
impl Agent for CatalystTrackingAgent {
    fn id(&self) -> &str {
        "catalyst"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        if ctx.candles.len() < 40 {
            return Err(AgentError::Permanent(format!(
                "{}: insufficient bars for catalyst scan",
                ctx.symbol
            )));
        }

        let atr = indicators::average_true_range(&ctx.candles, indicators::atr::DEFAULT_PERIOD)
            .ok_or_else(|| {
                AgentError::Permanent(format!("{}: no ATR for gap detection", ctx.symbol))
            })?;

        let recent = &ctx.candles[ctx.candles.len() - 30..];
        let gap_days = recent
            .windows(2)
            .filter(|pair| (pair[1].open - pair[0].close).abs() > 1.5 * atr)
            .count();

        let (label, confidence, rationale) = if gap_days >= 3 {
            (
                SentimentLabel::Negative,
                0.5,
                format!("{gap_days} gap events in 30 sessions — event-driven tape"),
            )
        } else if gap_days > 0 {
            (
                SentimentLabel::Neutral,
                0.45,
                format!("{gap_days} recent gap event(s)"),
            )
        } else {
            (
                SentimentLabel::Neutral,
                0.4,
                "no recent gap events".to_string(),
            )
        };

        Ok(AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Sentiment(label),
            confidence,
        )
        .with_rationale(rationale)
        .with_metric("gap_days_30", gap_days as f64))
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

    fn context_from_closes(closes: &[f64]) -> AgentContext {
        let mut ctx = AgentContext::new("AAPL");
        ctx.candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64, c, c * 1.002, c * 0.998, c, 1_000_000.0))
            .collect();
        ctx
    }

    #[tokio::test]
    async fn news_agent_is_neutral_without_feed() {
        let ctx = AgentContext::new("AAPL");
        let opinion = NewsIntelligenceAgent.analyze(&ctx).await.unwrap();
        assert_eq!(opinion.signal.canonical(), Recommendation::Hold);
        assert!(opinion.confidence <= 0.3);
    }

    #[tokio::test]
    async fn news_agent_maps_strong_flow_to_direction() {
        let mut ctx = AgentContext::new("AAPL");
        ctx.sentiment_hint = Some(0.7);
        let opinion = NewsIntelligenceAgent.analyze(&ctx).await.unwrap();
        assert_eq!(opinion.signal.canonical(), Recommendation::Buy);
    }

    #[tokio::test]
    async fn macro_agent_reads_calm_regime_as_permissive() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + ((i % 3) as f64) * 0.05).collect();
        let opinion = MacroContextAgent
            .analyze(&context_from_closes(&closes))
            .await
            .unwrap();
        assert_eq!(opinion.signal.canonical(), Recommendation::Buy);
    }

    #[tokio::test]
    async fn macro_agent_reads_stressed_regime_as_risk_off() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 * (1.0 + 0.12 * ((i as f64) * 0.9).sin()))
            .collect();
        let opinion = MacroContextAgent
            .analyze(&context_from_closes(&closes))
            .await
            .unwrap();
        assert_eq!(opinion.signal.canonical(), Recommendation::Sell);
    }

    #[tokio::test]
    async fn catalyst_agent_counts_gaps() {
        let mut closes: Vec<f64> = (0..60).map(|_| 100.0).collect();
        // Three violent repricings in the last 30 sessions. Each bar opens at
        // its own level, so every jump shows up as an overnight gap against
        // the prior close.
        closes[40] = 130.0;
        closes[45] = 95.0;
        closes[50] = 125.0;
        let ctx = context_from_closes(&closes);
        let opinion = CatalystTrackingAgent.analyze(&ctx).await.unwrap();
        assert!(opinion.metric("gap_days_30").unwrap() >= 3.0);
        assert_eq!(opinion.signal.canonical(), Recommendation::Sell);
    }
}
