// =============================================================================
// Worker agents — peer comparison, insider activity, predictive, chart analytics
// =============================================================================

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};
use crate::indicators;
use crate::types::{Recommendation, SentimentLabel, Signal};

// =============================================================================
// Peer comparison
// =============================================================================

/// Rough sector-median trailing P/E used as the comparison baseline.
fn sector_median_pe(sector: &str) -> f64 {
    match sector {
        "Technology" => 28.0,
        "Communication Services" => 22.0,
        "Consumer Cyclical" => 20.0,
        "Financial Services" => 13.0,
        "Healthcare" => 24.0,
        "Energy" => 11.0,
        "Utilities" => 17.0,
        "Industrials" => 21.0,
        "Basic Materials" => 14.0,
        "Real Estate" => 30.0,
        "Consumer Defensive" => 22.0,
        _ => 20.0,
    }
}

/// Values the symbol against its sector's P/E baseline.
pub struct PeerComparisonAgent;

#[async_trait]
impl Agent for PeerComparisonAgent {
    fn id(&self) -> &str {
        "peer_comparison"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        let pe = ctx
            .fundamentals
            .as_ref()
            .and_then(|f| f.pe_ratio)
            .filter(|pe| *pe > 0.0)
            .ok_or_else(|| {
                AgentError::Permanent(format!("{}: no P/E for peer comparison", ctx.symbol))
            })?;

        let sector = ctx.sector.as_deref().unwrap_or("unknown");
        let baseline = sector_median_pe(sector);
        let relative = pe / baseline;

        let (recommendation, rationale) = if relative < 0.75 {
            (
                Recommendation::Buy,
                format!("P/E {pe:.1} at a {:.0}% discount to {sector} median", (1.0 - relative) * 100.0),
            )
        } else if relative > 1.5 {
            (
                Recommendation::Sell,
                format!("P/E {pe:.1} at a {:.0}% premium to {sector} median", (relative - 1.0) * 100.0),
            )
        } else {
            (
                Recommendation::Hold,
                format!("P/E {pe:.1} in line with {sector} median"),
            )
        };

        Ok(AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Scale(recommendation),
            0.55,
        )
        .with_rationale(rationale)
        .with_metric("relative_pe", relative)
        .with_metric("sector_median_pe", baseline))
    }
}

// =============================================================================
// Insider activity
// =============================================================================

/// Infers accumulation/distribution from volume and price behaviour. A real
/// filing feed plugs in behind the same agent id.
pub struct InsiderActivityAgent;

#[async_trait]
impl Agent for InsiderActivityAgent {
    fn id(&self) -> &str {
        "insider_activity"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        let volumes = ctx.volumes();
        let closes = ctx.closes();
        if volumes.len() < 30 {
            return Err(AgentError::Permanent(format!(
                "{}: insufficient volume history",
                ctx.symbol
            )));
        }

        let recent_n = 5;
        let recent_volume =
            volumes[volumes.len() - recent_n..].iter().sum::<f64>() / recent_n as f64;
        let base_volume = volumes[..volumes.len() - recent_n].iter().sum::<f64>()
            / (volumes.len() - recent_n) as f64;
        let volume_ratio = if base_volume > 0.0 {
            recent_volume / base_volume
        } else {
            1.0
        };

        let recent_return = closes[closes.len() - recent_n..]
            .last()
            .zip(closes[closes.len() - recent_n..].first())
            .map(|(last, first)| if *first > 0.0 { last / first - 1.0 } else { 0.0 })
            .unwrap_or(0.0);

        // Heavy volume with the price holding up smells like accumulation;
        // heavy volume into weakness like distribution.
        let (label, rationale) = if volume_ratio > 1.5 && recent_return >= 0.0 {
            (
                SentimentLabel::Positive,
                format!("volume {volume_ratio:.1}x baseline on stable-to-rising price"),
            )
        } else if volume_ratio > 1.5 {
            (
                SentimentLabel::Negative,
                format!("volume {volume_ratio:.1}x baseline into weakness"),
            )
        } else {
            (SentimentLabel::Neutral, "no unusual volume footprint".to_string())
        };

        Ok(AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Sentiment(label),
            if label == SentimentLabel::Neutral { 0.4 } else { 0.55 },
        )
        .with_rationale(rationale)
        .with_metric("volume_ratio", volume_ratio))
    }
}

// =============================================================================
// Predictive
// =============================================================================

/// Projects the 30-day return from a least-squares fit over recent closes.
pub struct PredictiveAgent;

impl PredictiveAgent {
    /// Slope of the least-squares line through the last `window` closes,
    /// normalised by the latest price (per-day fractional drift).
    fn normalised_slope(closes: &[f64], window: usize) -> Option<f64> {
        if closes.len() < window || window < 2 {
            return None;
        }
        let tail = &closes[closes.len() - window..];
        let n = window as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = tail.iter().sum::<f64>() / n;

        let mut cov = 0.0;
        let mut var = 0.0;
        for (i, &y) in tail.iter().enumerate() {
            let dx = i as f64 - mean_x;
            cov += dx * (y - mean_y);
            var += dx * dx;
        }
        let last = *tail.last()?;
        (var > 0.0 && last > 0.0).then(|| (cov / var) / last)
    }
}

#[async_trait]
impl Agent for PredictiveAgent {
    fn id(&self) -> &str {
        "predictive"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        let closes = ctx.closes();
        let slope = Self::normalised_slope(&closes, 60).ok_or_else(|| {
            AgentError::Permanent(format!("{}: insufficient history for projection", ctx.symbol))
        })?;

        let projected_30d = slope * 30.0;
        let recommendation = if projected_30d > 0.08 {
            Recommendation::StrongBuy
        } else if projected_30d > 0.03 {
            Recommendation::Buy
        } else if projected_30d < -0.08 {
            Recommendation::StrongSell
        } else if projected_30d < -0.03 {
            Recommendation::Sell
        } else {
            Recommendation::Hold
        };

        Ok(AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Scale(recommendation),
            (0.4 + projected_30d.abs() * 2.0).min(0.7),
        )
        .with_rationale(format!(
            "trend extrapolation projects {:+.1}% over 30 days",
            projected_30d * 100.0
        ))
        .with_metric("projected_return_30d", projected_30d))
    }
}

// =============================================================================
// Chart analytics
// =============================================================================

/// Positions the price inside its 52-week range and flags breakouts.
pub struct ChartAnalyticsAgent;

#[async_trait]
impl Agent for ChartAnalyticsAgent {
    fn id(&self) -> &str {
        "chart_analytics"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        if ctx.candles.len() < 30 {
            return Err(AgentError::Permanent(format!(
                "{}: insufficient bars for chart read",
                ctx.symbol
            )));
        }
        let price = ctx.last_price().ok_or_else(|| {
            AgentError::Permanent(format!("{}: no price for chart read", ctx.symbol))
        })?;

        let high_52w = ctx.highs().iter().copied().fold(f64::MIN, f64::max);
        let low_52w = ctx.lows().iter().copied().fold(f64::MAX, f64::min);
        if high_52w <= low_52w {
            return Err(AgentError::Permanent(format!(
                "{}: degenerate 52-week range",
                ctx.symbol
            )));
        }

        let range_position = (price - low_52w) / (high_52w - low_52w);
        let atr = indicators::average_true_range(&ctx.candles, indicators::atr::DEFAULT_PERIOD);

        let (recommendation, rationale) = if price >= high_52w * 0.995 {
            (
                Recommendation::Buy,
                format!("breakout at 52-week high {high_52w:.2}"),
            )
        } else if price <= low_52w * 1.005 {
            (
                Recommendation::Sell,
                format!("breakdown at 52-week low {low_52w:.2}"),
            )
        } else if range_position > 0.75 {
            (
                Recommendation::Buy,
                format!("upper quartile of range ({:.0}%)", range_position * 100.0),
            )
        } else if range_position < 0.25 {
            (
                Recommendation::Sell,
                format!("lower quartile of range ({:.0}%)", range_position * 100.0),
            )
        } else {
            (Recommendation::Hold, "mid-range, no edge".to_string())
        };

        let mut opinion = AgentOpinion::new(
            self.id(),
            &ctx.symbol,
            Signal::Scale(recommendation),
            0.5,
        )
        .with_rationale(rationale)
        .with_metric("range_position", range_position)
        .with_metric("high_52w", high_52w)
        .with_metric("low_52w", low_52w);

        if let Some(atr_value) = atr {
            opinion = opinion.with_metric("atr", atr_value);
        }
        Ok(opinion)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Candle, FundamentalsSnapshot};

    fn context_from_closes(closes: &[f64]) -> AgentContext {
        let mut ctx = AgentContext::new("AAPL");
        ctx.candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64, c, c * 1.005, c * 0.995, c, 1_000_000.0))
            .collect();
        ctx
    }

    #[tokio::test]
    async fn peer_comparison_flags_discount() {
        let mut ctx = context_from_closes(&[100.0; 60]);
        ctx.sector = Some("Technology".into());
        ctx.fundamentals = Some(FundamentalsSnapshot {
            pe_ratio: Some(14.0),
            ..Default::default()
        });
        let opinion = PeerComparisonAgent.analyze(&ctx).await.unwrap();
        assert!(opinion.signal.canonical().is_buy());
        assert!(opinion.metric("relative_pe").unwrap() < 0.75);
    }

    #[tokio::test]
    async fn insider_agent_reads_accumulation() {
        let mut ctx = context_from_closes(&(0..60).map(|i| 100.0 + i as f64 * 0.1).collect::<Vec<_>>());
        // Spike the last five sessions' volume.
        let n = ctx.candles.len();
        for candle in &mut ctx.candles[n - 5..] {
            candle.volume = 3_000_000.0;
        }
        let opinion = InsiderActivityAgent.analyze(&ctx).await.unwrap();
        assert_eq!(opinion.signal.canonical(), Recommendation::Buy);
        assert!(opinion.metric("volume_ratio").unwrap() > 1.5);
    }

    #[tokio::test]
    async fn predictive_agent_projects_uptrend() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.5).collect();
        let opinion = PredictiveAgent
            .analyze(&context_from_closes(&closes))
            .await
            .unwrap();
        assert!(opinion.signal.canonical().is_buy());
        assert!(opinion.metric("projected_return_30d").unwrap() > 0.03);
    }

    #[tokio::test]
    async fn chart_agent_flags_breakout_at_high() {
        let mut closes: Vec<f64> = (0..120).map(|i| 100.0 + ((i % 10) as f64)).collect();
        closes.push(115.0);
        let opinion = ChartAnalyticsAgent
            .analyze(&context_from_closes(&closes))
            .await
            .unwrap();
        assert!(opinion.signal.canonical().is_buy());
    }

    #[tokio::test]
    async fn workers_fail_permanently_without_history() {
        let ctx = AgentContext::new("AAPL");
        assert!(InsiderActivityAgent.analyze(&ctx).await.is_err());
        assert!(PredictiveAgent.analyze(&ctx).await.is_err());
        assert!(ChartAnalyticsAgent.analyze(&ctx).await.is_err());
    }
}
