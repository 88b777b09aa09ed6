// =============================================================================
// Risk Agent — return-distribution statistics and a graded risk level
// =============================================================================
//
// Works entirely from the daily close series:
//   - annualised Sharpe ratio (risk-free rate treated as zero)
//   - maximum peak-to-trough drawdown
//   - 95% historical VaR, reported as a DOLLAR loss on a reference notional
//     (deliberately not a price — downstream stages must never confuse the
//     two)
//   - annualised volatility, which drives the risk level grade
// =============================================================================

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};
use crate::types::{RiskLevel, Signal};

/// Trading days per year, for annualisation.
const TRADING_DAYS: f64 = 252.0;

/// Reference notional the VaR figure is quoted against.
const VAR_NOTIONAL_USD: f64 = 100_000.0;

/// Minimum observations for stable distribution statistics.
const MIN_RETURNS: usize = 30;

#[derive(Debug, Default)]
pub struct RiskAgent;

impl RiskAgent {
    fn daily_returns(closes: &[f64]) -> Vec<f64> {
        closes
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect()
    }

    fn sharpe_ratio(returns: &[f64]) -> f64 {
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();
        if stddev == 0.0 {
            return 0.0;
        }
        (mean / stddev) * TRADING_DAYS.sqrt()
    }

    /// Largest peak-to-trough decline, as a positive fraction.
    fn max_drawdown(closes: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut worst: f64 = 0.0;
        for &close in closes {
            peak = peak.max(close);
            if peak > 0.0 {
                worst = worst.max((peak - close) / peak);
            }
        }
        worst
    }

    /// Historical 95% VaR as a dollar loss on the reference notional.
    fn var_95_usd(returns: &[f64]) -> f64 {
        let mut sorted = returns.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = (((sorted.len() as f64) * 0.05).ceil() as usize).saturating_sub(1);
        let pct_loss = sorted.get(index).copied().unwrap_or(0.0).min(0.0).abs();
        pct_loss * VAR_NOTIONAL_USD
    }

    fn grade(annual_volatility: f64, max_drawdown: f64) -> RiskLevel {
        if annual_volatility > 0.60 || max_drawdown > 0.50 {
            RiskLevel::VeryHigh
        } else if annual_volatility > 0.40 || max_drawdown > 0.30 {
            RiskLevel::High
        } else if annual_volatility > 0.20 || max_drawdown > 0.15 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[async_trait]
impl Agent for RiskAgent {
    fn id(&self) -> &str {
        "risk"
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        let closes = ctx.closes();
        let returns = Self::daily_returns(&closes);
        if returns.len() < MIN_RETURNS {
            return Err(AgentError::Permanent(format!(
                "{}: {} return observations insufficient (need {MIN_RETURNS})",
                ctx.symbol,
                returns.len()
            )));
        }

        let sharpe = Self::sharpe_ratio(&returns);
        let drawdown = Self::max_drawdown(&closes);
        let var_95 = Self::var_95_usd(&returns);

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let annual_volatility = variance.sqrt() * TRADING_DAYS.sqrt();

        let level = Self::grade(annual_volatility, drawdown);

        let confidence = match level {
            // Statistics are most trustworthy at the extremes.
            RiskLevel::Low | RiskLevel::VeryHigh => 0.8,
            RiskLevel::Medium | RiskLevel::High => 0.7,
        };

        let opinion = AgentOpinion::new(self.id(), &ctx.symbol, Signal::Risk(level), confidence)
            .with_rationale(format!(
                "annualised vol {:.0}%, max drawdown {:.0}%, sharpe {sharpe:.2}",
                annual_volatility * 100.0,
                drawdown * 100.0
            ))
            .with_metric("sharpe_ratio", sharpe)
            .with_metric("max_drawdown", drawdown)
            .with_metric("var_95", var_95)
            .with_metric("annual_volatility", annual_volatility)
            .with_metric("risk_level", level.to_string());

        Ok(opinion)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Candle;

    fn context_from_closes(closes: &[f64]) -> AgentContext {
        let mut ctx = AgentContext::new("AAPL");
        ctx.candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64, c, c * 1.01, c * 0.99, c, 1_000_000.0))
            .collect();
        ctx
    }

    #[test]
    fn max_drawdown_of_monotonic_rise_is_zero() {
        let closes: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!(RiskAgent::max_drawdown(&closes) < 1e-12);
    }

    #[test]
    fn max_drawdown_detects_halving() {
        let closes = vec![100.0, 120.0, 60.0, 70.0];
        assert!((RiskAgent::max_drawdown(&closes) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn var_is_a_dollar_figure_not_a_price() {
        // 2% worst-day loss on the reference notional -> $2000 neighbourhood.
        let returns: Vec<f64> = (0..100)
            .map(|i| if i < 5 { -0.02 } else { 0.001 })
            .collect();
        let var = RiskAgent::var_95_usd(&returns);
        assert!(var > 1_000.0, "VaR should be in dollars, got {var}");
    }

    #[tokio::test]
    async fn calm_series_grades_low_risk() {
        let closes: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.05) + ((i % 5) as f64) * 0.02)
            .collect();
        let opinion = RiskAgent.analyze(&context_from_closes(&closes)).await.unwrap();
        assert_eq!(opinion.metric_str("risk_level"), Some("LOW"));
        assert!(opinion.metric("sharpe_ratio").unwrap() > 0.0);
    }

    #[tokio::test]
    async fn violent_series_grades_elevated_risk() {
        let closes: Vec<f64> = (0..200)
            .map(|i| 100.0 * (1.0 + 0.35 * ((i as f64) * 0.7).sin()))
            .collect();
        let opinion = RiskAgent.analyze(&context_from_closes(&closes)).await.unwrap();
        let level = RiskLevel::parse(opinion.metric_str("risk_level").unwrap()).unwrap();
        assert!(level.is_elevated(), "expected elevated risk, got {level}");
        assert!(opinion.metric("max_drawdown").unwrap() > 0.30);
    }

    #[tokio::test]
    async fn short_history_is_permanent_failure() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert!(matches!(
            RiskAgent.analyze(&context_from_closes(&closes)).await,
            Err(AgentError::Permanent(_))
        ));
    }
}
