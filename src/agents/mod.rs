// =============================================================================
// Agent contract — the universal opinion record and execution context
// =============================================================================
//
// An agent is anything that turns a read-only market context into an
// `AgentOpinion`. The orchestrator treats the whole roster uniformly through
// the `Agent` trait; domain logic differences live entirely behind it.
//
// Opinions are heterogeneous on purpose: the sentiment agent speaks in
// bullish/bearish labels, the risk agent in risk levels. The consensus
// engine owns normalization; this module owns the shape and its validation.
// =============================================================================

pub mod builtin;
pub mod registry;
pub mod runtime;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market::{Candle, FetchError, FundamentalsSnapshot, Quote};
use crate::types::{AgentStatus, Signal};

pub use registry::{AgentRegistry, FnAgent};
pub use runtime::AgentRuntime;

// =============================================================================
// Errors
// =============================================================================

/// Classified agent failure. The runtime retries only transient and
/// rate-limited kinds; contract violations and permanent failures fail fast.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The agent returned something that does not satisfy the opinion
    /// contract (missing confidence, out-of-range fields, unparseable JSON
    /// from an LLM-backed agent).
    #[error("contract violation: {0}")]
    Contract(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

impl From<FetchError> for AgentError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => Self::Transient(msg),
            FetchError::RateLimited(msg) => Self::RateLimited(msg),
            FetchError::Permanent(msg) => Self::Permanent(msg),
        }
    }
}

// =============================================================================
// AgentOpinion
// =============================================================================

/// Default historical accuracy when no track record is known.
pub const DEFAULT_HISTORICAL_ACCURACY: f64 = 0.75;

/// The universal output contract every agent produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOpinion {
    /// Stable identifier of the producing agent (e.g. "fundamental").
    pub agent_id: String,

    /// Symbol the opinion pertains to.
    pub symbol: String,

    /// The recommendation in the agent's native vocabulary.
    pub signal: Signal,

    /// Conviction in [0, 1].
    pub confidence: f64,

    /// Short human-readable justification.
    pub rationale: String,

    /// Free-form metrics consumed downstream (sharpe_ratio, atr, rsi, ...).
    #[serde(default)]
    pub key_metrics: HashMap<String, serde_json::Value>,

    /// Track record in [0.1, 1.0]; externally maintained, defaults to 0.75.
    pub historical_accuracy: f64,

    pub produced_at: DateTime<Utc>,
}

impl AgentOpinion {
    pub fn new(
        agent_id: impl Into<String>,
        symbol: impl Into<String>,
        signal: Signal,
        confidence: f64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            symbol: symbol.into(),
            signal,
            confidence,
            rationale: String::new(),
            key_metrics: HashMap::new(),
            historical_accuracy: DEFAULT_HISTORICAL_ACCURACY,
            produced_at: Utc::now(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.key_metrics.insert(key.into(), value.into());
        self
    }

    pub fn with_historical_accuracy(mut self, accuracy: f64) -> Self {
        self.historical_accuracy = accuracy;
        self
    }

    /// Numeric metric lookup.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.key_metrics.get(key).and_then(|v| v.as_f64())
    }

    /// String metric lookup (e.g. "risk_level", "trend").
    pub fn metric_str(&self, key: &str) -> Option<&str> {
        self.key_metrics.get(key).and_then(|v| v.as_str())
    }

    /// Validate the opinion contract. A violation is recorded as a failed
    /// execution and is never retried.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.agent_id.trim().is_empty() {
            return Err(AgentError::Contract("empty agent_id".into()));
        }
        if self.symbol.trim().is_empty() {
            return Err(AgentError::Contract("empty symbol".into()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(AgentError::Contract(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if !self.historical_accuracy.is_finite()
            || !(0.1..=1.0).contains(&self.historical_accuracy)
        {
            return Err(AgentError::Contract(format!(
                "historical_accuracy {} outside [0.1, 1.0]",
                self.historical_accuracy
            )));
        }
        Ok(())
    }
}

// =============================================================================
// AgentContext
// =============================================================================

/// Read-only context shared by every phase-A agent of one symbol.
///
/// Fan-out agents all observe the same immutable snapshot and never see each
/// other's output.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub symbol: String,
    pub quote: Option<Quote>,
    /// One year of daily bars, oldest first.
    pub candles: Vec<Candle>,
    pub fundamentals: Option<FundamentalsSnapshot>,
    pub sector: Option<String>,
    /// Aggregate sentiment score in [-1, 1] when a provider is wired.
    pub sentiment_hint: Option<f64>,
    /// Set when one or more context fetches failed; the critique stage caps
    /// confidence for degraded runs.
    pub degraded: bool,
}

impl AgentContext {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// Last traded price: live quote preferred, last close as fallback.
    pub fn last_price(&self) -> Option<f64> {
        self.quote
            .as_ref()
            .map(|q| q.price)
            .or_else(|| self.candles.last().map(|c| c.close))
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }
}

// =============================================================================
// AgentExecution
// =============================================================================

/// Record of one agent run inside one analysis. Terminal states always carry
/// `ended_at`; executions are never re-run after reaching one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent_id: String,
    pub symbol: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of attempts made (1 = no retries).
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOpinion>,
}

// =============================================================================
// Agent trait
// =============================================================================

/// Anything that can turn a context into an opinion.
///
/// Implementations must be cheap to share (`Arc<dyn Agent>`); all I/O happens
/// inside `analyze` so the runtime can bound it with a deadline.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable registry key.
    fn id(&self) -> &str;

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Recommendation;

    #[test]
    fn opinion_validates_in_range() {
        let opinion = AgentOpinion::new("technical", "AAPL", Signal::Scale(Recommendation::Buy), 0.8);
        assert!(opinion.validate().is_ok());
    }

    #[test]
    fn confidence_out_of_range_is_contract_violation() {
        let opinion =
            AgentOpinion::new("technical", "AAPL", Signal::Scale(Recommendation::Buy), 1.2);
        assert!(matches!(
            opinion.validate(),
            Err(AgentError::Contract(_))
        ));

        let opinion =
            AgentOpinion::new("technical", "AAPL", Signal::Scale(Recommendation::Buy), f64::NAN);
        assert!(opinion.validate().is_err());
    }

    #[test]
    fn accuracy_out_of_range_is_contract_violation() {
        let opinion = AgentOpinion::new("risk", "AAPL", Signal::Scale(Recommendation::Hold), 0.5)
            .with_historical_accuracy(0.05);
        assert!(opinion.validate().is_err());
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        let opinion = AgentOpinion::new("", "AAPL", Signal::Scale(Recommendation::Hold), 0.5);
        assert!(opinion.validate().is_err());
        let opinion = AgentOpinion::new("risk", " ", Signal::Scale(Recommendation::Hold), 0.5);
        assert!(opinion.validate().is_err());
    }

    #[test]
    fn metric_accessors() {
        let opinion = AgentOpinion::new("risk", "AAPL", Signal::Risk(crate::types::RiskLevel::High), 0.7)
            .with_metric("sharpe_ratio", 0.3)
            .with_metric("risk_level", "HIGH");
        assert_eq!(opinion.metric("sharpe_ratio"), Some(0.3));
        assert_eq!(opinion.metric_str("risk_level"), Some("HIGH"));
        assert_eq!(opinion.metric("missing"), None);
    }

    #[test]
    fn fetch_errors_map_to_agent_errors() {
        let err: AgentError = FetchError::RateLimited("429".into()).into();
        assert!(err.is_retryable());
        let err: AgentError = FetchError::Permanent("bad symbol".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn context_price_falls_back_to_last_close() {
        let mut ctx = AgentContext::new("AAPL");
        assert!(ctx.last_price().is_none());
        ctx.candles.push(Candle::new(0, 10.0, 11.0, 9.0, 10.5, 100.0));
        assert_eq!(ctx.last_price(), Some(10.5));
    }
}
