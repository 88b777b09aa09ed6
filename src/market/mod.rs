// =============================================================================
// Market Data Access — fetcher contract and shared market types
// =============================================================================
//
// Agents never talk to a provider directly; they receive a prebuilt context.
// The orchestrator and the drift monitor go through the `MarketFetcher`
// trait, so every market-touching path is testable against an in-memory
// fetcher.
//
// Errors are classified because the retry policy branches on the kind:
// transient and rate-limited failures are retried with backoff, permanent
// failures are not.
// =============================================================================

pub mod provider;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use provider::HttpMarketProvider;

// =============================================================================
// Errors
// =============================================================================

/// Classified market data failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network hiccups and provider 5xx responses. Retryable.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Provider throttling (HTTP 429). Retryable after backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Invalid symbols, 4xx responses, malformed payloads. Not retryable.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

// =============================================================================
// Market data shapes
// =============================================================================

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, UNIX milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Point-in-time quote for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    /// Trailing average daily volume, when the provider reports one.
    pub avg_volume: Option<f64>,
    pub previous_close: Option<f64>,
    pub as_of: DateTime<Utc>,
}

/// Snapshot of headline fundamentals for a symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsSnapshot {
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub market_cap: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub profit_margin: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub analyst_target_price: Option<f64>,
    pub sector: Option<String>,
}

// =============================================================================
// Fetcher contract
// =============================================================================

/// Narrow interface over whatever market data provider backs the engine.
#[async_trait]
pub trait MarketFetcher: Send + Sync {
    /// Current quote for one symbol.
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError>;

    /// Historical OHLCV bars, oldest first. `period` and `interval` use
    /// provider notation ("1y", "5d", "1d").
    async fn history(
        &self,
        symbol: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<Candle>, FetchError>;

    /// Fundamentals snapshot for one symbol.
    async fn fundamentals(&self, symbol: &str) -> Result<FundamentalsSnapshot, FetchError>;

    /// Aggregate sentiment score in [-1, 1], when a sentiment source is
    /// wired. The default implementation reports "no provider".
    async fn sentiment_score(&self, _symbol: &str) -> Result<Option<f64>, FetchError> {
        Ok(None)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_classification() {
        assert!(FetchError::Transient("conn reset".into()).is_retryable());
        assert!(FetchError::RateLimited("429".into()).is_retryable());
        assert!(!FetchError::Permanent("unknown symbol".into()).is_retryable());
    }

    #[test]
    fn candle_roundtrip() {
        let c = Candle::new(1_700_000_000_000, 10.0, 11.0, 9.5, 10.5, 1_000.0);
        let json = serde_json::to_string(&c).unwrap();
        let back: Candle = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}
