// =============================================================================
// In-memory market fetcher for tests
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use crate::market::{Candle, FetchError, FundamentalsSnapshot, MarketFetcher, Quote};

/// Scripted fetcher: per-symbol canned data plus failure injection.
#[derive(Default)]
pub struct MockFetcher {
    quotes: RwLock<HashMap<String, Quote>>,
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    fundamentals: RwLock<HashMap<String, FundamentalsSnapshot>>,
    sentiment: RwLock<HashMap<String, f64>>,
    fail_quote: RwLock<HashMap<String, FetchError>>,
    pub quote_calls: AtomicU64,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a symbol with a flat price and a plausible synthetic history.
    pub fn seed_symbol(&self, symbol: &str, price: f64) {
        self.set_quote(symbol, price, 1_000_000.0);
        let candles: Vec<Candle> = (0..260)
            .map(|i| {
                let drift = (i as f64 * 0.37).sin();
                let base = price * (1.0 + drift * 0.01);
                Candle::new(
                    1_700_000_000_000 + i * 86_400_000,
                    base,
                    base * 1.01,
                    base * 0.99,
                    base,
                    1_000_000.0,
                )
            })
            .collect();
        self.candles.write().insert(symbol.to_string(), candles);
        self.fundamentals
            .write()
            .insert(symbol.to_string(), FundamentalsSnapshot::default());
    }

    pub fn set_quote(&self, symbol: &str, price: f64, volume: f64) {
        self.set_quote_with_avg(symbol, price, volume, volume);
    }

    pub fn set_quote_with_avg(&self, symbol: &str, price: f64, volume: f64, avg_volume: f64) {
        self.quotes.write().insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                price,
                volume,
                avg_volume: Some(avg_volume),
                previous_close: Some(price),
                as_of: Utc::now(),
            },
        );
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.write().insert(symbol.to_string(), candles);
    }

    pub fn set_fundamentals(&self, symbol: &str, snapshot: FundamentalsSnapshot) {
        self.fundamentals
            .write()
            .insert(symbol.to_string(), snapshot);
    }

    pub fn set_sentiment(&self, symbol: &str, score: f64) {
        self.sentiment.write().insert(symbol.to_string(), score);
    }

    pub fn fail_quote_with(&self, symbol: &str, error: FetchError) {
        self.fail_quote.write().insert(symbol.to_string(), error);
    }
}

#[async_trait::async_trait]
impl MarketFetcher for MockFetcher {
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        self.quote_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.fail_quote.read().get(symbol) {
            return Err(err.clone());
        }
        self.quotes
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("{symbol}: unknown symbol")))
    }

    async fn history(
        &self,
        symbol: &str,
        _period: &str,
        _interval: &str,
    ) -> Result<Vec<Candle>, FetchError> {
        self.candles
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("{symbol}: no history")))
    }

    async fn fundamentals(&self, symbol: &str) -> Result<FundamentalsSnapshot, FetchError> {
        self.fundamentals
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("{symbol}: no fundamentals")))
    }

    async fn sentiment_score(&self, symbol: &str) -> Result<Option<f64>, FetchError> {
        Ok(self.sentiment.read().get(symbol).copied())
    }
}
