// =============================================================================
// HTTP Market Provider — chart/quote/fundamentals REST client
// =============================================================================
//
// Thin client over a Yahoo-style finance REST API. Responses are parsed
// defensively from `serde_json::Value` because the upstream schema is wide
// and only a handful of fields matter here.
//
// HTTP status mapping:
//   429          -> FetchError::RateLimited
//   5xx          -> FetchError::Transient
//   other errors -> FetchError::Permanent
//   I/O failures -> FetchError::Transient
// =============================================================================

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::market::{Candle, FetchError, FundamentalsSnapshot, MarketFetcher, Quote};

/// REST client for the market data provider.
#[derive(Clone)]
pub struct HttpMarketProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMarketProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("meridian-engine/1.0")
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "HttpMarketProvider initialised");

        Self { base_url, client }
    }

    /// Issue a GET and translate transport/status failures into classified
    /// fetch errors.
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited(format!("{url} returned 429")));
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("{url} returned {status}")));
        }

        resp.json()
            .await
            .map_err(|e| FetchError::Permanent(format!("malformed response body: {e}")))
    }

    /// Fetch the chart payload used by both `quote` and `history`.
    async fn chart(
        &self,
        symbol: &str,
        range: &str,
        interval: &str,
    ) -> Result<serde_json::Value, FetchError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range={}&interval={}",
            self.base_url, symbol, range, interval
        );
        let body = self.get_json(&url).await?;

        let result = body["chart"]["result"]
            .as_array()
            .and_then(|arr| arr.first().cloned());

        match result {
            Some(entry) => Ok(entry),
            None => {
                let err = body["chart"]["error"]["description"]
                    .as_str()
                    .unwrap_or("empty chart result")
                    .to_string();
                Err(FetchError::Permanent(format!("{symbol}: {err}")))
            }
        }
    }
}

#[async_trait::async_trait]
impl MarketFetcher for HttpMarketProvider {
    #[instrument(skip(self), name = "provider::quote")]
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        let entry = self.chart(symbol, "1d", "1m").await?;
        let meta = &entry["meta"];

        let price = meta["regularMarketPrice"]
            .as_f64()
            .ok_or_else(|| FetchError::Permanent(format!("{symbol}: quote missing price")))?;

        let volume = meta["regularMarketVolume"].as_f64().unwrap_or(0.0);

        let quote = Quote {
            symbol: symbol.to_string(),
            price,
            volume,
            avg_volume: meta["averageDailyVolume10Day"].as_f64(),
            previous_close: meta["chartPreviousClose"].as_f64(),
            as_of: Utc::now(),
        };

        debug!(symbol, price = quote.price, "quote fetched");
        Ok(quote)
    }

    #[instrument(skip(self), name = "provider::history")]
    async fn history(
        &self,
        symbol: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<Candle>, FetchError> {
        let entry = self.chart(symbol, period, interval).await?;

        let timestamps: Vec<i64> = entry["timestamp"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();

        let ohlcv = &entry["indicators"]["quote"][0];
        let series = |key: &str| -> Vec<Option<f64>> {
            ohlcv[key]
                .as_array()
                .map(|arr| arr.iter().map(|v| v.as_f64()).collect())
                .unwrap_or_default()
        };

        let opens = series("open");
        let highs = series("high");
        let lows = series("low");
        let closes = series("close");
        let volumes = series("volume");

        let mut candles = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            // Providers emit nulls for halted sessions; skip incomplete bars.
            let bar = (
                opens.get(i).copied().flatten(),
                highs.get(i).copied().flatten(),
                lows.get(i).copied().flatten(),
                closes.get(i).copied().flatten(),
            );
            if let (Some(open), Some(high), Some(low), Some(close)) = bar {
                let volume = volumes.get(i).copied().flatten().unwrap_or(0.0);
                candles.push(Candle::new(ts * 1_000, open, high, low, close, volume));
            }
        }

        if candles.is_empty() {
            warn!(symbol, period, interval, "history returned no usable bars");
            return Err(FetchError::Permanent(format!(
                "{symbol}: history returned no usable bars"
            )));
        }

        debug!(symbol, period, interval, count = candles.len(), "history fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "provider::fundamentals")]
    async fn fundamentals(&self, symbol: &str) -> Result<FundamentalsSnapshot, FetchError> {
        let url = format!(
            "{}/v10/finance/quoteSummary/{}?modules=summaryDetail,defaultKeyStatistics,financialData,assetProfile",
            self.base_url, symbol
        );
        let body = self.get_json(&url).await?;

        let result = body["quoteSummary"]["result"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .ok_or_else(|| {
                FetchError::Permanent(format!("{symbol}: empty quoteSummary result"))
            })?;

        let raw = |path: &[&str]| -> Option<f64> {
            let mut node = &result;
            for key in path {
                node = &node[*key];
            }
            node["raw"].as_f64().or_else(|| node.as_f64())
        };

        let snapshot = FundamentalsSnapshot {
            pe_ratio: raw(&["summaryDetail", "trailingPE"]),
            eps: raw(&["defaultKeyStatistics", "trailingEps"]),
            market_cap: raw(&["summaryDetail", "marketCap"]),
            revenue_growth: raw(&["financialData", "revenueGrowth"]),
            profit_margin: raw(&["financialData", "profitMargins"]),
            debt_to_equity: raw(&["financialData", "debtToEquity"]),
            dividend_yield: raw(&["summaryDetail", "dividendYield"]),
            analyst_target_price: raw(&["financialData", "targetMeanPrice"]),
            sector: result["assetProfile"]["sector"].as_str().map(String::from),
        };

        debug!(symbol, "fundamentals fetched");
        Ok(snapshot)
    }
}

impl std::fmt::Debug for HttpMarketProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMarketProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}
