// =============================================================================
// Technical indicators over daily OHLCV history
// =============================================================================

pub mod atr;
pub mod ema;
pub mod rsi;

pub use atr::average_true_range;
pub use ema::{trend, Trend};
pub use rsi::latest_rsi;

/// Coefficient of variation (`stddev / mean`) of a close-price window.
///
/// This is the volatility measure the drift monitor compares across samples.
/// Returns `None` for windows shorter than two points or a zero mean.
pub fn coefficient_of_variation(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }

    let n = closes.len() as f64;
    let mean = closes.iter().sum::<f64>() / n;
    if mean == 0.0 || !mean.is_finite() {
        return None;
    }

    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean.abs();

    cv.is_finite().then_some(cv)
}
