// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes. The
// technical agent reads the latest value to judge overbought/oversold
// conditions; the full series is never needed downstream.
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
// =============================================================================

/// Momentum condition derived from the latest RSI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsiCondition {
    Overbought,
    Oversold,
    Neutral,
}

impl RsiCondition {
    fn from_value(value: f64) -> Self {
        if value >= 70.0 {
            Self::Overbought
        } else if value <= 30.0 {
            Self::Oversold
        } else {
            Self::Neutral
        }
    }
}

/// Latest RSI value and its condition over a close-price series.
///
/// Returns `None` when `period` is zero, when fewer than `period + 1` closes
/// are available, or when the smoothing produces a non-finite value.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<(f64, RsiCondition)> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    // Seed the averages with the SMA of the first `period` deltas.
    let mut avg_gain = deltas[..period].iter().filter(|d| **d > 0.0).sum::<f64>() / period_f;
    let mut avg_loss =
        deltas[..period].iter().filter(|d| **d < 0.0).map(|d| -d).sum::<f64>() / period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    value
        .is_finite()
        .then(|| (value, RsiCondition::from_value(value)))
}
