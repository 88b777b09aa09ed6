// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR is the volatility input for stop-loss placement: the synthesis stage
// scales the stop distance as a multiple of ATR, keeping it in the same
// price units as the entry.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market::Candle;

/// Standard look-back window for daily bars.
pub const DEFAULT_PERIOD: usize = 14;

/// Most recent ATR value over daily OHLCV bars (oldest first).
///
/// Returns `None` when `period` is zero, when there are fewer than
/// `period + 1` bars (each TR value needs a previous close), or when any
/// intermediate value is non-finite.
pub fn average_true_range(bars: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let bar = &pair[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect();

    let period_f = period as f64;
    let seed = true_ranges[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut atr = seed;
    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 1_000.0)
    }

    #[test]
    fn period_zero_is_rejected() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(average_true_range(&bars, 0).is_none());
    }

    #[test]
    fn insufficient_bars() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(average_true_range(&bars, DEFAULT_PERIOD).is_none());
    }

    #[test]
    fn constant_range_converges_to_range() {
        // Every bar spans exactly 10; ATR should settle near 10.
        let bars: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = average_true_range(&bars, DEFAULT_PERIOD).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn gap_up_widens_true_range() {
        // |H - prevClose| dominates when the open gaps past the prior close.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0),
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = average_true_range(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_is_positive_on_noisy_series() {
        let bars: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                bar(base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let atr = average_true_range(&bars, DEFAULT_PERIOD).unwrap();
        assert!(atr > 0.0);
    }

    #[test]
    fn nan_inputs_yield_none() {
        let mut bars = vec![bar(100.0, 105.0, 95.0, 100.0); 4];
        bars[1].high = f64::NAN;
        assert!(average_true_range(&bars, 3).is_none());
    }
}
