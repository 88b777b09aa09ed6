// =============================================================================
// Exponential Moving Average — trend classification
// =============================================================================
//
// The technical agent judges trend from the 20/50-day EMA pair on daily
// closes. The EMA weights recent prices more heavily:
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// seeded with the SMA of the first `period` closes.
// =============================================================================

/// Trend direction with a normalised strength measure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trend {
    /// Fast EMA above slow EMA; strength is the relative spread.
    Up(f64),
    /// Fast EMA below slow EMA.
    Down(f64),
    /// EMAs effectively on top of each other.
    Flat,
}

impl Trend {
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Up(_) => "uptrend",
            Self::Down(_) => "downtrend",
            Self::Flat => "sideways",
        }
    }
}

/// Latest EMA value for `closes` with the given look-back `period`.
///
/// Returns `None` when the series is shorter than `period`, the period is
/// zero, or the smoothing produces a non-finite value.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period + 1) as f64;
    let mut ema = closes[..period].iter().sum::<f64>() / period as f64;
    if !ema.is_finite() {
        return None;
    }

    for &close in &closes[period..] {
        ema = close * multiplier + ema * (1.0 - multiplier);
        if !ema.is_finite() {
            return None;
        }
    }

    Some(ema)
}

/// Minimum relative EMA spread before a trend is called.
const FLAT_BAND: f64 = 0.001;

/// Classify the 20/50 EMA trend on daily closes.
///
/// Returns `None` when the series is too short for the slow EMA.
pub fn trend(closes: &[f64]) -> Option<Trend> {
    let fast = latest_ema(closes, 20)?;
    let slow = latest_ema(closes, 50)?;

    if slow == 0.0 {
        return None;
    }

    let spread = (fast - slow) / slow.abs();
    if !spread.is_finite() {
        return None;
    }

    if spread > FLAT_BAND {
        Some(Trend::Up(spread))
    } else if spread < -FLAT_BAND {
        Some(Trend::Down(-spread))
    } else {
        Some(Trend::Flat)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_rejects_short_input() {
        assert!(latest_ema(&[], 5).is_none());
        assert!(latest_ema(&[1.0, 2.0], 5).is_none());
        assert!(latest_ema(&[1.0, 2.0, 3.0], 0).is_none());
    }

    #[test]
    fn ema_with_exact_period_is_sma() {
        let ema = latest_ema(&[2.0, 4.0, 6.0], 3).unwrap();
        assert!((ema - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA over 1..=10: seed SMA = 3.0, multiplier = 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let multiplier = 2.0 / 6.0;
        let mut expected = 3.0;
        for &c in &closes[5..] {
            expected = c * multiplier + expected * (1.0 - multiplier);
        }
        let ema = latest_ema(&closes, 5).unwrap();
        assert!((ema - expected).abs() < 1e-10);
    }

    #[test]
    fn ema_nan_poisons_to_none() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        assert!(latest_ema(&closes, 3).is_none());
    }

    #[test]
    fn rising_series_trends_up() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let t = trend(&closes).unwrap();
        assert!(t.is_up());
        assert_eq!(t.label(), "uptrend");
    }

    #[test]
    fn falling_series_trends_down() {
        let closes: Vec<f64> = (1..=200).rev().map(|x| x as f64).collect();
        match trend(&closes).unwrap() {
            Trend::Down(strength) => assert!(strength > 0.0),
            other => panic!("expected downtrend, got {other:?}"),
        }
    }

    #[test]
    fn flat_series_is_flat() {
        let closes = vec![100.0; 200];
        assert_eq!(trend(&closes).unwrap(), Trend::Flat);
    }

    #[test]
    fn trend_requires_slow_window() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert!(trend(&closes).is_none());
    }
}
