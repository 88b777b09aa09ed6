// =============================================================================
// Drift model — how far the market has moved since an analysis was produced
// =============================================================================
//
// A completed analysis captures market state at a point in time. The drift
// monitor re-samples that state and scores the distance on four dimensions;
// the composite is a weighted blend, and the severity grading is what the
// alerting path keys off.
// =============================================================================

pub mod monitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Severity;

pub use monitor::DriftMonitor;

// =============================================================================
// Thresholds and weights
// =============================================================================

/// Per-dimension alert thresholds (fractions, 1.0 = 100%).
pub const PRICE_DRIFT_THRESHOLD: f64 = 0.05;
pub const VOLUME_DRIFT_THRESHOLD: f64 = 0.50;
pub const VOLATILITY_DRIFT_THRESHOLD: f64 = 0.30;
pub const SENTIMENT_DRIFT_THRESHOLD: f64 = 0.20;

/// Composite severity boundaries.
pub const COMPOSITE_MEDIUM: f64 = 0.15;
pub const COMPOSITE_HIGH: f64 = 0.25;
pub const COMPOSITE_CRITICAL: f64 = 0.35;

/// Composite blend weights: price 40%, volume 25%, volatility 20%,
/// sentiment 15%.
const WEIGHT_PRICE: f64 = 0.40;
const WEIGHT_VOLUME: f64 = 0.25;
const WEIGHT_VOLATILITY: f64 = 0.20;
const WEIGHT_SENTIMENT: f64 = 0.15;

// =============================================================================
// DriftSnapshot
// =============================================================================

/// One drift sample for one `(analysis, symbol)` pair. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSnapshot {
    pub symbol: String,
    /// `|current - original| / original` per dimension; non-negative.
    pub price_drift: f64,
    pub volume_drift: f64,
    pub volatility_drift: f64,
    pub sentiment_drift: f64,
    pub composite_score: f64,
    pub severity: Severity,
    pub sampled_at: DateTime<Utc>,
}

impl DriftSnapshot {
    /// Blend the four dimensions and grade the result.
    pub fn from_dimensions(
        symbol: impl Into<String>,
        price_drift: f64,
        volume_drift: f64,
        volatility_drift: f64,
        sentiment_drift: f64,
    ) -> Self {
        let composite_score = price_drift * WEIGHT_PRICE
            + volume_drift * WEIGHT_VOLUME
            + volatility_drift * WEIGHT_VOLATILITY
            + sentiment_drift * WEIGHT_SENTIMENT;

        Self {
            symbol: symbol.into(),
            price_drift,
            volume_drift,
            volatility_drift,
            sentiment_drift,
            composite_score,
            severity: grade_composite(composite_score),
            sampled_at: Utc::now(),
        }
    }

    /// True when the composite drift is large enough that the original
    /// analysis should be redone.
    pub fn requires_reanalysis(&self) -> bool {
        self.composite_score > COMPOSITE_HIGH
    }
}

/// Composite score to severity grade.
pub fn grade_composite(composite: f64) -> Severity {
    if composite > COMPOSITE_CRITICAL {
        Severity::Critical
    } else if composite > COMPOSITE_HIGH {
        Severity::High
    } else if composite > COMPOSITE_MEDIUM {
        Severity::Medium
    } else {
        Severity::Low
    }
}

// =============================================================================
// DriftAlert
// =============================================================================

/// Dimension (or composite) that tripped an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftKind {
    Price,
    Volume,
    Volatility,
    Sentiment,
    Composite,
}

impl std::fmt::Display for DriftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Price => write!(f, "PRICE"),
            Self::Volume => write!(f, "VOLUME"),
            Self::Volatility => write!(f, "VOLATILITY"),
            Self::Sentiment => write!(f, "SENTIMENT"),
            Self::Composite => write!(f, "COMPOSITE"),
        }
    }
}

/// A persisted, published drift alert. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlert {
    pub alert_id: String,
    pub analysis_id: String,
    pub symbol: String,
    pub kind: DriftKind,
    pub severity: Severity,
    pub message: String,
    pub snapshot: DriftSnapshot,
    pub triggered_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_blends_with_documented_weights() {
        let snap = DriftSnapshot::from_dimensions("AAPL", 0.10, 0.20, 0.30, 0.40);
        let expected = 0.10 * 0.40 + 0.20 * 0.25 + 0.30 * 0.20 + 0.40 * 0.15;
        assert!((snap.composite_score - expected).abs() < 1e-12);
    }

    #[test]
    fn severity_grades_follow_boundaries() {
        assert_eq!(grade_composite(0.10), Severity::Low);
        assert_eq!(grade_composite(0.15), Severity::Low);
        assert_eq!(grade_composite(0.16), Severity::Medium);
        assert_eq!(grade_composite(0.26), Severity::High);
        assert_eq!(grade_composite(0.36), Severity::Critical);
    }

    #[test]
    fn severity_is_monotonic_in_drift() {
        // Same inputs except a larger price drift never lowers the grade.
        let lo = DriftSnapshot::from_dimensions("AAPL", 0.05, 0.1, 0.1, 0.0);
        let hi = DriftSnapshot::from_dimensions("AAPL", 0.50, 0.1, 0.1, 0.0);
        assert!(hi.severity >= lo.severity);
        assert!(hi.composite_score > lo.composite_score);
    }

    #[test]
    fn reanalysis_flag_tracks_high_threshold() {
        let calm = DriftSnapshot::from_dimensions("AAPL", 0.01, 0.01, 0.01, 0.0);
        assert!(!calm.requires_reanalysis());
        let moved = DriftSnapshot::from_dimensions("AAPL", 0.60, 0.30, 0.10, 0.0);
        assert!(moved.requires_reanalysis());
    }
}
