// =============================================================================
// Shared types used across the Meridian research engine
// =============================================================================
//
// The five-point recommendation scale is the common currency of the whole
// pipeline: every agent signal is eventually normalized onto it, the
// consensus engine votes over it, and the synthesis stage derives the final
// trade plan from it.
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Recommendation scale
// =============================================================================

/// Canonical five-point recommendation scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Recommendation {
    /// All variants, in bullish-to-bearish order.
    pub const ALL: [Recommendation; 5] = [
        Self::StrongBuy,
        Self::Buy,
        Self::Hold,
        Self::Sell,
        Self::StrongSell,
    ];

    /// Map the class to a scalar: STRONG_BUY=1.0 .. STRONG_SELL=0.0.
    pub fn score(&self) -> f64 {
        match self {
            Self::StrongBuy => 1.0,
            Self::Buy => 0.75,
            Self::Hold => 0.5,
            Self::Sell => 0.25,
            Self::StrongSell => 0.0,
        }
    }

    /// Bucket a consensus score back onto the scale.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.875 {
            Self::StrongBuy
        } else if score >= 0.625 {
            Self::Buy
        } else if score >= 0.375 {
            Self::Hold
        } else if score >= 0.125 {
            Self::Sell
        } else {
            Self::StrongSell
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::StrongBuy | Self::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Self::StrongSell | Self::Sell)
    }

    /// True when both recommendations point the same way (both BUY variants,
    /// both SELL variants, or both HOLD).
    pub fn same_direction(&self, other: &Recommendation) -> bool {
        (self.is_buy() && other.is_buy())
            || (self.is_sell() && other.is_sell())
            || (*self == Self::Hold && *other == Self::Hold)
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBuy => write!(f, "STRONG_BUY"),
            Self::Buy => write!(f, "BUY"),
            Self::Hold => write!(f, "HOLD"),
            Self::Sell => write!(f, "SELL"),
            Self::StrongSell => write!(f, "STRONG_SELL"),
        }
    }
}

// =============================================================================
// Agent-native signal labels
// =============================================================================

/// Sentiment vocabulary emitted by sentiment-flavoured agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Bullish,
    Positive,
    Neutral,
    Negative,
    Bearish,
}

/// Risk-level vocabulary emitted by the risk agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RiskLevel {
    /// Parse a loosely formatted risk label ("high", "VERY_HIGH", "Very High").
    pub fn parse(label: &str) -> Option<Self> {
        let normalized: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        match normalized.as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" | "MODERATE" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "VERYHIGH" | "EXTREME" => Some(Self::VeryHigh),
            _ => None,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::High | Self::VeryHigh)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::VeryHigh => write!(f, "VERY_HIGH"),
        }
    }
}

/// A heterogeneous agent signal before normalization.
///
/// Agents speak different dialects: the technical agent emits the five-point
/// scale directly, the sentiment agent emits `bullish`/`bearish` labels or a
/// numeric score in [-1, 1], the risk agent emits a risk level. The `Label`
/// variant is the explicit fallback for anything unrecognized; normalization
/// maps it by substring or defaults to HOLD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    Scale(Recommendation),
    Sentiment(SentimentLabel),
    Risk(RiskLevel),
    Score(f64),
    Label(String),
}

impl Signal {
    /// Normalize onto the canonical five-point scale.
    pub fn canonical(&self) -> Recommendation {
        match self {
            Self::Scale(rec) => *rec,
            Self::Sentiment(label) => match label {
                SentimentLabel::Bullish | SentimentLabel::Positive => Recommendation::Buy,
                SentimentLabel::Neutral => Recommendation::Hold,
                SentimentLabel::Bearish | SentimentLabel::Negative => Recommendation::Sell,
            },
            Self::Risk(level) => match level {
                RiskLevel::Low => Recommendation::Buy,
                RiskLevel::Medium => Recommendation::Hold,
                RiskLevel::High => Recommendation::Sell,
                RiskLevel::VeryHigh => Recommendation::StrongSell,
            },
            Self::Score(score) => {
                if *score > 0.3 {
                    Recommendation::Buy
                } else if *score < -0.3 {
                    Recommendation::Sell
                } else {
                    Recommendation::Hold
                }
            }
            Self::Label(raw) => {
                let upper = raw.to_uppercase();
                if upper.contains("STRONG_BUY") || upper.contains("STRONG BUY") {
                    Recommendation::StrongBuy
                } else if upper.contains("STRONG_SELL") || upper.contains("STRONG SELL") {
                    Recommendation::StrongSell
                } else if upper.contains("BUY") {
                    Recommendation::Buy
                } else if upper.contains("SELL") {
                    Recommendation::Sell
                } else {
                    // Unknown labels never abort the pipeline.
                    Recommendation::Hold
                }
            }
        }
    }
}

// =============================================================================
// Lifecycle enums
// =============================================================================

/// Lifecycle of an analysis record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of a single agent execution inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Investment horizon attached to a final artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

/// Graded drift severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// =============================================================================
// Unit-tagged numerics
// =============================================================================

/// Measurement unit carried with every numeric in a final artifact.
///
/// A bare f64 cannot tell a stop price from a VaR dollar figure, so
/// structured values carry the unit through serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Usd,
    Percent,
    Ratio,
    Shares,
}

/// A numeric value with its unit and a short human description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitValue {
    pub value: f64,
    pub unit: Unit,
    pub description: String,
}

impl UnitValue {
    pub fn usd(value: f64, description: impl Into<String>) -> Self {
        Self {
            value,
            unit: Unit::Usd,
            description: description.into(),
        }
    }

    pub fn percent(value: f64, description: impl Into<String>) -> Self {
        Self {
            value,
            unit: Unit::Percent,
            description: description.into(),
        }
    }

    pub fn ratio(value: f64, description: impl Into<String>) -> Self {
        Self {
            value,
            unit: Unit::Ratio,
            description: description.into(),
        }
    }

    pub fn shares(value: f64, description: impl Into<String>) -> Self {
        Self {
            value,
            unit: Unit::Shares,
            description: description.into(),
        }
    }
}
