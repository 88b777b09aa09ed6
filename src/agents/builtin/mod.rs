// =============================================================================
// Standing agent roster
// =============================================================================
//
// Compact, indicator-driven implementations of the analysis fleet. Each one
// is an ordinary `Agent`: the orchestrator neither knows nor cares which of
// them are heuristic and which would be backed by an external model or data
// feed in a larger deployment — those run behind the same trait.
// =============================================================================

pub mod fundamental;
pub mod intel;
pub mod risk;
pub mod sentiment;
pub mod technical;
pub mod workers;

use std::sync::Arc;

use crate::agents::Agent;

/// The full fan-out roster, in consensus-weight order.
pub fn standing_roster() -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(fundamental::FundamentalAgent::default()),
        Arc::new(technical::TechnicalAgent::default()),
        Arc::new(risk::RiskAgent::default()),
        Arc::new(sentiment::SentimentAgent::default()),
        Arc::new(workers::PeerComparisonAgent),
        Arc::new(workers::InsiderActivityAgent),
        Arc::new(workers::PredictiveAgent),
        Arc::new(workers::ChartAnalyticsAgent),
        Arc::new(intel::NewsIntelligenceAgent),
        Arc::new(intel::MacroContextAgent),
        Arc::new(intel::CatalystTrackingAgent),
    ]
}
