// =============================================================================
// Agent Registry — dynamic dispatch by agent id
// =============================================================================
//
// The orchestrator consults the registry for the roster to fan out. Agents
// register as trait objects; `FnAgent` adapts a plain async closure so tests
// and embedders can register a function without defining a type.
//
// Registration order is preserved: agent executions appear in the analysis
// record in the order the roster was registered.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::agents::{Agent, AgentContext, AgentError, AgentOpinion};

/// Registry keyed by `agent_id`.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, Arc<dyn Agent>>,
    order: Vec<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the standing analysis roster.
    pub fn with_standing_roster() -> Self {
        let registry = Self::new();
        for agent in crate::agents::builtin::standing_roster() {
            registry.register(agent);
        }
        registry
    }

    /// Register an agent. Re-registering an id replaces the previous agent
    /// and keeps its position in the roster order.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        let mut inner = self.inner.write();
        if inner.agents.insert(id.clone(), agent).is_some() {
            warn!(agent_id = %id, "agent re-registered — replacing previous implementation");
        } else {
            inner.order.push(id.clone());
            debug!(agent_id = %id, "agent registered");
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.inner.read().agents.get(agent_id).cloned()
    }

    /// Roster ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// All agents in registration order.
    pub fn roster(&self) -> Vec<Arc<dyn Agent>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// FnAgent — closure adapter
// =============================================================================

type AgentFuture = Pin<Box<dyn Future<Output = Result<AgentOpinion, AgentError>> + Send>>;
type AgentFn = dyn Fn(AgentContext) -> AgentFuture + Send + Sync;

/// Adapts a `(context) -> AgentOpinion` function into an [`Agent`].
pub struct FnAgent {
    id: String,
    func: Box<AgentFn>,
}

impl FnAgent {
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Arc<Self>
    where
        F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentOpinion, AgentError>> + Send + 'static,
    {
        Arc::new(Self {
            id: id.into(),
            func: Box::new(move |ctx| Box::pin(func(ctx))),
        })
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOpinion, AgentError> {
        (self.func)(ctx.clone()).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Recommendation, Signal};

    fn stub(id: &'static str) -> Arc<dyn Agent> {
        FnAgent::new(id, move |ctx: AgentContext| async move {
            Ok(AgentOpinion::new(
                id,
                ctx.symbol,
                Signal::Scale(Recommendation::Hold),
                0.5,
            ))
        })
    }

    #[test]
    fn registration_order_is_preserved() {
        let registry = AgentRegistry::new();
        registry.register(stub("fundamental"));
        registry.register(stub("technical"));
        registry.register(stub("risk"));
        assert_eq!(registry.ids(), vec!["fundamental", "technical", "risk"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn reregistration_replaces_in_place() {
        let registry = AgentRegistry::new();
        registry.register(stub("technical"));
        registry.register(stub("risk"));
        registry.register(stub("technical"));
        assert_eq!(registry.ids(), vec!["technical", "risk"]);
    }

    #[tokio::test]
    async fn fn_agent_dispatches() {
        let registry = AgentRegistry::new();
        registry.register(stub("sentiment"));

        let agent = registry.get("sentiment").unwrap();
        let ctx = AgentContext::new("AAPL");
        let opinion = agent.analyze(&ctx).await.unwrap();
        assert_eq!(opinion.agent_id, "sentiment");
        assert_eq!(opinion.symbol, "AAPL");
    }

    #[test]
    fn standing_roster_is_complete() {
        let registry = AgentRegistry::with_standing_roster();
        let ids = registry.ids();
        for expected in [
            "fundamental",
            "technical",
            "risk",
            "sentiment",
            "peer_comparison",
            "insider_activity",
            "predictive",
            "chart_analytics",
            "news",
            "macro",
            "catalyst",
        ] {
            assert!(ids.contains(&expected.to_string()), "missing {expected}");
        }
    }
}
