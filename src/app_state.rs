// =============================================================================
// Central Application State — Meridian Research Engine
// =============================================================================
//
// The single source of truth wiring the engine together: configuration, the
// result store, the progress bus, the agent registry, and the orchestrator.
// All API handlers and background loops hold an `Arc<AppState>`.
//
// Thread safety:
//   - parking_lot::RwLock around the hot-reloadable config.
//   - Subsystems manage their own interior mutability behind Arcs.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use crate::agents::AgentRegistry;
use crate::market::MarketFetcher;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressBus;
use crate::runtime_config::RuntimeConfig;
use crate::store::ResultStore;

pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<ResultStore>,
    pub bus: Arc<ProgressBus>,
    pub registry: Arc<AgentRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    /// Instant when the engine was started. Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire up the full engine around the given fetcher. The returned state
    /// is shared across the API server and background loops.
    pub fn new(config: RuntimeConfig, fetcher: Arc<dyn MarketFetcher>) -> Arc<Self> {
        let runtime_config = Arc::new(RwLock::new(config));
        let store = Arc::new(ResultStore::new());
        let backlog = runtime_config.read().progress_backlog;
        let bus = Arc::new(ProgressBus::new(backlog));
        let registry = Arc::new(AgentRegistry::with_standing_roster());

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&registry),
            fetcher,
            Arc::clone(&runtime_config),
        ));

        Arc::new(Self {
            runtime_config,
            store,
            bus,
            registry,
            orchestrator,
            start_time: std::time::Instant::now(),
        })
    }
}
