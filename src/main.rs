// =============================================================================
// Meridian Research Engine — Main Entry Point
// =============================================================================
//
// Multi-agent stock analysis orchestration service: submissions fan out over
// the analyst roster, consensus and synthesis produce the trade plan, and
// the drift monitor keeps watching completed analyses for staleness.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agents;
mod api;
mod app_state;
mod consensus;
mod drift;
mod indicators;
mod market;
mod orchestrator;
mod progress;
mod runtime_config;
mod store;
mod synthesis;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::drift::DriftMonitor;
use crate::market::{HttpMarketProvider, MarketFetcher};
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Research Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for deployment knobs.
    if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(url) = std::env::var("MERIDIAN_PROVIDER_URL") {
        config.provider_base_url = url;
    }

    info!(
        bind_addr = %config.bind_addr,
        provider = %config.provider_base_url,
        per_agent_timeout_ms = config.per_agent_timeout_ms,
        global_parallelism = config.global_parallelism,
        "engine configuration resolved"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let fetcher: Arc<dyn MarketFetcher> =
        Arc::new(HttpMarketProvider::new(config.provider_base_url.clone()));
    let state = AppState::new(config, Arc::clone(&fetcher));

    info!(
        agents = state.registry.len(),
        "agent roster registered"
    );

    // ── 3. Drift monitor loop ────────────────────────────────────────────
    let monitor = Arc::new(DriftMonitor::new(
        Arc::clone(&state.store),
        Arc::clone(&state.bus),
        fetcher,
        Arc::clone(&state.runtime_config),
    ));
    tokio::spawn(monitor.run());

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr = state.runtime_config.read().bind_addr.clone();
    let api_state = Arc::clone(&state);
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Meridian Research Engine shut down complete.");
    Ok(())
}
