// =============================================================================
// Agent Runtime — one agent execution with deadline, retries, and events
// =============================================================================
//
// Wraps a single `Agent::analyze` call with:
//   1. An `agent_started` event before the first attempt.
//   2. A deadline spanning all attempts; expiry marks the execution
//      `timed_out` (timeouts are never retried).
//   3. Exponential backoff retries for transient and rate-limited failures
//      only; permanent failures and contract violations fail fast.
//   4. Opinion contract validation — a malformed return is a failure, not a
//      retry.
//   5. An `agent_completed` / `agent_failed` event with elapsed time.
//
// Failures never propagate: the caller always gets a terminal
// `AgentExecution` and decides what to do with the survivors.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{Agent, AgentContext, AgentError, AgentExecution, AgentOpinion};
use crate::progress::{ProgressBus, ProgressEvent, ProgressEventKind};
use crate::runtime_config::RuntimeConfig;
use crate::types::AgentStatus;

// =============================================================================
// Retry policy
// =============================================================================

/// Exponential backoff schedule for retryable agent failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_attempts: config.max_retries_per_agent.max(1),
            initial: Duration::from_millis(config.backoff_initial_ms),
            factor: config.backoff_factor,
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Sleep before attempt `attempt + 1` (attempts are 1-based):
    /// `initial * factor^(attempt-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        Duration::from_millis(millis as u64).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(1_000),
            factor: 1.75,
            cap: Duration::from_millis(10_000),
        }
    }
}

// =============================================================================
// AgentRuntime
// =============================================================================

pub struct AgentRuntime {
    deadline: Duration,
    policy: RetryPolicy,
}

impl AgentRuntime {
    pub fn new(deadline: Duration, policy: RetryPolicy) -> Self {
        Self { deadline, policy }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.per_agent_timeout_ms),
            RetryPolicy::from_config(config),
        )
    }

    /// Run one agent to a terminal `AgentExecution`, publishing start and
    /// finish events on the bus.
    pub async fn run(
        &self,
        analysis_id: &str,
        agent: Arc<dyn Agent>,
        ctx: Arc<AgentContext>,
        bus: &ProgressBus,
        cancel: &CancellationToken,
    ) -> AgentExecution {
        let agent_id = agent.id().to_string();
        let symbol = ctx.symbol.clone();
        let started_at = Utc::now();
        let start = std::time::Instant::now();

        bus.publish(ProgressEvent::new(
            analysis_id,
            ProgressEventKind::AgentStarted {
                agent_id: agent_id.clone(),
                symbol: symbol.clone(),
            },
        ));

        let mut attempts = 0;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Outcome::Cancelled),
            result = timeout(self.deadline, self.attempt_loop(&agent, &ctx, &mut attempts)) => {
                match result {
                    Ok(inner) => inner.map_err(Outcome::Failed),
                    Err(_elapsed) => Err(Outcome::TimedOut),
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let ended_at = Some(Utc::now());

        match outcome {
            Ok(opinion) => {
                info!(
                    analysis_id,
                    agent_id = %agent_id,
                    symbol = %symbol,
                    attempts,
                    elapsed_ms,
                    "agent completed"
                );
                bus.publish(ProgressEvent::new(
                    analysis_id,
                    ProgressEventKind::AgentCompleted {
                        agent_id: agent_id.clone(),
                        symbol: symbol.clone(),
                        elapsed_ms,
                    },
                ));
                AgentExecution {
                    agent_id,
                    symbol,
                    status: AgentStatus::Completed,
                    started_at,
                    ended_at,
                    attempts,
                    error: None,
                    output: Some(opinion),
                }
            }
            Err(outcome) => {
                let (status, error) = match outcome {
                    Outcome::TimedOut => (
                        AgentStatus::TimedOut,
                        format!("deadline of {:?} exceeded", self.deadline),
                    ),
                    Outcome::Cancelled => (AgentStatus::Failed, "cancelled".to_string()),
                    Outcome::Failed(err) => (AgentStatus::Failed, err.to_string()),
                };
                warn!(
                    analysis_id,
                    agent_id = %agent_id,
                    symbol = %symbol,
                    attempts,
                    elapsed_ms,
                    error = %error,
                    "agent did not complete"
                );
                bus.publish(ProgressEvent::new(
                    analysis_id,
                    ProgressEventKind::AgentFailed {
                        agent_id: agent_id.clone(),
                        symbol: symbol.clone(),
                        error: error.clone(),
                    },
                ));
                AgentExecution {
                    agent_id,
                    symbol,
                    status,
                    started_at,
                    ended_at,
                    attempts,
                    error: Some(error),
                    output: None,
                }
            }
        }
    }

    /// Attempt the agent until success, a non-retryable failure, or attempt
    /// exhaustion. The surrounding deadline bounds the whole loop.
    async fn attempt_loop(
        &self,
        agent: &Arc<dyn Agent>,
        ctx: &AgentContext,
        attempts: &mut u32,
    ) -> Result<AgentOpinion, AgentError> {
        loop {
            *attempts += 1;
            match agent.analyze(ctx).await {
                Ok(opinion) => {
                    opinion.validate()?;
                    return Ok(opinion);
                }
                Err(err) if err.is_retryable() && *attempts < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(*attempts);
                    debug!(
                        agent_id = agent.id(),
                        attempt = *attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable agent failure — backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

enum Outcome {
    Failed(AgentError),
    TimedOut,
    Cancelled,
}
