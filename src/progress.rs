// =============================================================================
// Progress Bus — per-analysis ordered event broadcast
// =============================================================================
//
// One writer (the orchestrator, or the drift monitor for alerts), N readers.
// Each analysis gets its own bounded broadcast channel:
//
//   - Events are delivered in publish order per analysis (FIFO).
//   - Subscribers joining mid-run receive events from subscription onward.
//   - A subscriber that falls behind the bounded backlog is dropped
//     (`RecvError::Lagged` surfaces on its receiver); the publisher never
//     blocks on slow consumers.
//   - Delivery is at-least-once; consumers must be idempotent.
//
// There are no cross-analysis ordering guarantees: channels are independent.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::drift::DriftAlert;

// =============================================================================
// Events
// =============================================================================

/// One frame on the progress stream. Serializes to
/// `{"type": ..., "analysis_id": ..., "timestamp": ..., ...payload}`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub analysis_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    pub fn new(analysis_id: impl Into<String>, kind: ProgressEventKind) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Event vocabulary of the analysis lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    AnalysisStarted,
    PhaseStarted {
        phase: String,
    },
    AgentStarted {
        agent_id: String,
        symbol: String,
    },
    AgentCompleted {
        agent_id: String,
        symbol: String,
        elapsed_ms: u64,
    },
    AgentFailed {
        agent_id: String,
        symbol: String,
        error: String,
    },
    ProgressUpdate {
        percentage: u8,
        phase: String,
        active: Vec<String>,
        completed: Vec<String>,
        pending: Vec<String>,
    },
    SynthesisStarted,
    CritiqueStarted,
    AnalysisCompleted,
    AnalysisFailed {
        error: String,
    },
    DriftAlert {
        alert: DriftAlert,
    },
}

// =============================================================================
// ProgressBus
// =============================================================================

/// Per-analysis broadcast channels behind one shared handle.
pub struct ProgressBus {
    channels: RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    /// Channel capacity; the per-subscriber backlog bound.
    backlog: usize,
}

impl ProgressBus {
    pub fn new(backlog: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            backlog: backlog.max(1),
        }
    }

    /// Publish an event under its analysis id. Lazily creates the channel so
    /// that the drift monitor can publish for analyses completed before any
    /// subscriber showed up. Returns the number of receivers reached.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let sender = self.sender_for(&event.analysis_id);
        // Err means no live subscribers; at-least-once only applies while
        // a consumer is connected.
        sender.send(event).unwrap_or(0)
    }

    /// Subscribe to one analysis's stream from this moment onward.
    pub fn subscribe(&self, analysis_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.sender_for(analysis_id).subscribe()
    }

    /// Drop the channel for a finished analysis once consumers are done.
    /// Existing receivers keep draining what was already published.
    pub fn retire(&self, analysis_id: &str) {
        if self.channels.write().remove(analysis_id).is_some() {
            debug!(analysis_id, "progress channel retired");
        }
    }

    pub fn active_channels(&self) -> usize {
        self.channels.read().len()
    }

    /// Ids of analyses that currently have a live channel.
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    fn sender_for(&self, analysis_id: &str) -> broadcast::Sender<ProgressEvent> {
        if let Some(sender) = self.channels.read().get(analysis_id) {
            return sender.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(analysis_id.to_string())
            .or_insert_with(|| broadcast::channel(self.backlog).0)
            .clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn update(analysis_id: &str, percentage: u8) -> ProgressEvent {
        ProgressEvent::new(
            analysis_id,
            ProgressEventKind::ProgressUpdate {
                percentage,
                phase: "agents".into(),
                active: vec![],
                completed: vec![],
                pending: vec![],
            },
        )
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = ProgressBus::new(64);
        let mut rx = bus.subscribe("a1");

        for pct in [10u8, 20, 30, 40] {
            bus.publish(update("a1", pct));
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            if let ProgressEventKind::ProgressUpdate { percentage, .. } = event.kind {
                seen.push(percentage);
            }
        }
        assert_eq!(seen, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn mid_run_subscriber_sees_only_later_events() {
        let bus = ProgressBus::new(64);
        let _early = bus.subscribe("a1");
        bus.publish(update("a1", 10));

        let mut late = bus.subscribe("a1");
        bus.publish(update("a1", 20));

        let event = late.recv().await.unwrap();
        match event.kind {
            ProgressEventKind::ProgressUpdate { percentage, .. } => assert_eq!(percentage, 20),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_is_cut_off() {
        let bus = ProgressBus::new(4);
        let mut rx = bus.subscribe("a1");

        for pct in 0..50u8 {
            bus.publish(update("a1", pct));
        }

        match rx.recv().await {
            Err(RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn analyses_are_isolated() {
        let bus = ProgressBus::new(16);
        let mut rx_a = bus.subscribe("a1");
        let _rx_b = bus.subscribe("a2");

        bus.publish(update("a2", 50));
        bus.publish(update("a1", 10));

        let event = rx_a.recv().await.unwrap();
        assert_eq!(event.analysis_id, "a1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = ProgressBus::new(16);
        assert_eq!(bus.publish(update("ghost", 1)), 0);
    }

    #[test]
    fn event_serializes_with_flat_type_tag() {
        let event = ProgressEvent::new("a1", ProgressEventKind::SynthesisStarted);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "synthesis_started");
        assert_eq!(json["analysis_id"], "a1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn retire_drops_channel() {
        let bus = ProgressBus::new(16);
        let _rx = bus.subscribe("a1");
        assert_eq!(bus.active_channels(), 1);
        bus.retire("a1");
        assert_eq!(bus.active_channels(), 0);
    }
}
