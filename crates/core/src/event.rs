use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Push-style notification drained by the UI boundary layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolStarted {
        call_id: String,
        tool: String,
    },
    ToolSucceeded {
        call_id: String,
        tool: String,
        duration_ms: u64,
        /// Visual change percentage, absent when comparison was skipped.
        change_percent: Option<f64>,
    },
    ToolFailed {
        call_id: String,
        tool: String,
        error: String,
    },
    /// Raw assistant narration text, emitted as the model produces it.
    AssistantMessage {
        text: String,
    },
    FrameCaptured {
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
    },
}

/// Fire-and-forget event sink. A slow or absent consumer never blocks the
/// orchestration core; events are dropped when the channel is full.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything (headless runs, tests).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "Event dropped (consumer slow or gone)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_drain() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx);
        sink.emit(AgentEvent::ToolStarted {
            call_id: "c1".into(),
            tool: "navigate".into(),
        });
        match rx.recv().await {
            Some(AgentEvent::ToolStarted { tool, .. }) => assert_eq!(tool, "navigate"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_disabled_sink_never_panics() {
        let sink = EventSink::disabled();
        sink.emit(AgentEvent::AssistantMessage { text: "hi".into() });
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.emit(AgentEvent::AssistantMessage { text: "a".into() });
        // Second emit exceeds capacity; must not block or panic.
        sink.emit(AgentEvent::AssistantMessage { text: "b".into() });
    }
}
