//! The session wires every component together for one chat conversation:
//! gateway, health probe, model strategy, screenshot streamer, recorder, and
//! the agent loop. The UI boundary talks to the session only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use webpilot_core::types::{ActionLogEntry, ConnectionState, ValidationRecord, ValidationResult};
use webpilot_core::{Config, Error, EventSink, Result};
use webpilot_gateway::{AutomationGateway, ToolExecutor};
use webpilot_providers::{create_strategy, ModelStrategy};
use webpilot_vision::{FrameCache, FrameSource, ScreenshotStreamer, StreamerHandle};

use crate::controller::AgentController;
use crate::history::ConversationHistory;
use crate::recorder::Recorder;

const SYSTEM_PROMPT: &str = "\
You are a browser automation assistant. You control a real web browser through \
the provided tools. Work in small steps: take an action, inspect the resulting \
page snapshot, then decide the next action. Prefer reading what is actually on \
the page over assuming. When the user asks you to verify something, use the \
report_validation tool to record an explicit pass or fail before answering. \
When the task is complete, reply with a short summary and no further tool calls.";

/// Pulls frames through the gateway's screenshot tool.
struct GatewayFrameSource {
    executor: Arc<dyn ToolExecutor>,
}

#[async_trait]
impl FrameSource for GatewayFrameSource {
    async fn capture_png(&self) -> Result<Vec<u8>> {
        let result = self
            .executor
            .call_tool("screenshot", serde_json::json!({}))
            .await?;
        if result.is_error {
            return Err(Error::ToolExecution(result.text_content()));
        }
        let (_media_type, data_b64) = result
            .first_image()
            .ok_or_else(|| Error::ToolExecution("screenshot returned no image".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|e| Error::ToolExecution(format!("invalid screenshot payload: {}", e)))
    }
}

/// Marks a run as active for its lifetime; releases the slot on drop so a
/// panicking or cancelled run never wedges the session.
#[derive(Debug)]
struct RunSlot<'a> {
    active: &'a AtomicBool,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

fn acquire_run_slot(active: &AtomicBool) -> Result<RunSlot<'_>> {
    if active.swap(true, Ordering::SeqCst) {
        return Err(Error::RunInProgress);
    }
    Ok(RunSlot { active })
}

/// One connected chat session. At most one message is processed at a time;
/// concurrent submissions are rejected with [`Error::RunInProgress`].
pub struct Session {
    gateway: Arc<AutomationGateway>,
    strategy: Arc<dyn ModelStrategy>,
    recorder: Arc<Recorder>,
    controller: AgentController,
    history: Mutex<ConversationHistory>,
    run_active: AtomicBool,
    current_run: StdMutex<Option<CancellationToken>>,
    streamer: StreamerHandle,
    health: CancellationToken,
}

impl Session {
    /// Spawn the automation process, probe it, start the health monitor and
    /// the screenshot streamer, and build the strategy from config.
    pub async fn connect(config: Config, sink: EventSink) -> Result<Self> {
        let gateway = Arc::new(AutomationGateway::new(config.gateway.clone()));
        gateway.initialize().await?;
        let health = gateway.spawn_health_probe();

        let strategy = create_strategy(&config)?;
        info!(provider = strategy.name(), model = %config.agent.model, "Session connected");

        let cache = Arc::new(FrameCache::new());
        let recorder = Arc::new(Recorder::new());
        let executor: Arc<dyn ToolExecutor> = gateway.clone();
        let source: Arc<dyn FrameSource> = Arc::new(GatewayFrameSource {
            executor: executor.clone(),
        });
        let streamer = ScreenshotStreamer::new(
            config.streamer.clone(),
            config.vision.aa_tolerance,
            source,
            cache.clone(),
            sink.clone(),
        )
        .spawn();

        let controller = AgentController::new(
            strategy.clone(),
            executor,
            cache,
            recorder.clone(),
            sink,
            config.agent.clone(),
            config.vision.clone(),
        );

        Ok(Self {
            gateway,
            strategy,
            recorder,
            controller,
            history: Mutex::new(ConversationHistory::with_system_prompt(SYSTEM_PROMPT)),
            run_active: AtomicBool::new(false),
            current_run: StdMutex::new(None),
            streamer,
            health,
        })
    }

    /// Run one user message through the agent loop to completion.
    pub async fn process_message(&self, text: &str) -> Result<String> {
        let _slot = acquire_run_slot(&self.run_active)?;
        let token = CancellationToken::new();
        *self
            .current_run
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let result = {
            let mut history = self.history.lock().await;
            let result = self.controller.run_turn(&mut history, text, &token).await;
            if matches!(&result, Err(Error::ContextOverflow(_))) {
                // The provider rejected the history size; start the next
                // message from a clean slate
                history.clear();
                warn!("Context overflow, conversation history cleared");
            }
            result
        };

        *self
            .current_run
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        if let Err(e) = &result {
            warn!(error = %e, "Run ended with error");
        }
        result
    }

    /// Cancel the in-flight run, if any. Returns whether one was active.
    pub fn cancel_execution(&self) -> bool {
        let guard = self
            .current_run
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(token) => {
                info!("Cancelling active run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.gateway.state()
    }

    pub fn action_log(&self) -> Vec<ActionLogEntry> {
        self.recorder.actions()
    }

    pub fn validations(&self) -> Vec<ValidationRecord> {
        self.recorder.validations()
    }

    pub fn clear_action_log(&self) {
        self.recorder.clear();
    }

    pub fn replay_script(&self) -> String {
        self.recorder.replay_script()
    }

    /// Summary counters for the current recording.
    pub fn playbook_status(&self) -> serde_json::Value {
        let actions = self.recorder.actions();
        let validations = self.recorder.validations();
        let passed = validations
            .iter()
            .filter(|v| v.result == ValidationResult::Pass)
            .count();
        serde_json::json!({
            "actions": actions.len(),
            "actionsFailed": actions.iter().filter(|a| !a.success).count(),
            "validations": {
                "total": validations.len(),
                "passed": passed,
                "failed": validations.len() - passed,
            },
        })
    }

    /// Drop everything but the system prompt.
    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    pub fn streamer(&self) -> &StreamerHandle {
        &self.streamer
    }

    /// Orderly teardown: streamer first, then the health probe, then the
    /// automation process.
    pub async fn shutdown(&self) {
        self.streamer.stop();
        self.health.cancel();
        self.gateway.shutdown().await;
        info!("Session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use webpilot_core::types::{ContentBlock, ToolResult, ToolSpec};

    struct CannedExecutor {
        result: ToolResult,
    }

    #[async_trait]
    impl ToolExecutor for CannedExecutor {
        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<ToolResult> {
            Ok(self.result.clone())
        }

        fn list_tools(&self) -> Vec<ToolSpec> {
            vec![]
        }
    }

    #[tokio::test]
    async fn test_frame_source_decodes_screenshot() {
        let png = vec![0x89, 0x50, 0x4e, 0x47];
        let source = GatewayFrameSource {
            executor: Arc::new(CannedExecutor {
                result: ToolResult {
                    content: vec![ContentBlock::Image {
                        media_type: "image/png".into(),
                        data_b64: base64::engine::general_purpose::STANDARD.encode(&png),
                    }],
                    is_error: false,
                },
            }),
        };
        assert_eq!(source.capture_png().await.unwrap(), png);
    }

    #[tokio::test]
    async fn test_frame_source_rejects_imageless_result() {
        let source = GatewayFrameSource {
            executor: Arc::new(CannedExecutor {
                result: ToolResult::text("no image here"),
            }),
        };
        assert!(source.capture_png().await.is_err());
    }

    #[tokio::test]
    async fn test_frame_source_propagates_tool_error() {
        let source = GatewayFrameSource {
            executor: Arc::new(CannedExecutor {
                result: ToolResult::error("page crashed"),
            }),
        };
        let err = source.capture_png().await.unwrap_err();
        assert!(matches!(err, Error::ToolExecution(_)));
    }

    #[test]
    fn test_run_slot_is_exclusive_and_releases_on_drop() {
        let active = AtomicBool::new(false);
        let slot = acquire_run_slot(&active).unwrap();
        assert!(matches!(
            acquire_run_slot(&active).unwrap_err(),
            Error::RunInProgress
        ));
        drop(slot);
        assert!(acquire_run_slot(&active).is_ok());
    }
}
