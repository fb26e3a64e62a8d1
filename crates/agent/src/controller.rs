//! The per-message agent loop: model round-trips, tool execution through the
//! gateway, visual verification, and bounded retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webpilot_core::types::{ChatMessage, ContentBlock, ToolCallRequest};
use webpilot_core::{AgentDefaults, AgentEvent, Error, EventSink, Result, VisionConfig};
use webpilot_gateway::ToolExecutor;
use webpilot_providers::{MappedAction, ModelStrategy};
use webpilot_vision::diff::compare_frames;
use webpilot_vision::FrameCache;

use crate::history::ConversationHistory;
use crate::recorder::Recorder;

/// Tools whose effect needs a longer settle before the frame cache is read.
const NAVIGATION_TOOLS: &[&str] = &["navigate", "back", "forward", "refresh"];
const TYPING_TOOLS: &[&str] = &["type", "press_key", "select"];
/// Tools that observe the page without mutating it; comparison is skipped.
const READ_ONLY_TOOLS: &[&str] = &["screenshot", "get_url", "get_title", "get_text", "get_page_info"];

/// Runs one user message to completion: `IDLE → RUNNING ⇄ EXECUTING_TOOLS →
/// DONE | CANCELLED | FAILED`. Owns no connection state; depends on the
/// executor and strategy seams only.
pub struct AgentController {
    strategy: Arc<dyn ModelStrategy>,
    executor: Arc<dyn ToolExecutor>,
    cache: Arc<FrameCache>,
    recorder: Arc<Recorder>,
    sink: EventSink,
    agent: AgentDefaults,
    vision: VisionConfig,
}

impl AgentController {
    pub fn new(
        strategy: Arc<dyn ModelStrategy>,
        executor: Arc<dyn ToolExecutor>,
        cache: Arc<FrameCache>,
        recorder: Arc<Recorder>,
        sink: EventSink,
        agent: AgentDefaults,
        vision: VisionConfig,
    ) -> Self {
        Self {
            strategy,
            executor,
            cache,
            recorder,
            sink,
            agent,
            vision,
        }
    }

    /// Drive one user message through the loop until the model produces a
    /// final answer, a bound is exceeded, or the run is cancelled.
    /// Cancellation is polled at the top of each iteration and again before
    /// every tool execution.
    pub async fn run_turn(
        &self,
        history: &mut ConversationHistory,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        history.push(ChatMessage::user(user_text));
        let tools = self.executor.list_tools();
        let limit = self.agent.max_consecutive_tool_errors;
        let mut consecutive_errors = 0u32;

        for iteration in 0..self.agent.max_tool_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "Run cancelled before model round-trip");
                return Err(Error::Cancelled);
            }

            debug!(iteration, history_len = history.len(), "Model round-trip");
            let response = self.strategy.chat(history.as_slice(), &tools).await?;

            if let Some(text) = &response.text {
                if !text.is_empty() {
                    self.sink
                        .emit(AgentEvent::AssistantMessage { text: text.clone() });
                }
            }

            let mut assistant = ChatMessage::assistant(response.text.as_deref().unwrap_or(""));
            if !response.actions.is_empty() {
                assistant.tool_calls = Some(response.actions.clone());
            }
            history.push(assistant);

            if response.actions.is_empty() {
                if !response.finished {
                    // Truncated reply (e.g. max_tokens) with no actions: one
                    // continuation prompt, against the iteration budget
                    warn!(iteration, "Reply stopped without a terminal stop, asking to continue");
                    history.push(ChatMessage::user(
                        "Your previous reply was cut off before it finished. \
                         Continue from where it stopped.",
                    ));
                    continue;
                }
                let answer = response.text.unwrap_or_default();
                history.strip_images(0);
                history.prune(self.agent.max_history_turns);
                info!(iteration, "Run finished with final answer");
                return Ok(answer);
            }

            // Track how many calls got a tool result so an interrupted turn
            // can be closed before the error propagates
            let mut answered = 0usize;
            let mut interrupted: Option<Error> = None;

            for call in &response.actions {
                if cancel.is_cancelled() {
                    info!(tool = %call.name, "Run cancelled before tool execution");
                    interrupted = Some(Error::Cancelled);
                    break;
                }

                match self.strategy.map_action(call) {
                    MappedAction::Validation {
                        description,
                        passed,
                        reason,
                    } => {
                        self.recorder.record_validation(&description, passed, reason);
                        let mut msg = ChatMessage::tool_result(&call.id, "Validation recorded.");
                        msg.name = Some(call.name.clone());
                        history.push(msg);
                        answered += 1;
                        consecutive_errors = 0;
                    }
                    MappedAction::Unrecognized { observation } => {
                        consecutive_errors += 1;
                        warn!(
                            action = %call.name,
                            consecutive_errors,
                            "Unrecognized action, returning corrective observation"
                        );
                        let mut msg = ChatMessage::tool_result(&call.id, &observation);
                        msg.name = Some(call.name.clone());
                        history.push(msg);
                        answered += 1;
                        if consecutive_errors >= limit {
                            interrupted = Some(Error::ConsecutiveToolErrorLimit(limit));
                            break;
                        }
                    }
                    MappedAction::Gateway { name, arguments } => {
                        match self.execute_action(history, call, &name, arguments).await {
                            Ok(success) => {
                                answered += 1;
                                if success {
                                    consecutive_errors = 0;
                                } else {
                                    consecutive_errors += 1;
                                    if consecutive_errors >= limit {
                                        interrupted =
                                            Some(Error::ConsecutiveToolErrorLimit(limit));
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                interrupted = Some(e);
                                break;
                            }
                        }
                    }
                }
            }

            if let Some(err) = interrupted {
                // Every requested call needs a matching tool result or the
                // next round-trip ships an unanswerable assistant turn
                for call in &response.actions[answered..] {
                    let mut msg = ChatMessage::tool_result(
                        &call.id,
                        "Run interrupted before this action completed.",
                    );
                    msg.name = Some(call.name.clone());
                    history.push(msg);
                }
                return Err(err);
            }
        }

        Err(Error::IterationLimitExceeded(self.agent.max_tool_iterations))
    }

    /// Execute one gateway tool call with pre/post frame comparison and fold
    /// the enriched result into history. Returns whether the tool itself
    /// succeeded; connection-class failures propagate as errors.
    async fn execute_action(
        &self,
        history: &mut ConversationHistory,
        call: &ToolCallRequest,
        name: &str,
        arguments: Value,
    ) -> Result<bool> {
        self.sink.emit(AgentEvent::ToolStarted {
            call_id: call.id.clone(),
            tool: name.to_string(),
        });

        // Interaction marker for the streamed view
        if name == "click" {
            let x = arguments.get("x").and_then(|v| v.as_u64());
            let y = arguments.get("y").and_then(|v| v.as_u64());
            if let (Some(x), Some(y)) = (x, y) {
                self.cache.set_marker(Some((x as u32, y as u32)));
            }
        } else if NAVIGATION_TOOLS.contains(&name) {
            self.cache.set_marker(None);
        }

        let before = self.cache.latest();
        let started = Instant::now();

        let mut result = match self.executor.call_tool(name, arguments.clone()).await {
            Ok(result) => result,
            Err(e) => {
                self.recorder.record_action(name, arguments, false);
                self.sink.emit(AgentEvent::ToolFailed {
                    call_id: call.id.clone(),
                    tool: name.to_string(),
                    error: e.to_string(),
                });
                if e.is_fatal_to_run() {
                    return Err(e);
                }
                let mut msg = ChatMessage::tool_result(
                    &call.id,
                    &format!("Tool execution failed: {}", e),
                );
                msg.name = Some(name.to_string());
                history.push(msg);
                return Ok(false);
            }
        };

        // Give the streamer a chance to capture the action's effect before
        // reading the cache
        let settle = self.settle_ms(name);
        if settle > 0 {
            tokio::time::sleep(Duration::from_millis(settle)).await;
        }
        let after = self.cache.latest();

        let verdict = if result.is_error || READ_ONLY_TOOLS.contains(&name) {
            None
        } else {
            match (&before, &after) {
                (Some(b), Some(a)) => Some(compare_frames(
                    &b.full_png,
                    &a.full_png,
                    self.threshold_for(name),
                    self.vision.aa_tolerance,
                )),
                _ => None,
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let success = !result.is_error;
        self.recorder.record_action(name, arguments, success);

        if success {
            self.sink.emit(AgentEvent::ToolSucceeded {
                call_id: call.id.clone(),
                tool: name.to_string(),
                duration_ms,
                change_percent: verdict
                    .as_ref()
                    .filter(|v| v.error.is_none())
                    .map(|v| v.percent_diff),
            });
        } else {
            self.sink.emit(AgentEvent::ToolFailed {
                call_id: call.id.clone(),
                tool: name.to_string(),
                error: result.text_content(),
            });
        }

        // A navigation that came back without a page snapshot gets one
        // follow-up screenshot so the model can see where it landed
        if success && NAVIGATION_TOOLS.contains(&name) && result.first_image().is_none() {
            match self.executor.call_tool("screenshot", serde_json::json!({})).await {
                Ok(snap) if !snap.is_error => {
                    if let Some((media_type, data_b64)) = snap.first_image() {
                        result.content.push(ContentBlock::Image {
                            media_type: media_type.to_string(),
                            data_b64: data_b64.to_string(),
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Follow-up snapshot failed, continuing without it");
                }
            }
        }

        let mut text = result.text_content();
        if !success && !text.is_empty() {
            text = format!("Error: {}", text);
        }
        if let Some(v) = &verdict {
            // An error verdict is "unknown", never "no change"
            let line = if let Some(err) = &v.error {
                format!("[visual comparison unavailable: {}]", err)
            } else if v.changed {
                format!("[page changed: {:.1}% of pixels]", v.percent_diff)
            } else {
                "[no visual change observed]".to_string()
            };
            text = if text.is_empty() {
                line
            } else {
                format!("{}\n{}", text, line)
            };
        }

        let mut msg = match result.first_image() {
            Some((media_type, data_b64)) => {
                ChatMessage::tool_result_with_image(&call.id, &text, media_type, data_b64)
            }
            None => ChatMessage::tool_result(&call.id, &text),
        };
        msg.name = Some(name.to_string());
        history.push(msg);

        Ok(success)
    }

    fn settle_ms(&self, tool: &str) -> u64 {
        if NAVIGATION_TOOLS.contains(&tool) {
            self.agent.settle_ms_navigation
        } else if TYPING_TOOLS.contains(&tool) {
            self.agent.settle_ms_typing
        } else {
            self.agent.settle_ms_default
        }
    }

    /// Text entry produces a subtle visual delta, so it gets the lower bar.
    fn threshold_for(&self, tool: &str) -> f64 {
        if TYPING_TOOLS.contains(&tool) {
            self.vision.text_entry_threshold_percent
        } else {
            self.vision.default_threshold_percent
        }
    }
}
