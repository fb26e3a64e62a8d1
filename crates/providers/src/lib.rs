//! Model strategies: one interchangeable implementation per supported model
//! family, behind the [`ModelStrategy`] interface the agent loop depends on.

pub mod anthropic;
pub mod factory;
pub mod gemini;
pub mod schema;
pub mod vision_text;

use async_trait::async_trait;
use serde_json::Value;

use webpilot_core::types::{ChatMessage, ToolCallRequest, ToolSpec};
use webpilot_core::{Error, Result};

pub use anthropic::AnthropicStrategy;
pub use factory::{create_strategy, infer_provider_from_model};
pub use gemini::GeminiStrategy;
pub use vision_text::VisionTextStrategy;

/// Pseudo-tool intercepted by the agent loop; never forwarded to the gateway.
/// The model calls it to assert a page condition with a pass/fail verdict.
pub const VALIDATION_TOOL: &str = "report_validation";

/// One model round-trip, normalized across the three response shapes.
#[derive(Debug, Clone)]
pub struct StrategyResponse {
    /// Narration / final-answer text, if any.
    pub text: Option<String>,
    /// Requested actions, in execution order.
    pub actions: Vec<ToolCallRequest>,
    /// The model signalled a terminal stop; text is the final answer.
    pub finished: bool,
}

/// What a requested action maps to once the strategy has interpreted it.
#[derive(Debug, Clone)]
pub enum MappedAction {
    /// Forward to the gateway as-is.
    Gateway { name: String, arguments: Value },
    /// Validation assertion, recorded by the loop and answered locally.
    Validation {
        description: String,
        passed: bool,
        reason: Option<String>,
    },
    /// The strategy could not interpret the action; the observation goes back
    /// to the model as a corrective tool result.
    Unrecognized { observation: String },
}

#[async_trait]
pub trait ModelStrategy: Send + Sync + std::fmt::Debug {
    /// One model round-trip with the current context and tool catalog.
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<StrategyResponse>;

    /// Interpret one requested action. Pure; called by the loop before every
    /// execution.
    fn map_action(&self, call: &ToolCallRequest) -> MappedAction;

    fn name(&self) -> &'static str;
}

/// The validation pseudo-tool declaration advertised to every model family.
pub fn validation_tool_spec() -> ToolSpec {
    ToolSpec {
        name: VALIDATION_TOOL.to_string(),
        description: Some(
            "Record the outcome of a validation check against the current page. \
             Call this exactly once per assertion before continuing."
                .to_string(),
        ),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "What was checked"
                },
                "result": {
                    "type": "string",
                    "enum": ["pass", "fail"],
                    "description": "Verdict of the check"
                },
                "reason": {
                    "type": "string",
                    "description": "Why the check failed (only when result is fail)"
                }
            },
            "required": ["description", "result"]
        }),
    }
}

/// Map a non-success provider response to the error taxonomy. Rejections that
/// point at the context window surface as `ContextOverflow` so the session
/// can clear history instead of retrying blindly.
pub(crate) fn classify_api_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let lowered = body.to_lowercase();
    let overflow = lowered.contains("context_length_exceeded")
        || lowered.contains("prompt is too long")
        || lowered.contains("exceeds the maximum number of tokens")
        || lowered.contains("input token count exceeds");
    if overflow {
        return Error::ContextOverflow(format!("{} rejected the request ({})", provider, status));
    }
    Error::Provider(format!("{} API error {}: {}", provider, status, body))
}

/// Shared interpretation for the structured strategies: intercept the
/// validation pseudo-tool, pass everything else through to the gateway.
pub(crate) fn map_structured_action(call: &ToolCallRequest) -> MappedAction {
    if call.name == VALIDATION_TOOL {
        let description = call
            .arguments
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("(unspecified check)")
            .to_string();
        let passed = call
            .arguments
            .get("result")
            .and_then(|v| v.as_str())
            .map(|r| r.eq_ignore_ascii_case("pass"))
            .unwrap_or(false);
        let reason = call
            .arguments
            .get("reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        return MappedAction::Validation {
            description,
            passed,
            reason,
        };
    }
    MappedAction::Gateway {
        name: call.name.clone(),
        arguments: call.arguments.clone(),
    }
}
