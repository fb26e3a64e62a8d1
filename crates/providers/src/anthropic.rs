use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use webpilot_core::types::{ChatMessage, ToolCallRequest, ToolSpec};
use webpilot_core::{Error, Result};

use crate::schema::SchemaNode;
use crate::{
    map_structured_action, validation_tool_spec, MappedAction, ModelStrategy, StrategyResponse,
};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Structured tool-call strategy: the model returns typed `tool_use` blocks
/// and the loop runs until it signals a terminal stop reason.
#[derive(Debug)]
pub struct AnthropicStrategy {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicStrategy {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            api_base: api_base
                .unwrap_or(ANTHROPIC_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// Config may store "anthropic/claude-..." but the API expects the bare
    /// model name.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("anthropic/").unwrap_or(model)
    }

    /// Render the gateway catalog plus the validation pseudo-tool as
    /// Anthropic tool declarations.
    fn convert_tools(tools: &[ToolSpec]) -> Vec<Value> {
        tools
            .iter()
            .cloned()
            .chain(std::iter::once(validation_tool_spec()))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description.unwrap_or_default(),
                    "input_schema": SchemaNode::from_value(&tool.input_schema).to_json_schema(),
                })
            })
            .collect()
    }

    /// Convert an OpenAI-style `image_url` data-URL block to an Anthropic
    /// image block.
    fn convert_image_block(block: &Value) -> Option<Value> {
        let url = block
            .get("image_url")
            .and_then(|v| v.get("url"))
            .and_then(|v| v.as_str())?;
        let rest = url.strip_prefix("data:")?;
        let semi = rest.find(';')?;
        let mime = &rest[..semi];
        let data = rest[semi..].strip_prefix(";base64,")?;
        Some(serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": mime,
                "data": data
            }
        }))
    }

    /// Anthropic takes `system` as a top-level parameter, user/assistant
    /// alternation in `messages`, and tool results as user messages with
    /// `tool_result` content blocks (which may carry page screenshots).
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_text: Option<String> = None;
        let mut converted: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => {
                    let text = msg.content.as_str().unwrap_or("").to_string();
                    system_text = Some(match system_text {
                        Some(existing) => format!("{}\n\n{}", existing, text),
                        None => text,
                    });
                }
                "user" => {
                    if let Some(arr) = msg.content.as_array() {
                        let mut blocks: Vec<Value> = Vec::new();
                        for block in arr {
                            match block.get("type").and_then(|v| v.as_str()) {
                                Some("image_url") => {
                                    if let Some(img) = Self::convert_image_block(block) {
                                        blocks.push(img);
                                    }
                                }
                                _ => blocks.push(block.clone()),
                            }
                        }
                        converted.push(serde_json::json!({"role": "user", "content": blocks}));
                    } else {
                        let text = msg.content.as_str().unwrap_or("").to_string();
                        converted.push(serde_json::json!({"role": "user", "content": text}));
                    }
                }
                "assistant" => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = msg.content.as_str().unwrap_or("").to_string();
                    if !text.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": text}));
                    }
                    if let Some(tool_calls) = &msg.tool_calls {
                        for tc in tool_calls {
                            blocks.push(serde_json::json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            }));
                        }
                    }
                    if blocks.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": ""}));
                    }
                    converted.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
                "tool" => {
                    let tool_call_id = msg.tool_call_id.as_deref().unwrap_or("");
                    // Multi-part results keep their screenshot blocks
                    let result_content: Value = if let Some(arr) = msg.content.as_array() {
                        let blocks: Vec<Value> = arr
                            .iter()
                            .filter_map(|block| {
                                match block.get("type").and_then(|v| v.as_str()) {
                                    Some("image_url") => Self::convert_image_block(block),
                                    Some("text") => Some(block.clone()),
                                    _ => None,
                                }
                            })
                            .collect();
                        Value::Array(blocks)
                    } else {
                        Value::String(msg.content.as_str().unwrap_or("").to_string())
                    };

                    let result_block = serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": result_content,
                    });

                    // Merge with a preceding tool_result user message
                    if let Some(last) = converted.last_mut() {
                        if last.get("role").and_then(|v| v.as_str()) == Some("user") {
                            if let Some(arr) =
                                last.get_mut("content").and_then(|c| c.as_array_mut())
                            {
                                if arr
                                    .first()
                                    .and_then(|v| v.get("type"))
                                    .and_then(|v| v.as_str())
                                    == Some("tool_result")
                                {
                                    arr.push(result_block);
                                    continue;
                                }
                            }
                        }
                    }
                    converted.push(serde_json::json!({
                        "role": "user",
                        "content": [result_block],
                    }));
                }
                _ => {
                    let text = msg.content.as_str().unwrap_or("").to_string();
                    converted.push(serde_json::json!({"role": "user", "content": text}));
                }
            }
        }

        (system_text, converted)
    }
}

#[async_trait]
impl ModelStrategy for AnthropicStrategy {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<StrategyResponse> {
        let url = format!("{}/messages", self.api_base);
        let model = Self::normalize_model(&self.model);

        let (system, anthropic_messages) = Self::convert_messages(messages);
        let anthropic_tools = Self::convert_tools(tools);

        let mut request = serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": anthropic_messages,
            "tools": anthropic_tools,
        });
        if let Some(sys) = &system {
            request["system"] = Value::String(sys.clone());
        }

        info!(
            model = %model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            "Calling Anthropic API"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Anthropic request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Anthropic API error");
            return Err(crate::classify_api_error("anthropic", status, &raw_body));
        }
        debug!(body_len = raw_body.len(), "Anthropic raw response");

        let resp: AnthropicResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let preview: String = raw_body.chars().take(500).collect();
            Error::Provider(format!(
                "Failed to parse Anthropic response: {}. Body: {}",
                e, preview
            ))
        })?;

        Ok(parse_response(resp))
    }

    fn map_action(&self, call: &ToolCallRequest) -> MappedAction {
        map_structured_action(call)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

fn parse_response(resp: AnthropicResponse) -> StrategyResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut actions: Vec<ToolCallRequest> = Vec::new();

    for block in &resp.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(text) = &block.text {
                    if !text.is_empty() {
                        text_parts.push(text.clone());
                    }
                }
            }
            "tool_use" => {
                if let (Some(id), Some(name)) = (&block.id, &block.name) {
                    actions.push(ToolCallRequest {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: block
                            .input
                            .clone()
                            .unwrap_or(Value::Object(serde_json::Map::new())),
                    });
                }
            }
            _ => {}
        }
    }

    let finished = actions.is_empty() && resp.stop_reason.as_deref() != Some("max_tokens");
    info!(
        actions = actions.len(),
        stop_reason = resp.stop_reason.as_deref().unwrap_or("none"),
        "Anthropic response parsed"
    );

    StrategyResponse {
        text: if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        },
        actions,
        finished,
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VALIDATION_TOOL;

    fn click_spec() -> ToolSpec {
        ToolSpec {
            name: "click".into(),
            description: Some("Click at coordinates".into()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer"},
                    "y": {"type": "integer"}
                },
                "required": ["x", "y"]
            }),
        }
    }

    #[test]
    fn test_convert_tools_appends_validation() {
        let converted = AnthropicStrategy::convert_tools(&[click_spec()]);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["name"], "click");
        assert_eq!(converted[0]["input_schema"]["type"], "object");
        assert_eq!(converted[1]["name"], VALIDATION_TOOL);
    }

    #[test]
    fn test_convert_messages_system_and_tool_result() {
        let mut assistant = ChatMessage::assistant("clicking now");
        assistant.tool_calls = Some(vec![ToolCallRequest {
            id: "tc_1".into(),
            name: "click".into(),
            arguments: serde_json::json!({"x": 1, "y": 2}),
        }]);
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("click the button"),
            assistant,
            ChatMessage::tool_result("tc_1", "clicked"),
        ];

        let (system, msgs) = AnthropicStrategy::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["content"][1]["type"], "tool_use");
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[2]["content"][0]["tool_use_id"], "tc_1");
    }

    #[test]
    fn test_tool_result_with_screenshot_converts_image() {
        let messages = vec![ChatMessage::tool_result_with_image(
            "tc_1", "navigated", "image/png", "aGk=",
        )];
        let (_, msgs) = AnthropicStrategy::convert_messages(&messages);
        let blocks = msgs[0]["content"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
        assert_eq!(blocks[1]["source"]["data"], "aGk=");
    }

    #[test]
    fn test_parse_response_with_tool_use() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "text", "text": "Opening the page."},
                    {"type": "tool_use", "id": "toolu_1", "name": "navigate",
                     "input": {"url": "https://example.com"}}
                ],
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();
        let parsed = parse_response(resp);
        assert_eq!(parsed.text.as_deref(), Some("Opening the page."));
        assert_eq!(parsed.actions.len(), 1);
        assert_eq!(parsed.actions[0].name, "navigate");
        assert!(!parsed.finished);
    }

    #[test]
    fn test_end_turn_without_actions_is_terminal() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "Done."}], "stop_reason": "end_turn"}"#,
        )
        .unwrap();
        let parsed = parse_response(resp);
        assert!(parsed.finished);
        assert_eq!(parsed.text.as_deref(), Some("Done."));
    }
}
