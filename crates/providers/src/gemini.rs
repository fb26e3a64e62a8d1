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
    VALIDATION_TOOL,
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Instruction appended to the system prompt. The validation rule is enforced
/// here, in instruction text, not mechanically by the loop.
const VALIDATION_INSTRUCTION: &str = "When asked to verify or validate a page condition, \
you MUST call the report_validation function exactly once per check, with result \"pass\" \
or \"fail\" and a reason when it fails, before taking any further action or finishing.";

/// Declarative tool-call strategy: zero or more parallel `functionCall` parts
/// per turn, all executed before the next round-trip.
#[derive(Debug)]
pub struct GeminiStrategy {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl GeminiStrategy {
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
                .unwrap_or(GEMINI_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("gemini/").unwrap_or(model)
    }

    /// Gateway catalog plus the mandatory validation declaration, rendered as
    /// Gemini function declarations.
    fn convert_tools(tools: &[ToolSpec]) -> Vec<Value> {
        let declarations: Vec<Value> = tools
            .iter()
            .cloned()
            .chain(std::iter::once(validation_tool_spec()))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description.unwrap_or_default(),
                    "parameters": SchemaNode::from_value(&tool.input_schema).to_gemini(),
                })
            })
            .collect();
        vec![serde_json::json!({"functionDeclarations": declarations})]
    }

    fn convert_image_part(block: &Value) -> Option<Value> {
        let url = block
            .get("image_url")
            .and_then(|v| v.get("url"))
            .and_then(|v| v.as_str())?;
        let rest = url.strip_prefix("data:")?;
        let semi = rest.find(';')?;
        let mime = &rest[..semi];
        let data = rest[semi..].strip_prefix(";base64,")?;
        Some(serde_json::json!({
            "inlineData": {"mimeType": mime, "data": data}
        }))
    }

    /// Gemini uses `user`/`model` roles, a separate system instruction, and
    /// tool results as `functionResponse` parts. Screenshot blocks in tool
    /// results become sibling `inlineData` parts.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_text: Option<String> = None;
        let mut contents: Vec<Value> = Vec::new();

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
                    let parts = if let Some(arr) = msg.content.as_array() {
                        let mut parts: Vec<Value> = Vec::new();
                        for block in arr {
                            match block.get("type").and_then(|v| v.as_str()) {
                                Some("text") => {
                                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                                        parts.push(serde_json::json!({"text": t}));
                                    }
                                }
                                Some("image_url") => {
                                    if let Some(p) = Self::convert_image_part(block) {
                                        parts.push(p);
                                    }
                                }
                                _ => {}
                            }
                        }
                        if parts.is_empty() {
                            parts.push(serde_json::json!({"text": ""}));
                        }
                        parts
                    } else {
                        vec![serde_json::json!({"text": msg.content.as_str().unwrap_or("")})]
                    };
                    contents.push(serde_json::json!({"role": "user", "parts": parts}));
                }
                "assistant" => {
                    let mut parts: Vec<Value> = Vec::new();
                    let text = msg.content.as_str().unwrap_or("").to_string();
                    if !text.is_empty() {
                        parts.push(serde_json::json!({"text": text}));
                    }
                    if let Some(tool_calls) = &msg.tool_calls {
                        for tc in tool_calls {
                            parts.push(serde_json::json!({
                                "functionCall": {"name": tc.name, "args": tc.arguments}
                            }));
                        }
                    }
                    if parts.is_empty() {
                        parts.push(serde_json::json!({"text": ""}));
                    }
                    contents.push(serde_json::json!({"role": "model", "parts": parts}));
                }
                "tool" => {
                    let tool_name = msg.name.as_deref().unwrap_or("tool");
                    let text = msg.text();
                    let response_value = serde_json::from_str::<Value>(&text)
                        .unwrap_or_else(|_| serde_json::json!({"result": text}));
                    let mut parts = vec![serde_json::json!({
                        "functionResponse": {
                            "name": tool_name,
                            "response": response_value,
                        }
                    })];
                    if let Some(arr) = msg.content.as_array() {
                        for block in arr {
                            if block.get("type").and_then(|v| v.as_str()) == Some("image_url") {
                                if let Some(p) = Self::convert_image_part(block) {
                                    parts.push(p);
                                }
                            }
                        }
                    }

                    // Merge parallel function responses into one user message
                    if let Some(last) = contents.last_mut() {
                        if last.get("role").and_then(|v| v.as_str()) == Some("user") {
                            if let Some(arr) =
                                last.get_mut("parts").and_then(|p| p.as_array_mut())
                            {
                                if arr.first().and_then(|v| v.get("functionResponse")).is_some() {
                                    arr.append(&mut parts);
                                    continue;
                                }
                            }
                        }
                    }
                    contents.push(serde_json::json!({"role": "user", "parts": parts}));
                }
                _ => {
                    contents.push(serde_json::json!({
                        "role": "user",
                        "parts": [{"text": msg.content.as_str().unwrap_or("")}],
                    }));
                }
            }
        }

        (system_text, contents)
    }
}

#[async_trait]
impl ModelStrategy for GeminiStrategy {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<StrategyResponse> {
        let model = Self::normalize_model(&self.model);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, model, self.api_key
        );

        let (system_instruction, contents) = Self::convert_messages(messages);
        let system_instruction = match system_instruction {
            Some(sys) => format!("{}\n\n{}", sys, VALIDATION_INSTRUCTION),
            None => VALIDATION_INSTRUCTION.to_string(),
        };

        let request = serde_json::json!({
            "contents": contents,
            "systemInstruction": {"parts": [{"text": system_instruction}]},
            "tools": Self::convert_tools(tools),
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_tokens,
            }
        });

        info!(
            model = %model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            "Calling Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Gemini API error");
            return Err(crate::classify_api_error("gemini", status, &raw_body));
        }
        debug!(body_len = raw_body.len(), "Gemini raw response");

        let resp: GeminiResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let preview: String = raw_body.chars().take(500).collect();
            Error::Provider(format!(
                "Failed to parse Gemini response: {}. Body: {}",
                e, preview
            ))
        })?;

        parse_response(resp)
    }

    fn map_action(&self, call: &ToolCallRequest) -> MappedAction {
        map_structured_action(call)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

fn parse_response(resp: GeminiResponse) -> Result<StrategyResponse> {
    let candidate = resp
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| Error::Provider("No candidates in Gemini response".to_string()))?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut actions: Vec<ToolCallRequest> = Vec::new();

    if let Some(content) = candidate.content {
        for (i, part) in content.parts.iter().enumerate() {
            if let Some(text) = &part.text {
                if !text.is_empty() {
                    text_parts.push(text.clone());
                }
            }
            if let Some(fc) = &part.function_call {
                actions.push(ToolCallRequest {
                    id: format!("gemini_call_{}", i),
                    name: fc.name.clone(),
                    arguments: fc
                        .args
                        .clone()
                        .unwrap_or(Value::Object(serde_json::Map::new())),
                });
            }
        }
    }

    let finished = actions.is_empty() && candidate.finish_reason.as_deref() != Some("MAX_TOKENS");
    info!(
        actions = actions.len(),
        finish_reason = candidate.finish_reason.as_deref().unwrap_or("none"),
        "Gemini response parsed"
    );

    Ok(StrategyResponse {
        text: if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        },
        actions,
        finished,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_tools_includes_validation_declaration() {
        let tools = vec![ToolSpec {
            name: "navigate".into(),
            description: Some("Open a URL".into()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        }];
        let converted = GeminiStrategy::convert_tools(&tools);
        let declarations = converted[0]["functionDeclarations"].as_array().unwrap();
        assert_eq!(declarations.len(), 2);
        assert_eq!(declarations[0]["name"], "navigate");
        assert_eq!(declarations[0]["parameters"]["type"], "OBJECT");
        assert_eq!(
            declarations[0]["parameters"]["properties"]["url"]["type"],
            "STRING"
        );
        assert_eq!(declarations[1]["name"], VALIDATION_TOOL);
    }

    #[test]
    fn test_convert_messages_roles() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("open example.com"),
            ChatMessage::assistant("on it"),
        ];
        let (system, contents) = GeminiStrategy::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_tool_result_with_image_becomes_inline_data() {
        let mut msg = ChatMessage::tool_result_with_image("tc_1", "done", "image/png", "aGk=");
        msg.name = Some("navigate".into());
        let (_, contents) = GeminiStrategy::convert_messages(&[msg]);
        let parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["functionResponse"]["name"], "navigate");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "aGk=");
    }

    #[test]
    fn test_parse_parallel_function_calls() {
        let resp: GeminiResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {
                        "parts": [
                            {"functionCall": {"name": "click", "args": {"x": 1, "y": 2}}},
                            {"functionCall": {"name": "type", "args": {"text": "hi"}}}
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }]
            }"#,
        )
        .unwrap();
        let parsed = parse_response(resp).unwrap();
        assert_eq!(parsed.actions.len(), 2);
        assert_eq!(parsed.actions[0].name, "click");
        assert_eq!(parsed.actions[1].name, "type");
        assert!(!parsed.finished);
    }

    #[test]
    fn test_text_only_response_is_terminal() {
        let resp: GeminiResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"parts": [{"text": "Done."}], "role": "model"},
                    "finishReason": "STOP"
                }]
            }"#,
        )
        .unwrap();
        let parsed = parse_response(resp).unwrap();
        assert!(parsed.finished);
        assert_eq!(parsed.text.as_deref(), Some("Done."));
    }

    #[test]
    fn test_empty_candidates_is_an_error() {
        let resp: GeminiResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(parse_response(resp).is_err());
    }
}
