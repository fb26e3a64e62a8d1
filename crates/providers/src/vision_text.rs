use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use webpilot_core::types::{ChatMessage, ToolCallRequest, ToolSpec};
use webpilot_core::{Error, Result};

use crate::{map_structured_action, MappedAction, ModelStrategy, StrategyResponse, VALIDATION_TOOL};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Canonical gateway actions the normalization table resolves to.
const CANONICAL_ACTIONS: &[&str] = &[
    "navigate",
    "click",
    "type",
    "scroll",
    "screenshot",
    "wait",
    "back",
    "forward",
    "refresh",
    "hover",
    "select",
    "press_key",
];

/// Free-text action strategy for vision models that cannot emit structured
/// tool calls. One action per turn is parsed out of loosely structured text:
/// `<action>` tags first, then fenced code, then raw JSON. Action names go
/// through a case/separator-insensitive normalization table; unrecognized
/// names produce a corrective observation instead of aborting.
#[derive(Debug)]
pub struct VisionTextStrategy {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl VisionTextStrategy {
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
                .unwrap_or(OPENAI_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("openai/").unwrap_or(model)
    }
}

/// Collapse case and separators: "Click_Element" and "click element" compare
/// equal.
fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Resolve a free-form action name to a canonical gateway tool, or the
/// validation pseudo-tool.
pub fn normalize_action(raw: &str) -> Option<&'static str> {
    match normalize_key(raw).as_str() {
        "navigate" | "navigateto" | "goto" | "gotourl" | "open" | "openurl" | "visit" | "go"
        | "loadurl" | "load" => Some("navigate"),
        "click" | "clickelement" | "clickat" | "clickon" | "tap" | "leftclick" | "mouseclick"
        | "doubleclick" => Some("click"),
        "type" | "typetext" | "input" | "inputtext" | "entertext" | "fill" | "filltext"
        | "settext" | "write" => Some("type"),
        "scroll" | "scrolldown" | "scrollup" | "scrollto" | "scrollpage" | "swipe" => {
            Some("scroll")
        }
        "screenshot" | "capture" | "capturescreen" | "takescreenshot" | "snapshot" => {
            Some("screenshot")
        }
        "wait" | "sleep" | "pause" | "delay" | "waitfor" => Some("wait"),
        "back" | "goback" | "navigateback" | "historyback" => Some("back"),
        "forward" | "goforward" | "historyforward" => Some("forward"),
        "refresh" | "reload" | "refreshpage" | "reloadpage" => Some("refresh"),
        "hover" | "mouseover" | "hoverover" | "moveto" => Some("hover"),
        "select" | "selectoption" | "choose" | "pick" => Some("select"),
        "presskey" | "keypress" | "key" | "sendkeys" | "hotkey" | "keyboard" => Some("press_key"),
        "reportvalidation" | "validate" | "validation" | "assert" => Some(VALIDATION_TOOL),
        _ => None,
    }
}

/// Pull the action payload out of the model's prose. Tagged blocks win over
/// fenced code, fenced code over a bare JSON object.
fn extract_action_payload(text: &str) -> Option<String> {
    if let Ok(re) = Regex::new(r"(?s)<action>\s*(.*?)\s*</action>") {
        if let Some(caps) = re.captures(text) {
            return Some(caps[1].trim().to_string());
        }
    }
    if let Ok(re) = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```") {
        if let Some(caps) = re.captures(text) {
            return Some(caps[1].trim().to_string());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        let candidate = &text[start..=end];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Parse the extracted payload into a tool-call request. The action name may
/// live under `action`, `name`, or `tool`; arguments under `arguments`,
/// `args`, `parameters`, or inline as the remaining object fields. A payload
/// that is not JSON becomes a request with the raw text as its name, which
/// the mapping step then rejects with an observation.
fn parse_action(payload: &str) -> ToolCallRequest {
    let id = format!("text_call_{}", Uuid::new_v4());

    let parsed: Option<(String, Value)> = serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|value| {
            let obj = value.as_object()?;
            let name = obj
                .get("action")
                .or_else(|| obj.get("name"))
                .or_else(|| obj.get("tool"))?
                .as_str()?
                .to_string();
            let arguments = obj
                .get("arguments")
                .or_else(|| obj.get("args"))
                .or_else(|| obj.get("parameters"))
                .cloned()
                .unwrap_or_else(|| {
                    let rest: Map<String, Value> = obj
                        .iter()
                        .filter(|(k, _)| {
                            !matches!(k.as_str(), "action" | "name" | "tool")
                        })
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Value::Object(rest)
                });
            Some((name, arguments))
        });

    match parsed {
        Some((name, arguments)) => ToolCallRequest {
            id,
            name,
            arguments,
        },
        None => {
            warn!(payload = %payload, "Action payload is not valid JSON");
            ToolCallRequest {
                id,
                name: payload.chars().take(80).collect(),
                arguments: Value::Object(Map::new()),
            }
        }
    }
}

#[async_trait]
impl ModelStrategy for VisionTextStrategy {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<StrategyResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let model = Self::normalize_model(&self.model);

        let request = serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": messages,
        });

        info!(
            model = %model,
            messages_count = messages.len(),
            "Calling vision model API"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Vision model request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Vision model API error");
            return Err(crate::classify_api_error("vision model", status, &raw_body));
        }
        debug!(body_len = raw_body.len(), "Vision model raw response");

        let resp: CompletionResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let preview: String = raw_body.chars().take(500).collect();
            Error::Provider(format!(
                "Failed to parse vision model response: {}. Body: {}",
                e, preview
            ))
        })?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(parse_turn(&content))
    }

    fn map_action(&self, call: &ToolCallRequest) -> MappedAction {
        match normalize_action(&call.name) {
            Some(VALIDATION_TOOL) => {
                let rewritten = ToolCallRequest {
                    id: call.id.clone(),
                    name: VALIDATION_TOOL.to_string(),
                    arguments: call.arguments.clone(),
                };
                map_structured_action(&rewritten)
            }
            Some(canonical) => {
                let mut arguments = call.arguments.clone();
                // "scroll_down"/"scroll_up" carry their direction in the name
                if canonical == "scroll" {
                    if let Value::Object(map) = &mut arguments {
                        if !map.contains_key("direction") {
                            let key = normalize_key(&call.name);
                            if key.ends_with("down") {
                                map.insert("direction".into(), Value::String("down".into()));
                            } else if key.ends_with("up") {
                                map.insert("direction".into(), Value::String("up".into()));
                            }
                        }
                    }
                }
                MappedAction::Gateway {
                    name: canonical.to_string(),
                    arguments,
                }
            }
            None => MappedAction::Unrecognized {
                observation: format!(
                    "Unknown action '{}'. Use one of: {}.",
                    call.name,
                    CANONICAL_ACTIONS.join(", ")
                ),
            },
        }
    }

    fn name(&self) -> &'static str {
        "vision"
    }
}

/// One turn of free text: at most one action, full text kept as narration.
/// No extractable action means the turn is the final answer.
fn parse_turn(content: &str) -> StrategyResponse {
    match extract_action_payload(content) {
        Some(payload) => {
            let action = parse_action(&payload);
            debug!(action = %action.name, "Extracted action from free text");
            StrategyResponse {
                text: Some(content.to_string()),
                actions: vec![action],
                finished: false,
            }
        }
        None => StrategyResponse {
            text: Some(content.to_string()),
            actions: vec![],
            finished: true,
        },
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> VisionTextStrategy {
        VisionTextStrategy::new("key", None, "gpt-4o", 1024, 0.2)
    }

    #[test]
    fn test_tagged_block_wins_over_fenced_code() {
        let text = r#"I'll click the button.
<action>{"action": "click", "x": 10, "y": 20}</action>
```json
{"action": "type", "text": "ignored"}
```"#;
        let parsed = parse_turn(text);
        assert_eq!(parsed.actions.len(), 1);
        assert_eq!(parsed.actions[0].name, "click");
        assert_eq!(parsed.actions[0].arguments["x"], 10);
        assert!(!parsed.finished);
    }

    #[test]
    fn test_fenced_code_wins_over_raw_json() {
        let text = r#"Next step {"action": "wait"} as raw text, but really:
```json
{"action": "navigate", "arguments": {"url": "https://example.com"}}
```"#;
        let parsed = parse_turn(text);
        assert_eq!(parsed.actions[0].name, "navigate");
        assert_eq!(parsed.actions[0].arguments["url"], "https://example.com");
    }

    #[test]
    fn test_raw_json_fallback() {
        let text = r#"The page is ready so {"name": "screenshot", "args": {}} now."#;
        let parsed = parse_turn(text);
        assert_eq!(parsed.actions[0].name, "screenshot");
    }

    #[test]
    fn test_plain_text_is_final_answer() {
        let parsed = parse_turn("The form was submitted successfully.");
        assert!(parsed.finished);
        assert!(parsed.actions.is_empty());
        assert_eq!(
            parsed.text.as_deref(),
            Some("The form was submitted successfully.")
        );
    }

    #[test]
    fn test_normalization_table() {
        assert_eq!(normalize_action("Navigate_To"), Some("navigate"));
        assert_eq!(normalize_action("GOTO"), Some("navigate"));
        assert_eq!(normalize_action("open url"), Some("navigate"));
        assert_eq!(normalize_action("click-element"), Some("click"));
        assert_eq!(normalize_action("TypeText"), Some("type"));
        assert_eq!(normalize_action("enter_text"), Some("type"));
        assert_eq!(normalize_action("scroll_down"), Some("scroll"));
        assert_eq!(normalize_action("take_screenshot"), Some("screenshot"));
        assert_eq!(normalize_action("press-key"), Some("press_key"));
        assert_eq!(normalize_action("Validate"), Some(VALIDATION_TOOL));
        assert_eq!(normalize_action("teleport"), None);
    }

    #[test]
    fn test_map_action_normalizes_and_injects_direction() {
        let call = ToolCallRequest {
            id: "t1".into(),
            name: "Scroll_Down".into(),
            arguments: serde_json::json!({}),
        };
        match strategy().map_action(&call) {
            MappedAction::Gateway { name, arguments } => {
                assert_eq!(name, "scroll");
                assert_eq!(arguments["direction"], "down");
            }
            other => panic!("expected gateway mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_map_action_unrecognized_yields_observation() {
        let call = ToolCallRequest {
            id: "t1".into(),
            name: "teleport".into(),
            arguments: serde_json::json!({}),
        };
        match strategy().map_action(&call) {
            MappedAction::Unrecognized { observation } => {
                assert!(observation.contains("teleport"));
                assert!(observation.contains("navigate"));
            }
            other => panic!("expected unrecognized mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_map_action_validation_via_alias() {
        let call = ToolCallRequest {
            id: "t1".into(),
            name: "validate".into(),
            arguments: serde_json::json!({"description": "title is set", "result": "pass"}),
        };
        match strategy().map_action(&call) {
            MappedAction::Validation {
                description,
                passed,
                ..
            } => {
                assert_eq!(description, "title is set");
                assert!(passed);
            }
            other => panic!("expected validation mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_non_json_payload_becomes_unrecognized() {
        let parsed = parse_turn("<action>click the login button</action>");
        assert_eq!(parsed.actions.len(), 1);
        match strategy().map_action(&parsed.actions[0]) {
            // "click the login button" is not in the table
            MappedAction::Unrecognized { .. } => {}
            other => panic!("expected unrecognized mapping, got {:?}", other),
        }
    }
}
