use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A tool call requested by a model strategy.
/// Serializes to the OpenAI-compatible format:
/// `{id, type: "function", function: {name, arguments}}`
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &serde_json::json!({
            "name": self.name,
            "arguments": self.arguments.to_string()
        }))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value.as_object().ok_or_else(|| serde::de::Error::custom("expected object"))?;

        let id = obj.get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Nested format: {id, type, function: {name, arguments}}
        if let Some(func) = obj.get("function").and_then(|v| v.as_object()) {
            let name = func.get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = match func.get("arguments") {
                Some(serde_json::Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or_else(|e| {
                        warn!(error = %e, raw = %s, "Failed to parse tool call arguments as JSON, using empty object");
                        serde_json::Value::Object(serde_json::Map::new())
                    })
                }
                Some(v) => v.clone(),
                None => serde_json::Value::Object(serde_json::Map::new()),
            };
            return Ok(ToolCallRequest { id, name, arguments });
        }

        // Flat format: {id, name, arguments}
        let name = obj.get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = obj.get("arguments")
            .cloned()
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        Ok(ToolCallRequest { id, name, arguments })
    }
}

/// One role-tagged unit of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: serde_json::Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: serde_json::Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: serde_json::Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: serde_json::Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            name: None,
        }
    }

    /// Tool result carrying both text and an inline image
    /// (`data:<mime>;base64,<data>` in an `image_url` content block).
    pub fn tool_result_with_image(
        tool_call_id: &str,
        text: &str,
        media_type: &str,
        data_b64: &str,
    ) -> Self {
        Self {
            role: "tool".to_string(),
            content: serde_json::Value::Array(vec![
                serde_json::json!({"type": "text", "text": text}),
                serde_json::json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", media_type, data_b64)}
                }),
            ]),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            name: None,
        }
    }

    /// Whether any content block carries an embedded image payload.
    pub fn has_image(&self) -> bool {
        match &self.content {
            serde_json::Value::Array(parts) => {
                parts.iter().any(|p| p.get("image_url").is_some())
            }
            _ => false,
        }
    }

    /// Text content, flattening multi-part blocks.
    pub fn text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

/// A tool advertised by the automation process. Immutable for the life of a
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// One ordered content block of a tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Image { media_type: String, data_b64: String },
}

/// Result of one gateway tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(msg: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text(msg.into())],
            is_error: false,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text(msg.into())],
            is_error: true,
        }
    }

    /// All text blocks joined with newlines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First embedded image, if any.
    pub fn first_image(&self) -> Option<(&str, &str)> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::Image { media_type, data_b64 } => {
                Some((media_type.as_str(), data_b64.as_str()))
            }
            _ => None,
        })
    }
}

/// Judgment of whether a page's rendered output changed between two frames.
///
/// Invariants: `percent_diff` is within [0, 100]. `pixels_diff == -1` signals
/// a dimension mismatch, in which case `changed` is forced true and
/// `percent_diff` is 100 regardless of content. A populated `error` means the
/// comparison degraded and the verdict must be read as "unknown".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeVerdict {
    pub changed: bool,
    pub percent_diff: f64,
    pub pixels_diff: i64,
    pub total_pixels: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChangeVerdict {
    pub fn unchanged(total_pixels: u64) -> Self {
        Self {
            changed: false,
            percent_diff: 0.0,
            pixels_diff: 0,
            total_pixels,
            error: None,
        }
    }

    pub fn dimension_mismatch() -> Self {
        Self {
            changed: true,
            percent_diff: 100.0,
            pixels_diff: -1,
            total_pixels: 0,
            error: None,
        }
    }

    pub fn degraded(msg: impl Into<String>) -> Self {
        Self {
            changed: false,
            percent_diff: 0.0,
            pixels_diff: 0,
            total_pixels: 0,
            error: Some(msg.into()),
        }
    }
}

/// A captured screenshot frame. Owned by the frame cache and replaced
/// atomically on each capture; readers hold an `Arc` clone.
#[derive(Debug, Clone)]
pub struct Frame {
    pub full_png: Vec<u8>,
    /// Scaled copy for streaming to the UI; the marker, if any, is drawn
    /// onto this copy only.
    pub scaled_png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub marker: Option<(u32, u32)>,
}

/// Append-only record of one executed tool call. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationResult {
    Pass,
    Fail,
}

/// An explicit pass/fail assertion raised by the model via the validation
/// pseudo-tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub result: ValidationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

/// Connection lifecycle of the gateway. Owned solely by the gateway; no other
/// component transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    /// A reconnect is in flight.
    Degraded,
    /// Reconnect attempts exhausted; stays here until the next initialize().
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_request_roundtrip() {
        let json = r#"{"id":"tc_1","type":"function","function":{"name":"navigate","arguments":"{\"url\":\"https://example.com\"}"}}"#;
        let req: ToolCallRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.name, "navigate");
        assert_eq!(req.arguments["url"], "https://example.com");

        let flat = r#"{"id":"tc_2","name":"click","arguments":{"x":10,"y":20}}"#;
        let req: ToolCallRequest = serde_json::from_str(flat).unwrap();
        assert_eq!(req.name, "click");
        assert_eq!(req.arguments["x"], 10);
    }

    #[test]
    fn test_tool_result_accessors() {
        let result = ToolResult {
            content: vec![
                ContentBlock::Text("navigated".into()),
                ContentBlock::Image {
                    media_type: "image/png".into(),
                    data_b64: "aGk=".into(),
                },
                ContentBlock::Text("done".into()),
            ],
            is_error: false,
        };
        assert_eq!(result.text_content(), "navigated\ndone");
        assert_eq!(result.first_image(), Some(("image/png", "aGk=")));
    }

    #[test]
    fn test_message_has_image() {
        let plain = ChatMessage::tool_result("tc_1", "ok");
        assert!(!plain.has_image());
        let with_img = ChatMessage::tool_result_with_image("tc_1", "ok", "image/png", "aGk=");
        assert!(with_img.has_image());
        assert_eq!(with_img.text(), "ok");
    }

    #[test]
    fn test_verdict_invariants() {
        let v = ChangeVerdict::dimension_mismatch();
        assert!(v.changed);
        assert_eq!(v.pixels_diff, -1);
        assert_eq!(v.percent_diff, 100.0);

        let d = ChangeVerdict::degraded("decode failed");
        assert!(!d.changed);
        assert!(d.error.is_some());
    }
}
