//! Recursive transform from gateway-advertised JSON schemas to each vendor's
//! tool-declaration shape. Parsed once into a tagged tree, rendered per
//! vendor, so every strategy shares the same traversal.

use serde_json::{json, Map, Value};

/// A parsed schema node. Unknown or exotic constructs collapse to the closest
/// representable variant rather than failing the whole declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub description: Option<String>,
    pub kind: SchemaKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    Object {
        properties: Vec<(String, SchemaNode)>,
        required: Vec<String>,
    },
    Array {
        items: Box<SchemaNode>,
    },
    String {
        enum_values: Vec<String>,
    },
    Number,
    Integer,
    Boolean,
}

impl SchemaNode {
    pub fn from_value(value: &Value) -> Self {
        let description = value
            .get("description")
            .and_then(|d| d.as_str())
            .map(|s| s.to_string());

        let type_name = value.get("type").and_then(|t| t.as_str());
        let kind = match type_name {
            Some("object") => Self::parse_object(value),
            Some("array") => SchemaKind::Array {
                items: Box::new(
                    value
                        .get("items")
                        .map(Self::from_value)
                        .unwrap_or_else(Self::any_string),
                ),
            },
            Some("string") => SchemaKind::String {
                enum_values: Self::parse_enum(value),
            },
            Some("number") => SchemaKind::Number,
            Some("integer") => SchemaKind::Integer,
            Some("boolean") => SchemaKind::Boolean,
            // No type tag: objects are recognizable by their properties,
            // anything else degrades to a string
            _ => {
                if value.get("properties").is_some() {
                    Self::parse_object(value)
                } else {
                    SchemaKind::String {
                        enum_values: Self::parse_enum(value),
                    }
                }
            }
        };

        Self { description, kind }
    }

    fn any_string() -> Self {
        Self {
            description: None,
            kind: SchemaKind::String { enum_values: vec![] },
        }
    }

    fn parse_object(value: &Value) -> SchemaKind {
        let properties = value
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| {
                props
                    .iter()
                    .map(|(name, sub)| (name.clone(), Self::from_value(sub)))
                    .collect()
            })
            .unwrap_or_default();
        let required = value
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        SchemaKind::Object {
            properties,
            required,
        }
    }

    fn parse_enum(value: &Value) -> Vec<String> {
        value
            .get("enum")
            .and_then(|e| e.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plain JSON schema, as the Anthropic Messages API expects for
    /// `input_schema`. Vendor-unsupported keywords from the source schema are
    /// gone by construction.
    pub fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        match &self.kind {
            SchemaKind::Object {
                properties,
                required,
            } => {
                out.insert("type".into(), json!("object"));
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, node)| (name.clone(), node.to_json_schema()))
                    .collect();
                out.insert("properties".into(), Value::Object(props));
                if !required.is_empty() {
                    out.insert("required".into(), json!(required));
                }
            }
            SchemaKind::Array { items } => {
                out.insert("type".into(), json!("array"));
                out.insert("items".into(), items.to_json_schema());
            }
            SchemaKind::String { enum_values } => {
                out.insert("type".into(), json!("string"));
                if !enum_values.is_empty() {
                    out.insert("enum".into(), json!(enum_values));
                }
            }
            SchemaKind::Number => {
                out.insert("type".into(), json!("number"));
            }
            SchemaKind::Integer => {
                out.insert("type".into(), json!("integer"));
            }
            SchemaKind::Boolean => {
                out.insert("type".into(), json!("boolean"));
            }
        }
        if let Some(desc) = &self.description {
            out.insert("description".into(), json!(desc));
        }
        Value::Object(out)
    }

    /// Gemini function-declaration shape: upper-case type tags, same tree.
    pub fn to_gemini(&self) -> Value {
        let mut out = Map::new();
        match &self.kind {
            SchemaKind::Object {
                properties,
                required,
            } => {
                out.insert("type".into(), json!("OBJECT"));
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, node)| (name.clone(), node.to_gemini()))
                    .collect();
                out.insert("properties".into(), Value::Object(props));
                if !required.is_empty() {
                    out.insert("required".into(), json!(required));
                }
            }
            SchemaKind::Array { items } => {
                out.insert("type".into(), json!("ARRAY"));
                out.insert("items".into(), items.to_gemini());
            }
            SchemaKind::String { enum_values } => {
                out.insert("type".into(), json!("STRING"));
                if !enum_values.is_empty() {
                    out.insert("enum".into(), json!(enum_values));
                }
            }
            SchemaKind::Number => {
                out.insert("type".into(), json!("NUMBER"));
            }
            SchemaKind::Integer => {
                out.insert("type".into(), json!("INTEGER"));
            }
            SchemaKind::Boolean => {
                out.insert("type".into(), json!("BOOLEAN"));
            }
        }
        if let Some(desc) = &self.description {
            out.insert("description".into(), json!(desc));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Value {
        json!({
            "type": "object",
            "description": "Click an element",
            "properties": {
                "x": {"type": "integer", "description": "X coordinate"},
                "y": {"type": "integer"},
                "button": {"type": "string", "enum": ["left", "right", "middle"]},
                "modifiers": {
                    "type": "array",
                    "items": {"type": "string"}
                },
                "double": {"type": "boolean"}
            },
            "required": ["x", "y"]
        })
    }

    #[test]
    fn test_parse_nested_schema() {
        let node = SchemaNode::from_value(&sample_schema());
        assert_eq!(node.description.as_deref(), Some("Click an element"));
        match &node.kind {
            SchemaKind::Object {
                properties,
                required,
            } => {
                assert_eq!(properties.len(), 5);
                assert_eq!(required, &["x", "y"]);
                let button = &properties.iter().find(|(n, _)| n == "button").unwrap().1;
                match &button.kind {
                    SchemaKind::String { enum_values } => {
                        assert_eq!(enum_values, &["left", "right", "middle"]);
                    }
                    other => panic!("expected string kind, got {:?}", other),
                }
            }
            other => panic!("expected object kind, got {:?}", other),
        }
    }

    #[test]
    fn test_json_schema_round_trip() {
        let node = SchemaNode::from_value(&sample_schema());
        let rendered = node.to_json_schema();
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["properties"]["x"]["type"], "integer");
        assert_eq!(rendered["properties"]["x"]["description"], "X coordinate");
        assert_eq!(rendered["properties"]["modifiers"]["type"], "array");
        assert_eq!(
            rendered["properties"]["modifiers"]["items"]["type"],
            "string"
        );
        assert_eq!(rendered["required"], json!(["x", "y"]));
    }

    #[test]
    fn test_gemini_uses_uppercase_types() {
        let node = SchemaNode::from_value(&sample_schema());
        let rendered = node.to_gemini();
        assert_eq!(rendered["type"], "OBJECT");
        assert_eq!(rendered["properties"]["x"]["type"], "INTEGER");
        assert_eq!(rendered["properties"]["double"]["type"], "BOOLEAN");
        assert_eq!(rendered["properties"]["modifiers"]["type"], "ARRAY");
        assert_eq!(
            rendered["properties"]["button"]["enum"],
            json!(["left", "right", "middle"])
        );
    }

    #[test]
    fn test_untyped_value_degrades_to_string() {
        let node = SchemaNode::from_value(&json!({"description": "anything"}));
        assert!(matches!(node.kind, SchemaKind::String { .. }));

        // Untyped but with properties still parses as an object
        let node = SchemaNode::from_value(&json!({"properties": {"a": {"type": "string"}}}));
        assert!(matches!(node.kind, SchemaKind::Object { .. }));
    }

    #[test]
    fn test_array_without_items() {
        let node = SchemaNode::from_value(&json!({"type": "array"}));
        let rendered = node.to_json_schema();
        assert_eq!(rendered["items"]["type"], "string");
    }
}
