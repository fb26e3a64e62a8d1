//! Append-only record of executed tool calls and validation assertions.

use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use webpilot_core::types::{ActionLogEntry, ValidationRecord, ValidationResult};

/// Process-lifetime action log. Entries are never mutated once written;
/// only an explicit external clear empties it.
#[derive(Debug, Default)]
pub struct Recorder {
    actions: Mutex<Vec<ActionLogEntry>>,
    validations: Mutex<Vec<ValidationRecord>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_action(&self, tool_name: &str, arguments: Value, success: bool) {
        let entry = ActionLogEntry {
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            arguments,
            success,
        };
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn record_validation(&self, description: &str, passed: bool, fail_reason: Option<String>) {
        info!(
            description = %description,
            passed,
            "Validation recorded"
        );
        let record = ValidationRecord {
            timestamp: Utc::now(),
            description: description.to_string(),
            result: if passed {
                ValidationResult::Pass
            } else {
                ValidationResult::Fail
            },
            fail_reason,
        };
        self.validations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn actions(&self) -> Vec<ActionLogEntry> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn validations(&self) -> Vec<ValidationRecord> {
        self.validations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.validations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Render the recorded actions as a deterministic replay script. Failed
    /// actions are kept as comments so the script stays a faithful trace.
    pub fn replay_script(&self) -> String {
        let actions = self.actions();
        let mut lines = Vec::with_capacity(actions.len() + 2);
        lines.push("// Generated replay script".to_string());
        for entry in &actions {
            let line = format!(
                "await browser.{}({});",
                entry.tool_name,
                serde_json::to_string(&entry.arguments).unwrap_or_else(|_| "{}".to_string())
            );
            if entry.success {
                lines.push(line);
            } else {
                lines.push(format!("// failed: {}", line));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_and_clear() {
        let recorder = Recorder::new();
        recorder.record_action("navigate", serde_json::json!({"url": "https://a"}), true);
        recorder.record_action("click", serde_json::json!({"x": 1}), false);
        recorder.record_validation("title is set", true, None);
        recorder.record_validation("cart has 2 items", false, Some("badge reads 1".into()));

        assert_eq!(recorder.actions().len(), 2);
        assert_eq!(recorder.validations().len(), 2);
        assert_eq!(recorder.validations()[0].result, ValidationResult::Pass);
        assert_eq!(
            recorder.validations()[1].fail_reason.as_deref(),
            Some("badge reads 1")
        );

        recorder.clear();
        assert!(recorder.actions().is_empty());
        assert!(recorder.validations().is_empty());
    }

    #[test]
    fn test_replay_script_rendering() {
        let recorder = Recorder::new();
        recorder.record_action("navigate", serde_json::json!({"url": "https://a"}), true);
        recorder.record_action("click", serde_json::json!({"x": 1, "y": 2}), false);

        let script = recorder.replay_script();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[1], r#"await browser.navigate({"url":"https://a"});"#);
        assert_eq!(lines[2], r#"// failed: await browser.click({"x":1,"y":2});"#);
    }
}
