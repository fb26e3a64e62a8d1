//! Bounded conversation history with tool-call-aware pruning.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use webpilot_core::types::ChatMessage;

/// The per-conversation turn list. Pruning never leaves the history starting
/// on a dangling tool result or an assistant tool-call head whose results
/// were cut off.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn with_system_prompt(prompt: &str) -> Self {
        Self {
            turns: vec![ChatMessage::system(prompt)],
        }
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.turns.push(msg);
    }

    pub fn as_slice(&self) -> &[ChatMessage] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.retain(|m| m.role == "system");
    }

    /// Bound the history to `max_turns` messages (the system prompt, if any,
    /// is kept outside the budget). After truncation the window is advanced
    /// to the first clean user turn so no strategy ever sees a tool result
    /// without its tool call.
    pub fn prune(&mut self, max_turns: usize) {
        let system: Option<ChatMessage> = self
            .turns
            .first()
            .filter(|m| m.role == "system")
            .cloned();
        let body_start = usize::from(system.is_some());
        let body = &self.turns[body_start..];

        if body.len() <= max_turns {
            return;
        }

        let mut tail: Vec<ChatMessage> = body[body.len() - max_turns..].to_vec();
        let mut start = find_safe_history_start(&tail);
        while start < tail.len() && tail[start].role != "user" {
            start += 1;
        }
        tail.drain(..start);

        debug!(
            dropped = body.len() - tail.len(),
            kept = tail.len(),
            "History pruned"
        );

        self.turns = match system {
            Some(sys) => {
                let mut turns = Vec::with_capacity(1 + tail.len());
                turns.push(sys);
                turns.extend(tail);
                turns
            }
            None => tail,
        };
    }

    /// Remove embedded image blocks from all but the `keep_recent` most
    /// recent image-bearing turns. Text blocks always survive. Idempotent.
    pub fn strip_images(&mut self, keep_recent: usize) {
        let image_indices: Vec<usize> = self
            .turns
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_image())
            .map(|(i, _)| i)
            .collect();
        if image_indices.len() <= keep_recent {
            return;
        }

        let strip_until = image_indices.len() - keep_recent;
        for &idx in &image_indices[..strip_until] {
            let msg = &mut self.turns[idx];
            if let Value::Array(parts) = &mut msg.content {
                parts.retain(|p| p.get("image_url").is_none());
                if parts.is_empty() {
                    parts.push(serde_json::json!({
                        "type": "text",
                        "text": "(screenshot omitted)"
                    }));
                }
            }
        }
    }
}

/// First index from which the history is self-consistent: skips leading tool
/// results whose assistant tool-call head is missing, and assistant heads
/// whose tool results were partially dropped.
fn find_safe_history_start(history: &[ChatMessage]) -> usize {
    let mut i = 0;

    while i < history.len() && history[i].role == "tool" {
        i += 1;
    }

    while i < history.len() {
        if history[i].role == "assistant" {
            if let Some(tool_calls) = &history[i].tool_calls {
                if !tool_calls.is_empty() {
                    let expected: Vec<&str> = tool_calls.iter().map(|tc| tc.id.as_str()).collect();
                    let mut found = HashSet::new();
                    for msg in &history[i + 1..] {
                        if msg.role != "tool" {
                            break;
                        }
                        if let Some(id) = &msg.tool_call_id {
                            found.insert(id.as_str());
                        }
                    }
                    if !expected.iter().all(|id| found.contains(id)) {
                        // Skip this head and its partial results
                        i += 1;
                        while i < history.len() && history[i].role == "tool" {
                            i += 1;
                        }
                        continue;
                    }
                }
            }
        }
        break;
    }

    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use webpilot_core::types::ToolCallRequest;

    fn assistant_with_call(id: &str) -> ChatMessage {
        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = Some(vec![ToolCallRequest {
            id: id.to_string(),
            name: "click".to_string(),
            arguments: serde_json::json!({}),
        }]);
        msg
    }

    #[test]
    fn test_prune_never_starts_on_dangling_tool_result() {
        let mut history = ConversationHistory::with_system_prompt("sys");
        history.push(ChatMessage::user("first"));
        history.push(assistant_with_call("tc_1"));
        history.push(ChatMessage::tool_result("tc_1", "ok"));
        history.push(ChatMessage::user("second"));
        history.push(ChatMessage::assistant("done"));

        // Budget of 4 cuts mid tool-call sequence; window must advance to
        // the next user turn
        history.prune(4);
        let turns = history.as_slice();
        assert_eq!(turns[0].role, "system");
        assert_eq!(turns[1].role, "user");
        assert_eq!(turns[1].text(), "second");
        assert_eq!(turns.len(), 3);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut history = ConversationHistory::new();
        for i in 0..10 {
            history.push(ChatMessage::user(&format!("u{}", i)));
            history.push(ChatMessage::assistant(&format!("a{}", i)));
        }
        history.prune(6);
        let after_first: Vec<String> = history.as_slice().iter().map(|m| m.text()).collect();
        history.prune(6);
        let after_second: Vec<String> = history.as_slice().iter().map(|m| m.text()).collect();
        assert_eq!(after_first, after_second);
        assert!(history.len() <= 6);
        assert_eq!(history.as_slice()[0].role, "user");
    }

    #[test]
    fn test_prune_under_budget_is_noop() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::user("hi"));
        history.push(ChatMessage::assistant("hello"));
        history.prune(40);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_safe_start_skips_partial_tool_results() {
        let history = vec![
            ChatMessage::tool_result("tc_0", "orphan"),
            assistant_with_call("tc_1"),
            // tc_1's result is missing
            ChatMessage::user("next"),
        ];
        let start = find_safe_history_start(&history);
        assert_eq!(start, 2);
    }

    #[test]
    fn test_strip_images_keeps_text() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::tool_result_with_image(
            "tc_1", "page one", "image/png", "aGk=",
        ));
        history.push(ChatMessage::tool_result_with_image(
            "tc_2", "page two", "image/png", "aGk=",
        ));

        history.strip_images(1);
        let turns = history.as_slice();
        assert!(!turns[0].has_image());
        assert_eq!(turns[0].text(), "page one");
        assert!(turns[1].has_image());

        // Idempotent
        history.strip_images(1);
        assert!(!history.as_slice()[0].has_image());
        assert!(history.as_slice()[1].has_image());

        // Default policy strips everything
        history.strip_images(0);
        assert!(!history.as_slice()[1].has_image());
        assert_eq!(history.as_slice()[1].text(), "page two");
    }
}
