//! Claude-style `stream-json` output events.

use serde::Deserialize;
use serde_json::Value;

/// One line of `--output-format stream-json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u64>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Token counts from a `result` event. Cache reads count as input.
#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

/// Short description of a tool call for debug logs.
pub fn tool_summary(name: &str, input: &Value) -> String {
    let detail = ["file_path", "command", "pattern", "description"]
        .iter()
        .find_map(|key| input.get(*key).and_then(|v| v.as_str()));
    match detail {
        Some(detail) => {
            let detail: String = detail.chars().take(60).collect();
            format!("{}: {}", name, detail)
        }
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_with_usage() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"sess-1","total_cost_usd":0.42,"num_turns":7,"duration_ms":1200,"usage":{"input_tokens":10,"cache_read_input_tokens":90,"output_tokens":55}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Result {
                session_id,
                total_cost_usd,
                num_turns,
                usage,
                ..
            } => {
                assert_eq!(session_id.as_deref(), Some("sess-1"));
                assert_eq!(total_cost_usd, Some(0.42));
                assert_eq!(num_turns, Some(7));
                let usage = usage.unwrap();
                assert_eq!(usage.total_input(), 100);
                assert_eq!(usage.output_tokens, 55);
            }
            other => panic!("Expected Result event, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_assistant_text_and_unknown_block() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hm"},{"type":"text","text":"Hello"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        if let StreamEvent::Assistant { message, .. } = event {
            assert!(matches!(message.content[0], ContentBlock::Other));
            assert!(matches!(&message.content[1], ContentBlock::Text { text } if text == "Hello"));
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_tool_summary() {
        let input = serde_json::json!({"command": "cargo test"});
        assert_eq!(tool_summary("Bash", &input), "Bash: cargo test");
        assert_eq!(tool_summary("Think", &serde_json::json!({})), "Think");
    }
}
