// crates/memori/src/llm/types.rs
// Shared LLM types (OpenAI-compatible message format)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String, // "system" | "user" | "assistant" | "tool"
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Plain-text view of the content, if it is a simple string.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(s) => Some(s),
            MessageContent::Parts(_) | MessageContent::Empty => None,
        }
    }
}

/// Message content: a plain string, multi-part (vision) content, or null
/// (assistant tool-call turns carry no content).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Empty,
}

/// One part of a multi-part message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

/// Usage statistics from a completion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Tool call extracted from a completion.
#[derive(Debug, Clone)]
pub struct ToolCallInfo {
    pub name: String,
    pub arguments: String,
}

/// Result of a chat completion.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub request_id: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallInfo>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    pub duration_ms: u64,
}

/// Structured-output response format (json_schema).
#[derive(Debug, Clone)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
}

/// Per-call completion parameters.
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
}

/// The host's outbound request as seen by the interception seam.
///
/// Covers both provider shapes: chat-completions carries everything in
/// `messages`; Anthropic-style requests put system text in `system`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequestPayload {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_serializes_as_string() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "hello");
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn test_multi_part_content_round_trip() {
        let json = serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}}
            ]
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        match &msg.content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            MessageContent::Text(_) => panic!("expected parts"),
            MessageContent::Empty => panic!("expected parts"),
        }
        assert!(msg.text().is_none());
    }

    #[test]
    fn test_null_content_round_trip() {
        let json = serde_json::json!({"role": "assistant", "content": null});
        let msg: Message = serde_json::from_value(json).unwrap();
        assert!(matches!(msg.content, MessageContent::Empty));
        assert!(msg.text().is_none());
    }

    #[test]
    fn test_payload_defaults() {
        let payload: ChatRequestPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.messages.is_empty());
        assert!(!payload.stream);
        assert!(payload.system.is_none());
    }
}
