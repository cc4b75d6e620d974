// crates/memori/src/llm/client.rs
// Chat client abstraction + OpenAI-compatible implementation

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{MemoriError, Result};
use crate::llm::http_client::LlmHttpClient;
use crate::llm::types::{ChatParams, ChatResult, Message, ToolCallInfo, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Trait for chat-completion clients. The classifier and query planner only
/// depend on this, which is also the seam tests use to script responses.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a chat completion request.
    async fn chat(&self, messages: Vec<Message>, params: ChatParams) -> Result<ChatResult>;

    /// Whether the endpoint accepts the `json_schema` response format.
    fn supports_structured_output(&self) -> bool;

    /// Model name used for requests.
    fn model_name(&self) -> String;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiCompatClient {
    api_key: String,
    base_url: String,
    model: String,
    structured_output: bool,
    http: LlmHttpClient,
}

impl OpenAiCompatClient {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model.clone(),
            structured_output: config.supports_structured_output(),
            http: LlmHttpClient::default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, messages: &[Message], params: &ChatParams) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(t) = params.temperature {
            body["temperature"] = serde_json::Value::from(t);
        }
        if let Some(m) = params.max_tokens {
            body["max_tokens"] = serde_json::Value::from(m);
        }
        if let Some(rf) = &params.response_format {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": rf.name,
                    "schema": rf.schema,
                    "strict": true,
                }
            });
        }
        Ok(serde_json::to_string(&body)?)
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn chat(&self, messages: Vec<Message>, params: ChatParams) -> Result<ChatResult> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let body = self.build_body(&messages, &params)?;
        debug!(request_id = %request_id, model = %self.model, "sending chat completion request");

        let response_body = self
            .http
            .execute_with_retry(&request_id, &self.completions_url(), &self.api_key, body)
            .await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        parse_completion_response(&response_body, request_id, duration_ms)
    }

    fn supports_structured_output(&self) -> bool {
        self.structured_output
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<RawToolCall>>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct RawToolCall {
    function: RawFunction,
}

#[derive(Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Parse an OpenAI-compatible completion response body.
pub fn parse_completion_response(
    body: &str,
    request_id: String,
    duration_ms: u64,
) -> Result<ChatResult> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| MemoriError::Llm(format!("unparseable completion response: {e}")))?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| MemoriError::Llm("completion response had no choices".into()))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(MemoriError::Llm(format!("model refused: {refusal}")));
    }

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallInfo {
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    Ok(ChatResult {
        request_id,
        content: choice.message.content,
        tool_calls,
        usage: response.usage,
        model: response.model,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_response() {
        let body = r#"{
            "model": "gpt-4o",
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        }"#;
        let result = parse_completion_response(body, "req-1".into(), 5).unwrap();
        assert_eq!(result.content.as_deref(), Some("hello"));
        assert_eq!(result.usage.unwrap().total_tokens, 12);
        assert!(result.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "c1", "type": "function",
                                "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}]
            }}]
        }"#;
        let result = parse_completion_response(body, "req-1".into(), 5).unwrap();
        assert!(result.content.is_none());
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "get_weather");
    }

    #[test]
    fn test_parse_refusal_is_error() {
        let body = r#"{"choices": [{"message": {"refusal": "I cannot do that"}}]}"#;
        let err = parse_completion_response(body, "req-1".into(), 5).unwrap_err();
        assert!(matches!(err, MemoriError::Llm(_)));
    }

    #[test]
    fn test_parse_empty_choices_is_error() {
        let body = r#"{"choices": []}"#;
        assert!(parse_completion_response(body, "req-1".into(), 5).is_err());
    }

    #[test]
    fn test_body_includes_response_format() {
        let client = OpenAiCompatClient::from_config(&ProviderConfig::new("sk-test"));
        let params = ChatParams {
            temperature: Some(0.1),
            max_tokens: None,
            response_format: Some(crate::llm::types::ResponseFormat {
                name: "plan".into(),
                schema: serde_json::json!({"type": "object"}),
            }),
        };
        let body = client.build_body(&[Message::user("q")], &params).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_schema");
        assert_eq!(value["response_format"]["json_schema"]["name"], "plan");
    }

    #[test]
    fn test_completions_url_trims_slash() {
        let mut cfg = ProviderConfig::new("k");
        cfg.base_url = Some("http://localhost:8000/v1/".into());
        let client = OpenAiCompatClient::from_config(&cfg);
        assert_eq!(
            client.completions_url(),
            "http://localhost:8000/v1/chat/completions"
        );
    }
}
