// crates/memori/src/hooks.rs
// Recording pipeline: the interception seam hosts install around their LLM
// client, plus request/response content extraction.
//
// There is no runtime patching here. Hosts wrap their client and route each
// call through `before_request` / `after_response`.

use tracing::{debug, warn};

use crate::context::get_active_context;
use crate::core::Memori;
use crate::error::Result;
use crate::injection::is_internal_call;
use crate::llm::{ChatRequestPayload, ChatResult, ContentPart, Message, MessageContent};

/// Extract the latest user message's text. Multi-part content concatenates
/// the text segments and counts images into a suffix.
pub fn extract_user_input(messages: &[Message]) -> String {
    for message in messages.iter().rev() {
        if message.role != "user" {
            continue;
        }
        return match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Empty => String::new(),
            MessageContent::Parts(parts) => {
                let mut text_parts: Vec<&str> = Vec::new();
                let mut image_count = 0;
                for part in parts {
                    match part {
                        ContentPart::Text { text } => text_parts.push(text),
                        ContentPart::ImageUrl { .. } => image_count += 1,
                    }
                }
                let mut out = text_parts.join(" ");
                if image_count > 0 {
                    out.push_str(&format!(" [Contains {image_count} image(s)]"));
                }
                out
            }
        };
    }
    String::new()
}

/// Extract the assistant output from a completion, rendering tool calls as
/// a bracketed description.
pub fn extract_ai_output(result: &ChatResult) -> String {
    if let Some(content) = &result.content {
        if !content.is_empty() {
            return content.clone();
        }
    }

    if !result.tool_calls.is_empty() {
        let descriptions: Vec<String> = result
            .tool_calls
            .iter()
            .map(|tc| format!("Called {} with {}", tc.name, tc.arguments))
            .collect();
        return format!("[Tool calls: {}]", descriptions.join("; "));
    }

    "[No content - possible function/tool call]".to_string()
}

/// Interceptor returned by [`Memori::interceptor`]. Hosts call
/// `before_request` with the outbound payload and `after_response` with the
/// provider's reply.
pub struct MemoriInterceptor {
    memori: Memori,
}

impl MemoriInterceptor {
    pub(crate) fn new(memori: Memori) -> Self {
        Self { memori }
    }

    /// Pre-call hook: inject memory context unless this is an internal
    /// agent call or no tenant context can be resolved.
    pub async fn before_request(&self, payload: &mut ChatRequestPayload) -> Result<()> {
        if !self.memori.is_enabled() {
            return Ok(());
        }
        if is_internal_call(payload) {
            return Ok(());
        }

        let tenant = match get_active_context(false)? {
            Some(tenant) => tenant,
            None if self.memori.config().auto_context => self.memori.tenant(),
            None => {
                warn!("no active memori context; skipping context injection");
                return Ok(());
            }
        };

        self.memori.injection().inject(payload, &tenant).await?;
        Ok(())
    }

    /// Post-call hook: extract the exchange and record it. Returns the chat
    /// id when a conversation was recorded (a synthetic id when the dedup
    /// net suppressed a duplicate), None when nothing was recordable.
    pub async fn after_response(
        &self,
        payload: &ChatRequestPayload,
        result: &ChatResult,
    ) -> Result<Option<String>> {
        if !self.memori.is_enabled() {
            return Ok(None);
        }
        if payload.stream {
            debug!("streaming responses are not recorded at the interception point");
            return Ok(None);
        }
        if is_internal_call(payload) {
            return Ok(None);
        }

        let user_input = extract_user_input(&payload.messages);
        let ai_output = extract_ai_output(result);
        if user_input.is_empty() && ai_output.is_empty() {
            return Ok(None);
        }

        let model = result
            .model
            .clone()
            .or_else(|| payload.model.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let mut metadata = serde_json::json!({
            "integration": "interceptor",
            "auto_recorded": true,
        });
        if let Some(usage) = &result.usage {
            metadata["prompt_tokens"] = usage.prompt_tokens.into();
            metadata["completion_tokens"] = usage.completion_tokens.into();
            metadata["total_tokens"] = usage.total_tokens.into();
        }

        let chat_id = self
            .memori
            .record_conversation(&user_input, &ai_output, Some(&model), Some(metadata))
            .await?;
        Ok(Some(chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ImageRef, ToolCallInfo, Usage};

    fn chat_result(content: Option<&str>, tool_calls: Vec<ToolCallInfo>) -> ChatResult {
        ChatResult {
            request_id: "req".into(),
            content: content.map(str::to_string),
            tool_calls,
            usage: Some(Usage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            }),
            model: Some("gpt-4o".into()),
            duration_ms: 1,
        }
    }

    #[test]
    fn test_extract_user_input_latest_user_message() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
        ];
        assert_eq!(extract_user_input(&messages), "second");
    }

    #[test]
    fn test_extract_user_input_multi_part_with_images() {
        let messages = vec![Message {
            role: "user".into(),
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "what is".into(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageRef {
                        url: "https://example.com/a.png".into(),
                    },
                },
                ContentPart::Text {
                    text: "this?".into(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageRef {
                        url: "https://example.com/b.png".into(),
                    },
                },
            ]),
        }];
        assert_eq!(
            extract_user_input(&messages),
            "what is this? [Contains 2 image(s)]"
        );
    }

    #[test]
    fn test_extract_user_input_no_user_message() {
        let messages = vec![Message::system("sys"), Message::assistant("a")];
        assert_eq!(extract_user_input(&messages), "");
    }

    #[test]
    fn test_extract_ai_output_content() {
        let result = chat_result(Some("hello"), vec![]);
        assert_eq!(extract_ai_output(&result), "hello");
    }

    #[test]
    fn test_extract_ai_output_tool_calls() {
        let result = chat_result(
            None,
            vec![
                ToolCallInfo {
                    name: "get_weather".into(),
                    arguments: "{\"city\":\"Oslo\"}".into(),
                },
                ToolCallInfo {
                    name: "get_time".into(),
                    arguments: "{}".into(),
                },
            ],
        );
        assert_eq!(
            extract_ai_output(&result),
            "[Tool calls: Called get_weather with {\"city\":\"Oslo\"}; Called get_time with {}]"
        );
    }

    #[test]
    fn test_extract_ai_output_empty() {
        let result = chat_result(None, vec![]);
        assert_eq!(
            extract_ai_output(&result),
            "[No content - possible function/tool call]"
        );
    }
}
