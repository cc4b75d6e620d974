// crates/memori/src/llm/structured.rs
// Structured-output completions with JSON-schema-in-prompt fallback.
//
// Endpoints that support the `json_schema` response format get it directly;
// everything else (local models, proxies) receives the schema inside the
// system prompt and the reply is parsed manually after stripping markdown
// fences.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{MemoriError, Result};
use crate::llm::client::ChatClient;
use crate::llm::types::{ChatParams, Message, ResponseFormat};

/// Run a completion that must produce a `T`.
pub async fn structured_completion<T>(
    client: &dyn ChatClient,
    schema_name: &str,
    system_prompt: &str,
    user_prompt: &str,
) -> Result<T>
where
    T: DeserializeOwned + JsonSchema,
{
    let schema = serde_json::to_value(schemars::schema_for!(T))?;

    if client.supports_structured_output() {
        let params = ChatParams {
            temperature: Some(0.1),
            max_tokens: None,
            response_format: Some(ResponseFormat {
                name: schema_name.to_string(),
                schema: schema.clone(),
            }),
        };
        let messages = vec![Message::system(system_prompt), Message::user(user_prompt)];

        match client.chat(messages, params).await {
            Ok(result) => {
                let content = result
                    .content
                    .ok_or_else(|| MemoriError::Llm("empty structured response".into()))?;
                match serde_json::from_str::<T>(&content) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        warn!(
                            schema = schema_name,
                            error = %e,
                            "structured output did not match schema, retrying with prompt fallback"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    schema = schema_name,
                    error = %e,
                    "structured output request failed, retrying with prompt fallback"
                );
            }
        }
    }

    prompt_fallback_completion(client, schema_name, system_prompt, user_prompt, &schema).await
}

/// JSON-schema-in-prompt fallback for endpoints without structured outputs.
async fn prompt_fallback_completion<T>(
    client: &dyn ChatClient,
    schema_name: &str,
    system_prompt: &str,
    user_prompt: &str,
    schema: &serde_json::Value,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let json_system_prompt = format!(
        "{system_prompt}\n\nIMPORTANT: You MUST respond with a valid JSON object that matches this exact schema:\n{}\n\nRespond ONLY with the JSON object, no additional text or formatting.",
        serde_json::to_string_pretty(schema)?
    );

    let params = ChatParams {
        temperature: Some(0.1),
        max_tokens: Some(1000),
        response_format: None,
    };
    let messages = vec![
        Message::system(json_system_prompt),
        Message::user(user_prompt),
    ];

    let result = client.chat(messages, params).await?;
    let content = result
        .content
        .ok_or_else(|| MemoriError::Llm("empty response from model".into()))?;

    let cleaned = strip_markdown_fences(&content);
    debug!(schema = schema_name, "parsing prompt-fallback JSON response");

    serde_json::from_str::<T>(cleaned).map_err(|e| {
        MemoriError::Llm(format!(
            "failed to parse JSON response for {schema_name}: {e}"
        ))
    })
}

/// Strip ```json / ``` fences that models wrap around JSON output.
pub fn strip_markdown_fences(text: &str) -> &str {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_fence() {
        assert_eq!(
            strip_markdown_fences("```json\n{\"a\": 1}\n```"),
            "{\"a\": 1}"
        );
    }

    #[test]
    fn test_strip_plain_fence() {
        assert_eq!(strip_markdown_fences("```\n{}\n```"), "{}");
    }

    #[test]
    fn test_strip_no_fence() {
        assert_eq!(strip_markdown_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_unterminated_fence() {
        assert_eq!(strip_markdown_fences("```json\n{\"a\": 1}"), "{\"a\": 1}");
    }
}
