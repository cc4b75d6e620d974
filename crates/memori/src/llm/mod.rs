// crates/memori/src/llm/mod.rs
// LLM provider surface: chat clients + structured output helpers

mod client;
mod http_client;
mod structured;
pub mod types;

pub use client::{ChatClient, OpenAiCompatClient, parse_completion_response};
pub use http_client::LlmHttpClient;
pub use structured::{strip_markdown_fences, structured_completion};
pub use types::{
    ChatParams, ChatRequestPayload, ChatResult, ContentPart, ImageRef, Message, MessageContent,
    ResponseFormat, ToolCallInfo, Usage,
};
