//! Shared fixtures for memori integration tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use memori::config::MemoriConfig;
use memori::context::TenantContext;
use memori::db::MemoryStore;
use memori::error::{MemoriError, Result};
use memori::llm::{ChatClient, ChatParams, ChatResult, Message};
use memori_types::ProcessedLongTermMemory;

/// Chat client double that replays canned response bodies in order. When
/// the queue runs dry it keeps replaying the last response.
pub struct ScriptedChatClient {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl ScriptedChatClient {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
        })
    }

    /// Client that always answers with one JSON body.
    pub fn always(response: impl Into<String>) -> Arc<Self> {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn chat(&self, _messages: Vec<Message>, _params: ChatParams) -> Result<ChatResult> {
        let next = {
            let mut queue = self.responses.lock().unwrap();
            queue.pop_front()
        };
        let content = match next {
            Some(content) => {
                *self.last.lock().unwrap() = Some(content.clone());
                content
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| MemoriError::Llm("scripted client has no responses".into()))?,
        };

        Ok(ChatResult {
            request_id: "scripted".into(),
            content: Some(content),
            tool_calls: Vec::new(),
            usage: None,
            model: Some("scripted".into()),
            duration_ms: 0,
        })
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    fn model_name(&self) -> String {
        "scripted".into()
    }
}

/// Base config on an in-memory sqlite backend, with test logging wired up.
pub fn memory_config(user_id: &str) -> MemoriConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = MemoriConfig::new("sqlite::memory:", user_id);
    config.session_id = Some(format!("session-{user_id}"));
    config
}

/// Seed one classified long-term memory directly through the store.
pub async fn seed_long_term(
    store: &Arc<dyn MemoryStore>,
    user_id: &str,
    content: &str,
    classification: &str,
) -> String {
    let memory: ProcessedLongTermMemory = serde_json::from_value(serde_json::json!({
        "content": content,
        "summary": content,
        "classification": classification,
        "importance": "high",
        "classification_reason": "seeded fixture",
    }))
    .unwrap();
    store
        .store_long_term(
            &memory,
            None,
            &TenantContext::new(user_id, None, "seed-session"),
        )
        .await
        .unwrap()
}

/// Poll until `probe` reports true or the timeout elapses.
pub async fn wait_until<F, Fut>(mut probe: F, timeout: std::time::Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    false
}
