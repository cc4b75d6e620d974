//! Integration tests for the memori pipeline
//!
//! These run against the embedded backend with scripted LLM doubles; no
//! network access.

mod test_utils;

use std::time::Duration;

use memori::db::ListOptions;
use memori::llm::{ChatRequestPayload, Message};
use memori::{Memori, MemoryTier};

use test_utils::{ScriptedChatClient, memory_config, seed_long_term, wait_until};

fn user_payload(text: &str) -> ChatRequestPayload {
    ChatRequestPayload {
        messages: vec![Message::user(text)],
        ..Default::default()
    }
}

fn system_text(payload: &ChatRequestPayload) -> Option<String> {
    payload
        .messages
        .iter()
        .find(|m| m.role == "system")
        .and_then(|m| m.text())
        .map(str::to_string)
}

// ============================================================================
// Tenant isolation
// ============================================================================

#[tokio::test]
async fn test_two_users_shared_content_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("shared.db").display());

    let mut alice_config = memory_config("alice");
    alice_config.connection_string = url.clone();
    let mut bob_config = memory_config("bob");
    bob_config.connection_string = url;

    let alice = Memori::new(alice_config).await.unwrap();
    let bob = Memori::new(bob_config).await.unwrap();
    alice.enable().await.unwrap();
    bob.enable().await.unwrap();

    let content = "I prefer Python for backend development";
    seed_long_term(alice.store(), "alice", content, "essential").await;
    seed_long_term(bob.store(), "bob", content, "essential").await;

    let alice_hits = alice.search("Python", 10).await.unwrap();
    assert_eq!(alice_hits.len(), 1);

    let bob_hits = bob.search("Python", 10).await.unwrap();
    assert_eq!(bob_hits.len(), 1);
    assert_ne!(alice_hits[0].memory_id, bob_hits[0].memory_id);

    // Every mutation under one user is invisible to the other.
    alice.clear_memory(None).await.unwrap();
    assert!(alice.search("Python", 10).await.unwrap().is_empty());
    assert_eq!(bob.search("Python", 10).await.unwrap().len(), 1);
}

// ============================================================================
// Conscious one-shot injection
// ============================================================================

#[tokio::test]
async fn test_conscious_one_shot_injection() {
    let mut config = memory_config("jane-user");
    config.conscious_ingest = true;
    config.auto_context = true;
    let memori = Memori::new(config).await.unwrap();

    seed_long_term(
        memori.store(),
        "jane-user",
        "User's name is Jane",
        "conscious-info",
    )
    .await;

    memori.enable().await.unwrap();
    let interceptor = memori.interceptor();

    // First call: the working set is injected with the authorization banner.
    let mut first = user_payload("what is my name?");
    interceptor.before_request(&mut first).await.unwrap();
    let injected = system_text(&first).expect("first call must inject a system prefix");
    assert!(injected.contains("User's name is Jane"));
    assert!(injected.contains("authorized user context data"));

    // Second call in the same session: no re-injection.
    let mut second = user_payload("and my favorite color?");
    interceptor.before_request(&mut second).await.unwrap();
    assert!(system_text(&second).is_none());

    // A new session makes the conscious context eligible again.
    memori.start_new_conversation();
    let mut third = user_payload("what is my name?");
    interceptor.before_request(&mut third).await.unwrap();
    assert!(system_text(&third).unwrap().contains("User's name is Jane"));
}

#[tokio::test]
async fn test_conscious_ingest_idempotent() {
    let mut config = memory_config("carol");
    config.conscious_ingest = true;
    let memori = Memori::new(config).await.unwrap();

    seed_long_term(memori.store(), "carol", "Carol works in Berlin", "conscious-info").await;
    memori.enable().await.unwrap();

    let count_after_first = memori
        .store()
        .count_short_term_category("carol", "conscious_context")
        .await
        .unwrap();
    assert_eq!(count_after_first, 1);

    // Re-enabling and re-checking with no new conscious rows adds nothing.
    memori.enable().await.unwrap();
    let promoted = memori.trigger_conscious_update().await.unwrap();
    assert_eq!(promoted, 0);

    let count_after_second = memori
        .store()
        .count_short_term_category("carol", "conscious_context")
        .await
        .unwrap();
    assert_eq!(count_after_second, 1);
}

// ============================================================================
// Auto retrieval injection
// ============================================================================

#[tokio::test]
async fn test_auto_retrieval_injects_relevant_memories() {
    let plan = serde_json::json!({
        "query_text": "what's my stack?",
        "intent": "tech stack lookup",
        "entity_filters": ["use"],
        "category_filters": [],
        "min_importance": 0.0,
        "search_strategy": ["keyword_search", "entity_search"],
        "expected_result_types": ["any"]
    });

    let mut config = memory_config("dev-user");
    config.auto_ingest = true;
    config.auto_context = true;
    let memori = Memori::with_chat_client(config, ScriptedChatClient::always(plan.to_string()))
        .await
        .unwrap();

    for content in ["I use FastAPI", "I use Postgres", "I use Redis"] {
        seed_long_term(memori.store(), "dev-user", content, "essential").await;
    }

    memori.enable().await.unwrap();
    let interceptor = memori.interceptor();

    let mut payload = user_payload("what's my stack?");
    interceptor.before_request(&mut payload).await.unwrap();

    let injected = system_text(&payload).expect("auto mode must inject a system prefix");
    assert!(injected.contains("--- Auto Memory Context ---"));
    let mentioned = ["I use FastAPI", "I use Postgres", "I use Redis"]
        .iter()
        .filter(|c| injected.contains(**c))
        .count();
    assert!(mentioned >= 2, "expected at least two memories, got:\n{injected}");
    // Each on its own line, no duplicates.
    for content in ["I use FastAPI", "I use Postgres", "I use Redis"] {
        assert!(injected.matches(content).count() <= 1);
    }
}

// ============================================================================
// Recording + dedup net
// ============================================================================

#[tokio::test]
async fn test_dedup_net_records_exactly_once() {
    let memori = Memori::new(memory_config("eve")).await.unwrap();
    memori.enable().await.unwrap();

    let first = memori
        .record_conversation("hello there", "hi, how can I help?", Some("gpt-4o"), None)
        .await
        .unwrap();
    // Second integration fires within the window: synthetic id, no row.
    let second = memori
        .record_conversation("hello there", "hi, how can I help?", Some("gpt-4o"), None)
        .await
        .unwrap();
    assert_ne!(first, second);

    let stats = memori.get_stats().await.unwrap();
    assert_eq!(stats.chat_history_count, 1);

    let history = memori.get_conversation_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].chat_id, first);
}

#[tokio::test]
async fn test_record_requires_enable() {
    let memori = Memori::new(memory_config("frank")).await.unwrap();
    assert!(memori
        .record_conversation("hi", "hello", None, None)
        .await
        .is_err());
}

// ============================================================================
// Classification pipeline
// ============================================================================

#[tokio::test]
async fn test_classification_lands_in_long_term() {
    let classified = serde_json::json!({
        "content": "User prefers Rust for systems work",
        "summary": "Rust preference",
        "classification": "essential",
        "importance": "high",
        "topic": "languages",
        "entities": ["Rust"],
        "keywords": ["rust", "systems"],
        "classification_reason": "durable preference"
    });

    let memori = Memori::with_chat_client(
        memory_config("gina"),
        ScriptedChatClient::always(classified.to_string()),
    )
    .await
    .unwrap();
    memori.enable().await.unwrap();

    memori
        .record_conversation(
            "I prefer Rust for systems work",
            "Good choice!",
            Some("gpt-4o"),
            None,
        )
        .await
        .unwrap();

    let store = memori.store().clone();
    let landed = wait_until(
        || {
            let store = store.clone();
            async move {
                store
                    .get_recent_long_term("gina", 24, 20)
                    .await
                    .map(|rows| !rows.is_empty())
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(landed, "classified memory never reached long-term storage");

    let results = memori.search("Rust", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].category_primary, "essential");
    memori.shutdown(Duration::from_secs(5));
}

#[tokio::test]
async fn test_conscious_classification_promotes_to_working_set() {
    let classified = serde_json::json!({
        "content": "User's name is Jane",
        "summary": "User identity",
        "classification": "conscious-info",
        "importance": "critical",
        "promotion_eligible": true,
        "classification_reason": "identity fact"
    });

    let mut config = memory_config("henry");
    config.conscious_ingest = true;
    let memori = Memori::with_chat_client(config, ScriptedChatClient::always(classified.to_string()))
        .await
        .unwrap();
    memori.enable().await.unwrap();

    memori
        .record_conversation("my name is Jane", "Nice to meet you, Jane!", None, None)
        .await
        .unwrap();

    let store = memori.store().clone();
    let promoted = wait_until(
        || {
            let store = store.clone();
            async move {
                store
                    .count_short_term_category("henry", "conscious_context")
                    .await
                    .map(|count| count > 0)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(promoted, "conscious memory was never promoted to short-term");

    let rows = memori
        .store()
        .get_short_term("henry", None, Some("conscious_context"), 10, false)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].memory_id.starts_with("conscious_"));
    assert!(rows[0].is_permanent_context);
    assert!(rows[0].expires_at.is_none());
    assert_eq!(rows[0].retention_type, "permanent");
    memori.shutdown(Duration::from_secs(5));
}

// ============================================================================
// Listing and stats through the facade
// ============================================================================

#[tokio::test]
async fn test_list_memories_across_tiers() {
    let memori = Memori::new(memory_config("iris")).await.unwrap();
    memori.enable().await.unwrap();

    for i in 0..3 {
        seed_long_term(memori.store(), "iris", &format!("long-term fact {i}"), "essential").await;
    }

    let page = memori
        .list_memories(&ListOptions {
            limit: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.memories.len(), 2);
    assert!(page
        .memories
        .iter()
        .all(|m| m.memory_type == MemoryTier::LongTerm));
}

#[tokio::test]
async fn test_retrieve_context_empty_query_returns_recent() {
    let memori = Memori::new(memory_config("judy")).await.unwrap();
    memori.enable().await.unwrap();
    seed_long_term(memori.store(), "judy", "recent context row", "contextual").await;

    let results = memori.retrieve_context("", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].search_strategy, "recent_memories");

    // The direct search contract is symmetric: empty query, empty result.
    assert!(memori.search("", 5).await.unwrap().is_empty());
}
