// crates/memori/src/db/sqlite_tests.rs
// Embedded-backend tests: schema, CRUD, isolation, expiry, FTS and the
// LIKE fallback.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use memori_types::{MemoryTier, ProcessedLongTermMemory};

use crate::config::PoolSettings;
use crate::context::TenantContext;
use crate::db::types::*;
use crate::db::{MemoryStore, SqliteStore};
use crate::error::MemoriError;

async fn open_memory_store() -> SqliteStore {
    SqliteStore::open("sqlite::memory:", &PoolSettings::default())
        .await
        .expect("failed to open in-memory store")
}

fn tenant(user: &str) -> TenantContext {
    TenantContext::new(user, None, "session-1")
}

fn chat(user: &str, session: &str, input: &str, output: &str) -> ChatRecord {
    ChatRecord {
        chat_id: uuid::Uuid::new_v4().to_string(),
        user_input: input.to_string(),
        ai_output: output.to_string(),
        model: "gpt-4o".into(),
        session_id: session.to_string(),
        user_id: user.to_string(),
        assistant_id: None,
        tokens_used: 10,
        metadata: json!({"integration": "test"}),
        created_at: Utc::now(),
    }
}

fn short_term(user: &str, id: &str, content: &str) -> ShortTermRecord {
    ShortTermRecord {
        memory_id: id.to_string(),
        chat_id: None,
        processed_data: json!({"schema_version": 1}),
        importance_score: 0.5,
        category_primary: "context".into(),
        retention_type: "short_term".into(),
        user_id: user.to_string(),
        assistant_id: None,
        session_id: "session-1".into(),
        created_at: Utc::now(),
        expires_at: None,
        searchable_content: content.to_string(),
        summary: content.to_string(),
        is_permanent_context: false,
        access_count: 0,
        last_accessed: None,
    }
}

fn processed(content: &str) -> ProcessedLongTermMemory {
    serde_json::from_value(json!({
        "content": content,
        "summary": content,
        "classification": "essential",
        "importance": "high",
        "classification_reason": "test fixture",
    }))
    .unwrap()
}

// ============================================================================
// Chat history
// ============================================================================

#[tokio::test]
async fn test_chat_round_trip() {
    let store = open_memory_store().await;
    let record = chat("alice", "s1", "hello", "hi there");
    store.store_chat(&record).await.unwrap();

    let history = store.get_chat_history("alice", Some("s1"), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_input, "hello");
    assert_eq!(history[0].ai_output, "hi there");
    assert_eq!(history[0].model, "gpt-4o");
}

#[tokio::test]
async fn test_chat_upsert_by_chat_id() {
    let store = open_memory_store().await;
    let mut record = chat("alice", "s1", "v1", "r1");
    store.store_chat(&record).await.unwrap();
    record.user_input = "v2".into();
    store.store_chat(&record).await.unwrap();

    let history = store.get_chat_history("alice", None, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_input, "v2");
}

#[tokio::test]
async fn test_chat_history_newest_first() {
    let store = open_memory_store().await;
    for i in 0..3 {
        let mut record = chat("alice", "s1", &format!("msg-{i}"), "r");
        record.created_at = Utc::now() + ChronoDuration::seconds(i);
        store.store_chat(&record).await.unwrap();
    }
    let history = store.get_chat_history("alice", None, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].user_input, "msg-2");
    assert_eq!(history[1].user_input, "msg-1");
}

#[tokio::test]
async fn test_empty_user_id_fails_closed() {
    let store = open_memory_store().await;
    assert!(matches!(
        store.get_chat_history("", None, 10).await,
        Err(MemoriError::InvalidTenant(_))
    ));
    assert!(matches!(
        store
            .search_memories("query", &SearchFilters::for_user("", 5))
            .await,
        Err(MemoriError::InvalidTenant(_))
    ));
}

// ============================================================================
// Short-term memory
// ============================================================================

#[tokio::test]
async fn test_short_term_store_and_find() {
    let store = open_memory_store().await;
    store
        .store_short_term(&short_term("alice", "st-1", "likes tea"))
        .await
        .unwrap();

    let found = store.find_short_term_by_id("st-1", "alice").await.unwrap();
    assert_eq!(found.unwrap().searchable_content, "likes tea");

    // Other users cannot see it.
    assert!(store
        .find_short_term_by_id("st-1", "bob")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_short_term_replace_by_memory_id() {
    let store = open_memory_store().await;
    store
        .store_short_term(&short_term("alice", "st-1", "old content"))
        .await
        .unwrap();
    store
        .store_short_term(&short_term("alice", "st-1", "new content"))
        .await
        .unwrap();

    let rows = store
        .get_short_term("alice", None, None, 10, false)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].searchable_content, "new content");
}

#[tokio::test]
async fn test_expired_rows_invisible_to_retrieval() {
    let store = open_memory_store().await;

    let mut expired = short_term("alice", "st-expired", "stale context");
    expired.expires_at = Some(Utc::now() - ChronoDuration::hours(1));
    store.store_short_term(&expired).await.unwrap();

    let mut permanent = short_term("alice", "st-permanent", "permanent context");
    permanent.expires_at = Some(Utc::now() - ChronoDuration::hours(1));
    permanent.is_permanent_context = true;
    store.store_short_term(&permanent).await.unwrap();

    let mut live = short_term("alice", "st-live", "live context");
    live.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
    store.store_short_term(&live).await.unwrap();

    let visible = store
        .get_short_term("alice", None, None, 10, false)
        .await
        .unwrap();
    let ids: Vec<&str> = visible.iter().map(|r| r.memory_id.as_str()).collect();
    assert!(ids.contains(&"st-permanent"));
    assert!(ids.contains(&"st-live"));
    assert!(!ids.contains(&"st-expired"));

    let all = store
        .get_short_term("alice", None, None, 10, true)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_memory_id_validation() {
    let store = open_memory_store().await;
    let mut row = short_term("alice", "", "content");
    assert!(matches!(
        store.store_short_term(&row).await,
        Err(MemoriError::Validation(_))
    ));

    row.memory_id = "x".repeat(256);
    assert!(matches!(
        store.store_short_term(&row).await,
        Err(MemoriError::Validation(_))
    ));

    row.memory_id = "x".repeat(255);
    store.store_short_term(&row).await.unwrap();
}

// ============================================================================
// Long-term memory + conscious operations
// ============================================================================

#[tokio::test]
async fn test_long_term_store_and_search() {
    let store = open_memory_store().await;
    let id = store
        .store_long_term(
            &processed("I prefer Python for backend development"),
            None,
            &tenant("alice"),
        )
        .await
        .unwrap();
    assert!(!id.is_empty());

    let results = store
        .search_memories("Python", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory_type, MemoryTier::LongTerm);
    assert_eq!(results[0].search_strategy, "sqlite_fts5");
    assert!(results[0].searchable_content.contains("Python"));
}

#[tokio::test]
async fn test_tenant_isolation_in_search() {
    let store = open_memory_store().await;
    let content = "I prefer Python for backend development";
    store
        .store_long_term(&processed(content), None, &tenant("alice"))
        .await
        .unwrap();
    store
        .store_long_term(&processed(content), None, &tenant("bob"))
        .await
        .unwrap();

    let alice_hits = store
        .search_memories("Python", &SearchFilters::for_user("alice", 10))
        .await
        .unwrap();
    assert_eq!(alice_hits.len(), 1);

    let bob_hits = store
        .search_memories("Python", &SearchFilters::for_user("bob", 10))
        .await
        .unwrap();
    assert_eq!(bob_hits.len(), 1);
    assert_ne!(alice_hits[0].memory_id, bob_hits[0].memory_id);
}

#[tokio::test]
async fn test_assistant_isolation_long_term() {
    let store = open_memory_store().await;

    let shared = tenant("alice");
    store
        .store_long_term(&processed("shared memory about rust"), None, &shared)
        .await
        .unwrap();

    let scoped = TenantContext::new("alice", Some("bot-a".into()), "session-1");
    store
        .store_long_term(&processed("bot-a memory about rust"), None, &scoped)
        .await
        .unwrap();

    // assistant_id given: shared (NULL) rows plus its own.
    let mut filters = SearchFilters::for_user("alice", 10);
    filters.assistant_id = Some("bot-a".into());
    let hits = store.search_memories("rust", &filters).await.unwrap();
    assert_eq!(hits.len(), 2);

    // No assistant: only shared rows.
    let hits = store
        .search_memories("rust", &SearchFilters::for_user("alice", 10))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].searchable_content.contains("shared"));

    // A different assistant cannot see bot-a's rows.
    let mut other = SearchFilters::for_user("alice", 10);
    other.assistant_id = Some("bot-b".into());
    let hits = store.search_memories("rust", &other).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_conscious_memories_and_processing_flag() {
    let store = open_memory_store().await;
    let mut memory = processed("User's name is Jane");
    memory.classification = memori_types::MemoryClassification::ConsciousInfo;
    memory.promotion_eligible = true;
    let id = store
        .store_long_term(&memory, None, &tenant("alice"))
        .await
        .unwrap();

    let unprocessed = store
        .get_conscious_memories("alice", true, None)
        .await
        .unwrap();
    assert_eq!(unprocessed.len(), 1);
    assert_eq!(unprocessed[0].memory_id, id);

    let updated = store
        .mark_conscious_processed(&[id.clone()], "alice")
        .await
        .unwrap();
    assert_eq!(updated, 1);

    assert!(store
        .get_conscious_memories("alice", true, None)
        .await
        .unwrap()
        .is_empty());
    // Still visible without the unprocessed filter.
    assert_eq!(
        store
            .get_conscious_memories("alice", false, None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_recent_long_term_window() {
    let store = open_memory_store().await;
    store
        .store_long_term(&processed("fresh memory"), None, &tenant("alice"))
        .await
        .unwrap();

    let recent = store.get_recent_long_term("alice", 24, 20).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].summary, "fresh memory");

    // A zero-hour window excludes everything.
    let none = store.get_recent_long_term("alice", 0, 20).await.unwrap();
    assert!(none.is_empty());
}

// ============================================================================
// Search behavior
// ============================================================================

#[tokio::test]
async fn test_empty_query_returns_empty() {
    let store = open_memory_store().await;
    store
        .store_long_term(&processed("something"), None, &tenant("alice"))
        .await
        .unwrap();

    let results = store
        .search_memories("", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert!(results.is_empty());
    let results = store
        .search_memories("   ", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_like_fallback_when_fts_misses() {
    let store = open_memory_store().await;
    // FTS phrase match on "FastAPI framework" fails for this row, but the
    // per-word LIKE pattern finds it.
    store
        .store_long_term(
            &processed("My framework of choice is FastAPI for APIs"),
            None,
            &tenant("alice"),
        )
        .await
        .unwrap();

    let results = store
        .search_memories("FastAPI framework", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].search_strategy, "sqlite_like_fallback");
    assert_eq!(results[0].search_score, 0.4);
}

#[tokio::test]
async fn test_like_fallback_after_fts_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("memori.db").display());
    let store = SqliteStore::open(&url, &PoolSettings::default()).await.unwrap();

    store
        .store_long_term(
            &processed("I prefer Python for backend development"),
            None,
            &tenant("alice"),
        )
        .await
        .unwrap();

    // Simulate a corrupted full-text index.
    sqlx::query("DROP TABLE memory_search_fts")
        .execute(store.pool())
        .await
        .unwrap();

    let results = store
        .search_memories("Python", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].search_strategy.ends_with("_like_fallback"));
    assert_eq!(results[0].search_score, 0.4);
}

#[tokio::test]
async fn test_special_characters_round_trip() {
    let store = open_memory_store().await;
    let nasty = "Robert'); DROP TABLE long_term_memory;-- \"quoted\" und sösciäl — 中文 🎉";
    store
        .store_long_term(&processed(nasty), None, &tenant("alice"))
        .await
        .unwrap();

    let results = store
        .search_memories("quoted", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].searchable_content, nasty);

    // Tables survived.
    store
        .store_long_term(&processed("still works"), None, &tenant("alice"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_large_content_round_trip() {
    let store = open_memory_store().await;
    let large = format!("searchable marker {}", "x".repeat(12 * 1024));
    store
        .store_long_term(&processed(&large), None, &tenant("alice"))
        .await
        .unwrap();

    let results = store
        .search_memories("marker", &SearchFilters::for_user("alice", 5))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].searchable_content.len() >= 12 * 1024);
}

#[tokio::test]
async fn test_get_recent_memories_split_across_tiers() {
    let store = open_memory_store().await;
    store
        .store_short_term(&short_term("alice", "st-1", "short term row"))
        .await
        .unwrap();
    store
        .store_long_term(&processed("long term row"), None, &tenant("alice"))
        .await
        .unwrap();

    let recent = store
        .get_recent_memories(&SearchFilters::for_user("alice", 4))
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().any(|r| r.memory_type == MemoryTier::ShortTerm));
    assert!(recent.iter().any(|r| r.memory_type == MemoryTier::LongTerm));
    assert!(recent.iter().all(|r| r.search_strategy == "recent_memories"));
}

// ============================================================================
// Listing, stats, clearing
// ============================================================================

#[tokio::test]
async fn test_list_memories_union_sorted() {
    let store = open_memory_store().await;
    let base = Utc::now();
    for i in 0..3 {
        let mut row = short_term("alice", &format!("st-{i}"), &format!("short {i}"));
        row.created_at = base + ChronoDuration::seconds(i);
        store.store_short_term(&row).await.unwrap();
    }
    for i in 0..3 {
        store
            .store_long_term(&processed(&format!("long {i}")), None, &tenant("alice"))
            .await
            .unwrap();
    }

    let options = ListOptions {
        limit: 4,
        ..Default::default()
    };
    let page = store.list_memories("alice", &options).await.unwrap();
    assert_eq!(page.total_count, 6);
    assert_eq!(page.memories.len(), 4);
    for pair in page.memories.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
    }
    // Both tiers are represented and tagged.
    assert!(page
        .memories
        .iter()
        .any(|m| m.memory_type == MemoryTier::ShortTerm));
}

#[tokio::test]
async fn test_list_memories_single_tier_and_order() {
    let store = open_memory_store().await;
    for i in 0..2 {
        let mut row = short_term("alice", &format!("st-{i}"), &format!("short {i}"));
        row.importance_score = 0.1 * (i as f64 + 1.0);
        store.store_short_term(&row).await.unwrap();
    }

    let options = ListOptions {
        memory_type: "short_term".into(),
        sort_by: "importance".into(),
        order: "asc".into(),
        ..Default::default()
    };
    let page = store.list_memories("alice", &options).await.unwrap();
    assert_eq!(page.total_count, 2);
    assert!(page.memories[0].importance_score <= page.memories[1].importance_score);
}

#[tokio::test]
async fn test_memory_stats() {
    let store = open_memory_store().await;
    store.store_chat(&chat("alice", "s1", "q", "a")).await.unwrap();
    store
        .store_short_term(&short_term("alice", "st-1", "c"))
        .await
        .unwrap();
    store
        .store_long_term(&processed("fact one"), None, &tenant("alice"))
        .await
        .unwrap();
    // Other tenants do not pollute stats.
    store
        .store_long_term(&processed("bob fact"), None, &tenant("bob"))
        .await
        .unwrap();

    let stats = store.get_memory_stats("alice").await.unwrap();
    assert_eq!(stats.chat_history_count, 1);
    assert_eq!(stats.short_term_count, 1);
    assert_eq!(stats.long_term_count, 1);
    assert_eq!(stats.database_type, "sqlite");
    assert!(stats.average_importance > 0.0);
    assert_eq!(stats.memories_by_category.get("context"), Some(&1));
    assert_eq!(stats.memories_by_category.get("essential"), Some(&1));
}

#[tokio::test]
async fn test_clear_memory_scoped_to_tenant_and_tier() {
    let store = open_memory_store().await;
    store.store_chat(&chat("alice", "s1", "q", "a")).await.unwrap();
    store
        .store_short_term(&short_term("alice", "st-1", "c"))
        .await
        .unwrap();
    store
        .store_long_term(&processed("fact"), None, &tenant("alice"))
        .await
        .unwrap();
    store
        .store_long_term(&processed("bob keeps this"), None, &tenant("bob"))
        .await
        .unwrap();

    let deleted = store.clear_memory("alice", Some("short_term")).await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(store.count_memories("alice").await.unwrap(), 1);

    let deleted = store.clear_memory("alice", None).await.unwrap();
    assert_eq!(deleted, 2); // long-term row + chat row
    assert_eq!(store.count_memories("alice").await.unwrap(), 0);
    assert_eq!(store.count_memories("bob").await.unwrap(), 1);
}

#[tokio::test]
async fn test_clear_memory_unknown_tier() {
    let store = open_memory_store().await;
    assert!(matches!(
        store.clear_memory("alice", Some("bogus")).await,
        Err(MemoriError::Validation(_))
    ));
}

#[tokio::test]
async fn test_pool_status_observable() {
    let store = open_memory_store().await;
    let status = store.pool_status();
    assert!(status.size >= 1);
    assert_eq!(status.max_size, 1); // in-memory pins to one connection
}
