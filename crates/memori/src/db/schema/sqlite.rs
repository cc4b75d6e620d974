// crates/memori/src/db/schema/sqlite.rs
// Embedded backend schema: tables, indexes, FTS5 virtual table + triggers

use sqlx::SqlitePool;

use crate::error::Result;

/// Base tables and indexes.
pub const SCHEMA: &str = r#"
-- =======================================
-- CHAT HISTORY
-- =======================================
CREATE TABLE IF NOT EXISTS chat_history (
    chat_id TEXT PRIMARY KEY,
    user_input TEXT NOT NULL,
    ai_output TEXT NOT NULL,
    model TEXT NOT NULL,
    session_id TEXT NOT NULL,
    tokens_used INTEGER DEFAULT 0,
    metadata_json TEXT,
    user_id TEXT NOT NULL DEFAULT 'default',
    assistant_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_chat_user_id ON chat_history(user_id);
CREATE INDEX IF NOT EXISTS idx_chat_user_assistant ON chat_history(user_id, assistant_id);
CREATE INDEX IF NOT EXISTS idx_chat_created ON chat_history(created_at);

-- =======================================
-- SHORT-TERM MEMORY (working set)
-- =======================================
CREATE TABLE IF NOT EXISTS short_term_memory (
    memory_id TEXT PRIMARY KEY,
    chat_id TEXT REFERENCES chat_history(chat_id) ON DELETE SET NULL,
    processed_data TEXT NOT NULL,
    importance_score REAL NOT NULL DEFAULT 0.5,
    category_primary TEXT NOT NULL,
    retention_type TEXT NOT NULL DEFAULT 'short_term',
    user_id TEXT NOT NULL DEFAULT 'default',
    assistant_id TEXT,
    session_id TEXT NOT NULL DEFAULT 'default',
    created_at TEXT NOT NULL,
    expires_at TEXT,
    searchable_content TEXT NOT NULL,
    summary TEXT NOT NULL,
    is_permanent_context INTEGER DEFAULT 0,
    access_count INTEGER DEFAULT 0,
    last_accessed TEXT
);
CREATE INDEX IF NOT EXISTS idx_short_term_user_id ON short_term_memory(user_id);
CREATE INDEX IF NOT EXISTS idx_short_term_category ON short_term_memory(category_primary);
CREATE INDEX IF NOT EXISTS idx_short_term_expires ON short_term_memory(expires_at);
CREATE INDEX IF NOT EXISTS idx_short_term_user_category
    ON short_term_memory(user_id, category_primary, importance_score);

-- =======================================
-- LONG-TERM MEMORY (classified store)
-- =======================================
CREATE TABLE IF NOT EXISTS long_term_memory (
    memory_id TEXT PRIMARY KEY,
    processed_data TEXT NOT NULL,
    importance_score REAL NOT NULL DEFAULT 0.5,
    category_primary TEXT NOT NULL,
    retention_type TEXT NOT NULL DEFAULT 'long_term',
    user_id TEXT NOT NULL DEFAULT 'default',
    assistant_id TEXT,
    session_id TEXT NOT NULL DEFAULT 'default',
    created_at TEXT NOT NULL,
    searchable_content TEXT NOT NULL,
    summary TEXT NOT NULL,
    novelty_score REAL DEFAULT 0.5,
    relevance_score REAL DEFAULT 0.5,
    actionability_score REAL DEFAULT 0.5,
    classification TEXT NOT NULL DEFAULT 'conversational',
    memory_importance TEXT NOT NULL DEFAULT 'medium',
    topic TEXT,
    entities_json TEXT,
    keywords_json TEXT,
    is_user_context INTEGER DEFAULT 0,
    is_preference INTEGER DEFAULT 0,
    is_skill_knowledge INTEGER DEFAULT 0,
    is_current_project INTEGER DEFAULT 0,
    promotion_eligible INTEGER DEFAULT 0,
    duplicate_of TEXT,
    supersedes_json TEXT,
    related_memories_json TEXT,
    confidence_score REAL DEFAULT 0.8,
    classification_reason TEXT,
    processed_for_duplicates INTEGER DEFAULT 0,
    conscious_processed INTEGER DEFAULT 0,
    access_count INTEGER DEFAULT 0,
    last_accessed TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_long_term_user_id ON long_term_memory(user_id);
CREATE INDEX IF NOT EXISTS idx_long_term_user_assistant ON long_term_memory(user_id, assistant_id);
CREATE INDEX IF NOT EXISTS idx_long_term_classification ON long_term_memory(classification);
CREATE INDEX IF NOT EXISTS idx_long_term_conscious_processed ON long_term_memory(conscious_processed);
CREATE INDEX IF NOT EXISTS idx_long_term_created ON long_term_memory(created_at);
CREATE INDEX IF NOT EXISTS idx_long_term_user_category
    ON long_term_memory(user_id, category_primary, importance_score);
"#;

/// FTS5 virtual table shared by both tiers, maintained by insert/delete
/// triggers.
pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memory_search_fts USING fts5(
    memory_id UNINDEXED,
    memory_type UNINDEXED,
    user_id UNINDEXED,
    assistant_id UNINDEXED,
    session_id UNINDEXED,
    searchable_content,
    summary,
    category_primary
);

CREATE TRIGGER IF NOT EXISTS short_term_memory_fts_insert AFTER INSERT ON short_term_memory
BEGIN
    INSERT INTO memory_search_fts(memory_id, memory_type, user_id, assistant_id, session_id, searchable_content, summary, category_primary)
    VALUES (NEW.memory_id, 'short_term', NEW.user_id, NEW.assistant_id, NEW.session_id, NEW.searchable_content, NEW.summary, NEW.category_primary);
END;

CREATE TRIGGER IF NOT EXISTS long_term_memory_fts_insert AFTER INSERT ON long_term_memory
BEGIN
    INSERT INTO memory_search_fts(memory_id, memory_type, user_id, assistant_id, session_id, searchable_content, summary, category_primary)
    VALUES (NEW.memory_id, 'long_term', NEW.user_id, NEW.assistant_id, NEW.session_id, NEW.searchable_content, NEW.summary, NEW.category_primary);
END;

CREATE TRIGGER IF NOT EXISTS short_term_memory_fts_delete AFTER DELETE ON short_term_memory
BEGIN
    DELETE FROM memory_search_fts WHERE memory_id = OLD.memory_id AND memory_type = 'short_term';
END;

CREATE TRIGGER IF NOT EXISTS long_term_memory_fts_delete AFTER DELETE ON long_term_memory
BEGIN
    DELETE FROM memory_search_fts WHERE memory_id = OLD.memory_id AND memory_type = 'long_term';
END;
"#;

/// Run all schema setup. Idempotent.
pub async fn initialize(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    sqlx::raw_sql(FTS_SCHEMA).execute(pool).await?;
    tracing::debug!("sqlite schema initialized");
    Ok(())
}
