// crates/memori/src/db/schema/postgres.rs
// Server backend schema: tables, tsvector columns maintained by triggers,
// and GIN indexes. Uses IF NOT EXISTS / CREATE OR REPLACE throughout so
// setup is idempotent against partial prior initialization.

use sqlx::PgPool;

use crate::error::Result;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_history (
    chat_id VARCHAR(255) PRIMARY KEY,
    user_input TEXT NOT NULL,
    ai_output TEXT NOT NULL,
    model VARCHAR(255) NOT NULL,
    session_id VARCHAR(255) NOT NULL,
    tokens_used BIGINT DEFAULT 0,
    metadata_json TEXT,
    user_id VARCHAR(255) NOT NULL DEFAULT 'default',
    assistant_id VARCHAR(255),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_chat_user_id ON chat_history(user_id);
CREATE INDEX IF NOT EXISTS idx_chat_user_assistant ON chat_history(user_id, assistant_id);
CREATE INDEX IF NOT EXISTS idx_chat_created ON chat_history(created_at);

CREATE TABLE IF NOT EXISTS short_term_memory (
    memory_id VARCHAR(255) PRIMARY KEY,
    chat_id VARCHAR(255) REFERENCES chat_history(chat_id) ON DELETE SET NULL,
    processed_data TEXT NOT NULL,
    importance_score DOUBLE PRECISION NOT NULL DEFAULT 0.5,
    category_primary VARCHAR(255) NOT NULL,
    retention_type VARCHAR(50) NOT NULL DEFAULT 'short_term',
    user_id VARCHAR(255) NOT NULL DEFAULT 'default',
    assistant_id VARCHAR(255),
    session_id VARCHAR(255) NOT NULL DEFAULT 'default',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at TIMESTAMPTZ,
    searchable_content TEXT NOT NULL,
    summary TEXT NOT NULL,
    is_permanent_context BOOLEAN DEFAULT FALSE,
    access_count BIGINT DEFAULT 0,
    last_accessed TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_short_term_user_id ON short_term_memory(user_id);
CREATE INDEX IF NOT EXISTS idx_short_term_category ON short_term_memory(category_primary);
CREATE INDEX IF NOT EXISTS idx_short_term_expires ON short_term_memory(expires_at);
CREATE INDEX IF NOT EXISTS idx_short_term_user_category
    ON short_term_memory(user_id, category_primary, importance_score);

CREATE TABLE IF NOT EXISTS long_term_memory (
    memory_id VARCHAR(255) PRIMARY KEY,
    processed_data TEXT NOT NULL,
    importance_score DOUBLE PRECISION NOT NULL DEFAULT 0.5,
    category_primary VARCHAR(255) NOT NULL,
    retention_type VARCHAR(50) NOT NULL DEFAULT 'long_term',
    user_id VARCHAR(255) NOT NULL DEFAULT 'default',
    assistant_id VARCHAR(255),
    session_id VARCHAR(255) NOT NULL DEFAULT 'default',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    searchable_content TEXT NOT NULL,
    summary TEXT NOT NULL,
    novelty_score DOUBLE PRECISION DEFAULT 0.5,
    relevance_score DOUBLE PRECISION DEFAULT 0.5,
    actionability_score DOUBLE PRECISION DEFAULT 0.5,
    classification VARCHAR(50) NOT NULL DEFAULT 'conversational',
    memory_importance VARCHAR(20) NOT NULL DEFAULT 'medium',
    topic VARCHAR(255),
    entities_json TEXT,
    keywords_json TEXT,
    is_user_context BOOLEAN DEFAULT FALSE,
    is_preference BOOLEAN DEFAULT FALSE,
    is_skill_knowledge BOOLEAN DEFAULT FALSE,
    is_current_project BOOLEAN DEFAULT FALSE,
    promotion_eligible BOOLEAN DEFAULT FALSE,
    duplicate_of VARCHAR(255),
    supersedes_json TEXT,
    related_memories_json TEXT,
    confidence_score DOUBLE PRECISION DEFAULT 0.8,
    classification_reason TEXT,
    processed_for_duplicates BOOLEAN DEFAULT FALSE,
    conscious_processed BOOLEAN DEFAULT FALSE,
    access_count BIGINT DEFAULT 0,
    last_accessed TIMESTAMPTZ,
    version BIGINT NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_long_term_user_id ON long_term_memory(user_id);
CREATE INDEX IF NOT EXISTS idx_long_term_user_assistant ON long_term_memory(user_id, assistant_id);
CREATE INDEX IF NOT EXISTS idx_long_term_classification ON long_term_memory(classification);
CREATE INDEX IF NOT EXISTS idx_long_term_conscious_processed ON long_term_memory(conscious_processed);
CREATE INDEX IF NOT EXISTS idx_long_term_created ON long_term_memory(created_at);
CREATE INDEX IF NOT EXISTS idx_long_term_user_category
    ON long_term_memory(user_id, category_primary, importance_score);

ALTER TABLE short_term_memory ADD COLUMN IF NOT EXISTS search_vector tsvector;
ALTER TABLE long_term_memory ADD COLUMN IF NOT EXISTS search_vector tsvector;

CREATE INDEX IF NOT EXISTS idx_short_term_search_vector
    ON short_term_memory USING GIN(search_vector);
CREATE INDEX IF NOT EXISTS idx_long_term_search_vector
    ON long_term_memory USING GIN(search_vector);

CREATE OR REPLACE FUNCTION update_short_term_search_vector() RETURNS trigger AS $$
BEGIN
    NEW.search_vector := to_tsvector('english',
        COALESCE(NEW.searchable_content, '') || ' ' || COALESCE(NEW.summary, ''));
    RETURN NEW;
END
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION update_long_term_search_vector() RETURNS trigger AS $$
BEGIN
    NEW.search_vector := to_tsvector('english',
        COALESCE(NEW.searchable_content, '') || ' ' || COALESCE(NEW.summary, '')
        || ' ' || COALESCE(NEW.topic, ''));
    RETURN NEW;
END
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS update_short_term_search_vector_trigger ON short_term_memory;
CREATE TRIGGER update_short_term_search_vector_trigger
    BEFORE INSERT OR UPDATE ON short_term_memory
    FOR EACH ROW EXECUTE FUNCTION update_short_term_search_vector();

DROP TRIGGER IF EXISTS update_long_term_search_vector_trigger ON long_term_memory;
CREATE TRIGGER update_long_term_search_vector_trigger
    BEFORE INSERT OR UPDATE ON long_term_memory
    FOR EACH ROW EXECUTE FUNCTION update_long_term_search_vector();
"#;

/// Run all schema setup. Idempotent.
pub async fn initialize(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::debug!("postgresql schema initialized");
    Ok(())
}
