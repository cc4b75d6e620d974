// crates/memori/src/db/schema/mysql.rs
// Server backend schema: tables plus FULLTEXT indexes. FULLTEXT creation is
// guarded by information_schema lookups so re-running setup against a
// partially initialized database is safe.

use sqlx::MySqlPool;

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
    created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    updated_at TIMESTAMP(6) NULL,
    INDEX idx_chat_user_id (user_id),
    INDEX idx_chat_user_assistant (user_id, assistant_id),
    INDEX idx_chat_created (created_at)
);

CREATE TABLE IF NOT EXISTS short_term_memory (
    memory_id VARCHAR(255) PRIMARY KEY,
    chat_id VARCHAR(255),
    processed_data TEXT NOT NULL,
    importance_score DOUBLE NOT NULL DEFAULT 0.5,
    category_primary VARCHAR(255) NOT NULL,
    retention_type VARCHAR(50) NOT NULL DEFAULT 'short_term',
    user_id VARCHAR(255) NOT NULL DEFAULT 'default',
    assistant_id VARCHAR(255),
    session_id VARCHAR(255) NOT NULL DEFAULT 'default',
    created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    expires_at TIMESTAMP(6) NULL,
    searchable_content TEXT NOT NULL,
    summary TEXT NOT NULL,
    is_permanent_context BOOLEAN DEFAULT FALSE,
    access_count BIGINT DEFAULT 0,
    last_accessed TIMESTAMP(6) NULL,
    INDEX idx_short_term_user_id (user_id),
    INDEX idx_short_term_category (category_primary),
    INDEX idx_short_term_expires (expires_at),
    INDEX idx_short_term_user_category (user_id, category_primary, importance_score),
    CONSTRAINT fk_short_term_chat FOREIGN KEY (chat_id)
        REFERENCES chat_history(chat_id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS long_term_memory (
    memory_id VARCHAR(255) PRIMARY KEY,
    processed_data TEXT NOT NULL,
    importance_score DOUBLE NOT NULL DEFAULT 0.5,
    category_primary VARCHAR(255) NOT NULL,
    retention_type VARCHAR(50) NOT NULL DEFAULT 'long_term',
    user_id VARCHAR(255) NOT NULL DEFAULT 'default',
    assistant_id VARCHAR(255),
    session_id VARCHAR(255) NOT NULL DEFAULT 'default',
    created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    searchable_content TEXT NOT NULL,
    summary TEXT NOT NULL,
    novelty_score DOUBLE DEFAULT 0.5,
    relevance_score DOUBLE DEFAULT 0.5,
    actionability_score DOUBLE DEFAULT 0.5,
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
    confidence_score DOUBLE DEFAULT 0.8,
    classification_reason TEXT,
    processed_for_duplicates BOOLEAN DEFAULT FALSE,
    conscious_processed BOOLEAN DEFAULT FALSE,
    access_count BIGINT DEFAULT 0,
    last_accessed TIMESTAMP(6) NULL,
    version BIGINT NOT NULL DEFAULT 1,
    INDEX idx_long_term_user_id (user_id),
    INDEX idx_long_term_user_assistant (user_id, assistant_id),
    INDEX idx_long_term_classification (classification),
    INDEX idx_long_term_conscious_processed (conscious_processed),
    INDEX idx_long_term_created (created_at),
    INDEX idx_long_term_user_category (user_id, category_primary, importance_score)
);
"#;

/// Check whether an index exists on a table in the current schema.
async fn index_exists(pool: &MySqlPool, table: &str, index: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.statistics \
         WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
    )
    .bind(table)
    .bind(index)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Run all schema setup. Idempotent.
pub async fn initialize(pool: &MySqlPool) -> Result<()> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(pool).await?;
    }

    if !index_exists(pool, "short_term_memory", "ft_short_term_search").await? {
        tracing::info!("creating MySQL FULLTEXT index on short_term_memory");
        sqlx::query(
            "ALTER TABLE short_term_memory \
             ADD FULLTEXT INDEX ft_short_term_search (searchable_content, summary)",
        )
        .execute(pool)
        .await?;
    }

    if !index_exists(pool, "long_term_memory", "ft_long_term_search").await? {
        tracing::info!("creating MySQL FULLTEXT index on long_term_memory");
        sqlx::query(
            "ALTER TABLE long_term_memory \
             ADD FULLTEXT INDEX ft_long_term_search (searchable_content, summary)",
        )
        .execute(pool)
        .await?;
    }

    if !index_exists(pool, "long_term_memory", "ft_long_term_topic").await? {
        sqlx::query("ALTER TABLE long_term_memory ADD FULLTEXT INDEX ft_long_term_topic (topic)")
            .execute(pool)
            .await?;
    }

    tracing::debug!("mysql schema initialized");
    Ok(())
}
