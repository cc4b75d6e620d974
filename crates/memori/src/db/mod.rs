// crates/memori/src/db/mod.rs
// Backend-agnostic storage layer: one trait, one concrete type per backend,
// selected by connection-string prefix.

mod mysql;
mod postgres;
mod schema;
mod sqlite;
pub mod types;

#[cfg(test)]
mod sqlite_tests;

use std::sync::Arc;

pub use mysql::MySqlStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use types::*;

use async_trait::async_trait;

use memori_types::ProcessedLongTermMemory;

use crate::config::PoolSettings;
use crate::context::TenantContext;
use crate::error::{MemoriError, Result};

/// Ceiling on memory_id length, enforced before any query runs.
pub const MAX_MEMORY_ID_LEN: usize = 255;

/// Supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    MySql,
    Postgres,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
        }
    }
}

/// Uniform operation surface over the two-tier memory store.
///
/// Isolation rules live here, not in callers: every query filters by
/// user_id, short-term rows are shared across assistants for one user,
/// long-term rows with a NULL assistant_id are shared, and session filters
/// apply to short-term only.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Upsert a chat row by chat_id.
    async fn store_chat(&self, chat: &ChatRecord) -> Result<()>;

    /// Newest-first chat history for a user, optionally scoped to a session.
    async fn get_chat_history(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatRecord>>;

    /// Insert or replace a short-term row by memory_id.
    async fn store_short_term(&self, row: &ShortTermRecord) -> Result<()>;

    async fn find_short_term_by_id(
        &self,
        memory_id: &str,
        user_id: &str,
    ) -> Result<Option<ShortTermRecord>>;

    /// Working-set rows ordered by importance DESC, created DESC. Expired
    /// non-permanent rows are invisible unless `include_expired`.
    async fn get_short_term(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        category: Option<&str>,
        limit: i64,
        include_expired: bool,
    ) -> Result<Vec<ShortTermRecord>>;

    /// Insert a classified memory; returns the new memory_id.
    async fn store_long_term(
        &self,
        memory: &ProcessedLongTermMemory,
        chat_id: Option<&str>,
        tenant: &TenantContext,
    ) -> Result<String>;

    /// Ranked search. Empty queries return `[]`; full-text failures fall
    /// back to LIKE with `search_score = 0.4`.
    async fn search_memories(&self, query: &str, filters: &SearchFilters)
        -> Result<Vec<SearchResult>>;

    /// LIKE-pattern OR search over searchable_content and summary. Used by
    /// the entity stage and as the full-text fallback.
    async fn like_search(
        &self,
        patterns: &[String],
        filters: &SearchFilters,
        strategy: &str,
    ) -> Result<Vec<SearchResult>>;

    /// Recent rows per tier (half the limit each), newest first.
    async fn get_recent_memories(&self, filters: &SearchFilters) -> Result<Vec<SearchResult>>;

    /// All conscious-info long-term rows for a user, importance-ordered.
    async fn get_conscious_memories(
        &self,
        user_id: &str,
        unprocessed_only: bool,
        limit: Option<i64>,
    ) -> Result<Vec<ConsciousSource>>;

    /// Bulk-flip conscious_processed on the given rows.
    async fn mark_conscious_processed(&self, memory_ids: &[String], user_id: &str) -> Result<u64>;

    /// Count of short-term rows in a category (curator fast path).
    async fn count_short_term_category(&self, user_id: &str, category: &str) -> Result<i64>;

    /// Whether a short-term row with the same content or summary already
    /// exists in a category (promotion duplicate suppression).
    async fn short_term_content_exists(
        &self,
        user_id: &str,
        category: &str,
        searchable_content: &str,
        summary: &str,
    ) -> Result<bool>;

    /// Long-term rows created within the last `hours`, for dedup context.
    async fn get_recent_long_term(
        &self,
        user_id: &str,
        hours: i64,
        limit: i64,
    ) -> Result<Vec<DedupCandidate>>;

    /// Top essential-classified rows (injection without user input).
    async fn get_essential_memories(&self, user_id: &str, limit: i64)
        -> Result<Vec<SearchResult>>;

    async fn get_memory_stats(&self, user_id: &str) -> Result<MemoryStats>;

    /// Paginated listing across tiers with total count.
    async fn list_memories(&self, user_id: &str, options: &ListOptions) -> Result<MemoryPage>;

    /// Tenant-scoped delete. Tier: "short_term" | "long_term" |
    /// "chat_history" | None (all three). Returns rows deleted.
    async fn clear_memory(&self, user_id: &str, tier: Option<&str>) -> Result<u64>;

    /// Total memory rows (both tiers) for quota accounting.
    async fn count_memories(&self, user_id: &str) -> Result<i64>;

    fn pool_status(&self) -> PoolStatus;
}

/// Fail closed on a missing or empty user_id.
pub(crate) fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(MemoriError::InvalidTenant(
            "user_id cannot be empty - required for tenant isolation".into(),
        ));
    }
    Ok(())
}

/// Validate a memory_id before it reaches the database.
pub(crate) fn validate_memory_id(memory_id: &str) -> Result<()> {
    if memory_id.is_empty() {
        return Err(MemoriError::Validation("memory_id cannot be empty".into()));
    }
    if memory_id.len() > MAX_MEMORY_ID_LEN {
        return Err(MemoriError::Validation(format!(
            "memory_id exceeds {MAX_MEMORY_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Escape LIKE wildcards so user text cannot act as a pattern.
pub(crate) fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Build LIKE patterns for a query: the whole phrase plus each word longer
/// than 2 characters.
pub(crate) fn like_patterns(query: &str) -> Vec<String> {
    let mut patterns = vec![format!("%{}%", escape_like(query))];
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.len() > 1 {
        for word in words {
            if word.len() > 2 {
                patterns.push(format!("%{}%", escape_like(word)));
            }
        }
    }
    patterns
}

/// Resolve the backend for a connection string.
///
/// `mongodb:` URIs select the document backend, which is not part of this
/// build; they fall back to the embedded relational backend with a warning.
pub fn backend_for(connection_string: &str) -> Result<BackendKind> {
    let lower = connection_string.to_lowercase();
    if lower.starts_with("sqlite:") {
        Ok(BackendKind::Sqlite)
    } else if lower.starts_with("mysql:") {
        Ok(BackendKind::MySql)
    } else if lower.starts_with("postgresql:") || lower.starts_with("postgres:") {
        Ok(BackendKind::Postgres)
    } else if lower.starts_with("mongodb:") || lower.starts_with("mongodb+srv:") {
        tracing::warn!(
            "document backend driver is not available in this build; \
             falling back to the embedded sqlite backend"
        );
        Ok(BackendKind::Sqlite)
    } else {
        Err(MemoriError::Config(format!(
            "unsupported connection string prefix: {}",
            crate::error::sanitize_connection_string(connection_string)
        )))
    }
}

/// Connection string actually handed to the driver after backend
/// resolution (mongodb fallback substitutes a local sqlite file).
fn effective_connection_string(connection_string: &str, kind: BackendKind) -> String {
    let lower = connection_string.to_lowercase();
    if kind == BackendKind::Sqlite && (lower.starts_with("mongodb:") || lower.starts_with("mongodb+srv:")) {
        "sqlite:memori_fallback.db".to_string()
    } else {
        connection_string.to_string()
    }
}

/// Open a store for the given connection string, creating schema and
/// backend-specific search structures on first use (idempotent).
pub async fn open_store(
    connection_string: &str,
    pool: &PoolSettings,
) -> Result<Arc<dyn MemoryStore>> {
    let kind = backend_for(connection_string)?;
    let conn = effective_connection_string(connection_string, kind);
    tracing::info!(
        backend = kind.as_str(),
        url = %crate::error::sanitize_connection_string(&conn),
        "opening memory store"
    );
    match kind {
        BackendKind::Sqlite => Ok(Arc::new(SqliteStore::open(&conn, pool).await?)),
        BackendKind::MySql => Ok(Arc::new(MySqlStore::open(&conn, pool).await?)),
        BackendKind::Postgres => Ok(Arc::new(PostgresStore::open(&conn, pool).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_for_prefixes() {
        assert_eq!(backend_for("sqlite:mem.db").unwrap(), BackendKind::Sqlite);
        assert_eq!(
            backend_for("mysql://u:p@host/db").unwrap(),
            BackendKind::MySql
        );
        assert_eq!(
            backend_for("postgresql://host/db").unwrap(),
            BackendKind::Postgres
        );
        assert_eq!(
            backend_for("postgres://host/db").unwrap(),
            BackendKind::Postgres
        );
    }

    #[test]
    fn test_mongodb_falls_back_to_sqlite() {
        assert_eq!(
            backend_for("mongodb://localhost/memori").unwrap(),
            BackendKind::Sqlite
        );
        assert_eq!(
            backend_for("mongodb+srv://cluster.example.net/memori").unwrap(),
            BackendKind::Sqlite
        );
    }

    #[test]
    fn test_unknown_prefix_is_config_error() {
        assert!(matches!(
            backend_for("redis://localhost"),
            Err(MemoriError::Config(_))
        ));
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("alice").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("  ").is_err());
    }

    #[test]
    fn test_validate_memory_id_length() {
        assert!(validate_memory_id("m1").is_ok());
        assert!(validate_memory_id(&"x".repeat(255)).is_ok());
        assert!(validate_memory_id(&"x".repeat(256)).is_err());
        assert!(validate_memory_id("").is_err());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_done\\"), "50\\%\\_done\\\\");
    }

    #[test]
    fn test_like_patterns_full_query_and_words() {
        let patterns = like_patterns("rust backend dev");
        assert_eq!(patterns[0], "%rust backend dev%");
        assert!(patterns.contains(&"%rust%".to_string()));
        assert!(patterns.contains(&"%backend%".to_string()));
        assert!(patterns.contains(&"%dev%".to_string()));
    }

    #[test]
    fn test_like_patterns_skips_short_words() {
        let patterns = like_patterns("go is ok");
        // Single words of <= 2 chars are skipped; only the phrase remains.
        assert_eq!(patterns, vec!["%go is ok%".to_string()]);
    }
}
