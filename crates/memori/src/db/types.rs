// crates/memori/src/db/types.rs
// Row types and query inputs/outputs shared by all storage backends

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use memori_types::MemoryTier;

/// Immutable record of one user/assistant exchange.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub chat_id: String,
    pub user_input: String,
    pub ai_output: String,
    pub model: String,
    pub session_id: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub tokens_used: i64,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// One row of the short-term working set.
#[derive(Debug, Clone)]
pub struct ShortTermRecord {
    pub memory_id: String,
    pub chat_id: Option<String>,
    pub processed_data: Value,
    pub importance_score: f64,
    pub category_primary: String,
    pub retention_type: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub searchable_content: String,
    pub summary: String,
    pub is_permanent_context: bool,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Tenant and scope filters for search-flavored queries.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub session_id: Option<String>,
    pub category_filter: Option<Vec<String>>,
    pub limit: i64,
    pub include_short_term: bool,
    pub include_long_term: bool,
}

impl SearchFilters {
    pub fn for_user(user_id: impl Into<String>, limit: i64) -> Self {
        Self {
            user_id: user_id.into(),
            assistant_id: None,
            session_id: None,
            category_filter: None,
            limit,
            include_short_term: true,
            include_long_term: true,
        }
    }
}

/// One ranked search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub memory_id: String,
    pub memory_type: MemoryTier,
    pub processed_data: Value,
    pub importance_score: f64,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub searchable_content: String,
    pub category_primary: String,
    /// Backend relevance (bm25-derived, MATCH relevance, ts_rank, or the
    /// fixed LIKE-fallback score)
    pub search_score: f64,
    /// Which stage produced this hit (e.g. "sqlite_fts5", "entity_search",
    /// "sqlite_like_fallback")
    pub search_strategy: String,
    /// 0.5 * search + 0.3 * importance + 0.2 * recency; filled by ranking
    pub composite_score: f64,
}

/// Long-term source row for conscious promotion.
#[derive(Debug, Clone)]
pub struct ConsciousSource {
    pub memory_id: String,
    pub processed_data: Value,
    pub summary: String,
    pub searchable_content: String,
    pub importance_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Recent long-term row used as classifier dedup context.
#[derive(Debug, Clone)]
pub struct DedupCandidate {
    pub memory_id: String,
    pub summary: String,
    pub searchable_content: String,
    pub classification: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user storage statistics.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub chat_history_count: i64,
    pub short_term_count: i64,
    pub long_term_count: i64,
    pub memories_by_category: BTreeMap<String, i64>,
    pub average_importance: f64,
    pub database_type: String,
}

/// One row of a paginated listing, tagged with its tier.
#[derive(Debug, Clone)]
pub struct ListedMemory {
    pub memory_id: String,
    pub memory_type: MemoryTier,
    pub processed_data: Value,
    pub importance_score: f64,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub category_primary: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub session_id: String,
}

/// Page of listed memories plus the total matching count.
#[derive(Debug, Clone)]
pub struct MemoryPage {
    pub memories: Vec<ListedMemory>,
    pub total_count: i64,
}

/// Options for paginated listing. Invalid values degrade to defaults with a
/// warning rather than reaching the SQL layer.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub assistant_id: Option<String>,
    pub session_id: Option<String>,
    /// "all" | "short_term" | "long_term"
    pub memory_type: String,
    /// "created_at" | "importance" | "category"
    pub sort_by: String,
    /// "asc" | "desc"
    pub order: String,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            assistant_id: None,
            session_id: None,
            memory_type: "all".into(),
            sort_by: "created_at".into(),
            order: "desc".into(),
            limit: 50,
            offset: 0,
        }
    }
}

impl ListOptions {
    /// Resolve the sort field against the allowlist; anything else falls
    /// back to created_at.
    pub fn sort_column(&self) -> &'static str {
        match self.sort_by.as_str() {
            "created_at" => "created_at",
            "importance" => "importance_score",
            "category" => "category_primary",
            other => {
                tracing::warn!(sort_by = other, "invalid sort field, defaulting to created_at");
                "created_at"
            }
        }
    }

    pub fn order_keyword(&self) -> &'static str {
        match self.order.as_str() {
            "asc" => "ASC",
            "desc" => "DESC",
            other => {
                tracing::warn!(order = other, "invalid sort order, defaulting to desc");
                "DESC"
            }
        }
    }
}

/// Pool status for monitoring.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
    pub max_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_options_allowlist() {
        let mut opts = ListOptions::default();
        assert_eq!(opts.sort_column(), "created_at");
        opts.sort_by = "importance".into();
        assert_eq!(opts.sort_column(), "importance_score");
        opts.sort_by = "category; DROP TABLE".into();
        assert_eq!(opts.sort_column(), "created_at");
    }

    #[test]
    fn test_order_allowlist() {
        let mut opts = ListOptions::default();
        assert_eq!(opts.order_keyword(), "DESC");
        opts.order = "asc".into();
        assert_eq!(opts.order_keyword(), "ASC");
        opts.order = "sideways".into();
        assert_eq!(opts.order_keyword(), "DESC");
    }

    #[test]
    fn test_filters_for_user() {
        let f = SearchFilters::for_user("alice", 5);
        assert_eq!(f.user_id, "alice");
        assert!(f.include_short_term && f.include_long_term);
        assert!(f.category_filter.is_none());
    }
}
