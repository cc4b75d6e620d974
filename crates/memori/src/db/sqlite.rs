// crates/memori/src/db/sqlite.rs
// Embedded relational backend. Full-text search via an FTS5 virtual table
// maintained by insert/delete triggers on both memory tables.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use memori_types::{MemoryTier, ProcessedLongTermMemory};

use crate::config::PoolSettings;
use crate::context::TenantContext;
use crate::error::Result;
use crate::search::rank_and_limit;

use super::schema;
use super::types::*;
use super::{
    BackendKind, MemoryStore, like_patterns, validate_memory_id, validate_user_id,
};

/// Embedded sqlite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
    max_connections: u32,
}

impl SqliteStore {
    /// Open (and create if missing) a sqlite database and initialize the
    /// schema. In-memory databases are pinned to a single connection so all
    /// callers share one database instance.
    pub async fn open(connection_string: &str, settings: &PoolSettings) -> Result<Self> {
        let in_memory = connection_string.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(connection_string)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            // WAL for concurrent readers; NORMAL sync is safe under WAL.
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let max_connections = if in_memory {
            1
        } else {
            settings.max_connections()
        };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .test_before_acquire(settings.pre_ping);

        if in_memory {
            // The only connection must never be recycled or the database
            // vanishes with it.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else if let Some(recycle) = settings.recycle_secs {
            pool_options = pool_options.max_lifetime(Some(Duration::from_secs(recycle)));
        }

        let pool = pool_options.connect_with(options).await?;
        schema::sqlite::initialize(&pool).await?;

        Ok(Self {
            pool,
            max_connections,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Primary full-text stage over the FTS5 virtual table.
    async fn fts_search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<SearchResult>> {
        // Phrase-wrap the query; embedded quotes are doubled per FTS5 rules.
        let fts_query = format!("\"{}\"", query.replace('"', "\"\""));

        let mut sql = String::from(
            "SELECT fts.memory_id, fts.memory_type, fts.category_primary, \
                    COALESCE(CASE WHEN fts.memory_type = 'short_term' THEN st.processed_data \
                                  WHEN fts.memory_type = 'long_term' THEN lt.processed_data END, '{}') AS processed_data, \
                    COALESCE(CASE WHEN fts.memory_type = 'short_term' THEN st.importance_score \
                                  WHEN fts.memory_type = 'long_term' THEN lt.importance_score END, 0.5) AS importance_score, \
                    CASE WHEN fts.memory_type = 'short_term' THEN st.created_at \
                         WHEN fts.memory_type = 'long_term' THEN lt.created_at END AS created_at, \
                    COALESCE(fts.summary, '') AS summary, \
                    COALESCE(fts.searchable_content, '') AS searchable_content, \
                    COALESCE(fts.rank, 0.0) AS fts_rank \
             FROM memory_search_fts fts \
             LEFT JOIN short_term_memory st ON fts.memory_id = st.memory_id AND fts.memory_type = 'short_term' \
             LEFT JOIN long_term_memory lt ON fts.memory_id = lt.memory_id AND fts.memory_type = 'long_term' \
             WHERE memory_search_fts MATCH ? AND fts.user_id = ?",
        );

        // Multi-assistant isolation: short-term is shared across assistants;
        // long-term shows shared (NULL) rows plus the given assistant's own.
        if filters.assistant_id.is_some() {
            sql.push_str(
                " AND (fts.memory_type = 'short_term' OR fts.assistant_id IS NULL OR fts.assistant_id = ?)",
            );
        } else {
            sql.push_str(" AND (fts.memory_type = 'short_term' OR fts.assistant_id IS NULL)");
        }

        // Session scoping applies to short-term only.
        if filters.session_id.is_some() {
            sql.push_str(" AND (fts.memory_type = 'long_term' OR fts.session_id = ?)");
        }

        if !filters.include_short_term {
            sql.push_str(" AND fts.memory_type <> 'short_term'");
        }
        if !filters.include_long_term {
            sql.push_str(" AND fts.memory_type <> 'long_term'");
        }

        // Expired non-permanent short-term rows are invisible to retrieval.
        sql.push_str(
            " AND (fts.memory_type = 'long_term' OR st.expires_at IS NULL OR st.expires_at > ? OR st.is_permanent_context = 1)",
        );

        let category_count = filters
            .category_filter
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(0);
        if category_count > 0 {
            let placeholders = vec!["?"; category_count].join(",");
            sql.push_str(&format!(" AND fts.category_primary IN ({placeholders})"));
        }

        sql.push_str(" ORDER BY fts_rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&fts_query).bind(&filters.user_id);
        if let Some(assistant) = &filters.assistant_id {
            q = q.bind(assistant);
        }
        if let Some(session) = &filters.session_id {
            q = q.bind(session);
        }
        q = q.bind(Utc::now());
        if let Some(categories) = &filters.category_filter {
            for cat in categories {
                q = q.bind(cat);
            }
        }
        q = q.bind(filters.limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(fts_result_from_row).collect())
    }

    async fn like_tier_search(
        &self,
        tier: MemoryTier,
        patterns: &[String],
        filters: &SearchFilters,
        strategy: &str,
    ) -> Result<Vec<SearchResult>> {
        let table = match tier {
            MemoryTier::ShortTerm => "short_term_memory",
            MemoryTier::LongTerm => "long_term_memory",
        };

        let mut sql = format!(
            "SELECT memory_id, processed_data, importance_score, created_at, summary, \
                    searchable_content, category_primary \
             FROM {table} WHERE user_id = ?"
        );

        let pattern_clause: Vec<String> = patterns
            .iter()
            .map(|_| {
                "searchable_content LIKE ? ESCAPE '\\' OR summary LIKE ? ESCAPE '\\'".to_string()
            })
            .collect();
        sql.push_str(&format!(" AND ({})", pattern_clause.join(" OR ")));

        match tier {
            MemoryTier::ShortTerm => {
                if filters.session_id.is_some() {
                    sql.push_str(" AND session_id = ?");
                }
                sql.push_str(
                    " AND (expires_at IS NULL OR expires_at > ? OR is_permanent_context = 1)",
                );
            }
            MemoryTier::LongTerm => {
                if filters.assistant_id.is_some() {
                    sql.push_str(" AND (assistant_id IS NULL OR assistant_id = ?)");
                } else {
                    sql.push_str(" AND assistant_id IS NULL");
                }
            }
        }

        let category_count = filters
            .category_filter
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(0);
        if category_count > 0 {
            let placeholders = vec!["?"; category_count].join(",");
            sql.push_str(&format!(" AND category_primary IN ({placeholders})"));
        }

        sql.push_str(" ORDER BY importance_score DESC, created_at DESC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&filters.user_id);
        for pattern in patterns {
            q = q.bind(pattern).bind(pattern);
        }
        match tier {
            MemoryTier::ShortTerm => {
                if let Some(session) = &filters.session_id {
                    q = q.bind(session);
                }
                q = q.bind(Utc::now());
            }
            MemoryTier::LongTerm => {
                if let Some(assistant) = &filters.assistant_id {
                    q = q.bind(assistant);
                }
            }
        }
        if let Some(categories) = &filters.category_filter {
            for cat in categories {
                q = q.bind(cat);
            }
        }
        q = q.bind(filters.limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| plain_result_from_row(row, tier, 0.4, strategy))
            .collect())
    }

    async fn recent_tier(
        &self,
        tier: MemoryTier,
        filters: &SearchFilters,
        limit: i64,
    ) -> Result<Vec<SearchResult>> {
        let table = match tier {
            MemoryTier::ShortTerm => "short_term_memory",
            MemoryTier::LongTerm => "long_term_memory",
        };

        let mut sql = format!(
            "SELECT memory_id, processed_data, importance_score, created_at, summary, \
                    searchable_content, category_primary \
             FROM {table} WHERE user_id = ?"
        );

        match tier {
            MemoryTier::ShortTerm => {
                if filters.session_id.is_some() {
                    sql.push_str(" AND session_id = ?");
                }
                sql.push_str(
                    " AND (expires_at IS NULL OR expires_at > ? OR is_permanent_context = 1)",
                );
            }
            MemoryTier::LongTerm => {
                if filters.assistant_id.is_some() {
                    sql.push_str(" AND (assistant_id IS NULL OR assistant_id = ?)");
                } else {
                    sql.push_str(" AND assistant_id IS NULL");
                }
            }
        }

        let category_count = filters
            .category_filter
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(0);
        if category_count > 0 {
            let placeholders = vec!["?"; category_count].join(",");
            sql.push_str(&format!(" AND category_primary IN ({placeholders})"));
        }

        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&filters.user_id);
        match tier {
            MemoryTier::ShortTerm => {
                if let Some(session) = &filters.session_id {
                    q = q.bind(session);
                }
                q = q.bind(Utc::now());
            }
            MemoryTier::LongTerm => {
                if let Some(assistant) = &filters.assistant_id {
                    q = q.bind(assistant);
                }
            }
        }
        if let Some(categories) = &filters.category_filter {
            for cat in categories {
                q = q.bind(cat);
            }
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| plain_result_from_row(row, tier, 1.0, "recent_memories"))
            .collect())
    }

    async fn list_single_tier(
        &self,
        tier: MemoryTier,
        user_id: &str,
        options: &ListOptions,
    ) -> Result<MemoryPage> {
        let table = match tier {
            MemoryTier::ShortTerm => "short_term_memory",
            MemoryTier::LongTerm => "long_term_memory",
        };

        let mut where_clause = String::from("user_id = ?");
        if options.assistant_id.is_some() {
            where_clause.push_str(" AND assistant_id = ?");
        }
        if options.session_id.is_some() {
            where_clause.push_str(" AND session_id = ?");
        }

        let count_sql = format!("SELECT COUNT(*) FROM {table} WHERE {where_clause}");
        let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql).bind(user_id);
        if let Some(a) = &options.assistant_id {
            count_q = count_q.bind(a);
        }
        if let Some(s) = &options.session_id {
            count_q = count_q.bind(s);
        }
        let total_count = count_q.fetch_one(&self.pool).await?;

        let sql = format!(
            "SELECT memory_id, processed_data, importance_score, created_at, summary, \
                    category_primary, user_id, assistant_id, session_id \
             FROM {table} WHERE {where_clause} \
             ORDER BY {} {} LIMIT ? OFFSET ?",
            options.sort_column(),
            options.order_keyword()
        );
        let mut q = sqlx::query(&sql).bind(user_id);
        if let Some(a) = &options.assistant_id {
            q = q.bind(a);
        }
        if let Some(s) = &options.session_id {
            q = q.bind(s);
        }
        q = q.bind(options.limit).bind(options.offset);

        let rows = q.fetch_all(&self.pool).await?;
        let memories = rows.iter().map(|row| listed_from_row(row, tier)).collect();
        Ok(MemoryPage {
            memories,
            total_count,
        })
    }

    async fn list_all_tiers(&self, user_id: &str, options: &ListOptions) -> Result<MemoryPage> {
        let mut tier_where = String::from("user_id = ?");
        if options.assistant_id.is_some() {
            tier_where.push_str(" AND assistant_id = ?");
        }
        if options.session_id.is_some() {
            tier_where.push_str(" AND session_id = ?");
        }

        let union = format!(
            "SELECT memory_id, 'short_term' AS memory_type, processed_data, importance_score, \
                    created_at, summary, category_primary, user_id, assistant_id, session_id \
             FROM short_term_memory WHERE {tier_where} \
             UNION ALL \
             SELECT memory_id, 'long_term' AS memory_type, processed_data, importance_score, \
                    created_at, summary, category_primary, user_id, assistant_id, session_id \
             FROM long_term_memory WHERE {tier_where}"
        );

        let count_sql = format!("SELECT COUNT(*) FROM ({union})");
        let mut count_q = sqlx::query(&count_sql);
        count_q = bind_list_tenant(count_q, user_id, options);
        count_q = bind_list_tenant(count_q, user_id, options);
        let total_count: i64 = count_q.fetch_one(&self.pool).await?.get(0);

        let sql = format!(
            "SELECT * FROM ({union}) ORDER BY {} {} LIMIT ? OFFSET ?",
            options.sort_column(),
            options.order_keyword()
        );
        let mut q = sqlx::query(&sql);
        q = bind_list_tenant(q, user_id, options);
        q = bind_list_tenant(q, user_id, options);
        q = q.bind(options.limit).bind(options.offset);

        let rows = q.fetch_all(&self.pool).await?;
        let memories = rows
            .iter()
            .map(|row| {
                let tier = if row.get::<String, _>("memory_type") == "short_term" {
                    MemoryTier::ShortTerm
                } else {
                    MemoryTier::LongTerm
                };
                listed_from_row(row, tier)
            })
            .collect();

        Ok(MemoryPage {
            memories,
            total_count,
        })
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn store_chat(&self, chat: &ChatRecord) -> Result<()> {
        validate_user_id(&chat.user_id)?;
        validate_memory_id(&chat.chat_id)?;

        sqlx::query(
            "INSERT INTO chat_history (chat_id, user_input, ai_output, model, session_id, \
                                       tokens_used, metadata_json, user_id, assistant_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(chat_id) DO UPDATE SET \
                user_input = excluded.user_input, \
                ai_output = excluded.ai_output, \
                model = excluded.model, \
                session_id = excluded.session_id, \
                tokens_used = excluded.tokens_used, \
                metadata_json = excluded.metadata_json, \
                updated_at = excluded.created_at",
        )
        .bind(&chat.chat_id)
        .bind(&chat.user_input)
        .bind(&chat.ai_output)
        .bind(&chat.model)
        .bind(&chat.session_id)
        .bind(chat.tokens_used)
        .bind(serde_json::to_string(&chat.metadata)?)
        .bind(&chat.user_id)
        .bind(&chat.assistant_id)
        .bind(chat.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_chat_history(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatRecord>> {
        validate_user_id(user_id)?;

        let mut sql = String::from(
            "SELECT chat_id, user_input, ai_output, model, session_id, tokens_used, \
                    metadata_json, user_id, assistant_id, created_at \
             FROM chat_history WHERE user_id = ?",
        );
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(user_id);
        if let Some(session) = session_id {
            q = q.bind(session);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(chat_from_row).collect())
    }

    async fn store_short_term(&self, row: &ShortTermRecord) -> Result<()> {
        validate_user_id(&row.user_id)?;
        validate_memory_id(&row.memory_id)?;

        let mut tx = self.pool.begin().await?;
        // Delete-then-insert keeps the FTS triggers authoritative for both
        // the replace and the fresh-insert path.
        sqlx::query("DELETE FROM short_term_memory WHERE memory_id = ?")
            .bind(&row.memory_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO short_term_memory (memory_id, chat_id, processed_data, importance_score, \
                category_primary, retention_type, user_id, assistant_id, session_id, created_at, \
                expires_at, searchable_content, summary, is_permanent_context, access_count, last_accessed) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.memory_id)
        .bind(&row.chat_id)
        .bind(serde_json::to_string(&row.processed_data)?)
        .bind(row.importance_score)
        .bind(&row.category_primary)
        .bind(&row.retention_type)
        .bind(&row.user_id)
        .bind(&row.assistant_id)
        .bind(&row.session_id)
        .bind(row.created_at)
        .bind(row.expires_at)
        .bind(&row.searchable_content)
        .bind(&row.summary)
        .bind(row.is_permanent_context)
        .bind(row.access_count)
        .bind(row.last_accessed)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn find_short_term_by_id(
        &self,
        memory_id: &str,
        user_id: &str,
    ) -> Result<Option<ShortTermRecord>> {
        validate_user_id(user_id)?;
        validate_memory_id(memory_id)?;

        let row = sqlx::query(
            "SELECT memory_id, chat_id, processed_data, importance_score, category_primary, \
                    retention_type, user_id, assistant_id, session_id, created_at, expires_at, \
                    searchable_content, summary, is_permanent_context, access_count, last_accessed \
             FROM short_term_memory WHERE memory_id = ? AND user_id = ?",
        )
        .bind(memory_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(short_term_from_row))
    }

    async fn get_short_term(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        category: Option<&str>,
        limit: i64,
        include_expired: bool,
    ) -> Result<Vec<ShortTermRecord>> {
        validate_user_id(user_id)?;

        let mut sql = String::from(
            "SELECT memory_id, chat_id, processed_data, importance_score, category_primary, \
                    retention_type, user_id, assistant_id, session_id, created_at, expires_at, \
                    searchable_content, summary, is_permanent_context, access_count, last_accessed \
             FROM short_term_memory WHERE user_id = ?",
        );
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if category.is_some() {
            sql.push_str(" AND category_primary = ?");
        }
        if !include_expired {
            sql.push_str(" AND (expires_at IS NULL OR expires_at > ? OR is_permanent_context = 1)");
        }
        sql.push_str(" ORDER BY importance_score DESC, created_at DESC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(user_id);
        if let Some(session) = session_id {
            q = q.bind(session);
        }
        if let Some(cat) = category {
            q = q.bind(cat);
        }
        if !include_expired {
            q = q.bind(Utc::now());
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(short_term_from_row).collect())
    }

    async fn store_long_term(
        &self,
        memory: &ProcessedLongTermMemory,
        chat_id: Option<&str>,
        tenant: &TenantContext,
    ) -> Result<String> {
        tenant.validate()?;

        let memory_id = Uuid::new_v4().to_string();
        tracing::debug!(
            memory_id = %memory_id,
            chat_id = chat_id.unwrap_or("-"),
            classification = memory.classification.as_str(),
            "storing long-term memory"
        );

        sqlx::query(
            "INSERT INTO long_term_memory (memory_id, processed_data, importance_score, \
                category_primary, retention_type, user_id, assistant_id, session_id, created_at, \
                searchable_content, summary, novelty_score, relevance_score, actionability_score, \
                classification, memory_importance, topic, entities_json, keywords_json, \
                is_user_context, is_preference, is_skill_knowledge, is_current_project, \
                promotion_eligible, duplicate_of, supersedes_json, related_memories_json, \
                confidence_score, classification_reason, processed_for_duplicates, \
                conscious_processed, access_count, version) \
             VALUES (?, ?, ?, ?, 'long_term', ?, ?, ?, ?, ?, ?, 0.5, 0.5, 0.5, \
                     ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 1)",
        )
        .bind(&memory_id)
        .bind(serde_json::to_string(memory)?)
        .bind(memory.importance_score())
        .bind(memory.classification.as_str())
        .bind(&tenant.user_id)
        .bind(&tenant.assistant_id)
        .bind(&tenant.session_id)
        .bind(Utc::now())
        .bind(&memory.content)
        .bind(&memory.summary)
        .bind(memory.classification.as_str())
        .bind(memory.importance.as_str())
        .bind(&memory.topic)
        .bind(serde_json::to_string(&memory.entities)?)
        .bind(serde_json::to_string(&memory.keywords)?)
        .bind(memory.is_user_context)
        .bind(memory.is_preference)
        .bind(memory.is_skill_knowledge)
        .bind(memory.is_current_project)
        .bind(memory.promotion_eligible)
        .bind(&memory.duplicate_of)
        .bind(serde_json::to_string(&memory.supersedes)?)
        .bind(serde_json::to_string(&memory.related_memories)?)
        .bind(memory.confidence_score)
        .bind(&memory.classification_reason)
        .execute(&self.pool)
        .await?;

        Ok(memory_id)
    }

    async fn search_memories(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        validate_user_id(&filters.user_id)?;

        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let results = match self.fts_search(query, filters).await {
            Ok(results) if !results.is_empty() => results,
            Ok(_) => {
                tracing::debug!("sqlite FTS returned no results, falling back to LIKE");
                self.like_search(&like_patterns(query), filters, "sqlite_like_fallback")
                    .await?
            }
            Err(e) => {
                tracing::warn!(error = %e, "sqlite FTS search failed, falling back to LIKE");
                self.like_search(&like_patterns(query), filters, "sqlite_like_fallback")
                    .await?
            }
        };

        Ok(rank_and_limit(results, filters.limit as usize))
    }

    async fn like_search(
        &self,
        patterns: &[String],
        filters: &SearchFilters,
        strategy: &str,
    ) -> Result<Vec<SearchResult>> {
        validate_user_id(&filters.user_id)?;
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        if filters.include_short_term {
            results.extend(
                self.like_tier_search(MemoryTier::ShortTerm, patterns, filters, strategy)
                    .await?,
            );
        }
        if filters.include_long_term {
            results.extend(
                self.like_tier_search(MemoryTier::LongTerm, patterns, filters, strategy)
                    .await?,
            );
        }
        Ok(results)
    }

    async fn get_recent_memories(&self, filters: &SearchFilters) -> Result<Vec<SearchResult>> {
        validate_user_id(&filters.user_id)?;

        let per_tier = (filters.limit / 2).max(1);
        let mut results = Vec::new();
        if filters.include_short_term {
            results.extend(
                self.recent_tier(MemoryTier::ShortTerm, filters, per_tier)
                    .await?,
            );
        }
        if filters.include_long_term {
            results.extend(
                self.recent_tier(MemoryTier::LongTerm, filters, per_tier)
                    .await?,
            );
        }
        Ok(results)
    }

    async fn get_conscious_memories(
        &self,
        user_id: &str,
        unprocessed_only: bool,
        limit: Option<i64>,
    ) -> Result<Vec<ConsciousSource>> {
        validate_user_id(user_id)?;

        let mut sql = String::from(
            "SELECT memory_id, processed_data, summary, searchable_content, importance_score, created_at \
             FROM long_term_memory WHERE user_id = ? AND classification = 'conscious-info'",
        );
        if unprocessed_only {
            sql.push_str(" AND conscious_processed = 0");
        }
        sql.push_str(" ORDER BY importance_score DESC, created_at DESC");
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(user_id);
        if let Some(n) = limit {
            q = q.bind(n);
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(conscious_from_row).collect())
    }

    async fn mark_conscious_processed(&self, memory_ids: &[String], user_id: &str) -> Result<u64> {
        validate_user_id(user_id)?;
        if memory_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; memory_ids.len()].join(",");
        let sql = format!(
            "UPDATE long_term_memory SET conscious_processed = 1 \
             WHERE user_id = ? AND memory_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql).bind(user_id);
        for id in memory_ids {
            q = q.bind(id);
        }
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count_short_term_category(&self, user_id: &str, category: &str) -> Result<i64> {
        validate_user_id(user_id)?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM short_term_memory WHERE user_id = ? AND category_primary = ?",
        )
        .bind(user_id)
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn short_term_content_exists(
        &self,
        user_id: &str,
        category: &str,
        searchable_content: &str,
        summary: &str,
    ) -> Result<bool> {
        validate_user_id(user_id)?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM short_term_memory \
             WHERE user_id = ? AND category_primary = ? \
               AND (searchable_content = ? OR summary = ?)",
        )
        .bind(user_id)
        .bind(category)
        .bind(searchable_content)
        .bind(summary)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn get_recent_long_term(
        &self,
        user_id: &str,
        hours: i64,
        limit: i64,
    ) -> Result<Vec<DedupCandidate>> {
        validate_user_id(user_id)?;
        let threshold = Utc::now() - ChronoDuration::hours(hours);

        let rows = sqlx::query(
            "SELECT memory_id, summary, searchable_content, classification, created_at \
             FROM long_term_memory \
             WHERE user_id = ? AND created_at > ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(threshold)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(dedup_from_row).collect())
    }

    async fn get_essential_memories(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<SearchResult>> {
        validate_user_id(user_id)?;

        let rows = sqlx::query(
            "SELECT memory_id, processed_data, importance_score, created_at, summary, \
                    searchable_content, category_primary \
             FROM long_term_memory \
             WHERE user_id = ? AND classification = 'essential' \
             ORDER BY importance_score DESC, created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| plain_result_from_row(row, MemoryTier::LongTerm, 1.0, "essential_memories"))
            .collect())
    }

    async fn get_memory_stats(&self, user_id: &str) -> Result<MemoryStats> {
        validate_user_id(user_id)?;

        let chat_history_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_history WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        let short_term_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM short_term_memory WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        let long_term_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM long_term_memory WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let mut memories_by_category = std::collections::BTreeMap::new();
        for table in ["short_term_memory", "long_term_memory"] {
            let sql = format!(
                "SELECT category_primary, COUNT(*) FROM {table} \
                 WHERE user_id = ? GROUP BY category_primary"
            );
            let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
            for row in rows {
                let category: String = row.get(0);
                let count: i64 = row.get(1);
                *memories_by_category.entry(category).or_insert(0) += count;
            }
        }

        let short_avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(importance_score) FROM short_term_memory WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let long_avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(importance_score) FROM long_term_memory WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let total = short_term_count + long_term_count;
        let average_importance = if total > 0 {
            (short_avg.unwrap_or(0.0) * short_term_count as f64
                + long_avg.unwrap_or(0.0) * long_term_count as f64)
                / total as f64
        } else {
            0.0
        };

        Ok(MemoryStats {
            chat_history_count,
            short_term_count,
            long_term_count,
            memories_by_category,
            average_importance,
            database_type: self.backend().as_str().to_string(),
        })
    }

    async fn list_memories(&self, user_id: &str, options: &ListOptions) -> Result<MemoryPage> {
        validate_user_id(user_id)?;

        match options.memory_type.as_str() {
            "short_term" => {
                self.list_single_tier(MemoryTier::ShortTerm, user_id, options)
                    .await
            }
            "long_term" => {
                self.list_single_tier(MemoryTier::LongTerm, user_id, options)
                    .await
            }
            "all" => self.list_all_tiers(user_id, options).await,
            other => {
                tracing::warn!(memory_type = other, "invalid memory_type, defaulting to all");
                self.list_all_tiers(user_id, options).await
            }
        }
    }

    async fn clear_memory(&self, user_id: &str, tier: Option<&str>) -> Result<u64> {
        validate_user_id(user_id)?;

        let tables: &[&str] = match tier {
            Some("short_term") => &["short_term_memory"],
            Some("long_term") => &["long_term_memory"],
            Some("chat_history") => &["chat_history"],
            None => &["short_term_memory", "long_term_memory", "chat_history"],
            Some(other) => {
                return Err(crate::error::MemoriError::Validation(format!(
                    "unknown memory tier: {other}"
                )));
            }
        };

        let mut deleted = 0;
        for table in tables {
            let sql = format!("DELETE FROM {table} WHERE user_id = ?");
            let result = sqlx::query(&sql).bind(user_id).execute(&self.pool).await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn count_memories(&self, user_id: &str) -> Result<i64> {
        validate_user_id(user_id)?;
        let short: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM short_term_memory WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        let long: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM long_term_memory WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(short + long)
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_size: self.max_connections,
        }
    }
}

/// Bind the tenant filters of one UNION arm in list queries.
fn bind_list_tenant<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    user_id: &'q str,
    options: &'q ListOptions,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    q = q.bind(user_id);
    if let Some(a) = &options.assistant_id {
        q = q.bind(a.as_str());
    }
    if let Some(s) = &options.session_id {
        q = q.bind(s.as_str());
    }
    q
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn parse_json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or(serde_json::Value::Null)
}

fn chat_from_row(row: &SqliteRow) -> ChatRecord {
    let metadata: Option<String> = row.get("metadata_json");
    ChatRecord {
        chat_id: row.get("chat_id"),
        user_input: row.get("user_input"),
        ai_output: row.get("ai_output"),
        model: row.get("model"),
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        assistant_id: row.get("assistant_id"),
        tokens_used: row.get("tokens_used"),
        metadata: metadata
            .map(|m| parse_json(&m))
            .unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at"),
    }
}

fn short_term_from_row(row: &SqliteRow) -> ShortTermRecord {
    let processed: String = row.get("processed_data");
    ShortTermRecord {
        memory_id: row.get("memory_id"),
        chat_id: row.get("chat_id"),
        processed_data: parse_json(&processed),
        importance_score: row.get("importance_score"),
        category_primary: row.get("category_primary"),
        retention_type: row.get("retention_type"),
        user_id: row.get("user_id"),
        assistant_id: row.get("assistant_id"),
        session_id: row.get("session_id"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        searchable_content: row.get("searchable_content"),
        summary: row.get("summary"),
        is_permanent_context: row.get("is_permanent_context"),
        access_count: row.get("access_count"),
        last_accessed: row.get("last_accessed"),
    }
}

fn fts_result_from_row(row: &SqliteRow) -> SearchResult {
    let tier = if row.get::<String, _>("memory_type") == "short_term" {
        MemoryTier::ShortTerm
    } else {
        MemoryTier::LongTerm
    };
    let processed: String = row.get("processed_data");
    let created_at: Option<DateTime<Utc>> = row.get("created_at");
    // bm25 rank is negative-is-better; fold it into [0, 1).
    let rank: f64 = row.get("fts_rank");
    let raw = (-rank).max(0.0);
    let search_score = raw / (1.0 + raw);

    SearchResult {
        memory_id: row.get("memory_id"),
        memory_type: tier,
        processed_data: parse_json(&processed),
        importance_score: row.get("importance_score"),
        created_at: created_at.unwrap_or_else(Utc::now),
        summary: row.get("summary"),
        searchable_content: row.get("searchable_content"),
        category_primary: row.get("category_primary"),
        search_score,
        search_strategy: "sqlite_fts5".into(),
        composite_score: 0.0,
    }
}

fn plain_result_from_row(
    row: &SqliteRow,
    tier: MemoryTier,
    search_score: f64,
    strategy: &str,
) -> SearchResult {
    let processed: String = row.get("processed_data");
    SearchResult {
        memory_id: row.get("memory_id"),
        memory_type: tier,
        processed_data: parse_json(&processed),
        importance_score: row.get("importance_score"),
        created_at: row.get("created_at"),
        summary: row.get("summary"),
        searchable_content: row.get("searchable_content"),
        category_primary: row.get("category_primary"),
        search_score,
        search_strategy: strategy.to_string(),
        composite_score: 0.0,
    }
}

fn listed_from_row(row: &SqliteRow, tier: MemoryTier) -> ListedMemory {
    let processed: String = row.get("processed_data");
    ListedMemory {
        memory_id: row.get("memory_id"),
        memory_type: tier,
        processed_data: parse_json(&processed),
        importance_score: row.get("importance_score"),
        created_at: row.get("created_at"),
        summary: row.get("summary"),
        category_primary: row.get("category_primary"),
        user_id: row.get("user_id"),
        assistant_id: row.get("assistant_id"),
        session_id: row.get("session_id"),
    }
}

fn conscious_from_row(row: &SqliteRow) -> ConsciousSource {
    let processed: String = row.get("processed_data");
    ConsciousSource {
        memory_id: row.get("memory_id"),
        processed_data: parse_json(&processed),
        summary: row.get("summary"),
        searchable_content: row.get("searchable_content"),
        importance_score: row.get("importance_score"),
        created_at: row.get("created_at"),
    }
}

fn dedup_from_row(row: &SqliteRow) -> DedupCandidate {
    DedupCandidate {
        memory_id: row.get("memory_id"),
        summary: row.get("summary"),
        searchable_content: row.get("searchable_content"),
        classification: row.get("classification"),
        created_at: row.get("created_at"),
    }
}
