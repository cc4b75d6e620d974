// crates/memori/src/search/executor.rs
// Staged search execution: primary full-text, then entity / category /
// importance stages, deduplicated by memory_id and merged under one
// composite ranking.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::context::TenantContext;
use crate::db::{MemoryStore, SearchFilters, SearchResult, escape_like};
use crate::error::Result;
use crate::search::planner::{SearchPlanner, fallback_plan};

use memori_types::SearchPlan;

/// Recency contribution: full score for fresh rows, zero after 30 days.
pub fn recency_score(created_at: DateTime<Utc>) -> f64 {
    let days_old = (Utc::now() - created_at).num_days() as f64;
    (1.0 - days_old / 30.0).clamp(0.0, 1.0)
}

/// Compute composite scores, sort descending, keep the top `limit`.
pub fn rank_and_limit(mut results: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    for result in &mut results {
        result.composite_score = 0.5 * result.search_score
            + 0.3 * result.importance_score
            + 0.2 * recency_score(result.created_at);
    }
    results.sort_by(|a, b| {
        b.composite_score
            .partial_cmp(&a.composite_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    results
}

/// Search orchestrator: plans the query (LLM or fallback) and runs the
/// staged pipeline against the store.
pub struct SearchService {
    store: Arc<dyn MemoryStore>,
    planner: Option<SearchPlanner>,
}

impl SearchService {
    pub fn new(store: Arc<dyn MemoryStore>, planner: Option<SearchPlanner>) -> Self {
        Self { store, planner }
    }

    /// Run a planned, staged search scoped to the tenant.
    pub async fn execute(
        &self,
        query: &str,
        tenant: &TenantContext,
        limit: i64,
    ) -> Result<Vec<SearchResult>> {
        tenant.validate()?;

        let query = strip_query_prefix(query).trim().to_string();
        let filters = SearchFilters {
            user_id: tenant.user_id.clone(),
            assistant_id: tenant.assistant_id.clone(),
            session_id: Some(tenant.session_id.clone()),
            category_filter: None,
            limit,
            include_short_term: true,
            include_long_term: true,
        };

        // No query: recent memories instead of an empty set.
        if query.is_empty() {
            let recent = self.store.get_recent_memories(&filters).await?;
            return Ok(rank_and_limit(recent, limit as usize));
        }

        let plan = match &self.planner {
            Some(planner) => planner.plan(&query, None).await,
            None => fallback_plan(&query),
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut results: Vec<SearchResult> = Vec::new();
        let target = limit as usize;

        // Stage 1: primary full-text (with its own LIKE fallback inside the
        // store).
        let primary = self.store.search_memories(&query, &filters).await?;
        push_unique(&mut results, &mut seen, primary);
        debug!(count = results.len(), "primary search stage complete");

        // Stage 2: entity/keyword LIKE search.
        if results.len() < target && !plan.entity_filters.is_empty() {
            let patterns: Vec<String> = plan
                .entity_filters
                .iter()
                .filter(|e| !e.trim().is_empty())
                .map(|e| format!("%{}%", escape_like(e)))
                .collect();
            if !patterns.is_empty() {
                let hits = self
                    .store
                    .like_search(&patterns, &filters, "entity_search")
                    .await?;
                push_unique(&mut results, &mut seen, hits);
                debug!(count = results.len(), "entity search stage complete");
            }
        }

        // Stage 3: category filter over recent rows.
        if results.len() < target && !plan.category_filters.is_empty() {
            let mut category_filters = filters.clone();
            category_filters.category_filter = Some(
                plan.category_filters
                    .iter()
                    .map(|c| c.as_str().to_string())
                    .collect(),
            );
            category_filters.limit = limit * 2;
            let hits = self
                .store
                .get_recent_memories(&category_filters)
                .await?
                .into_iter()
                .map(|mut r| {
                    r.search_strategy = "category_search".into();
                    r
                })
                .collect();
            push_unique(&mut results, &mut seen, hits);
            debug!(count = results.len(), "category search stage complete");
        }

        // Stage 4: importance floor.
        if results.len() < target && wants_importance_stage(&plan) {
            let min_importance = plan.min_importance.max(0.7);
            let mut wide = filters.clone();
            wide.limit = limit * 2;
            let hits: Vec<SearchResult> = self
                .store
                .get_recent_memories(&wide)
                .await?
                .into_iter()
                .filter(|r| r.importance_score >= min_importance)
                .map(|mut r| {
                    r.search_strategy = "importance_search".into();
                    r
                })
                .collect();
            push_unique(&mut results, &mut seen, hits);
            debug!(count = results.len(), "importance search stage complete");
        }

        Ok(rank_and_limit(results, target))
    }
}

fn wants_importance_stage(plan: &SearchPlan) -> bool {
    plan.min_importance > 0.0
        || plan
            .search_strategy
            .iter()
            .any(|s| s == "importance_filter")
}

fn push_unique(
    results: &mut Vec<SearchResult>,
    seen: &mut HashSet<String>,
    hits: Vec<SearchResult>,
) {
    for hit in hits {
        if seen.insert(hit.memory_id.clone()) {
            results.push(hit);
        }
    }
}

/// Strip a leading "User query:" prefix so forwarded planner prompts do not
/// interfere with the actual search terms.
pub fn strip_query_prefix(query: &str) -> &str {
    let trimmed = query.trim_start();
    trimmed
        .strip_prefix("User query:")
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use memori_types::MemoryTier;

    fn result(id: &str, search: f64, importance: f64, days_old: i64) -> SearchResult {
        SearchResult {
            memory_id: id.to_string(),
            memory_type: MemoryTier::LongTerm,
            processed_data: serde_json::Value::Null,
            importance_score: importance,
            created_at: Utc::now() - ChronoDuration::days(days_old),
            summary: String::new(),
            searchable_content: String::new(),
            category_primary: "fact".into(),
            search_score: search,
            search_strategy: "test".into(),
            composite_score: 0.0,
        }
    }

    #[test]
    fn test_recency_score_bounds() {
        assert!((recency_score(Utc::now()) - 1.0).abs() < 0.05);
        assert_eq!(recency_score(Utc::now() - ChronoDuration::days(60)), 0.0);
        let mid = recency_score(Utc::now() - ChronoDuration::days(15));
        assert!(mid > 0.4 && mid < 0.6);
    }

    #[test]
    fn test_rank_composite_weights() {
        let ranked = rank_and_limit(vec![result("a", 1.0, 0.0, 0)], 1);
        // 0.5 * 1.0 + 0.3 * 0.0 + 0.2 * ~1.0
        assert!((ranked[0].composite_score - 0.7).abs() < 0.01);
    }

    #[test]
    fn test_rank_orders_descending_and_truncates() {
        let ranked = rank_and_limit(
            vec![
                result("low", 0.1, 0.1, 29),
                result("high", 0.9, 0.9, 0),
                result("mid", 0.5, 0.5, 10),
            ],
            2,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].memory_id, "high");
        assert_eq!(ranked[1].memory_id, "mid");
    }

    #[test]
    fn test_strip_query_prefix() {
        assert_eq!(strip_query_prefix("User query: what stack?"), "what stack?");
        assert_eq!(strip_query_prefix("what stack?"), "what stack?");
        assert_eq!(strip_query_prefix("  User query:x"), "x");
    }

    #[test]
    fn test_push_unique_dedups_by_memory_id() {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        push_unique(
            &mut results,
            &mut seen,
            vec![result("a", 0.5, 0.5, 0), result("b", 0.5, 0.5, 0)],
        );
        push_unique(
            &mut results,
            &mut seen,
            vec![result("a", 0.9, 0.9, 0), result("c", 0.5, 0.5, 0)],
        );
        let ids: Vec<&str> = results.iter().map(|r| r.memory_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
