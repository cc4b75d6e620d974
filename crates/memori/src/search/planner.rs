// crates/memori/src/search/planner.rs
// LLM-backed query planning with a TTL cache and a tokenizing fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use memori_types::SearchPlan;

use crate::llm::{ChatClient, structured_completion};

/// Marker prepended to the planner's own LLM prompts so the recording
/// pipeline never records or re-injects internal agent calls.
pub const INTERNAL_SEARCH_SENTINEL: &str = "[INTERNAL_MEMORI_SEARCH]";

/// Plan cache TTL. Expired entries are swept on access.
const PLAN_CACHE_TTL: Duration = Duration::from_secs(300);

const PLANNER_SYSTEM_PROMPT: &str = "\
You are a memory search planner. Given a user's query, produce a structured \
search plan for a two-tier conversational memory store.\n\
\n\
Interpret the intent, extract the specific entities worth matching, pick \
relevant memory categories (fact, preference, skill, context, rule), and \
recommend search strategies from: keyword_search, entity_search, \
category_filter, importance_filter, temporal_filter, semantic_search.\n\
Set min_importance above 0 only when the query clearly asks for important \
or essential information.";

/// Plans searches via the LLM, caching plans per (query, context).
///
/// The cache is deliberately not keyed on tenant: plans derive from the
/// query text alone.
pub struct SearchPlanner {
    client: Arc<dyn ChatClient>,
    cache: Mutex<HashMap<String, (SearchPlan, Instant)>>,
}

impl SearchPlanner {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Produce a search plan for a query. LLM failures and refusals degrade
    /// to the tokenizing fallback plan.
    pub async fn plan(&self, query: &str, context: Option<&str>) -> SearchPlan {
        let cache_key = format!("{query}|{}", context.unwrap_or(""));

        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.retain(|_, (_, at)| at.elapsed() < PLAN_CACHE_TTL);
            if let Some((plan, _)) = cache.get(&cache_key) {
                debug!(query, "using cached search plan");
                return plan.clone();
            }
        }

        let mut prompt = format!("{INTERNAL_SEARCH_SENTINEL}\nUser query: {query}");
        if let Some(ctx) = context {
            prompt.push_str(&format!("\nAdditional context: {ctx}"));
        }

        let plan = match structured_completion::<SearchPlan>(
            self.client.as_ref(),
            "memory_search_plan",
            PLANNER_SYSTEM_PROMPT,
            &prompt,
        )
        .await
        {
            Ok(mut plan) => {
                if plan.query_text.is_empty() {
                    plan.query_text = query.to_string();
                }
                plan.min_importance = plan.min_importance.clamp(0.0, 1.0);
                debug!(
                    query,
                    intent = %plan.intent,
                    strategies = ?plan.search_strategy,
                    "planned search"
                );
                plan
            }
            Err(e) => {
                warn!(query, error = %e, "search planning failed, using fallback plan");
                fallback_plan(query)
            }
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(cache_key, (plan.clone(), Instant::now()));
        plan
    }

    #[cfg(test)]
    pub(crate) fn cached_plan_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

/// Plan used when the LLM fails or no planner is configured: keep tokens
/// longer than 2 characters as entity filters.
pub fn fallback_plan(query: &str) -> SearchPlan {
    SearchPlan {
        query_text: query.to_string(),
        intent: "General search (fallback)".into(),
        entity_filters: query
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(str::to_string)
            .collect(),
        category_filters: Vec::new(),
        time_range: None,
        min_importance: 0.0,
        search_strategy: vec!["keyword_search".into(), "general_search".into()],
        expected_result_types: vec!["any".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_plan_tokenizes() {
        let plan = fallback_plan("what is my backend stack");
        assert_eq!(plan.entity_filters, vec!["what", "backend", "stack"]);
        assert_eq!(
            plan.search_strategy,
            vec!["keyword_search".to_string(), "general_search".to_string()]
        );
    }

    #[test]
    fn test_fallback_plan_keeps_query_text() {
        let plan = fallback_plan("Python");
        assert_eq!(plan.query_text, "Python");
        assert_eq!(plan.entity_filters, vec!["Python"]);
    }

    #[test]
    fn test_fallback_plan_empty_query() {
        let plan = fallback_plan("");
        assert!(plan.entity_filters.is_empty());
    }
}
