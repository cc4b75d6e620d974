// crates/memori/src/agents/classifier.rs
// LLM-backed memory classifier: turns one (user_input, ai_output) exchange
// into a typed ProcessedLongTermMemory with dedup signals.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use memori_types::{MemoryClassification, ProcessedLongTermMemory};

use crate::context::{TenantContext, set_active_context};
use crate::db::DedupCandidate;
use crate::error::{MemoriError, Result};
use crate::llm::{ChatClient, structured_completion};

/// Total budget for one classification attempt.
pub const CLASSIFICATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Retries after the first failed attempt.
pub const CLASSIFICATION_RETRIES: u32 = 2;
/// Gap between retries.
const RETRY_GAP: Duration = Duration::from_secs(2);

/// Summary token overlap at or above this marks a near-duplicate.
const DUPLICATE_SIMILARITY_THRESHOLD: f64 = 0.8;

const CLASSIFIER_SYSTEM_PROMPT: &str = "\
You are a memory classification agent. Analyze one exchange between a user \
and an AI assistant and extract the memory worth keeping.\n\
\n\
Classifications:\n\
- essential: core facts, preferences, skills\n\
- contextual: project context, ongoing work\n\
- conversational: regular chat, questions, discussions\n\
- reference: code examples, technical references\n\
- personal: user details, relationships, life events\n\
- conscious-info: identity-level facts the assistant should always have at \
hand (name, role, durable preferences); mark these promotion_eligible\n\
\n\
Assign importance (critical/high/medium/low), extract the topic, entities \
and keywords, and set the user-context flags. If the exchange restates one \
of the existing memory summaries provided, still classify it but keep the \
summary close to the original so duplicates are detectable.";

/// Tenant-side inputs that shape classification.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub user_id: String,
    pub session_id: String,
    pub chat_id: String,
    pub model: String,
    pub user_preferences: Vec<String>,
    pub current_projects: Vec<String>,
    pub relevant_skills: Vec<String>,
    /// Up to 10 recent long-term summaries for dedup context
    pub recent_summaries: Vec<String>,
}

/// LLM-backed classifier with retry, dedup and filtering.
pub struct MemoryClassifier {
    client: Arc<dyn ChatClient>,
    memory_filters: Vec<String>,
}

impl MemoryClassifier {
    pub fn new(client: Arc<dyn ChatClient>, memory_filters: Vec<String>) -> Self {
        Self {
            client,
            memory_filters,
        }
    }

    fn build_prompt(user_input: &str, ai_output: &str, context: &ConversationContext) -> String {
        let mut prompt = format!(
            "{}\nClassify this exchange.\n\nUser: {user_input}\nAssistant: {ai_output}\n",
            crate::search::INTERNAL_SEARCH_SENTINEL
        );
        if !context.user_preferences.is_empty() {
            prompt.push_str(&format!(
                "\nKnown user preferences: {}",
                context.user_preferences.join("; ")
            ));
        }
        if !context.current_projects.is_empty() {
            prompt.push_str(&format!(
                "\nCurrent projects: {}",
                context.current_projects.join("; ")
            ));
        }
        if !context.relevant_skills.is_empty() {
            prompt.push_str(&format!(
                "\nRelevant skills: {}",
                context.relevant_skills.join("; ")
            ));
        }
        if !context.recent_summaries.is_empty() {
            prompt.push_str("\nExisting memory summaries:\n");
            for summary in context.recent_summaries.iter().take(10) {
                prompt.push_str(&format!("- {summary}\n"));
            }
        }
        prompt
    }

    /// One classification attempt. Output is validated against the schema;
    /// invalid outputs are dropped.
    pub async fn classify(
        &self,
        user_input: &str,
        ai_output: &str,
        context: &ConversationContext,
    ) -> Result<ProcessedLongTermMemory> {
        let prompt = Self::build_prompt(user_input, ai_output, context);
        let mut memory = structured_completion::<ProcessedLongTermMemory>(
            self.client.as_ref(),
            "processed_long_term_memory",
            CLASSIFIER_SYSTEM_PROMPT,
            &prompt,
        )
        .await?;

        if memory.content.trim().is_empty() || memory.summary.trim().is_empty() {
            return Err(MemoriError::Classifier(
                "classifier produced empty content or summary".into(),
            ));
        }

        memory.confidence_score = memory.confidence_score.clamp(0.0, 1.0);
        if memory.session_id.is_empty() {
            memory.session_id = context.session_id.clone();
        }
        // conscious-info implies promotion eligibility.
        if memory.classification == MemoryClassification::ConsciousInfo {
            memory.promotion_eligible = true;
        }

        Ok(memory)
    }

    /// Classification with the full retry envelope: 60 s per attempt, up to
    /// 2 retries with a 2 s gap. The tenant context is re-set on each
    /// attempt since retries may land after the previous one expired.
    pub async fn classify_with_retry(
        &self,
        user_input: &str,
        ai_output: &str,
        context: &ConversationContext,
        tenant: &TenantContext,
    ) -> Result<ProcessedLongTermMemory> {
        let mut last_error = None;
        for attempt in 0..=CLASSIFICATION_RETRIES {
            set_active_context(tenant.clone(), None);

            match tokio::time::timeout(
                CLASSIFICATION_TIMEOUT,
                self.classify(user_input, ai_output, context),
            )
            .await
            {
                Ok(Ok(memory)) => return Ok(memory),
                Ok(Err(e)) => {
                    warn!(
                        chat_id = %context.chat_id,
                        attempt,
                        error = %e,
                        "classification attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        chat_id = %context.chat_id,
                        attempt,
                        "classification attempt timed out"
                    );
                    last_error = Some(MemoriError::Classifier(format!(
                        "classification timed out after {}s",
                        CLASSIFICATION_TIMEOUT.as_secs()
                    )));
                }
            }

            if attempt < CLASSIFICATION_RETRIES {
                tokio::time::sleep(RETRY_GAP).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| MemoriError::Classifier("classification failed".into())))
    }

    /// Summary-similarity duplicate detection against recent long-term
    /// rows. Returns the original's memory_id on a near-duplicate.
    pub fn detect_duplicate(
        &self,
        memory: &ProcessedLongTermMemory,
        candidates: &[DedupCandidate],
    ) -> Option<String> {
        for candidate in candidates {
            if candidate.searchable_content == memory.content {
                return Some(candidate.memory_id.clone());
            }
            let similarity = summary_similarity(&memory.summary, &candidate.summary);
            if similarity >= DUPLICATE_SIMILARITY_THRESHOLD {
                debug!(
                    original = %candidate.memory_id,
                    similarity,
                    "summary similarity marks memory as duplicate"
                );
                return Some(candidate.memory_id.clone());
            }
        }
        None
    }

    /// Apply user-supplied memory filters. Returns the matching filter when
    /// the memory should be discarded.
    pub fn should_filter(&self, memory: &ProcessedLongTermMemory) -> Option<&str> {
        for filter in &self.memory_filters {
            let needle = filter.to_lowercase();
            if memory.content.to_lowercase().contains(&needle)
                || memory.summary.to_lowercase().contains(&needle)
            {
                return Some(filter.as_str());
            }
        }
        None
    }
}

fn token_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Jaccard overlap of the summaries' token sets.
fn summary_similarity(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(id: &str, summary: &str, content: &str) -> DedupCandidate {
        DedupCandidate {
            memory_id: id.to_string(),
            summary: summary.to_string(),
            searchable_content: content.to_string(),
            classification: "conversational".into(),
            created_at: Utc::now(),
        }
    }

    fn memory(content: &str, summary: &str) -> ProcessedLongTermMemory {
        serde_json::from_value(serde_json::json!({
            "content": content,
            "summary": summary,
        }))
        .unwrap()
    }

    fn classifier(filters: Vec<String>) -> MemoryClassifier {
        // The client is never called by the pure helpers under test.
        struct NeverClient;
        #[async_trait::async_trait]
        impl ChatClient for NeverClient {
            async fn chat(
                &self,
                _messages: Vec<crate::llm::Message>,
                _params: crate::llm::ChatParams,
            ) -> Result<crate::llm::ChatResult> {
                Err(MemoriError::Llm("not expected".into()))
            }
            fn supports_structured_output(&self) -> bool {
                true
            }
            fn model_name(&self) -> String {
                "never".into()
            }
        }
        MemoryClassifier::new(Arc::new(NeverClient), filters)
    }

    #[test]
    fn test_summary_similarity_identical() {
        assert_eq!(summary_similarity("prefers rust", "prefers rust"), 1.0);
    }

    #[test]
    fn test_summary_similarity_disjoint() {
        assert_eq!(summary_similarity("likes tea", "builds rockets"), 0.0);
    }

    #[test]
    fn test_detect_duplicate_by_similar_summary() {
        let c = classifier(vec![]);
        let mem = memory("User prefers Python for backend work", "User prefers Python for backend");
        let candidates = vec![
            candidate("other", "User lives in Oslo", "User lives in Oslo"),
            candidate("dup", "User prefers Python for backend", "something else"),
        ];
        assert_eq!(c.detect_duplicate(&mem, &candidates), Some("dup".into()));
    }

    #[test]
    fn test_detect_duplicate_by_exact_content() {
        let c = classifier(vec![]);
        let mem = memory("I use FastAPI", "totally different phrasing here");
        let candidates = vec![candidate("dup", "unrelated summary words", "I use FastAPI")];
        assert_eq!(c.detect_duplicate(&mem, &candidates), Some("dup".into()));
    }

    #[test]
    fn test_detect_duplicate_none() {
        let c = classifier(vec![]);
        let mem = memory("I use FastAPI", "FastAPI usage");
        let candidates = vec![candidate("x", "User lives in Oslo", "User lives in Oslo")];
        assert_eq!(c.detect_duplicate(&mem, &candidates), None);
    }

    #[test]
    fn test_should_filter_matches_substring() {
        let c = classifier(vec!["password".into()]);
        let mem = memory("my Password is hunter2", "credentials");
        assert_eq!(c.should_filter(&mem), Some("password"));

        let clean = memory("I like tea", "tea preference");
        assert_eq!(c.should_filter(&clean), None);
    }

    #[test]
    fn test_prompt_includes_context() {
        let ctx = ConversationContext {
            user_preferences: vec!["dark mode".into()],
            current_projects: vec!["memori".into()],
            recent_summaries: vec!["knows rust".into()],
            ..Default::default()
        };
        let prompt = MemoryClassifier::build_prompt("hi", "hello", &ctx);
        assert!(prompt.contains("dark mode"));
        assert!(prompt.contains("memori"));
        assert!(prompt.contains("knows rust"));
        assert!(prompt.contains(crate::search::INTERNAL_SEARCH_SENTINEL));
    }
}
