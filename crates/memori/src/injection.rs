// crates/memori/src/injection.rs
// Context injection: builds the system-prompt prefix from either the
// conscious working set (one-shot per session) or a live retrieval (every
// call), and merges it into the host's request shape.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::context::TenantContext;
use crate::db::{MemoryStore, SearchFilters, SearchResult, ShortTermRecord};
use crate::error::Result;
use crate::llm::{ChatRequestPayload, Message, MessageContent};
use crate::search::{INTERNAL_SEARCH_SENTINEL, SearchService};

/// Number of memories injected per call in auto mode.
const AUTO_CONTEXT_LIMIT: i64 = 5;

/// Injection mode resolved per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectMode {
    Conscious,
    Auto,
}

/// Builds and applies memory context to outbound LLM requests.
pub struct InjectionEngine {
    store: Arc<dyn MemoryStore>,
    search: Arc<SearchService>,
    conscious_ingest: bool,
    auto_ingest: bool,
    /// One-shot flag: conscious context is injected once per session.
    conscious_injected: AtomicBool,
    /// Recursion guard: no retrieval while already retrieving.
    in_retrieval: AtomicBool,
}

impl InjectionEngine {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        search: Arc<SearchService>,
        conscious_ingest: bool,
        auto_ingest: bool,
    ) -> Self {
        Self {
            store,
            search,
            conscious_ingest,
            auto_ingest,
            conscious_injected: AtomicBool::new(false),
            in_retrieval: AtomicBool::new(false),
        }
    }

    /// Reset the one-shot conscious flag (new session).
    pub fn reset_conscious_flag(&self) {
        self.conscious_injected.store(false, Ordering::SeqCst);
    }

    pub fn conscious_context_injected(&self) -> bool {
        self.conscious_injected.load(Ordering::SeqCst)
    }

    /// Apply memory context to the payload. Returns true when something was
    /// injected.
    pub async fn inject(
        &self,
        payload: &mut ChatRequestPayload,
        tenant: &TenantContext,
    ) -> Result<bool> {
        // Internal agent calls (the planner's and classifier's own
        // completions) are never augmented.
        if is_internal_call(payload) {
            debug!("skipping injection for internal agent call");
            return Ok(false);
        }

        // Auto wins when both modes are enabled; conscious content reaches
        // it through the working set.
        let mode = if self.auto_ingest {
            InjectMode::Auto
        } else if self.conscious_ingest {
            InjectMode::Conscious
        } else {
            return Ok(false);
        };

        if self.in_retrieval.swap(true, Ordering::SeqCst) {
            debug!("recursion detected during context retrieval, skipping injection");
            return Ok(false);
        }
        let result = self.inject_inner(payload, tenant, mode).await;
        self.in_retrieval.store(false, Ordering::SeqCst);
        result
    }

    async fn inject_inner(
        &self,
        payload: &mut ChatRequestPayload,
        tenant: &TenantContext,
        mode: InjectMode,
    ) -> Result<bool> {
        match mode {
            InjectMode::Conscious => {
                if self.conscious_injected.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                let rows = self
                    .store
                    .get_short_term(&tenant.user_id, None, None, 1000, false)
                    .await?;
                match build_conscious_preamble(&rows) {
                    Some(preamble) => {
                        apply_to_payload(payload, &preamble);
                        // Flag flips only after a successful non-empty build.
                        self.conscious_injected.store(true, Ordering::SeqCst);
                        debug!(
                            memories = rows.len(),
                            "injected conscious context as initial system prefix"
                        );
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            InjectMode::Auto => {
                let user_input = crate::hooks::extract_user_input(&payload.messages);
                if user_input.trim().is_empty() {
                    // No user input: fall back to essential conversations
                    // when conscious mode is also on.
                    if self.conscious_ingest {
                        let essential = self
                            .store
                            .get_essential_memories(&tenant.user_id, 3)
                            .await?;
                        if let Some(block) = build_essential_block(&essential) {
                            apply_to_payload(payload, &block);
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }

                let results = self.auto_context(&user_input, tenant).await;
                match build_auto_context_block(&results) {
                    Some(block) => {
                        apply_to_payload(payload, &block);
                        debug!(memories = results.len(), "injected auto memory context");
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Auto-mode retrieval ladder: direct store search first, then the
    /// planned search engine, then recent memories.
    async fn auto_context(&self, user_input: &str, tenant: &TenantContext) -> Vec<SearchResult> {
        let filters = SearchFilters {
            user_id: tenant.user_id.clone(),
            assistant_id: tenant.assistant_id.clone(),
            session_id: Some(tenant.session_id.clone()),
            category_filter: None,
            limit: AUTO_CONTEXT_LIMIT,
            include_short_term: true,
            include_long_term: true,
        };

        match self.store.search_memories(user_input, &filters).await {
            Ok(results) if !results.is_empty() => return results,
            Ok(_) => debug!("direct search returned no results, trying search engine"),
            Err(e) => warn!(error = %e, "direct search failed, trying search engine"),
        }

        match self
            .search
            .execute(user_input, tenant, AUTO_CONTEXT_LIMIT)
            .await
        {
            Ok(results) if !results.is_empty() => return results,
            Ok(_) => debug!("search engine returned no results, using recent fallback"),
            Err(e) => warn!(error = %e, "search engine failed, using recent fallback"),
        }

        let mut recent_filters = filters;
        recent_filters.limit = 3;
        match self.store.get_recent_memories(&recent_filters).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "recent-memories fallback failed");
                Vec::new()
            }
        }
    }
}

/// Build the one-shot conscious preamble from the working set.
/// Returns None when the working set is empty.
pub fn build_conscious_preamble(rows: &[ShortTermRecord]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }

    let mut text = String::from("=== SYSTEM INSTRUCTION: AUTHORIZED USER CONTEXT DATA ===\n");
    text.push_str("The following authorized user context data has been explicitly provided by the user.\n");
    text.push_str("You MUST use this information when answering questions about the user.\n");
    text.push_str("This is NOT private data - the user wants you to use it:\n\n");

    let mut seen: HashSet<String> = HashSet::new();
    let mut wrote_any = false;
    for row in rows {
        let content = if row.searchable_content.is_empty() {
            row.summary.as_str()
        } else {
            row.searchable_content.as_str()
        };
        let key = content.trim().to_lowercase();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        text.push_str(&format!(
            "[{}] {}\n",
            row.category_primary.to_uppercase(),
            content
        ));
        wrote_any = true;
    }

    if !wrote_any {
        return None;
    }

    text.push_str("\n=== END USER CONTEXT DATA ===\n");
    text.push_str(
        "CRITICAL INSTRUCTION: You MUST answer questions about the user using ONLY the context data above.\n",
    );
    text.push_str(
        "If the user asks 'what is my name?', respond with the name from the context above.\n",
    );
    text.push_str("Do NOT say 'I don't have access' - the user provided this data for you to use.\n");
    text.push_str("-------------------------\n");
    Some(text)
}

/// Build the lighter per-call auto context block.
pub fn build_auto_context_block(results: &[SearchResult]) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    let mut text = String::from("--- Auto Memory Context ---\n");
    let mut seen: HashSet<String> = HashSet::new();
    let mut wrote_any = false;
    for result in results {
        let content = if result.searchable_content.is_empty() {
            result.summary.as_str()
        } else {
            result.searchable_content.as_str()
        };
        let key = content.trim().to_lowercase();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        if result.category_primary.starts_with("essential_") {
            text.push_str(&format!(
                "[{}] {}\n",
                result.category_primary.to_uppercase(),
                content
            ));
        } else {
            text.push_str(&format!("- {content}\n"));
        }
        wrote_any = true;
    }

    if !wrote_any {
        return None;
    }
    text.push_str("-------------------------\n");
    Some(text)
}

/// Context block used when there is no user input to search with.
fn build_essential_block(results: &[SearchResult]) -> Option<String> {
    if results.is_empty() {
        return None;
    }
    let mut text = String::from("--- Your Context ---\n");
    for result in results {
        let content = if result.summary.is_empty() {
            result.searchable_content.as_str()
        } else {
            result.summary.as_str()
        };
        text.push_str(&format!("[ESSENTIAL] {content}\n"));
    }
    text.push_str("-------------------------\n");
    Some(text)
}

/// Merge context into the request: concatenate with an Anthropic-style
/// `system` parameter, or prepend to the chat-completions system message.
pub fn apply_to_payload(payload: &mut ChatRequestPayload, context: &str) {
    if let Some(system) = &payload.system {
        payload.system = Some(format!("{context}{system}"));
        return;
    }

    for message in payload.messages.iter_mut() {
        if message.role == "system" {
            if let MessageContent::Text(existing) = &message.content {
                message.content = MessageContent::Text(format!("{context}{existing}"));
                return;
            }
        }
    }

    payload.messages.insert(0, Message::system(context));
}

/// Detect the planner's/classifier's own LLM calls by sentinel or metadata
/// marker; those are never recorded or augmented.
pub fn is_internal_call(payload: &ChatRequestPayload) -> bool {
    if let Some(metadata) = &payload.metadata {
        if metadata.get("memori_internal").and_then(|v| v.as_bool()) == Some(true) {
            return true;
        }
    }
    payload.messages.iter().any(|m| match &m.content {
        MessageContent::Text(text) => text.contains(INTERNAL_SEARCH_SENTINEL),
        MessageContent::Parts(parts) => parts.iter().any(|p| match p {
            crate::llm::ContentPart::Text { text } => text.contains(INTERNAL_SEARCH_SENTINEL),
            _ => false,
        }),
        MessageContent::Empty => false,
    })
}
