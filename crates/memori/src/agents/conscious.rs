// crates/memori/src/agents/conscious.rs
// Conscious curator: promotes conscious-info long-term memories into the
// short-term working set. Runs once at startup and reactively when new
// promotion-eligible memories land.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::db::{ConsciousSource, MemoryStore, ShortTermRecord};
use crate::error::Result;

/// Category of promoted working-set rows.
pub const CONSCIOUS_CONTEXT_CATEGORY: &str = "conscious_context";

/// Session tag on promoted rows; promoted context is not tied to the
/// conversation that produced the source memory.
const CONSCIOUS_SESSION: &str = "default";

pub struct ConsciousAgent {
    store: Arc<dyn MemoryStore>,
}

impl ConsciousAgent {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    /// Fast-path idempotence check: any existing conscious_context rows mean
    /// initialization already ran for this user.
    pub async fn has_working_set(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .store
            .count_short_term_category(user_id, CONSCIOUS_CONTEXT_CATEGORY)
            .await?
            > 0)
    }

    /// One-shot startup ingest: copy every conscious-info memory into the
    /// working set, then mark the sources processed.
    pub async fn run_conscious_ingest(&self, user_id: &str) -> Result<usize> {
        let sources = self.store.get_conscious_memories(user_id, false, None).await?;
        if sources.is_empty() {
            info!(user_id, "no conscious-info memories found");
            return Ok(0);
        }

        let mut copied = 0;
        for source in &sources {
            if self.promote(user_id, source).await? {
                copied += 1;
            }
        }

        let ids: Vec<String> = sources.iter().map(|s| s.memory_id.clone()).collect();
        self.store.mark_conscious_processed(&ids, user_id).await?;

        info!(user_id, copied, "conscious ingest copied memories to short-term");
        Ok(copied)
    }

    /// Limited variant used when both ingest modes are enabled: seed the
    /// working set with at most `limit` top-importance conscious memories.
    pub async fn initialize_existing_conscious_memories(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<usize> {
        let sources = self
            .store
            .get_conscious_memories(user_id, false, Some(limit))
            .await?;
        if sources.is_empty() {
            info!(user_id, "no existing conscious-info memories to initialize");
            return Ok(0);
        }

        let mut copied = 0;
        for source in &sources {
            if self.promote(user_id, source).await? {
                copied += 1;
            }
        }

        if copied > 0 {
            info!(user_id, copied, "initialized existing conscious memories");
        } else {
            debug!(user_id, "all existing conscious memories were duplicates");
        }
        Ok(copied)
    }

    /// Reactive path: promote only new, unprocessed conscious-info rows.
    pub async fn check_for_context_updates(&self, user_id: &str) -> Result<usize> {
        let sources = self.store.get_conscious_memories(user_id, true, None).await?;
        if sources.is_empty() {
            return Ok(0);
        }

        let mut copied = 0;
        for source in &sources {
            if self.promote(user_id, source).await? {
                copied += 1;
            }
        }

        let ids: Vec<String> = sources.iter().map(|s| s.memory_id.clone()).collect();
        self.store.mark_conscious_processed(&ids, user_id).await?;

        info!(user_id, copied, "copied new conscious-info memories to short-term");
        Ok(copied)
    }

    /// Copy one source into the working set unless equivalent content is
    /// already there. Promoted rows are permanent and never expire.
    async fn promote(&self, user_id: &str, source: &ConsciousSource) -> Result<bool> {
        let exists = self
            .store
            .short_term_content_exists(
                user_id,
                CONSCIOUS_CONTEXT_CATEGORY,
                &source.searchable_content,
                &source.summary,
            )
            .await?;
        if exists {
            debug!(
                memory_id = %source.memory_id,
                "skipping duplicate conscious memory, similar content already in short-term"
            );
            return Ok(false);
        }

        let short_term_id = format!("conscious_{}_{}", source.memory_id, Utc::now().timestamp());
        let row = ShortTermRecord {
            memory_id: short_term_id.clone(),
            chat_id: None,
            processed_data: source.processed_data.clone(),
            importance_score: source.importance_score,
            category_primary: CONSCIOUS_CONTEXT_CATEGORY.into(),
            retention_type: "permanent".into(),
            user_id: user_id.to_string(),
            assistant_id: None,
            session_id: CONSCIOUS_SESSION.into(),
            created_at: Utc::now(),
            expires_at: None,
            searchable_content: source.searchable_content.clone(),
            summary: source.summary.clone(),
            is_permanent_context: true,
            access_count: 0,
            last_accessed: None,
        };
        self.store.store_short_term(&row).await?;

        debug!(
            source = %source.memory_id,
            promoted = %short_term_id,
            "copied conscious memory to short-term"
        );
        Ok(true)
    }
}
