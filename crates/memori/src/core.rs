// crates/memori/src/core.rs
// The public Memori facade: wires the store, agents, search, injection,
// background executor and quota layer behind the contract hosts use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{ConsciousAgent, ConversationContext, MemoryClassifier};
use crate::background::{BackgroundExecutor, ExecutorStats};
use crate::config::MemoriConfig;
use crate::context::{TenantContext, clear_active_context, set_active_context};
use crate::db::{
    ChatRecord, ListOptions, MemoryPage, MemoryStats, MemoryStore, PoolStatus, SearchFilters,
    SearchResult, open_store,
};
use crate::error::{MemoriError, Result};
use crate::fingerprint::{DedupNet, conversation_fingerprint};
use crate::hooks::MemoriInterceptor;
use crate::injection::InjectionEngine;
use crate::llm::{ChatClient, OpenAiCompatClient};
use crate::rate_limit::{
    DEFAULT_API_CALL_LIMIT, DEFAULT_MEMORY_COUNT_LIMIT, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW,
    DEFAULT_STORAGE_LIMIT_BYTES, QuotaKind, RateLimiter,
};
use crate::search::{SearchPlanner, SearchService};

/// Seed size for the working set when both ingest modes are enabled.
const DUAL_MODE_INIT_LIMIT: i64 = 10;

/// Tenant-scoped user context fed into the classifier prompt.
#[derive(Debug, Clone, Default)]
struct UserContextInputs {
    user_preferences: Vec<String>,
    current_projects: Vec<String>,
    relevant_skills: Vec<String>,
}

struct MemoriInner {
    config: MemoriConfig,
    store: Arc<dyn MemoryStore>,
    classifier: Option<Arc<MemoryClassifier>>,
    conscious: Arc<ConsciousAgent>,
    search: Arc<SearchService>,
    injection: Arc<InjectionEngine>,
    executor: Arc<BackgroundExecutor>,
    limiter: Arc<RateLimiter>,
    dedup: DedupNet,
    enabled: AtomicBool,
    session_id: RwLock<String>,
    user_context: RwLock<UserContextInputs>,
}

/// Conversational memory layer for one tenant.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Memori {
    inner: Arc<MemoriInner>,
}

impl Memori {
    /// Open the configured backend and assemble the pipeline. No LLM
    /// provider means recording still works but classification and planned
    /// search are disabled.
    pub async fn new(config: MemoriConfig) -> Result<Self> {
        let client: Option<Arc<dyn ChatClient>> = config
            .provider
            .as_ref()
            .map(|p| Arc::new(OpenAiCompatClient::from_config(p)) as Arc<dyn ChatClient>);
        Self::build(config, client).await
    }

    /// Assemble the pipeline with a caller-supplied chat client (custom
    /// providers, test doubles).
    pub async fn with_chat_client(config: MemoriConfig, client: Arc<dyn ChatClient>) -> Result<Self> {
        Self::build(config, Some(client)).await
    }

    async fn build(config: MemoriConfig, client: Option<Arc<dyn ChatClient>>) -> Result<Self> {
        if config.user_id.trim().is_empty() {
            return Err(MemoriError::InvalidTenant(
                "user_id cannot be empty".into(),
            ));
        }

        let store = open_store(&config.connection_string, &config.pool).await?;

        let planner = client.clone().map(SearchPlanner::new);
        let search = Arc::new(SearchService::new(store.clone(), planner));
        let classifier = client
            .map(|c| Arc::new(MemoryClassifier::new(c, config.memory_filters.clone())));
        if classifier.is_none() {
            warn!("no LLM provider configured; conversations will be recorded but not classified");
        }

        let conscious = Arc::new(ConsciousAgent::new(store.clone()));
        let injection = Arc::new(InjectionEngine::new(
            store.clone(),
            search.clone(),
            config.conscious_ingest,
            config.auto_ingest,
        ));

        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            inner: Arc::new(MemoriInner {
                config,
                store,
                classifier,
                conscious,
                search,
                injection,
                executor: Arc::new(BackgroundExecutor::new()),
                limiter: Arc::new(RateLimiter::new()),
                dedup: DedupNet::default(),
                enabled: AtomicBool::new(false),
                session_id: RwLock::new(session_id),
                user_context: RwLock::new(UserContextInputs::default()),
            }),
        })
    }

    pub fn config(&self) -> &MemoriConfig {
        &self.inner.config
    }

    /// Direct access to the underlying store (host glue, fixtures).
    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.inner.store
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Current session id.
    pub fn session_id(&self) -> String {
        self.inner
            .session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The tenant tuple for this instance with the current session.
    pub fn tenant(&self) -> TenantContext {
        TenantContext::new(
            self.inner.config.user_id.clone(),
            self.inner.config.assistant_id.clone(),
            self.session_id(),
        )
    }

    pub(crate) fn injection(&self) -> &Arc<InjectionEngine> {
        &self.inner.injection
    }

    /// Build the interception seam for wrapping an LLM client.
    pub fn interceptor(&self) -> MemoriInterceptor {
        MemoriInterceptor::new(self.clone())
    }

    /// Enable recording and injection. Runs conscious initialization when
    /// configured, skipping it entirely if the user already has a
    /// conscious working set.
    pub async fn enable(&self) -> Result<()> {
        self.inner.enabled.store(true, Ordering::SeqCst);
        let user_id = self.inner.config.user_id.clone();

        if self.inner.config.auto_context {
            set_active_context(self.tenant(), None);
        }

        if self.inner.config.conscious_ingest {
            if self.inner.conscious.has_working_set(&user_id).await? {
                debug!(user_id = %user_id, "conscious working set already initialized");
            } else if self.inner.config.auto_ingest {
                self.inner
                    .conscious
                    .initialize_existing_conscious_memories(&user_id, DUAL_MODE_INIT_LIMIT)
                    .await?;
            } else {
                self.inner.conscious.run_conscious_ingest(&user_id).await?;
            }
        }

        info!(
            user_id = %user_id,
            conscious_ingest = self.inner.config.conscious_ingest,
            auto_ingest = self.inner.config.auto_ingest,
            "memori enabled"
        );
        Ok(())
    }

    /// Disable recording and injection and drop the active context.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        clear_active_context();
        info!(user_id = %self.inner.config.user_id, "memori disabled");
    }

    /// Record one exchange. Returns the chat id; duplicates suppressed by
    /// the fingerprint net return a synthetic id without touching storage.
    pub async fn record_conversation(
        &self,
        user_input: &str,
        ai_output: &str,
        model: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<String> {
        if !self.is_enabled() {
            return Err(MemoriError::NotEnabled);
        }

        let user_id = self.inner.config.user_id.clone();
        self.inner.limiter.check_rate_limit(
            &user_id,
            "record_conversation",
            DEFAULT_RATE_LIMIT,
            DEFAULT_RATE_WINDOW,
        )?;
        let exchange_bytes = (user_input.len() + ai_output.len()) as u64;
        self.inner
            .limiter
            .check_storage_quota(&user_id, exchange_bytes, DEFAULT_STORAGE_LIMIT_BYTES)?;
        self.inner
            .limiter
            .check_memory_count_quota(&user_id, DEFAULT_MEMORY_COUNT_LIMIT)?;

        let session_id = self.session_id();
        let fingerprint = conversation_fingerprint(user_input, ai_output, &session_id);
        if self.inner.dedup.check_and_insert(&fingerprint) {
            let integration = metadata
                .as_ref()
                .and_then(|m| m.get("integration"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            warn!(
                fingerprint = %fingerprint,
                integration = %integration,
                "duplicate conversation detected, skipping recording"
            );
            return Ok(Uuid::new_v4().to_string());
        }

        let chat_id = Uuid::new_v4().to_string();
        let model = model.unwrap_or("unknown").to_string();
        let tokens_used = metadata
            .as_ref()
            .and_then(|m| m.get("total_tokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let chat = ChatRecord {
            chat_id: chat_id.clone(),
            user_input: user_input.to_string(),
            ai_output: ai_output.to_string(),
            model: model.clone(),
            session_id,
            user_id: user_id.clone(),
            assistant_id: self.inner.config.assistant_id.clone(),
            tokens_used,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: chrono::Utc::now(),
        };
        self.inner.store.store_chat(&chat).await?;
        self.inner
            .limiter
            .increment(&user_id, QuotaKind::StorageBytes, exchange_bytes);
        debug!(chat_id = %chat_id, "chat history stored");

        if self.inner.classifier.is_some() {
            self.schedule_classification(&chat_id, user_input, ai_output, &model);
        } else {
            debug!(chat_id = %chat_id, "classifier unavailable, skipping memory processing");
        }

        Ok(chat_id)
    }

    /// Schedule classification on the background executor. The job carries
    /// its tenant explicitly and re-establishes the context when it runs.
    fn schedule_classification(&self, chat_id: &str, user_input: &str, ai_output: &str, model: &str) {
        let Some(classifier) = self.inner.classifier.clone() else {
            return;
        };
        let store = self.inner.store.clone();
        let conscious = self.inner.conscious.clone();
        let limiter = self.inner.limiter.clone();
        let tenant = self.tenant();
        let conscious_ingest = self.inner.config.conscious_ingest;
        let user_ctx = self
            .inner
            .user_context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let chat_id = chat_id.to_string();
        let user_input = user_input.to_string();
        let ai_output = ai_output.to_string();
        let model = model.to_string();

        let _handle = self.inner.executor.submit(async move {
            set_active_context(tenant.clone(), None);

            // Classification spends an LLM call; the daily quota gates it.
            if let Err(e) = limiter.check_api_call_quota(&tenant.user_id, DEFAULT_API_CALL_LIMIT) {
                warn!(chat_id = %chat_id, error = %e, "classification skipped");
                return;
            }

            let candidates = match store.get_recent_long_term(&tenant.user_id, 24, 20).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    debug!(error = %e, "could not load recent memories for dedup");
                    Vec::new()
                }
            };

            let context = ConversationContext {
                user_id: tenant.user_id.clone(),
                session_id: tenant.session_id.clone(),
                chat_id: chat_id.clone(),
                model,
                user_preferences: user_ctx.user_preferences,
                current_projects: user_ctx.current_projects,
                relevant_skills: user_ctx.relevant_skills,
                recent_summaries: candidates.iter().take(10).map(|c| c.summary.clone()).collect(),
            };

            let mut memory = match classifier
                .classify_with_retry(&user_input, &ai_output, &context, &tenant)
                .await
            {
                Ok(memory) => {
                    limiter.increment(&tenant.user_id, QuotaKind::ApiCalls, 1);
                    memory
                }
                Err(e) => {
                    // Chat history stays intact; the memory is dropped.
                    error!(chat_id = %chat_id, error = %e, "memory classification failed");
                    return;
                }
            };

            if let Some(original) = classifier.detect_duplicate(&memory, &candidates) {
                info!(chat_id = %chat_id, original = %original, "memory marked as duplicate");
                memory.duplicate_of = Some(original);
            }

            if let Some(filter) = classifier.should_filter(&memory) {
                debug!(chat_id = %chat_id, filter, "memory filtered out before storage");
                return;
            }

            match store.store_long_term(&memory, Some(&chat_id), &tenant).await {
                Ok(memory_id) => {
                    limiter.increment(&tenant.user_id, QuotaKind::MemoryCount, 1);
                    debug!(chat_id = %chat_id, memory_id = %memory_id, "stored processed memory");

                    if memory.promotion_eligible && conscious_ingest {
                        if let Err(e) = conscious.check_for_context_updates(&tenant.user_id).await {
                            warn!(error = %e, "conscious context update failed");
                        }
                    }
                }
                Err(e) => {
                    error!(chat_id = %chat_id, error = %e, "failed to store long-term memory");
                }
            }
        });
    }

    /// Retrieve relevant context for a query via the planned search
    /// pipeline. Failures degrade to an empty result.
    pub async fn retrieve_context(&self, query: &str, limit: i64) -> Result<Vec<SearchResult>> {
        if !self.is_enabled() {
            warn!("memori is not enabled, returning empty context");
            return Ok(Vec::new());
        }

        match self.inner.search.execute(query, &self.tenant(), limit).await {
            Ok(results) => Ok(results),
            Err(e @ MemoriError::InvalidTenant(_)) => Err(e),
            Err(e) => {
                error!(error = %e, "context retrieval failed");
                Ok(Vec::new())
            }
        }
    }

    /// Direct ranked search over the store (no LLM planning).
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchResult>> {
        if !self.is_enabled() {
            warn!("memori is not enabled, returning empty results");
            return Ok(Vec::new());
        }

        let user_id = &self.inner.config.user_id;
        self.inner.limiter.check_rate_limit(
            user_id,
            "search",
            DEFAULT_RATE_LIMIT,
            DEFAULT_RATE_WINDOW,
        )?;

        let filters = SearchFilters {
            user_id: user_id.clone(),
            assistant_id: self.inner.config.assistant_id.clone(),
            session_id: Some(self.session_id()),
            category_filter: None,
            limit,
            include_short_term: true,
            include_long_term: true,
        };
        match self.inner.store.search_memories(query, &filters).await {
            Ok(results) => Ok(results),
            Err(e @ MemoriError::InvalidTenant(_)) => Err(e),
            Err(e) => {
                error!(error = %e, "search failed");
                Ok(Vec::new())
            }
        }
    }

    /// Store a user-provided memory through the normal pipeline.
    pub async fn add(&self, text: &str, metadata: Option<Value>) -> Result<String> {
        let metadata = metadata
            .unwrap_or_else(|| serde_json::json!({"type": "manual_memory", "source": "add"}));
        self.record_conversation(text, "Memory recorded successfully", None, Some(metadata))
            .await
    }

    pub async fn get_stats(&self) -> Result<MemoryStats> {
        self.inner
            .store
            .get_memory_stats(&self.inner.config.user_id)
            .await
    }

    /// Paginated listing across tiers (dashboard views).
    pub async fn list_memories(&self, options: &ListOptions) -> Result<MemoryPage> {
        self.inner
            .store
            .list_memories(&self.inner.config.user_id, options)
            .await
    }

    /// Newest-first chat history for this tenant's current session scope.
    pub async fn get_conversation_history(&self, limit: i64) -> Result<Vec<ChatRecord>> {
        self.inner
            .store
            .get_chat_history(
                &self.inner.config.user_id,
                Some(&self.session_id()),
                limit,
            )
            .await
    }

    /// Tenant-scoped delete. Tier: "short_term" | "long_term" |
    /// "chat_history" | None for everything.
    pub async fn clear_memory(&self, tier: Option<&str>) -> Result<u64> {
        self.inner
            .store
            .clear_memory(&self.inner.config.user_id, tier)
            .await
    }

    /// Start a fresh session: new session id, conscious context eligible
    /// for injection again.
    pub fn start_new_conversation(&self) -> String {
        let new_session = Uuid::new_v4().to_string();
        {
            let mut session = self
                .inner
                .session_id
                .write()
                .unwrap_or_else(|e| e.into_inner());
            *session = new_session.clone();
        }
        self.inner.injection.reset_conscious_flag();
        info!(session_id = %new_session, "started new conversation");
        new_session
    }

    /// Update the tenant profile fed into classification prompts.
    pub fn update_user_context(
        &self,
        user_preferences: Option<Vec<String>>,
        current_projects: Option<Vec<String>>,
        relevant_skills: Option<Vec<String>>,
    ) {
        let mut ctx = self
            .inner
            .user_context
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(preferences) = user_preferences {
            ctx.user_preferences = preferences;
        }
        if let Some(projects) = current_projects {
            ctx.current_projects = projects;
        }
        if let Some(skills) = relevant_skills {
            ctx.relevant_skills = skills;
        }
    }

    /// Top essential-classified memories (identity facts, durable
    /// preferences), importance-ordered.
    pub async fn get_essential_conversations(&self, limit: i64) -> Result<Vec<SearchResult>> {
        self.inner
            .store
            .get_essential_memories(&self.inner.config.user_id, limit)
            .await
    }

    /// Trigger the reactive conscious check for this tenant.
    pub async fn trigger_conscious_update(&self) -> Result<usize> {
        self.inner
            .conscious
            .check_for_context_updates(&self.inner.config.user_id)
            .await
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.inner.executor.stats()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.store.pool_status()
    }

    /// Stop background processing, cancelling pending classification.
    pub fn shutdown(&self, timeout: std::time::Duration) {
        self.inner.executor.shutdown(timeout);
    }
}

/// Module-level context helpers re-exposed under the names hosts know.
pub fn set_active_memori_context(memori: &Memori, request_id: Option<String>) {
    set_active_context(memori.tenant(), request_id);
}

pub fn get_active_memori_context(require_valid: bool) -> Result<Option<TenantContext>> {
    crate::context::get_active_context(require_valid)
}

pub fn clear_active_memori_context() {
    clear_active_context();
}
