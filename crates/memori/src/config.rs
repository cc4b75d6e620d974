// crates/memori/src/config.rs
// Configuration for the memori core: storage, ingest modes, provider, pooling

use serde::{Deserialize, Serialize};

/// Connection pool settings for relational backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Base number of pooled connections
    pub pool_size: u32,
    /// Additional connections allowed beyond the base size
    pub max_overflow: u32,
    /// Seconds to wait for a free connection before failing
    pub acquire_timeout_secs: u64,
    /// Recycle connections older than this many seconds (None = never)
    pub recycle_secs: Option<u64>,
    /// Validate connections before handing them out
    pub pre_ping: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout_secs: 30,
            recycle_secs: Some(3600),
            pre_ping: true,
        }
    }
}

impl PoolSettings {
    /// Total connection ceiling (base + overflow).
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

/// LLM provider configuration for the classifier and query planner.
///
/// API keys come from explicit configuration only; nothing is read from the
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    /// Custom base URL (None = the provider's default endpoint)
    pub base_url: Option<String>,
    pub model: String,
    /// Provider flavor hint: "openai", "azure", or a custom marker
    pub api_type: Option<String>,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: "gpt-4o".into(),
            api_type: None,
        }
    }

    /// Whether the configured endpoint supports structured outputs.
    ///
    /// Custom endpoints (local models, proxies) typically accept chat
    /// completions but reject the `json_schema` response format, so those
    /// fall back to JSON-schema-in-prompt parsing.
    pub fn supports_structured_output(&self) -> bool {
        match self.api_type.as_deref() {
            Some("azure") => true,
            Some("openai") | None => match self.base_url.as_deref() {
                None => true,
                Some(url) => url.contains("api.openai.com"),
            },
            Some(_) => false,
        }
    }
}

/// Top-level configuration for a [`Memori`](crate::Memori) instance.
#[derive(Debug, Clone)]
pub struct MemoriConfig {
    /// Backend connection string (`sqlite:`, `mysql:`, `postgresql:`,
    /// `mongodb:`/`mongodb+srv:`)
    pub connection_string: String,
    /// Schema template name (reserved; "basic" is the only shipped template)
    pub template: String,
    /// Pre-load conscious-info memories into the working set and inject them
    /// once per session
    pub conscious_ingest: bool,
    /// Run a retrieval per LLM call and inject the top results
    pub auto_ingest: bool,
    /// Tenant: owning user (required, non-empty)
    pub user_id: String,
    /// Tenant: owning assistant (None = shared across assistants)
    pub assistant_id: Option<String>,
    /// Tenant: conversation session (None = generated on construction)
    pub session_id: Option<String>,
    /// LLM provider for classification and search planning (None disables both)
    pub provider: Option<ProviderConfig>,
    pub pool: PoolSettings,
    /// Auto-set this instance as the active context on enable().
    /// Off by default: convenient for single-tenant hosts, masks bugs in
    /// multi-tenant deployments.
    pub auto_context: bool,
    /// Substrings that cause a classified memory to be discarded before storage
    pub memory_filters: Vec<String>,
}

impl MemoriConfig {
    pub fn new(connection_string: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            template: "basic".into(),
            conscious_ingest: false,
            auto_ingest: false,
            user_id: user_id.into(),
            assistant_id: None,
            session_id: None,
            provider: None,
            pool: PoolSettings::default(),
            auto_context: false,
            memory_filters: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let pool = PoolSettings::default();
        assert_eq!(pool.pool_size, 5);
        assert_eq!(pool.max_connections(), 15);
        assert!(pool.pre_ping);
    }

    #[test]
    fn test_structured_output_default_endpoint() {
        let p = ProviderConfig::new("sk-test");
        assert!(p.supports_structured_output());
    }

    #[test]
    fn test_structured_output_azure() {
        let mut p = ProviderConfig::new("key");
        p.api_type = Some("azure".into());
        p.base_url = Some("https://myorg.openai.azure.com".into());
        assert!(p.supports_structured_output());
    }

    #[test]
    fn test_structured_output_local_endpoint() {
        let mut p = ProviderConfig::new("ollama");
        p.base_url = Some("http://localhost:11434/v1".into());
        assert!(!p.supports_structured_output());
    }

    #[test]
    fn test_structured_output_custom_api_type() {
        let mut p = ProviderConfig::new("key");
        p.api_type = Some("custom".into());
        assert!(!p.supports_structured_output());
    }

    #[test]
    fn test_config_defaults() {
        let cfg = MemoriConfig::new("sqlite::memory:", "alice");
        assert!(!cfg.conscious_ingest);
        assert!(!cfg.auto_ingest);
        assert!(!cfg.auto_context);
        assert!(cfg.session_id.is_none());
    }
}
