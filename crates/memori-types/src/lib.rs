// crates/memori-types/src/lib.rs

//! Shared data contracts between the memori core and its hosts.
//!
//! This crate provides the domain model for:
//! - **Classification**: the typed output of the memory classifier
//! - **Search planning**: the structured plan produced by the query planner
//!
//! The types double as LLM output schemas: `schemars::JsonSchema` derives
//! feed the structured-output response format, and serde defaults keep
//! partially-filled model output parseable.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Version of the serialized `processed_data` payload. Bump when the
/// `ProcessedLongTermMemory` wire shape changes.
pub const PROCESSED_DATA_SCHEMA_VERSION: u32 = 1;

// ===================================================
// CLASSIFICATION ENUMS
// ===================================================

/// Long-term memory classification assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryClassification {
    /// Core facts, preferences, skills
    Essential,
    /// Project context, ongoing work
    Contextual,
    /// Regular chat, questions, discussions
    Conversational,
    /// Code examples, technical references
    Reference,
    /// User details, relationships, life events
    Personal,
    /// Direct promotion to the short-term working set
    ConsciousInfo,
}

impl MemoryClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Essential => "essential",
            Self::Contextual => "contextual",
            Self::Conversational => "conversational",
            Self::Reference => "reference",
            Self::Personal => "personal",
            Self::ConsciousInfo => "conscious-info",
        }
    }
}

impl Default for MemoryClassification {
    fn default() -> Self {
        Self::Conversational
    }
}

/// Importance level of a classified memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemoryImportance {
    Critical,
    High,
    Medium,
    Low,
}

impl MemoryImportance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Numeric score used for ranking and storage.
    pub fn score(&self) -> f64 {
        match self {
            Self::Critical => 0.9,
            Self::High => 0.7,
            Self::Medium => 0.5,
            Self::Low => 0.3,
        }
    }
}

impl Default for MemoryImportance {
    fn default() -> Self {
        Self::Medium
    }
}

/// Primary memory category used by search planning filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Skill,
    Context,
    Rule,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Skill => "skill",
            Self::Context => "context",
            Self::Rule => "rule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fact" => Some(Self::Fact),
            "preference" => Some(Self::Preference),
            "skill" => Some(Self::Skill),
            "context" => Some(Self::Context),
            "rule" => Some(Self::Rule),
            _ => None,
        }
    }
}

/// Retention class of a stored memory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetentionType {
    ShortTerm,
    LongTerm,
    Permanent,
}

impl RetentionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Permanent => "permanent",
        }
    }
}

/// Storage tier a row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
        }
    }
}

// ===================================================
// CLASSIFIER OUTPUT
// ===================================================

fn default_confidence() -> f64 {
    0.8
}

fn default_schema_version() -> u32 {
    PROCESSED_DATA_SCHEMA_VERSION
}

/// Classified long-term memory produced from one (user_input, ai_output)
/// exchange. This is both the classifier's structured-output schema and the
/// serialized `processed_data` payload stored with each long-term row.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProcessedLongTermMemory {
    /// The actual memory content
    pub content: String,
    /// Concise summary for search
    pub summary: String,
    /// Type classification
    #[serde(default)]
    pub classification: MemoryClassification,
    /// Importance level
    #[serde(default)]
    pub importance: MemoryImportance,

    /// Main topic/subject
    #[serde(default)]
    pub topic: Option<String>,
    /// People, places, technologies mentioned
    #[serde(default)]
    pub entities: Vec<String>,
    /// Key terms for search
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Contains user personal info
    #[serde(default)]
    pub is_user_context: bool,
    /// User preference/opinion
    #[serde(default)]
    pub is_preference: bool,
    /// User's abilities/expertise
    #[serde(default)]
    pub is_skill_knowledge: bool,
    /// Current work context
    #[serde(default)]
    pub is_current_project: bool,

    /// Links to the original if this is a duplicate
    #[serde(default)]
    pub duplicate_of: Option<String>,
    /// Previous memories this replaces
    #[serde(default)]
    pub supersedes: Vec<String>,
    /// Connected memory IDs
    #[serde(default)]
    pub related_memories: Vec<String>,

    /// Source session/conversation
    #[serde(default)]
    pub session_id: String,
    /// Model confidence in the extraction
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
    /// Why this classification was chosen
    #[serde(default)]
    pub classification_reason: String,
    /// Should be promoted to the short-term working set
    #[serde(default)]
    pub promotion_eligible: bool,

    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl ProcessedLongTermMemory {
    /// Numeric importance score derived from the importance level.
    pub fn importance_score(&self) -> f64 {
        self.importance.score()
    }
}

// ===================================================
// SEARCH PLANNING
// ===================================================

/// Structured search plan produced by the query planner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchPlan {
    /// Original query text
    pub query_text: String,
    /// Interpreted intent of the query
    #[serde(default)]
    pub intent: String,
    /// Specific entities to search for
    #[serde(default)]
    pub entity_filters: Vec<String>,
    /// Memory categories to include
    #[serde(default)]
    pub category_filters: Vec<MemoryCategory>,
    /// Time range for the search (e.g. "last_week")
    #[serde(default)]
    pub time_range: Option<String>,
    /// Minimum importance score (0.0-1.0)
    #[serde(default)]
    pub min_importance: f64,
    /// Recommended search strategies
    #[serde(default)]
    pub search_strategy: Vec<String>,
    /// Expected types of results
    #[serde(default)]
    pub expected_result_types: Vec<String>,
}
