// crates/memori/src/agents/mod.rs
// Memory agents: the LLM-backed classifier and the conscious curator

mod classifier;
mod conscious;

pub use classifier::{
    CLASSIFICATION_RETRIES, CLASSIFICATION_TIMEOUT, ConversationContext, MemoryClassifier,
};
pub use conscious::{CONSCIOUS_CONTEXT_CATEGORY, ConsciousAgent};
