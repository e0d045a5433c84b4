//! Conversational memory layers and the orchestrator that merges them

mod locks;
pub mod long_term;
mod orchestrator;
pub mod session;
pub mod short_term;

pub use long_term::{
    LongTermMemory, MemoryProfile, OrderItem, OrderSummary, ProfileInsights, Recommendation,
};
pub use orchestrator::MemoryOrchestrator;
pub use session::{
    InteractionOutcome, SessionMemory, SessionSnapshot, SessionState, SessionStateUpdate,
};
pub use short_term::ShortTermMemory;
