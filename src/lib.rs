//! # ConvoCart Memory
//!
//! Caching and conversational memory for a WhatsApp ordering assistant.
//!
//! ## Architecture
//!
//! - **Cache store** - namespace-partitioned, byte-bounded, TTL + LRU
//! - **Memoization** - read-through caching with single-flight stampede protection
//! - **Short-term memory** - cached conversation snapshot per customer
//! - **Session memory** - durable turns scoped to a 30 minute activity window
//! - **Long-term memory** - idempotent order aggregates and recommendations
//!
//! The [`MemoryOrchestrator`] ties the layers together.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use convocart_memory::{Config, MemoryOrchestrator};
//!
//! let memory = MemoryOrchestrator::new(Config::from_env()?)?;
//!
//! // Context for the inbound message
//! let context = memory.get_conversation_context(customer_id).await?;
//!
//! // Persist the exchange once the reply is known
//! memory.add_conversation_turn(customer_id, &inbound.text, &reply).await?;
//!
//! // Suggestions for the reply
//! let picks = memory.get_contextual_recommendations(customer_id, &context).await?;
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod storage;
pub mod turn;

/// Customer identifier as issued by the ordering backend
pub type CustomerId = i64;

pub use cache::{CacheStore, Memoizer, Namespace, NamespaceStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, RetryConfig};
pub use context::ConversationContext;
pub use error::{Error, Result};
pub use memory::{
    InteractionOutcome, MemoryOrchestrator, MemoryProfile, OrderItem, OrderSummary,
    Recommendation, SessionState, SessionStateUpdate,
};
pub use storage::{ProfileStore, SessionStore, SqliteStorage, StoredTurn};
pub use turn::{ConversationTurn, InboundMessage, OutboundMessage, Role};
