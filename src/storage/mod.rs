//! Durable record stores behind the session and long-term layers

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::memory::long_term::{MemoryProfile, OrderSummary};
use crate::memory::session::{InteractionOutcome, SessionState};
use crate::turn::ConversationTurn;
use crate::CustomerId;

/// A turn together with its store-assigned sequence number. Sequence
/// numbers grow with every write and order turns across sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTurn {
    pub seq: i64,
    pub turn: ConversationTurn,
}

/// System of record for sessions and their turns
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current session row of a customer, active or not
    async fn load_session(&self, customer_id: CustomerId) -> Result<Option<SessionState>>;

    /// Insert or replace the session row
    async fn save_session(&self, state: &SessionState) -> Result<()>;

    /// Upsert the session row and insert `turns` in one transaction.
    /// Either everything is written or nothing is.
    async fn append_turns(&self, state: &SessionState, turns: &[ConversationTurn]) -> Result<()>;

    /// Last `limit` turns of a session, oldest first
    async fn recent_turns(
        &self,
        customer_id: CustomerId,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>>;

    async fn count_turns(&self, customer_id: CustomerId, session_id: Uuid) -> Result<usize>;

    /// Up to `limit` turns of a customer with a sequence number above
    /// `after_seq`, oldest first
    async fn turns_after(
        &self,
        customer_id: CustomerId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredTurn>>;

    /// Drop the session row. Turns are kept. Returns whether a row existed.
    async fn end_session(&self, customer_id: CustomerId) -> Result<bool>;

    /// Customers whose session saw activity at or after `since`
    async fn active_customers(&self, since: DateTime<Utc>) -> Result<Vec<CustomerId>>;

    /// Insert an outcome and drop all but the latest `keep` outcomes of the
    /// customer, in one transaction
    async fn record_outcome(
        &self,
        customer_id: CustomerId,
        outcome: &InteractionOutcome,
        keep: usize,
    ) -> Result<()>;

    /// Latest `limit` outcomes of a customer, oldest first
    async fn recent_outcomes(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<InteractionOutcome>>;
}

/// System of record for completed orders and aggregated profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn has_order(&self, order_id: i64) -> Result<bool>;

    async fn load_profile(&self, customer_id: CustomerId) -> Result<Option<MemoryProfile>>;

    /// Record `order` and store `profile` in one transaction. If the order
    /// id is already recorded nothing is written and `false` is returned.
    async fn commit_order(&self, order: &OrderSummary, profile: &MemoryProfile) -> Result<bool>;

    async fn save_profile(&self, profile: &MemoryProfile) -> Result<()>;

    /// All recorded orders of a customer, oldest first
    async fn list_orders(&self, customer_id: CustomerId) -> Result<Vec<OrderSummary>>;

    /// Latest `limit` orders of a customer, newest first
    async fn recent_orders(&self, customer_id: CustomerId, limit: usize)
        -> Result<Vec<OrderSummary>>;
}
