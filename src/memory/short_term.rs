//! Short-term memory: the cached conversation snapshot of each customer

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{keys, CacheStore, Generations, Namespace};
use crate::context::ConversationContext;
use crate::error::Result;
use crate::CustomerId;

/// Adapter over the `session` cache namespace. Never the only copy of a
/// turn: a miss is answered by rebuilding from session memory.
///
/// Every invalidation moves the customer to a new epoch. A snapshot built
/// from data read before an invalidation can be stored with
/// [`put_recent_if_current`](Self::put_recent_if_current), which refuses it.
#[derive(Clone)]
pub struct ShortTermMemory {
    cache: Arc<CacheStore>,
    epochs: Arc<Generations<CustomerId>>,
    ttl: Duration,
}

impl ShortTermMemory {
    pub fn new(cache: Arc<CacheStore>, ttl: Duration) -> Self {
        Self {
            cache,
            epochs: Arc::new(Generations::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get_recent(&self, customer_id: CustomerId) -> Option<ConversationContext> {
        self.cache
            .get_json(Namespace::Session, &keys::conversation(customer_id))
    }

    /// Store a snapshot unconditionally. `ttl` is capped at the
    /// freshness window; `None` uses the window itself.
    pub fn put_recent(
        &self,
        customer_id: CustomerId,
        context: &ConversationContext,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl.map_or(self.ttl, |ttl| ttl.min(self.ttl));
        self.cache.set_json(
            Namespace::Session,
            keys::conversation(customer_id),
            context,
            Some(ttl),
        )
    }

    /// Current invalidation epoch of a customer
    pub fn epoch(&self, customer_id: CustomerId) -> u64 {
        self.epochs.current(&customer_id)
    }

    /// Store a snapshot only if the customer has not been invalidated since
    /// `epoch` was read. Returns whether the snapshot was stored.
    pub fn put_recent_if_current(
        &self,
        customer_id: CustomerId,
        context: &ConversationContext,
        epoch: u64,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        match self
            .epochs
            .if_current(&customer_id, epoch, || self.put_recent(customer_id, context, ttl))
        {
            Some(stored) => stored.map(|()| true),
            None => {
                debug!(customer_id, epoch, "Discarding snapshot built before an invalidation");
                Ok(false)
            }
        }
    }

    /// Drop the snapshot and move the customer to a new epoch
    pub fn invalidate(&self, customer_id: CustomerId) {
        self.epochs.advance(customer_id, || {
            self.cache
                .delete(Namespace::Session, &keys::conversation(customer_id))
        });
    }

    /// Forget tracked epochs. Snapshots being rebuilt right now may be
    /// refused once, nothing else changes.
    pub fn prune_epochs(&self) -> usize {
        self.epochs.prune()
    }

    /// Customers whose epoch is currently tracked
    pub fn tracked_epochs(&self) -> usize {
        self.epochs.tracked()
    }
}
