//! Memory orchestrator: merges short-term, session and long-term memory and
//! keeps them consistent

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use serde_json::{Map, Value};

use super::long_term::{LongTermMemory, MemoryProfile, OrderSummary, Recommendation};
use super::session::{InteractionOutcome, SessionMemory, SessionState, SessionStateUpdate};
use super::short_term::ShortTermMemory;
use crate::cache::{
    keys, with_retry, CacheStore, Gate, Generations, Memoizer, Namespace, NamespaceStats,
    SingleFlight,
};
use crate::clock::{self, Clock, SystemClock};
use crate::config::Config;
use crate::context::{self, ConversationContext};
use crate::error::{Error, Result};
use crate::storage::{ProfileStore, SessionStore, SqliteStorage};
use crate::turn::ConversationTurn;
use crate::CustomerId;

/// Turns read per round when promoting session history
const PROMOTION_BATCH: usize = 500;

/// Completed orders shown in the conversation context
const RECENT_ORDERS: usize = 3;

/// Interaction outcomes shown in the conversation context
const RECENT_OUTCOMES: usize = 5;

/// Entry point of the memory subsystem
pub struct MemoryOrchestrator {
    config: Config,
    clock: Arc<dyn Clock>,
    cache: Arc<CacheStore>,
    memoizer: Memoizer,
    short_term: ShortTermMemory,
    session: Arc<SessionMemory>,
    long_term: Arc<LongTermMemory>,
    rebuilds: SingleFlight<(CustomerId, u64), ConversationContext>,
    rebuild_count: Arc<AtomicU64>,

    /// Moves whenever a customer's long-term data changes; memoized
    /// analytics computed before the move are never stored
    analytics: Arc<Generations<CustomerId>>,
}

impl MemoryOrchestrator {
    /// Open the SQLite store under `config.data_dir` and wire all layers
    pub fn new(config: Config) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::new(&config)?);
        Self::with_stores(config, storage.clone(), storage, Arc::new(SystemClock))
    }

    pub fn with_stores(
        config: Config,
        session_store: Arc<dyn SessionStore>,
        profile_store: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::with_clock(&config.cache, Arc::clone(&clock))?);
        let memoizer = Memoizer::new(Arc::clone(&cache), config.compute_timeout);
        let short_term = ShortTermMemory::new(Arc::clone(&cache), config.short_term_ttl);
        let session = Arc::new(SessionMemory::new(
            session_store,
            short_term.clone(),
            config.session_window,
            Arc::clone(&clock),
        ));
        let long_term = Arc::new(LongTermMemory::new(
            profile_store,
            config.aggregation_timeout,
            config.max_recommendations,
            Arc::clone(&clock),
        ));

        info!(
            session_window_secs = config.session_window.as_secs(),
            max_context_turns = config.max_context_turns,
            "Memory orchestrator ready"
        );

        Ok(Self {
            config,
            clock,
            cache,
            memoizer,
            short_term,
            session,
            long_term,
            rebuilds: SingleFlight::new(),
            rebuild_count: Arc::new(AtomicU64::new(0)),
            analytics: Arc::new(Generations::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn memoizer(&self) -> &Memoizer {
        &self.memoizer
    }

    pub fn short_term(&self) -> &ShortTermMemory {
        &self.short_term
    }

    pub fn session(&self) -> &Arc<SessionMemory> {
        &self.session
    }

    pub fn long_term(&self) -> &Arc<LongTermMemory> {
        &self.long_term
    }

    /// Number of times a context was rebuilt from session memory
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count.load(Ordering::SeqCst)
    }

    /// Run a durable write in its own task so that dropping the caller
    /// cannot interrupt it halfway
    async fn detached<T, F>(work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(work)
            .await
            .map_err(|e| Error::Internal(format!("write task failed: {}", e)))?
    }

    /// The customer's live conversation context.
    ///
    /// Served from short-term memory when fresh; otherwise rebuilt from
    /// session memory and the latest orders, then cached again. Concurrent
    /// rebuilds for the same customer share one read.
    pub async fn get_conversation_context(
        &self,
        customer_id: CustomerId,
    ) -> Result<ConversationContext> {
        if let Some(context) = self.short_term.get_recent(customer_id) {
            return Ok(context);
        }

        // A write after this point moves the epoch, so later callers start
        // their own rebuild instead of joining one that may miss the write.
        let epoch = self.short_term.epoch(customer_id);

        let session = Arc::clone(&self.session);
        let long_term = Arc::clone(&self.long_term);
        let short_term = self.short_term.clone();
        let clock = Arc::clone(&self.clock);
        let rebuild_count = Arc::clone(&self.rebuild_count);
        let max_turns = self.config.max_context_turns;
        let timeout = self.config.compute_timeout;

        self.rebuilds
            .coalesce((customer_id, epoch), move || async move {
                rebuild_count.fetch_add(1, Ordering::SeqCst);

                let context = tokio::time::timeout(
                    timeout,
                    build_context(&session, &long_term, customer_id, max_turns, clock.now()),
                )
                .await
                .map_err(|_| {
                    Error::timeout(format!("rebuild context of customer {}", customer_id), timeout)
                })??;

                let ttl = snapshot_ttl(&context, session.window(), clock.now());
                match short_term.put_recent_if_current(customer_id, &context, epoch, Some(ttl)) {
                    Ok(true) => debug!(customer_id, turns = context.turns.len(), "Cached rebuilt context"),
                    Ok(false) => {}
                    Err(e) => warn!(customer_id, error = %e, "Failed to cache rebuilt context"),
                }
                Ok::<_, Error>(context)
            })
            .await
    }

    /// Record a customer message and the assistant's reply as one atomic
    /// write, then invalidate the customer's short-term snapshot
    pub async fn add_conversation_turn(
        &self,
        customer_id: CustomerId,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<SessionState> {
        let now = self.clock.now();
        let turns = vec![
            ConversationTurn::customer(customer_id, user_message, now),
            ConversationTurn::assistant(customer_id, assistant_response, now),
        ];
        self.record_turns(customer_id, turns).await
    }

    /// Record a single pre-built turn
    pub async fn record_turn(
        &self,
        customer_id: CustomerId,
        turn: ConversationTurn,
    ) -> Result<SessionState> {
        self.record_turns(customer_id, vec![turn]).await
    }

    /// Record turns in order as one atomic write
    pub async fn record_turns(
        &self,
        customer_id: CustomerId,
        turns: Vec<ConversationTurn>,
    ) -> Result<SessionState> {
        let session = Arc::clone(&self.session);
        Self::detached(async move { session.append_turns(customer_id, turns).await }).await
    }

    pub async fn update_session_state(
        &self,
        customer_id: CustomerId,
        update: SessionStateUpdate,
    ) -> Result<SessionState> {
        let session = Arc::clone(&self.session);
        Self::detached(async move { session.update_state(customer_id, &update).await }).await
    }

    /// End the customer's session. History is kept.
    pub async fn expire_session(&self, customer_id: CustomerId) -> Result<bool> {
        let session = Arc::clone(&self.session);
        Self::detached(async move { session.expire_session(customer_id).await }).await
    }

    /// Record what came of an interaction. The latest 50 per customer are
    /// kept and the newest show up in the conversation context.
    pub async fn store_interaction_outcome(
        &self,
        customer_id: CustomerId,
        outcome: &str,
        details: Map<String, Value>,
    ) -> Result<InteractionOutcome> {
        let session = Arc::clone(&self.session);
        let outcome = outcome.to_string();
        Self::detached(async move { session.record_outcome(customer_id, outcome, details).await })
            .await
    }

    /// The customer's long-term profile, memoized in the analytics namespace
    pub async fn get_customer_memory_profile(
        &self,
        customer_id: CustomerId,
    ) -> Result<MemoryProfile> {
        let long_term = Arc::clone(&self.long_term);
        let gate = Gate::open(Arc::clone(&self.analytics), customer_id);
        self.memoizer
            .memoize_gated(
                Namespace::Analytics,
                &keys::memory_profile(customer_id),
                Some(self.config.profile_ttl),
                gate,
                move || async move { long_term.get_profile(customer_id).await },
            )
            .await
    }

    /// Products to suggest given the customer's history and the live context
    pub async fn get_contextual_recommendations(
        &self,
        customer_id: CustomerId,
        context: &ConversationContext,
    ) -> Result<Vec<Recommendation>> {
        let profile = self.get_customer_memory_profile(customer_id).await?;
        Ok(self.long_term.recommend(&profile, context))
    }

    /// Fold a completed order into long-term memory. Safe to call more than
    /// once per order; returns whether this call recorded it.
    ///
    /// Cached analytics and the conversation snapshot are dropped whatever
    /// the outcome, since a failed or repeated attempt may still have
    /// committed.
    pub async fn record_order_completed(&self, order: OrderSummary) -> Result<bool> {
        let customer_id = order.customer_id;
        let long_term = Arc::clone(&self.long_term);
        let retry = self.config.retry;

        let outcome = Self::detached(async move {
            with_retry(&retry, || long_term.record_order_completed(customer_id, &order)).await
        })
        .await;

        if !matches!(outcome, Err(Error::InvalidInput(_))) {
            self.invalidate_analytics(customer_id);
            self.short_term.invalidate(customer_id);
        }
        outcome
    }

    /// Drop the customer's memoized analytics and refuse to store any that
    /// are being computed right now
    fn invalidate_analytics(&self, customer_id: CustomerId) -> usize {
        let (_, dropped) = self.analytics.advance(customer_id, || {
            self.cache
                .delete_prefix(Namespace::Analytics, &keys::customer_prefix(customer_id))
        });
        debug!(customer_id, dropped, "Invalidated customer analytics");
        dropped
    }

    /// Memoize an AI response under the SHA-256 of its prompt
    pub async fn ai_response<C, F>(&self, prompt: &str, compute: C) -> Result<String>
    where
        C: FnOnce() -> F + Send,
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let ttl = self.cache.default_ttl(Namespace::Ai);
        self.memoizer
            .memoize(Namespace::Ai, &keys::ai_response(prompt), ttl, compute)
            .await
    }

    /// Drop everything cached for a customer in every namespace. Durable
    /// data is untouched; the next read rebuilds.
    pub fn invalidate_customer(&self, customer_id: CustomerId) -> usize {
        let prefix = keys::customer_prefix(customer_id);
        let mut removed = self.invalidate_analytics(customer_id);
        for namespace in Namespace::ALL {
            if namespace != Namespace::Analytics {
                removed += self.cache.delete_prefix(namespace, &prefix);
            }
        }
        self.short_term.invalidate(customer_id);

        info!(customer_id, removed, "Invalidated customer cache");
        removed
    }

    pub fn clear_cache(&self, namespace: Option<Namespace>) -> usize {
        self.cache.clear(namespace)
    }

    pub fn cache_stats(&self, namespace: Option<Namespace>) -> Vec<NamespaceStats> {
        self.cache.stats(namespace)
    }

    /// Promote the customer's unabsorbed turns into long-term memory.
    /// Returns the number of customer turns absorbed.
    pub async fn promote_session(&self, customer_id: CustomerId) -> Result<usize> {
        let mut after = self.long_term.promoted_seq(customer_id).await?;
        let mut absorbed = 0;

        loop {
            let batch = self
                .session
                .history_after(customer_id, after, PROMOTION_BATCH)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = last.seq;
            absorbed += self
                .long_term
                .absorb_conversation(customer_id, &batch)
                .await?;
            if batch.len() < PROMOTION_BATCH {
                break;
            }
        }

        if absorbed > 0 {
            self.invalidate_analytics(customer_id);
        }
        Ok(absorbed)
    }

    /// Promote every customer with an active session. A failing customer is
    /// logged and skipped.
    pub async fn promote_active_sessions(&self) -> Result<usize> {
        let customers = self.session.active_customers().await?;
        let mut absorbed = 0;

        for customer_id in &customers {
            match self.promote_session(*customer_id).await {
                Ok(count) => absorbed += count,
                Err(e) => warn!(customer_id, error = %e, "Session promotion failed"),
            }
        }

        if absorbed > 0 {
            info!(customers = customers.len(), absorbed, "Promoted session turns");
        }
        Ok(absorbed)
    }

    /// Forget tracked invalidation generations. Returns how many were
    /// dropped.
    pub fn prune_generations(&self) -> usize {
        self.short_term.prune_epochs() + self.analytics.prune()
    }

    /// Start the expired-entry sweeper, the periodic session promotion and
    /// generation pruning. All stop once the orchestrator is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweeper = self.cache.spawn_sweeper(self.config.sweep_interval);

        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                let dropped = orchestrator.prune_generations();
                if dropped > 0 {
                    debug!(dropped, "Pruned invalidation generations");
                }
            }
        });

        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.promotion_interval;
        let promoter = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                if let Err(e) = orchestrator.promote_active_sessions().await {
                    warn!(error = %e, "Promotion pass failed");
                }
            }
        });

        vec![sweeper, promoter, pruner]
    }
}

async fn build_context(
    session: &SessionMemory,
    long_term: &LongTermMemory,
    customer_id: CustomerId,
    max_turns: usize,
    now: DateTime<Utc>,
) -> Result<ConversationContext> {
    let recent_orders = long_term.recent_orders(customer_id, RECENT_ORDERS).await?;
    let recent_outcomes = session.recent_outcomes(customer_id, RECENT_OUTCOMES).await?;

    let Some(snapshot) = session.snapshot(customer_id, max_turns).await? else {
        return Ok(ConversationContext {
            recent_orders,
            recent_outcomes,
            ..ConversationContext::empty(customer_id, now)
        });
    };

    Ok(ConversationContext {
        customer_id,
        session_id: Some(snapshot.state.session_id),
        turns: snapshot.turns,
        current_intent: snapshot.state.current_intent,
        pending_confirmation: snapshot.state.pending_confirmation,
        cart: snapshot.state.cart,
        preferences: snapshot.state.preferences,
        recent_orders,
        recent_outcomes,
        total_turns: snapshot.total_turns,
        summary: context::summarize(&snapshot.earlier),
        last_activity: Some(snapshot.state.last_activity),
        built_at: now,
    })
}

/// A snapshot must not outlive the session it was built from
fn snapshot_ttl(context: &ConversationContext, window: Duration, now: DateTime<Utc>) -> Duration {
    let Some(last_activity) = context.last_activity else {
        return window;
    };
    clock::add(last_activity, window)
        .and_then(|end| (end - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}
