//! Session memory: durable conversation turns scoped to an activity window

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::locks::KeyedLocks;
use super::short_term::ShortTermMemory;
use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use crate::storage::{SessionStore, StoredTurn};
use crate::turn::ConversationTurn;
use crate::CustomerId;

/// Older turns read to summarize what fell out of the context window
const SUMMARY_SCAN: usize = 100;

/// Interaction outcomes kept per customer
pub const MAX_OUTCOMES: usize = 50;

/// The session row of a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub customer_id: CustomerId,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<String>,
    #[serde(default)]
    pub pending_confirmation: bool,

    /// Items the customer is assembling, keyed by product
    #[serde(default)]
    pub cart: Map<String, Value>,

    /// Preferences stated during this session
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

impl SessionState {
    fn start(customer_id: CustomerId, now: DateTime<Utc>) -> Self {
        Self {
            customer_id,
            session_id: Uuid::new_v4(),
            started_at: now,
            last_activity: now,
            current_intent: None,
            pending_confirmation: false,
            cart: Map::new(),
            preferences: Map::new(),
        }
    }

    /// Active while no more than `window` has passed since the last activity
    pub fn is_active(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !clock::elapsed_beyond(self.last_activity, now, window)
    }
}

/// Changes to the session state; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStateUpdate {
    #[serde(default)]
    pub current_intent: Option<String>,

    /// Drop the current intent
    #[serde(default)]
    pub clear_intent: bool,

    #[serde(default)]
    pub pending_confirmation: Option<bool>,

    /// Merged into the cart; a `null` value removes the entry
    #[serde(default)]
    pub cart: Option<Map<String, Value>>,

    /// Empty the cart before merging `cart`
    #[serde(default)]
    pub clear_cart: bool,

    /// Merged into the preferences; a `null` value removes the entry
    #[serde(default)]
    pub preferences: Option<Map<String, Value>>,
}

impl SessionStateUpdate {
    fn apply(&self, state: &mut SessionState) {
        if self.clear_intent {
            state.current_intent = None;
        }
        if let Some(intent) = &self.current_intent {
            state.current_intent = Some(intent.clone());
        }
        if let Some(pending) = self.pending_confirmation {
            state.pending_confirmation = pending;
        }
        if self.clear_cart {
            state.cart.clear();
        }
        if let Some(cart) = &self.cart {
            merge(&mut state.cart, cart);
        }
        if let Some(preferences) = &self.preferences {
            merge(&mut state.preferences, preferences);
        }
    }
}

fn merge(target: &mut Map<String, Value>, changes: &Map<String, Value>) {
    for (key, value) in changes {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// What came of an interaction, such as an order placed or a suggestion
/// declined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionOutcome {
    pub outcome: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

impl InteractionOutcome {
    pub fn new(
        outcome: impl Into<String>,
        details: Map<String, Value>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            outcome: outcome.into(),
            details,
            recorded_at,
        }
    }
}

/// An active session with its most recent turns
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,

    /// At most the requested number of turns, most recent last
    pub turns: Vec<ConversationTurn>,

    /// Turns just before `turns`, for summarizing
    pub earlier: Vec<ConversationTurn>,

    pub total_turns: usize,
}

/// Durable per-customer conversation turns.
///
/// Writes for one customer are serialized by a per-customer lock; every
/// write invalidates the customer's short-term snapshot before the lock is
/// released.
pub struct SessionMemory {
    store: Arc<dyn SessionStore>,
    short_term: ShortTermMemory,
    locks: KeyedLocks<CustomerId>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionMemory {
    pub fn new(
        store: Arc<dyn SessionStore>,
        short_term: ShortTermMemory,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            short_term,
            locks: KeyedLocks::new(),
            window,
            clock,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    async fn active_session(
        &self,
        customer_id: CustomerId,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionState>> {
        let state = self.store.load_session(customer_id).await?;
        Ok(state.filter(|s| s.is_active(now, self.window)))
    }

    /// Append one turn
    pub async fn append_turn(
        &self,
        customer_id: CustomerId,
        turn: ConversationTurn,
    ) -> Result<SessionState> {
        self.append_turns(customer_id, vec![turn]).await
    }

    /// Append turns in order as one all-or-nothing write. A lapsed or
    /// missing session is replaced by a new one first.
    pub async fn append_turns(
        &self,
        customer_id: CustomerId,
        turns: Vec<ConversationTurn>,
    ) -> Result<SessionState> {
        if turns.is_empty() {
            return Err(Error::invalid_input("no turns to append"));
        }
        if let Some(turn) = turns.iter().find(|t| t.customer_id != customer_id) {
            return Err(Error::invalid_input(format!(
                "turn {} belongs to customer {}, not {}",
                turn.id, turn.customer_id, customer_id
            )));
        }

        let _guard = self.locks.lock(&customer_id).await;
        let now = self.clock.now();

        let mut state = match self.active_session(customer_id, now).await? {
            Some(state) => state,
            None => {
                let state = SessionState::start(customer_id, now);
                info!(customer_id, session_id = %state.session_id, "Starting new session");
                state
            }
        };
        state.last_activity = now;

        self.store.append_turns(&state, &turns).await?;
        self.short_term.invalidate(customer_id);

        debug!(customer_id, count = turns.len(), "Appended turns");
        Ok(state)
    }

    /// Up to `limit` most recent turns of the active session, most recent
    /// last. Empty when there is no active session.
    pub async fn get_turns(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let now = self.clock.now();
        match self.active_session(customer_id, now).await? {
            Some(state) => {
                self.store
                    .recent_turns(customer_id, state.session_id, limit)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// State of the active session, if any
    pub async fn get_state(&self, customer_id: CustomerId) -> Result<Option<SessionState>> {
        self.active_session(customer_id, self.clock.now()).await
    }

    /// Active session with its latest `limit` turns and the turns before
    /// them
    pub async fn snapshot(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Option<SessionSnapshot>> {
        let now = self.clock.now();
        let Some(state) = self.active_session(customer_id, now).await? else {
            return Ok(None);
        };

        let mut turns = self
            .store
            .recent_turns(customer_id, state.session_id, limit.saturating_add(SUMMARY_SCAN))
            .await?;
        let total_turns = self.store.count_turns(customer_id, state.session_id).await?;

        let split = turns.len().saturating_sub(limit);
        let recent = turns.split_off(split);

        Ok(Some(SessionSnapshot {
            state,
            turns: recent,
            earlier: turns,
            total_turns,
        }))
    }

    /// Change the current intent or pending confirmation. Counts as
    /// activity and starts a session if none is active.
    pub async fn update_state(
        &self,
        customer_id: CustomerId,
        update: &SessionStateUpdate,
    ) -> Result<SessionState> {
        let _guard = self.locks.lock(&customer_id).await;
        let now = self.clock.now();

        let mut state = self
            .active_session(customer_id, now)
            .await?
            .unwrap_or_else(|| SessionState::start(customer_id, now));
        update.apply(&mut state);
        state.last_activity = now;

        self.store.save_session(&state).await?;
        self.short_term.invalidate(customer_id);
        Ok(state)
    }

    /// End the customer's session now. History stays in the store.
    pub async fn expire_session(&self, customer_id: CustomerId) -> Result<bool> {
        let _guard = self.locks.lock(&customer_id).await;
        let ended = self.store.end_session(customer_id).await?;
        self.short_term.invalidate(customer_id);
        if ended {
            info!(customer_id, "Session expired");
        }
        Ok(ended)
    }

    /// Record what came of an interaction. Only the latest
    /// [`MAX_OUTCOMES`] are kept.
    pub async fn record_outcome(
        &self,
        customer_id: CustomerId,
        outcome: impl Into<String>,
        details: Map<String, Value>,
    ) -> Result<InteractionOutcome> {
        let outcome = outcome.into();
        if outcome.trim().is_empty() {
            return Err(Error::invalid_input("outcome must not be empty"));
        }

        let _guard = self.locks.lock(&customer_id).await;
        let outcome = InteractionOutcome::new(outcome, details, self.clock.now());

        self.store
            .record_outcome(customer_id, &outcome, MAX_OUTCOMES)
            .await?;
        self.short_term.invalidate(customer_id);

        debug!(customer_id, outcome = %outcome.outcome, "Recorded interaction outcome");
        Ok(outcome)
    }

    /// Latest `limit` outcomes, oldest first
    pub async fn recent_outcomes(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<InteractionOutcome>> {
        self.store.recent_outcomes(customer_id, limit).await
    }

    /// Customers with an active session
    pub async fn active_customers(&self) -> Result<Vec<CustomerId>> {
        let now = self.clock.now();
        let since = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.active_customers(since).await
    }

    /// Turns of any session with a sequence number above `after_seq`
    pub async fn history_after(
        &self,
        customer_id: CustomerId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredTurn>> {
        self.store.turns_after(customer_id, after_seq, limit).await
    }
}
