//! End-to-end behavior of the memory orchestrator over an in-memory SQLite
//! store and a manual clock

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map};
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use convocart_memory::memory::long_term::RecommendationReason;
use convocart_memory::{
    CacheConfig, Config, ConversationTurn, CustomerId, Error, InteractionOutcome, ManualClock,
    MemoryOrchestrator, MemoryProfile, Namespace, OrderItem, OrderSummary, ProfileStore, Result,
    Role, SessionState, SessionStateUpdate, SessionStore, SqliteStorage, StoredTurn,
};

const MINUTE: Duration = Duration::from_secs(60);

fn test_config() -> Config {
    let mut config = Config::with_data_dir(std::env::temp_dir().join("convocart-memory-tests"));
    config.cache = CacheConfig::with_total_bytes(10_000_000);
    config
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn orchestrator() -> (Arc<MemoryOrchestrator>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start()));
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let memory =
        MemoryOrchestrator::with_stores(test_config(), storage.clone(), storage, clock.clone())
            .unwrap();
    (Arc::new(memory), clock)
}

fn order(order_id: i64, customer_id: CustomerId, items: &[(i64, &str, &str, u32)]) -> OrderSummary {
    OrderSummary {
        order_id,
        customer_id,
        total_amount: items.iter().map(|(_, _, _, qty)| *qty as f64 * 10.0).sum(),
        items: items
            .iter()
            .map(|(product_id, name, category, quantity)| OrderItem {
                product_id: *product_id,
                name: name.to_string(),
                category: category.to_string(),
                quantity: *quantity,
                unit_price: 10.0,
            })
            .collect(),
        payment_method: Some("pix".to_string()),
        completed_at: start(),
    }
}

/// Session store that can be told to fail every write
struct FlakyStore {
    inner: SqliteStorage,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::storage("disk unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn load_session(&self, customer_id: CustomerId) -> Result<Option<SessionState>> {
        self.inner.load_session(customer_id).await
    }

    async fn save_session(&self, state: &SessionState) -> Result<()> {
        self.check()?;
        self.inner.save_session(state).await
    }

    async fn append_turns(&self, state: &SessionState, turns: &[ConversationTurn]) -> Result<()> {
        self.check()?;
        self.inner.append_turns(state, turns).await
    }

    async fn recent_turns(
        &self,
        customer_id: CustomerId,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        self.inner.recent_turns(customer_id, session_id, limit).await
    }

    async fn count_turns(&self, customer_id: CustomerId, session_id: Uuid) -> Result<usize> {
        self.inner.count_turns(customer_id, session_id).await
    }

    async fn turns_after(
        &self,
        customer_id: CustomerId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredTurn>> {
        self.inner.turns_after(customer_id, after_seq, limit).await
    }

    async fn end_session(&self, customer_id: CustomerId) -> Result<bool> {
        self.check()?;
        self.inner.end_session(customer_id).await
    }

    async fn active_customers(&self, since: DateTime<Utc>) -> Result<Vec<CustomerId>> {
        self.inner.active_customers(since).await
    }

    async fn record_outcome(
        &self,
        customer_id: CustomerId,
        outcome: &InteractionOutcome,
        keep: usize,
    ) -> Result<()> {
        self.check()?;
        self.inner.record_outcome(customer_id, outcome, keep).await
    }

    async fn recent_outcomes(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<InteractionOutcome>> {
        self.inner.recent_outcomes(customer_id, limit).await
    }
}

/// Profile store with controllable latency and commit failures
struct SlowProfiles {
    inner: SqliteStorage,

    /// Park the next profile load after it has read the store
    hold_next_load: AtomicBool,
    entered: Notify,
    release: Notify,

    commit_delay: Duration,

    /// Commit, then report a timeout anyway
    fail_after_commit: AtomicBool,
}

impl SlowProfiles {
    fn new(inner: SqliteStorage, commit_delay: Duration) -> Self {
        Self {
            inner,
            hold_next_load: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            commit_delay,
            fail_after_commit: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProfileStore for SlowProfiles {
    async fn has_order(&self, order_id: i64) -> Result<bool> {
        self.inner.has_order(order_id).await
    }

    async fn load_profile(&self, customer_id: CustomerId) -> Result<Option<MemoryProfile>> {
        let profile = self.inner.load_profile(customer_id).await?;
        if self.hold_next_load.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(profile)
    }

    async fn commit_order(&self, order: &OrderSummary, profile: &MemoryProfile) -> Result<bool> {
        tokio::time::sleep(self.commit_delay).await;
        let committed = self.inner.commit_order(order, profile).await?;
        if self.fail_after_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::timeout("commit order", self.commit_delay));
        }
        Ok(committed)
    }

    async fn save_profile(&self, profile: &MemoryProfile) -> Result<()> {
        self.inner.save_profile(profile).await
    }

    async fn list_orders(&self, customer_id: CustomerId) -> Result<Vec<OrderSummary>> {
        self.inner.list_orders(customer_id).await
    }

    async fn recent_orders(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<OrderSummary>> {
        self.inner.recent_orders(customer_id, limit).await
    }
}

fn with_slow_profiles(
    config: Config,
    commit_delay: Duration,
) -> (Arc<MemoryOrchestrator>, Arc<SlowProfiles>) {
    let clock = Arc::new(ManualClock::new(start()));
    let storage = SqliteStorage::open_in_memory().unwrap();
    let profiles = Arc::new(SlowProfiles::new(storage.clone(), commit_delay));
    let memory =
        MemoryOrchestrator::with_stores(config, Arc::new(storage), profiles.clone(), clock)
            .unwrap();
    (Arc::new(memory), profiles)
}

#[tokio::test]
async fn test_context_reads_its_own_writes() {
    let (memory, clock) = orchestrator();

    assert!(memory.get_conversation_context(7).await.unwrap().is_empty());

    memory
        .add_conversation_turn(7, "I want a pizza", "Which size?")
        .await
        .unwrap();
    clock.advance(MINUTE);
    memory
        .add_conversation_turn(7, "Large, please", "Added a large pizza")
        .await
        .unwrap();

    let context = memory.get_conversation_context(7).await.unwrap();
    let texts: Vec<&str> = context.turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(
        texts,
        ["I want a pizza", "Which size?", "Large, please", "Added a large pizza"]
    );
    assert_eq!(context.turns[0].role, Role::Customer);
    assert_eq!(context.turns[1].role, Role::Assistant);
    assert_eq!(context.total_turns, 4);
    assert!(context.summary.is_none());
}

#[tokio::test]
async fn test_context_is_cached_until_the_next_write() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(1, "hi", "hello").await.unwrap();

    memory.get_conversation_context(1).await.unwrap();
    memory.get_conversation_context(1).await.unwrap();
    assert_eq!(memory.rebuild_count(), 1);

    memory.add_conversation_turn(1, "menu?", "here it is").await.unwrap();
    let context = memory.get_conversation_context(1).await.unwrap();
    assert_eq!(context.turns.len(), 4);
    assert_eq!(memory.rebuild_count(), 2);
}

#[tokio::test]
async fn test_session_window_separates_conversations() {
    let (memory, clock) = orchestrator();

    let first = assert_ok!(memory.add_conversation_turn(3, "first", "ok").await);
    clock.advance(29 * MINUTE);
    let same = memory.add_conversation_turn(3, "second", "ok").await.unwrap();
    assert_eq!(first.session_id, same.session_id);

    // 30 minutes after the last turn is still inside the window
    clock.advance(30 * MINUTE);
    assert_eq!(memory.get_conversation_context(3).await.unwrap().turns.len(), 4);

    clock.advance(MINUTE);
    assert!(memory.short_term().get_recent(3).is_none());
    let rebuilds = memory.rebuild_count();
    assert!(memory.get_conversation_context(3).await.unwrap().is_empty());
    assert_eq!(memory.rebuild_count(), rebuilds + 1);

    let fresh = memory.add_conversation_turn(3, "third", "ok").await.unwrap();
    assert_ne!(fresh.session_id, first.session_id);

    let context = memory.get_conversation_context(3).await.unwrap();
    let texts: Vec<&str> = context.turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, ["third", "ok"]);
    assert_eq!(context.session_id, Some(fresh.session_id));
}

#[tokio::test]
async fn test_long_conversation_is_summarized() {
    let (memory, _clock) = orchestrator();
    for i in 0..15 {
        memory
            .add_conversation_turn(4, &format!("what about delivery {}", i), "sure")
            .await
            .unwrap();
    }

    let context = memory.get_conversation_context(4).await.unwrap();
    assert_eq!(context.turns.len(), memory.config().max_context_turns);
    assert_eq!(context.total_turns, 30);
    assert_eq!(context.turns.last().unwrap().text, "sure");

    let summary = context.summary.unwrap();
    assert!(summary.starts_with("Previous conversation covered 5 customer messages."));
    assert!(summary.contains("delivery"));
}

#[tokio::test]
async fn test_invalidate_customer_forces_a_rebuild() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(5, "hi", "hello").await.unwrap();
    memory.add_conversation_turn(6, "hi", "hello").await.unwrap();
    memory.get_conversation_context(5).await.unwrap();
    memory.get_conversation_context(6).await.unwrap();
    assert_eq!(memory.rebuild_count(), 2);

    assert!(memory.invalidate_customer(5) >= 1);

    let context = memory.get_conversation_context(5).await.unwrap();
    assert_eq!(context.turns.len(), 2);
    assert_eq!(memory.rebuild_count(), 3);

    // Other customers keep their snapshot
    memory.get_conversation_context(6).await.unwrap();
    assert_eq!(memory.rebuild_count(), 3);
}

#[tokio::test]
async fn test_concurrent_context_reads_share_one_rebuild() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(9, "hi", "hello").await.unwrap();

    let reads = (0..16).map(|_| memory.get_conversation_context(9));
    let contexts = futures::future::join_all(reads).await;

    for context in contexts {
        assert_eq!(context.unwrap().turns.len(), 2);
    }
    assert_eq!(memory.rebuild_count(), 1);
}

#[tokio::test]
async fn test_failed_write_persists_nothing() {
    let clock = Arc::new(ManualClock::new(start()));
    let storage = SqliteStorage::open_in_memory().unwrap();
    let store = Arc::new(FlakyStore {
        inner: storage.clone(),
        fail_writes: AtomicBool::new(false),
    });
    let memory = MemoryOrchestrator::with_stores(
        test_config(),
        store.clone(),
        Arc::new(storage.clone()),
        clock.clone(),
    )
    .unwrap();

    memory.add_conversation_turn(2, "hi", "hello").await.unwrap();
    let before = memory.get_conversation_context(2).await.unwrap();

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = assert_err!(memory.add_conversation_turn(2, "lost", "lost too").await);
    assert!(err.is_persistence());

    store.fail_writes.store(false, Ordering::SeqCst);
    let after = memory.get_conversation_context(2).await.unwrap();
    assert_eq!(after.turns, before.turns);
    assert_eq!(storage.turns_after(2, 0, 100).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_session_state_flows_into_context() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(8, "one burger", "Confirm?").await.unwrap();

    memory
        .update_session_state(
            8,
            SessionStateUpdate {
                current_intent: Some("place_order".to_string()),
                pending_confirmation: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let context = memory.get_conversation_context(8).await.unwrap();
    assert_eq!(context.current_intent.as_deref(), Some("place_order"));
    assert!(context.pending_confirmation);
    assert!(context.format_for_prompt().contains("Current intent: place_order"));

    assert!(memory.expire_session(8).await.unwrap());
    assert!(!memory.expire_session(8).await.unwrap());
    let context = memory.get_conversation_context(8).await.unwrap();
    assert!(context.is_empty());
    assert!(context.current_intent.is_none());
}

#[tokio::test]
async fn test_order_recording_is_idempotent_and_refreshes_profile() {
    let (memory, _clock) = orchestrator();
    let first = order(100, 11, &[(1, "Margherita", "pizza", 2)]);

    assert!(memory.record_order_completed(first.clone()).await.unwrap());
    let profile = memory.get_customer_memory_profile(11).await.unwrap();
    assert_eq!(profile.order_count, 1);

    // Replays change nothing
    assert!(!memory.record_order_completed(first).await.unwrap());
    let profile = memory.get_customer_memory_profile(11).await.unwrap();
    assert_eq!(profile.order_count, 1);
    assert_eq!(profile.total_spent, 20.0);

    // A new order is visible right away despite the memoized profile
    assert!(memory
        .record_order_completed(order(101, 11, &[(2, "Cola", "drink", 1)]))
        .await
        .unwrap());
    let profile = memory.get_customer_memory_profile(11).await.unwrap();
    assert_eq!(profile.order_count, 2);
    assert_eq!(profile.categories.len(), 2);
}

#[tokio::test]
async fn test_recommendations_follow_the_conversation() {
    let (memory, _clock) = orchestrator();
    memory
        .record_order_completed(order(
            300,
            21,
            &[(1, "Margherita", "pizza", 3), (2, "Espresso", "coffee", 1)],
        ))
        .await
        .unwrap();

    let context = memory.get_conversation_context(21).await.unwrap();
    let plain = memory
        .get_contextual_recommendations(21, &context)
        .await
        .unwrap();
    assert_eq!(plain[0].name, "Margherita");

    memory
        .add_conversation_turn(21, "do you have espresso today?", "Yes")
        .await
        .unwrap();
    let context = memory.get_conversation_context(21).await.unwrap();
    let recommendations = memory
        .get_contextual_recommendations(21, &context)
        .await
        .unwrap();
    assert_eq!(recommendations[0].name, "Espresso");
    assert_eq!(
        recommendations[0].reason,
        RecommendationReason::MentionedInConversation
    );
}

#[tokio::test]
async fn test_promotion_absorbs_each_turn_once() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(31, "hello there", "hi").await.unwrap();
    memory.add_conversation_turn(31, "pizza", "ok").await.unwrap();

    assert_eq!(memory.promote_session(31).await.unwrap(), 2);
    assert_eq!(memory.promote_session(31).await.unwrap(), 0);

    memory.add_conversation_turn(31, "and a cola", "ok").await.unwrap();
    assert_eq!(memory.promote_active_sessions().await.unwrap(), 1);

    let profile = memory.get_customer_memory_profile(31).await.unwrap();
    assert_eq!(profile.communication.message_count, 3);
    assert_eq!(
        profile.communication.total_chars,
        ("hello there".len() + "pizza".len() + "and a cola".len()) as u64
    );
}

#[tokio::test]
async fn test_ai_responses_are_memoized_by_prompt() {
    let (memory, _clock) = orchestrator();

    let first = memory
        .ai_response("suggest a dessert", || async { Ok("Tiramisu".to_string()) })
        .await
        .unwrap();
    let second = memory
        .ai_response("suggest a dessert", || async {
            Err(Error::storage("should not be called"))
        })
        .await
        .unwrap();
    assert_eq!(first, "Tiramisu");
    assert_eq!(second, "Tiramisu");

    let stats = memory.cache_stats(Some(Namespace::Ai));
    assert_eq!(stats[0].count, 1);
    assert_eq!(stats[0].hits, 1);
}

#[tokio::test]
async fn test_clear_cache_keeps_durable_memory() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(41, "hi", "hello").await.unwrap();
    memory.get_conversation_context(41).await.unwrap();

    assert!(memory.clear_cache(None) >= 1);
    let stats = memory.cache_stats(None);
    assert!(stats.iter().all(|s| s.count == 0 && s.bytes == 0));

    let context = memory.get_conversation_context(41).await.unwrap();
    assert_eq!(context.turns.len(), 2);
}

#[tokio::test]
async fn test_profile_read_during_order_is_not_cached() {
    let (memory, profiles) = with_slow_profiles(test_config(), Duration::ZERO);

    profiles.hold_next_load.store(true, Ordering::SeqCst);
    let reader = {
        let memory = Arc::clone(&memory);
        tokio::spawn(async move { memory.get_customer_memory_profile(51).await })
    };
    profiles.entered.notified().await;

    // lands while the read above still holds the profile without it
    assert!(memory
        .record_order_completed(order(500, 51, &[(1, "Margherita", "pizza", 1)]))
        .await
        .unwrap());
    profiles.release.notify_one();

    let early = reader.await.unwrap().unwrap();
    assert_eq!(early.order_count, 0);

    let profile = memory.get_customer_memory_profile(51).await.unwrap();
    assert_eq!(profile.order_count, 1);
}

#[tokio::test]
async fn test_slow_commit_still_records_the_order() {
    let mut config = test_config();
    config.aggregation_timeout = Duration::from_millis(50);
    let (memory, _profiles) = with_slow_profiles(config, Duration::from_millis(200));

    let recorded = memory
        .record_order_completed(order(510, 52, &[(1, "Margherita", "pizza", 2)]))
        .await;
    assert!(assert_ok!(recorded));

    let profile = memory.get_customer_memory_profile(52).await.unwrap();
    assert_eq!(profile.order_count, 1);
}

#[tokio::test]
async fn test_order_committed_before_a_failure_refreshes_profile() {
    let (memory, profiles) = with_slow_profiles(test_config(), Duration::ZERO);
    assert_eq!(memory.get_customer_memory_profile(53).await.unwrap().order_count, 0);

    // the first attempt commits but reports a timeout, the retry finds the
    // order already recorded
    profiles.fail_after_commit.store(true, Ordering::SeqCst);
    let recorded = memory
        .record_order_completed(order(520, 53, &[(2, "Cola", "drink", 1)]))
        .await
        .unwrap();
    assert!(!recorded);

    let profile = memory.get_customer_memory_profile(53).await.unwrap();
    assert_eq!(profile.order_count, 1);
}

#[tokio::test]
async fn test_context_shows_a_just_recorded_order() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(61, "same as usual", "Sure").await.unwrap();
    assert!(memory.get_conversation_context(61).await.unwrap().recent_orders.is_empty());

    for id in [600, 601, 602, 603] {
        memory
            .record_order_completed(order(id, 61, &[(1, "Margherita", "pizza", 1)]))
            .await
            .unwrap();
    }

    let context = memory.get_conversation_context(61).await.unwrap();
    let ids: Vec<i64> = context.recent_orders.iter().map(|o| o.order_id).collect();
    assert_eq!(ids, [603, 602, 601]);
    assert_eq!(context.turns.len(), 2);
    assert!(context.format_for_prompt().contains("## Recent Orders\n- #603"));

    // a customer without an active session still sees their orders
    memory
        .record_order_completed(order(610, 62, &[(2, "Cola", "drink", 1)]))
        .await
        .unwrap();
    let context = memory.get_conversation_context(62).await.unwrap();
    assert!(context.is_empty());
    assert_eq!(context.recent_orders.len(), 1);
}

#[tokio::test]
async fn test_outcomes_and_cart_reach_the_context() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(71, "two pizzas", "Anything else?").await.unwrap();
    memory.get_conversation_context(71).await.unwrap();

    for i in 0..55 {
        let mut details = Map::new();
        details.insert("round".to_string(), json!(i));
        memory
            .store_interaction_outcome(71, &format!("suggestion_{}", i), details)
            .await
            .unwrap();
    }
    let update: SessionStateUpdate = serde_json::from_value(json!({
        "cart": { "margherita": 2 },
        "preferences": { "crust": "thin" }
    }))
    .unwrap();
    memory.update_session_state(71, update).await.unwrap();

    let context = memory.get_conversation_context(71).await.unwrap();
    let names: Vec<&str> = context
        .recent_outcomes
        .iter()
        .map(|o| o.outcome.as_str())
        .collect();
    assert_eq!(
        names,
        ["suggestion_50", "suggestion_51", "suggestion_52", "suggestion_53", "suggestion_54"]
    );
    assert_eq!(context.recent_outcomes[4].details["round"], json!(54));
    assert_eq!(context.cart["margherita"], json!(2));
    assert_eq!(context.preferences["crust"], json!("thin"));

    let kept = memory.session().recent_outcomes(71, 100).await.unwrap();
    assert_eq!(kept.len(), 50);
    assert_eq!(kept[0].outcome, "suggestion_5");

    let err = assert_err!(memory.store_interaction_outcome(71, "", Map::new()).await);
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_maintenance_prunes_generations() {
    let (memory, _clock) = orchestrator();
    memory.add_conversation_turn(81, "hi", "hello").await.unwrap();
    memory
        .record_order_completed(order(800, 81, &[(1, "Margherita", "pizza", 1)]))
        .await
        .unwrap();
    assert!(memory.short_term().tracked_epochs() >= 1);

    assert!(memory.prune_generations() >= 2);
    assert_eq!(memory.short_term().tracked_epochs(), 0);

    // pruning changes nothing that readers can see
    let context = memory.get_conversation_context(81).await.unwrap();
    assert_eq!(context.turns.len(), 2);
    assert_eq!(context.recent_orders.len(), 1);
    assert_eq!(memory.get_customer_memory_profile(81).await.unwrap().order_count, 1);
}
