//! Long-term customer memory: order aggregates, derived insights and
//! recommendations

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::locks::KeyedLocks;
use crate::clock::Clock;
use crate::context::ConversationContext;
use crate::error::{Error, Result};
use crate::storage::{ProfileStore, StoredTurn};
use crate::turn::Role;
use crate::CustomerId;

/// Intents during which past purchases are pushed harder
const ORDERING_INTENTS: &[&str] = &["place_order", "reorder"];

const INTENT_BOOST: f64 = 0.3;
const MENTION_BOOST: f64 = 0.6;
const PEAK_HOUR_BOOST: f64 = 0.1;

/// A line of a completed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: i64,
    pub name: String,
    pub category: String,
    pub quantity: u32,
    pub unit_price: f64,
}

/// What the long-term layer learns from a completed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: i64,
    pub customer_id: CustomerId,
    pub total_amount: f64,
    pub items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    /// Items bought in the category
    pub count: u64,
    pub last_purchased_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStats {
    pub name: String,
    pub category: String,
    pub count: u64,
    pub last_purchased_at: DateTime<Utc>,
}

/// Counters promoted from session turns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationStats {
    /// Customer messages absorbed so far
    pub message_count: u64,
    pub total_chars: u64,

    /// Highest turn sequence number already absorbed
    pub last_promoted_seq: i64,
}

/// Aggregated behavioral history of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub customer_id: CustomerId,
    pub order_count: u64,
    pub total_spent: f64,
    pub categories: BTreeMap<String, CategoryStats>,
    pub products: BTreeMap<i64, ProductStats>,
    pub payment_methods: BTreeMap<String, u64>,

    /// Orders per hour of day (UTC)
    pub order_hours: [u64; 24],

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_order_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_order_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub communication: CommunicationStats,

    pub updated_at: DateTime<Utc>,
}

/// How often a customer orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFrequency {
    Frequent,
    Regular,
    Occasional,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStyle {
    Brief,
    Moderate,
    Detailed,
    Unknown,
}

/// Views derived from a [`MemoryProfile`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileInsights {
    pub average_order_value: f64,
    pub favorite_categories: Vec<String>,
    pub preferred_payment_methods: Vec<String>,
    pub order_frequency: OrderFrequency,
    pub peak_hours: Vec<u32>,
    pub communication_style: CommunicationStyle,
}

impl MemoryProfile {
    pub fn new(customer_id: CustomerId, now: DateTime<Utc>) -> Self {
        Self {
            customer_id,
            order_count: 0,
            total_spent: 0.0,
            categories: BTreeMap::new(),
            products: BTreeMap::new(),
            payment_methods: BTreeMap::new(),
            order_hours: [0; 24],
            first_order_at: None,
            last_order_at: None,
            communication: CommunicationStats::default(),
            updated_at: now,
        }
    }

    /// Fold a completed order into the counters
    pub fn apply(&mut self, order: &OrderSummary, now: DateTime<Utc>) {
        let at = order.completed_at;

        self.order_count += 1;
        self.total_spent += order.total_amount;

        for item in &order.items {
            let quantity = u64::from(item.quantity);

            let category = self
                .categories
                .entry(item.category.clone())
                .or_insert(CategoryStats {
                    count: 0,
                    last_purchased_at: at,
                });
            category.count += quantity;
            category.last_purchased_at = category.last_purchased_at.max(at);

            let product = self
                .products
                .entry(item.product_id)
                .or_insert_with(|| ProductStats {
                    name: item.name.clone(),
                    category: item.category.clone(),
                    count: 0,
                    last_purchased_at: at,
                });
            product.count += quantity;
            product.last_purchased_at = product.last_purchased_at.max(at);
        }

        if let Some(method) = &order.payment_method {
            *self.payment_methods.entry(method.clone()).or_insert(0) += 1;
        }
        self.order_hours[at.hour() as usize] += 1;

        self.first_order_at = Some(self.first_order_at.map_or(at, |first| first.min(at)));
        self.last_order_at = Some(self.last_order_at.map_or(at, |last| last.max(at)));
        self.updated_at = now;
    }

    pub fn average_order_value(&self) -> f64 {
        if self.order_count == 0 {
            0.0
        } else {
            self.total_spent / self.order_count as f64
        }
    }

    /// Categories by items bought, most first
    pub fn favorite_categories(&self, limit: usize) -> Vec<String> {
        let mut ranked: Vec<(&String, u64)> = self
            .categories
            .iter()
            .map(|(name, stats)| (name, stats.count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(limit)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Two most used payment methods
    pub fn preferred_payment_methods(&self) -> Vec<String> {
        let mut ranked: Vec<(&String, u64)> = self
            .payment_methods
            .iter()
            .map(|(method, count)| (method, *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(2)
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Bucketed average number of days between orders
    pub fn order_frequency(&self) -> OrderFrequency {
        let (Some(first), Some(last)) = (self.first_order_at, self.last_order_at) else {
            return OrderFrequency::InsufficientData;
        };
        if self.order_count < 2 {
            return OrderFrequency::InsufficientData;
        }

        let span_days = (last - first).num_seconds() as f64 / 86_400.0;
        let average = span_days / (self.order_count - 1) as f64;
        if average <= 7.0 {
            OrderFrequency::Frequent
        } else if average <= 30.0 {
            OrderFrequency::Regular
        } else {
            OrderFrequency::Occasional
        }
    }

    /// Up to three hours of day with the most orders
    pub fn peak_hours(&self) -> Vec<u32> {
        let mut hours: Vec<(u32, u64)> = self
            .order_hours
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(hour, count)| (hour as u32, *count))
            .collect();
        hours.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hours.into_iter().take(3).map(|(hour, _)| hour).collect()
    }

    pub fn communication_style(&self) -> CommunicationStyle {
        let stats = &self.communication;
        if stats.message_count == 0 {
            return CommunicationStyle::Unknown;
        }

        let average = stats.total_chars as f64 / stats.message_count as f64;
        if average < 20.0 {
            CommunicationStyle::Brief
        } else if average > 100.0 {
            CommunicationStyle::Detailed
        } else {
            CommunicationStyle::Moderate
        }
    }

    pub fn insights(&self) -> ProfileInsights {
        ProfileInsights {
            average_order_value: self.average_order_value(),
            favorite_categories: self.favorite_categories(3),
            preferred_payment_methods: self.preferred_payment_methods(),
            order_frequency: self.order_frequency(),
            peak_hours: self.peak_hours(),
            communication_style: self.communication_style(),
        }
    }
}

/// Why a product was recommended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationReason {
    MentionedInConversation,
    RepeatOrder,
    PeakTime,
    PurchaseHistory,
}

/// A product suggested to the customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub product_id: i64,
    pub name: String,
    pub category: String,
    pub score: f64,
    pub reason: RecommendationReason,
    pub last_purchased_at: DateTime<Utc>,
}

/// Rank the customer's past purchases against the live conversation.
///
/// Ties are broken by the most recent purchase, then by product id.
pub fn rank(
    profile: &MemoryProfile,
    context: &ConversationContext,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<Recommendation> {
    let total_items: u64 = profile.categories.values().map(|c| c.count).sum();
    if total_items == 0 || limit == 0 {
        return Vec::new();
    }

    let ordering_intent = context
        .current_intent
        .as_deref()
        .is_some_and(|intent| ORDERING_INTENTS.contains(&intent));
    let mentions = context.customer_text();
    let peak_hour = profile.peak_hours().contains(&now.hour());

    let mut ranked: Vec<Recommendation> = profile
        .products
        .iter()
        .map(|(product_id, product)| {
            let category_count = profile
                .categories
                .get(&product.category)
                .map_or(0, |c| c.count);
            let mut score = category_count as f64 / total_items as f64;
            let mut reason = RecommendationReason::PurchaseHistory;

            if peak_hour {
                score += PEAK_HOUR_BOOST;
                reason = RecommendationReason::PeakTime;
            }
            if ordering_intent {
                score += INTENT_BOOST;
                reason = RecommendationReason::RepeatOrder;
            }
            let mentioned = !mentions.is_empty()
                && (mentions.contains(&product.name.to_lowercase())
                    || mentions.contains(&product.category.to_lowercase()));
            if mentioned {
                score += MENTION_BOOST;
                reason = RecommendationReason::MentionedInConversation;
            }

            Recommendation {
                product_id: *product_id,
                name: product.name.clone(),
                category: product.category.clone(),
                score,
                reason,
                last_purchased_at: product.last_purchased_at,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_purchased_at.cmp(&a.last_purchased_at))
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
    ranked.truncate(limit);
    ranked
}

/// Durable, idempotent aggregation of customer history
pub struct LongTermMemory {
    store: Arc<dyn ProfileStore>,
    locks: KeyedLocks<CustomerId>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    max_recommendations: usize,
}

impl LongTermMemory {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        timeout: Duration,
        max_recommendations: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            timeout,
            clock,
            max_recommendations,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| Error::timeout(operation, self.timeout))?
    }

    /// Aggregate a completed order. Returns `false` if the order was already
    /// recorded, in which case nothing changes.
    pub async fn record_order_completed(
        &self,
        customer_id: CustomerId,
        order: &OrderSummary,
    ) -> Result<bool> {
        if order.customer_id != customer_id {
            return Err(Error::invalid_input(format!(
                "order {} belongs to customer {}, not {}",
                order.order_id, order.customer_id, customer_id
            )));
        }

        let _guard = self.locks.lock(&customer_id).await;
        let profile = self
            .bounded("aggregate order", async {
                if self.store.has_order(order.order_id).await? {
                    debug!(customer_id, order_id = order.order_id, "Order already aggregated");
                    return Ok(None);
                }

                let now = self.clock.now();
                let mut profile = self
                    .store
                    .load_profile(customer_id)
                    .await?
                    .unwrap_or_else(|| MemoryProfile::new(customer_id, now));
                profile.apply(order, now);
                Ok::<_, Error>(Some(profile))
            })
            .await?;
        let Some(profile) = profile else {
            return Ok(false);
        };

        // Not under the timeout: a commit abandoned after it landed would be
        // reported as a failure.
        let committed = self.store.commit_order(order, &profile).await?;
        if committed {
            info!(customer_id, order_id = order.order_id, "Aggregated completed order");
        }
        Ok(committed)
    }

    /// Latest `limit` completed orders, newest first
    pub async fn recent_orders(
        &self,
        customer_id: CustomerId,
        limit: usize,
    ) -> Result<Vec<OrderSummary>> {
        self.bounded("load recent orders", self.store.recent_orders(customer_id, limit))
            .await
    }

    /// Stored profile, or an empty one for a customer without history
    pub async fn get_profile(&self, customer_id: CustomerId) -> Result<MemoryProfile> {
        let stored = self
            .bounded("load profile", self.store.load_profile(customer_id))
            .await?;
        Ok(stored.unwrap_or_else(|| MemoryProfile::new(customer_id, self.clock.now())))
    }

    /// Recommendations from the stored profile for the given context
    pub async fn get_recommendations(
        &self,
        customer_id: CustomerId,
        context: &ConversationContext,
    ) -> Result<Vec<Recommendation>> {
        let profile = self.get_profile(customer_id).await?;
        Ok(self.recommend(&profile, context))
    }

    /// Rank against an already loaded profile
    pub fn recommend(
        &self,
        profile: &MemoryProfile,
        context: &ConversationContext,
    ) -> Vec<Recommendation> {
        rank(profile, context, self.clock.now(), self.max_recommendations)
    }

    /// Rebuild the order aggregates from the stored order summaries.
    /// Communication counters are carried over.
    pub async fn recompute_profile(&self, customer_id: CustomerId) -> Result<MemoryProfile> {
        let _guard = self.locks.lock(&customer_id).await;
        self.bounded("recompute profile", async {
            let now = self.clock.now();
            let mut orders = self.store.list_orders(customer_id).await?;
            orders.sort_by(|a, b| {
                a.completed_at
                    .cmp(&b.completed_at)
                    .then_with(|| a.order_id.cmp(&b.order_id))
            });

            let communication = self
                .store
                .load_profile(customer_id)
                .await?
                .map(|p| p.communication)
                .unwrap_or_default();

            let mut profile = MemoryProfile::new(customer_id, now);
            profile.communication = communication;
            for order in &orders {
                profile.apply(order, now);
            }

            self.store.save_profile(&profile).await?;
            info!(customer_id, orders = orders.len(), "Recomputed memory profile");
            Ok::<_, Error>(profile)
        })
        .await
    }

    /// Fold session turns into the communication counters. Turns at or
    /// below the profile's high-water mark are skipped, so replaying the
    /// same turns is harmless. Returns the number of customer turns absorbed.
    pub async fn absorb_conversation(
        &self,
        customer_id: CustomerId,
        turns: &[StoredTurn],
    ) -> Result<usize> {
        let _guard = self.locks.lock(&customer_id).await;
        self.bounded("absorb conversation", async {
            let now = self.clock.now();
            let mut profile = self
                .store
                .load_profile(customer_id)
                .await?
                .unwrap_or_else(|| MemoryProfile::new(customer_id, now));

            let high_water = profile.communication.last_promoted_seq;
            let fresh: Vec<&StoredTurn> = turns
                .iter()
                .filter(|stored| stored.seq > high_water && stored.turn.customer_id == customer_id)
                .collect();
            let Some(max_seq) = fresh.iter().map(|stored| stored.seq).max() else {
                return Ok(0);
            };

            let mut absorbed = 0;
            for stored in &fresh {
                if stored.turn.role == Role::Customer {
                    profile.communication.message_count += 1;
                    profile.communication.total_chars += stored.turn.text.chars().count() as u64;
                    absorbed += 1;
                }
            }
            profile.communication.last_promoted_seq = max_seq;
            profile.updated_at = now;

            self.store.save_profile(&profile).await?;
            debug!(customer_id, absorbed, high_water = max_seq, "Absorbed conversation turns");
            Ok::<_, Error>(absorbed)
        })
        .await
    }

    /// High-water mark of absorbed turns for a customer
    pub async fn promoted_seq(&self, customer_id: CustomerId) -> Result<i64> {
        let stored = self
            .bounded("load profile", self.store.load_profile(customer_id))
            .await?;
        Ok(stored.map_or(0, |p| p.communication.last_promoted_seq))
    }
}
