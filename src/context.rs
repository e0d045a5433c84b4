//! Conversation context handed to the business logic for each inbound turn

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::memory::long_term::OrderSummary;
use crate::memory::session::InteractionOutcome;
use crate::turn::{ConversationTurn, Role};
use crate::CustomerId;

/// Topics picked out of turns that no longer fit in the context window
const SUMMARY_TOPICS: &[&str] = &[
    "order", "payment", "delivery", "price", "menu", "food", "drink",
];

/// The live view of a customer's conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub customer_id: CustomerId,

    /// Active session, `None` when the customer has no active session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,

    /// Most recent turns of the active session, most recent last
    pub turns: Vec<ConversationTurn>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<String>,

    #[serde(default)]
    pub pending_confirmation: bool,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub cart: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub preferences: Map<String, Value>,

    /// Latest completed orders, newest first. Present with or without an
    /// active session.
    #[serde(default)]
    pub recent_orders: Vec<OrderSummary>,

    /// Latest interaction outcomes of the customer, oldest first
    #[serde(default)]
    pub recent_outcomes: Vec<InteractionOutcome>,

    /// Turns in the session, including those outside `turns`
    pub total_turns: usize,

    /// Short digest of the turns that fell outside `turns`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,

    pub built_at: DateTime<Utc>,
}

impl ConversationContext {
    /// Context of a customer without an active session
    pub fn empty(customer_id: CustomerId, built_at: DateTime<Utc>) -> Self {
        Self {
            customer_id,
            session_id: None,
            turns: Vec::new(),
            current_intent: None,
            pending_confirmation: false,
            cart: Map::new(),
            preferences: Map::new(),
            recent_orders: Vec::new(),
            recent_outcomes: Vec::new(),
            total_turns: 0,
            summary: None,
            last_activity: None,
            built_at,
        }
    }

    /// No turns in an active session. Orders and outcomes do not count.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Lowercased text of the customer's turns, for mention matching
    pub fn customer_text(&self) -> String {
        self.turns
            .iter()
            .filter(|turn| turn.role == Role::Customer)
            .map(|turn| turn.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format the context for injection into a prompt
    pub fn format_for_prompt(&self) -> String {
        let mut parts = Vec::new();

        if let Some(intent) = &self.current_intent {
            parts.push(format!("Current intent: {}\n", intent));
        }
        if self.pending_confirmation {
            parts.push("Awaiting customer confirmation\n".to_string());
        }
        if !self.cart.is_empty() {
            parts.push(format!("Cart: {}\n", Value::Object(self.cart.clone())));
        }
        if !self.preferences.is_empty() {
            parts.push(format!(
                "Preferences: {}\n",
                Value::Object(self.preferences.clone())
            ));
        }
        if !self.recent_orders.is_empty() {
            parts.push("\n## Recent Orders\n".to_string());
            for order in &self.recent_orders {
                let items = order
                    .items
                    .iter()
                    .map(|item| format!("{}x {}", item.quantity, item.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                parts.push(format!(
                    "- #{} on {}: {} ({:.2})\n",
                    order.order_id,
                    order.completed_at.format("%Y-%m-%d"),
                    items,
                    order.total_amount
                ));
            }
        }
        if !self.recent_outcomes.is_empty() {
            parts.push("\n## Recent Outcomes\n".to_string());
            for outcome in &self.recent_outcomes {
                parts.push(format!("- {}\n", outcome.outcome));
            }
        }
        if let Some(summary) = &self.summary {
            parts.push(format!("\n## Earlier Conversation\n{}\n", summary));
        }
        if !self.turns.is_empty() {
            parts.push("\n## Recent Conversation\n".to_string());
            for turn in &self.turns {
                parts.push(format!("{}: {}\n", turn.role, turn.text));
            }
        }

        parts.join("")
    }
}

/// Digest of turns dropped from the context window, `None` if there are none
pub fn summarize(older: &[ConversationTurn]) -> Option<String> {
    if older.is_empty() {
        return None;
    }

    let customer_turns: Vec<&ConversationTurn> = older
        .iter()
        .filter(|turn| turn.role == Role::Customer)
        .collect();
    let text = customer_turns
        .iter()
        .map(|turn| turn.text.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let mut summary = format!(
        "Previous conversation covered {} customer messages.",
        customer_turns.len()
    );

    let topics: Vec<&str> = SUMMARY_TOPICS
        .iter()
        .copied()
        .filter(|topic| text.contains(topic))
        .collect();
    if !topics.is_empty() {
        summary.push_str(&format!(" Topics discussed: {}.", topics.join(", ")));
    }

    Some(summary)
}
