//! Conversation turns and the inbound/outbound message shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CustomerId;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Role::Customer),
            "assistant" => Ok(Role::Assistant),
            _ => Err(crate::Error::invalid_input(format!("Unknown role: {}", s))),
        }
    }
}

/// A single message exchanged with a customer. Turns are never modified
/// once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique turn ID
    pub id: Uuid,

    pub customer_id: CustomerId,

    pub role: Role,

    /// Message text
    pub text: String,

    pub timestamp: DateTime<Utc>,

    /// Structured data attached to the turn (extracted intent, cart, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ConversationTurn {
    pub fn new(
        customer_id: CustomerId,
        role: Role,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            role,
            text: text.into(),
            timestamp,
            payload: None,
        }
    }

    /// A turn written by the customer
    pub fn customer(customer_id: CustomerId, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(customer_id, Role::Customer, text, timestamp)
    }

    /// A turn written by the assistant
    pub fn assistant(customer_id: CustomerId, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(customer_id, Role::Assistant, text, timestamp)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A normalized message from a webhook adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub customer_id: CustomerId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn into_turn(self) -> ConversationTurn {
        ConversationTurn::customer(self.customer_id, self.text, self.timestamp)
    }
}

/// A reply handed to the outbound send capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub customer_id: CustomerId,
    pub response_text: String,
}

impl OutboundMessage {
    pub fn into_turn(self, timestamp: DateTime<Utc>) -> ConversationTurn {
        ConversationTurn::assistant(self.customer_id, self.response_text, timestamp)
    }
}
