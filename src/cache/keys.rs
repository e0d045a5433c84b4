//! Cache key builders
//!
//! Every customer-scoped key starts with [`customer_prefix`], so all state
//! cached for a customer can be dropped with one prefix delete per namespace.

use sha2::{Digest, Sha256};

use crate::CustomerId;

/// `customer:{id}:`
pub fn customer_prefix(customer_id: CustomerId) -> String {
    format!("customer:{}:", customer_id)
}

/// Short-term conversation snapshot (`session` namespace)
pub fn conversation(customer_id: CustomerId) -> String {
    format!("{}conversation", customer_prefix(customer_id))
}

/// Memoized memory profile (`analytics` namespace)
pub fn memory_profile(customer_id: CustomerId) -> String {
    format!("{}profile", customer_prefix(customer_id))
}

/// Any other per-customer analytics result, e.g. `spending_30d`
pub fn customer_analytics(customer_id: CustomerId, name: &str) -> String {
    format!("{}analytics:{}", customer_prefix(customer_id), name)
}

/// AI response keyed by the SHA-256 of the prompt
pub fn ai_response(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("ai:{:x}", hasher.finalize())
}
