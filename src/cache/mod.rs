//! Bounded, namespace-partitioned cache with memoization on top

mod generation;
pub mod keys;
mod memoize;
mod store;

pub use generation::Generations;
pub use memoize::{with_retry, Gate, Memoizer, SingleFlight};
pub use store::{CacheEntry, CacheStore, NamespaceStats};

use serde::{Deserialize, Serialize};

/// A logical partition of the cache with its own quota and LRU pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// General purpose: catalog lookups, business config, query results
    Main,

    /// Customer analytics and memory profiles
    Analytics,

    /// AI responses keyed by prompt hash
    Ai,

    /// Short-term conversation snapshots
    Session,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Main,
        Namespace::Analytics,
        Namespace::Ai,
        Namespace::Session,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Main => "main",
            Namespace::Analytics => "analytics",
            Namespace::Ai => "ai",
            Namespace::Session => "session",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Namespace {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Namespace::Main),
            "analytics" => Ok(Namespace::Analytics),
            "ai" => Ok(Namespace::Ai),
            "session" => Ok(Namespace::Session),
            _ => Err(crate::Error::invalid_input(format!("Unknown namespace: {}", s))),
        }
    }
}
