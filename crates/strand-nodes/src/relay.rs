//! One-shot caller/target overrides for relayed queries.

use std::sync::Arc;

use dashmap::DashMap;
use strand_core::{Identity, Nonce};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relay {
    pub caller: Identity,
    pub target: Identity,
}

/// Pending relays keyed by the nonce of the query they apply to.
#[derive(Clone, Default)]
pub struct RelayTable(Arc<DashMap<Nonce, Relay>>);

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, nonce: Nonce, caller: Identity, target: Identity) {
        self.0.insert(nonce, Relay { caller, target });
    }

    /// Remove and return the relay for `nonce`. A relay applies once.
    pub fn take(&self, nonce: Nonce) -> Option<Relay> {
        self.0.remove(&nonce).map(|(_, relay)| relay)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
