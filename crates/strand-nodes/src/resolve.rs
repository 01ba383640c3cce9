//! Endpoint resolution: a local store plus any number of pluggable resolvers.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;

use strand_core::{Context, Endpoint, Identity};

use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: Endpoint,
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve_endpoints(
        &self,
        ctx: &Context,
        identity: &Identity,
    ) -> Result<Vec<ResolvedEndpoint>, LinkError>;
}

#[derive(Debug, Clone)]
struct StoredEndpoint {
    endpoint: Endpoint,
    expires: Option<Instant>,
}

impl StoredEndpoint {
    fn live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

/// In-memory endpoint registry with optional expiry.
#[derive(Default)]
pub struct EndpointStore {
    entries: DashMap<Identity, Vec<StoredEndpoint>>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an endpoint. `None` keeps it until removed.
    pub fn add(&self, identity: Identity, endpoint: Endpoint, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        let mut list = self.entries.entry(identity).or_default();
        match list.iter_mut().find(|e| same_location(&e.endpoint, &endpoint)) {
            Some(existing) => {
                existing.endpoint = endpoint;
                existing.expires = expires;
            }
            None => list.push(StoredEndpoint { endpoint, expires }),
        }
    }

    pub fn remove(&self, identity: &Identity, endpoint: &Endpoint) -> bool {
        let Some(mut list) = self.entries.get_mut(identity) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| !same_location(&e.endpoint, endpoint));
        let removed = list.len() != before;
        let empty = list.is_empty();
        drop(list);
        if empty {
            self.entries.remove_if(identity, |_, list| list.is_empty());
        }
        removed
    }

    /// Live endpoints for `identity`. Expired entries are pruned.
    pub fn endpoints(&self, identity: &Identity) -> Vec<ResolvedEndpoint> {
        let now = Instant::now();
        let Some(mut list) = self.entries.get_mut(identity) else {
            return Vec::new();
        };
        list.retain(|e| e.live(now));
        list.iter()
            .map(|e| ResolvedEndpoint {
                endpoint: e.endpoint.clone(),
                ttl: e.expires.map(|at| at.saturating_duration_since(now)),
            })
            .collect()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.entries.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl EndpointResolver for EndpointStore {
    async fn resolve_endpoints(
        &self,
        _ctx: &Context,
        identity: &Identity,
    ) -> Result<Vec<ResolvedEndpoint>, LinkError> {
        Ok(self.endpoints(identity))
    }
}

fn same_location(a: &Endpoint, b: &Endpoint) -> bool {
    a.network() == b.network() && a.address() == b.address()
}

/// The store plus every registered resolver, queried together.
pub struct Resolvers {
    store: Arc<EndpointStore>,
    extra: RwLock<Vec<Arc<dyn EndpointResolver>>>,
}

impl Resolvers {
    pub fn new(store: Arc<EndpointStore>) -> Self {
        Self {
            store,
            extra: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<EndpointStore> {
        &self.store
    }

    pub fn add(&self, resolver: Arc<dyn EndpointResolver>) {
        self.extra
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(resolver);
    }

    /// Merge all sources, first occurrence of each (network, address) wins.
    /// A failing resolver is logged and skipped.
    pub async fn resolve(&self, ctx: &Context, identity: &Identity) -> Result<Vec<Endpoint>, LinkError> {
        let extra = self
            .extra
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut found: Vec<ResolvedEndpoint> = self.store.endpoints(identity);
        let results = ctx
            .run(join_all(extra.iter().map(|r| r.resolve_endpoints(ctx, identity))))
            .await?;
        for res in results {
            match res {
                Ok(list) => found.extend(list),
                Err(e) => tracing::debug!(identity = %identity.short(), error = %e, "resolver failed"),
            }
        }

        let mut seen = HashSet::new();
        Ok(found
            .into_iter()
            .filter(|r| r.ttl.map_or(true, |ttl| !ttl.is_zero()))
            .map(|r| r.endpoint)
            .filter(|e| seen.insert((e.network().to_string(), e.address().to_string())))
            .collect())
    }
}
