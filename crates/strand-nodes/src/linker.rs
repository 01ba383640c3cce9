//! Per-target strategy set.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;

use strand_core::{Context, Identity};

use crate::error::LinkError;
use crate::link::LinkEnv;
use crate::link_pool::RetrieveLinkOptions;
use crate::strategy::{LinkStrategy, StrategyFactory};

/// Strategy factories keyed by network name.
pub type StrategyRegistry = Arc<DashMap<String, Arc<dyn StrategyFactory>>>;

/// Owns one strategy per network for a single target and fans link
/// requests out to them.
pub struct NodeLinker {
    target: Identity,
    env: Arc<LinkEnv>,
    registry: StrategyRegistry,
    strategies: DashMap<String, Arc<dyn LinkStrategy>>,
}

impl NodeLinker {
    pub fn new(target: Identity, env: Arc<LinkEnv>, registry: StrategyRegistry) -> Self {
        Self {
            target,
            env,
            registry,
            strategies: DashMap::new(),
        }
    }

    pub fn target(&self) -> Identity {
        self.target
    }

    fn strategy(&self, network: &str, factory: &Arc<dyn StrategyFactory>) -> Arc<dyn LinkStrategy> {
        self.strategies
            .entry(network.to_string())
            .or_insert_with(|| factory.build(self.target))
            .clone()
    }

    /// Signal every strategy the options allow and that has something to
    /// dial, then wait for all of them to finish. Returns how many ran;
    /// `NoEndpoints` when nothing ran because nothing is known about the target.
    pub async fn activate(&self, ctx: &Context, opts: &RetrieveLinkOptions) -> Result<usize, LinkError> {
        let resolved = self.env.resolvers.resolve(ctx, &self.target).await?;
        let networks: HashSet<&str> = resolved
            .iter()
            .map(|e| e.network())
            .filter(|net| opts.allows_network(net))
            .collect();

        let factories: Vec<(String, Arc<dyn StrategyFactory>)> = self
            .registry
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut pending = Vec::new();
        for (network, factory) in factories {
            if !opts.allows_network(&network) {
                continue;
            }
            let strategy = self.strategy(&network, &factory);
            if opts.strategy.as_deref().is_some_and(|name| name != strategy.name()) {
                continue;
            }
            if strategy.requires_endpoints() && !networks.contains(network.as_str()) {
                continue;
            }
            tracing::debug!(target = %self.target.short(), network = %network, strategy = strategy.name(), "signal");
            strategy.clone().signal(ctx);
            pending.push(strategy.done());
        }

        let count = pending.len();
        if count == 0 {
            tracing::debug!(target = %self.target.short(), endpoints = resolved.len(), "no strategy applies");
            if networks.is_empty() {
                return Err(LinkError::NoEndpoints(self.target));
            }
        }
        join_all(pending).await;
        Ok(count)
    }
}
