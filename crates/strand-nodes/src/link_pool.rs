//! Link retrieval: hand out an existing stream to a target or get the
//! target's strategies to produce one.

use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;

use strand_core::{Context, Endpoint, Identity};

use crate::error::LinkError;
use crate::link::LinkEnv;
use crate::linker::{NodeLinker, StrategyRegistry};
use crate::strategy::{connect_any, StrategyFactory};
use crate::stream::Stream;

/// Constraints for [`LinkPool::retrieve_link`].
#[derive(Debug, Clone, Default)]
pub struct RetrieveLinkOptions {
    pub include_networks: Vec<String>,
    pub exclude_networks: Vec<String>,
    /// Dial exactly these instead of resolving.
    pub endpoints: Vec<Endpoint>,
    /// Never reuse an existing stream.
    pub force_new: bool,
    /// Only accept streams produced by this strategy kind.
    pub strategy: Option<String>,
}

impl RetrieveLinkOptions {
    pub fn include_network(mut self, network: impl Into<String>) -> Self {
        self.include_networks.push(network.into());
        self
    }

    pub fn exclude_network(mut self, network: impl Into<String>) -> Self {
        self.exclude_networks.push(network.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn allows_network(&self, network: &str) -> bool {
        if self.exclude_networks.iter().any(|n| n == network) {
            return false;
        }
        self.include_networks.is_empty() || self.include_networks.iter().any(|n| n == network)
    }

    /// Whether an existing stream satisfies these options. Streams carry no
    /// record of the strategy that made them, so a strategy constraint
    /// always asks for a fresh one.
    fn reusable(&self, stream: &Stream) -> bool {
        !self.force_new && self.strategy.is_none() && !stream.is_closed() && self.allows_network(stream.network())
    }

    /// Whether a freshly linked stream, produced by `strategy` (`None` when
    /// inbound), answers this request.
    fn accepts(&self, target: &Identity, stream: &Stream, strategy: Option<&str>) -> bool {
        if stream.remote_identity() != *target || !self.allows_network(stream.network()) {
            return false;
        }
        match (&self.strategy, strategy) {
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
            (None, None) => !self.force_new,
            (None, Some(_)) => true,
        }
    }
}

pub struct LinkPool {
    env: Arc<LinkEnv>,
    registry: StrategyRegistry,
    linkers: DashMap<Identity, Arc<NodeLinker>>,
}

impl LinkPool {
    pub fn new(env: Arc<LinkEnv>) -> Self {
        Self {
            env,
            registry: Arc::new(DashMap::new()),
            linkers: DashMap::new(),
        }
    }

    pub fn env(&self) -> &Arc<LinkEnv> {
        &self.env
    }

    /// Register `factory` for `network`, replacing any previous one.
    /// Linkers built before the change are dropped so the next request picks
    /// it up; attempts already running finish on their own.
    pub fn register_strategy(&self, network: impl Into<String>, factory: Arc<dyn StrategyFactory>) {
        let network = network.into();
        tracing::info!(network = %network, "link strategy registered");
        self.registry.insert(network, factory);
        self.linkers.clear();
    }

    /// Networks with a registered strategy.
    pub fn strategies(&self) -> Vec<String> {
        let mut networks: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        networks.sort();
        networks
    }

    pub fn linker(&self, target: Identity) -> Arc<NodeLinker> {
        self.linkers
            .entry(target)
            .or_insert_with(|| Arc::new(NodeLinker::new(target, self.env.clone(), self.registry.clone())))
            .clone()
    }

    /// A stream to `target`. Reuses a live stream unless `force_new`;
    /// otherwise waits for one to be produced, for the strategies to give
    /// up (`StreamNotProduced`), or for `ctx` to end.
    pub async fn retrieve_link(
        &self,
        ctx: &Context,
        target: Identity,
        opts: RetrieveLinkOptions,
    ) -> Result<Arc<Stream>, LinkError> {
        if target == self.env.local_identity() {
            return Err(LinkError::SelfLink);
        }

        let mut existing: Vec<Arc<Stream>> = self
            .env
            .peers
            .streams_to(&target)
            .into_iter()
            .filter(|s| opts.reusable(s))
            .collect();
        existing.shuffle(&mut rand::thread_rng());
        if let Some(stream) = existing.pop() {
            return Ok(stream);
        }

        let opts = Arc::new(opts);
        let mut sub = {
            let opts = opts.clone();
            self.env
                .watchers
                .subscribe(move |stream, strategy| opts.accepts(&target, stream, strategy))
        };

        let activation = async {
            if opts.endpoints.is_empty() {
                self.linker(target).activate(ctx, &opts).await.map(|_| None)
            } else {
                let endpoints: Vec<Endpoint> = opts
                    .endpoints
                    .iter()
                    .filter(|e| opts.allows_network(e.network()))
                    .cloned()
                    .collect();
                if endpoints.is_empty() {
                    return Err(LinkError::NoEndpoints(target));
                }
                Ok(connect_any(&self.env, ctx, target, endpoints).await)
            }
        };
        tokio::pin!(activation);

        tokio::select! {
            biased;
            Some(stream) = sub.recv() => Ok(stream),
            res = &mut activation => {
                if let Some(stream) = sub.try_recv() {
                    return Ok(stream);
                }
                match res {
                    Ok(Some(stream)) => Ok(stream),
                    Ok(None) => match ctx.err() {
                        Some(err) => Err(err.into()),
                        None => Err(LinkError::StreamNotProduced),
                    },
                    Err(e) => match ctx.err() {
                        Some(err) => Err(err.into()),
                        None => Err(e),
                    },
                }
            }
            err = ctx.done() => Err(err.into()),
        }
    }
}
