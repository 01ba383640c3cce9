use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use strand_core::{Context, Endpoint, Identity, Nonce};

use super::{Activity, LinkStrategy, StrategyFactory, STRATEGY_NAT};
use crate::error::LinkError;
use crate::link::LinkEnv;

/// One side of a traversal pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPeer {
    pub identity: Identity,
    /// Public endpoint as seen by the coordinator.
    pub endpoint: Endpoint,
}

/// A punched hole between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPair {
    pub nonce: Nonce,
    pub peer_a: NatPeer,
    pub peer_b: NatPeer,
}

impl NatPair {
    /// `(local, remote)` from `me`'s point of view.
    pub fn sides(&self, me: &Identity) -> (&NatPeer, &NatPeer) {
        if self.peer_b.identity == *me {
            (&self.peer_b, &self.peer_a)
        } else {
            (&self.peer_a, &self.peer_b)
        }
    }
}

/// Rendezvous with a third-party coordinator.
#[async_trait]
pub trait NatTraversal: Send + Sync {
    /// Run the pairing handshake and learn both sides' punched endpoints.
    async fn traverse(&self, ctx: &Context, target: &Identity) -> Result<NatPair, LinkError>;

    /// Lock the pair so neither side hands it to anyone else. Any local or
    /// remote port mapping is set up here.
    async fn pair_take(&self, ctx: &Context, pair: &NatPair, target: &Identity) -> Result<(), LinkError>;

    /// Undo whatever `pair_take` set up. Runs once the stream closes.
    async fn release(&self, ctx: &Context, pair: &NatPair, target: &Identity);
}

pub struct NatStrategy {
    env: Arc<LinkEnv>,
    network: String,
    nat: Arc<dyn NatTraversal>,
    target: Identity,
    activity: Activity,
}

impl NatStrategy {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>, nat: Arc<dyn NatTraversal>, target: Identity) -> Self {
        Self {
            env,
            network: network.into(),
            nat,
            target,
            activity: Activity::default(),
        }
    }

    async fn attempt(&self, ctx: &Context) -> Result<(), LinkError> {
        let me = self.env.local_identity();
        tracing::debug!(target = %self.target.short(), "starting traversal");

        let pair = self.nat.traverse(ctx, &self.target).await?;
        self.nat.pair_take(ctx, &pair, &self.target).await?;
        let remote = pair.sides(&me).1.endpoint.clone();

        tracing::debug!(target = %self.target.short(), nonce = format_args!("{:016x}", pair.nonce), endpoint = %remote, "pair locked, dialing");
        let conn = match self.env.exonet.dial(ctx, &remote).await {
            Ok(conn) => conn,
            Err(e) => {
                self.nat.release(&self.env.root, &pair, &self.target).await;
                return Err(e.into());
            }
        };
        let stream = match self.env.establish_outbound_link(ctx, self.target, conn).await {
            Ok(stream) => stream,
            Err(e) => {
                self.nat.release(&self.env.root, &pair, &self.target).await;
                return Err(e);
            }
        };

        let nat = self.nat.clone();
        let root = self.env.root.clone();
        let target = self.target;
        stream.on_close(move |_| {
            tokio::spawn(async move {
                nat.release(&root, &pair, &target).await;
            });
        });

        tracing::info!(target = %self.target.short(), endpoint = %remote, "linked through traversal");
        self.env.deliver(stream, STRATEGY_NAT);
        Ok(())
    }
}

impl LinkStrategy for NatStrategy {
    fn name(&self) -> &'static str {
        STRATEGY_NAT
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn signal(self: Arc<Self>, ctx: &Context) {
        let Some(guard) = self.activity.try_start() else {
            return;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = self.attempt(&ctx).await {
                tracing::debug!(target = %self.target.short(), error = %e, "traversal failed");
            }
            guard.finish();
        });
    }

    fn done(&self) -> BoxFuture<'static, ()> {
        self.activity.done()
    }

    fn requires_endpoints(&self) -> bool {
        false
    }
}

pub struct NatFactory {
    env: Arc<LinkEnv>,
    network: String,
    nat: Arc<dyn NatTraversal>,
}

impl NatFactory {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>, nat: Arc<dyn NatTraversal>) -> Self {
        Self {
            env,
            network: network.into(),
            nat,
        }
    }
}

impl StrategyFactory for NatFactory {
    fn build(&self, target: Identity) -> Arc<dyn LinkStrategy> {
        Arc::new(NatStrategy::new(
            self.env.clone(),
            self.network.clone(),
            self.nat.clone(),
            target,
        ))
    }
}
