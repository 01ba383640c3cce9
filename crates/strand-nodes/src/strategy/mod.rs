//! Link strategies: per-network ways of producing a stream to one target.
//!
//! A strategy is built per target by its factory. `signal` starts an attempt
//! unless one is already running; `done` resolves when the current attempt
//! is over (immediately when idle). A produced stream is handed to waiting
//! callers through [`LinkEnv::deliver`](crate::link::LinkEnv::deliver).

mod basic;
mod nat;
mod persistent;
mod tor;

pub use basic::{connect_any, BasicFactory, BasicStrategy};
pub use nat::{NatFactory, NatPair, NatPeer, NatStrategy, NatTraversal};
pub use persistent::{PersistentFactory, PersistentStrategy};
pub use tor::{TorFactory, TorStrategy};

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;

use strand_core::config::{StrategyConfig, StrategyKind};
use strand_core::{Context, ContextError, Endpoint, Identity};

use crate::link::LinkEnv;
use crate::stream::Stream;

pub const STRATEGY_BASIC: &str = "basic";
pub const STRATEGY_PERSISTENT: &str = "persistent";
pub const STRATEGY_TOR: &str = "tor";
pub const STRATEGY_NAT: &str = "nat";

pub trait LinkStrategy: Send + Sync {
    /// Strategy kind, e.g. `"basic"`.
    fn name(&self) -> &'static str;

    /// Network this instance dials on.
    fn network(&self) -> &str;

    /// Start an attempt. No-op while one is running.
    fn signal(self: Arc<Self>, ctx: &Context);

    /// Resolves when the current attempt finishes.
    fn done(&self) -> BoxFuture<'static, ()>;

    /// Whether the target needs a resolved endpoint on this network before
    /// the strategy is worth signalling.
    fn requires_endpoints(&self) -> bool {
        true
    }
}

pub trait StrategyFactory: Send + Sync {
    fn build(&self, target: Identity) -> Arc<dyn LinkStrategy>;
}

/// Factory for a configured strategy kind on `network`. NAT traversal
/// needs a coordinator client that configuration cannot describe, so a
/// `nat` kind yields `None` unless `nat` supplies one.
pub fn factory_for(
    env: Arc<LinkEnv>,
    network: &str,
    config: &StrategyConfig,
    nat: Option<Arc<dyn NatTraversal>>,
) -> Option<Arc<dyn StrategyFactory>> {
    let factory: Arc<dyn StrategyFactory> = match config.kind {
        StrategyKind::Basic => Arc::new(BasicFactory::new(env, network)),
        StrategyKind::Persistent => Arc::new(PersistentFactory::new(env, network, config.clone())),
        StrategyKind::Tor => Arc::new(TorFactory::new(env, network, config.clone())),
        StrategyKind::Nat => Arc::new(NatFactory::new(env, network, nat?)),
    };
    Some(factory)
}

// ── Activity ──────────────────────────────────────────────────────────────────

/// Tracks whether an attempt is running and lets others wait for it to end.
pub struct Activity {
    active: Arc<watch::Sender<bool>>,
}

impl Default for Activity {
    fn default() -> Self {
        Self {
            active: Arc::new(watch::channel(false).0),
        }
    }
}

impl Activity {
    /// Mark an attempt as started. `None` if one is already running.
    pub fn try_start(&self) -> Option<ActiveGuard> {
        let started = self.active.send_if_modified(|active| {
            if *active {
                false
            } else {
                *active = true;
                true
            }
        });
        started.then(|| ActiveGuard {
            active: Some(self.active.clone()),
        })
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn done(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.active.subscribe();
        async move {
            let _ = rx.wait_for(|active| !*active).await;
        }
        .boxed()
    }
}

/// Ends the attempt when finished or dropped.
pub struct ActiveGuard {
    active: Option<Arc<watch::Sender<bool>>>,
}

impl ActiveGuard {
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.send_replace(false);
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2)
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, factor: u32) -> Self {
        Self {
            next: base.min(cap),
            cap,
            factor: factor.max(1),
        }
    }

    /// Delay before the next retry, without consuming it.
    pub fn peek(&self) -> Duration {
        self.next
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(self.factor).min(self.cap);
        delay
    }

    pub async fn wait(&mut self, ctx: &Context) -> Result<(), ContextError> {
        let delay = self.next_delay();
        ctx.run(tokio::time::sleep(delay)).await
    }
}

// ── Shared attempt helpers ────────────────────────────────────────────────────

/// One pass over `endpoints`, in order, until one links.
async fn try_round(env: &LinkEnv, ctx: &Context, target: Identity, endpoints: &[Endpoint]) -> Option<Arc<Stream>> {
    for endpoint in endpoints {
        if ctx.is_done() {
            return None;
        }
        if let Some(stream) = env.try_endpoint(ctx, target, endpoint).await {
            return Some(stream);
        }
    }
    None
}

/// `rounds` passes with no delay in between.
async fn try_quick(
    env: &LinkEnv,
    ctx: &Context,
    target: Identity,
    endpoints: &[Endpoint],
    rounds: u32,
) -> Option<Arc<Stream>> {
    for round in 0..rounds {
        if let Some(stream) = try_round(env, ctx, target, endpoints).await {
            return Some(stream);
        }
        tracing::debug!(target = %target.short(), round = round + 1, of = rounds, "quick retry");
    }
    None
}
