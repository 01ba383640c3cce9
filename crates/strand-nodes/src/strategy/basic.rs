use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::{join_all, BoxFuture};

use strand_core::{Context, Endpoint, Identity};

use super::{Activity, LinkStrategy, StrategyFactory, STRATEGY_BASIC};
use crate::error::StreamError;
use crate::link::LinkEnv;
use crate::stream::Stream;

/// Dials every known endpoint on one network in parallel and keeps the
/// first stream that comes up.
pub struct BasicStrategy {
    env: Arc<LinkEnv>,
    network: String,
    target: Identity,
    activity: Activity,
}

impl BasicStrategy {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>, target: Identity) -> Self {
        Self {
            env,
            network: network.into(),
            target,
            activity: Activity::default(),
        }
    }

    async fn run(&self, ctx: &Context) {
        let endpoints = match self.env.resolve_network(ctx, &self.target, &self.network).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::debug!(target = %self.target.short(), network = %self.network, error = %e, "resolve failed");
                return;
            }
        };
        if let Some(stream) = connect_any(&self.env, ctx, self.target, endpoints).await {
            self.env.deliver(stream, STRATEGY_BASIC);
        }
    }
}

impl LinkStrategy for BasicStrategy {
    fn name(&self) -> &'static str {
        STRATEGY_BASIC
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
            self.run(&ctx).await;
            guard.finish();
        });
    }

    fn done(&self) -> BoxFuture<'static, ()> {
        self.activity.done()
    }
}

/// Race `endpoints` over the configured worker pool. The first stream wins;
/// later ones are closed as excess. Bounded by the link timeout.
pub async fn connect_any(
    env: &LinkEnv,
    ctx: &Context,
    target: Identity,
    endpoints: Vec<Endpoint>,
) -> Option<Arc<Stream>> {
    if endpoints.is_empty() {
        return None;
    }
    let (ctx, _timeout) = ctx.with_timeout(env.config.link_timeout());
    let (wctx, _cancel) = ctx.child();
    let workers = env.config.worker_count.clamp(1, endpoints.len());
    let queue = Mutex::new(VecDeque::from(endpoints));
    let winner: OnceLock<Arc<Stream>> = OnceLock::new();

    let worker = || async {
        loop {
            if wctx.is_done() {
                return;
            }
            let next = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(endpoint) = next else {
                return;
            };
            if let Some(stream) = env.try_endpoint(&wctx, target, &endpoint).await {
                match winner.set(stream) {
                    Ok(()) => wctx.cancel(),
                    Err(excess) => {
                        excess.close_with_error(StreamError::Excess);
                    }
                }
                return;
            }
        }
    };
    join_all((0..workers).map(|_| worker())).await;

    winner.into_inner()
}

pub struct BasicFactory {
    env: Arc<LinkEnv>,
    network: String,
}

impl BasicFactory {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>) -> Self {
        Self {
            env,
            network: network.into(),
        }
    }
}

impl StrategyFactory for BasicFactory {
    fn build(&self, target: Identity) -> Arc<dyn LinkStrategy> {
        Arc::new(BasicStrategy::new(self.env.clone(), self.network.clone(), target))
    }
}
