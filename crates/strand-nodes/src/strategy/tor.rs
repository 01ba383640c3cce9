use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::config::StrategyConfig;
use strand_core::{Context, Endpoint, Identity};

use super::{try_quick, try_round, Activity, ActiveGuard, Backoff, LinkStrategy, StrategyFactory, STRATEGY_TOR};
use crate::link::LinkEnv;
use crate::stream::Stream;

/// Quick retries while the caller waits, then exponential backoff in the
/// background. Circuits are slow to build and often fail the first time.
pub struct TorStrategy {
    env: Arc<LinkEnv>,
    network: String,
    target: Identity,
    config: StrategyConfig,
    activity: Activity,
}

impl TorStrategy {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>, target: Identity, config: StrategyConfig) -> Self {
        Self {
            env,
            network: network.into(),
            target,
            config,
            activity: Activity::default(),
        }
    }

    async fn run(self: Arc<Self>, ctx: Context, guard: ActiveGuard) {
        let endpoints = match self.env.resolve_network(&ctx, &self.target, &self.network).await {
            Ok(endpoints) if !endpoints.is_empty() => endpoints,
            Ok(_) => {
                tracing::debug!(target = %self.target.short(), network = %self.network, "no endpoints");
                return;
            }
            Err(e) => {
                tracing::debug!(target = %self.target.short(), network = %self.network, error = %e, "resolve failed");
                return;
            }
        };

        let (fg, _fg_cancel) = ctx.with_timeout(self.config.signal_timeout());
        let quick = try_quick(&self.env, &fg, self.target, &endpoints, self.config.quick_retries);
        match fg.run(quick).await {
            Ok(stream) => {
                guard.finish();
                if let Some(stream) = stream {
                    self.env.deliver(stream, STRATEGY_TOR);
                }
                return;
            }
            Err(_) => {
                guard.finish();
                if ctx.is_done() {
                    return;
                }
            }
        }

        let (bg, _bg_cancel) = self.env.root.with_timeout(self.config.background_timeout());
        if let Ok(Some(stream)) = bg.run(self.try_with_backoff(&bg, &endpoints)).await {
            self.env.deliver(stream, STRATEGY_TOR);
        }
    }

    async fn try_with_backoff(&self, ctx: &Context, endpoints: &[Endpoint]) -> Option<Arc<Stream>> {
        let mut backoff = Backoff::default();
        for attempt in 0..self.config.retries {
            if let Some(stream) = try_round(&self.env, ctx, self.target, endpoints).await {
                return Some(stream);
            }
            if attempt + 1 < self.config.retries {
                tracing::debug!(
                    target = %self.target.short(),
                    attempt = attempt + 1,
                    of = self.config.retries,
                    delay = ?backoff.peek(),
                    "retrying"
                );
                if backoff.wait(ctx).await.is_err() {
                    return None;
                }
            }
        }
        None
    }
}

impl LinkStrategy for TorStrategy {
    fn name(&self) -> &'static str {
        STRATEGY_TOR
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn signal(self: Arc<Self>, ctx: &Context) {
        let Some(guard) = self.activity.try_start() else {
            return;
        };
        tokio::spawn(self.run(ctx.clone(), guard));
    }

    fn done(&self) -> BoxFuture<'static, ()> {
        self.activity.done()
    }
}

pub struct TorFactory {
    env: Arc<LinkEnv>,
    network: String,
    config: StrategyConfig,
}

impl TorFactory {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>, config: StrategyConfig) -> Self {
        Self {
            env,
            network: network.into(),
            config,
        }
    }
}

impl StrategyFactory for TorFactory {
    fn build(&self, target: Identity) -> Arc<dyn LinkStrategy> {
        Arc::new(TorStrategy::new(
            self.env.clone(),
            self.network.clone(),
            target,
            self.config.clone(),
        ))
    }
}
