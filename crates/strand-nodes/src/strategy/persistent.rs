use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::config::StrategyConfig;
use strand_core::{Context, Endpoint, Identity};

use super::{try_quick, try_round, Activity, ActiveGuard, LinkStrategy, StrategyFactory, STRATEGY_PERSISTENT};
use crate::link::LinkEnv;
use crate::stream::Stream;

/// Retries with a fixed delay. When the signal window closes the caller is
/// released, but the strategy keeps trying on the module's lifetime and
/// hands a late stream to whoever is waiting by then.
pub struct PersistentStrategy {
    env: Arc<LinkEnv>,
    network: String,
    target: Identity,
    config: StrategyConfig,
    activity: Activity,
}

impl PersistentStrategy {
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

        // Foreground, bounded by the signal window and the caller.
        let (fg, _fg_cancel) = ctx.with_timeout(self.config.signal_timeout());
        match fg.run(self.try_with_retry(&fg, &endpoints)).await {
            Ok(stream) => {
                guard.finish();
                if let Some(stream) = stream {
                    self.env.deliver(stream, STRATEGY_PERSISTENT);
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

        tracing::debug!(
            target = %self.target.short(),
            network = %self.network,
            window = ?self.config.background_timeout(),
            "continuing in background"
        );
        let (bg, _bg_cancel) = self.env.root.with_timeout(self.config.background_timeout());
        if let Ok(Some(stream)) = bg.run(self.try_with_retry(&bg, &endpoints)).await {
            self.env.deliver(stream, STRATEGY_PERSISTENT);
        }
    }

    async fn try_with_retry(&self, ctx: &Context, endpoints: &[Endpoint]) -> Option<Arc<Stream>> {
        if let Some(stream) = try_quick(&self.env, ctx, self.target, endpoints, self.config.quick_retries).await {
            return Some(stream);
        }
        for attempt in 0..self.config.retries {
            if let Some(stream) = try_round(&self.env, ctx, self.target, endpoints).await {
                return Some(stream);
            }
            if attempt + 1 < self.config.retries {
                tracing::debug!(
                    target = %self.target.short(),
                    attempt = attempt + 1,
                    of = self.config.retries,
                    delay = ?self.config.retry_delay(),
                    "retrying"
                );
                if ctx.run(tokio::time::sleep(self.config.retry_delay())).await.is_err() {
                    return None;
                }
            }
        }
        None
    }
}

impl LinkStrategy for PersistentStrategy {
    fn name(&self) -> &'static str {
        STRATEGY_PERSISTENT
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

pub struct PersistentFactory {
    env: Arc<LinkEnv>,
    network: String,
    config: StrategyConfig,
}

impl PersistentFactory {
    pub fn new(env: Arc<LinkEnv>, network: impl Into<String>, config: StrategyConfig) -> Self {
        Self {
            env,
            network: network.into(),
            config,
        }
    }
}

impl StrategyFactory for PersistentFactory {
    fn build(&self, target: Identity) -> Arc<dyn LinkStrategy> {
        Arc::new(PersistentStrategy::new(
            self.env.clone(),
            self.network.clone(),
            target,
            self.config.clone(),
        ))
    }
}
