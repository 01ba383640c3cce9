//! strandd — Strand node daemon.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;

use strand_core::config::{StrandConfig, StrategyConfig};
use strand_core::{Endpoint, Identity};
use strand_nodes::strategy::factory_for;
use strand_nodes::{EchoHandler, NoiseHandshake, Nodes, QueryDispatcher};

mod keys;
mod tcp;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StrandConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = StrandConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StrandConfig::default()
    });

    // Keypair
    let keypair = Arc::new(keys::load_or_generate(&config.identity.keypair_path)?);
    tracing::info!(identity = %keypair.identity(), "keypair ready");

    // Query handlers
    let router = {
        let mut d = QueryDispatcher::new();
        d.register("echo", Arc::new(EchoHandler));
        Arc::new(d)
    };

    let nodes = Nodes::new(
        Arc::new(NoiseHandshake::new(keypair.clone())),
        Arc::new(tcp::TcpExonet),
        router,
        config.link.clone(),
        config.migration.clone(),
    );

    // Link strategies
    let mut strategies = config.strategies.clone();
    strategies
        .entry(tcp::NETWORK.to_string())
        .or_insert_with(StrategyConfig::default);
    for (network, strategy) in &strategies {
        match factory_for(nodes.link_env(), network, strategy, None) {
            Some(factory) => nodes.register_link_strategy(network.clone(), factory),
            None => tracing::warn!(network = %network, kind = ?strategy.kind, "no traversal coordinator; strategy skipped"),
        }
    }

    // Endpoint seeds
    for seed in &config.endpoints {
        match seed.identity.parse::<Identity>() {
            Ok(identity) => {
                nodes.add_endpoint(identity, Endpoint::new(&seed.network, &seed.address), None);
            }
            Err(e) => tracing::warn!(identity = %seed.identity, error = %e, "skipping endpoint seed"),
        }
    }
    tracing::info!(
        strategies = strategies.len(),
        seeds = config.endpoints.len(),
        "link setup complete"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener = TcpListener::bind(&config.network.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen))?;
    tracing::info!(listen = %config.network.listen, "accepting links");
    let accept_task = tokio::spawn(accept_loop(listener, nodes.clone(), config.link.link_timeout()));

    let event_task = {
        let mut events = nodes.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracing::debug!(?event, "node event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event log lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Admin HTTP endpoint
    let api_port = config.network.api_port;
    if api_port != 0 {
        let state = strand_api::ApiState {
            nodes: nodes.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = strand_api::serve(state, api_port).await {
                tracing::error!(error = %e, "api server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = accept_task        => tracing::error!("accept loop exited: {:?}", r),
        r = event_task         => tracing::error!("event log exited: {:?}", r),
    }

    nodes.shutdown();
    Ok(())
}

async fn accept_loop(listener: TcpListener, nodes: Arc<Nodes>, timeout: std::time::Duration) -> Result<()> {
    loop {
        let conn = tcp::accept(&listener).await.context("accept failed")?;
        let nodes = nodes.clone();
        tokio::spawn(async move {
            let remote = conn.remote_endpoint.clone();
            let (ctx, _cancel) = nodes.root_context().with_timeout(timeout);
            if let Err(e) = nodes.accept_inbound_link(&ctx, conn).await {
                tracing::debug!(remote = ?remote, error = %e, "inbound link failed");
            }
        });
    }
}
