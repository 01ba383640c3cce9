//! In-process exonet: nodes in one process dial each other over
//! `tokio::io::duplex` pipes. Used by tests and local demos.
//!
//! Listeners are keyed by address only, so one listener answers on every
//! network name. Per-endpoint delays and refusals simulate slow or broken
//! links.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use strand_core::{Context, Endpoint};

use crate::error::DialError;
use crate::exonet::{Exonet, RawConn};

const PIPE_BUFFER: usize = 256 * 1024;
const BACKLOG: usize = 16;

#[derive(Default)]
pub struct MemoryNet {
    listeners: DashMap<String, mpsc::Sender<RawConn>>,
    delays: DashMap<(String, String), Duration>,
    refused: DashSet<(String, String)>,
    next_port: AtomicU64,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept connections dialed to `address`.
    pub fn listen(&self, address: impl Into<String>) -> MemoryListener {
        let address = address.into();
        let (tx, rx) = mpsc::channel(BACKLOG);
        self.listeners.insert(address.clone(), tx);
        MemoryListener { address, rx }
    }

    /// Stop accepting on `address`. Established pipes stay up.
    pub fn close(&self, address: &str) {
        self.listeners.remove(address);
    }

    /// Make dials to `endpoint` take `delay` before connecting.
    pub fn set_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.delays.insert(key(endpoint), delay);
    }

    /// Make dials to `endpoint` fail.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.refused.insert(key(endpoint));
    }

    /// Undo [`refuse`](Self::refuse).
    pub fn allow(&self, endpoint: &Endpoint) {
        self.refused.remove(&key(endpoint));
    }
}

fn key(endpoint: &Endpoint) -> (String, String) {
    (endpoint.network().to_string(), endpoint.address().to_string())
}

#[async_trait]
impl Exonet for MemoryNet {
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<RawConn, DialError> {
        let delay = self.delays.get(&key(endpoint)).map(|d| *d);
        if let Some(delay) = delay {
            ctx.run(tokio::time::sleep(delay)).await?;
        }
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let refused = |reason: &str| DialError::Failed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        if self.refused.contains(&key(endpoint)) {
            return Err(refused("connection refused"));
        }
        let listener = self
            .listeners
            .get(endpoint.address())
            .map(|l| l.clone())
            .ok_or_else(|| refused("no listener"))?;

        let (near, far) = tokio::io::duplex(PIPE_BUFFER);
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let from = Endpoint::new(endpoint.network(), format!("dialer-{port}"));
        listener
            .send(RawConn::inbound(far, Some(from)))
            .await
            .map_err(|_| refused("listener closed"))?;
        Ok(RawConn::outbound(near, endpoint.clone()))
    }
}

pub struct MemoryListener {
    address: String,
    rx: mpsc::Receiver<RawConn>,
}

impl MemoryListener {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next inbound connection; `None` once the listener is closed.
    pub async fn accept(&mut self) -> Option<RawConn> {
        self.rx.recv().await
    }
}
