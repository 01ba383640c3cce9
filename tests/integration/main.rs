//! Strand integration test harness.
//!
//! Every test builds a handful of complete nodes in one process. Nodes talk
//! over a shared [`MemoryNet`], authenticate with Noise, and link through
//! the same strategies the daemon registers, so everything above the
//! socket is the production path.
//!
//!   cargo test --test integration
//!
//! Each node listens on its own address and accepts until the net drops
//! its listener.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use strand_core::config::{LinkConfig, MigrationConfig};
use strand_core::crypto::Keypair;
use strand_core::{Context, Endpoint, Identity};
use strand_nodes::memory::MemoryNet;
use strand_nodes::strategy::BasicFactory;
use strand_nodes::{
    EchoHandler, Exonet, NoiseHandshake, Nodes, Query, QueryDispatcher, QueryRouter, RouteError, Session,
};

mod linking;
mod migration;
mod sessions;
mod strategies;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Network name the default strategy dials.
pub const NET: &str = "mem";

/// Hands every inbound "capture" session to the test instead of serving it.
struct CaptureHandler {
    tx: mpsc::UnboundedSender<Arc<Session>>,
}

#[async_trait]
impl QueryRouter for CaptureHandler {
    async fn route_query(&self, _ctx: &Context, _query: &Query, session: Arc<Session>) -> Result<(), RouteError> {
        self.tx.send(session).map_err(|_| RouteError::Rejected)
    }
}

pub struct TestNode {
    pub nodes: Arc<Nodes>,
    pub address: String,
    /// Sessions opened against this node with the "capture" query.
    pub inbox: mpsc::UnboundedReceiver<Arc<Session>>,
}

impl TestNode {
    pub fn identity(&self) -> Identity {
        self.nodes.local_identity()
    }

    pub fn endpoint(&self, network: &str) -> Endpoint {
        Endpoint::new(network, self.address.clone())
    }

    /// Register a plain dialing strategy for `network`.
    pub fn dial_over(&self, network: &str) {
        self.nodes
            .register_link_strategy(network, Arc::new(BasicFactory::new(self.nodes.link_env(), network)));
    }

    /// Teach this node where `other` listens on `network`.
    pub fn learn(&self, other: &TestNode, network: &str) {
        self.nodes.add_endpoint(other.identity(), other.endpoint(network), None);
    }

    /// Next captured session, or panic after a second.
    pub async fn captured(&mut self) -> Arc<Session> {
        tokio::time::timeout(Duration::from_secs(1), self.inbox.recv())
            .await
            .expect("no session captured in time")
            .expect("capture handler dropped")
    }
}

/// Start a node listening on `address` with "echo" and "capture" handlers
/// and a basic strategy for [`NET`].
pub fn spawn_node(net: &Arc<MemoryNet>, address: &str) -> TestNode {
    spawn_node_dialing(net, net.clone(), address)
}

/// Like [`spawn_node`], with outbound dials going through `dialer`.
pub fn spawn_node_dialing(net: &Arc<MemoryNet>, dialer: Arc<dyn Exonet>, address: &str) -> TestNode {
    let (tx, inbox) = mpsc::unbounded_channel();
    let mut router = QueryDispatcher::new();
    router.register("echo", Arc::new(EchoHandler));
    router.register("capture", Arc::new(CaptureHandler { tx }));

    let link = LinkConfig {
        link_timeout_secs: 5,
        ping_timeout_secs: 5,
        session_buffer: 256 * 1024,
        ..LinkConfig::default()
    };
    let migration = MigrationConfig {
        timeout_secs: 5,
        poll_interval_ms: 10,
    };
    let handshake = Arc::new(NoiseHandshake::new(Arc::new(Keypair::generate())));
    let nodes = Nodes::new(handshake, dialer, Arc::new(router), link, migration);

    let mut listener = net.listen(address);
    let acceptor = nodes.clone();
    tokio::spawn(async move {
        while let Some(conn) = listener.accept().await {
            let nodes = acceptor.clone();
            tokio::spawn(async move {
                let (ctx, _cancel) = nodes.root_context().with_timeout(Duration::from_secs(5));
                if let Err(e) = nodes.accept_inbound_link(&ctx, conn).await {
                    eprintln!("inbound link failed: {e}");
                }
            });
        }
    });

    let node = TestNode {
        nodes,
        address: address.to_string(),
        inbox,
    };
    node.dial_over(NET);
    node
}

/// Two nodes where `a` knows how to reach `b` over [`NET`].
pub fn pair(net: &Arc<MemoryNet>) -> (TestNode, TestNode) {
    let a = spawn_node(net, "a");
    let b = spawn_node(net, "b");
    a.learn(&b, NET);
    (a, b)
}

/// Poll `check` every 10ms until it holds or `within` passes.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A context that gives up after `secs` seconds.
pub fn deadline(secs: u64) -> (Context, strand_core::CancelHandle) {
    Context::background().with_timeout(Duration::from_secs(secs))
}

/// Write `data` then read back exactly as many bytes.
pub async fn round_trip(ctx: &Context, session: &Session, data: &[u8]) -> Vec<u8> {
    session.write(ctx, data).await.expect("write");
    read_exact(ctx, session, data.len()).await
}

pub async fn read_exact(ctx: &Context, session: &Session, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    while out.len() < len {
        let want = (len - out.len()).min(buf.len());
        let n = session.read(ctx, &mut buf[..want]).await.expect("read");
        assert!(n > 0, "session closed after {} of {len} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn nodes_link_and_authenticate() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let stream = a
        .nodes
        .retrieve_link(&ctx, b.identity(), Default::default())
        .await
        .expect("link");
    assert_eq!(stream.remote_identity(), b.identity());
    assert_eq!(stream.network(), NET);
    assert!(stream.outbound());

    assert!(
        eventually(Duration::from_secs(1), || b.nodes.streams_to(&a.identity()).len() == 1).await,
        "b never saw the inbound stream"
    );
    let status = a.nodes.status();
    assert_eq!(status.linked_peers, 1);
    assert_eq!(status.strategies, vec![NET.to_string()]);
}
