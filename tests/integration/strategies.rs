use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use strand_core::config::{StrategyConfig, StrategyKind};
use strand_core::{Context, Endpoint, Identity};
use strand_nodes::memory::MemoryNet;
use strand_nodes::strategy::{
    factory_for, NatFactory, NatPair, NatPeer, NatTraversal, PersistentFactory, TorFactory, STRATEGY_NAT,
    STRATEGY_PERSISTENT,
};
use strand_nodes::{DialError, Exonet, LinkError, NodeEvent, RawConn, StreamError};

use crate::*;

/// Dials through a [`MemoryNet`], noting when each dial started.
struct RecordingNet {
    inner: Arc<MemoryNet>,
    dials: Mutex<Vec<Instant>>,
}

impl RecordingNet {
    fn new(inner: &Arc<MemoryNet>) -> Arc<Self> {
        Arc::new(Self {
            inner: inner.clone(),
            dials: Mutex::new(Vec::new()),
        })
    }

    fn dials(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exonet for RecordingNet {
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<RawConn, DialError> {
        self.dials.lock().unwrap().push(Instant::now());
        self.inner.dial(ctx, endpoint).await
    }
}

fn persistent_config() -> StrategyConfig {
    StrategyConfig {
        kind: StrategyKind::Persistent,
        quick_retries: 1,
        retries: 50,
        retry_delay_ms: 100,
        signal_timeout_ms: 300,
        background_timeout_ms: 10_000,
    }
}

/// `a` dials `b` persistently while `b` refuses; returns once the caller has
/// been let go.
async fn release_persistent_caller(net: &Arc<MemoryNet>, a: &TestNode, b: &TestNode) {
    a.nodes.register_link_strategy(
        NET,
        Arc::new(PersistentFactory::new(a.nodes.link_env(), NET, persistent_config())),
    );
    net.refuse(&b.endpoint(NET));

    let (ctx, _cancel) = deadline(5);
    let started = Instant::now();
    let err = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap_err();
    assert_eq!(err, LinkError::StreamNotProduced);
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_millis(300) && waited < Duration::from_secs(1),
        "caller held for {waited:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn persistent_hands_late_stream_to_a_watcher() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    release_persistent_caller(&net, &a, &b).await;

    let b_id = b.identity();
    let mut sub = a
        .nodes
        .link_env()
        .watchers
        .subscribe(move |s, strategy| s.remote_identity() == b_id && strategy == Some(STRATEGY_PERSISTENT));
    net.allow(&b.endpoint(NET));

    let stream = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("background attempt never delivered")
        .unwrap();
    assert_eq!(stream.remote_identity(), b.identity());
    assert!(!stream.is_closed());
}

#[tokio::test(start_paused = true)]
async fn persistent_closes_late_stream_nobody_wants() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    release_persistent_caller(&net, &a, &b).await;

    let mut events = a.nodes.subscribe();
    net.allow(&b.endpoint(NET));

    let created = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(NodeEvent::StreamCreated { stream, remote, outbound: true, .. }) = events.recv().await {
                assert_eq!(remote, b.identity());
                return stream;
            }
        }
    })
    .await
    .expect("background attempt never linked");

    let error = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(NodeEvent::StreamClosed { stream, error, .. }) = events.recv().await {
                if stream == created {
                    return error;
                }
            }
        }
    })
    .await
    .expect("unclaimed stream stayed open");
    assert_eq!(error, StreamError::Excess);
}

#[tokio::test(start_paused = true)]
async fn tor_backs_off_exponentially_in_background() {
    let net = MemoryNet::new();
    let dialer = RecordingNet::new(&net);
    let a = spawn_node_dialing(&net, dialer.clone(), "a");
    let b = spawn_node(&net, "b");
    a.learn(&b, NET);

    let config = StrategyConfig {
        kind: StrategyKind::Tor,
        quick_retries: 1,
        retries: 4,
        signal_timeout_ms: 100,
        background_timeout_ms: 120_000,
        ..StrategyConfig::default()
    };
    a.nodes
        .register_link_strategy(NET, Arc::new(TorFactory::new(a.nodes.link_env(), NET, config)));
    // Every dial hangs past the signal window, then fails.
    let dial_time = Duration::from_millis(200);
    net.set_delay(&b.endpoint(NET), dial_time);
    net.refuse(&b.endpoint(NET));

    let (ctx, _cancel) = deadline(60);
    let err = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap_err();
    assert_eq!(err, LinkError::StreamNotProduced);

    // One foreground dial, then four in the background.
    assert!(
        eventually(Duration::from_secs(30), || dialer.dials().len() == 5).await,
        "saw {} dials",
        dialer.dials().len()
    );
    let dials = dialer.dials();
    let gaps: Vec<Duration> = dials[1..].windows(2).map(|w| w[1] - w[0] - dial_time).collect();
    for (gap, want) in gaps.iter().zip([1u64, 2, 4]) {
        let want = Duration::from_secs(want);
        assert!(
            *gap >= want && *gap < want + Duration::from_millis(50),
            "backoff gaps {gaps:?}"
        );
    }
}

/// Coordinator stand-in that always pairs with the same endpoint and logs
/// every call.
struct FakeCoordinator {
    pair: NatPair,
    calls: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl NatTraversal for FakeCoordinator {
    async fn traverse(&self, _ctx: &Context, _target: &Identity) -> Result<NatPair, LinkError> {
        let _ = self.calls.send("traverse".into());
        Ok(self.pair.clone())
    }

    async fn pair_take(&self, _ctx: &Context, pair: &NatPair, _target: &Identity) -> Result<(), LinkError> {
        let _ = self.calls.send(format!("take {}", pair.nonce));
        Ok(())
    }

    async fn release(&self, _ctx: &Context, pair: &NatPair, _target: &Identity) {
        let _ = self.calls.send(format!("release {}", pair.nonce));
    }
}

/// `a` and `b` with no known endpoints, and `a` able to punch through to
/// `b` on the "nat" network.
fn nat_pair(net: &Arc<MemoryNet>) -> (TestNode, TestNode, mpsc::UnboundedReceiver<String>) {
    let a = spawn_node(net, "a");
    let b = spawn_node(net, "b");
    let (calls, rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(FakeCoordinator {
        pair: NatPair {
            nonce: 42,
            peer_a: NatPeer {
                identity: a.identity(),
                endpoint: a.endpoint(STRATEGY_NAT),
            },
            peer_b: NatPeer {
                identity: b.identity(),
                endpoint: b.endpoint(STRATEGY_NAT),
            },
        },
        calls,
    });
    a.nodes.register_link_strategy(
        STRATEGY_NAT,
        Arc::new(NatFactory::new(a.nodes.link_env(), STRATEGY_NAT, coordinator)),
    );
    (a, b, rx)
}

async fn next_call(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no coordinator call in time")
        .expect("coordinator dropped")
}

#[tokio::test]
async fn nat_takes_the_pair_and_releases_it_on_close() {
    let net = MemoryNet::new();
    let (a, b, mut calls) = nat_pair(&net);
    let (ctx, _cancel) = deadline(5);

    let stream = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    assert_eq!(stream.remote_identity(), b.identity());
    assert_eq!(stream.network(), STRATEGY_NAT);
    assert_eq!(next_call(&mut calls).await, "traverse");
    assert_eq!(next_call(&mut calls).await, "take 42");
    assert!(calls.try_recv().is_err(), "released while the stream is up");

    assert!(a.nodes.close_stream(stream.id()));
    assert_eq!(next_call(&mut calls).await, "release 42");
}

#[tokio::test]
async fn nat_releases_the_pair_when_the_dial_fails() {
    let net = MemoryNet::new();
    let (a, b, mut calls) = nat_pair(&net);
    net.refuse(&b.endpoint(STRATEGY_NAT));
    let (ctx, _cancel) = deadline(5);

    let err = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap_err();
    assert_eq!(err, LinkError::StreamNotProduced);
    assert_eq!(next_call(&mut calls).await, "traverse");
    assert_eq!(next_call(&mut calls).await, "take 42");
    assert_eq!(next_call(&mut calls).await, "release 42");
}

#[tokio::test]
async fn configured_nat_needs_a_coordinator() {
    let net = MemoryNet::new();
    let a = spawn_node(&net, "a");
    let (calls, _rx) = mpsc::unbounded_channel();
    let config = StrategyConfig {
        kind: StrategyKind::Nat,
        ..StrategyConfig::default()
    };

    assert!(factory_for(a.nodes.link_env(), "punch", &config, None).is_none());

    let coordinator = Arc::new(FakeCoordinator {
        pair: NatPair {
            nonce: 1,
            peer_a: NatPeer {
                identity: a.identity(),
                endpoint: a.endpoint("punch"),
            },
            peer_b: NatPeer {
                identity: a.identity(),
                endpoint: a.endpoint("punch"),
            },
        },
        calls,
    });
    let coordinator: Arc<dyn NatTraversal> = coordinator;
    let factory = factory_for(a.nodes.link_env(), "punch", &config, Some(coordinator)).unwrap();
    let strategy = factory.build(Identity::from_bytes([7; 32]));
    assert_eq!(strategy.name(), STRATEGY_NAT);
    assert_eq!(strategy.network(), "punch");
    assert!(!strategy.requires_endpoints());

    let basic = StrategyConfig::default();
    let strategy = factory_for(a.nodes.link_env(), "punch", &basic, None).unwrap().build(Identity::from_bytes([7; 32]));
    assert_eq!(strategy.name(), "basic");
}
