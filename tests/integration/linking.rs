use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast::error::TryRecvError;

use strand_core::Context;
use strand_nodes::memory::MemoryNet;
use strand_nodes::{LinkError, NodeEvent, RetrieveLinkOptions, StreamError};

use crate::*;

#[tokio::test]
async fn existing_stream_is_reused() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let first = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    let second = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    assert_eq!(first.id(), second.id());

    let fresh = a
        .nodes
        .retrieve_link(&ctx, b.identity(), RetrieveLinkOptions::default().force_new())
        .await
        .unwrap();
    assert_ne!(fresh.id(), first.id());
    assert_eq!(a.nodes.streams_to(&b.identity()).len(), 2);
}

#[tokio::test]
async fn racing_strategies_leave_one_stream() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let networks = ["mem1", "mem2", "mem3"];
    let mut rng = rand::thread_rng();
    for network in networks {
        a.dial_over(network);
        a.learn(&b, network);
        net.set_delay(&b.endpoint(network), Duration::from_millis(rng.gen_range(10..=200)));
    }
    let mut events = a.nodes.subscribe();
    let (ctx, _cancel) = deadline(5);

    let opts = RetrieveLinkOptions::default().exclude_network(NET);
    let stream = a.nodes.retrieve_link(&ctx, b.identity(), opts).await.unwrap();
    assert!(networks.contains(&stream.network()));

    // The slowest dial is 200ms; give the losers time to come up and be closed.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut excess = 0;
    loop {
        match events.try_recv() {
            Ok(NodeEvent::StreamClosed { error, stream: id, .. }) => {
                assert_eq!(error, StreamError::Excess);
                assert_ne!(id, stream.id());
                excess += 1;
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("event stream broken: {e}"),
        }
    }
    assert_eq!(excess, 2, "every losing stream is closed as excess");

    let live = a.nodes.streams_to(&b.identity());
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id(), stream.id());
    assert!(!stream.is_closed());
}

#[tokio::test]
async fn cancelled_request_leaves_no_watchers() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    net.set_delay(&b.endpoint(NET), Duration::from_secs(5));

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(50));
    let started = tokio::time::Instant::now();
    let err = a
        .nodes
        .retrieve_link(&ctx, b.identity(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Context(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(a.nodes.link_env().watchers.is_empty());

    // The dial was cancelled with the request, so nothing turns up later.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.nodes.streams_to(&b.identity()).is_empty());

    let (ctx, cancel) = Context::background().child();
    cancel.cancel();
    let err = a
        .nodes
        .retrieve_link(&ctx, b.identity(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Context(_)), "got {err:?}");
    assert!(a.nodes.link_env().watchers.is_empty());
}

#[tokio::test]
async fn refused_endpoint_produces_nothing() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    net.refuse(&b.endpoint(NET));
    let (ctx, _cancel) = deadline(5);

    let err = a
        .nodes
        .retrieve_link(&ctx, b.identity(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::StreamNotProduced), "got {err:?}");
    assert!(a.nodes.link_env().watchers.is_empty());
}

#[tokio::test]
async fn unknown_target_has_no_endpoints() {
    let net = MemoryNet::new();
    let a = spawn_node(&net, "a");
    let stranger = spawn_node(&net, "stranger");
    let (ctx, _cancel) = deadline(5);

    let err = a
        .nodes
        .retrieve_link(&ctx, stranger.identity(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NoEndpoints(id) if id == stranger.identity()), "got {err:?}");

    let err = a
        .nodes
        .retrieve_link(&ctx, a.identity(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::SelfLink));
}

#[tokio::test]
async fn explicit_endpoints_bypass_resolution() {
    let net = MemoryNet::new();
    let a = spawn_node(&net, "a");
    let b = spawn_node(&net, "b");
    let (ctx, _cancel) = deadline(5);

    let opts = RetrieveLinkOptions::default().with_endpoints(vec![b.endpoint("direct")]);
    let stream = a.nodes.retrieve_link(&ctx, b.identity(), opts).await.unwrap();
    assert_eq!(stream.network(), "direct");
    assert!(a.nodes.resolve_endpoints(&ctx, &b.identity()).await.unwrap().is_empty());
}

#[tokio::test]
async fn inbound_stream_satisfies_waiting_request() {
    let net = MemoryNet::new();
    let a = spawn_node(&net, "a");
    let b = spawn_node(&net, "b");
    b.learn(&a, NET);
    let (ctx, _cancel) = deadline(5);

    // `a` only knows a dead-slow endpoint, so `b` dialing in wins.
    let slow = Endpoint::new(NET, "slow");
    net.set_delay(&slow, Duration::from_secs(3));
    let waiting = {
        let nodes = a.nodes.clone();
        let ctx = ctx.clone();
        let target = b.identity();
        tokio::spawn(async move {
            let opts = RetrieveLinkOptions::default().with_endpoints(vec![slow]);
            nodes.retrieve_link(&ctx, target, opts).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let out = b.nodes.retrieve_link(&ctx, a.identity(), Default::default()).await.unwrap();
    assert!(out.outbound());

    let got = waiting.await.unwrap().unwrap();
    assert!(!got.outbound());
    assert_eq!(got.remote_identity(), b.identity());
}

#[tokio::test]
async fn peers_report_observed_endpoints() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || !a.nodes.observed_endpoints().is_empty()).await,
        "b never reflected its view of a"
    );
    let seen = &a.nodes.observed_endpoints()[0];
    assert_eq!(seen.network(), NET);
    assert!(seen.address().starts_with("dialer-"));
}

#[tokio::test]
async fn shutdown_closes_every_stream() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let stream = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    a.nodes.shutdown();
    assert_eq!(stream.closed().await, StreamError::Shutdown);
    assert!(a.nodes.root_context().is_done());
    assert!(
        eventually(Duration::from_secs(1), || b.nodes.streams_to(&a.identity()).is_empty()).await,
        "b kept a stream to a closed node"
    );
}
