use std::time::Duration;

use bytes::Bytes;

use strand_core::wire::Frame;
use strand_nodes::memory::MemoryNet;
use strand_nodes::{RouteError, SessionError, SessionState, StreamError};

use crate::*;

#[tokio::test]
async fn echo_round_trip_then_close() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    // No stream yet: routing links first.
    let session = a.nodes.route_query(&ctx, b.identity(), "echo").await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert!(session.outbound());
    assert_eq!(round_trip(&ctx, &session, b"hello").await, b"hello");

    let nonce = session.nonce();
    assert!(
        eventually(Duration::from_secs(1), || b.nodes.find_session(nonce).is_some()).await,
        "b never tracked the session"
    );

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(
        eventually(Duration::from_secs(1), || b.nodes.find_session(nonce).is_none()).await,
        "b kept the session after the caller closed it"
    );
    // The stream outlives its sessions.
    assert_eq!(a.nodes.streams_to(&b.identity()).len(), 1);
}

#[tokio::test]
async fn large_transfer_respects_flow_control() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(10);

    let session = a.nodes.route_query(&ctx, b.identity(), "echo").await.unwrap();
    // Several times the session window, so credit has to come back.
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    let writer = {
        let session = session.clone();
        let ctx = ctx.clone();
        let data = data.clone();
        tokio::spawn(async move { session.write(&ctx, &data).await })
    };
    let echoed = read_exact(&ctx, &session, data.len()).await;
    assert_eq!(writer.await.unwrap().unwrap(), data.len());
    assert!(echoed == data, "echoed bytes differ");
}

#[tokio::test]
async fn unknown_query_is_refused() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let err = a.nodes.route_query(&ctx, b.identity(), "no-such-service").await.unwrap_err();
    assert!(matches!(err, RouteError::NotFound), "got {err:?}");
    assert!(a.nodes.sessions().is_empty());
}

#[tokio::test]
async fn stray_data_is_reset_and_stream_survives() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let session = a.nodes.route_query(&ctx, b.identity(), "echo").await.unwrap();
    let stream = session.stream();

    let mut events = b.nodes.subscribe();
    stream
        .write(&Frame::Data {
            nonce: 0xdead_beef,
            payload: Bytes::from_static(b"nobody home"),
        })
        .await
        .unwrap();

    // The live session on the same stream is untouched.
    assert_eq!(round_trip(&ctx, &session, b"still here").await, b"still here");
    assert!(!stream.is_closed());
    assert!(
        events.try_recv().is_err(),
        "b changed its stream table over a stray frame"
    );
}

#[tokio::test]
async fn closing_the_stream_closes_its_sessions() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let session = a.nodes.route_query(&ctx, b.identity(), "echo").await.unwrap();
    // `b` knows no endpoint for `a`, so this rides the inbound stream.
    let remote = b.nodes.route_query(&ctx, a.identity(), "echo").await.unwrap();
    assert!(!remote.stream().outbound());

    assert!(a.nodes.close_stream(session.stream().id()));
    assert!(!a.nodes.close_stream(session.stream().id()), "second close is a no-op");

    session.wait_closed().await;
    assert_eq!(session.reason(), Some(SessionError::Stream(StreamError::Closed)));
    tokio::time::timeout(Duration::from_secs(1), remote.wait_closed())
        .await
        .expect("remote session outlived its stream");

    let mut buf = [0u8; 8];
    assert!(session.read(&ctx, &mut buf).await.is_err());
}

#[tokio::test]
async fn ping_and_check_on_live_stream() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let stream = a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    let rtt = a.nodes.ping_stream(stream.id()).await.expect("stream known").unwrap();
    assert!(rtt < Duration::from_secs(1));
    assert!(a.nodes.check_stream(stream.id()));
    assert!(a.nodes.ping_stream(9_999).await.is_none());
    assert!(!a.nodes.check_stream(9_999));

    let streams = a.nodes.streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].id, stream.id());
}
