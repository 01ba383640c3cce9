use std::sync::Arc;
use std::time::Duration;

use strand_core::Context;
use strand_nodes::memory::MemoryNet;
use strand_nodes::migrate::{signal_pipe, MigrationPhase};
use strand_nodes::{
    MigrateRole, MigrationError, RetrieveLinkOptions, Session, SessionChannel, SessionState, Stream,
};

use crate::*;

/// Two streams from `a` to `b`; the first carries every session opened
/// before the second is linked.
async fn two_streams(a: &TestNode, b: &TestNode, ctx: &Context) -> (Arc<Stream>, Arc<Stream>) {
    let first = a.nodes.retrieve_link(ctx, b.identity(), Default::default()).await.unwrap();
    (first, second_stream(a, b, ctx).await)
}

async fn second_stream(a: &TestNode, b: &TestNode, ctx: &Context) -> Arc<Stream> {
    let second = a
        .nodes
        .retrieve_link(ctx, b.identity(), RetrieveLinkOptions::default().force_new())
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(1), || b.nodes.streams_to(&a.identity()).len() == 2).await,
        "b never saw the second stream"
    );
    second
}

/// A stream from `node` to `peer` other than the one carrying `session`.
fn other_stream(node: &TestNode, peer: &TestNode, session: &Session) -> Arc<Stream> {
    let current = session.stream().id();
    node.nodes
        .streams_to(&peer.identity())
        .into_iter()
        .find(|s| s.id() != current)
        .expect("no spare stream")
}

fn pattern(range: std::ops::Range<usize>) -> Vec<u8> {
    range.map(|i| (i % 256) as u8).collect()
}

#[tokio::test]
async fn migration_preserves_byte_order() {
    let net = MemoryNet::new();
    let (a, mut b) = pair(&net);
    let (ctx, _cancel) = deadline(10);

    // Control and data sessions share the first stream.
    a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    let control_a = a.nodes.route_query(&ctx, b.identity(), "capture").await.unwrap();
    let control_b = b.captured().await;
    let data_a = a.nodes.route_query(&ctx, b.identity(), "capture").await.unwrap();
    let data_b = b.captured().await;
    assert_eq!(data_a.nonce(), data_b.nonce());

    let old_a = data_a.stream();
    let new_a = second_stream(&a, &b, &ctx).await;
    let new_b = other_stream(&b, &a, &data_b);
    assert_ne!(old_a.id(), new_a.id());

    data_a.write(&ctx, &pattern(0..1000)).await.unwrap();

    let mut initiator = a
        .nodes
        .migrate_session(
            MigrateRole::Initiator,
            Box::new(SessionChannel::new(control_a)),
            data_a.nonce(),
            new_a.id(),
        )
        .unwrap();
    let mut responder = b
        .nodes
        .migrate_session(
            MigrateRole::Responder,
            Box::new(SessionChannel::new(control_b)),
            data_b.nonce(),
            new_b.id(),
        )
        .unwrap();

    // Writes made while the session is migrating park and go out on the
    // new stream afterwards.
    let writer = {
        let data_a = data_a.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for chunk in pattern(1000..2000).chunks(10) {
                data_a.write(&ctx, chunk).await.unwrap();
            }
        })
    };
    let reader = {
        let data_b = data_b.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { read_exact(&ctx, &data_b, 2000).await })
    };

    let (ri, rr) = tokio::join!(initiator.run(&ctx), responder.run(&ctx));
    ri.unwrap();
    rr.unwrap();
    assert_eq!(initiator.phase(), MigrationPhase::Completed);
    assert_eq!(responder.phase(), MigrationPhase::Completed);

    writer.await.unwrap();
    assert_eq!(reader.await.unwrap(), pattern(0..2000));

    assert_eq!(data_a.state(), SessionState::Open);
    assert_eq!(data_a.stream().id(), new_a.id());
    assert_eq!(data_b.stream().id(), new_b.id());

    // The old stream can go; the session lives on the new one.
    assert!(a.nodes.close_stream(old_a.id()));
    data_a.write(&ctx, b"after").await.unwrap();
    assert_eq!(read_exact(&ctx, &data_b, 5).await, b"after");
    data_b.write(&ctx, b"reply").await.unwrap();
    assert_eq!(read_exact(&ctx, &data_a, 5).await, b"reply");
}

#[tokio::test]
async fn lost_peer_leaves_session_on_old_stream() {
    let net = MemoryNet::new();
    let (a, mut b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    a.nodes.retrieve_link(&ctx, b.identity(), Default::default()).await.unwrap();
    let data_a = a.nodes.route_query(&ctx, b.identity(), "capture").await.unwrap();
    let data_b = b.captured().await;
    let old = data_a.stream();
    let target = second_stream(&a, &b, &ctx).await;

    let (ours, theirs) = signal_pipe();
    drop(theirs);
    let mut initiator = a
        .nodes
        .migrate_session(MigrateRole::Initiator, Box::new(ours), data_a.nonce(), target.id())
        .unwrap();
    let err = initiator.run(&ctx).await.unwrap_err();
    assert!(matches!(err, MigrationError::ChannelClosed), "got {err:?}");
    assert_eq!(initiator.phase(), MigrationPhase::Failed);

    assert_eq!(data_a.state(), SessionState::Open);
    assert_eq!(data_a.stream().id(), old.id());
    data_a.write(&ctx, b"unmoved").await.unwrap();
    assert_eq!(read_exact(&ctx, &data_b, 7).await, b"unmoved");
}

#[tokio::test]
async fn migrate_session_checks_its_inputs() {
    let net = MemoryNet::new();
    let (a, b) = pair(&net);
    let (ctx, _cancel) = deadline(5);

    let (first, _second) = two_streams(&a, &b, &ctx).await;
    let session = a.nodes.route_query(&ctx, b.identity(), "echo").await.unwrap();

    let (pipe, _peer) = signal_pipe();
    let err = a
        .nodes
        .migrate_session(MigrateRole::Initiator, Box::new(pipe), 0x1234, first.id())
        .err()
        .expect("unknown session accepted");
    assert!(matches!(err, MigrationError::SessionNotFound(0x1234)));

    let (pipe, _peer) = signal_pipe();
    let err = a
        .nodes
        .migrate_session(MigrateRole::Initiator, Box::new(pipe), session.nonce(), 9_999)
        .err()
        .expect("unknown stream accepted");
    assert!(matches!(err, MigrationError::StreamNotFound(9_999)));
}
