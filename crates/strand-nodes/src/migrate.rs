//! Session migration: moving an open session to another stream between the
//! same two nodes without losing or reordering bytes.
//!
//! The two sides coordinate over a control channel that is not the stream
//! being migrated:
//!
//! ```text
//!   initiator                         responder
//!   Begin ──────────────────────────▶ migrate(B), marker on A
//!         ◀────────────────────────── Ready
//!   migrate(B), marker on A
//!                                     poll until the marker arrived
//!         ◀────────────────────────── Completed
//!   complete                          complete
//! ```
//!
//! A failure aborts only that migration. If it happens before our marker
//! went out the session stays on its old stream.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use strand_core::config::MigrationConfig;
use strand_core::{Context, Nonce};

use crate::error::MigrationError;
use crate::session::Session;
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrateRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrateSignalKind {
    Begin,
    Ready,
    Completed,
    Abort,
}

impl fmt::Display for MigrateSignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrateSignalKind::Begin => "begin",
            MigrateSignalKind::Ready => "ready",
            MigrateSignalKind::Completed => "completed",
            MigrateSignalKind::Abort => "abort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMigrateSignal {
    pub kind: MigrateSignalKind,
    /// Nonce of the session being migrated.
    pub nonce: Nonce,
}

impl SessionMigrateSignal {
    pub fn new(kind: MigrateSignalKind, nonce: Nonce) -> Self {
        Self { kind, nonce }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Migrating,
    WaitingAck,
    WaitingMarker,
    Completed,
    Failed,
}

/// Control channel the two migrators talk over.
#[async_trait]
pub trait MigrationChannel: Send {
    async fn send(&mut self, ctx: &Context, signal: SessionMigrateSignal) -> Result<(), MigrationError>;
    async fn recv(&mut self, ctx: &Context) -> Result<SessionMigrateSignal, MigrationError>;
}

// ── In-memory channel ─────────────────────────────────────────────────────────

/// One end of an in-process signal pipe.
pub struct SignalPipe {
    tx: mpsc::Sender<SessionMigrateSignal>,
    rx: mpsc::Receiver<SessionMigrateSignal>,
}

/// Two connected [`SignalPipe`] ends.
pub fn signal_pipe() -> (SignalPipe, SignalPipe) {
    let (a_tx, b_rx) = mpsc::channel(8);
    let (b_tx, a_rx) = mpsc::channel(8);
    (
        SignalPipe { tx: a_tx, rx: a_rx },
        SignalPipe { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl MigrationChannel for SignalPipe {
    async fn send(&mut self, ctx: &Context, signal: SessionMigrateSignal) -> Result<(), MigrationError> {
        ctx.run(self.tx.send(signal))
            .await?
            .map_err(|_| MigrationError::ChannelClosed)
    }

    async fn recv(&mut self, ctx: &Context) -> Result<SessionMigrateSignal, MigrationError> {
        ctx.run(self.rx.recv()).await?.ok_or(MigrationError::ChannelClosed)
    }
}

// ── Session-backed channel ────────────────────────────────────────────────────

/// Signals as newline-delimited JSON over a session of their own.
pub struct SessionChannel {
    session: Arc<Session>,
    buf: Vec<u8>,
}

impl SessionChannel {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl MigrationChannel for SessionChannel {
    async fn send(&mut self, ctx: &Context, signal: SessionMigrateSignal) -> Result<(), MigrationError> {
        let mut line = serde_json::to_vec(&signal).map_err(|e| MigrationError::Codec(e.to_string()))?;
        line.push(b'\n');
        self.session.write(ctx, &line).await?;
        Ok(())
    }

    async fn recv(&mut self, ctx: &Context) -> Result<SessionMigrateSignal, MigrationError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return serde_json::from_slice(&line[..pos]).map_err(|e| MigrationError::Codec(e.to_string()));
            }
            let mut chunk = [0u8; 256];
            let n = self.session.read(ctx, &mut chunk).await?;
            if n == 0 {
                return Err(MigrationError::ChannelClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

// ── Migrator ──────────────────────────────────────────────────────────────────

/// Drives one side of a migration of `session` onto `target`.
pub struct SessionMigrator {
    role: MigrateRole,
    session: Arc<Session>,
    target: Arc<Stream>,
    channel: Box<dyn MigrationChannel>,
    config: MigrationConfig,
    phase: MigrationPhase,
}

impl SessionMigrator {
    pub fn new(
        role: MigrateRole,
        session: Arc<Session>,
        target: Arc<Stream>,
        channel: Box<dyn MigrationChannel>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            role,
            session,
            target,
            channel,
            config,
            phase: MigrationPhase::Migrating,
        }
    }

    pub fn role(&self) -> MigrateRole {
        self.role
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Run to completion, bounded by the migration deadline and `ctx`.
    pub async fn run(&mut self, ctx: &Context) -> Result<(), MigrationError> {
        let (ctx, _deadline) = ctx.with_timeout(self.config.timeout());
        let nonce = self.session.nonce();
        tracing::debug!(
            nonce = format_args!("{:016x}", nonce),
            role = ?self.role,
            from = self.session.stream().id(),
            to = self.target.id(),
            "migration started"
        );

        let res = match self.role {
            MigrateRole::Initiator => self.initiate(&ctx).await,
            MigrateRole::Responder => self.respond(&ctx).await,
        };

        match res {
            Ok(()) => {
                self.phase = MigrationPhase::Completed;
                tracing::info!(
                    nonce = format_args!("{:016x}", nonce),
                    role = ?self.role,
                    stream = self.session.stream().id(),
                    "session migrated"
                );
                Ok(())
            }
            Err(e) => {
                self.phase = MigrationPhase::Failed;
                let _ = self.session.cancel_migration();
                if !matches!(e, MigrationError::Aborted | MigrationError::ChannelClosed) {
                    // Best effort; the peer may be the reason we failed.
                    let abort = SessionMigrateSignal::new(MigrateSignalKind::Abort, nonce);
                    let (actx, _cancel) = Context::background().with_timeout(self.config.poll_interval());
                    let _ = self.channel.send(&actx, abort).await;
                }
                tracing::warn!(
                    nonce = format_args!("{:016x}", nonce),
                    role = ?self.role,
                    stream = self.session.stream().id(),
                    error = %e,
                    "migration failed"
                );
                Err(e)
            }
        }
    }

    async fn initiate(&mut self, ctx: &Context) -> Result<(), MigrationError> {
        let nonce = self.session.nonce();
        self.channel
            .send(ctx, SessionMigrateSignal::new(MigrateSignalKind::Begin, nonce))
            .await?;

        self.phase = MigrationPhase::WaitingAck;
        self.expect(ctx, MigrateSignalKind::Ready).await?;
        self.session.migrate(self.target.clone())?;
        self.session.send_marker().await?;

        self.phase = MigrationPhase::WaitingMarker;
        self.expect(ctx, MigrateSignalKind::Completed).await?;
        self.session.complete_migration().await?;
        Ok(())
    }

    async fn respond(&mut self, ctx: &Context) -> Result<(), MigrationError> {
        let nonce = self.session.nonce();
        self.expect(ctx, MigrateSignalKind::Begin).await?;
        self.session.migrate(self.target.clone())?;
        self.session.send_marker().await?;
        self.channel
            .send(ctx, SessionMigrateSignal::new(MigrateSignalKind::Ready, nonce))
            .await?;

        self.phase = MigrationPhase::WaitingMarker;
        let mut tick = tokio::time::interval(self.config.poll_interval());
        while !self.session.remote_switched() {
            ctx.run(tick.tick()).await?;
        }

        self.channel
            .send(ctx, SessionMigrateSignal::new(MigrateSignalKind::Completed, nonce))
            .await?;
        self.session.complete_migration().await?;
        Ok(())
    }

    async fn expect(&mut self, ctx: &Context, kind: MigrateSignalKind) -> Result<(), MigrationError> {
        let signal = self.channel.recv(ctx).await?;
        if signal.kind == MigrateSignalKind::Abort {
            return Err(MigrationError::Aborted);
        }
        if signal.kind != kind {
            return Err(MigrationError::UnexpectedSignal {
                expected: kind,
                got: signal.kind,
            });
        }
        if signal.nonce != self.session.nonce() {
            return Err(MigrationError::NonceMismatch {
                expected: self.session.nonce(),
                got: signal.nonce,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::SessionState;
    use crate::stream::tests::{identity, stream_pair};
    use crate::stream::StreamOptions;
    use strand_core::Frame;

    fn quiet() -> StreamOptions {
        StreamOptions {
            auto_check_pings: 0,
            ..StreamOptions::default()
        }
    }

    /// Feed frames arriving on `stream` into `session`.
    fn pump(stream: Arc<Stream>, mut rx: mpsc::Receiver<Frame>, session: Arc<Session>) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Data { payload, .. } => session.push_read(stream.id(), payload).unwrap(),
                    Frame::Read { len, .. } => session.add_credit(len),
                    Frame::Reset { .. } => {
                        session.force_close(SessionError::Closed);
                    }
                    Frame::Migrate { .. } => session.handle_marker(stream.id()),
                    _ => {}
                }
            }
        });
    }

    struct Rig {
        initiator: Arc<Session>,
        responder: Arc<Session>,
        old: (Arc<Stream>, Arc<Stream>),
        new: (Arc<Stream>, Arc<Stream>),
    }

    /// One open session over stream pair A, and a second pair B ready to
    /// take it over.
    fn rig() -> Rig {
        let ((a1, a1_rx), (a2, a2_rx)) = stream_pair(quiet());
        let ((b1, b1_rx), (b2, b2_rx)) = stream_pair(quiet());
        let initiator = Arc::new(Session::new(11, true, "echo", identity(2), a1.clone(), 4096));
        let responder = Arc::new(Session::new(11, false, "echo", identity(1), a2.clone(), 4096));
        initiator.accept(a1.clone(), 4096).unwrap();
        responder.accept(a2.clone(), 4096).unwrap();
        pump(a1.clone(), a1_rx, initiator.clone());
        pump(b1.clone(), b1_rx, initiator.clone());
        pump(a2.clone(), a2_rx, responder.clone());
        pump(b2.clone(), b2_rx, responder.clone());
        Rig {
            initiator,
            responder,
            old: (a1, a2),
            new: (b1, b2),
        }
    }

    #[tokio::test]
    async fn migration_keeps_byte_order() {
        let rig = rig();
        let (ch_i, ch_r) = signal_pipe();
        let mut init = SessionMigrator::new(
            MigrateRole::Initiator,
            rig.initiator.clone(),
            rig.new.0.clone(),
            Box::new(ch_i),
            MigrationConfig::default(),
        );
        let mut resp = SessionMigrator::new(
            MigrateRole::Responder,
            rig.responder.clone(),
            rig.new.1.clone(),
            Box::new(ch_r),
            MigrationConfig::default(),
        );

        let ctx = Context::background();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        let writer = {
            let session = rig.initiator.clone();
            let data = data.clone();
            tokio::spawn(async move {
                let ctx = Context::background();
                session.write(&ctx, &data[..1000]).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                session.write(&ctx, &data[1000..]).await.unwrap();
            })
        };

        let reader = {
            let session = rig.responder.clone();
            tokio::spawn(async move {
                let ctx = Context::background();
                let mut out = Vec::new();
                let mut buf = [0u8; 300];
                while out.len() < 2000 {
                    let n = session.read(&ctx, &mut buf).await.unwrap();
                    out.extend_from_slice(&buf[..n]);
                }
                out
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (ri, rr) = tokio::join!(init.run(&ctx), resp.run(&ctx));
        ri.unwrap();
        rr.unwrap();
        writer.await.unwrap();

        assert_eq!(reader.await.unwrap(), data);
        assert_eq!(rig.initiator.stream().id(), rig.new.0.id());
        assert_eq!(rig.responder.stream().id(), rig.new.1.id());
        assert_eq!(init.phase(), MigrationPhase::Completed);
        assert_eq!(rig.initiator.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn nonce_mismatch_aborts_and_keeps_old_stream() {
        let rig = rig();
        let (ch_i, mut peer) = signal_pipe();
        let mut resp = SessionMigrator::new(
            MigrateRole::Responder,
            rig.responder.clone(),
            rig.new.1.clone(),
            Box::new(ch_i),
            MigrationConfig::default(),
        );

        let ctx = Context::background();
        peer.send(&ctx, SessionMigrateSignal::new(MigrateSignalKind::Begin, 99))
            .await
            .unwrap();
        assert_eq!(
            resp.run(&ctx).await,
            Err(MigrationError::NonceMismatch { expected: 11, got: 99 })
        );
        assert_eq!(resp.phase(), MigrationPhase::Failed);
        assert_eq!(rig.responder.state(), SessionState::Open);
        assert_eq!(rig.responder.stream().id(), rig.old.1.id());
        assert_eq!(
            peer.recv(&ctx).await.unwrap(),
            SessionMigrateSignal::new(MigrateSignalKind::Abort, 11)
        );
    }

    #[tokio::test]
    async fn wrong_signal_fails_initiator() {
        let rig = rig();
        let (ch_i, mut peer) = signal_pipe();
        let mut init = SessionMigrator::new(
            MigrateRole::Initiator,
            rig.initiator.clone(),
            rig.new.0.clone(),
            Box::new(ch_i),
            MigrationConfig::default(),
        );
        let ctx = Context::background();
        let answer = tokio::spawn(async move {
            let ctx = Context::background();
            let begin = peer.recv(&ctx).await.unwrap();
            assert_eq!(begin.kind, MigrateSignalKind::Begin);
            peer.send(&ctx, SessionMigrateSignal::new(MigrateSignalKind::Completed, begin.nonce))
                .await
                .unwrap();
            peer
        });
        assert_eq!(
            init.run(&ctx).await,
            Err(MigrationError::UnexpectedSignal {
                expected: MigrateSignalKind::Ready,
                got: MigrateSignalKind::Completed,
            })
        );
        drop(answer.await.unwrap());
        assert_eq!(rig.initiator.stream().id(), rig.old.0.id());
    }

    #[tokio::test]
    async fn silent_peer_hits_deadline() {
        let rig = rig();
        let (ch_i, _peer) = signal_pipe();
        let config = MigrationConfig {
            timeout_secs: 0,
            ..MigrationConfig::default()
        };
        let mut init = SessionMigrator::new(
            MigrateRole::Initiator,
            rig.initiator.clone(),
            rig.new.0.clone(),
            Box::new(ch_i),
            config,
        );
        let res = init.run(&Context::background()).await;
        assert!(matches!(res, Err(MigrationError::Context(_))), "{res:?}");
        assert_eq!(rig.initiator.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn signals_cross_a_session() {
        let ((a, a_rx), (b, b_rx)) = stream_pair(quiet());
        let sa = Arc::new(Session::new(5, true, "migrate", identity(2), a.clone(), 1024));
        let sb = Arc::new(Session::new(5, false, "migrate", identity(1), b.clone(), 1024));
        sa.accept(a.clone(), 1024).unwrap();
        sb.accept(b.clone(), 1024).unwrap();
        pump(a, a_rx, sa.clone());
        pump(b, b_rx, sb.clone());

        let ctx = Context::background();
        let mut tx = SessionChannel::new(sa);
        let mut rx = SessionChannel::new(sb);
        tx.send(&ctx, SessionMigrateSignal::new(MigrateSignalKind::Begin, 1)).await.unwrap();
        tx.send(&ctx, SessionMigrateSignal::new(MigrateSignalKind::Ready, 1)).await.unwrap();
        assert_eq!(rx.recv(&ctx).await.unwrap().kind, MigrateSignalKind::Begin);
        assert_eq!(rx.recv(&ctx).await.unwrap().kind, MigrateSignalKind::Ready);
    }
}
