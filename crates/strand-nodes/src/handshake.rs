//! Authentication boundary, plus the Noise_XX implementation of it.
//!
//! The Noise handshake runs over the raw byte stream as three
//! length-prefixed messages. Afterwards a pair of pump tasks translate
//! between the plaintext side handed to the stream layer and sealed
//! records on the wire:
//!
//!   record = u16 BE length || ciphertext (payload + 16-byte tag)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use strand_core::crypto::{
    Keypair, NoiseInitiator, NoiseResponder, Opener, Sealer, MAX_NOISE_MESSAGE,
};
use strand_core::{Context, Identity};

use crate::error::HandshakeError;
use crate::exonet::{AuthConn, BoxIo, RawConn};

/// Upper bound for the three handshake messages.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Plaintext read size for the seal pump.
const SEAL_CHUNK: usize = 16 * 1024;

/// Turns raw connections into authenticated ones.
#[async_trait]
pub trait Handshake: Send + Sync {
    fn local_identity(&self) -> Identity;

    /// Authenticate as initiator; fails unless the peer proves `expected`.
    async fn outbound(
        &self,
        ctx: &Context,
        conn: RawConn,
        expected: &Identity,
    ) -> Result<AuthConn, HandshakeError>;

    /// Authenticate as responder, learning the peer's identity.
    async fn inbound(&self, ctx: &Context, conn: RawConn) -> Result<AuthConn, HandshakeError>;
}

// ── Noise ─────────────────────────────────────────────────────────────────────

pub struct NoiseHandshake {
    keypair: Arc<Keypair>,
}

impl NoiseHandshake {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl Handshake for NoiseHandshake {
    fn local_identity(&self) -> Identity {
        self.keypair.identity()
    }

    async fn outbound(
        &self,
        ctx: &Context,
        conn: RawConn,
        expected: &Identity,
    ) -> Result<AuthConn, HandshakeError> {
        let (ctx, _cancel) = ctx.with_timeout(HANDSHAKE_TIMEOUT);
        let RawConn {
            mut io,
            outbound,
            local_endpoint,
            remote_endpoint,
        } = conn;

        let (cipher, remote) = ctx
            .run(async {
                let (initiator, msg1) = NoiseInitiator::new(&self.keypair).map_err(noise_err)?;
                write_message(&mut io, &msg1).await?;
                let msg2 = read_message(&mut io).await?;
                let (cipher, msg3, remote) = initiator.finish(&msg2).map_err(noise_err)?;
                if remote != *expected {
                    return Err(HandshakeError::IdentityMismatch {
                        expected: *expected,
                        actual: remote,
                    });
                }
                write_message(&mut io, &msg3).await?;
                Ok((cipher, remote))
            })
            .await??;

        tracing::debug!(remote = %remote.short(), "outbound handshake complete");
        let (sealer, opener) = cipher.split();
        Ok(AuthConn {
            io: secure(io, sealer, opener),
            outbound,
            local_identity: self.keypair.identity(),
            remote_identity: remote,
            local_endpoint,
            remote_endpoint,
        })
    }

    async fn inbound(&self, ctx: &Context, conn: RawConn) -> Result<AuthConn, HandshakeError> {
        let (ctx, _cancel) = ctx.with_timeout(HANDSHAKE_TIMEOUT);
        let RawConn {
            mut io,
            outbound,
            local_endpoint,
            remote_endpoint,
        } = conn;

        let (cipher, remote) = ctx
            .run(async {
                let responder = NoiseResponder::new(&self.keypair).map_err(noise_err)?;
                let msg1 = read_message(&mut io).await?;
                let (pending, msg2) = responder.respond(&msg1).map_err(noise_err)?;
                write_message(&mut io, &msg2).await?;
                let msg3 = read_message(&mut io).await?;
                pending.finish(&msg3).map_err(noise_err)
            })
            .await??;

        tracing::debug!(remote = %remote.short(), "inbound handshake complete");
        let (sealer, opener) = cipher.split();
        Ok(AuthConn {
            io: secure(io, sealer, opener),
            outbound,
            local_identity: self.keypair.identity(),
            remote_identity: remote,
            local_endpoint,
            remote_endpoint,
        })
    }
}

fn noise_err(e: strand_core::crypto::CryptoError) -> HandshakeError {
    HandshakeError::Noise(e.to_string())
}

fn io_err(e: std::io::Error) -> HandshakeError {
    HandshakeError::Io(e.to_string())
}

async fn write_message(io: &mut BoxIo, msg: &[u8]) -> Result<(), HandshakeError> {
    let len = u16::try_from(msg.len()).map_err(|_| HandshakeError::Noise("message too long".into()))?;
    io.write_u16(len).await.map_err(io_err)?;
    io.write_all(msg).await.map_err(io_err)?;
    io.flush().await.map_err(io_err)
}

async fn read_message(io: &mut BoxIo) -> Result<Vec<u8>, HandshakeError> {
    let len = io.read_u16().await.map_err(io_err)? as usize;
    let mut msg = vec![0u8; len.min(MAX_NOISE_MESSAGE)];
    io.read_exact(&mut msg).await.map_err(io_err)?;
    Ok(msg)
}

// ── Record pumps ──────────────────────────────────────────────────────────────

/// Wrap `io` so that everything written is sealed and everything read is
/// opened. The pumps stop when either side closes.
fn secure(io: BoxIo, sealer: Sealer, opener: Opener) -> BoxIo {
    let (app, inner) = tokio::io::duplex(2 * SEAL_CHUNK);
    let (net_read, net_write) = tokio::io::split(io);
    let (plain_read, plain_write) = tokio::io::split(inner);

    tokio::spawn(seal_pump(plain_read, net_write, sealer));
    tokio::spawn(open_pump(net_read, plain_write, opener));

    Box::new(app)
}

async fn seal_pump(mut plain: ReadHalf<DuplexStream>, mut net: WriteHalf<BoxIo>, mut sealer: Sealer) {
    let mut buf = vec![0u8; SEAL_CHUNK];
    loop {
        let n = match plain.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let record = match sealer.seal(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "failed to seal record");
                break;
            }
        };
        let sent = async {
            net.write_u16(record.len() as u16).await?;
            net.write_all(&record).await?;
            net.flush().await
        }
        .await;
        if let Err(e) = sent {
            tracing::debug!(error = %e, "seal pump stopped");
            break;
        }
    }
    let _ = net.shutdown().await;
}

async fn open_pump(mut net: ReadHalf<BoxIo>, mut plain: WriteHalf<DuplexStream>, mut opener: Opener) {
    loop {
        let len = match net.read_u16().await {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut record = vec![0u8; len];
        if net.read_exact(&mut record).await.is_err() {
            break;
        }
        let plaintext = match opener.open(&record) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "dropping link after bad record");
                break;
            }
        };
        if plain.write_all(&plaintext).await.is_err() {
            break;
        }
    }
    let _ = plain.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
