//! Cryptographic primitives for Strand.
//!
//! Keypairs are managed via x25519-dalek for explicit key control; the
//! public half is the node's [`Identity`]. snow drives the Noise_XX state
//! machine that authenticates a link, after which [`LinkCipher`] seals and
//! opens transport records in each direction.
//!
//! Private key material is wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::sync::Arc;

use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::identity::Identity;

/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message (handshake or transport record).
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// Poly1305 tag appended to every sealed record.
pub const TAG_LEN: usize = 16;

/// Largest plaintext that fits one sealed record.
pub const MAX_RECORD_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_LEN;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term static X25519 keypair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public)
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

/// Initiator side of the Noise_XX handshake.
///
/// -> e
/// <- e, ee, s, es
/// -> s, se
pub struct NoiseInitiator {
    state: HandshakeState,
}

impl NoiseInitiator {
    /// Begin a handshake. Returns the initiator and message 1.
    pub fn new(keypair: &Keypair) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_initiator()?;

        let mut msg1 = vec![0u8; MAX_NOISE_MESSAGE];
        let len = state.write_message(&[], &mut msg1)?;
        msg1.truncate(len);

        Ok((Self { state }, msg1))
    }

    /// Process message 2 and write message 3.
    ///
    /// Returns the established cipher, message 3 and the responder's identity.
    pub fn finish(mut self, msg2: &[u8]) -> Result<(LinkCipher, Vec<u8>, Identity), CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        self.state.read_message(msg2, &mut payload)?;

        let remote = remote_identity(&self.state)?;

        let mut msg3 = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.write_message(&[], &mut msg3)?;
        msg3.truncate(len);

        let transport = self.state.into_stateless_transport_mode()?;
        Ok((LinkCipher::new(transport), msg3, remote))
    }
}

/// Responder side of the Noise_XX handshake.
pub struct NoiseResponder {
    state: HandshakeState,
}

impl NoiseResponder {
    pub fn new(keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_responder()?;
        Ok(Self { state })
    }

    /// Process message 1 and write message 2.
    pub fn respond(mut self, msg1: &[u8]) -> Result<(ResponderPending, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg1.len()];
        self.state.read_message(msg1, &mut payload)?;

        let mut msg2 = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.write_message(&[], &mut msg2)?;
        msg2.truncate(len);

        Ok((ResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3 from the initiator.
pub struct ResponderPending {
    state: HandshakeState,
}

impl ResponderPending {
    /// Read message 3 and complete the handshake.
    pub fn finish(mut self, msg3: &[u8]) -> Result<(LinkCipher, Identity), CryptoError> {
        let mut payload = vec![0u8; msg3.len()];
        self.state.read_message(msg3, &mut payload)?;

        let remote = remote_identity(&self.state)?;
        let transport = self.state.into_stateless_transport_mode()?;
        Ok((LinkCipher::new(transport), remote))
    }
}

fn remote_identity(state: &HandshakeState) -> Result<Identity, CryptoError> {
    let key = state.get_remote_static().ok_or(CryptoError::MissingRemoteKey)?;
    Identity::from_slice(key).map_err(|_| CryptoError::MissingRemoteKey)
}

// ── Link Cipher ───────────────────────────────────────────────────────────────

/// An established Noise transport, split into one sealer and one opener.
///
/// The link is a reliable ordered byte stream, so each direction uses an
/// implicit counter nonce instead of carrying one on the wire.
pub struct LinkCipher {
    transport: Arc<StatelessTransportState>,
}

impl LinkCipher {
    fn new(transport: StatelessTransportState) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub fn split(self) -> (Sealer, Opener) {
        (
            Sealer {
                transport: self.transport.clone(),
                nonce: 0,
            },
            Opener {
                transport: self.transport,
                nonce: 0,
            },
        )
    }
}

/// Outbound half of a [`LinkCipher`].
pub struct Sealer {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
}

impl Sealer {
    /// Encrypt one record. `plaintext` must not exceed [`MAX_RECORD_PLAINTEXT`].
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_RECORD_PLAINTEXT {
            return Err(CryptoError::RecordTooLarge(plaintext.len()));
        }
        let mut out = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self.transport.write_message(self.nonce, plaintext, &mut out)?;
        out.truncate(len);
        self.nonce += 1;
        Ok(out)
    }
}

/// Inbound half of a [`LinkCipher`].
pub struct Opener {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
}

impl Opener {
    /// Decrypt the next record in sequence.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let mut out = vec![0u8; ciphertext.len()];
        let len = self.transport.read_message(self.nonce, ciphertext, &mut out)?;
        out.truncate(len);
        self.nonce += 1;
        Ok(out)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake finished without a remote static key")]
    MissingRemoteKey,

    #[error("record plaintext of {0} bytes is too large")]
    RecordTooLarge(usize),

    #[error("ciphertext too short (need at least 16 bytes for the MAC)")]
    TooShort,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
