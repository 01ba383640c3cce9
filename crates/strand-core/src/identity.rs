//! Node identities, session nonces and dialable endpoints.
//!
//! An [`Identity`] is the X25519 static public key a node authenticates
//! with. Everything that addresses a node (queries, streams, endpoint
//! records) is keyed by it.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Public-key identifier of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

impl Identity {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| IdentityError::InvalidLength(v.len()))?;
        Ok(Self(arr))
    }

    /// Construct from a raw slice, e.g. a Noise remote static key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is not valid hex")]
    InvalidHex,
    #[error("identity must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

// ── Nonce ─────────────────────────────────────────────────────────────────────

/// 64-bit value scoping frames to one session.
pub type Nonce = u64;

/// Generate a random non-zero nonce. Zero is reserved for "assign one for me".
pub fn new_nonce() -> Nonce {
    let mut rng = rand::thread_rng();
    loop {
        let n = rng.next_u64();
        if n != 0 {
            return n;
        }
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// A dialable location on some network.
///
/// `pack` is the network-specific binary form of the address; transports
/// that have no compact form use the address bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    network: String,
    address: String,
    pack: Vec<u8>,
}

impl Endpoint {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        let address = address.into();
        let pack = address.as_bytes().to_vec();
        Self {
            network: network.into(),
            address,
            pack,
        }
    }

    pub fn with_pack(network: impl Into<String>, address: impl Into<String>, pack: Vec<u8>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            pack,
        }
    }

    /// IP endpoint packed as `ip octets || port (BE)`.
    pub fn from_socket_addr(network: impl Into<String>, addr: SocketAddr) -> Self {
        let mut pack = match addr {
            SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
            SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
        };
        pack.extend_from_slice(&addr.port().to_be_bytes());
        Self {
            network: network.into(),
            address: addr.to_string(),
            pack,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pack(&self) -> &[u8] {
        &self.pack
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({self})")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
