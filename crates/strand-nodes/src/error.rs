//! Error types shared across the nodes module.
//!
//! Every error here is `Clone`: a stream's terminal error is handed to each
//! session, ping and close hook that observes it.

use strand_core::wire::{CODE_ACCEPTED, CODE_INTERNAL, CODE_REJECTED, CODE_ROUTE_NOT_FOUND};
use strand_core::{ContextError, Identity, Nonce};
use thiserror::Error;

use crate::migrate::MigrateSignalKind;
use crate::session::SessionState;
use crate::stream::StreamId;

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Another stream won the race for the same request.
    #[error("excess stream")]
    Excess,
    #[error("link closed")]
    Closed,
    #[error("remote closed the stream")]
    RemoteClosed,
    #[error("ping timeout")]
    PingTimeout,
    /// The peer sent something undecodable, e.g. an unknown opcode.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node shutting down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid session state: {0}")]
    InvalidState(SessionState),
    #[error("session closed")]
    Closed,
    /// The peer wrote past the window it was granted.
    #[error("read buffer overflow: {used} + {incoming} bytes exceeds {size}")]
    Overflow {
        used: usize,
        incoming: usize,
        size: usize,
    },
    /// Session data arrived on a stream that was neither carrying the
    /// session nor the one it is moving to.
    #[error("session data on unexpected stream {0}")]
    UnexpectedStream(u64),
    #[error("target stream belongs to a different identity")]
    IdentityMismatch,
    #[error("session is not migrating")]
    NotMigrating,
    #[error("migration cancelled")]
    MigrationCancelled,
    #[error("session has no stream")]
    NoStream,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("dial {endpoint}: {reason}")]
    Failed { endpoint: String, reason: String },
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("identity mismatch: expected {expected}, authenticated {actual}")]
    IdentityMismatch { expected: Identity, actual: Identity },
    #[error("noise: {0}")]
    Noise(String),
    #[error("transport: {0}")]
    Io(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Failure to produce a stream to a target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Every activated strategy finished without producing a stream.
    #[error("stream not produced")]
    StreamNotProduced,
    /// The caller's context ended first.
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("no endpoints for {0}")]
    NoEndpoints(Identity),
    #[error("resolve: {0}")]
    Resolve(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("feature negotiation: {0}")]
    Negotiation(String),
    #[error("refusing to link to self")]
    SelfLink,
}

/// Failure to open a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("query rejected")]
    Rejected,
    #[error("route not found")]
    NotFound,
    #[error("remote error code {0}")]
    Remote(u8),
    #[error("duplicate nonce {0:016x}")]
    DuplicateNonce(Nonce),
    #[error("internal: {0}")]
    Internal(String),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl RouteError {
    /// Response code sent to the caller when a local route fails.
    pub fn code(&self) -> u8 {
        match self {
            RouteError::Rejected => CODE_REJECTED,
            RouteError::NotFound => CODE_ROUTE_NOT_FOUND,
            RouteError::Remote(code) => *code,
            _ => CODE_INTERNAL,
        }
    }

    /// Error for a non-zero response code received from the peer.
    pub fn from_code(code: u8) -> Self {
        debug_assert_ne!(code, CODE_ACCEPTED);
        match code {
            CODE_REJECTED => RouteError::Rejected,
            CODE_ROUTE_NOT_FOUND => RouteError::NotFound,
            other => RouteError::Remote(other),
        }
    }
}

/// Why a session migration was abandoned. The session stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("session {0:016x} not found")]
    SessionNotFound(Nonce),
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),
    #[error("expected {expected} signal, got {got}")]
    UnexpectedSignal {
        expected: MigrateSignalKind,
        got: MigrateSignalKind,
    },
    #[error("signal for session {got:016x}, expected {expected:016x}")]
    NonceMismatch { expected: Nonce, got: Nonce },
    #[error("aborted by peer")]
    Aborted,
    #[error("signal channel closed")]
    ChannelClosed,
    #[error("signal codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_codes_survive_the_wire() {
        for err in [RouteError::Rejected, RouteError::NotFound, RouteError::Remote(9)] {
            assert_eq!(RouteError::from_code(err.code()), err);
        }
        assert_eq!(
            RouteError::Internal("boom".into()).code(),
            CODE_INTERNAL,
            "local failures map to the internal code"
        );
    }

    #[test]
    fn context_and_exhaustion_stay_distinct() {
        let timeout: LinkError = ContextError::DeadlineExceeded.into();
        assert_ne!(timeout, LinkError::StreamNotProduced);
        assert_eq!(timeout.to_string(), "context deadline exceeded");
    }
}
