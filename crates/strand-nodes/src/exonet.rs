//! Transport boundary: raw connections and the dialer that produces them.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use strand_core::{Context, Endpoint, Identity};

use crate::error::DialError;

/// Any reliable, ordered byte stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// A connection before authentication.
pub struct RawConn {
    pub io: BoxIo,
    pub outbound: bool,
    pub local_endpoint: Option<Endpoint>,
    pub remote_endpoint: Option<Endpoint>,
}

impl RawConn {
    pub fn outbound(io: impl Io, remote_endpoint: Endpoint) -> Self {
        Self {
            io: Box::new(io),
            outbound: true,
            local_endpoint: None,
            remote_endpoint: Some(remote_endpoint),
        }
    }

    pub fn inbound(io: impl Io, remote_endpoint: Option<Endpoint>) -> Self {
        Self {
            io: Box::new(io),
            outbound: false,
            local_endpoint: None,
            remote_endpoint,
        }
    }
}

impl fmt::Debug for RawConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConn")
            .field("outbound", &self.outbound)
            .field("local_endpoint", &self.local_endpoint)
            .field("remote_endpoint", &self.remote_endpoint)
            .finish()
    }
}

/// An authenticated, encrypted connection ready to become a stream.
pub struct AuthConn {
    pub io: BoxIo,
    pub outbound: bool,
    pub local_identity: Identity,
    pub remote_identity: Identity,
    pub local_endpoint: Option<Endpoint>,
    pub remote_endpoint: Option<Endpoint>,
}

impl fmt::Debug for AuthConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConn")
            .field("outbound", &self.outbound)
            .field("remote_identity", &self.remote_identity)
            .field("remote_endpoint", &self.remote_endpoint)
            .finish()
    }
}

/// Dials endpoints on one or more networks.
#[async_trait]
pub trait Exonet: Send + Sync {
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<RawConn, DialError>;
}
