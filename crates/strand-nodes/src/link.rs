//! Turning raw connections into registered streams, and the shared
//! environment link strategies dial through.

use std::sync::Arc;

use strand_core::config::LinkConfig;
use strand_core::{Context, Endpoint, Identity};

use crate::error::{LinkError, StreamError};
use crate::exonet::{Exonet, RawConn};
use crate::features;
use crate::handshake::Handshake;
use crate::peers::Peers;
use crate::resolve::Resolvers;
use crate::stream::Stream;
use crate::watchers::StreamWatchers;

pub struct LinkEnv {
    pub peers: Arc<Peers>,
    pub exonet: Arc<dyn Exonet>,
    pub handshake: Arc<dyn Handshake>,
    pub resolvers: Arc<Resolvers>,
    pub watchers: Arc<StreamWatchers>,
    pub config: LinkConfig,
    /// Lives as long as the module. Background link work runs under it.
    pub root: Context,
}

impl LinkEnv {
    pub fn local_identity(&self) -> Identity {
        self.peers.local_identity()
    }

    /// Authenticate an outbound connection to `target` and admit it.
    pub async fn establish_outbound_link(
        &self,
        ctx: &Context,
        target: Identity,
        conn: RawConn,
    ) -> Result<Arc<Stream>, LinkError> {
        if target == self.local_identity() {
            return Err(LinkError::SelfLink);
        }
        let mut auth = self.handshake.outbound(ctx, conn, &target).await?;
        ctx.run(features::select(&mut auth.io)).await??;
        Ok(self.peers.add_stream(auth))
    }

    /// Authenticate an inbound connection and admit it. Callers waiting for
    /// a stream to this peer are handed the new one.
    pub async fn accept_inbound_link(&self, ctx: &Context, conn: RawConn) -> Result<Arc<Stream>, LinkError> {
        let mut auth = self.handshake.inbound(ctx, conn).await?;
        if auth.remote_identity == self.local_identity() {
            return Err(LinkError::SelfLink);
        }
        ctx.run(features::offer(&mut auth.io)).await??;
        let stream = self.peers.add_stream(auth);
        self.watchers.notify(&stream, None);
        Ok(stream)
    }

    /// Endpoints of `target` on one network.
    pub async fn resolve_network(
        &self,
        ctx: &Context,
        target: &Identity,
        network: &str,
    ) -> Result<Vec<Endpoint>, LinkError> {
        let mut endpoints = self.resolvers.resolve(ctx, target).await?;
        endpoints.retain(|e| e.network() == network);
        Ok(endpoints)
    }

    /// Dial one endpoint and link over it. Failures are logged, not returned:
    /// strategies only care whether a stream came out.
    pub async fn try_endpoint(&self, ctx: &Context, target: Identity, endpoint: &Endpoint) -> Option<Arc<Stream>> {
        let conn = match self.exonet.dial(ctx, endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(target = %target.short(), endpoint = %endpoint, error = %e, "dial failed");
                return None;
            }
        };
        match self.establish_outbound_link(ctx, target, conn).await {
            Ok(stream) => {
                tracing::info!(target = %target.short(), endpoint = %endpoint, stream = stream.id(), "linked");
                Some(stream)
            }
            Err(e) => {
                tracing::debug!(target = %target.short(), endpoint = %endpoint, error = %e, "link failed");
                None
            }
        }
    }

    /// Hand a produced stream to whoever is waiting; nobody waiting makes it
    /// excess.
    pub fn deliver(&self, stream: Arc<Stream>, strategy: &str) -> bool {
        if self.watchers.notify(&stream, Some(strategy)) {
            return true;
        }
        tracing::debug!(stream = stream.id(), strategy, "unclaimed stream");
        stream.close_with_error(StreamError::Excess);
        false
    }
}
