//! The nodes module: one handle over streams, sessions, linking and
//! migration for the local node.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use strand_core::config::{LinkConfig, MigrationConfig};
use strand_core::{CancelHandle, Context, Endpoint, Identity, Nonce};

use crate::error::{LinkError, MigrationError, RouteError, StreamError};
use crate::events::{event_channel, NodeEvent};
use crate::exonet::{Exonet, RawConn};
use crate::handshake::Handshake;
use crate::link::LinkEnv;
use crate::link_pool::{LinkPool, RetrieveLinkOptions};
use crate::migrate::{MigrateRole, MigrationChannel, SessionMigrator};
use crate::peers::Peers;
use crate::resolve::{EndpointResolver, EndpointStore, Resolvers};
use crate::router::QueryRouter;
use crate::session::{Session, SessionInfo};
use crate::strategy::StrategyFactory;
use crate::stream::{Stream, StreamId, StreamInfo};
use crate::watchers::StreamWatchers;

/// Point-in-time view of the module for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct NodesStatus {
    pub identity: Identity,
    pub streams: usize,
    pub sessions: usize,
    pub linked_peers: usize,
    pub strategies: Vec<String>,
    pub observed_endpoints: Vec<String>,
}

pub struct Nodes {
    local: Identity,
    peers: Arc<Peers>,
    pool: LinkPool,
    migration: MigrationConfig,
    root: Context,
    root_cancel: CancelHandle,
}

impl Nodes {
    pub fn new(
        handshake: Arc<dyn Handshake>,
        exonet: Arc<dyn Exonet>,
        router: Arc<dyn QueryRouter>,
        link: LinkConfig,
        migration: MigrationConfig,
    ) -> Arc<Self> {
        let local = handshake.local_identity();
        let (root, root_cancel) = Context::background().child();
        let peers = Peers::new(local, router, event_channel(), &link, root.clone());
        let env = Arc::new(LinkEnv {
            peers: peers.clone(),
            exonet,
            handshake,
            resolvers: Arc::new(Resolvers::new(Arc::new(EndpointStore::new()))),
            watchers: StreamWatchers::new(),
            config: link,
            root: root.clone(),
        });
        tracing::info!(identity = %local, "nodes module started");
        Arc::new(Self {
            local,
            peers,
            pool: LinkPool::new(env),
            migration,
            root,
            root_cancel,
        })
    }

    pub fn local_identity(&self) -> Identity {
        self.local
    }

    /// Shared link environment, for building strategy factories.
    pub fn link_env(&self) -> Arc<LinkEnv> {
        self.pool.env().clone()
    }

    /// Lives until [`shutdown`](Self::shutdown).
    pub fn root_context(&self) -> &Context {
        &self.root
    }

    // ── Linking ───────────────────────────────────────────────────────────────

    pub async fn accept_inbound_link(&self, ctx: &Context, conn: RawConn) -> Result<Arc<Stream>, LinkError> {
        self.pool.env().accept_inbound_link(ctx, conn).await
    }

    pub async fn establish_outbound_link(
        &self,
        ctx: &Context,
        target: Identity,
        conn: RawConn,
    ) -> Result<Arc<Stream>, LinkError> {
        self.pool.env().establish_outbound_link(ctx, target, conn).await
    }

    pub async fn retrieve_link(
        &self,
        ctx: &Context,
        target: Identity,
        opts: RetrieveLinkOptions,
    ) -> Result<Arc<Stream>, LinkError> {
        self.pool.retrieve_link(ctx, target, opts).await
    }

    pub fn register_link_strategy(&self, network: impl Into<String>, factory: Arc<dyn StrategyFactory>) {
        self.pool.register_strategy(network, factory);
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    /// Open a session to `target`, linking first if no stream is up.
    pub async fn route_query(&self, ctx: &Context, target: Identity, query: &str) -> Result<Arc<Session>, RouteError> {
        if self.peers.streams_to(&target).is_empty() {
            self.pool
                .retrieve_link(ctx, target, RetrieveLinkOptions::default())
                .await?;
        }
        self.peers.route_query(ctx, target, query).await
    }

    /// Override caller and target of the inbound query carrying `nonce`.
    pub fn set_relay(&self, nonce: Nonce, caller: Identity, target: Identity) {
        self.peers.relays().set(nonce, caller, target);
    }

    /// Build a migrator for session `nonce` onto local stream `stream`.
    /// Run it with [`SessionMigrator::run`].
    pub fn migrate_session(
        &self,
        role: MigrateRole,
        channel: Box<dyn MigrationChannel>,
        nonce: Nonce,
        stream: StreamId,
    ) -> Result<SessionMigrator, MigrationError> {
        let session = self
            .peers
            .find_session(nonce)
            .ok_or(MigrationError::SessionNotFound(nonce))?;
        let target = self
            .peers
            .find_stream(stream)
            .ok_or(MigrationError::StreamNotFound(stream))?;
        Ok(SessionMigrator::new(role, session, target, channel, self.migration.clone()))
    }

    // ── Endpoints ─────────────────────────────────────────────────────────────

    fn resolvers(&self) -> &Arc<Resolvers> {
        &self.pool.env().resolvers
    }

    pub fn add_resolver(&self, resolver: Arc<dyn EndpointResolver>) {
        self.resolvers().add(resolver);
    }

    pub async fn resolve_endpoints(&self, ctx: &Context, identity: &Identity) -> Result<Vec<Endpoint>, LinkError> {
        self.resolvers().resolve(ctx, identity).await
    }

    pub fn add_endpoint(&self, identity: Identity, endpoint: Endpoint, ttl: Option<Duration>) {
        self.resolvers().store().add(identity, endpoint, ttl);
    }

    pub fn remove_endpoint(&self, identity: &Identity, endpoint: &Endpoint) -> bool {
        self.resolvers().store().remove(identity, endpoint)
    }

    /// How peers have told us they see us.
    pub fn observed_endpoints(&self) -> Vec<Endpoint> {
        self.peers.observed_endpoints()
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self.peers.streams().iter().map(|s| s.info()).collect();
        infos.sort_by_key(|s| s.id);
        infos
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = self.peers.sessions();
        sessions.sort_by_key(|s| s.nonce());
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn find_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.peers.find_stream(id)
    }

    pub fn find_session(&self, nonce: Nonce) -> Option<Arc<Session>> {
        self.peers.find_session(nonce)
    }

    /// Streams to `remote`, live ones only.
    pub fn streams_to(&self, remote: &Identity) -> Vec<Arc<Stream>> {
        self.peers.streams_to(remote)
    }

    /// Close stream `id`. `false` if there is no such stream or it was
    /// already closing.
    pub fn close_stream(&self, id: StreamId) -> bool {
        match self.peers.find_stream(id) {
            Some(stream) => {
                tracing::info!(stream = id, "closing stream on request");
                stream.close()
            }
            None => false,
        }
    }

    pub async fn ping_stream(&self, id: StreamId) -> Option<Result<Duration, StreamError>> {
        let stream = self.peers.find_stream(id)?;
        Some(stream.ping().await)
    }

    /// Schedule background health checks on stream `id`.
    pub fn check_stream(&self, id: StreamId) -> bool {
        match self.peers.find_stream(id) {
            Some(stream) => {
                stream.check();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> NodesStatus {
        let streams = self.peers.streams();
        let mut linked: Vec<Identity> = streams.iter().map(|s| s.remote_identity()).collect();
        linked.sort();
        linked.dedup();
        NodesStatus {
            identity: self.local,
            streams: streams.len(),
            sessions: self.peers.sessions().len(),
            linked_peers: linked.len(),
            strategies: self.pool.strategies(),
            observed_endpoints: self.observed_endpoints().iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.peers.subscribe()
    }

    /// Stop background link work and close every stream.
    pub fn shutdown(&self) {
        tracing::info!(identity = %self.local.short(), "nodes module shutting down");
        self.root_cancel.cancel();
        self.peers.shutdown();
    }
}
