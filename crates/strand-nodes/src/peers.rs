//! Peer router: the stream and session tables, and per-stream frame dispatch.
//!
//! Every admitted stream gets one dispatch task that drains its frame queue
//! and routes each frame by nonce. Outbound queries are raced on every
//! stream open to the target; the first response wins.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};

use strand_core::config::LinkConfig;
use strand_core::wire::{Frame, CODE_ACCEPTED};
use strand_core::{new_nonce, Context, Endpoint, Identity, Nonce};

use crate::error::{RouteError, SessionError, StreamError};
use crate::events::{EventSender, NodeEvent};
use crate::exonet::AuthConn;
use crate::relay::RelayTable;
use crate::router::{Query, QueryRouter};
use crate::session::{Session, SessionState};
use crate::stream::{Stream, StreamId, StreamOptions};

/// Query a peer answers by recording the endpoint it was reached on.
pub const REFLECT_QUERY: &str = ".reflect";

pub type StreamTable = Arc<DashMap<StreamId, Arc<Stream>>>;
pub type SessionTable = Arc<DashMap<Nonce, Arc<Session>>>;

struct Answer {
    stream: Arc<Stream>,
    code: u8,
    buffer: u32,
}

pub struct Peers {
    local: Identity,
    streams: StreamTable,
    sessions: SessionTable,
    /// Outbound queries waiting for their first response.
    answers: DashMap<Nonce, oneshot::Sender<Answer>>,
    relays: RelayTable,
    router: Arc<dyn QueryRouter>,
    events: EventSender,
    observed: Mutex<Vec<Endpoint>>,
    stream_opts: StreamOptions,
    rsize: usize,
    /// Lifetime of the module; inbound queries are routed under it.
    root: Context,
}

impl Peers {
    pub fn new(
        local: Identity,
        router: Arc<dyn QueryRouter>,
        events: EventSender,
        config: &LinkConfig,
        root: Context,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            streams: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            answers: DashMap::new(),
            relays: RelayTable::new(),
            router,
            events,
            observed: Mutex::new(Vec::new()),
            stream_opts: StreamOptions::from(config),
            rsize: config.session_buffer as usize,
            root,
        })
    }

    pub fn local_identity(&self) -> Identity {
        self.local
    }

    pub fn relays(&self) -> &RelayTable {
        &self.relays
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    /// Admit an authenticated connection as a stream and start routing it.
    pub fn add_stream(self: &Arc<Self>, conn: AuthConn) -> Arc<Stream> {
        let (stream, rx) = Stream::spawn(conn, self.stream_opts.clone());
        self.streams.insert(stream.id(), stream.clone());

        let remote = stream.remote_identity();
        let siblings = self.streams_to(&remote).len();
        tracing::info!(
            stream = stream.id(),
            remote = %remote.short(),
            outbound = stream.outbound(),
            network = stream.network(),
            siblings,
            "stream added"
        );
        let _ = self.events.send(NodeEvent::StreamCreated {
            stream: stream.id(),
            remote,
            outbound: stream.outbound(),
            siblings,
        });
        if siblings == 1 {
            let _ = self.events.send(NodeEvent::Linked { remote });
        }

        tokio::spawn(self.clone().dispatch(stream.clone(), rx));

        if !stream.outbound() {
            if let Some(endpoint) = stream.remote_endpoint().cloned() {
                tokio::spawn(self.clone().reflect(stream.clone(), endpoint));
            }
        }
        stream
    }

    async fn dispatch(self: Arc<Self>, stream: Arc<Stream>, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            self.handle_frame(&stream, frame).await;
        }
        self.remove_stream(&stream);
    }

    fn remove_stream(&self, stream: &Arc<Stream>) {
        let id = stream.id();
        if self.streams.remove(&id).is_none() {
            return;
        }
        let err = stream.err().unwrap_or(StreamError::Closed);
        let remote = stream.remote_identity();

        let mut closed = 0;
        for session in self.sessions_snapshot() {
            if session.stream_closed(id, &err) {
                closed += 1;
            }
        }

        tracing::info!(stream = id, remote = %remote.short(), error = %err, sessions = closed, "stream removed");
        let _ = self.events.send(NodeEvent::StreamClosed {
            stream: id,
            remote,
            error: err,
        });
        if self.streams_to(&remote).is_empty() {
            let _ = self.events.send(NodeEvent::Unlinked { remote });
        }
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.iter().map(|e| e.value().clone()).collect()
    }

    /// Live streams to `remote`.
    pub fn streams_to(&self, remote: &Identity) -> Vec<Arc<Stream>> {
        self.streams
            .iter()
            .filter(|e| e.remote_identity() == *remote && !e.is_closed())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn find_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.get(&id).map(|e| e.value().clone())
    }

    /// Sessions currently bound to stream `id`.
    pub fn sessions_on(&self, id: StreamId) -> usize {
        self.sessions.iter().filter(|s| s.stream().id() == id).count()
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_snapshot()
    }

    pub fn find_session(&self, nonce: Nonce) -> Option<Arc<Session>> {
        self.sessions.get(&nonce).map(|e| e.value().clone())
    }

    /// Session `nonce`, if it belongs to the peer behind `stream`.
    fn session_for(&self, stream: &Stream, nonce: Nonce) -> Option<Arc<Session>> {
        self.find_session(nonce)
            .filter(|s| s.remote_identity() == stream.remote_identity() && s.state() != SessionState::Closed)
    }

    /// Drop the table entry once the session closes.
    fn track_session(&self, session: &Arc<Session>) {
        let sessions = self.sessions.clone();
        let session = session.clone();
        tokio::spawn(async move {
            session.wait_closed().await;
            sessions.remove_if(&session.nonce(), |_, s| Arc::ptr_eq(s, &session));
        });
    }

    /// Drop a query that never opened from both tables at once, so no
    /// caller sees it listed after the error returns.
    fn forget_query(&self, session: &Arc<Session>) {
        let nonce = session.nonce();
        self.answers.remove(&nonce);
        self.sessions.remove_if(&nonce, |_, s| Arc::ptr_eq(s, session));
    }

    /// Open a session to `target` over the streams already linked to it.
    pub async fn route_query(
        &self,
        ctx: &Context,
        target: Identity,
        query: &str,
    ) -> Result<Arc<Session>, RouteError> {
        let streams = self.streams_to(&target);
        self.query_on(ctx, &streams, target, query).await
    }

    async fn query_on(
        &self,
        ctx: &Context,
        streams: &[Arc<Stream>],
        target: Identity,
        query: &str,
    ) -> Result<Arc<Session>, RouteError> {
        let Some(first) = streams.first() else {
            return Err(RouteError::Stream(StreamError::Closed));
        };
        let nonce = new_nonce();
        let session = Arc::new(Session::new(nonce, true, query, target, first.clone(), self.rsize));
        let (tx, rx) = oneshot::channel();
        self.answers.insert(nonce, tx);
        self.sessions.insert(nonce, session.clone());
        self.track_session(&session);

        let frame = Frame::Query {
            nonce,
            query: query.to_string(),
            buffer: self.rsize as u32,
        };
        let mut last_err = None;
        let mut sent = 0;
        for stream in streams {
            match stream.write(&frame).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::debug!(stream = stream.id(), error = %e, "query not sent");
                    last_err = Some(e);
                }
            }
        }
        if sent == 0 {
            session.force_close(SessionError::Closed);
            self.forget_query(&session);
            return Err(RouteError::Stream(last_err.unwrap_or(StreamError::Closed)));
        }

        let answer = ctx
            .run(async {
                tokio::select! {
                    answer = rx => answer.ok(),
                    _ = session.wait_closed() => None,
                }
            })
            .await;

        let answer = match answer {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                self.forget_query(&session);
                let err = session.reason().unwrap_or(SessionError::Closed);
                return Err(match err {
                    SessionError::Stream(e) => RouteError::Stream(e),
                    other => RouteError::Internal(other.to_string()),
                });
            }
            Err(e) => {
                session.force_close(SessionError::Context(e));
                self.forget_query(&session);
                return Err(e.into());
            }
        };

        if answer.code != CODE_ACCEPTED {
            session.force_close(SessionError::Closed);
            self.forget_query(&session);
            return Err(RouteError::from_code(answer.code));
        }
        if let Err(e) = session.accept(answer.stream.clone(), answer.buffer) {
            self.forget_query(&session);
            self.reset(&answer.stream, nonce).await;
            return Err(RouteError::Internal(e.to_string()));
        }
        session.flush_credit().await;
        tracing::debug!(nonce = format_args!("{nonce:016x}"), target = %target.short(), query, "session open");
        Ok(session)
    }

    // ── Frame handling ────────────────────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, stream: &Arc<Stream>, frame: Frame) {
        match frame {
            Frame::Ping { nonce, pong } => {
                if let Err(e) = stream.handle_ping(nonce, pong).await {
                    tracing::debug!(stream = stream.id(), error = %e, "ping reply failed");
                }
            }
            Frame::Query { nonce, query, buffer } => {
                tokio::spawn(self.clone().handle_query(stream.clone(), nonce, query, buffer));
            }
            Frame::Response { nonce, code, buffer } => {
                self.handle_response(stream, nonce, code, buffer).await;
            }
            Frame::Data { nonce, payload } => {
                self.handle_data(stream, nonce, payload).await;
            }
            Frame::Read { nonce, len } => match self.session_for(stream, nonce) {
                Some(session) => session.add_credit(len),
                None => self.reset(stream, nonce).await,
            },
            Frame::Reset { nonce } => {
                if let Some(session) = self.session_for(stream, nonce) {
                    if session.is_carried_by(stream.id()) {
                        session.force_close(SessionError::Closed);
                    }
                }
            }
            Frame::Migrate { nonce } => match self.session_for(stream, nonce) {
                Some(session) => session.handle_marker(stream.id()),
                None => tracing::debug!(stream = stream.id(), nonce = format_args!("{nonce:016x}"), "marker for unknown session"),
            },
        }
    }

    async fn handle_query(self: Arc<Self>, stream: Arc<Stream>, nonce: Nonce, query: String, buffer: u32) {
        let remote = stream.remote_identity();
        let session = Arc::new(Session::new(nonce, false, query.clone(), remote, stream.clone(), self.rsize));
        match self.sessions.entry(nonce) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(stream = stream.id(), nonce = format_args!("{nonce:016x}"), "duplicate query ignored");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }
        self.track_session(&session);

        let (caller, target) = match self.relays.take(nonce) {
            Some(relay) => (relay.caller, relay.target),
            None => (remote, self.local),
        };
        let q = Query {
            nonce,
            caller,
            target,
            query,
            stream: stream.id(),
        };

        let routed = if q.name() == REFLECT_QUERY {
            self.handle_reflect(&q, remote)
        } else {
            self.router.route_query(&self.root, &q, session.clone()).await
        };

        match routed {
            Ok(()) => {
                let response = Frame::Response {
                    nonce,
                    code: CODE_ACCEPTED,
                    buffer: self.rsize as u32,
                };
                if let Err(e) = session.answer(stream.clone(), buffer, &response).await {
                    tracing::debug!(nonce = format_args!("{nonce:016x}"), error = %e, "session closed before opening");
                    self.sessions.remove_if(&nonce, |_, s| Arc::ptr_eq(s, &session));
                }
            }
            Err(e) => {
                tracing::debug!(query = %q.query, caller = %caller.short(), error = %e, "query refused");
                session.force_close(SessionError::Closed);
                self.sessions.remove_if(&nonce, |_, s| Arc::ptr_eq(s, &session));
                let response = Frame::Response {
                    nonce,
                    code: e.code(),
                    buffer: 0,
                };
                let _ = stream.write(&response).await;
            }
        }
    }

    async fn handle_response(&self, stream: &Arc<Stream>, nonce: Nonce, code: u8, buffer: u32) {
        let pending = self
            .find_session(nonce)
            .filter(|s| s.outbound() && s.remote_identity() == stream.remote_identity());
        if pending.is_some() {
            if let Some((_, tx)) = self.answers.remove(&nonce) {
                let _ = tx.send(Answer {
                    stream: stream.clone(),
                    code,
                    buffer,
                });
                return;
            }
        }
        if code != CODE_ACCEPTED {
            return;
        }
        // A second accept, or an accept for a query we gave up on.
        let bound = pending.is_some_and(|s| s.is_carried_by(stream.id()));
        if !bound {
            tracing::debug!(stream = stream.id(), nonce = format_args!("{nonce:016x}"), "rejecting excess accept");
            self.reset(stream, nonce).await;
        }
    }

    async fn handle_data(&self, stream: &Arc<Stream>, nonce: Nonce, payload: Bytes) {
        let Some(session) = self.session_for(stream, nonce) else {
            tracing::debug!(stream = stream.id(), nonce = format_args!("{nonce:016x}"), "data for unknown session");
            self.reset(stream, nonce).await;
            return;
        };
        if let Err(e) = session.push_read(stream.id(), payload) {
            tracing::warn!(stream = stream.id(), nonce = format_args!("{nonce:016x}"), error = %e, "closing session");
            session.force_close(e);
            self.reset(stream, nonce).await;
        }
    }

    async fn reset(&self, stream: &Stream, nonce: Nonce) {
        if let Err(e) = stream.write(&Frame::Reset { nonce }).await {
            tracing::debug!(stream = stream.id(), error = %e, "reset not sent");
        }
    }

    // ── Reflection ────────────────────────────────────────────────────────────

    /// Tell the peer behind a fresh inbound stream where we see it.
    async fn reflect(self: Arc<Self>, stream: Arc<Stream>, endpoint: Endpoint) {
        let query = format!(
            "{REFLECT_QUERY}?net={}&addr={}",
            endpoint.network(),
            endpoint.address()
        );
        let (ctx, _cancel) = self.root.with_timeout(self.stream_opts.ping_timeout);
        let target = stream.remote_identity();
        match self.query_on(&ctx, &[stream], target, &query).await {
            Ok(session) => {
                let _ = session.close().await;
            }
            Err(e) => tracing::debug!(remote = %target.short(), error = %e, "reflection failed"),
        }
    }

    fn handle_reflect(&self, query: &Query, by: Identity) -> Result<(), RouteError> {
        let (Some(net), Some(addr)) = (query.param("net"), query.param("addr")) else {
            return Err(RouteError::Rejected);
        };
        let endpoint = Endpoint::new(net, addr);
        {
            let mut observed = self.observed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !observed.contains(&endpoint) {
                observed.push(endpoint.clone());
            }
        }
        tracing::info!(endpoint = %endpoint, by = %by.short(), "observed endpoint");
        let _ = self.events.send(NodeEvent::ObservedEndpoint { endpoint, by });
        Ok(())
    }

    pub fn observed_endpoints(&self) -> Vec<Endpoint> {
        self.observed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Close every stream. Sessions follow their streams.
    pub fn shutdown(&self) {
        for stream in self.streams() {
            stream.close_with_error(StreamError::Shutdown);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
