//! Session: a flow-controlled duplex byte channel multiplexed over a stream.
//!
//! State lives in an atomic and moves only by compare-and-swap:
//!
//!   Routing ──accept──▶ Open ──migrate──▶ Migrating
//!      │                 │  ◀──complete/cancel──┘
//!      └──reject──▶ Closed ◀──reset/close/teardown
//!
//! Blocking readers and writers park on a [`Notify`] and re-check their
//! predicate after every wakeup. Each side grants the other a read window;
//! `Data` frames spend it and `Read` frames hand it back as bytes are
//! consumed.
//!
//! During migration the session sends on its old stream until it writes the
//! `Migrate` marker there, then on the new one. Inbound data follows the
//! peer's marker the same way: anything that shows up on the new stream
//! first is parked and released after the marker. Only one stream may park
//! at a time; data from any other stream is a protocol violation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Notify;

use strand_core::wire::{Frame, MAX_PAYLOAD};
use strand_core::{Context, Identity, Nonce};

use crate::error::{SessionError, StreamError};
use crate::stream::{Stream, StreamId};

/// Default per-session read buffer.
pub const DEFAULT_READ_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Routing = 0,
    Open = 1,
    Migrating = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Routing,
            1 => SessionState::Open,
            2 => SessionState::Migrating,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Routing => "routing",
            SessionState::Open => "open",
            SessionState::Migrating => "migrating",
            SessionState::Closed => "closed",
        })
    }
}

struct Inner {
    rbuf: VecDeque<Bytes>,
    /// Bytes held in `rbuf` and `parked`.
    rused: usize,
    rsize: usize,
    /// Bytes the peer still lets us send.
    wsize: usize,

    /// Stream our frames go out on.
    stream: Arc<Stream>,
    /// Stream the peer's data is accepted from.
    inbound: StreamId,
    /// An outbound session is unbound until the peer's accept names the
    /// stream it answered on.
    bound: bool,
    /// Credit for bytes consumed before the session opened.
    owed: usize,

    target: Option<Arc<Stream>>,
    marker_sent: bool,
    /// Where inbound moves once the peer's marker arrives.
    next_inbound: Option<StreamId>,
    /// Peer's marker arrived before we learned its new stream.
    marker_seen: bool,
    parked: VecDeque<(StreamId, Bytes)>,

    reason: Option<SessionError>,
}

impl Inner {
    /// Stream holding parked data, if any.
    fn parked_from(&self) -> Option<StreamId> {
        self.parked.front().map(|(from, _)| *from)
    }

    /// Move inbound to `id`, releasing whatever was parked in order. Parked
    /// data only ever comes from the stream inbound moves to next.
    fn switch_inbound(&mut self, id: StreamId) {
        debug_assert!(self.parked.iter().all(|(from, _)| *from == id));
        self.inbound = id;
        self.next_inbound = None;
        self.marker_seen = false;
        for (_, data) in std::mem::take(&mut self.parked) {
            self.rbuf.push_back(data);
        }
    }
}

pub struct Session {
    nonce: Nonce,
    outbound: bool,
    query: String,
    remote_identity: Identity,
    created_at: Instant,

    state: AtomicU8,
    inner: Mutex<Inner>,
    notify: Notify,
    /// Held across every frame this session writes, so nothing can slip
    /// onto the old stream after the migration marker.
    send_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(
        nonce: Nonce,
        outbound: bool,
        query: impl Into<String>,
        remote_identity: Identity,
        stream: Arc<Stream>,
        rsize: usize,
    ) -> Self {
        Self {
            nonce,
            outbound,
            query: query.into(),
            remote_identity,
            created_at: Instant::now(),
            state: AtomicU8::new(SessionState::Routing as u8),
            inner: Mutex::new(Inner {
                rbuf: VecDeque::new(),
                rused: 0,
                rsize,
                wsize: 0,
                inbound: stream.id(),
                bound: !outbound,
                owed: 0,
                stream,
                target: None,
                marker_sent: false,
                next_inbound: None,
                marker_seen: false,
                parked: VecDeque::new(),
                reason: None,
            }),
            notify: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cas(&self, from: SessionState, to: SessionState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            tracing::trace!(nonce = format_args!("{:016x}", self.nonce), %from, %to, "session state");
            self.notify.notify_waiters();
        }
        ok
    }

    /// Park until `ready` yields a result. `ready` runs under the inner lock
    /// and is re-evaluated after every state or buffer change.
    async fn wait_until<T>(
        &self,
        ctx: &Context,
        mut ready: impl FnMut(SessionState, &mut Inner) -> Option<Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(res) = ready(self.state(), &mut inner) {
                    return res;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                err = ctx.done() => return Err(err.into()),
            }
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn outbound(&self) -> bool {
        self.outbound
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn remote_identity(&self) -> Identity {
        self.remote_identity
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The stream currently carrying our frames.
    pub fn stream(&self) -> Arc<Stream> {
        self.lock().stream.clone()
    }

    /// Whether frames for this session may legitimately arrive on `id`.
    pub fn is_carried_by(&self, id: StreamId) -> bool {
        let inner = self.lock();
        if !inner.bound {
            return inner.parked_from() == Some(id);
        }
        inner.stream.id() == id
            || inner.inbound == id
            || inner.target.as_ref().is_some_and(|t| t.id() == id)
            || inner.parked.iter().any(|(from, _)| *from == id)
    }

    /// Why the session closed, once it has.
    pub fn reason(&self) -> Option<SessionError> {
        self.lock().reason.clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// `Routing → Open`, binding the session to the stream that answered.
    /// Data that raced ahead of the accept is released if it came from
    /// the answering stream.
    pub fn accept(&self, stream: Arc<Stream>, credit: u32) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if self.state() != SessionState::Routing {
            return Err(SessionError::InvalidState(self.state()));
        }
        if let Some(from) = inner.parked_from().filter(|from| *from != stream.id()) {
            drop(inner);
            self.force_close(SessionError::UnexpectedStream(from));
            return Err(SessionError::UnexpectedStream(from));
        }
        inner.bound = true;
        inner.switch_inbound(stream.id());
        inner.stream = stream;
        inner.wsize = credit as usize;
        if !self.cas(SessionState::Routing, SessionState::Open) {
            return Err(SessionError::InvalidState(self.state()));
        }
        Ok(())
    }

    /// Accept an inbound session and write the `Response` announcing it.
    /// The send lock is held throughout so none of the session's own frames
    /// can reach the peer ahead of the accept.
    pub async fn answer(&self, stream: Arc<Stream>, credit: u32, response: &Frame) -> Result<(), SessionError> {
        let _send = self.send_lock.lock().await;
        self.accept(stream.clone(), credit)?;
        if let Err(e) = stream.write(response).await {
            self.force_close(SessionError::Stream(e.clone()));
            return Err(e.into());
        }
        let owed = std::mem::take(&mut self.lock().owed);
        if owed > 0 {
            let _ = stream.write(&Frame::Read { nonce: self.nonce, len: owed as u32 }).await;
        }
        Ok(())
    }

    /// Hand back credit for bytes read before the session opened.
    pub async fn flush_credit(&self) {
        let owed = {
            let mut inner = self.lock();
            if self.state() == SessionState::Routing {
                return;
            }
            std::mem::take(&mut inner.owed)
        };
        if owed > 0 {
            let _ = self.send(Frame::Read { nonce: self.nonce, len: owed as u32 }).await;
        }
    }

    /// Local close. Only an open session can be closed; the peer is told
    /// with a `Reset`.
    pub async fn close(&self) -> Result<(), SessionError> {
        let _send = self.send_lock.lock().await;
        if !self.cas(SessionState::Open, SessionState::Closed) {
            return Err(SessionError::InvalidState(self.state()));
        }
        let stream = {
            let mut inner = self.lock();
            inner.reason.get_or_insert(SessionError::Closed);
            inner.stream.clone()
        };
        stream
            .write(&Frame::Reset { nonce: self.nonce })
            .await
            .map_err(SessionError::from)
    }

    /// Close without telling the peer. Used for inbound `Reset`, rejected
    /// queries and stream teardown. Returns whether the session was live.
    pub fn force_close(&self, reason: SessionError) -> bool {
        let prev = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if prev == SessionState::Closed as u8 {
            return false;
        }
        {
            let mut inner = self.lock();
            inner.reason.get_or_insert(reason);
            inner.target = None;
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait for the session to leave `Routing` and `Migrating`.
    pub async fn wait_open(&self, ctx: &Context) -> Result<(), SessionError> {
        self.wait_until(ctx, |state, inner| match state {
            SessionState::Open => Some(Ok(())),
            SessionState::Closed => Some(Err(inner.reason.clone().unwrap_or(SessionError::Closed))),
            _ => None,
        })
        .await
    }

    pub async fn wait_closed(&self) {
        let ctx = Context::background();
        let _ = self
            .wait_until(&ctx, |state, _| (state == SessionState::Closed).then_some(Ok(())))
            .await;
    }

    // ── Data path ─────────────────────────────────────────────────────────────

    /// Write all of `data`, chunked to the frame limit and gated by credit.
    pub async fn write(&self, ctx: &Context, data: &[u8]) -> Result<usize, SessionError> {
        let mut written = 0;
        while written < data.len() {
            let remaining = data.len() - written;
            let n = self
                .wait_until(ctx, |state, inner| match state {
                    SessionState::Open if inner.wsize > 0 => {
                        let n = inner.wsize.min(remaining).min(MAX_PAYLOAD);
                        inner.wsize -= n;
                        Some(Ok(n))
                    }
                    SessionState::Closed => {
                        Some(Err(inner.reason.clone().unwrap_or(SessionError::Closed)))
                    }
                    _ => None,
                })
                .await?;

            let payload = Bytes::copy_from_slice(&data[written..written + n]);
            self.send(Frame::Data {
                nonce: self.nonce,
                payload,
            })
            .await?;
            written += n;
        }
        Ok(written)
    }

    /// Read up to `buf.len()` bytes. Returns 0 once the session closed
    /// cleanly and the buffer is drained.
    pub async fn read(&self, ctx: &Context, buf: &mut [u8]) -> Result<usize, SessionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self
            .wait_until(ctx, |state, inner| {
                if !inner.rbuf.is_empty() {
                    let mut n = 0;
                    while n < buf.len() {
                        let Some(front) = inner.rbuf.front_mut() else {
                            break;
                        };
                        let take = front.len().min(buf.len() - n);
                        buf[n..n + take].copy_from_slice(&front[..take]);
                        if take == front.len() {
                            inner.rbuf.pop_front();
                        } else {
                            *front = front.slice(take..);
                        }
                        n += take;
                    }
                    inner.rused -= n;
                    return Some(Ok(n));
                }
                match state {
                    SessionState::Closed => match inner.reason.clone() {
                        None | Some(SessionError::Closed) => Some(Ok(0)),
                        Some(err) => Some(Err(err)),
                    },
                    _ => None,
                }
            })
            .await?;

        // State only leaves Routing under the inner lock, so credit read
        // here is either owed until the accept or returned now.
        let credit = {
            let mut inner = self.lock();
            match self.state() {
                SessionState::Routing => {
                    inner.owed += n;
                    0
                }
                SessionState::Closed => 0,
                _ => n + std::mem::take(&mut inner.owed),
            }
        };
        if credit > 0 {
            // Best effort: a dead stream tears the session down.
            let _ = self
                .send(Frame::Read {
                    nonce: self.nonce,
                    len: credit as u32,
                })
                .await;
        }
        Ok(n)
    }

    /// Write one session frame on the current stream.
    async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        let _send = self.send_lock.lock().await;
        if self.state() == SessionState::Closed {
            return Err(self.reason().unwrap_or(SessionError::Closed));
        }
        let stream = self.stream();
        stream.write(&frame).await.map_err(SessionError::from)
    }

    /// Buffer payload received on stream `from`.
    pub fn push_read(&self, from: StreamId, data: Bytes) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.rused + data.len() > inner.rsize {
            return Err(SessionError::Overflow {
                used: inner.rused,
                incoming: data.len(),
                size: inner.rsize,
            });
        }
        if inner.bound && from == inner.inbound {
            inner.rused += data.len();
            inner.rbuf.push_back(data);
        } else if inner.bound && inner.marker_seen {
            inner.rused += data.len();
            inner.switch_inbound(from);
            inner.rbuf.push_back(data);
        } else {
            // Only the stream inbound moves to next may run ahead.
            let expected = inner.next_inbound.or(inner.parked_from());
            if expected.is_some_and(|id| id != from) {
                return Err(SessionError::UnexpectedStream(from));
            }
            inner.rused += data.len();
            inner.parked.push_back((from, data));
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Add write credit granted by a `Read` frame.
    pub fn add_credit(&self, len: u32) {
        let mut inner = self.lock();
        inner.wsize = inner.wsize.saturating_add(len as usize);
        drop(inner);
        self.notify.notify_waiters();
    }

    // ── Migration ─────────────────────────────────────────────────────────────

    /// `Open → Migrating` toward `target`. Writers park until the migration
    /// completes or is cancelled.
    pub fn migrate(&self, target: Arc<Stream>) -> Result<(), SessionError> {
        if target.remote_identity() != self.remote_identity {
            return Err(SessionError::IdentityMismatch);
        }
        if target.is_closed() {
            return Err(SessionError::Stream(target.err().unwrap_or(StreamError::Closed)));
        }
        if !self.cas(SessionState::Open, SessionState::Migrating) {
            return Err(SessionError::InvalidState(self.state()));
        }
        let mut inner = self.lock();
        if let Some(from) = inner.parked_from().filter(|from| *from != target.id()) {
            drop(inner);
            self.force_close(SessionError::UnexpectedStream(from));
            return Err(SessionError::UnexpectedStream(from));
        }
        if inner.inbound != target.id() {
            if inner.marker_seen {
                inner.switch_inbound(target.id());
            } else {
                inner.next_inbound = Some(target.id());
            }
        }
        inner.target = Some(target);
        inner.marker_sent = false;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Write the `Migrate` marker on the old stream and move our outbound
    /// side to the target. Idempotent within one migration.
    pub async fn send_marker(&self) -> Result<(), SessionError> {
        let _send = self.send_lock.lock().await;
        let (old, target) = {
            let inner = self.lock();
            if self.state() != SessionState::Migrating {
                return Err(SessionError::NotMigrating);
            }
            if inner.marker_sent {
                return Ok(());
            }
            let Some(target) = inner.target.clone() else {
                return Err(SessionError::NotMigrating);
            };
            (inner.stream.clone(), target)
        };

        old.write(&Frame::Migrate { nonce: self.nonce }).await?;

        let mut inner = self.lock();
        inner.stream = target;
        inner.marker_sent = true;
        Ok(())
    }

    /// The peer's marker has arrived on stream `from`.
    pub fn handle_marker(&self, from: StreamId) {
        let mut inner = self.lock();
        if from != inner.inbound {
            tracing::debug!(nonce = format_args!("{:016x}", self.nonce), stream = from, "migrate marker on foreign stream");
            return;
        }
        if let Some(next) = inner.next_inbound {
            inner.switch_inbound(next);
        } else if let Some(&(next, _)) = inner.parked.front() {
            inner.switch_inbound(next);
        } else {
            inner.marker_seen = true;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Whether the peer's side of the current migration has switched over.
    pub fn remote_switched(&self) -> bool {
        let inner = self.lock();
        match &inner.target {
            Some(target) => inner.inbound == target.id() || inner.marker_seen,
            None => false,
        }
    }

    /// Finish the migration: make sure the marker is out, then reopen.
    pub async fn complete_migration(&self) -> Result<(), SessionError> {
        self.send_marker().await?;
        {
            let mut inner = self.lock();
            inner.target = None;
            inner.marker_sent = false;
        }
        if !self.cas(SessionState::Migrating, SessionState::Open) {
            return Err(SessionError::InvalidState(self.state()));
        }
        tracing::debug!(nonce = format_args!("{:016x}", self.nonce), stream = self.stream().id(), "migration completed");
        Ok(())
    }

    /// Abandon the migration. Before the marker the session stays on its
    /// old stream; after it the session is already on the new one and keeps
    /// it. Inbound still follows the peer's marker either way.
    pub fn cancel_migration(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.lock();
            if self.state() != SessionState::Migrating {
                return Err(SessionError::NotMigrating);
            }
            inner.target = None;
            inner.marker_sent = false;
        }
        if !self.cas(SessionState::Migrating, SessionState::Open) {
            return Err(SessionError::InvalidState(self.state()));
        }
        Ok(())
    }

    /// React to the end of stream `id`. Returns whether the session closed.
    pub fn stream_closed(&self, id: StreamId, err: &StreamError) -> bool {
        let mut inner = self.lock();
        if inner.stream.id() == id {
            drop(inner);
            return self.force_close(SessionError::Stream(err.clone()));
        }
        if inner.target.as_ref().is_some_and(|t| t.id() == id) {
            drop(inner);
            let _ = self.cancel_migration();
            return false;
        }
        if inner.inbound == id {
            // The marker will never come; take whatever the peer moved to.
            if let Some(next) = inner.next_inbound {
                inner.switch_inbound(next);
            } else if let Some(&(next, _)) = inner.parked.front() {
                inner.switch_inbound(next);
            } else {
                inner.marker_seen = true;
            }
            drop(inner);
            self.notify.notify_waiters();
        }
        false
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            nonce: format!("{:016x}", self.nonce),
            outbound: self.outbound,
            query: self.query.clone(),
            remote_identity: self.remote_identity,
            state: self.state(),
            stream: inner.stream.id(),
            used: inner.rused,
            size: inner.rsize,
            window: inner.wsize,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("nonce", &format_args!("{:016x}", self.nonce))
            .field("outbound", &self.outbound)
            .field("query", &self.query)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub nonce: String,
    pub outbound: bool,
    pub query: String,
    pub remote_identity: Identity,
    pub state: SessionState,
    pub stream: StreamId,
    /// Buffered, unread bytes.
    pub used: usize,
    pub size: usize,
    /// Remaining write credit.
    pub window: usize,
    pub age_secs: u64,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
