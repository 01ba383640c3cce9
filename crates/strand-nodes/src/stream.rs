//! Stream: one authenticated connection carrying many sessions.
//!
//! A stream owns its transport. A dedicated reader task decodes frames and
//! publishes them on a bounded queue for the router; writes are serialized
//! behind a send lock so frames never interleave. When the stream ends the
//! reader records the terminal error, closes the queue, shuts the writer
//! and runs the close hooks, in that order and exactly once.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};

use strand_core::config::LinkConfig;
use strand_core::wire::{read_frame, Frame, WireError};
use strand_core::{new_nonce, Endpoint, Identity, Nonce};

use crate::error::StreamError;
use crate::exonet::{AuthConn, BoxIo};

pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity of the queue between the reader task and the router.
pub const FRAME_QUEUE: usize = 32;

/// Spacing of background health pings.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub ping_timeout: Duration,
    /// Pings scheduled after outbound traffic. 0 disables the auto-check.
    pub auto_check_pings: i32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(30),
            auto_check_pings: 2,
        }
    }
}

impl From<&LinkConfig> for StreamOptions {
    fn from(config: &LinkConfig) -> Self {
        Self {
            ping_timeout: config.ping_timeout(),
            auto_check_pings: config.auto_check_pings as i32,
        }
    }
}

type CloseHook = Box<dyn FnOnce(&StreamError) + Send>;

pub struct Stream {
    id: StreamId,
    me: Weak<Stream>,
    outbound: bool,
    local_identity: Identity,
    remote_identity: Identity,
    local_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,
    created_at: Instant,
    last_activity: Mutex<Instant>,

    writer: tokio::sync::Mutex<Option<WriteHalf<BoxIo>>>,
    pings: DashMap<Nonce, oneshot::Sender<()>>,
    checks: AtomicI32,

    err: Mutex<Option<StreamError>>,
    closed: watch::Sender<bool>,
    /// `None` once the hooks have run.
    hooks: Mutex<Option<Vec<CloseHook>>>,
    opts: StreamOptions,
}

impl Stream {
    /// Take ownership of `conn` and start the reader task.
    ///
    /// The returned receiver yields every inbound frame in transport order
    /// and ends exactly once, when the stream closes.
    pub fn spawn(conn: AuthConn, opts: StreamOptions) -> (Arc<Stream>, mpsc::Receiver<Frame>) {
        let (reader, writer) = tokio::io::split(conn.io);
        let (closed, _) = watch::channel(false);
        let now = Instant::now();

        let stream = Arc::new_cyclic(|me| Stream {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            outbound: conn.outbound,
            local_identity: conn.local_identity,
            remote_identity: conn.remote_identity,
            local_endpoint: conn.local_endpoint,
            remote_endpoint: conn.remote_endpoint,
            created_at: now,
            last_activity: Mutex::new(now),
            writer: tokio::sync::Mutex::new(Some(writer)),
            pings: DashMap::new(),
            checks: AtomicI32::new(0),
            err: Mutex::new(None),
            closed,
            hooks: Mutex::new(Some(Vec::new())),
            opts,
        });

        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        tokio::spawn(stream.clone().read_loop(reader, tx));
        (stream, rx)
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxIo>, tx: mpsc::Sender<Frame>) {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let mut closed = self.closed.subscribe();

        let failure = loop {
            tokio::select! {
                _ = until_closed(&mut closed) => break None,
                res = read_frame(&mut reader, &mut buf) => match res {
                    Ok(Some(frame)) => {
                        self.touch();
                        if tx.send(frame).await.is_err() {
                            break Some(StreamError::Closed);
                        }
                    }
                    Ok(None) => break Some(StreamError::RemoteClosed),
                    Err(e @ WireError::UnknownOpcode(_)) => break Some(StreamError::Protocol(e.to_string())),
                    Err(e @ WireError::PayloadTooLarge(_)) => break Some(StreamError::Protocol(e.to_string())),
                    Err(e @ WireError::InvalidQuery) => break Some(StreamError::Protocol(e.to_string())),
                    Err(e) => break Some(StreamError::Transport(e.to_string())),
                },
            }
        };

        if let Some(err) = failure {
            self.close_with_error(err);
        }
        drop(tx);
        drop(reader);
        self.teardown().await;
    }

    async fn teardown(&self) {
        let err = self.err().unwrap_or(StreamError::Closed);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // Dropping the senders fails every waiting ping.
        self.pings.clear();

        let hooks = self.lock_hooks().take().unwrap_or_default();
        for hook in hooks {
            hook(&err);
        }

        tracing::debug!(stream = self.id, remote = %self.remote_identity.short(), error = %err, "stream torn down");
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn outbound(&self) -> bool {
        self.outbound
    }

    pub fn local_identity(&self) -> Identity {
        self.local_identity
    }

    pub fn remote_identity(&self) -> Identity {
        self.remote_identity
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.local_endpoint.as_ref()
    }

    pub fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.remote_endpoint.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Network of the stream's endpoint, `"unknown"` without one.
    pub fn network(&self) -> &str {
        self.remote_endpoint
            .as_ref()
            .or(self.local_endpoint.as_ref())
            .map(Endpoint::network)
            .unwrap_or("unknown")
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    /// Write one frame. Frames from concurrent callers never interleave.
    pub async fn write(&self, frame: &Frame) -> Result<(), StreamError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let bytes = frame
            .to_bytes()
            .map_err(|e| StreamError::Protocol(e.to_string()))?;

        let mut closed = self.closed.subscribe();
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(self.err().unwrap_or(StreamError::Closed));
        };

        let res = tokio::select! {
            res = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => res,
            _ = until_closed(&mut closed) => {
                drop(guard);
                return Err(self.err().unwrap_or(StreamError::Closed));
            }
        };
        drop(guard);

        if let Err(e) = res {
            let err = StreamError::Transport(e.to_string());
            self.close_with_error(err.clone());
            return Err(err);
        }

        self.touch();
        if self.outbound && !matches!(frame, Frame::Ping { .. }) {
            self.check();
        }
        Ok(())
    }

    // ── Health ────────────────────────────────────────────────────────────────

    /// Round-trip a ping. Fails on timeout or when the stream ends.
    pub async fn ping(&self) -> Result<Duration, StreamError> {
        let nonce = new_nonce();
        let (tx, rx) = oneshot::channel();
        match self.pings.entry(nonce) {
            Entry::Occupied(_) => return Err(StreamError::Protocol("duplicate ping nonce".into())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let sent_at = Instant::now();
        if let Err(e) = self.write(&Frame::Ping { nonce, pong: false }).await {
            self.pings.remove(&nonce);
            return Err(e);
        }

        let res = tokio::time::timeout(self.opts.ping_timeout, rx).await;
        self.pings.remove(&nonce);
        match res {
            Ok(Ok(())) => Ok(sent_at.elapsed()),
            Ok(Err(_)) => Err(self.err().unwrap_or(StreamError::Closed)),
            Err(_) => Err(StreamError::PingTimeout),
        }
    }

    /// Handle an inbound ping frame: answer pings, resolve pongs.
    pub async fn handle_ping(&self, nonce: Nonce, pong: bool) -> Result<(), StreamError> {
        if pong {
            match self.pings.remove(&nonce) {
                Some((_, waiter)) => {
                    let _ = waiter.send(());
                }
                None => {
                    tracing::debug!(stream = self.id, nonce = format_args!("{nonce:016x}"), "pong for unknown ping");
                }
            }
            return Ok(());
        }
        self.write(&Frame::Ping { nonce, pong: true }).await
    }

    /// Schedule a short burst of background pings, spaced one second apart.
    ///
    /// A burst already in progress is extended instead of duplicated. A failed
    /// ping closes the stream, which catches half-open connections.
    pub fn check(&self) {
        let budget = self.opts.auto_check_pings;
        if budget <= 0 || self.checks.swap(budget, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(stream) = self.me.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            loop {
                if stream.is_closed() {
                    return;
                }
                if let Err(err) = stream.ping().await {
                    tracing::debug!(stream = stream.id, error = %err, "health check failed");
                    stream.close_with_error(err);
                    return;
                }
                tokio::time::sleep(CHECK_INTERVAL).await;
                if stream.checks.fetch_sub(1, Ordering::AcqRel) <= 1 {
                    return;
                }
            }
        });
    }

    /// Number of background pings still scheduled.
    pub fn pending_checks(&self) -> i32 {
        self.checks.load(Ordering::Acquire).max(0)
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    /// Close the stream. Only the first error is kept; returns whether this
    /// call was the one that closed it.
    pub fn close_with_error(&self, err: StreamError) -> bool {
        {
            let mut slot = self.err.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_some() {
                return false;
            }
            tracing::debug!(stream = self.id, remote = %self.remote_identity.short(), error = %err, "closing stream");
            *slot = Some(err);
        }
        self.closed.send_replace(true);
        true
    }

    pub fn close(&self) -> bool {
        self.close_with_error(StreamError::Closed)
    }

    pub fn err(&self) -> Option<StreamError> {
        self.err
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the stream is closed and return its terminal error.
    pub async fn closed(&self) -> StreamError {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
        self.err().unwrap_or(StreamError::Closed)
    }

    /// Run `hook` once the stream has been torn down. Runs immediately if it
    /// already has.
    pub fn on_close(&self, hook: impl FnOnce(&StreamError) + Send + 'static) {
        let mut hooks = self.lock_hooks();
        match hooks.as_mut() {
            Some(list) => list.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook(&self.err().unwrap_or(StreamError::Closed));
            }
        }
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, Option<Vec<CloseHook>>> {
        self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id,
            outbound: self.outbound,
            local_identity: self.local_identity,
            remote_identity: self.remote_identity,
            network: self.network().to_string(),
            remote_endpoint: self.remote_endpoint.as_ref().map(|e| e.address().to_string()),
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.last_activity().elapsed().as_secs(),
            pending_checks: self.pending_checks(),
            closed: self.err().map(|e| e.to_string()),
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_endpoint.as_ref().or(self.local_endpoint.as_ref()) {
            Some(ep) => write!(f, "{ep}"),
            None => f.write_str("stream"),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("outbound", &self.outbound)
            .field("remote", &self.remote_identity)
            .finish()
    }
}

/// Resolves once the closed flag is set. The borrow `wait_for` hands back
/// is dropped here so select arms stay `Send`.
async fn until_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

/// Point-in-time view of a stream for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub outbound: bool,
    pub local_identity: Identity,
    pub remote_identity: Identity,
    pub network: String,
    pub remote_endpoint: Option<String>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub pending_checks: i32,
    pub closed: Option<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
