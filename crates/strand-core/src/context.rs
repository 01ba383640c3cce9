//! Cancellable, hierarchical operation contexts.
//!
//! Every blocking operation in Strand takes a [`Context`]. A context is done
//! once it, or any of its ancestors, is cancelled or passes its deadline.
//! Children never outlive their parent's cancellation, but cancelling a child
//! leaves the parent untouched.
//!
//! Deriving a context returns a [`CancelHandle`] that cancels the child when
//! dropped, so scoped work is released on every exit path.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{select_all, BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

struct Scope {
    cancelled: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    fn new(deadline: Option<Instant>, parent: Option<Arc<Scope>>) -> Arc<Self> {
        let (cancelled, _) = watch::channel(false);
        Arc::new(Self {
            cancelled,
            deadline,
            parent,
        })
    }

    fn ancestry(self: &Arc<Self>) -> impl Iterator<Item = &Arc<Scope>> {
        std::iter::successors(Some(self), |s| s.parent.as_ref())
    }
}

#[derive(Clone)]
pub struct Context {
    scope: Arc<Scope>,
}

impl Context {
    /// A root context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self {
            scope: Scope::new(None, None),
        }
    }

    /// A child that can be cancelled independently.
    pub fn child(&self) -> (Context, CancelHandle) {
        self.derive(None)
    }

    /// A child that is done after `timeout` at the latest.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.derive(Some(Instant::now() + timeout))
    }

    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let ctx = Context {
            scope: Scope::new(deadline, Some(self.scope.clone())),
        };
        let handle = CancelHandle { ctx: ctx.clone() };
        (ctx, handle)
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.scope.cancelled.send_replace(true);
    }

    /// The earliest deadline along the ancestry, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.scope.ancestry().filter_map(|s| s.deadline).min()
    }

    /// Non-blocking check.
    pub fn err(&self) -> Option<ContextError> {
        let now = Instant::now();
        for scope in self.scope.ancestry() {
            if *scope.cancelled.borrow() {
                return Some(ContextError::Cancelled);
            }
            if scope.deadline.is_some_and(|d| now >= d) {
                return Some(ContextError::DeadlineExceeded);
            }
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is done, with the reason.
    pub async fn done(&self) -> ContextError {
        loop {
            if let Some(err) = self.err() {
                return err;
            }

            let mut waits: Vec<BoxFuture<'static, ()>> = self
                .scope
                .ancestry()
                .map(|s| {
                    let mut rx = s.cancelled.subscribe();
                    async move {
                        // An Err means the scope was dropped, which cannot
                        // happen while we hold a reference to it.
                        let _ = rx.wait_for(|c| *c).await;
                    }
                    .boxed()
                })
                .collect();
            if let Some(deadline) = self.deadline() {
                waits.push(tokio::time::sleep_until(deadline).boxed());
            }

            select_all(waits).await;
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<F: std::future::Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("err", &self.err())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Cancels its context when dropped.
pub struct CancelHandle {
    ctx: Context,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
