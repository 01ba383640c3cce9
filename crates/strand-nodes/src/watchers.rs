//! Stream watchers: how a freshly linked stream finds the caller waiting
//! for it.
//!
//! A watcher is a predicate plus a one-slot mailbox. Strategies and the
//! inbound path offer every new stream to all watchers; a full mailbox means
//! that caller is already served. A strategy stream left unread in the
//! mailbox of a caller that gave up is closed as excess once no other caller
//! holds it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::stream::Stream;

type Matcher = Box<dyn Fn(&Stream, Option<&str>) -> bool + Send + Sync>;

/// A stream handed to one watcher. `holders` counts the watchers it went to
/// and is absent for inbound streams, which are never ours to close.
struct Claim {
    stream: Arc<Stream>,
    holders: Option<Arc<AtomicUsize>>,
}

struct Watcher {
    matcher: Matcher,
    tx: mpsc::Sender<Claim>,
}

#[derive(Default)]
pub struct StreamWatchers {
    next_id: AtomicU64,
    set: DashMap<u64, Arc<Watcher>>,
}

impl StreamWatchers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Watch for streams accepted by `matcher`, which sees the stream and the
    /// name of the strategy that produced it (`None` for inbound streams).
    pub fn subscribe(
        self: &Arc<Self>,
        matcher: impl Fn(&Stream, Option<&str>) -> bool + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        self.set.insert(
            id,
            Arc::new(Watcher {
                matcher: Box::new(matcher),
                tx,
            }),
        );
        Subscription {
            id,
            rx,
            watchers: self.clone(),
        }
    }

    /// Offer `stream` to every matching watcher. Returns whether anyone took it.
    pub fn notify(&self, stream: &Arc<Stream>, strategy: Option<&str>) -> bool {
        if stream.is_closed() {
            return false;
        }
        let snapshot: Vec<Arc<Watcher>> = self.set.iter().map(|w| w.value().clone()).collect();
        let holders = strategy.map(|_| Arc::new(AtomicUsize::new(0)));
        let mut claimed = false;
        for watcher in snapshot {
            if !(watcher.matcher)(stream, strategy) {
                continue;
            }
            if let Some(h) = &holders {
                h.fetch_add(1, Ordering::AcqRel);
            }
            let claim = Claim {
                stream: stream.clone(),
                holders: holders.clone(),
            };
            if watcher.tx.try_send(claim).is_ok() {
                claimed = true;
            } else if let Some(h) = &holders {
                h.fetch_sub(1, Ordering::AcqRel);
            }
        }
        claimed
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// A registered watcher. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Claim>,
    watchers: Arc<StreamWatchers>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Stream>> {
        self.rx.recv().await.map(|c| c.stream)
    }

    pub fn try_recv(&mut self) -> Option<Arc<Stream>> {
        self.rx.try_recv().ok().map(|c| c.stream)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.watchers.set.remove(&self.id);
        // No more deliveries can land; settle the ones that already did.
        self.rx.close();
        while let Ok(claim) = self.rx.try_recv() {
            let Some(holders) = claim.holders else {
                continue;
            };
            if holders.fetch_sub(1, Ordering::AcqRel) == 1 {
                tracing::debug!(stream = claim.stream.id(), "abandoned stream closed");
                claim.stream.close_with_error(StreamError::Excess);
            }
        }
    }
}
