//! Node lifecycle notifications.

use strand_core::{Endpoint, Identity};
use tokio::sync::broadcast;

use crate::error::StreamError;
use crate::stream::StreamId;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    StreamCreated {
        stream: StreamId,
        remote: Identity,
        outbound: bool,
        /// Streams now open to `remote`, this one included.
        siblings: usize,
    },
    StreamClosed {
        stream: StreamId,
        remote: Identity,
        error: StreamError,
    },
    /// First stream to `remote` came up.
    Linked { remote: Identity },
    /// Last stream to `remote` went away.
    Unlinked { remote: Identity },
    /// A peer told us how it sees us.
    ObservedEndpoint { endpoint: Endpoint, by: Identity },
}

pub type EventSender = broadcast::Sender<NodeEvent>;

pub fn event_channel() -> EventSender {
    broadcast::channel(EVENT_BUFFER).0
}
