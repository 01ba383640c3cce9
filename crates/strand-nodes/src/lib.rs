//! strand-nodes — streams, sessions and linking between nodes.
//!
//! A [`Stream`] is an authenticated link to one peer; [`Session`]s are
//! flow-controlled byte channels multiplexed over streams. [`Nodes`] owns
//! both tables, produces streams on demand through link strategies, and
//! moves live sessions between streams.

pub mod error;
pub mod events;
pub mod exonet;
pub mod features;
pub mod handshake;
pub mod link;
pub mod link_pool;
pub mod linker;
pub mod memory;
pub mod migrate;
pub mod nodes;
pub mod peers;
pub mod relay;
pub mod resolve;
pub mod router;
pub mod session;
pub mod strategy;
pub mod stream;
pub mod watchers;

pub use error::{DialError, HandshakeError, LinkError, MigrationError, RouteError, SessionError, StreamError};
pub use events::NodeEvent;
pub use exonet::{AuthConn, Exonet, RawConn};
pub use handshake::{Handshake, NoiseHandshake};
pub use link_pool::RetrieveLinkOptions;
pub use migrate::{MigrateRole, MigrationChannel, SessionChannel, SessionMigrator};
pub use nodes::{Nodes, NodesStatus};
pub use router::{EchoHandler, Query, QueryDispatcher, QueryRouter};
pub use session::{Session, SessionState};
pub use stream::{Stream, StreamId};
