//! Application-side query routing.
//!
//! When a peer opens a session the node hands the query to a
//! [`QueryRouter`]. Accepting returns `Ok`; the session opens as soon as the
//! response is on the wire, so handlers may start reading and writing right
//! away (writes park until then).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use strand_core::{Context, Identity, Nonce};

use crate::error::RouteError;
use crate::session::Session;
use crate::stream::StreamId;

/// An inbound query, after relay overrides.
#[derive(Debug, Clone)]
pub struct Query {
    pub nonce: Nonce,
    pub caller: Identity,
    pub target: Identity,
    pub query: String,
    /// Stream the query arrived on.
    pub stream: StreamId,
}

impl Query {
    /// The query up to its first `?`.
    pub fn name(&self) -> &str {
        self.query.split_once('?').map_or(&self.query, |(name, _)| name)
    }

    /// `key=value` pairs after the `?`. Keys without a value map to `""`.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query
            .split_once('?')
            .map(|(_, params)| params)
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| p.split_once('=').unwrap_or((p, "")))
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

#[async_trait]
pub trait QueryRouter: Send + Sync {
    async fn route_query(
        &self,
        ctx: &Context,
        query: &Query,
        session: Arc<Session>,
    ) -> Result<(), RouteError>;
}

/// Routes queries to handlers by name.
#[derive(Default)]
pub struct QueryDispatcher {
    routes: HashMap<String, Arc<dyn QueryRouter>>,
}

impl QueryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn QueryRouter>) {
        self.routes.insert(name.into(), handler);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl QueryRouter for QueryDispatcher {
    async fn route_query(
        &self,
        ctx: &Context,
        query: &Query,
        session: Arc<Session>,
    ) -> Result<(), RouteError> {
        match self.routes.get(query.name()) {
            Some(handler) => handler.route_query(ctx, query, session).await,
            None => {
                tracing::debug!(query = %query.query, caller = %query.caller.short(), "no route for query");
                Err(RouteError::NotFound)
            }
        }
    }
}

/// Writes back everything it reads until the caller closes the session.
pub struct EchoHandler;

#[async_trait]
impl QueryRouter for EchoHandler {
    async fn route_query(
        &self,
        _ctx: &Context,
        query: &Query,
        session: Arc<Session>,
    ) -> Result<(), RouteError> {
        let caller = query.caller;
        tokio::spawn(async move {
            let ctx = Context::background();
            let mut buf = vec![0u8; 8192];
            loop {
                let n = match session.read(&ctx, &mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(caller = %caller.short(), error = %e, "echo session ended");
                        break;
                    }
                };
                if session.write(&ctx, &buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(q: &str) -> Query {
        Query {
            nonce: 1,
            caller: Identity::from_bytes([1; 32]),
            target: Identity::from_bytes([2; 32]),
            query: q.to_string(),
            stream: 1,
        }
    }

    #[test]
    fn query_name_and_params() {
        let q = query(".reflect?net=tcp&addr=1.2.3.4:5&flag");
        assert_eq!(q.name(), ".reflect");
        assert_eq!(q.param("net"), Some("tcp"));
        assert_eq!(q.param("addr"), Some("1.2.3.4:5"));
        assert_eq!(q.param("flag"), Some(""));
        assert_eq!(q.param("missing"), None);

        let plain = query("echo");
        assert_eq!(plain.name(), "echo");
        assert_eq!(plain.params().count(), 0);
    }
}
