//! TCP exonet: `tcp` endpoints are `host:port` strings.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use strand_core::{Context, Endpoint};
use strand_nodes::{DialError, Exonet, RawConn};

pub const NETWORK: &str = "tcp";

pub struct TcpExonet;

#[async_trait]
impl Exonet for TcpExonet {
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<RawConn, DialError> {
        if endpoint.network() != NETWORK {
            return Err(DialError::UnsupportedNetwork(endpoint.network().to_string()));
        }
        let sock = ctx
            .run(TcpStream::connect(endpoint.address()))
            .await?
            .map_err(|e| DialError::Failed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let _ = sock.set_nodelay(true);
        let local = sock
            .local_addr()
            .ok()
            .map(|a| Endpoint::new(NETWORK, a.to_string()));
        let mut conn = RawConn::outbound(sock, endpoint.clone());
        conn.local_endpoint = local;
        Ok(conn)
    }
}

/// Next inbound TCP connection as a raw conn.
pub async fn accept(listener: &TcpListener) -> std::io::Result<RawConn> {
    let (sock, peer) = listener.accept().await?;
    let _ = sock.set_nodelay(true);
    let local = sock
        .local_addr()
        .ok()
        .map(|a| Endpoint::new(NETWORK, a.to_string()));
    let mut conn = RawConn::inbound(sock, Some(Endpoint::new(NETWORK, peer.to_string())));
    conn.local_endpoint = local;
    Ok(conn)
}
