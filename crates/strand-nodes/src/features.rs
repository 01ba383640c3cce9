//! Link feature negotiation, run once per authenticated connection before it
//! becomes a stream.
//!
//!   responder → u8 count, (u8 len, name)*
//!   initiator → u8 len, name
//!   responder → u8 code (0 = accepted)

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::LinkError;
use crate::exonet::BoxIo;

/// Multiplexed frame streams. The only feature this node speaks.
pub const FEATURE_MUX2: &str = "mux2";

const SUPPORTED: &[&str] = &[FEATURE_MUX2];

const ACCEPTED: u8 = 0;
const UNSUPPORTED: u8 = 1;

/// Responder side: advertise, then confirm the initiator's pick.
pub async fn offer(io: &mut BoxIo) -> Result<String, LinkError> {
    let mut msg = vec![SUPPORTED.len() as u8];
    for feature in SUPPORTED {
        msg.push(feature.len() as u8);
        msg.extend_from_slice(feature.as_bytes());
    }
    io.write_all(&msg).await.map_err(neg_err)?;
    io.flush().await.map_err(neg_err)?;

    let picked = read_name(io).await?;
    let code = if SUPPORTED.contains(&picked.as_str()) {
        ACCEPTED
    } else {
        UNSUPPORTED
    };
    io.write_u8(code).await.map_err(neg_err)?;
    io.flush().await.map_err(neg_err)?;

    if code != ACCEPTED {
        return Err(LinkError::Negotiation(format!("peer picked unsupported feature {picked:?}")));
    }
    Ok(picked)
}

/// Initiator side: pick the first offered feature we speak.
pub async fn select(io: &mut BoxIo) -> Result<String, LinkError> {
    let count = io.read_u8().await.map_err(neg_err)?;
    let mut offered = Vec::with_capacity(count as usize);
    for _ in 0..count {
        offered.push(read_name(io).await?);
    }

    let Some(picked) = offered.into_iter().find(|f| SUPPORTED.contains(&f.as_str())) else {
        return Err(LinkError::Negotiation("no common link feature".into()));
    };

    let mut msg = vec![picked.len() as u8];
    msg.extend_from_slice(picked.as_bytes());
    io.write_all(&msg).await.map_err(neg_err)?;
    io.flush().await.map_err(neg_err)?;

    match io.read_u8().await.map_err(neg_err)? {
        ACCEPTED => Ok(picked),
        code => Err(LinkError::Negotiation(format!("feature {picked:?} refused with code {code}"))),
    }
}

async fn read_name(io: &mut BoxIo) -> Result<String, LinkError> {
    let len = io.read_u8().await.map_err(neg_err)?;
    let mut name = vec![0u8; len as usize];
    io.read_exact(&mut name).await.map_err(neg_err)?;
    String::from_utf8(name).map_err(|_| LinkError::Negotiation("feature name is not UTF-8".into()))
}

fn neg_err(e: std::io::Error) -> LinkError {
    LinkError::Negotiation(e.to_string())
}
