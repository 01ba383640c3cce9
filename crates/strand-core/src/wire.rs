//! Strand wire format: the frames exchanged on a stream.
//!
//! Every frame is a 1-byte opcode, a fixed-width header and, for `Query`
//! and `Data`, a body whose length is carried in the header as a 16-bit
//! prefix. All integers are big-endian. Changing anything here breaks
//! compatibility with every deployed node.
//!
//! Headers are zerocopy structs made only of unaligned fields, so they map
//! straight onto the byte stream. There is no unsafe code in this module.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::identity::Nonce;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest payload a single `Data` frame may carry.
pub const MAX_PAYLOAD: usize = 8192;

/// Largest query string a `Query` frame may carry (2-byte length prefix).
pub const MAX_QUERY_LEN: usize = u16::MAX as usize;

/// Response code for an accepted query.
pub const CODE_ACCEPTED: u8 = 0;
/// The application router declined the query.
pub const CODE_REJECTED: u8 = 1;
/// No handler is registered for the query.
pub const CODE_ROUTE_NOT_FOUND: u8 = 2;
/// The node failed while routing the query.
pub const CODE_INTERNAL: u8 = 3;

// ── Opcodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0x00,
    Query = 0x01,
    Response = 0x02,
    Data = 0x03,
    Read = 0x04,
    Reset = 0x05,
    Migrate = 0x06,
}

impl Opcode {
    /// Size of the fixed header that follows the opcode byte.
    pub const fn header_len(self) -> usize {
        match self {
            Opcode::Ping => std::mem::size_of::<PingHeader>(),
            Opcode::Query => std::mem::size_of::<QueryHeader>(),
            Opcode::Response => std::mem::size_of::<ResponseHeader>(),
            Opcode::Data => std::mem::size_of::<DataHeader>(),
            Opcode::Read => std::mem::size_of::<ReadHeader>(),
            Opcode::Reset | Opcode::Migrate => std::mem::size_of::<NonceHeader>(),
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::Ping),
            0x01 => Ok(Opcode::Query),
            0x02 => Ok(Opcode::Response),
            0x03 => Ok(Opcode::Data),
            0x04 => Ok(Opcode::Read),
            0x05 => Ok(Opcode::Reset),
            0x06 => Ok(Opcode::Migrate),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// Wire size: 9 bytes.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct PingHeader {
    nonce: U64<BigEndian>,
    /// 0 = ping, 1 = pong.
    pong: u8,
}

/// Wire size: 14 bytes, followed by `query_len` bytes of UTF-8.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct QueryHeader {
    nonce: U64<BigEndian>,
    /// Read window the caller grants the responder.
    buffer: U32<BigEndian>,
    query_len: U16<BigEndian>,
}

/// Wire size: 13 bytes.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct ResponseHeader {
    nonce: U64<BigEndian>,
    code: u8,
    /// Read window the responder grants the caller.
    buffer: U32<BigEndian>,
}

/// Wire size: 10 bytes, followed by `len` payload bytes.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct DataHeader {
    nonce: U64<BigEndian>,
    len: U16<BigEndian>,
}

/// Wire size: 12 bytes.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct ReadHeader {
    nonce: U64<BigEndian>,
    len: U32<BigEndian>,
}

/// Shared by `Reset` and `Migrate`. Wire size: 8 bytes.
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct NonceHeader {
    nonce: U64<BigEndian>,
}

assert_eq_size!(PingHeader, [u8; 9]);
assert_eq_size!(QueryHeader, [u8; 14]);
assert_eq_size!(ResponseHeader, [u8; 13]);
assert_eq_size!(DataHeader, [u8; 10]);
assert_eq_size!(ReadHeader, [u8; 12]);
assert_eq_size!(NonceHeader, [u8; 8]);

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness probe, answered with `pong = true` and the same nonce.
    Ping { nonce: Nonce, pong: bool },
    /// Opens a session. `buffer` is the caller's read window.
    Query {
        nonce: Nonce,
        query: String,
        buffer: u32,
    },
    /// Accepts (`code == CODE_ACCEPTED`) or rejects a query.
    Response { nonce: Nonce, code: u8, buffer: u32 },
    /// Session payload, at most [`MAX_PAYLOAD`] bytes.
    Data { nonce: Nonce, payload: Bytes },
    /// Flow-control credit: the peer may send `len` more bytes.
    Read { nonce: Nonce, len: u32 },
    /// Aborts a session.
    Reset { nonce: Nonce },
    /// No more session frames follow on this stream.
    Migrate { nonce: Nonce },
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Ping { .. } => Opcode::Ping,
            Frame::Query { .. } => Opcode::Query,
            Frame::Response { .. } => Opcode::Response,
            Frame::Data { .. } => Opcode::Data,
            Frame::Read { .. } => Opcode::Read,
            Frame::Reset { .. } => Opcode::Reset,
            Frame::Migrate { .. } => Opcode::Migrate,
        }
    }

    pub fn nonce(&self) -> Nonce {
        match self {
            Frame::Ping { nonce, .. }
            | Frame::Query { nonce, .. }
            | Frame::Response { nonce, .. }
            | Frame::Data { nonce, .. }
            | Frame::Read { nonce, .. }
            | Frame::Reset { nonce }
            | Frame::Migrate { nonce } => *nonce,
        }
    }

    /// Exact number of bytes [`Frame::encode`] produces.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Frame::Query { query, .. } => query.len(),
            Frame::Data { payload, .. } => payload.len(),
            _ => 0,
        };
        1 + self.opcode().header_len() + body
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Frame::Query { query, .. } if query.len() > MAX_QUERY_LEN => {
                return Err(WireError::QueryTooLong(query.len()));
            }
            Frame::Data { payload, .. } if payload.len() > MAX_PAYLOAD => {
                return Err(WireError::PayloadTooLarge(payload.len()));
            }
            _ => {}
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.opcode().into());

        match self {
            Frame::Ping { nonce, pong } => {
                let h = PingHeader {
                    nonce: U64::new(*nonce),
                    pong: u8::from(*pong),
                };
                dst.put_slice(h.as_bytes());
            }
            Frame::Query {
                nonce,
                query,
                buffer,
            } => {
                let h = QueryHeader {
                    nonce: U64::new(*nonce),
                    buffer: U32::new(*buffer),
                    query_len: U16::new(query.len() as u16),
                };
                dst.put_slice(h.as_bytes());
                dst.put_slice(query.as_bytes());
            }
            Frame::Response {
                nonce,
                code,
                buffer,
            } => {
                let h = ResponseHeader {
                    nonce: U64::new(*nonce),
                    code: *code,
                    buffer: U32::new(*buffer),
                };
                dst.put_slice(h.as_bytes());
            }
            Frame::Data { nonce, payload } => {
                let h = DataHeader {
                    nonce: U64::new(*nonce),
                    len: U16::new(payload.len() as u16),
                };
                dst.put_slice(h.as_bytes());
                dst.put_slice(payload);
            }
            Frame::Read { nonce, len } => {
                let h = ReadHeader {
                    nonce: U64::new(*nonce),
                    len: U32::new(*len),
                };
                dst.put_slice(h.as_bytes());
            }
            Frame::Reset { nonce } | Frame::Migrate { nonce } => {
                let h = NonceHeader {
                    nonce: U64::new(*nonce),
                };
                dst.put_slice(h.as_bytes());
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
    /// consumed bytes are removed from `src` only on success.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        let Some(&op) = src.first() else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(op)?;
        let fixed = opcode.header_len();
        if src.len() < 1 + fixed {
            return Ok(None);
        }

        let head = &src[1..1 + fixed];
        let body_len = match opcode {
            Opcode::Query => read_header::<QueryHeader>(head)?.query_len.get() as usize,
            Opcode::Data => {
                let len = read_header::<DataHeader>(head)?.len.get() as usize;
                if len > MAX_PAYLOAD {
                    return Err(WireError::PayloadTooLarge(len));
                }
                len
            }
            _ => 0,
        };

        let total = 1 + fixed + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(total).freeze();
        buf.advance(1);
        let head = buf.split_to(fixed);
        let body = buf;

        let frame = match opcode {
            Opcode::Ping => {
                let h = read_header::<PingHeader>(&head)?;
                Frame::Ping {
                    nonce: h.nonce.get(),
                    pong: h.pong != 0,
                }
            }
            Opcode::Query => {
                let h = read_header::<QueryHeader>(&head)?;
                let query = String::from_utf8(body.to_vec()).map_err(|_| WireError::InvalidQuery)?;
                Frame::Query {
                    nonce: h.nonce.get(),
                    query,
                    buffer: h.buffer.get(),
                }
            }
            Opcode::Response => {
                let h = read_header::<ResponseHeader>(&head)?;
                Frame::Response {
                    nonce: h.nonce.get(),
                    code: h.code,
                    buffer: h.buffer.get(),
                }
            }
            Opcode::Data => {
                let h = read_header::<DataHeader>(&head)?;
                Frame::Data {
                    nonce: h.nonce.get(),
                    payload: body,
                }
            }
            Opcode::Read => {
                let h = read_header::<ReadHeader>(&head)?;
                Frame::Read {
                    nonce: h.nonce.get(),
                    len: h.len.get(),
                }
            }
            Opcode::Reset => Frame::Reset {
                nonce: read_header::<NonceHeader>(&head)?.nonce.get(),
            },
            Opcode::Migrate => Frame::Migrate {
                nonce: read_header::<NonceHeader>(&head)?.nonce.get(),
            },
        };
        Ok(Some(frame))
    }
}

fn read_header<T: FromBytes>(bytes: &[u8]) -> Result<T, WireError> {
    T::read_from(bytes).ok_or(WireError::Truncated)
}

// ── Async I/O ─────────────────────────────────────────────────────────────────

/// Read the next frame, buffering partial input in `buf`.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, WireError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = Frame::decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(WireError::Truncated);
        }
    }
}

/// Encode and write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("data payload of {0} bytes exceeds the 8192 byte limit")]
    PayloadTooLarge(usize),
    #[error("query of {0} bytes does not fit a 16-bit length prefix")]
    QueryTooLong(usize),
    #[error("query is not valid UTF-8")]
    InvalidQuery,
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
