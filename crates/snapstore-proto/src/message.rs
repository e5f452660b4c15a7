//! Message codes and codecs
//!
//! Every message is `{code: u32, length: u32}` followed by `length`
//! bytes of body, all fields little-endian. Bodies are capped at
//! [`MAX_BODY`] bytes; replies that outgrow the cap are split into a
//! sequence of messages of the same code (see [`crate::ranges`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snapstore_common::{Error, Result};

/// Message header size: code (4) + body length (4).
pub const HEADER_SIZE: usize = 8;

/// Maximum message body size.
pub const MAX_BODY: usize = 500;

// ── Message codes ─────────────────────────────────────────────────────────────

pub const MSG_IDENTIFY: u32 = 1;
pub const MSG_REPLY_IDENTIFY: u32 = 2;
pub const MSG_QUERY_WRITE: u32 = 3;
pub const MSG_REPLY_ORIGIN_WRITE: u32 = 4;
pub const MSG_REPLY_SNAPSHOT_WRITE: u32 = 5;
pub const MSG_QUERY_SNAPSHOT_READ: u32 = 6;
pub const MSG_REPLY_SNAPSHOT_READ: u32 = 7;
pub const MSG_REPLY_SNAPSHOT_READ_ORIGIN: u32 = 8;
pub const MSG_FINISH_SNAPSHOT_READ: u32 = 9;
pub const MSG_CREATE_SNAPSHOT: u32 = 10;
pub const MSG_REPLY_CREATE_SNAPSHOT: u32 = 11;
pub const MSG_DELETE_SNAPSHOT: u32 = 12;
pub const MSG_REPLY_DELETE_SNAPSHOT: u32 = 13;
pub const MSG_DUMP_TREE: u32 = 14;
pub const MSG_INITIALIZE_SNAPSTORE: u32 = 15;
pub const MSG_SHUTDOWN_SERVER: u32 = 16;
pub const MSG_REPLY_ERROR: u32 = 17;

/// A run of consecutive logical chunks: `chunk (8) + count (2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub chunk: u64,
    pub count: u16,
}

/// Encoded size of a [`ChunkRange`] on the wire.
pub const RANGE_SIZE: usize = 10;

/// A chunk run together with the snapshot-store address of each chunk
/// in the run. `exceptions` is empty for origin-backed runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRange {
    pub chunk: u64,
    pub count: u16,
    pub exceptions: Vec<u64>,
}

impl ExceptionRange {
    /// Encoded size of this range on the wire.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        RANGE_SIZE + 8 * self.exceptions.len()
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Identify { id: u64, snapshot: i32 },
    QueryWrite { id: u32, ranges: Vec<ChunkRange> },
    QuerySnapshotRead { id: u32, ranges: Vec<ChunkRange> },
    FinishSnapshotRead { id: u32, ranges: Vec<ChunkRange> },
    CreateSnapshot { tag: u32 },
    DeleteSnapshot { tag: u32 },
    DumpTree,
    InitializeSnapstore,
    Shutdown,
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::protocol(format!(
            "message body truncated: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn decode_ranges(buf: &mut &[u8]) -> Result<(u32, Vec<ChunkRange>)> {
    need(buf, 8)?;
    let id = buf.get_u32_le();
    let count = buf.get_u32_le() as usize;
    need(buf, count * RANGE_SIZE)?;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let chunk = buf.get_u64_le();
        let chunks = buf.get_u16_le();
        ranges.push(ChunkRange {
            chunk,
            count: chunks,
        });
    }
    Ok((id, ranges))
}

impl Request {
    /// Decode a request body for the given message code.
    pub fn decode(code: u32, body: &[u8]) -> Result<Self> {
        if body.len() > MAX_BODY {
            return Err(Error::BodyTooLarge(body.len()));
        }
        let mut buf = body;
        let req = match code {
            MSG_IDENTIFY => {
                need(buf, 12)?;
                let id = buf.get_u64_le();
                let snapshot = buf.get_i32_le();
                Self::Identify { id, snapshot }
            }
            MSG_QUERY_WRITE => {
                let (id, ranges) = decode_ranges(&mut buf)?;
                Self::QueryWrite { id, ranges }
            }
            MSG_QUERY_SNAPSHOT_READ => {
                let (id, ranges) = decode_ranges(&mut buf)?;
                Self::QuerySnapshotRead { id, ranges }
            }
            MSG_FINISH_SNAPSHOT_READ => {
                let (id, ranges) = decode_ranges(&mut buf)?;
                Self::FinishSnapshotRead { id, ranges }
            }
            MSG_CREATE_SNAPSHOT => {
                need(buf, 4)?;
                Self::CreateSnapshot {
                    tag: buf.get_u32_le(),
                }
            }
            MSG_DELETE_SNAPSHOT => {
                need(buf, 4)?;
                Self::DeleteSnapshot {
                    tag: buf.get_u32_le(),
                }
            }
            MSG_DUMP_TREE => Self::DumpTree,
            MSG_INITIALIZE_SNAPSTORE => Self::InitializeSnapstore,
            MSG_SHUTDOWN_SERVER => Self::Shutdown,
            other => return Err(Error::UnknownMessage(other)),
        };
        if !buf.is_empty() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after message body",
                buf.len()
            )));
        }
        Ok(req)
    }

    /// Encode a request into a full wire message (header + body).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let code = match self {
            Self::Identify { id, snapshot } => {
                body.put_u64_le(*id);
                body.put_i32_le(*snapshot);
                MSG_IDENTIFY
            }
            Self::QueryWrite { id, ranges } => {
                encode_ranges(&mut body, *id, ranges);
                MSG_QUERY_WRITE
            }
            Self::QuerySnapshotRead { id, ranges } => {
                encode_ranges(&mut body, *id, ranges);
                MSG_QUERY_SNAPSHOT_READ
            }
            Self::FinishSnapshotRead { id, ranges } => {
                encode_ranges(&mut body, *id, ranges);
                MSG_FINISH_SNAPSHOT_READ
            }
            Self::CreateSnapshot { tag } => {
                body.put_u32_le(*tag);
                MSG_CREATE_SNAPSHOT
            }
            Self::DeleteSnapshot { tag } => {
                body.put_u32_le(*tag);
                MSG_DELETE_SNAPSHOT
            }
            Self::DumpTree => MSG_DUMP_TREE,
            Self::InitializeSnapstore => MSG_INITIALIZE_SNAPSTORE,
            Self::Shutdown => MSG_SHUTDOWN_SERVER,
        };
        frame(code, &body)
    }
}

fn encode_ranges(body: &mut BytesMut, id: u32, ranges: &[ChunkRange]) {
    body.put_u32_le(id);
    body.put_u32_le(ranges.len() as u32);
    for r in ranges {
        body.put_u64_le(r.chunk);
        body.put_u16_le(r.count);
    }
}

/// Prepend the message header to a body.
#[must_use]
pub fn frame(code: u32, body: &[u8]) -> Bytes {
    let mut msg = BytesMut::with_capacity(HEADER_SIZE + body.len());
    msg.put_u32_le(code);
    msg.put_u32_le(body.len() as u32);
    msg.put_slice(body);
    msg.freeze()
}

// ── Replies ───────────────────────────────────────────────────────────────────

/// A server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Identify { chunk_size_bits: u32 },
    OriginWrite { id: u32, ranges: Vec<ChunkRange> },
    SnapshotWrite { id: u32, ranges: Vec<ExceptionRange> },
    SnapshotRead { id: u32, ranges: Vec<ExceptionRange> },
    SnapshotReadOrigin { id: u32, ranges: Vec<ExceptionRange> },
    CreateSnapshot,
    DeleteSnapshot,
    Error { message: String },
}

impl Reply {
    /// Encode a reply into a full wire message (header + body).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let code = match self {
            Self::Identify { chunk_size_bits } => {
                body.put_u32_le(*chunk_size_bits);
                MSG_REPLY_IDENTIFY
            }
            Self::OriginWrite { id, ranges } => {
                encode_ranges(&mut body, *id, ranges);
                MSG_REPLY_ORIGIN_WRITE
            }
            Self::SnapshotWrite { id, ranges } => {
                encode_exception_ranges(&mut body, *id, ranges, true);
                MSG_REPLY_SNAPSHOT_WRITE
            }
            Self::SnapshotRead { id, ranges } => {
                encode_exception_ranges(&mut body, *id, ranges, true);
                MSG_REPLY_SNAPSHOT_READ
            }
            Self::SnapshotReadOrigin { id, ranges } => {
                encode_exception_ranges(&mut body, *id, ranges, false);
                MSG_REPLY_SNAPSHOT_READ_ORIGIN
            }
            Self::CreateSnapshot => MSG_REPLY_CREATE_SNAPSHOT,
            Self::DeleteSnapshot => MSG_REPLY_DELETE_SNAPSHOT,
            Self::Error { message } => {
                body.put_slice(message.as_bytes());
                MSG_REPLY_ERROR
            }
        };
        frame(code, &body)
    }

    /// Decode a reply body for the given message code.
    pub fn decode(code: u32, body: &[u8]) -> Result<Self> {
        if body.len() > MAX_BODY {
            return Err(Error::BodyTooLarge(body.len()));
        }
        let mut buf = body;
        let reply = match code {
            MSG_REPLY_IDENTIFY => {
                need(buf, 4)?;
                Self::Identify {
                    chunk_size_bits: buf.get_u32_le(),
                }
            }
            MSG_REPLY_ORIGIN_WRITE => {
                let (id, ranges) = decode_ranges(&mut buf)?;
                Self::OriginWrite { id, ranges }
            }
            MSG_REPLY_SNAPSHOT_WRITE => {
                let (id, ranges) = decode_exception_ranges(&mut buf, true)?;
                Self::SnapshotWrite { id, ranges }
            }
            MSG_REPLY_SNAPSHOT_READ => {
                let (id, ranges) = decode_exception_ranges(&mut buf, true)?;
                Self::SnapshotRead { id, ranges }
            }
            MSG_REPLY_SNAPSHOT_READ_ORIGIN => {
                let (id, ranges) = decode_exception_ranges(&mut buf, false)?;
                Self::SnapshotReadOrigin { id, ranges }
            }
            MSG_REPLY_CREATE_SNAPSHOT => Self::CreateSnapshot,
            MSG_REPLY_DELETE_SNAPSHOT => Self::DeleteSnapshot,
            MSG_REPLY_ERROR => {
                let message = String::from_utf8_lossy(buf).to_string();
                buf = &[];
                Self::Error { message }
            }
            other => return Err(Error::UnknownMessage(other)),
        };
        if !buf.is_empty() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after reply body",
                buf.len()
            )));
        }
        Ok(reply)
    }
}

fn encode_exception_ranges(
    body: &mut BytesMut,
    id: u32,
    ranges: &[ExceptionRange],
    with_exceptions: bool,
) {
    body.put_u32_le(id);
    body.put_u32_le(ranges.len() as u32);
    for r in ranges {
        body.put_u64_le(r.chunk);
        body.put_u16_le(r.count);
        if with_exceptions {
            debug_assert_eq!(r.exceptions.len(), r.count as usize);
            for e in &r.exceptions {
                body.put_u64_le(*e);
            }
        }
    }
}

fn decode_exception_ranges(
    buf: &mut &[u8],
    with_exceptions: bool,
) -> Result<(u32, Vec<ExceptionRange>)> {
    need(buf, 8)?;
    let id = buf.get_u32_le();
    let count = buf.get_u32_le() as usize;
    need(buf, count * RANGE_SIZE)?;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        need(buf, RANGE_SIZE)?;
        let chunk = buf.get_u64_le();
        let chunks = buf.get_u16_le();
        let mut exceptions = Vec::new();
        if with_exceptions {
            need(buf, 8 * chunks as usize)?;
            exceptions.reserve(chunks as usize);
            for _ in 0..chunks {
                exceptions.push(buf.get_u64_le());
            }
        }
        ranges.push(ExceptionRange {
            chunk,
            count: chunks,
            exceptions,
        });
    }
    Ok((id, ranges))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: Request) {
        let msg = req.encode();
        let code = u32::from_le_bytes(msg[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(msg[4..8].try_into().unwrap()) as usize;
        assert_eq!(msg.len(), HEADER_SIZE + len);
        let decoded = Request::decode(code, &msg[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_request_roundtrip() {
        roundtrip_request(Request::Identify {
            id: 7,
            snapshot: -1,
        });
        roundtrip_request(Request::QueryWrite {
            id: 42,
            ranges: vec![
                ChunkRange { chunk: 10, count: 3 },
                ChunkRange {
                    chunk: 100,
                    count: 1,
                },
            ],
        });
        roundtrip_request(Request::CreateSnapshot { tag: 9 });
        roundtrip_request(Request::Shutdown);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Reply::SnapshotWrite {
            id: 3,
            ranges: vec![ExceptionRange {
                chunk: 20,
                count: 2,
                exceptions: vec![900, 901],
            }],
        };
        let msg = reply.encode();
        let code = u32::from_le_bytes(msg[0..4].try_into().unwrap());
        let decoded = Reply::decode(code, &msg[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let err = Request::decode(MSG_IDENTIFY, &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            snapstore_common::Error::Protocol(_)
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut msg = Request::CreateSnapshot { tag: 1 }.encode().to_vec();
        msg.extend_from_slice(&[0u8; 2]);
        assert!(Request::decode(MSG_CREATE_SNAPSHOT, &msg[HEADER_SIZE..]).is_err());
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(matches!(
            Request::decode(999, &[]),
            Err(snapstore_common::Error::UnknownMessage(999))
        ));
    }
}
