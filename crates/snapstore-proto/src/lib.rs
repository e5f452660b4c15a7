//! Snapstore wire protocol
//!
//! Length-prefixed little-endian messages exchanged between block
//! drivers and the snapshot metadata server. Every message is an
//! 8-byte header (`code`, `length`) followed by at most [`MAX_BODY`]
//! bytes of body.

pub mod message;
pub mod ranges;

pub use message::{
    ChunkRange, ExceptionRange, Reply, Request, HEADER_SIZE, MAX_BODY, MSG_CREATE_SNAPSHOT,
    MSG_DELETE_SNAPSHOT, MSG_DUMP_TREE, MSG_FINISH_SNAPSHOT_READ, MSG_IDENTIFY,
    MSG_INITIALIZE_SNAPSTORE, MSG_QUERY_SNAPSHOT_READ, MSG_QUERY_WRITE, MSG_REPLY_CREATE_SNAPSHOT,
    MSG_REPLY_DELETE_SNAPSHOT, MSG_REPLY_ERROR, MSG_REPLY_IDENTIFY, MSG_REPLY_ORIGIN_WRITE,
    MSG_REPLY_SNAPSHOT_READ, MSG_REPLY_SNAPSHOT_READ_ORIGIN, MSG_REPLY_SNAPSHOT_WRITE,
    MSG_SHUTDOWN_SERVER,
};
pub use ranges::RangeBuilder;
