//! Snapstore engine - copy-on-write snapshot metadata
//!
//! The engine tracks which logical chunks of an origin volume have
//! been copied out ("excepted") into a snapshot store, using an
//! on-disk B+tree of exception records, a bitmap chunk allocator and a
//! block buffer cache, all rooted in a checksummed superblock.
//!
//! A [`SnapStore`] is owned by exactly one task; nothing in this crate
//! is `Send`. Crash consistency is ordering-based: modified metadata
//! blocks are flushed before the superblock is rewritten, and pending
//! chunk copies are flushed before either.

pub mod alloc;
pub mod buffer;
pub mod copy;
pub mod device;
pub mod locks;
pub mod node;
pub mod store;
pub mod superblock;
pub mod tree;

pub use buffer::{BlockCache, BufRef};
pub use copy::{CopyEngine, CopySource};
pub use device::BlockDevice;
pub use locks::{ClientId, LockTable, Pending, PendingRef};
pub use store::{SnapStore, UniqueOutcome};
pub use superblock::Superblock;
