//! Snapshot store lifecycle
//!
//! [`SnapStore`] ties the pieces together: the superblock, the block
//! cache, the two devices and the copy engine. Creation formats the
//! store (allocation bitmap plus an empty exception tree); opening
//! verifies the superblock checksum and magic.
//!
//! Durability is a single ordering rule enforced by [`SnapStore::commit`]:
//! pending chunk copies land first, then dirty metadata blocks, and
//! only after a sync does the superblock that references them get
//! rewritten. A crash between any two steps leaves the previous
//! committed state intact.

use crate::buffer::BlockCache;
use crate::copy::CopyEngine;
use crate::device::BlockDevice;
use crate::superblock::{Superblock, FLAG_BUSY, SUPERBLOCK_SECTOR, SUPERBLOCK_SIZE};
use snapstore_common::{Chunk, Error, Result, Sector, ShareMask, SECTOR_BITS};
use tracing::{info, warn};

/// Metadata block cache slots.
const CACHE_CAPACITY: usize = 512;

/// Largest supported chunk size (1 MiB).
const MAX_CHUNK_SIZE_BITS: u32 = 20;

/// Result of making a chunk unique for a writer: the exception chunk
/// that now backs it, and whether data had to be copied to get there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueOutcome {
    pub exception: Chunk,
    pub copied: bool,
}

/// An open snapshot store. Owned by exactly one task; not `Send`.
pub struct SnapStore {
    pub(crate) sb: Superblock,
    pub(crate) sb_dirty: bool,
    pub(crate) cache: BlockCache,
    pub(crate) snapdev: BlockDevice,
    pub(crate) origindev: BlockDevice,
    pub(crate) copier: CopyEngine,
}

impl SnapStore {
    /// Format a new store on `snapdev`, shadowing `origindev`.
    pub fn create(
        snapdev: BlockDevice,
        origindev: BlockDevice,
        chunk_size_bits: u32,
    ) -> Result<Self> {
        if !(SECTOR_BITS..=MAX_CHUNK_SIZE_BITS).contains(&chunk_size_bits) {
            return Err(Error::storage(format!(
                "chunk size bits {chunk_size_bits} out of range"
            )));
        }
        let chunks = snapdev.size() >> chunk_size_bits;
        let origin_chunks = origindev.size() >> chunk_size_bits;
        // header area, at least one bitmap block, tree root and leaf,
        // and something left to allocate
        if chunks < 8 {
            return Err(Error::storage(format!(
                "snapshot store too small: {chunks} chunks of 2^{chunk_size_bits} bytes"
            )));
        }

        let sb = Superblock::new(chunk_size_bits, chunks, origin_chunks);
        let cache = BlockCache::new(sb.block_size(), CACHE_CAPACITY);
        let copier = CopyEngine::new(sb.chunk_size());
        let mut store = Self {
            sb,
            sb_dirty: false,
            cache,
            snapdev,
            origindev,
            copier,
        };
        store.format()?;
        Ok(store)
    }

    /// Open an existing store, verifying its superblock.
    pub fn open(snapdev: BlockDevice, origindev: BlockDevice) -> Result<Self> {
        let mut image = vec![0u8; SUPERBLOCK_SIZE];
        snapdev.read_at(SUPERBLOCK_SECTOR << SECTOR_BITS, &mut image)?;
        let sb = Superblock::from_bytes(&image)?;
        if sb.flags & FLAG_BUSY != 0 {
            warn!(
                device = snapdev.path(),
                "store was not shut down cleanly, metadata may trail the origin"
            );
        }
        info!(
            device = snapdev.path(),
            chunks = sb.chunks,
            free = sb.free_chunks,
            snapshots = sb.snapshots.len(),
            "opened snapshot store"
        );
        let cache = BlockCache::new(sb.block_size(), CACHE_CAPACITY);
        let copier = CopyEngine::new(sb.chunk_size());
        Ok(Self {
            sb,
            sb_dirty: false,
            cache,
            snapdev,
            origindev,
            copier,
        })
    }

    /// Reformat in place, discarding all snapshots and exceptions.
    pub fn format(&mut self) -> Result<()> {
        info!(
            device = self.snapdev.path(),
            chunks = self.sb.chunks,
            chunk_size_bits = self.sb.chunk_size_bits,
            "formatting snapshot store"
        );
        self.sb = Superblock::new(self.sb.chunk_size_bits, self.sb.chunks, self.sb.origin_chunks);
        self.cache.clear();
        self.init_allocation()?;
        self.init_tree()?;
        self.sb_dirty = true;
        self.commit()
    }

    /// Make every change since the last commit durable: copies first,
    /// then metadata blocks, then the superblock.
    pub fn commit(&mut self) -> Result<()> {
        self.copier.flush(&self.origindev, &self.snapdev)?;
        self.cache.flush(&self.snapdev)?;
        if self.sb_dirty {
            self.snapdev.sync()?;
            self.snapdev
                .write_at(SUPERBLOCK_SECTOR << SECTOR_BITS, &self.sb.to_bytes())?;
            self.snapdev.sync()?;
            self.sb_dirty = false;
        }
        Ok(())
    }

    /// Flag the store as owned by a running server (or clean again).
    pub fn set_busy(&mut self, busy: bool) {
        if busy {
            self.sb.flags |= FLAG_BUSY;
        } else {
            self.sb.flags &= !FLAG_BUSY;
        }
        self.sb_dirty = true;
    }

    /// Create a snapshot under an externally chosen tag, assigning it
    /// the lowest free share-mask bit. The new snapshot initially
    /// shares every chunk with the origin.
    pub fn create_snapshot(&mut self, tag: u32) -> Result<u8> {
        let bit = self.sb.add_snapshot(tag)?;
        self.sb_dirty = true;
        info!(tag, bit, "created snapshot");
        Ok(bit)
    }

    /// Delete a snapshot: drop it from the table and release every
    /// exception chunk it held exclusively.
    pub fn delete_snapshot(&mut self, tag: u32) -> Result<()> {
        let bit = self.sb.remove_snapshot(tag)?;
        self.sb_dirty = true;
        self.delete_snapshot_exceptions(1u64 << bit)?;
        info!(tag, bit, free = self.sb.free_chunks, "deleted snapshot");
        Ok(())
    }

    #[must_use]
    pub fn snapshot_bit(&self, tag: u32) -> Option<u8> {
        self.sb.find_snapshot(tag).map(|s| s.bit)
    }

    #[must_use]
    pub fn snapmask(&self) -> ShareMask {
        self.sb.snapmask()
    }

    #[must_use]
    pub fn chunk_size_bits(&self) -> u32 {
        self.sb.chunk_size_bits
    }

    #[must_use]
    pub fn origin_chunks(&self) -> u64 {
        self.sb.origin_chunks
    }

    #[must_use]
    pub fn free_chunks(&self) -> u64 {
        self.sb.free_chunks
    }

    /// First sector of a chunk on the snapshot store.
    #[must_use]
    pub fn chunk_sector(&self, chunk: Chunk) -> Sector {
        chunk << (self.sb.chunk_size_bits - SECTOR_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use tempfile::NamedTempFile;

    const CHUNK_BITS: u32 = 12;
    const CHUNK: u64 = 1 << CHUNK_BITS;

    fn new_store(snap_chunks: u64, origin_chunks: u64) -> (NamedTempFile, NamedTempFile, SnapStore) {
        let snap_file = NamedTempFile::new().unwrap();
        let origin_file = NamedTempFile::new().unwrap();
        let snapdev = BlockDevice::create(snap_file.path(), snap_chunks * CHUNK).unwrap();
        let origindev = BlockDevice::create(origin_file.path(), origin_chunks * CHUNK).unwrap();
        let store = SnapStore::create(snapdev, origindev, CHUNK_BITS).unwrap();
        (snap_file, origin_file, store)
    }

    #[test]
    fn test_create_reserves_metadata_chunks() {
        let (_s, _o, store) = new_store(256, 256);
        // 2 header chunks + 1 bitmap block + tree root + initial leaf
        assert_eq!(store.free_chunks(), 256 - 5);
        assert_eq!(store.sb.tree_levels, 1);
        assert_eq!(store.snapmask(), 0);
    }

    #[test]
    fn test_reopen_after_commit() {
        let (snap_file, origin_file, mut store) = new_store(256, 256);
        store.create_snapshot(7).unwrap();
        let out = store.make_unique(5, None).unwrap();
        assert!(out.copied);
        store.commit().unwrap();
        let free = store.free_chunks();
        drop(store);

        let snapdev = BlockDevice::open(snap_file.path()).unwrap();
        let origindev = BlockDevice::open(origin_file.path()).unwrap();
        let mut store = SnapStore::open(snapdev, origindev).unwrap();
        assert_eq!(store.free_chunks(), free);
        assert_eq!(store.snapshot_bit(7), Some(0));
        // the exception survived the reopen
        assert!(store.snapshot_exception(5, 0).unwrap().is_some());
        assert!(!store.make_unique(5, None).unwrap().copied);
    }

    #[test]
    fn test_origin_write_copies_once() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        let free = store.free_chunks();

        let first = store.make_unique(9, None).unwrap();
        assert!(first.copied);
        assert_eq!(store.free_chunks(), free - 1);

        let second = store.make_unique(9, None).unwrap();
        assert!(!second.copied);
        assert_eq!(store.free_chunks(), free - 1);

        // the snapshot reads the copied-out data
        assert_eq!(store.snapshot_exception(9, 0).unwrap(), Some(first.exception));
    }

    #[test]
    fn test_snapshot_write_leaves_shared_record() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        store.make_unique(5, None).unwrap();

        // lone snapshot owns the record outright, so its own write
        // needs no copy
        let out = store.make_unique(5, Some(0)).unwrap();
        assert!(!out.copied);

        // a second snapshot shares chunk 6 with the first; each write
        // peels one of them off
        store.create_snapshot(2).unwrap();
        let shared = store.make_unique(6, None).unwrap();
        assert!(shared.copied);
        let snap0 = store.make_unique(6, Some(0)).unwrap();
        assert!(snap0.copied);
        assert_ne!(snap0.exception, shared.exception);
        // snapshot 1 keeps the originally shared exception
        assert_eq!(store.snapshot_exception(6, 1).unwrap(), Some(shared.exception));
        assert!(!store.make_unique(6, Some(1)).unwrap().copied);
    }

    #[test]
    fn test_second_snapshot_forces_new_copy() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        store.make_unique(5, None).unwrap();
        assert!(!store.make_unique(5, None).unwrap().copied);

        // a fresh snapshot shares chunk 5 with the origin again
        store.create_snapshot(2).unwrap();
        assert!(store.make_unique(5, None).unwrap().copied);
        assert!(!store.make_unique(5, None).unwrap().copied);
    }

    #[test]
    fn test_many_exceptions_split_leaves() {
        let (_s, _o, mut store) = new_store(4096, 4096);
        store.create_snapshot(1).unwrap();

        let mut chunks: Vec<u64> = (0..4000).step_by(7).collect();
        chunks.shuffle(&mut rand::thread_rng());
        let mut exceptions = Vec::new();
        for &chunk in &chunks {
            let out = store.make_unique(chunk, None).unwrap();
            assert!(out.copied, "chunk {chunk} should have copied");
            exceptions.push((chunk, out.exception));
        }
        store.commit().unwrap();

        // every chunk stays reachable through the (now multi-leaf) tree
        for (chunk, exception) in exceptions {
            assert_eq!(
                store.snapshot_exception(chunk, 0).unwrap(),
                Some(exception),
                "chunk {chunk} lost after splits"
            );
            assert!(!store.make_unique(chunk, None).unwrap().copied);
        }
        // untouched chunks still share with the origin
        assert_eq!(store.snapshot_exception(1, 0).unwrap(), None);
    }

    #[test]
    fn test_allocator_exhaustion() {
        let (_s, _o, mut store) = new_store(8, 256);
        store.create_snapshot(1).unwrap();
        let free = store.free_chunks();
        assert!(free > 0);

        for chunk in 0..free {
            assert!(store.make_unique(chunk, None).unwrap().copied);
        }
        assert_eq!(store.free_chunks(), 0);
        assert!(matches!(
            store.make_unique(200, None),
            Err(Error::StoreFull)
        ));
    }

    #[test]
    fn test_delete_snapshot_frees_exceptions() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        let free = store.free_chunks();

        for chunk in 10..20 {
            store.make_unique(chunk, None).unwrap();
        }
        assert_eq!(store.free_chunks(), free - 10);

        store.delete_snapshot(1).unwrap();
        assert_eq!(store.free_chunks(), free);
        assert_eq!(store.snapmask(), 0);
        assert!(matches!(
            store.delete_snapshot(1),
            Err(Error::SnapshotNotFound(1))
        ));
    }

    #[test]
    fn test_delete_keeps_other_snapshots_exceptions() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        store.create_snapshot(2).unwrap();

        // chunk 5 is shared by both snapshots via one record
        let shared = store.make_unique(5, None).unwrap();
        store.delete_snapshot(1).unwrap();

        assert_eq!(store.snapshot_exception(5, 1).unwrap(), Some(shared.exception));
        assert!(!store.make_unique(5, None).unwrap().copied);
    }

    #[test]
    fn test_format_resets_everything() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        for chunk in 0..30 {
            store.make_unique(chunk, None).unwrap();
        }
        let fresh_free = 256 - 5;
        assert!(store.free_chunks() < fresh_free);

        store.format().unwrap();
        assert_eq!(store.free_chunks(), fresh_free);
        assert_eq!(store.snapmask(), 0);
        assert!(store.snapshot_bit(1).is_none());
        assert_eq!(store.snapshot_exception(0, 0).unwrap(), None);
    }

    #[test]
    fn test_dump_tree_renders() {
        let (_s, _o, mut store) = new_store(256, 256);
        store.create_snapshot(1).unwrap();
        store.make_unique(5, None).unwrap();
        let dump = store.dump_tree().unwrap();
        assert!(dump.contains("chunk 5"));
    }

    #[test]
    fn test_too_small_store_rejected() {
        let snap_file = NamedTempFile::new().unwrap();
        let origin_file = NamedTempFile::new().unwrap();
        let snapdev = BlockDevice::create(snap_file.path(), 2 * CHUNK).unwrap();
        let origindev = BlockDevice::create(origin_file.path(), 256 * CHUNK).unwrap();
        assert!(SnapStore::create(snapdev, origindev, CHUNK_BITS).is_err());
    }
}
