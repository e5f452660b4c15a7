//! Block buffer cache
//!
//! Sector-keyed cache of metadata blocks on the snapshot store.
//! Handles are `Rc<RefCell<Buffer>>`; the `Rc` strong count doubles as
//! the reference count, so a buffer still held by a caller is never
//! eligible for eviction. Dirty buffers are flushed in the order they
//! were first modified, and a flush always strictly precedes the
//! superblock write that makes the modifications reachable.

use crate::device::BlockDevice;
use snapstore_common::{Result, Sector, SECTOR_BITS};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Buffer lifecycle: freshly created, matching disk, or modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufState {
    New,
    Clean,
    Dirty,
}

/// One cached metadata block.
pub struct Buffer {
    sector: Sector,
    state: BufState,
    pub data: Vec<u8>,
}

impl Buffer {
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state == BufState::Dirty
    }
}

/// Shared handle to a cached block.
pub type BufRef = Rc<RefCell<Buffer>>;

/// The cache itself. Unreferenced clean buffers are evicted once the
/// slot count reaches capacity; referenced or dirty buffers are kept
/// even if that means exceeding it.
pub struct BlockCache {
    block_size: usize,
    capacity: usize,
    slots: HashMap<Sector, BufRef>,
    dirty: Vec<Sector>,
}

impl BlockCache {
    #[must_use]
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            capacity,
            slots: HashMap::new(),
            dirty: Vec::new(),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Get the slot for a sector, creating it zero-filled if absent.
    /// The returned buffer is not read from disk.
    pub fn get(&mut self, sector: Sector) -> BufRef {
        if let Some(buf) = self.slots.get(&sector) {
            return Rc::clone(buf);
        }
        self.evict_one();
        let buf = Rc::new(RefCell::new(Buffer {
            sector,
            state: BufState::New,
            data: vec![0u8; self.block_size],
        }));
        self.slots.insert(sector, Rc::clone(&buf));
        buf
    }

    /// Get the slot for a sector, filling it from the device unless it
    /// already holds current or modified data.
    pub fn read(&mut self, dev: &BlockDevice, sector: Sector) -> Result<BufRef> {
        let buf = self.get(sector);
        {
            let mut b = buf.borrow_mut();
            if b.state == BufState::New {
                dev.read_at(sector << SECTOR_BITS, &mut b.data)?;
                b.state = BufState::Clean;
            }
        }
        Ok(buf)
    }

    /// Record a modification. The first transition to dirty fixes the
    /// buffer's position in the flush order.
    pub fn mark_dirty(&mut self, buf: &BufRef) {
        let mut b = buf.borrow_mut();
        if b.state != BufState::Dirty {
            b.state = BufState::Dirty;
            self.dirty.push(b.sector);
        }
    }

    /// Write every dirty buffer back, oldest modification first.
    pub fn flush(&mut self, dev: &BlockDevice) -> Result<()> {
        let dirty = std::mem::take(&mut self.dirty);
        trace!(blocks = dirty.len(), "flushing dirty metadata blocks");
        for sector in dirty {
            if let Some(buf) = self.slots.get(&sector) {
                let mut b = buf.borrow_mut();
                if b.state == BufState::Dirty {
                    dev.write_at(sector << SECTOR_BITS, &b.data)?;
                    b.state = BufState::Clean;
                }
            }
        }
        Ok(())
    }

    /// Immediate write-through for a single buffer.
    pub fn write_now(&mut self, dev: &BlockDevice, buf: &BufRef) -> Result<()> {
        let sector = {
            let mut b = buf.borrow_mut();
            dev.write_at(b.sector << SECTOR_BITS, &b.data)?;
            let was_dirty = b.state == BufState::Dirty;
            b.state = BufState::Clean;
            was_dirty.then_some(b.sector)
        };
        if let Some(sector) = sector {
            self.dirty.retain(|&s| s != sector);
        }
        Ok(())
    }

    /// Drop all slots. Only valid when nothing is held and nothing is
    /// dirty, i.e. right before reformatting the store.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.dirty.clear();
    }

    /// Evict one unreferenced clean buffer if the cache is at capacity.
    fn evict_one(&mut self) {
        if self.slots.len() < self.capacity {
            return;
        }
        let victim = self
            .slots
            .iter()
            .find(|(_, buf)| Rc::strong_count(buf) == 1 && !buf.borrow().is_dirty())
            .map(|(sector, _)| *sector);
        if let Some(sector) = victim {
            self.slots.remove(&sector);
        }
    }
}
