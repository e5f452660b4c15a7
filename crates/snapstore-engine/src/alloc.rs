//! Bitmap chunk allocator
//!
//! One bit per chunk of the snapshot store, packed into metadata
//! blocks right after the superblock. Allocation scans forward from
//! the last successful allocation and wraps once, so sequential
//! allocations stay sequential on disk and freed space is found
//! without a separate free list.
//!
//! The bitmap goes through the block cache like any other metadata, so
//! bit flips become durable under the same commit ordering.

use crate::buffer::BufRef;
use crate::store::SnapStore;
use crate::superblock::{SUPERBLOCK_SECTOR, SUPERBLOCK_SIZE};
use snapstore_common::{Chunk, Error, Result, SECTOR_BITS};
use tracing::trace;

impl SnapStore {
    fn bits_per_block(&self) -> u64 {
        (self.sb.block_size() * 8) as u64
    }

    fn sectors_per_block(&self) -> u64 {
        (self.sb.block_size() >> SECTOR_BITS) as u64
    }

    fn bitmap_buf(&mut self, chunk: Chunk) -> Result<BufRef> {
        let block = chunk / self.bits_per_block();
        let sector = self.sb.bitmap_base + block * self.sectors_per_block();
        self.cache.read(&self.snapdev, sector)
    }

    fn set_bit(&mut self, chunk: Chunk) -> Result<()> {
        let bits = self.bits_per_block();
        let buf = self.bitmap_buf(chunk)?;
        {
            let mut b = buf.borrow_mut();
            let idx = ((chunk % bits) / 8) as usize;
            b.data[idx] |= 1 << (chunk % 8);
        }
        self.cache.mark_dirty(&buf);
        Ok(())
    }

    /// Claim a free chunk, preferring the neighborhood of the previous
    /// allocation.
    pub fn alloc_chunk(&mut self) -> Result<Chunk> {
        let found = match self.scan_free(self.sb.last_alloc, self.sb.chunks)? {
            Some(chunk) => chunk,
            None => self
                .scan_free(0, self.sb.last_alloc)?
                .ok_or(Error::StoreFull)?,
        };
        self.set_bit(found)?;
        self.sb.last_alloc = found;
        self.sb.free_chunks -= 1;
        self.sb_dirty = true;
        trace!(chunk = found, free = self.sb.free_chunks, "allocated chunk");
        Ok(found)
    }

    /// Return a chunk to the free pool. Freeing an unallocated chunk
    /// means the tree and the bitmap disagree, which is not survivable.
    pub fn free_chunk(&mut self, chunk: Chunk) -> Result<()> {
        let bits = self.bits_per_block();
        let buf = self.bitmap_buf(chunk)?;
        {
            let mut b = buf.borrow_mut();
            let idx = ((chunk % bits) / 8) as usize;
            let mask = 1u8 << (chunk % 8);
            assert!(
                b.data[idx] & mask != 0,
                "freeing chunk {chunk} that is not allocated"
            );
            b.data[idx] &= !mask;
        }
        self.cache.mark_dirty(&buf);
        self.sb.free_chunks += 1;
        self.sb_dirty = true;
        trace!(chunk, free = self.sb.free_chunks, "freed chunk");
        Ok(())
    }

    /// First clear bit in `[from, to)`, skipping fully allocated bytes.
    fn scan_free(&mut self, from: Chunk, to: Chunk) -> Result<Option<Chunk>> {
        let bits = self.bits_per_block();
        let mut bit = from;
        while bit < to {
            let block_end = ((bit / bits + 1) * bits).min(to);
            let buf = self.bitmap_buf(bit)?;
            let b = buf.borrow();
            while bit < block_end {
                let byte_base = bit & !7;
                let byte = b.data[((byte_base % bits) / 8) as usize];
                if byte != 0xff {
                    for offset in (bit - byte_base)..8 {
                        let candidate = byte_base + offset;
                        if candidate >= block_end {
                            break;
                        }
                        if byte & (1 << offset) == 0 {
                            return Ok(Some(candidate));
                        }
                    }
                }
                bit = byte_base + 8;
            }
        }
        Ok(None)
    }

    /// Lay out a fresh allocation bitmap: zero it, fence off the bits
    /// past the end of the store, and reserve the header and bitmap
    /// chunks themselves.
    pub(crate) fn init_allocation(&mut self) -> Result<()> {
        let bits = self.bits_per_block();
        let chunk_size = self.sb.chunk_size() as u64;
        let header_bytes = (SUPERBLOCK_SECTOR << SECTOR_BITS) + SUPERBLOCK_SIZE as u64;
        let base_chunk = header_bytes.div_ceil(chunk_size);
        let bitmap_blocks = self.sb.chunks.div_ceil(bits);
        self.sb.bitmap_base = self.chunk_sector(base_chunk);
        self.sb.bitmap_blocks = bitmap_blocks as u32;

        for block in 0..bitmap_blocks {
            let sector = self.sb.bitmap_base + block * self.sectors_per_block();
            let buf = self.cache.get(sector);
            buf.borrow_mut().data.fill(0);
            self.cache.mark_dirty(&buf);
        }

        // bits beyond the last chunk must never be handed out
        let tail = (self.sb.chunks % bits) as usize;
        if tail != 0 {
            let buf = self.bitmap_buf(self.sb.chunks - 1)?;
            let mut b = buf.borrow_mut();
            let mut byte = tail / 8;
            if tail % 8 != 0 {
                b.data[byte] |= 0xffu8 << (tail % 8);
                byte += 1;
            }
            for slot in byte..b.data.len() {
                b.data[slot] = 0xff;
            }
        }

        let reserved = base_chunk + bitmap_blocks;
        for chunk in 0..reserved {
            self.set_bit(chunk)?;
        }
        self.sb.free_chunks = self.sb.chunks - reserved;
        self.sb.last_alloc = 0;
        self.sb_dirty = true;
        Ok(())
    }
}
