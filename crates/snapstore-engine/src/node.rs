//! Exception tree node formats
//!
//! Two block formats, both little-endian and operated on in place:
//!
//! **Leaf** blocks hold the exception records for a run of logical
//! chunks. A directory of `{offset, rchunk}` entries grows up from the
//! header, sorted by chunk; the records themselves, `{share, chunk}`
//! pairs, are packed at the top of the block growing down. Entry `i`'s
//! records occupy byte range `[offset[i], offset[i+1])`, with a
//! sentinel entry at index `count` always holding the block size. Free
//! space is the gap between the end of the directory and `offset[0]`.
//!
//! **Index** blocks are flat sorted arrays of `{key, sector}` pairs;
//! the key of entry 0 is never consulted.

/// Leaf block magic
pub const LEAF_MAGIC: u16 = 0x1eaf;

/// Leaf format version
pub const LEAF_VERSION: u16 = 1;

const LEAF_HEADER_SIZE: usize = 16;
const DIR_ENTRY_SIZE: usize = 8;
const RECORD_SIZE: usize = 16;

const INDEX_HEADER_SIZE: usize = 8;
const INDEX_ENTRY_SIZE: usize = 16;

fn get_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(data[at..at + 2].try_into().unwrap())
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn get_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

fn put_u16(data: &mut [u8], at: usize, v: u16) {
    data[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(data: &mut [u8], at: usize, v: u32) {
    data[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(data: &mut [u8], at: usize, v: u64) {
    data[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

// ── Leaf blocks ───────────────────────────────────────────────────────────────

/// Mutable view over a leaf block.
pub struct Leaf<'a> {
    data: &'a mut [u8],
}

impl<'a> Leaf<'a> {
    /// Format a block as an empty leaf.
    pub fn init(data: &mut [u8], base_chunk: u64) {
        let block_size = data.len();
        data.fill(0);
        put_u16(data, 0, LEAF_MAGIC);
        put_u16(data, 2, LEAF_VERSION);
        put_u32(data, 4, 0);
        put_u64(data, 8, base_chunk);
        // sentinel
        put_u32(data, LEAF_HEADER_SIZE, block_size as u32);
    }

    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert_eq!(get_u16(data, 0), LEAF_MAGIC);
        Self { data }
    }

    fn block_size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        get_u32(self.data, 4) as usize
    }

    fn set_count(&mut self, count: usize) {
        put_u32(self.data, 4, count as u32);
    }

    #[must_use]
    pub fn base_chunk(&self) -> u64 {
        get_u64(self.data, 8)
    }

    fn dir_offset(&self, i: usize) -> usize {
        get_u32(self.data, LEAF_HEADER_SIZE + i * DIR_ENTRY_SIZE) as usize
    }

    fn dir_rchunk(&self, i: usize) -> u32 {
        get_u32(self.data, LEAF_HEADER_SIZE + i * DIR_ENTRY_SIZE + 4)
    }

    fn set_dir(&mut self, i: usize, offset: usize, rchunk: u32) {
        put_u32(self.data, LEAF_HEADER_SIZE + i * DIR_ENTRY_SIZE, offset as u32);
        put_u32(self.data, LEAF_HEADER_SIZE + i * DIR_ENTRY_SIZE + 4, rchunk);
    }

    fn set_dir_offset(&mut self, i: usize, offset: usize) {
        put_u32(self.data, LEAF_HEADER_SIZE + i * DIR_ENTRY_SIZE, offset as u32);
    }

    fn record_share(&self, at: usize) -> u64 {
        get_u64(self.data, at)
    }

    fn record_chunk(&self, at: usize) -> u64 {
        get_u64(self.data, at + 8)
    }

    fn set_record(&mut self, at: usize, share: u64, chunk: u64) {
        put_u64(self.data, at, share);
        put_u64(self.data, at + 8, chunk);
    }

    /// Bytes available between the directory and the record area.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.dir_offset(0) - (LEAF_HEADER_SIZE + (self.count() + 1) * DIR_ENTRY_SIZE)
    }

    /// First directory index whose chunk is >= `rchunk`.
    fn find(&self, rchunk: u32) -> usize {
        let count = self.count();
        (0..count)
            .find(|&i| self.dir_rchunk(i) >= rchunk)
            .unwrap_or(count)
    }

    fn exact(&self, rchunk: u32) -> Option<usize> {
        let i = self.find(rchunk);
        (i < self.count() && self.dir_rchunk(i) == rchunk).then_some(i)
    }

    /// An origin chunk is writable in place when no snapshot still
    /// shares it: every live snapshot bit is covered by some record.
    #[must_use]
    pub fn origin_unique(&self, rchunk: u32, snapmask: u64) -> bool {
        match self.exact(rchunk) {
            None => snapmask == 0,
            Some(i) => {
                let (start, end) = (self.dir_offset(i), self.dir_offset(i + 1));
                let mut using = 0u64;
                let mut at = start;
                while at < end {
                    using |= self.record_share(at);
                    at += RECORD_SIZE;
                }
                !using & snapmask == 0
            }
        }
    }

    /// Find the snapshot's exception for a chunk, if any, and whether
    /// the snapshot owns it exclusively.
    #[must_use]
    pub fn snapshot_probe(&self, rchunk: u32, bit: u8) -> (Option<u64>, bool) {
        let mask = 1u64 << bit;
        let Some(i) = self.exact(rchunk) else {
            return (None, false);
        };
        let (start, end) = (self.dir_offset(i), self.dir_offset(i + 1));
        let mut at = start;
        while at < end {
            let share = self.record_share(at);
            if share & mask != 0 {
                return (Some(self.record_chunk(at)), share == mask);
            }
            at += RECORD_SIZE;
        }
        (None, false)
    }

    /// Add an exception record for `rchunk`. `snap_bit` is `None` when
    /// the origin is being made unique, in which case the new record is
    /// shared by every live snapshot not already excepted; for a
    /// snapshot, the bit moves from whichever record held it onto the
    /// new record. Returns `false` when the leaf has no room, leaving
    /// it unmodified; the caller splits and retries.
    pub fn add_exception(
        &mut self,
        rchunk: u32,
        exception: u64,
        snap_bit: Option<u8>,
        active_mask: u64,
    ) -> bool {
        let count = self.count();
        let i = self.find(rchunk);
        let maptop = LEAF_HEADER_SIZE + (count + 1) * DIR_ENTRY_SIZE;
        let bottom = self.dir_offset(0);
        let free = bottom - maptop;
        let exact = i < count && self.dir_rchunk(i) == rchunk;

        let sharemap;
        if exact {
            if free < RECORD_SIZE {
                return false;
            }
            let (start, end) = (self.dir_offset(i), self.dir_offset(i + 1));
            match snap_bit {
                None => {
                    let mut using = 0u64;
                    let mut at = start;
                    while at < end {
                        using |= self.record_share(at);
                        at += RECORD_SIZE;
                    }
                    sharemap = !using & active_mask;
                }
                Some(bit) => {
                    let mask = 1u64 << bit;
                    let mut at = start;
                    while at < end {
                        let share = self.record_share(at);
                        if share & mask != 0 {
                            put_u64(self.data, at, share & !mask);
                            break;
                        }
                        at += RECORD_SIZE;
                    }
                    sharemap = mask;
                }
            }
        } else {
            if free < RECORD_SIZE + DIR_ENTRY_SIZE {
                return false;
            }
            // shift directory entries [i..=count] up one slot,
            // sentinel included; slot i keeps the offset it inherited
            let src = LEAF_HEADER_SIZE + i * DIR_ENTRY_SIZE;
            let end = LEAF_HEADER_SIZE + (count + 1) * DIR_ENTRY_SIZE;
            self.data.copy_within(src..end, src + DIR_ENTRY_SIZE);
            let offset = self.dir_offset(i);
            self.set_dir(i, offset, rchunk);
            self.set_count(count + 1);
            sharemap = match snap_bit {
                None => active_mask,
                Some(bit) => 1u64 << bit,
            };
        }

        // prepend the record to run i: slide everything below the run
        // down one record and pull the affected offsets with it
        let run_start = self.dir_offset(i);
        self.data
            .copy_within(bottom..run_start, bottom - RECORD_SIZE);
        for j in 0..=i {
            let off = self.dir_offset(j);
            self.set_dir_offset(j, off - RECORD_SIZE);
        }
        let at = self.dir_offset(i);
        self.set_record(at, sharemap, exception);
        true
    }

    /// Split the upper half of this leaf into `other` (an unformatted
    /// block of the same size), returning the first absolute chunk of
    /// the new leaf.
    pub fn split(&mut self, other: &mut [u8]) -> u64 {
        let count = self.count();
        let nhead = (count + 1) / 2;
        let ntail = count - nhead;
        let splitpoint = u64::from(self.dir_rchunk(nhead)) + self.base_chunk();

        let block_size = self.block_size();
        let ptail = self.dir_offset(nhead);
        let tailsize = block_size - ptail;

        // new leaf: same header, upper directory half (sentinel
        // included), tail records kept at identical byte offsets
        other[..LEAF_HEADER_SIZE].copy_from_slice(&self.data[..LEAF_HEADER_SIZE]);
        let src = LEAF_HEADER_SIZE + nhead * DIR_ENTRY_SIZE;
        let len = (ntail + 1) * DIR_ENTRY_SIZE;
        other[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + len]
            .copy_from_slice(&self.data[src..src + len]);
        other[ptail..block_size].copy_from_slice(&self.data[ptail..block_size]);
        put_u32(other, 4, ntail as u32);

        // this leaf: slide the lower-half records to the top of the
        // block and turn the split entry into the sentinel
        let phead = self.dir_offset(0);
        self.data.copy_within(phead..ptail, phead + tailsize);
        self.set_count(nhead);
        for j in 0..=nhead {
            let off = self.dir_offset(j);
            self.set_dir_offset(j, off + tailsize);
        }
        let off = self.dir_offset(nhead);
        self.set_dir(nhead, off, 0);

        splitpoint
    }

    /// Clear `mask` from every record, dropping records whose share
    /// becomes empty and compacting both the record area and the
    /// directory. Returns whether anything changed, plus the exception
    /// chunks freed for reuse.
    pub fn delete_snapshots(&mut self, mask: u64) -> (bool, Vec<u64>) {
        let count = self.count();
        let mut freed = Vec::new();
        let mut changed = false;

        // walk records top down, compacting survivors toward the top
        let mut p = self.dir_offset(count);
        let mut dest = p;
        for i in (0..count).rev() {
            let run_start = self.dir_offset(i);
            while p > run_start {
                p -= RECORD_SIZE;
                let share = self.record_share(p);
                let survivor = share & !mask;
                if survivor != share {
                    changed = true;
                }
                if survivor != 0 {
                    dest -= RECORD_SIZE;
                    let chunk = self.record_chunk(p);
                    self.set_record(dest, survivor, chunk);
                } else {
                    freed.push(self.record_chunk(p));
                }
            }
            self.set_dir_offset(i, dest);
        }

        // drop directory entries whose runs became empty
        let mut kept = 0;
        for i in 0..count {
            if self.dir_offset(i) != self.dir_offset(i + 1) {
                let (off, rchunk) = (self.dir_offset(i), self.dir_rchunk(i));
                self.set_dir(kept, off, rchunk);
                kept += 1;
            }
        }
        let sentinel = self.dir_offset(count);
        self.set_dir(kept, sentinel, 0);
        if kept != count {
            changed = true;
        }
        self.set_count(kept);

        (changed, freed)
    }

    /// Append a human-readable rendering of this leaf to `out`.
    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let count = self.count();
        writeln!(
            out,
            "  leaf: base={} count={} free={}",
            self.base_chunk(),
            count,
            self.free_space()
        )
        .unwrap();
        for i in 0..count {
            let chunk = self.base_chunk() + u64::from(self.dir_rchunk(i));
            write!(out, "    chunk {chunk}:").unwrap();
            let (start, end) = (self.dir_offset(i), self.dir_offset(i + 1));
            let mut at = start;
            while at < end {
                write!(
                    out,
                    " {}/{:016x}",
                    self.record_chunk(at),
                    self.record_share(at)
                )
                .unwrap();
                at += RECORD_SIZE;
            }
            writeln!(out).unwrap();
        }
    }

    /// All records for a chunk, lowest-index run entry first. Test and
    /// dump helper.
    #[must_use]
    pub fn records(&self, rchunk: u32) -> Vec<(u64, u64)> {
        let Some(i) = self.exact(rchunk) else {
            return Vec::new();
        };
        let (start, end) = (self.dir_offset(i), self.dir_offset(i + 1));
        (start..end)
            .step_by(RECORD_SIZE)
            .map(|at| (self.record_share(at), self.record_chunk(at)))
            .collect()
    }

    /// Chunks (absolute) present in this leaf, in directory order.
    #[must_use]
    pub fn chunks(&self) -> Vec<u64> {
        (0..self.count())
            .map(|i| self.base_chunk() + u64::from(self.dir_rchunk(i)))
            .collect()
    }
}

// ── Index nodes ───────────────────────────────────────────────────────────────

/// Mutable view over an index node block.
pub struct IndexNode<'a> {
    data: &'a mut [u8],
}

impl<'a> IndexNode<'a> {
    /// Format a block as an empty index node.
    pub fn init(data: &mut [u8]) {
        data.fill(0);
    }

    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Entries that fit in one block.
    #[must_use]
    pub fn capacity(block_size: usize) -> usize {
        (block_size - INDEX_HEADER_SIZE) / INDEX_ENTRY_SIZE
    }

    #[must_use]
    pub fn count(&self) -> usize {
        get_u32(self.data, 0) as usize
    }

    fn set_count(&mut self, count: usize) {
        put_u32(self.data, 0, count as u32);
    }

    #[must_use]
    pub fn key(&self, i: usize) -> u64 {
        get_u64(self.data, INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE)
    }

    #[must_use]
    pub fn sector(&self, i: usize) -> u64 {
        get_u64(self.data, INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE + 8)
    }

    fn set_entry(&mut self, i: usize, key: u64, sector: u64) {
        put_u64(self.data, INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE, key);
        put_u64(
            self.data,
            INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE + 8,
            sector,
        );
    }

    /// Insert an entry at position `at`, shifting the tail up.
    pub fn insert(&mut self, at: usize, key: u64, sector: u64) {
        let count = self.count();
        debug_assert!(at <= count);
        let src = INDEX_HEADER_SIZE + at * INDEX_ENTRY_SIZE;
        let end = INDEX_HEADER_SIZE + count * INDEX_ENTRY_SIZE;
        self.data.copy_within(src..end, src + INDEX_ENTRY_SIZE);
        self.set_entry(at, key, sector);
        self.set_count(count + 1);
    }

    /// Append an entry at the end.
    pub fn append(&mut self, key: u64, sector: u64) {
        let count = self.count();
        self.set_entry(count, key, sector);
        self.set_count(count + 1);
    }

    /// Move the upper half of the entries into `other` (an unformatted
    /// block). Returns the promoted key and the number of entries kept.
    pub fn split(&mut self, other: &mut [u8]) -> (u64, usize) {
        let count = self.count();
        let half = count / 2;
        let newkey = self.key(half);
        let moved = count - half;

        Self::init(other);
        let src = INDEX_HEADER_SIZE + half * INDEX_ENTRY_SIZE;
        let len = moved * INDEX_ENTRY_SIZE;
        other[INDEX_HEADER_SIZE..INDEX_HEADER_SIZE + len]
            .copy_from_slice(&self.data[src..src + len]);
        put_u32(other, 0, moved as u32);
        self.set_count(half);

        (newkey, half)
    }

    /// Child to descend into for `chunk`, and the insertion position a
    /// new right sibling of that child would take.
    #[must_use]
    pub fn probe(&self, chunk: u64) -> (u64, usize) {
        let count = self.count();
        let mut i = 1;
        while i < count && self.key(i) <= chunk {
            i += 1;
        }
        (self.sector(i - 1), i)
    }
}
