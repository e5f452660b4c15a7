//! Chunk copy engine
//!
//! Moves chunk data from the origin (or from an older exception on the
//! snapshot store) into freshly allocated exception chunks. Adjacent
//! copies from the same source are coalesced into one transfer so a
//! sequential write burst over untouched chunks costs one read and one
//! write instead of one pair per chunk.
//!
//! Copies bypass the metadata block cache; ordering against metadata is
//! handled by the store, which flushes this engine before flushing
//! dirty blocks.

use crate::device::BlockDevice;
use snapstore_common::{Chunk, Result};
use tracing::trace;

/// Upper bound on the chunks batched into one transfer.
pub const COPY_BUFFER_CHUNKS: usize = 32;

/// Where the data being copied currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySource {
    Origin,
    SnapStore,
}

/// A pending (possibly coalesced) chunk copy.
pub struct CopyEngine {
    chunk_size: usize,
    buf: Vec<u8>,
    source: CopySource,
    source_chunk: Chunk,
    dest_chunk: Chunk,
    chunks: usize,
}

impl CopyEngine {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            buf: Vec::new(),
            source: CopySource::Origin,
            source_chunk: 0,
            dest_chunk: 0,
            chunks: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.chunks == 0
    }

    /// Number of chunks in the pending transfer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.chunks
    }

    /// Queue a one-chunk copy. Extends the pending transfer when the
    /// new chunk is contiguous with it on both sides; otherwise the
    /// pending transfer is flushed first.
    pub fn schedule(
        &mut self,
        origin: &BlockDevice,
        snapstore: &BlockDevice,
        source: CopySource,
        source_chunk: Chunk,
        dest_chunk: Chunk,
    ) -> Result<()> {
        let extends = self.chunks > 0
            && self.chunks < COPY_BUFFER_CHUNKS
            && source == self.source
            && source_chunk == self.source_chunk + self.chunks as u64
            && dest_chunk == self.dest_chunk + self.chunks as u64;
        if extends {
            self.chunks += 1;
            return Ok(());
        }

        self.flush(origin, snapstore)?;
        self.source = source;
        self.source_chunk = source_chunk;
        self.dest_chunk = dest_chunk;
        self.chunks = 1;
        Ok(())
    }

    /// Perform the pending transfer, if any.
    pub fn flush(&mut self, origin: &BlockDevice, snapstore: &BlockDevice) -> Result<()> {
        if self.chunks == 0 {
            return Ok(());
        }
        let bytes = self.chunks * self.chunk_size;
        if self.buf.len() < bytes {
            self.buf.resize(bytes, 0);
        }
        trace!(
            source = ?self.source,
            source_chunk = self.source_chunk,
            dest_chunk = self.dest_chunk,
            chunks = self.chunks,
            "copying chunk data"
        );

        let src_offset = self.source_chunk * self.chunk_size as u64;
        match self.source {
            CopySource::Origin => origin.read_at(src_offset, &mut self.buf[..bytes])?,
            CopySource::SnapStore => snapstore.read_at(src_offset, &mut self.buf[..bytes])?,
        }
        let dest_offset = self.dest_chunk * self.chunk_size as u64;
        snapstore.write_at(dest_offset, &self.buf[..bytes])?;

        self.chunks = 0;
        Ok(())
    }
}
