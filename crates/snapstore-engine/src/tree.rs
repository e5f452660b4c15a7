//! Exception B+tree operations
//!
//! The tree maps logical origin chunks to exception records. Index
//! nodes hold `{key, sector}` pairs; leaves hold the records
//! themselves (see [`crate::node`]). All traversal goes through the
//! block cache, and a probe remembers the insertion position at every
//! level so a later split can graft the new sibling in without
//! re-descending.

use crate::buffer::BufRef;
use crate::copy::CopySource;
use crate::node::{IndexNode, Leaf};
use crate::store::{SnapStore, UniqueOutcome};
use snapstore_common::{Chunk, Result, Sector};
use tracing::debug;

/// A root-to-leaf descent: each visited index node plus the position a
/// new right sibling of the descended child would be inserted at.
pub(crate) struct TreePath {
    nodes: Vec<(BufRef, usize)>,
    leaf: BufRef,
}

impl SnapStore {
    /// Descend from the root to the leaf covering `chunk`.
    pub(crate) fn probe(&mut self, chunk: Chunk) -> Result<TreePath> {
        let mut nodes = Vec::with_capacity(self.sb.tree_levels as usize);
        let mut sector = self.sb.tree_root;
        for _ in 0..self.sb.tree_levels {
            let buf = self.cache.read(&self.snapdev, sector)?;
            let (child, pnext) = {
                let mut b = buf.borrow_mut();
                let node = IndexNode::new(&mut b.data);
                node.probe(chunk)
            };
            nodes.push((buf, pnext));
            sector = child;
        }
        let leaf = self.cache.read(&self.snapdev, sector)?;
        Ok(TreePath { nodes, leaf })
    }

    /// Give the writer sole ownership of a chunk. `snap_bit` is `None`
    /// for an origin write, `Some(bit)` for a write into a snapshot.
    /// If any other party still shares the chunk its current contents
    /// are copied out to a fresh exception first.
    pub fn make_unique(&mut self, chunk: Chunk, snap_bit: Option<u8>) -> Result<UniqueOutcome> {
        let snapmask = self.sb.snapmask();
        let path = self.probe(chunk)?;

        let (source, source_chunk) = {
            let mut b = path.leaf.borrow_mut();
            let leaf = Leaf::new(&mut b.data);
            let rchunk = (chunk - leaf.base_chunk()) as u32;
            match snap_bit {
                None => {
                    if leaf.origin_unique(rchunk, snapmask) {
                        return Ok(UniqueOutcome {
                            exception: 0,
                            copied: false,
                        });
                    }
                    (CopySource::Origin, chunk)
                }
                Some(bit) => match leaf.snapshot_probe(rchunk, bit) {
                    (Some(exception), true) => {
                        return Ok(UniqueOutcome {
                            exception,
                            copied: false,
                        });
                    }
                    (Some(exception), false) => (CopySource::SnapStore, exception),
                    (None, _) => (CopySource::Origin, chunk),
                },
            }
        };

        let exception = self.alloc_chunk()?;
        self.copier.schedule(
            &self.origindev,
            &self.snapdev,
            source,
            source_chunk,
            exception,
        )?;
        self.insert_exception(&path, chunk, exception, snap_bit, snapmask)?;
        debug!(chunk, exception, ?snap_bit, "copied chunk out");
        Ok(UniqueOutcome {
            exception,
            copied: true,
        })
    }

    /// The exception a snapshot would read a chunk from, if it has one.
    pub fn snapshot_exception(&mut self, chunk: Chunk, bit: u8) -> Result<Option<Chunk>> {
        let path = self.probe(chunk)?;
        let mut b = path.leaf.borrow_mut();
        let leaf = Leaf::new(&mut b.data);
        let rchunk = (chunk - leaf.base_chunk()) as u32;
        Ok(leaf.snapshot_probe(rchunk, bit).0)
    }

    /// Record a new exception in the probed leaf, splitting upward as
    /// needed.
    fn insert_exception(
        &mut self,
        path: &TreePath,
        chunk: Chunk,
        exception: Chunk,
        snap_bit: Option<u8>,
        snapmask: u64,
    ) -> Result<()> {
        let added = {
            let mut b = path.leaf.borrow_mut();
            let mut leaf = Leaf::new(&mut b.data);
            let rchunk = (chunk - leaf.base_chunk()) as u32;
            leaf.add_exception(rchunk, exception, snap_bit, snapmask)
        };
        if added {
            self.cache.mark_dirty(&path.leaf);
            return Ok(());
        }

        // leaf is full: split it and insert into the proper half
        let newchunk = self.alloc_chunk()?;
        let newsector = self.chunk_sector(newchunk);
        let newbuf = self.cache.get(newsector);
        let splitpoint = {
            let mut old = path.leaf.borrow_mut();
            let mut new = newbuf.borrow_mut();
            let mut leaf = Leaf::new(&mut old.data);
            leaf.split(&mut new.data)
        };
        debug!(splitpoint, sector = newsector, "split leaf");
        {
            let target = if chunk >= splitpoint {
                &newbuf
            } else {
                &path.leaf
            };
            let mut b = target.borrow_mut();
            let mut leaf = Leaf::new(&mut b.data);
            let rchunk = (chunk - leaf.base_chunk()) as u32;
            assert!(
                leaf.add_exception(rchunk, exception, snap_bit, snapmask),
                "leaf has no room after split"
            );
        }
        self.cache.mark_dirty(&path.leaf);
        self.cache.mark_dirty(&newbuf);
        self.insert_child(&path.nodes, splitpoint, newsector)
    }

    /// Insert a `{key, sector}` pair into the index, splitting nodes
    /// bottom-up and growing a new root if the split reaches it.
    fn insert_child(
        &mut self,
        nodes: &[(BufRef, usize)],
        key: Chunk,
        sector: Sector,
    ) -> Result<()> {
        let capacity = IndexNode::capacity(self.sb.block_size());
        let mut childkey = key;
        let mut childsector = sector;

        for (buf, pnext) in nodes.iter().rev() {
            let inserted = {
                let mut b = buf.borrow_mut();
                let mut node = IndexNode::new(&mut b.data);
                if node.count() < capacity {
                    node.insert(*pnext, childkey, childsector);
                    true
                } else {
                    false
                }
            };
            if inserted {
                self.cache.mark_dirty(buf);
                return Ok(());
            }

            let newchunk = self.alloc_chunk()?;
            let newsector = self.chunk_sector(newchunk);
            let newbuf = self.cache.get(newsector);
            let (newkey, half) = {
                let mut old = buf.borrow_mut();
                let mut new = newbuf.borrow_mut();
                let mut node = IndexNode::new(&mut old.data);
                node.split(&mut new.data)
            };
            {
                let (target, at) = if *pnext > half {
                    (&newbuf, *pnext - half)
                } else {
                    (buf, *pnext)
                };
                let mut b = target.borrow_mut();
                let mut node = IndexNode::new(&mut b.data);
                node.insert(at, childkey, childsector);
            }
            self.cache.mark_dirty(buf);
            self.cache.mark_dirty(&newbuf);
            debug!(key = newkey, sector = newsector, "split index node");
            childkey = newkey;
            childsector = newsector;
        }

        // the root itself split: grow the tree by one level
        let rootchunk = self.alloc_chunk()?;
        let rootsector = self.chunk_sector(rootchunk);
        let rootbuf = self.cache.get(rootsector);
        {
            let mut b = rootbuf.borrow_mut();
            IndexNode::init(&mut b.data);
            let mut node = IndexNode::new(&mut b.data);
            node.append(0, self.sb.tree_root);
            node.append(childkey, childsector);
        }
        self.cache.mark_dirty(&rootbuf);
        self.sb.tree_root = rootsector;
        self.sb.tree_levels += 1;
        self.sb_dirty = true;
        debug!(
            root = rootsector,
            levels = self.sb.tree_levels,
            "grew tree root"
        );
        Ok(())
    }

    /// Strip the given share-mask bits from the whole tree, freeing
    /// exception chunks nothing references anymore.
    pub(crate) fn delete_snapshot_exceptions(&mut self, mask: u64) -> Result<()> {
        self.delete_from_node(self.sb.tree_root, self.sb.tree_levels, mask)
    }

    fn delete_from_node(&mut self, sector: Sector, level: u32, mask: u64) -> Result<()> {
        if level == 0 {
            let buf = self.cache.read(&self.snapdev, sector)?;
            let (changed, freed) = {
                let mut b = buf.borrow_mut();
                let mut leaf = Leaf::new(&mut b.data);
                leaf.delete_snapshots(mask)
            };
            if changed {
                self.cache.mark_dirty(&buf);
            }
            for chunk in freed {
                self.free_chunk(chunk)?;
            }
            return Ok(());
        }
        let children: Vec<Sector> = {
            let buf = self.cache.read(&self.snapdev, sector)?;
            let mut b = buf.borrow_mut();
            let node = IndexNode::new(&mut b.data);
            (0..node.count()).map(|i| node.sector(i)).collect()
        };
        for child in children {
            self.delete_from_node(child, level - 1, mask)?;
        }
        Ok(())
    }

    /// Render the whole tree for diagnostics.
    pub fn dump_tree(&mut self) -> Result<String> {
        use std::fmt::Write;
        let mut out = String::new();
        writeln!(
            out,
            "tree: root={} levels={} free={}",
            self.sb.tree_root, self.sb.tree_levels, self.sb.free_chunks
        )
        .unwrap();
        self.dump_node(self.sb.tree_root, self.sb.tree_levels, &mut out)?;
        Ok(out)
    }

    fn dump_node(&mut self, sector: Sector, level: u32, out: &mut String) -> Result<()> {
        use std::fmt::Write;
        if level == 0 {
            let buf = self.cache.read(&self.snapdev, sector)?;
            let mut b = buf.borrow_mut();
            let leaf = Leaf::new(&mut b.data);
            leaf.dump(out);
            return Ok(());
        }
        let children: Vec<(Chunk, Sector)> = {
            let buf = self.cache.read(&self.snapdev, sector)?;
            let mut b = buf.borrow_mut();
            let node = IndexNode::new(&mut b.data);
            (0..node.count())
                .map(|i| (node.key(i), node.sector(i)))
                .collect()
        };
        writeln!(out, "  index at {sector}: {} children", children.len()).unwrap();
        for (key, child) in children {
            writeln!(out, "  child >= {key} at {child}:").unwrap();
            self.dump_node(child, level - 1, out)?;
        }
        Ok(())
    }

    /// Build the minimal tree: one index root over one empty leaf.
    pub(crate) fn init_tree(&mut self) -> Result<()> {
        let leafchunk = self.alloc_chunk()?;
        let leafsector = self.chunk_sector(leafchunk);
        let leafbuf = self.cache.get(leafsector);
        {
            let mut b = leafbuf.borrow_mut();
            Leaf::init(&mut b.data, 0);
        }
        self.cache.mark_dirty(&leafbuf);

        let rootchunk = self.alloc_chunk()?;
        let rootsector = self.chunk_sector(rootchunk);
        let rootbuf = self.cache.get(rootsector);
        {
            let mut b = rootbuf.borrow_mut();
            IndexNode::init(&mut b.data);
            let mut node = IndexNode::new(&mut b.data);
            node.append(0, leafsector);
        }
        self.cache.mark_dirty(&rootbuf);

        self.sb.tree_root = rootsector;
        self.sb.tree_levels = 1;
        self.sb_dirty = true;
        Ok(())
    }
}
