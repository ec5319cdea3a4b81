//! On-disk inodes and file block mapping
//!
//! Inode format (128 bytes, little-endian):
//! ```text
//! +------+-------+------------+------+---------------+-----------------+
//! | Kind | Nlink | Generation | Size | Shrink target | Blocks[12]      |
//! | 4B   | 4B    | 8B         | 8B   | 8B            | 8B * 12         |
//! +------+-------+------------+------+---------------+-----------------+
//! ```
//!
//! `Blocks[0..10]` are direct pointers, `Blocks[10]` is single indirect and
//! `Blocks[11]` double indirect. A zero pointer is a hole that reads as
//! zeros, and a zero parent pointer means its whole subtree is free.
//!
//! `shrink_target` is the block count the allocation still extends to.
//! It equals `nblocks()` when the inode is idle; anything larger means
//! blocks in `[nblocks(), shrink_target)` are waiting for the shrinker.

use crate::layout::INODE_SIZE;
use crate::op::FsOp;
use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;
use walfs_common::{BLOCK_SIZE, Bnum, Error, Handle, Inum, Result};

/// Number of direct pointers
pub const NDIRECT: u64 = 10;

/// Slot of the single-indirect pointer
pub const INDIRECT: usize = 10;

/// Slot of the double-indirect pointer
pub const DINDIRECT: usize = 11;

/// Pointer slots in an inode
pub const NBLKS: usize = 12;

/// Pointers per indirect block
pub const NPTR: u64 = (BLOCK_SIZE / 8) as u64;

/// Largest file in blocks
pub const MAX_FILE_BLOCKS: u64 = NDIRECT + NPTR + NPTR * NPTR;

/// Inode type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InodeKind {
    /// Unallocated
    Free = 0,
    /// Regular file
    File = 1,
}

impl InodeKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::File),
            _ => None,
        }
    }
}

/// A decoded inode
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    pub inum: Inum,
    pub kind: InodeKind,
    pub nlink: u32,
    pub generation: u64,
    pub size: u64,
    pub shrink_target: u64,
    pub blks: [Bnum; NBLKS],
}

/// Which pointer tree a logical block index falls into
enum Slot {
    Direct(usize),
    Indirect { root: usize, level: u32, off: u64 },
    /// Past the largest file; always a hole
    Beyond,
}

fn classify(idx: u64) -> Slot {
    if idx < NDIRECT {
        Slot::Direct(idx as usize)
    } else if idx < NDIRECT + NPTR {
        Slot::Indirect {
            root: INDIRECT,
            level: 1,
            off: idx - NDIRECT,
        }
    } else if idx < MAX_FILE_BLOCKS {
        Slot::Indirect {
            root: DINDIRECT,
            level: 2,
            off: idx - NDIRECT - NPTR,
        }
    } else {
        Slot::Beyond
    }
}

/// One step of a walk down an indirect tree
#[derive(Clone, Copy, Debug)]
struct Frame {
    node: Bnum,
    slot: u64,
    /// Index remaining inside the child's subtree
    rest: u64,
}

impl Inode {
    /// Decode from the inode's bytes
    pub fn decode(inum: Inum, data: &[u8]) -> Result<Self> {
        if data.len() != INODE_SIZE {
            return Err(Error::corrupted(format!(
                "inode {inum}: {} bytes, expected {INODE_SIZE}",
                data.len()
            )));
        }
        let mut buf = data;
        let raw_kind = buf.get_u32_le();
        let kind = InodeKind::from_u32(raw_kind)
            .ok_or_else(|| Error::corrupted(format!("inode {inum}: unknown kind {raw_kind}")))?;
        let nlink = buf.get_u32_le();
        let generation = buf.get_u64_le();
        let size = buf.get_u64_le();
        let shrink_target = buf.get_u64_le();
        let mut blks = [0; NBLKS];
        for b in &mut blks {
            *b = buf.get_u64_le();
        }
        Ok(Self {
            inum,
            kind,
            nlink,
            generation,
            size,
            shrink_target,
            blks,
        })
    }

    /// Encode to the inode's bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(INODE_SIZE);
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(self.nlink);
        buf.put_u64_le(self.generation);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.shrink_target);
        for b in &self.blks {
            buf.put_u64_le(*b);
        }
        buf.to_vec()
    }

    /// Handle naming this incarnation of the inode
    #[must_use]
    pub const fn handle(&self) -> Handle {
        Handle::new(self.inum, self.generation)
    }

    /// Logical size in blocks
    #[must_use]
    pub const fn nblocks(&self) -> u64 {
        self.size.div_ceil(BLOCK_SIZE as u64)
    }

    /// True while blocks beyond the logical size are still allocated
    #[must_use]
    pub const fn is_shrinking(&self) -> bool {
        self.shrink_target > self.nblocks()
    }

    /// Find the block backing logical index `idx` (0 for a hole)
    pub fn bmap(&self, op: &mut FsOp, idx: u64) -> Result<Bnum> {
        match classify(idx) {
            Slot::Direct(i) => Ok(self.blks[i]),
            Slot::Indirect { root, level, off } => {
                let mut node = self.blks[root];
                let mut rest = off;
                for lvl in (1..=level).rev() {
                    if node == 0 {
                        return Ok(0);
                    }
                    let divisor = NPTR.pow(lvl - 1);
                    node = op.read_ptr(node, rest / divisor)?;
                    rest %= divisor;
                }
                Ok(node)
            }
            Slot::Beyond => Ok(0),
        }
    }

    /// Find or allocate the block backing logical index `idx`
    fn bmap_alloc(&mut self, op: &mut FsOp, idx: u64) -> Result<Bnum> {
        match classify(idx) {
            Slot::Direct(i) => {
                if self.blks[i] == 0 {
                    self.blks[i] = op.alloc_block()?;
                }
                Ok(self.blks[i])
            }
            Slot::Indirect { root, level, off } => {
                if self.blks[root] == 0 {
                    self.blks[root] = op.alloc_block()?;
                }
                let mut node = self.blks[root];
                let mut rest = off;
                for lvl in (1..=level).rev() {
                    let divisor = NPTR.pow(lvl - 1);
                    let slot = rest / divisor;
                    rest %= divisor;
                    let mut child = op.read_ptr(node, slot)?;
                    if child == 0 {
                        child = op.alloc_block()?;
                        op.write_ptr(node, slot, child)?;
                    }
                    node = child;
                }
                Ok(node)
            }
            Slot::Beyond => Err(Error::invalid_argument(format!(
                "block index {idx} beyond largest file"
            ))),
        }
    }

    /// Free the block at logical index `idx` and any indirect blocks that
    /// become empty
    ///
    /// Indices must be freed from the highest allocated one downward: a
    /// subtree is released when the index at its start is freed.
    pub(crate) fn free_index(&mut self, op: &mut FsOp, idx: u64) -> Result<()> {
        match classify(idx) {
            Slot::Direct(i) => {
                if self.blks[i] != 0 {
                    op.free_block(self.blks[i])?;
                    self.blks[i] = 0;
                }
            }
            Slot::Indirect { root, level, off } => {
                let top = self.blks[root];
                if top != 0 && free_in_tree(op, top, level, off)? {
                    op.free_block(top)?;
                    self.blks[root] = 0;
                }
            }
            Slot::Beyond => {}
        }
        Ok(())
    }

    /// Read up to `len` bytes at `off`, stopping at end of file
    pub fn read(&self, op: &mut FsOp, off: u64, len: usize) -> Result<Vec<u8>> {
        if off >= self.size {
            return Ok(Vec::new());
        }
        let end = self.size.min(off.saturating_add(len as u64));
        let mut out = Vec::with_capacity((end - off) as usize);
        let mut pos = off;
        while pos < end {
            let idx = pos / BLOCK_SIZE as u64;
            let boff = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - boff).min((end - pos) as usize);
            let bn = self.bmap(op, idx)?;
            if bn == 0 {
                out.resize(out.len() + n, 0);
            } else {
                let buf = op.read_block(bn)?;
                out.extend_from_slice(&buf.data()[boff..boff + n]);
            }
            pos += n as u64;
        }
        Ok(out)
    }

    /// Write `data` at `off`, allocating blocks and extending the size
    ///
    /// The caller persists the inode with `FsOp::write_inode`.
    pub fn write(&mut self, op: &mut FsOp, off: u64, data: &[u8]) -> Result<usize> {
        let end = off
            .checked_add(data.len() as u64)
            .filter(|end| end.div_ceil(BLOCK_SIZE as u64) <= MAX_FILE_BLOCKS)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "write of {} bytes at {off} beyond largest file",
                    data.len()
                ))
            })?;
        let end_blocks = end.div_ceil(BLOCK_SIZE as u64);
        if self.is_shrinking() && end_blocks > self.nblocks() {
            return Err(Error::ShrinkInProgress { inum: self.inum });
        }

        let mut pos = off;
        let mut src = data;
        while !src.is_empty() {
            let idx = pos / BLOCK_SIZE as u64;
            let boff = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - boff).min(src.len());
            let bn = self.bmap_alloc(op, idx)?;
            if n == BLOCK_SIZE {
                op.overwrite_block(bn, src[..n].to_vec());
            } else {
                let buf = op.read_block(bn)?;
                buf.data_mut()[boff..boff + n].copy_from_slice(&src[..n]);
                buf.set_dirty();
            }
            src = &src[n..];
            pos += n as u64;
        }

        if end > self.size {
            self.size = end;
            self.shrink_target = self.shrink_target.max(self.nblocks());
        }
        Ok(data.len())
    }

    /// Change the logical size
    ///
    /// Growing only moves the size; the new range reads as zeros. Shrinking
    /// frees direct blocks at once and leaves anything reaching indirect
    /// blocks to the shrinker, which runs after this transaction commits.
    /// The inode is written to `op`.
    pub fn truncate(&mut self, op: &mut FsOp, size: u64) -> Result<()> {
        let old_blocks = self.nblocks();
        let new_blocks = size.div_ceil(BLOCK_SIZE as u64);

        if size >= self.size {
            if self.is_shrinking() && new_blocks > old_blocks {
                return Err(Error::ShrinkInProgress { inum: self.inum });
            }
            if new_blocks > MAX_FILE_BLOCKS {
                return Err(Error::invalid_argument(format!("size {size} beyond largest file")));
            }
            self.size = size;
            self.shrink_target = self.shrink_target.max(new_blocks);
            op.write_inode(self);
            return Ok(());
        }

        // Stale bytes past the new end would reappear if the file grows.
        let tail = (size % BLOCK_SIZE as u64) as usize;
        if tail != 0 {
            let bn = self.bmap(op, size / BLOCK_SIZE as u64)?;
            if bn != 0 {
                let buf = op.read_block(bn)?;
                buf.data_mut()[tail..].fill(0);
                buf.set_dirty();
            }
        }

        let target = self.shrink_target.max(old_blocks);
        self.size = size;
        if target <= NDIRECT {
            for idx in (new_blocks..target).rev() {
                self.free_index(op, idx)?;
            }
            self.shrink_target = new_blocks;
        } else {
            debug!(
                "inode {} shrink scheduled from {} to {} blocks",
                self.inum, target, new_blocks
            );
            self.shrink_target = target;
            op.schedule_shrink(self.inum);
        }
        op.write_inode(self);
        Ok(())
    }

    /// Drop one link; at zero links the file is truncated and the inode
    /// freed once its blocks are gone
    pub fn unlink(&mut self, op: &mut FsOp) -> Result<()> {
        if self.nlink == 0 {
            return Err(Error::invalid_argument(format!("inode {} has no links", self.inum)));
        }
        self.nlink -= 1;
        if self.nlink > 0 {
            op.write_inode(self);
            return Ok(());
        }
        self.truncate(op, 0)?;
        if !self.is_shrinking() {
            op.free_inode(self)?;
        }
        Ok(())
    }

    /// Every block this inode references, indirect blocks included
    pub fn referenced_blocks(&self, op: &mut FsOp) -> Result<Vec<Bnum>> {
        let mut out: Vec<Bnum> = self.blks[..NDIRECT as usize]
            .iter()
            .copied()
            .filter(|&b| b != 0)
            .collect();
        let mut stack: Vec<(Bnum, u32)> = [(self.blks[INDIRECT], 1), (self.blks[DINDIRECT], 2)]
            .into_iter()
            .filter(|&(b, _)| b != 0)
            .collect();
        while let Some((node, level)) = stack.pop() {
            out.push(node);
            for slot in 0..NPTR {
                let child = op.read_ptr(node, slot)?;
                if child == 0 {
                    continue;
                }
                if level > 1 {
                    stack.push((child, level - 1));
                } else {
                    out.push(child);
                }
            }
        }
        Ok(out)
    }
}

/// Free index `off` inside the tree rooted at `root` of height `level`
///
/// Walks down with an explicit stack, then unwinds clearing pointers to
/// children that became empty. Returns true when `root` itself is now
/// empty and may be freed by the caller.
fn free_in_tree(op: &mut FsOp, root: Bnum, level: u32, off: u64) -> Result<bool> {
    let mut frames: Vec<(Frame, Bnum)> = Vec::with_capacity(level as usize);
    let mut node = root;
    let mut rest = off;
    for lvl in (1..=level).rev() {
        let divisor = NPTR.pow(lvl - 1);
        let frame = Frame {
            node,
            slot: rest / divisor,
            rest: rest % divisor,
        };
        let child = op.read_ptr(node, frame.slot)?;
        frames.push((frame, child));
        if child == 0 {
            break;
        }
        node = child;
        rest = frame.rest;
    }

    // A data block is always released; an indirect block only when the
    // index freed was the first of its subtree.
    let mut child_empty = true;
    while let Some((frame, child)) = frames.pop() {
        if child != 0 && child_empty {
            op.write_ptr(frame.node, frame.slot, 0)?;
            op.free_block(child)?;
        }
        child_empty = frame.slot == 0 && frame.rest == 0;
    }
    Ok(child_empty)
}
