//! File-system operations over a buffered transaction
//!
//! An [`FsOp`] pairs a [`BufTxn`] with the bookkeeping that keeps the
//! in-memory allocators consistent with what actually commits:
//! reservations made by an operation that aborts are handed back, frees
//! become visible only after commit, and shrinks requested by the
//! operation start only once it has committed.

use crate::alloc::Allocator;
use crate::buf::Buf;
use crate::buftxn::BufTxn;
use crate::inode::{Inode, InodeKind};
use crate::layout::Geometry;
use crate::shrinker::Shrinker;
use crate::txn::Txn;
use std::sync::Arc;
use tracing::{debug, warn};
use walfs_common::{Address, BLOCK_SIZE, Bnum, Error, Handle, Inum, NULL_INUM, Result, zero_block};

/// State shared by every operation on one engine instance
pub struct FsState {
    pub(crate) txn: Arc<Txn>,
    pub(crate) geo: Geometry,
    pub(crate) blocks: Allocator,
    pub(crate) inodes: Allocator,
    pub(crate) shrinker: Shrinker,
}

impl FsState {
    /// Disk geometry
    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Transaction manager
    #[must_use]
    pub const fn txn(&self) -> &Arc<Txn> {
        &self.txn
    }

    /// Block allocator
    #[must_use]
    pub const fn blocks(&self) -> &Allocator {
        &self.blocks
    }

    /// Inode allocator
    #[must_use]
    pub const fn inodes(&self) -> &Allocator {
        &self.inodes
    }

    /// Background shrinker
    #[must_use]
    pub const fn shrinker(&self) -> &Shrinker {
        &self.shrinker
    }
}

/// Allocator changes waiting on the outcome of the commit
struct Pending {
    state: Arc<FsState>,
    alloced_blocks: Vec<Bnum>,
    freed_blocks: Vec<Bnum>,
    alloced_inums: Vec<Inum>,
    freed_inums: Vec<Inum>,
    shrinks: Vec<Inum>,
}

impl Pending {
    fn new(state: Arc<FsState>) -> Self {
        Self {
            state,
            alloced_blocks: Vec::new(),
            freed_blocks: Vec::new(),
            alloced_inums: Vec::new(),
            freed_inums: Vec::new(),
            shrinks: Vec::new(),
        }
    }

    fn give_back(alloc: &Allocator, nums: &mut Vec<u64>) {
        for n in nums.drain(..) {
            if let Err(e) = alloc.free(n) {
                warn!("Failed to release {}: {}", n, e);
            }
        }
    }

    /// Apply the outcome of the commit to the allocators
    fn settle(&mut self, committed: bool) {
        let state = Arc::clone(&self.state);
        if committed {
            Self::give_back(&state.blocks, &mut self.freed_blocks);
            Self::give_back(&state.inodes, &mut self.freed_inums);
            self.alloced_blocks.clear();
            self.alloced_inums.clear();
            for inum in self.shrinks.drain(..) {
                state.shrinker.start(&state, inum);
            }
        } else {
            Self::give_back(&state.blocks, &mut self.alloced_blocks);
            Self::give_back(&state.inodes, &mut self.alloced_inums);
            self.freed_blocks.clear();
            self.freed_inums.clear();
            self.shrinks.clear();
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// One file-system operation
pub struct FsOp {
    btxn: BufTxn,
    pending: Pending,
}

impl FsOp {
    /// Start an operation
    pub fn begin(state: &Arc<FsState>) -> Self {
        Self {
            btxn: BufTxn::begin(Arc::clone(&state.txn)),
            pending: Pending::new(Arc::clone(state)),
        }
    }

    fn geo(&self) -> &Geometry {
        &self.pending.state.geo
    }

    /// The underlying buffered transaction
    pub fn btxn(&mut self) -> &mut BufTxn {
        &mut self.btxn
    }

    /// Number of dirty buffers
    #[must_use]
    pub fn ndirty(&self) -> usize {
        self.btxn.ndirty()
    }

    /// Log capacity in blocks
    #[must_use]
    pub fn log_capacity(&self) -> u64 {
        self.btxn.log_capacity()
    }

    fn check_inum(&self, inum: Inum) -> Result<()> {
        if inum == NULL_INUM || inum >= self.geo().ninodes {
            return Err(Error::not_found(format!("inode {inum}")));
        }
        Ok(())
    }

    fn check_data_block(&self, bn: Bnum) -> Result<()> {
        if !self.geo().is_data_block(bn) {
            return Err(Error::corrupted(format!(
                "block pointer {bn} outside data region"
            )));
        }
        Ok(())
    }

    /// Lock and load an inode
    pub fn get_inode(&mut self, inum: Inum) -> Result<Inode> {
        self.check_inum(inum)?;
        let addr = self.geo().inode_addr(inum);
        let buf = self.btxn.read_locked(addr)?;
        Inode::decode(inum, buf.data())
    }

    /// Lock and load the inode a handle names
    ///
    /// Fails with `Error::Stale` when the inode was freed or reused since
    /// the handle was issued.
    pub fn get_inode_handle(&mut self, handle: Handle) -> Result<Inode> {
        let ip = self.get_inode(handle.inum)?;
        // An unlinked inode still shrinking is gone to every handle holder.
        if ip.kind == InodeKind::Free || ip.nlink == 0 || ip.generation != handle.generation {
            return Err(Error::Stale {
                inum: handle.inum,
                generation: handle.generation,
            });
        }
        Ok(ip)
    }

    /// Write an inode back to this operation's buffer
    pub fn write_inode(&mut self, ip: &Inode) {
        let addr = self.geo().inode_addr(ip.inum);
        self.btxn.overwrite(addr, ip.encode());
    }

    /// Allocate a fresh file inode with one link
    pub fn alloc_inode(&mut self) -> Result<Inode> {
        let inum = self.pending.state.inodes.alloc().ok_or(Error::NoSpace)?;
        self.pending.alloced_inums.push(inum);

        let mut ip = self.get_inode(inum)?;
        if ip.kind != InodeKind::Free {
            return Err(Error::corrupted(format!(
                "inode {inum} free in bitmap but in use"
            )));
        }
        ip.kind = InodeKind::File;
        ip.nlink = 1;
        ip.generation += 1;
        ip.size = 0;
        ip.shrink_target = 0;
        ip.blks = Default::default();
        self.write_inode(&ip);

        let bit = self.geo().inode_bit(inum);
        self.btxn.overwrite(bit, vec![1]);
        debug!("allocated inode {} generation {}", inum, ip.generation);
        Ok(ip)
    }

    /// Mark an inode free; it becomes reusable once this operation commits
    pub fn free_inode(&mut self, ip: &mut Inode) -> Result<()> {
        self.check_inum(ip.inum)?;
        ip.kind = InodeKind::Free;
        ip.nlink = 0;
        self.write_inode(ip);

        let bit = self.geo().inode_bit(ip.inum);
        self.btxn.overwrite(bit, vec![0]);
        self.pending.freed_inums.push(ip.inum);
        debug!("freed inode {}", ip.inum);
        Ok(())
    }

    /// Lock and load a data block
    pub fn read_block(&mut self, bn: Bnum) -> Result<&mut Buf> {
        self.check_data_block(bn)?;
        self.btxn.read_locked(Address::block(bn))
    }

    /// Replace a data block's contents without reading it
    pub fn overwrite_block(&mut self, bn: Bnum, data: Vec<u8>) {
        self.btxn.overwrite(Address::block(bn), data);
    }

    /// Zero a data block
    pub fn zero_block(&mut self, bn: Bnum) {
        self.overwrite_block(bn, zero_block());
    }

    /// Read pointer `slot` of an indirect block
    pub fn read_ptr(&mut self, bn: Bnum, slot: u64) -> Result<Bnum> {
        let ptr = self.read_block(bn)?.get_u64(slot as usize * 8);
        if ptr != 0 {
            self.check_data_block(ptr)?;
        }
        Ok(ptr)
    }

    /// Set pointer `slot` of an indirect block
    pub fn write_ptr(&mut self, bn: Bnum, slot: u64, ptr: Bnum) -> Result<()> {
        debug_assert!((slot as usize) < BLOCK_SIZE / 8);
        self.read_block(bn)?.put_u64(slot as usize * 8, ptr);
        Ok(())
    }

    /// Allocate a zeroed data block
    pub fn alloc_block(&mut self) -> Result<Bnum> {
        let bn = self.pending.state.blocks.alloc().ok_or(Error::NoSpace)?;
        self.pending.alloced_blocks.push(bn);
        self.check_data_block(bn)?;

        let bit = self.geo().block_bit(bn);
        self.btxn.overwrite(bit, vec![1]);
        self.zero_block(bn);
        Ok(bn)
    }

    /// Free a data block; it becomes reusable once this operation commits
    pub fn free_block(&mut self, bn: Bnum) -> Result<()> {
        self.check_data_block(bn)?;
        let bit = self.geo().block_bit(bn);
        self.btxn.overwrite(bit, vec![0]);
        // Its contents no longer matter to this operation.
        if self.btxn.is_locked(Address::block(bn)) {
            self.btxn.release(Address::block(bn));
        }
        self.pending.freed_blocks.push(bn);
        Ok(())
    }

    /// Ask for `inum` to be shrunk after this operation commits
    pub fn schedule_shrink(&mut self, inum: Inum) {
        if !self.pending.shrinks.contains(&inum) {
            self.pending.shrinks.push(inum);
        }
    }

    /// Commit, optionally waiting for durability
    ///
    /// On failure nothing is committed and every reservation is undone.
    pub fn commit(self, wait: bool) -> Result<()> {
        let Self { btxn, mut pending } = self;
        let result = btxn.commit_wait(wait, false);
        pending.settle(result.is_ok());
        result
    }

    /// Abandon the operation
    pub fn abort(self) {
        let Self { btxn, mut pending } = self;
        btxn.abort();
        pending.settle(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::engine::Engine;
    use crate::inode::{MAX_FILE_BLOCKS, NDIRECT};
    use walfs_common::EngineConfig;

    fn engine() -> Engine {
        let disk = Arc::new(MemDisk::new(2048));
        let config = EngineConfig {
            log_capacity: 64,
            inode_blocks: 2,
            ..EngineConfig::default()
        };
        Engine::create(disk, &config).unwrap()
    }

    #[test]
    fn test_alloc_inode_bumps_generation() {
        let engine = engine();
        let mut op = engine.begin();
        let ip = op.alloc_inode().unwrap();
        assert_eq!(ip.kind, InodeKind::File);
        assert_eq!(ip.generation, 1);
        let handle = ip.handle();
        op.commit(true).unwrap();

        let mut op = engine.begin();
        let mut ip = op.get_inode_handle(handle).unwrap();
        op.free_inode(&mut ip).unwrap();
        op.commit(true).unwrap();

        let mut op = engine.begin();
        let err = op.get_inode_handle(handle).unwrap_err();
        assert!(err.is_stale());
        let again = op.alloc_inode().unwrap();
        assert_eq!(again.inum, handle.inum);
        assert_eq!(again.generation, 2);
        op.commit(true).unwrap();
    }

    #[test]
    fn test_abort_returns_reservations() {
        let engine = engine();
        let free_before = engine.state().blocks().free_count();
        let inodes_before = engine.state().inodes().free_count();

        let mut op = engine.begin();
        op.alloc_inode().unwrap();
        op.alloc_block().unwrap();
        op.alloc_block().unwrap();
        op.abort();

        assert_eq!(engine.state().blocks().free_count(), free_before);
        assert_eq!(engine.state().inodes().free_count(), inodes_before);
    }

    #[test]
    fn test_drop_returns_reservations() {
        let engine = engine();
        let free_before = engine.state().blocks().free_count();
        {
            let mut op = engine.begin();
            op.alloc_block().unwrap();
        }
        assert_eq!(engine.state().blocks().free_count(), free_before);
    }

    #[test]
    fn test_free_applies_after_commit() {
        let engine = engine();
        let mut op = engine.begin();
        let bn = op.alloc_block().unwrap();
        op.commit(true).unwrap();
        assert!(engine.state().blocks().is_allocated(bn));

        let mut op = engine.begin();
        op.free_block(bn).unwrap();
        assert!(engine.state().blocks().is_allocated(bn));
        op.commit(true).unwrap();
        assert!(!engine.state().blocks().is_allocated(bn));
    }

    #[test]
    fn test_null_inode_not_found() {
        let engine = engine();
        let mut op = engine.begin();
        assert!(op.get_inode(NULL_INUM).unwrap_err().is_not_found());
        let ninodes = engine.geometry().ninodes;
        assert!(op.get_inode(ninodes).unwrap_err().is_not_found());
    }

    #[test]
    fn test_pointer_outside_data_region_is_corruption() {
        let engine = engine();
        let mut op = engine.begin();
        let bn = op.alloc_block().unwrap();
        op.write_ptr(bn, 0, 1).unwrap();
        assert!(matches!(op.read_ptr(bn, 0), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_write_past_largest_file_is_rejected() {
        let engine = engine();
        let mut op = engine.begin();
        let mut ip = op.alloc_inode().unwrap();
        let past = MAX_FILE_BLOCKS * BLOCK_SIZE as u64 + 5 * BLOCK_SIZE as u64;

        let err = ip.write(&mut op, past, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = ip.write(&mut op, u64::MAX, b"x").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(ip.size, 0);

        // The last byte of the largest file is still writable.
        let last = MAX_FILE_BLOCKS * BLOCK_SIZE as u64 - 1;
        assert_eq!(ip.write(&mut op, last, b"z").unwrap(), 1);
        assert_eq!(ip.size, last + 1);
        assert_eq!(ip.read(&mut op, last, 10).unwrap(), b"z");
        assert!(ip.read(&mut op, last + 1, 10).unwrap().is_empty());
        assert_eq!(ip.bmap(&mut op, MAX_FILE_BLOCKS).unwrap(), 0);
        assert_eq!(ip.bmap(&mut op, u64::MAX).unwrap(), 0);
        ip.free_index(&mut op, MAX_FILE_BLOCKS).unwrap();
        op.write_inode(&ip);
        op.commit(true).unwrap();
    }

    #[test]
    fn test_unlinked_inode_is_stale_while_shrinking() {
        let engine = engine();
        // Keep the shrink pending so the unlinked inode stays allocated.
        engine.state().shrinker().shutdown();

        let mut op = engine.begin();
        let mut ip = op.alloc_inode().unwrap();
        let len = (NDIRECT as usize + 2) * BLOCK_SIZE;
        ip.write(&mut op, 0, &vec![4u8; len]).unwrap();
        op.write_inode(&ip);
        let handle = ip.handle();
        op.commit(true).unwrap();

        let mut op = engine.begin();
        let mut ip = op.get_inode_handle(handle).unwrap();
        ip.unlink(&mut op).unwrap();
        assert!(ip.is_shrinking());
        op.commit(true).unwrap();

        let mut op = engine.begin();
        let ip = op.get_inode(handle.inum).unwrap();
        assert_eq!(ip.kind, InodeKind::File);
        assert_eq!(ip.nlink, 0);
        assert!(op.get_inode_handle(handle).unwrap_err().is_stale());
        op.abort();
    }
}
