//! Storage engine lifecycle
//!
//! Formatting, opening (log recovery, allocator rebuild, shrink
//! resumption) and orderly shutdown of one disk image.

use crate::alloc::Allocator;
use crate::disk::Disk;
use crate::inode::{Inode, InodeKind};
use crate::layout::{Geometry, INODE_SIZE, INODES_PER_BLOCK, SUPERBLOCK_BLOCK, Superblock};
use crate::op::{FsOp, FsState};
use crate::shrinker::Shrinker;
use crate::txn::Txn;
use crate::wal::{LogStats, Walog};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use walfs_common::{EngineConfig, Inum, NULL_INUM, Result, zero_block};

/// An open disk image
pub struct Engine {
    state: Arc<FsState>,
    log: Arc<Walog>,
    shut_down: Mutex<bool>,
}

impl Engine {
    /// Lay out an empty file system on `disk`
    ///
    /// Every metadata region is rewritten, so any previous contents of the
    /// image are lost.
    pub fn format(disk: &dyn Disk, config: &EngineConfig) -> Result<Geometry> {
        config.validate()?;
        let sb = Superblock::new(disk.size(), config.log_capacity, config.inode_blocks)?;
        let geo = sb.geometry()?;

        for bn in geo.bitmap_start..geo.data_start {
            disk.write(bn, &zero_block())?;
        }

        let blocks = Allocator::new("block", geo.nblocks);
        for bn in 0..geo.data_start {
            blocks.mark_used(bn);
        }
        for (i, block) in blocks.to_blocks().iter().enumerate() {
            disk.write(geo.bitmap_start + i as u64, block)?;
        }

        let inodes = Allocator::new("inode", geo.ninodes);
        inodes.mark_used(NULL_INUM);
        for (i, block) in inodes.to_blocks().iter().enumerate() {
            disk.write(geo.inode_bitmap_start + i as u64, block)?;
        }

        Walog::format(disk, geo.log_capacity)?;

        // The superblock goes last so a torn format is never mistaken for
        // a valid image.
        disk.barrier()?;
        disk.write(SUPERBLOCK_BLOCK, &sb.to_block())?;
        disk.barrier()?;

        info!(
            "Formatted {} blocks: {} log slots, {} inodes, data from block {}",
            geo.nblocks, geo.log_capacity, geo.ninodes, geo.data_start
        );
        Ok(geo)
    }

    /// Format `disk` and open it
    pub fn create(disk: Arc<dyn Disk>, config: &EngineConfig) -> Result<Self> {
        Self::format(&*disk, config)?;
        Self::open(disk, config)
    }

    /// Open a formatted image, replaying its log
    ///
    /// Log capacity and inode count come from the superblock; only the
    /// shrinker settings of `config` apply.
    pub fn open(disk: Arc<dyn Disk>, config: &EngineConfig) -> Result<Self> {
        let sb = Superblock::read(&*disk)?;
        let geo = sb.geometry()?;
        if config.log_capacity != geo.log_capacity {
            warn!(
                "Configured log capacity {} ignored, image was formatted with {}",
                config.log_capacity, geo.log_capacity
            );
        }

        let log = Arc::new(Walog::open(Arc::clone(&disk), geo.log_capacity)?);

        // The log is fully installed now, so the home bitmaps are current.
        let blocks = Allocator::load(
            "block",
            &*disk,
            geo.bitmap_start,
            geo.bitmap_blocks,
            geo.nblocks,
        )?;
        let inodes = Allocator::load(
            "inode",
            &*disk,
            geo.inode_bitmap_start,
            geo.inode_bitmap_blocks,
            geo.ninodes,
        )?;
        info!(
            "Opened image: {} of {} blocks free, {} of {} inodes free",
            blocks.free_count(),
            geo.nblocks,
            inodes.free_count(),
            geo.ninodes
        );

        let state = Arc::new(FsState {
            txn: Arc::new(Txn::new(Arc::clone(&log))),
            geo,
            blocks,
            inodes,
            shrinker: Shrinker::new(config.shrink.clone()),
        });

        let engine = Self {
            state,
            log,
            shut_down: Mutex::new(false),
        };
        engine.resume_shrinks()?;
        Ok(engine)
    }

    /// Restart shrinks that were pending when the image was last closed
    fn resume_shrinks(&self) -> Result<()> {
        let geo = &self.state.geo;
        let mut pending: Vec<Inum> = Vec::new();
        for i in 0..geo.inode_blocks {
            let block = self.log.read(geo.inode_start + i)?;
            for (slot, raw) in block.chunks(INODE_SIZE).enumerate() {
                let inum = i * INODES_PER_BLOCK + slot as u64;
                if inum == NULL_INUM {
                    continue;
                }
                let ip = Inode::decode(inum, raw)?;
                if ip.kind != InodeKind::Free && (ip.is_shrinking() || ip.nlink == 0) {
                    pending.push(inum);
                }
            }
        }

        if !pending.is_empty() {
            info!("Resuming {} interrupted shrinks", pending.len());
        }
        for inum in pending {
            self.state.shrinker.start(&self.state, inum);
        }
        Ok(())
    }

    /// Start an operation
    #[must_use]
    pub fn begin(&self) -> FsOp {
        FsOp::begin(&self.state)
    }

    /// Shared engine state
    #[must_use]
    pub const fn state(&self) -> &Arc<FsState> {
        &self.state
    }

    /// Transaction manager
    #[must_use]
    pub fn txn(&self) -> &Arc<Txn> {
        &self.state.txn
    }

    /// Disk geometry
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.state.geo
    }

    /// Current log boundaries
    #[must_use]
    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }

    /// Block until no shrink is running
    pub fn wait_shrinks(&self) {
        self.state.shrinker.wait_idle();
    }

    /// Block until every committed operation is durable
    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    /// Stop the shrinker, then drain and stop the log
    pub fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock();
        if *shut_down {
            return;
        }
        self.state.shrinker.shutdown();
        self.log.shutdown();
        *shut_down = true;
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
