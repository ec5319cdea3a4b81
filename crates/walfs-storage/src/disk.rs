//! Block device abstraction
//!
//! The engine only ever moves whole blocks. Writes become durable at the
//! next `barrier()`; the log relies on barriers to order its data blocks
//! before the header that publishes them.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use walfs_common::{BLOCK_SIZE, Block, Bnum, Error, Result};

/// A fixed-size block device
pub trait Disk: Send + Sync {
    /// Read one block
    fn read(&self, bn: Bnum) -> Result<Block>;

    /// Write one block (`data` must be exactly one block long)
    fn write(&self, bn: Bnum, data: &[u8]) -> Result<()>;

    /// Make every write issued so far durable
    fn barrier(&self) -> Result<()>;

    /// Device size in blocks
    fn size(&self) -> u64;
}

pub(crate) fn check_range(bn: Bnum, size: u64) -> Result<()> {
    if bn >= size {
        return Err(Error::invalid_argument(format!(
            "block {bn} beyond device of {size} blocks"
        )));
    }
    Ok(())
}

pub(crate) fn check_len(data: &[u8]) -> Result<()> {
    if data.len() != BLOCK_SIZE {
        return Err(Error::invalid_argument(format!(
            "write of {} bytes, expected {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Disk statistics
#[derive(Debug, Default)]
pub struct DiskStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub barriers: AtomicU64,
}

impl DiskStats {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-memory disk
///
/// Every write lands immediately, so a `snapshot()` taken at any moment is
/// exactly what a crash at that moment would leave behind.
pub struct MemDisk {
    blocks: RwLock<Vec<Block>>,
    stats: DiskStats,
}

impl MemDisk {
    /// Create a zero-filled disk of `nblocks` blocks
    #[must_use]
    pub fn new(nblocks: u64) -> Self {
        Self {
            blocks: RwLock::new(vec![vec![0u8; BLOCK_SIZE]; nblocks as usize]),
            stats: DiskStats::default(),
        }
    }

    /// Copy the current contents into an independent disk
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            blocks: RwLock::new(self.blocks.read().clone()),
            stats: DiskStats::default(),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }
}

impl Disk for MemDisk {
    fn read(&self, bn: Bnum) -> Result<Block> {
        let blocks = self.blocks.read();
        check_range(bn, blocks.len() as u64)?;
        self.stats.record_read();
        Ok(blocks[bn as usize].clone())
    }

    fn write(&self, bn: Bnum, data: &[u8]) -> Result<()> {
        check_len(data)?;
        let mut blocks = self.blocks.write();
        check_range(bn, blocks.len() as u64)?;
        self.stats.record_write();
        blocks[bn as usize].copy_from_slice(data);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.stats.record_barrier();
        Ok(())
    }

    fn size(&self) -> u64 {
        self.blocks.read().len() as u64
    }
}
