//! In-memory free-space bitmaps
//!
//! The allocator mirrors an on-disk bitmap region. Allocation only
//! reserves a number in memory; the caller persists the bit inside its
//! transaction and gives the number back with [`Allocator::free`] if the
//! transaction does not commit. Frees are applied here only after the
//! freeing transaction commits, so a number is never handed out while a
//! committed bitmap still says it is in use.

use crate::disk::Disk;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use walfs_common::{BLOCK_SIZE, Bnum, Error, Result};

/// A bitmap allocator over `0..total`
pub struct Allocator {
    name: &'static str,
    /// Bitmap data
    data: RwLock<Vec<u8>>,
    /// Total number of allocatable units
    total: u64,
    /// Number of free units (cached)
    free: AtomicU64,
    /// Hint for next free search
    search_hint: AtomicU64,
}

impl Allocator {
    /// Create a bitmap with every unit free
    #[must_use]
    pub fn new(name: &'static str, total: u64) -> Self {
        Self {
            name,
            data: RwLock::new(vec![0u8; total.div_ceil(8) as usize]),
            total,
            free: AtomicU64::new(total),
            search_hint: AtomicU64::new(0),
        }
    }

    /// Build from raw bitmap bytes
    #[must_use]
    pub fn from_bytes(name: &'static str, data: &[u8], total: u64) -> Self {
        let mut bits = vec![0u8; total.div_ceil(8) as usize];
        let copy_len = bits.len().min(data.len());
        bits[..copy_len].copy_from_slice(&data[..copy_len]);

        let free = (0..total).filter(|&n| !Self::is_set(&bits, n)).count() as u64;
        Self {
            name,
            data: RwLock::new(bits),
            total,
            free: AtomicU64::new(free),
            search_hint: AtomicU64::new(0),
        }
    }

    /// Read `nblocks` bitmap blocks starting at `start`
    pub fn load(
        name: &'static str,
        disk: &dyn Disk,
        start: Bnum,
        nblocks: u64,
        total: u64,
    ) -> Result<Self> {
        let mut raw = Vec::with_capacity(nblocks as usize * BLOCK_SIZE);
        for bn in start..start + nblocks {
            raw.extend_from_slice(&disk.read(bn)?);
        }
        Ok(Self::from_bytes(name, &raw, total))
    }

    /// Raw bitmap bytes (padded to whole blocks)
    #[must_use]
    pub fn to_blocks(&self) -> Vec<Vec<u8>> {
        self.data
            .read()
            .chunks(BLOCK_SIZE)
            .map(|chunk| {
                let mut block = chunk.to_vec();
                block.resize(BLOCK_SIZE, 0);
                block
            })
            .collect()
    }

    fn is_set(data: &[u8], n: u64) -> bool {
        data[(n / 8) as usize] & (1 << (n % 8)) != 0
    }

    fn set(data: &mut [u8], n: u64) {
        data[(n / 8) as usize] |= 1 << (n % 8);
    }

    fn clear(data: &mut [u8], n: u64) {
        data[(n / 8) as usize] &= !(1 << (n % 8));
    }

    fn find_free(&self, data: &[u8], start: u64, end: u64) -> Option<u64> {
        (start..end.min(self.total)).find(|&n| !Self::is_set(data, n))
    }

    /// Reserve a free unit
    pub fn alloc(&self) -> Option<u64> {
        let mut data = self.data.write();
        let hint = self.search_hint.load(Ordering::Relaxed);

        let found = self
            .find_free(&data, hint, self.total)
            .or_else(|| self.find_free(&data, 0, hint))?;

        Self::set(&mut data, found);
        self.free.fetch_sub(1, Ordering::Relaxed);
        self.search_hint.store(found + 1, Ordering::Relaxed);
        Some(found)
    }

    /// Mark a unit used (format time)
    pub fn mark_used(&self, n: u64) {
        let mut data = self.data.write();
        if n < self.total && !Self::is_set(&data, n) {
            Self::set(&mut data, n);
            self.free.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Return a unit to the pool
    pub fn free(&self, n: u64) -> Result<()> {
        if n >= self.total {
            return Err(Error::invalid_argument(format!(
                "{} {} out of range (max {})",
                self.name, n, self.total
            )));
        }

        let mut data = self.data.write();
        if !Self::is_set(&data, n) {
            return Err(Error::corrupted(format!("{} {} is not allocated", self.name, n)));
        }
        Self::clear(&mut data, n);
        self.free.fetch_add(1, Ordering::Relaxed);

        if n < self.search_hint.load(Ordering::Relaxed) {
            self.search_hint.store(n, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Check if a unit is in use
    #[must_use]
    pub fn is_allocated(&self, n: u64) -> bool {
        if n >= self.total {
            return true;
        }
        Self::is_set(&self.data.read(), n)
    }

    /// Get the number of free units
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    /// Get the total number of units
    #[must_use]
    pub const fn total_count(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    #[test]
    fn test_alloc_and_free() {
        let alloc = Allocator::new("block", 16);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.free_count(), 14);
        assert!(alloc.is_allocated(a));

        alloc.free(a).unwrap();
        assert!(!alloc.is_allocated(a));
        assert_eq!(alloc.alloc(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let alloc = Allocator::new("inode", 3);
        alloc.mark_used(0);
        assert!(alloc.alloc().is_some());
        assert!(alloc.alloc().is_some());
        assert_eq!(alloc.alloc(), None);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let alloc = Allocator::new("block", 8);
        let n = alloc.alloc().unwrap();
        alloc.free(n).unwrap();
        assert!(matches!(alloc.free(n), Err(Error::Corrupted(_))));
        assert!(alloc.free(8).is_err());
    }

    #[test]
    fn test_load_from_disk_blocks() {
        let disk = MemDisk::new(4);
        let src = Allocator::new("block", 40_000);
        for n in [0, 7, 32_768, 39_999] {
            src.mark_used(n);
        }
        for (i, block) in src.to_blocks().iter().enumerate() {
            disk.write(1 + i as u64, block).unwrap();
        }

        let loaded = Allocator::load("block", &disk, 1, 2, 40_000).unwrap();
        assert_eq!(loaded.free_count(), 40_000 - 4);
        assert!(loaded.is_allocated(32_768));
        assert!(loaded.is_allocated(39_999));
        assert!(!loaded.is_allocated(8));
    }
}
