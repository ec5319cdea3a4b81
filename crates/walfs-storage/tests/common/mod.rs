//! Disk wrappers for crash and back-pressure scenarios

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use walfs_common::{Block, Bnum, EngineConfig, Result, ShrinkConfig};
use walfs_storage::{Disk, Engine, MemDisk};

/// Small engine settings shared by the scenarios
pub fn config(log_capacity: u64) -> EngineConfig {
    EngineConfig {
        log_capacity,
        inode_blocks: 2,
        shrink: ShrinkConfig {
            backoff_ms: 1,
            ..ShrinkConfig::default()
        },
    }
}

/// A freshly formatted in-memory image
pub fn formatted(nblocks: u64, log_capacity: u64) -> MemDisk {
    let disk = MemDisk::new(nblocks);
    Engine::format(&disk, &config(log_capacity)).unwrap();
    disk
}

/// A disk that crashes after a number of writes
///
/// The running engine keeps seeing every write, while the image it leaves
/// behind only receives writes issued before the crash point.
pub struct CrashDisk {
    live: MemDisk,
    image: MemDisk,
    writes: AtomicU64,
    budget: AtomicU64,
}

impl CrashDisk {
    pub fn new(base: &MemDisk) -> Self {
        Self {
            live: base.snapshot(),
            image: base.snapshot(),
            writes: AtomicU64::new(0),
            budget: AtomicU64::new(u64::MAX),
        }
    }

    /// Crash once `n` more writes have been issued
    pub fn crash_after(&self, n: u64) {
        let issued = self.writes.load(Ordering::SeqCst);
        self.budget.store(issued.saturating_add(n), Ordering::SeqCst);
    }

    /// Writes issued so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// What a restart after the crash would find
    pub fn image(&self) -> MemDisk {
        self.image.snapshot()
    }
}

impl Disk for CrashDisk {
    fn read(&self, bn: Bnum) -> Result<Block> {
        self.live.read(bn)
    }

    fn write(&self, bn: Bnum, data: &[u8]) -> Result<()> {
        self.live.write(bn, data)?;
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if n < self.budget.load(Ordering::SeqCst) {
            self.image.write(bn, data)?;
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.live.size()
    }
}

/// A disk whose writes stall while the gate is closed
pub struct GatedDisk {
    inner: MemDisk,
    open: Mutex<bool>,
    cond: Condvar,
}

impl GatedDisk {
    pub fn new(inner: MemDisk) -> Arc<Self> {
        Arc::new(Self {
            inner,
            open: Mutex::new(true),
            cond: Condvar::new(),
        })
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

impl Disk for GatedDisk {
    fn read(&self, bn: Bnum) -> Result<Block> {
        self.inner.read(bn)
    }

    fn write(&self, bn: Bnum, data: &[u8]) -> Result<()> {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        drop(open);
        self.inner.write(bn, data)
    }

    fn barrier(&self) -> Result<()> {
        self.inner.barrier()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}
