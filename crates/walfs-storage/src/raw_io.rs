//! File-backed disk image
//!
//! Blocks are read and written with positioned I/O so concurrent callers
//! never share a file cursor. A barrier is an `fdatasync`.

use crate::disk::{Disk, DiskStats, check_len, check_range};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use walfs_common::{BLOCK_SIZE, Block, Bnum, Error, Result};

/// Disk image stored in a regular file
pub struct FileDisk {
    file: File,
    path: String,
    nblocks: u64,
    sync_on_barrier: bool,
    stats: DiskStats,
}

impl FileDisk {
    /// Open an existing image
    pub fn open(path: impl AsRef<Path>, sync_on_barrier: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::not_found(format!("failed to open {path_str}: {e}")))?;

        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(Error::corrupted(format!(
                "{path_str}: size {len} is not a whole number of blocks"
            )));
        }

        Ok(Self {
            file,
            path: path_str,
            nblocks: len / BLOCK_SIZE as u64,
            sync_on_barrier,
            stats: DiskStats::default(),
        })
    }

    /// Create (or truncate) an image of `nblocks` zeroed blocks
    pub fn create(path: impl AsRef<Path>, nblocks: u64, sync_on_barrier: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(nblocks * BLOCK_SIZE as u64)?;

        Ok(Self {
            file,
            path: path_str,
            nblocks,
            sync_on_barrier,
            stats: DiskStats::default(),
        })
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get statistics
    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    fn offset(bn: Bnum) -> u64 {
        bn * BLOCK_SIZE as u64
    }
}

impl Disk for FileDisk {
    fn read(&self, bn: Bnum) -> Result<Block> {
        check_range(bn, self.nblocks)?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file.read_exact_at(&mut buf, Self::offset(bn))?;
        self.stats.record_read();
        Ok(buf)
    }

    fn write(&self, bn: Bnum, data: &[u8]) -> Result<()> {
        check_range(bn, self.nblocks)?;
        check_len(data)?;
        self.file.write_all_at(data, Self::offset(bn))?;
        self.stats.record_write();
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        if self.sync_on_barrier {
            self.file.sync_data()?;
        }
        self.stats.record_barrier();
        Ok(())
    }

    fn size(&self) -> u64 {
        self.nblocks
    }
}
