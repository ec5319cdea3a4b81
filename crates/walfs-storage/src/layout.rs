//! Disk layout definitions
//!
//! Disk Layout (in blocks):
//! ```text
//! +---------------------+  0
//! |   Superblock        |
//! +---------------------+  1
//! |   Log end header    |  end position + home block of every slot
//! +---------------------+  2
//! |   Log start header  |  start position
//! +---------------------+  3
//! |   Log slots         |  log_capacity blocks
//! +---------------------+
//! |   Block bitmap      |  one bit per device block
//! +---------------------+
//! |   Inode bitmap      |  one bit per inode
//! +---------------------+
//! |   Inode blocks      |  INODES_PER_BLOCK inodes each
//! +---------------------+
//! |   Data blocks       |
//! +---------------------+
//! ```

use crate::disk::Disk;
use bytes::{Buf, BufMut, BytesMut};
use walfs_common::config::{MAX_LOG_CAPACITY, MIN_LOG_CAPACITY};
use walfs_common::{Address, BLOCK_BITS, BLOCK_SIZE, Bnum, Error, Inum, Result};

/// Magic number for walfs disk images
pub const MAGIC: [u8; 8] = *b"WALFSIMG";

/// Current disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Block holding the superblock
pub const SUPERBLOCK_BLOCK: Bnum = 0;

/// Block holding the log end position and slot table
pub const LOG_END_HEADER: Bnum = 1;

/// Block holding the log start position
pub const LOG_START_HEADER: Bnum = 2;

/// First log slot
pub const LOG_SLOTS_START: Bnum = 3;

/// On-disk inode size in bytes
pub const INODE_SIZE: usize = 128;

/// Inodes per inode block
pub const INODES_PER_BLOCK: u64 = (BLOCK_SIZE / INODE_SIZE) as u64;

/// Superblock stored in block 0
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Device size in blocks
    pub nblocks: u64,
    /// Number of log slots
    pub log_capacity: u64,
    /// Number of inode blocks
    pub inode_blocks: u64,
    /// CRC32C of the fields above
    pub checksum: u32,
}

impl Superblock {
    /// Encoded size up to (not including) the checksum:
    /// magic(8) + version(4) + nblocks(8) + log_capacity(8) + inode_blocks(8)
    const CHECKSUM_OFFSET: usize = 36;

    /// Create a superblock for a fresh image
    pub fn new(nblocks: u64, log_capacity: u64, inode_blocks: u64) -> Result<Self> {
        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            nblocks,
            log_capacity,
            inode_blocks,
            checksum: 0,
        };
        sb.geometry()?;
        sb.update_checksum();
        Ok(sb)
    }

    /// Serialize to a full block
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.nblocks);
        buf.put_u64_le(self.log_capacity);
        buf.put_u64_le(self.inode_blocks);
        buf.put_u32_le(self.checksum);
        buf.resize(BLOCK_SIZE, 0);
        buf.to_vec()
    }

    /// Parse from a full block
    pub fn from_block(data: &[u8]) -> Result<Self> {
        if data.len() < Self::CHECKSUM_OFFSET + 4 {
            return Err(Error::corrupted("superblock too small"));
        }
        let mut buf = data;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corrupted("invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupted(format!(
                "unsupported format version: {version}"
            )));
        }

        let sb = Self {
            magic,
            version,
            nblocks: buf.get_u64_le(),
            log_capacity: buf.get_u64_le(),
            inode_blocks: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
        };

        if sb.compute_checksum() != sb.checksum {
            return Err(Error::corrupted("superblock checksum mismatch"));
        }
        Ok(sb)
    }

    fn compute_checksum(&self) -> u32 {
        crc32c::crc32c(&self.to_block()[..Self::CHECKSUM_OFFSET])
    }

    /// Update the checksum field after modifying other fields
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Derive region offsets, rejecting layouts that do not fit
    pub fn geometry(&self) -> Result<Geometry> {
        if !(MIN_LOG_CAPACITY..=MAX_LOG_CAPACITY).contains(&self.log_capacity) {
            return Err(Error::corrupted(format!(
                "log capacity {} out of range",
                self.log_capacity
            )));
        }
        let bitmap_start = LOG_SLOTS_START + self.log_capacity;
        let bitmap_blocks = self.nblocks.div_ceil(BLOCK_BITS);
        let ninodes = self.inode_blocks * INODES_PER_BLOCK;
        let inode_bitmap_start = bitmap_start + bitmap_blocks;
        let inode_bitmap_blocks = ninodes.div_ceil(BLOCK_BITS);
        let inode_start = inode_bitmap_start + inode_bitmap_blocks;
        let data_start = inode_start + self.inode_blocks;

        if data_start >= self.nblocks {
            return Err(Error::configuration(format!(
                "{} blocks cannot hold metadata of {} blocks plus data",
                self.nblocks, data_start
            )));
        }

        Ok(Geometry {
            nblocks: self.nblocks,
            log_capacity: self.log_capacity,
            bitmap_start,
            bitmap_blocks,
            inode_bitmap_start,
            inode_bitmap_blocks,
            inode_start,
            inode_blocks: self.inode_blocks,
            ninodes,
            data_start,
        })
    }

    /// Read and validate the superblock of an image
    pub fn read(disk: &dyn Disk) -> Result<Self> {
        let sb = Self::from_block(&disk.read(SUPERBLOCK_BLOCK)?)?;
        if sb.nblocks != disk.size() {
            return Err(Error::corrupted(format!(
                "superblock describes {} blocks, device has {}",
                sb.nblocks,
                disk.size()
            )));
        }
        Ok(sb)
    }
}

/// Region offsets derived from the superblock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub nblocks: u64,
    pub log_capacity: u64,
    pub bitmap_start: Bnum,
    pub bitmap_blocks: u64,
    pub inode_bitmap_start: Bnum,
    pub inode_bitmap_blocks: u64,
    pub inode_start: Bnum,
    pub inode_blocks: u64,
    pub ninodes: u64,
    pub data_start: Bnum,
}

impl Geometry {
    /// Address of the allocation bit for block `bn`
    #[must_use]
    pub fn block_bit(&self, bn: Bnum) -> Address {
        Address::bit(self.bitmap_start + bn / BLOCK_BITS, bn % BLOCK_BITS)
    }

    /// Address of the allocation bit for inode `inum`
    #[must_use]
    pub fn inode_bit(&self, inum: Inum) -> Address {
        Address::bit(
            self.inode_bitmap_start + inum / BLOCK_BITS,
            inum % BLOCK_BITS,
        )
    }

    /// Address of inode `inum`
    #[must_use]
    pub fn inode_addr(&self, inum: Inum) -> Address {
        let slot = (inum % INODES_PER_BLOCK) as usize;
        Address::bytes(
            self.inode_start + inum / INODES_PER_BLOCK,
            slot * INODE_SIZE,
            INODE_SIZE,
        )
    }

    /// True if `bn` lies in the data region
    #[must_use]
    pub fn is_data_block(&self, bn: Bnum) -> bool {
        bn >= self.data_start && bn < self.nblocks
    }
}
