//! Circular on-disk log store
//!
//! The log occupies a fixed ring of `capacity` slots. Positions grow
//! without bound and map to slot `pos % capacity`. Two header blocks
//! describe the live region `[start, end)`:
//!
//! ```text
//! END header (block 1)                      START header (block 2)
//! +-------+--------+-------+-------------+  +-------+--------+-------+
//! | Magic | CRC32C | End   | Home[0..n]  |  | Magic | CRC32C | Start |
//! | 4B    | 4B     | 8B    | 8B * cap    |  | 4B    | 4B     | 8B    |
//! +-------+--------+-------+-------------+  +-------+--------+-------+
//! ```
//!
//! The END header is only written after the slots it publishes are
//! durable, and START only after the blocks it retires are installed, so a
//! crash between any two writes leaves `[start, end)` replayable.

use crate::disk::Disk;
use crate::layout::{LOG_END_HEADER, LOG_SLOTS_START, LOG_START_HEADER};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace};
use walfs_common::{BLOCK_SIZE, Bnum, Error, Result};

/// END header magic number
const END_MAGIC: u32 = 0x574C_4745; // "WLGE"

/// START header magic number
const START_MAGIC: u32 = 0x574C_4753; // "WLGS"

/// Bytes before the checksummed region (magic + crc)
const HEADER_PREFIX: usize = 8;

/// A logged block: its home block number and full contents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockData {
    /// Home location
    pub blkno: Bnum,
    /// Full block image
    pub data: Bytes,
}

impl BlockData {
    /// Create a logged block
    ///
    /// # Panics
    /// Panics if `data` is not exactly one block.
    #[must_use]
    pub fn new(blkno: Bnum, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        assert_eq!(data.len(), BLOCK_SIZE, "log entry for block {blkno} is not a full block");
        Self { blkno, data }
    }
}

fn seal(magic: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
    buf.put_u32_le(magic);
    buf.put_u32_le(crc32c::crc32c(body));
    buf.put_slice(body);
    buf.resize(BLOCK_SIZE, 0);
    buf.to_vec()
}

fn unseal<'a>(magic: u32, block: &'a [u8], what: &str) -> Result<&'a [u8]> {
    let mut prefix = &block[..HEADER_PREFIX];
    if prefix.get_u32_le() != magic {
        return Err(Error::corrupted(format!("invalid {what} header magic")));
    }
    let stored = prefix.get_u32_le();
    let body = &block[HEADER_PREFIX..];
    if crc32c::crc32c(body) != stored {
        return Err(Error::corrupted(format!("{what} header checksum mismatch")));
    }
    Ok(body)
}

fn encode_end(end: u64, homes: &[Bnum]) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(BLOCK_SIZE - HEADER_PREFIX);
    body.put_u64_le(end);
    for &home in homes {
        body.put_u64_le(home);
    }
    body.resize(BLOCK_SIZE - HEADER_PREFIX, 0);
    seal(END_MAGIC, &body)
}

fn decode_end(block: &[u8], capacity: u64) -> Result<(u64, Vec<Bnum>)> {
    let mut body = unseal(END_MAGIC, block, "log end")?;
    let end = body.get_u64_le();
    let homes = (0..capacity).map(|_| body.get_u64_le()).collect();
    Ok((end, homes))
}

fn encode_start(start: u64) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(BLOCK_SIZE - HEADER_PREFIX);
    body.put_u64_le(start);
    body.resize(BLOCK_SIZE - HEADER_PREFIX, 0);
    seal(START_MAGIC, &body)
}

fn decode_start(block: &[u8]) -> Result<u64> {
    let mut body = unseal(START_MAGIC, block, "log start")?;
    Ok(body.get_u64_le())
}

/// Durably record that every position below `start` is installed
pub fn write_start(disk: &dyn Disk, start: u64) -> Result<()> {
    disk.write(LOG_START_HEADER, &encode_start(start))?;
    disk.barrier()
}

/// Write empty log headers to a fresh image
pub fn format(disk: &dyn Disk, capacity: u64) -> Result<()> {
    disk.write(LOG_END_HEADER, &encode_end(0, &vec![0; capacity as usize]))?;
    disk.write(LOG_START_HEADER, &encode_start(0))?;
    disk.barrier()
}

/// Appends batches to the ring
///
/// Owned by the logger thread; it remembers the home block of every slot
/// so each END header can be written without reading the previous one.
#[derive(Debug)]
pub struct CircularAppender {
    homes: Vec<Bnum>,
}

impl CircularAppender {
    fn capacity(&self) -> u64 {
        self.homes.len() as u64
    }

    fn slot(&self, pos: u64) -> usize {
        (pos % self.capacity()) as usize
    }

    /// Write `blocks` at positions `end..`, then publish the new end
    ///
    /// The caller guarantees the slots being overwritten are installed.
    pub fn append(&mut self, disk: &dyn Disk, end: u64, blocks: &[BlockData]) -> Result<u64> {
        for (i, block) in blocks.iter().enumerate() {
            let pos = end + i as u64;
            let slot = self.slot(pos);
            trace!("log slot {} <- block {}", slot, block.blkno);
            disk.write(LOG_SLOTS_START + slot as u64, &block.data)?;
            self.homes[slot] = block.blkno;
        }
        disk.barrier()?;

        let new_end = end + blocks.len() as u64;
        disk.write(LOG_END_HEADER, &encode_end(new_end, &self.homes))?;
        disk.barrier()?;
        debug!("log end advanced {} -> {}", end, new_end);
        Ok(new_end)
    }
}

/// Replay the on-disk log into home locations
///
/// Returns the appender for the logger together with the recovered end
/// position, which is also the new start: after recovery nothing is left
/// to install.
pub fn recover(disk: &dyn Disk, capacity: u64) -> Result<(CircularAppender, u64)> {
    let start = decode_start(&disk.read(LOG_START_HEADER)?)?;
    let (end, homes) = decode_end(&disk.read(LOG_END_HEADER)?, capacity)?;

    if start > end || end - start > capacity {
        return Err(Error::corrupted(format!(
            "log region [{start}, {end}) does not fit {capacity} slots"
        )));
    }

    let appender = CircularAppender { homes };
    if start < end {
        info!("Replaying log positions [{}, {})", start, end);
        for pos in start..end {
            let slot = appender.slot(pos);
            let data = disk.read(LOG_SLOTS_START + slot as u64)?;
            disk.write(appender.homes[slot], &data)?;
        }
        disk.barrier()?;
        write_start(disk, end)?;
    }

    Ok((appender, end))
}
