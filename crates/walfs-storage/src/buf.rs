//! In-memory copies of disk objects
//!
//! A [`Buf`] holds the payload of one [`Address`]: a single byte whose low
//! bit is the object for bit addresses, otherwise the covered bytes.

use std::collections::HashMap;
use walfs_common::{Address, BLOCK_SIZE};

/// One disk object loaded or written by a transaction
#[derive(Clone, Debug)]
pub struct Buf {
    addr: Address,
    data: Vec<u8>,
    dirty: bool,
}

impl Buf {
    /// Wrap caller-supplied content
    ///
    /// # Panics
    /// Panics if `data` does not have the length the address implies.
    #[must_use]
    pub fn new(addr: Address, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            addr.byte_len(),
            "buffer length does not match {addr:?}"
        );
        Self {
            addr,
            data,
            dirty: false,
        }
    }

    /// Extract the object at `addr` from a full block image
    #[must_use]
    pub fn load(addr: Address, block: &[u8]) -> Self {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        let data = if addr.is_bit() {
            let byte = block[(addr.bit_offset / 8) as usize];
            vec![(byte >> (addr.bit_offset % 8)) & 1]
        } else {
            let start = addr.byte_offset();
            block[start..start + addr.byte_len()].to_vec()
        };
        Self {
            addr,
            data,
            dirty: false,
        }
    }

    /// Copy this object into a full block image
    pub fn install(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        if self.addr.is_bit() {
            let byte = &mut block[(self.addr.bit_offset / 8) as usize];
            let mask = 1u8 << (self.addr.bit_offset % 8);
            if self.data[0] & 1 == 1 {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        } else {
            let start = self.addr.byte_offset();
            block[start..start + self.data.len()].copy_from_slice(&self.data);
        }
    }

    /// Get the address
    #[must_use]
    pub const fn addr(&self) -> Address {
        self.addr
    }

    /// Get the payload
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the payload for modification (callers must also call `set_dirty`)
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the payload
    ///
    /// # Panics
    /// Panics on a length mismatch.
    pub fn replace(&mut self, data: Vec<u8>) {
        assert_eq!(
            data.len(),
            self.addr.byte_len(),
            "overwrite length does not match {:?}",
            self.addr
        );
        self.data = data;
    }

    /// Mark the buffer modified
    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    /// True if modified
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read a little-endian u64 at byte `offset` of the payload
    #[must_use]
    pub fn get_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    /// Write a little-endian u64 at byte `offset` of the payload and mark dirty
    pub fn put_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }
}

/// The buffers a transaction has touched, keyed by address
#[derive(Debug, Default)]
pub struct BufMap {
    bufs: HashMap<Address, Buf>,
}

impl BufMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a buffer
    pub fn insert(&mut self, buf: Buf) -> &mut Buf {
        let addr = buf.addr();
        self.bufs.insert(addr, buf);
        self.bufs
            .get_mut(&addr)
            .unwrap_or_else(|| unreachable!("buffer for {addr:?} was just inserted"))
    }

    /// Look up a buffer
    pub fn get_mut(&mut self, addr: &Address) -> Option<&mut Buf> {
        self.bufs.get_mut(addr)
    }

    /// True if the map holds a buffer for `addr`
    #[must_use]
    pub fn contains(&self, addr: &Address) -> bool {
        self.bufs.contains_key(addr)
    }

    /// Drop the buffer for `addr`
    pub fn remove(&mut self, addr: &Address) -> Option<Buf> {
        self.bufs.remove(addr)
    }

    /// Number of dirty buffers
    #[must_use]
    pub fn ndirty(&self) -> usize {
        self.bufs.values().filter(|b| b.is_dirty()).count()
    }

    /// Addresses of the dirty buffers
    pub fn dirty_addrs(&self) -> impl Iterator<Item = Address> + '_ {
        self.bufs.values().filter(|b| b.is_dirty()).map(Buf::addr)
    }

    /// Consume the map, keeping only dirty buffers
    #[must_use]
    pub fn into_dirty(self) -> Vec<Buf> {
        self.bufs.into_values().filter(Buf::is_dirty).collect()
    }
}
