//! Core type definitions for walfs
//!
//! This module defines the fundamental types shared by every layer of the
//! engine: block and inode numbers, transaction identifiers, sub-block
//! addresses and client handles.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a disk block in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Size of a disk block in bits
pub const BLOCK_BITS: u64 = (BLOCK_SIZE as u64) * 8;

/// Block number on the device
pub type Bnum = u64;

/// Inode number
pub type Inum = u64;

/// Inode number that never names a live inode
pub const NULL_INUM: Inum = 0;

/// A full disk block image
pub type Block = Vec<u8>;

/// Allocate a zeroed block image
#[must_use]
pub fn zero_block() -> Block {
    vec![0u8; BLOCK_SIZE]
}

/// Transaction identifier
///
/// Identifiers are handed out in increasing order and are never zero;
/// zero is what the lock map stores for an unheld address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, Into)]
#[display("txn-{_0}")]
pub struct TxnId(u64);

impl TxnId {
    /// Holder value of an unlocked address
    pub const UNLOCKED: u64 = 0;

    /// Wrap a raw identifier
    ///
    /// # Panics
    /// Panics if `raw` is zero.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        assert!(raw != Self::UNLOCKED, "transaction id 0 is reserved");
        Self(raw)
    }

    /// Raw identifier
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A bit range inside one disk block
///
/// Three shapes are supported: a single bit, a byte-aligned run of whole
/// bytes, and the whole block. Addresses are the unit of locking.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Block number
    pub block: Bnum,
    /// Offset of the first bit within the block
    pub bit_offset: u64,
    /// Number of bits covered
    pub bit_len: u64,
}

impl Address {
    /// Create an address
    ///
    /// # Panics
    /// Panics if the range leaves the block or is neither a single bit nor
    /// a byte-aligned run of whole bytes.
    #[must_use]
    pub fn new(block: Bnum, bit_offset: u64, bit_len: u64) -> Self {
        assert!(bit_len > 0, "empty address in block {block}");
        assert!(
            bit_offset + bit_len <= BLOCK_BITS,
            "address {bit_offset}+{bit_len} leaves block {block}"
        );
        assert!(
            bit_len == 1 || (bit_offset % 8 == 0 && bit_len % 8 == 0),
            "unaligned address {bit_offset}+{bit_len} in block {block}"
        );
        Self {
            block,
            bit_offset,
            bit_len,
        }
    }

    /// Address of a whole block
    #[must_use]
    pub fn block(block: Bnum) -> Self {
        Self::new(block, 0, BLOCK_BITS)
    }

    /// Address of a single bit
    #[must_use]
    pub fn bit(block: Bnum, bit: u64) -> Self {
        Self::new(block, bit, 1)
    }

    /// Address of `len` bytes starting at byte `offset`
    #[must_use]
    pub fn bytes(block: Bnum, offset: usize, len: usize) -> Self {
        Self::new(block, (offset as u64) * 8, (len as u64) * 8)
    }

    /// Total order over addresses used for lock keys and commit sorting
    #[must_use]
    pub const fn flat_id(&self) -> u64 {
        self.block * BLOCK_BITS + self.bit_offset
    }

    /// True if the address covers the entire block
    #[must_use]
    pub const fn is_full_block(&self) -> bool {
        self.bit_offset == 0 && self.bit_len == BLOCK_BITS
    }

    /// True if the address is a single bit
    #[must_use]
    pub const fn is_bit(&self) -> bool {
        self.bit_len == 1
    }

    /// Number of payload bytes a buffer for this address carries
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8) as usize
    }

    /// Byte offset of the range (meaningless for single bits)
    #[must_use]
    pub const fn byte_offset(&self) -> usize {
        (self.bit_offset / 8) as usize
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({}:{}+{})", self.block, self.bit_offset, self.bit_len)
    }
}

/// A client-held reference to an inode
///
/// The generation changes every time the inode number is reallocated, so
/// a handle that outlives its file is detected as stale.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Handle {
    /// Inode number
    pub inum: Inum,
    /// Generation at the time the handle was issued
    pub generation: u64,
}

impl Handle {
    /// Create a handle
    #[must_use]
    pub const fn new(inum: Inum, generation: u64) -> Self {
        Self { inum, generation }
    }
}
