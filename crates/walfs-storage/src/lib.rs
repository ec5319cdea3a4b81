//! walfs Storage Engine - Crash-consistent transactional block storage
//!
//! This crate implements the storage core of walfs including:
//! - Block device abstraction (file-backed and in-memory)
//! - Circular on-disk log with group commit and background installation
//! - Per-address locking and atomic multi-block transactions
//! - Buffered transactions with read-your-writes overlays
//! - Bitmap allocation, inodes and indirect block trees
//! - Background shrinking of truncated files
//! - Ordered multi-inode locking

pub mod alloc;
pub mod buf;
pub mod buftxn;
pub mod circular;
pub mod disk;
pub mod engine;
pub mod inode;
pub mod layout;
pub mod lockmap;
pub mod lorder;
pub mod op;
pub mod raw_io;
pub mod shrinker;
pub mod txn;
pub mod wal;

// Re-exports
pub use alloc::Allocator;
pub use buf::{Buf, BufMap};
pub use buftxn::BufTxn;
pub use circular::BlockData;
pub use disk::{Disk, DiskStats, MemDisk};
pub use engine::Engine;
pub use inode::{Inode, InodeKind, MAX_FILE_BLOCKS, NDIRECT, NPTR};
pub use layout::{Geometry, Superblock};
pub use lockmap::LockMap;
pub use lorder::{Probe, lock_inodes, with_ordered_inodes};
pub use op::{FsOp, FsState};
pub use raw_io::FileDisk;
pub use shrinker::Shrinker;
pub use txn::Txn;
pub use wal::{LogPosition, LogStats, Walog};
