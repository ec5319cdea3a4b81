//! Transaction manager
//!
//! Hands out transaction ids, locks disk objects through the [`LockMap`],
//! loads them through the log and commits a transaction's dirty buffers
//! as one log append. Lock ordering is the caller's job.

use crate::buf::Buf;
use crate::circular::BlockData;
use crate::lockmap::LockMap;
use crate::wal::{LogStats, Walog};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};
use walfs_common::{Address, Result, TxnId};

/// The transaction manager
pub struct Txn {
    log: Arc<Walog>,
    locks: LockMap,
    next_id: AtomicU64,
    /// Serializes block merging and the log append
    commit: Mutex<()>,
}

impl Txn {
    /// Create a transaction manager on top of an open log
    #[must_use]
    pub fn new(log: Arc<Walog>) -> Self {
        Self {
            log,
            locks: LockMap::new(),
            next_id: AtomicU64::new(1),
            commit: Mutex::new(()),
        }
    }

    /// Allocate a fresh transaction id
    pub fn begin(&self) -> TxnId {
        TxnId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Lock a disk object for `id`
    pub fn acquire(&self, addr: Address, id: TxnId) {
        self.locks.acquire(addr.flat_id(), id);
    }

    /// Unlock a disk object held by `id`
    pub fn release(&self, addr: Address, id: TxnId) {
        self.locks.release(addr.flat_id(), id);
    }

    /// Load a disk object as of the latest commit
    pub fn load(&self, addr: Address) -> Result<Buf> {
        let block = self.log.read(addr.block)?;
        Ok(Buf::load(addr, &block))
    }

    fn release_all(&self, addrs: &[Address], id: TxnId) {
        trace!("{} releasing {} locks", id, addrs.len());
        for addr in addrs {
            self.release(*addr, id);
        }
    }

    /// Merge buffers into whole-block images, one per distinct block
    ///
    /// Must run under the commit mutex so partial blocks are read after
    /// every earlier commit has been appended.
    fn install_bufs(&self, mut bufs: Vec<Buf>) -> Result<Vec<BlockData>> {
        bufs.sort_by_key(|b| b.addr().flat_id());
        let mut blocks = Vec::new();

        for group in bufs.chunk_by(|a, b| a.addr().block == b.addr().block) {
            let blkno = group[0].addr().block;
            let image = if let [only] = group
                && only.addr().is_full_block()
            {
                only.data().to_vec()
            } else {
                let mut image = self.log.read(blkno)?;
                for buf in group {
                    buf.install(&mut image);
                }
                image
            };
            trace!("merged {} bufs into block {}", group.len(), blkno);
            blocks.push(BlockData::new(blkno, image));
        }
        Ok(blocks)
    }

    /// Commit `bufs` atomically and release every lock in `addrs`
    ///
    /// With `wait`, returns once the commit is durable. An `abort`, or a
    /// commit with no dirty buffers, appends nothing. `Error::LogFull`
    /// means nothing was committed. Locks are released in every case.
    pub fn commit_wait(
        &self,
        addrs: &[Address],
        bufs: Vec<Buf>,
        wait: bool,
        abort: bool,
        id: TxnId,
    ) -> Result<()> {
        let result = if abort || bufs.is_empty() {
            debug!("{} finished without appending (abort={})", id, abort);
            Ok(())
        } else {
            self.do_commit(bufs, wait, id)
        };
        self.release_all(addrs, id);
        result
    }

    fn do_commit(&self, bufs: Vec<Buf>, wait: bool, id: TxnId) -> Result<()> {
        let nbufs = bufs.len();
        let pos = {
            let _commit = self.commit.lock();
            let blocks = self.install_bufs(bufs)?;
            debug!("{} committing {} bufs in {} blocks", id, nbufs, blocks.len());
            self.log.append(blocks)?
        };
        if wait {
            self.log.wait_durable(pos)?;
        }
        Ok(())
    }

    /// Wait until everything logged so far is durable, then release `addrs`
    pub fn flush(&self, addrs: &[Address], id: TxnId) -> Result<()> {
        let result = self.log.flush();
        self.release_all(addrs, id);
        result
    }

    /// Log capacity in blocks
    #[must_use]
    pub fn log_capacity(&self) -> u64 {
        self.log.capacity()
    }

    /// Current log boundaries
    #[must_use]
    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }

    /// The underlying log
    #[must_use]
    pub fn log(&self) -> &Walog {
        &self.log
    }
}
