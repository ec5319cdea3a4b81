//! Buffered transactions
//!
//! A `BufTxn` remembers which addresses it has locked and keeps the
//! buffers it has read or written, so repeated reads are served from
//! memory and see the transaction's own writes. Nothing reaches the log
//! until `commit_wait`.

use crate::buf::{Buf, BufMap};
use crate::txn::Txn;
use std::sync::Arc;
use tracing::debug;
use walfs_common::{Address, Result, TxnId};

/// A transaction with its own buffer overlay
pub struct BufTxn {
    txn: Arc<Txn>,
    bufs: BufMap,
    id: TxnId,
    addrs: Vec<Address>,
    finished: bool,
}

impl BufTxn {
    /// Start a transaction
    pub fn begin(txn: Arc<Txn>) -> Self {
        let id = txn.begin();
        debug!("Begin {}", id);
        Self {
            txn,
            bufs: BufMap::new(),
            id,
            addrs: Vec::new(),
            finished: false,
        }
    }

    /// Transaction id
    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    /// True if this transaction holds the lock on `addr`
    #[must_use]
    pub fn is_locked(&self, addr: Address) -> bool {
        self.addrs.contains(&addr)
    }

    /// Lock `addr` (blocking) without loading it
    pub fn acquire(&mut self, addr: Address) {
        self.txn.acquire(addr, self.id);
        self.addrs.push(addr);
    }

    fn ensure_locked(&mut self, addr: Address) {
        if !self.is_locked(addr) {
            self.acquire(addr);
        }
    }

    /// Lock `addr` if needed and return this transaction's buffer for it
    pub fn read_locked(&mut self, addr: Address) -> Result<&mut Buf> {
        self.ensure_locked(addr);
        if !self.bufs.contains(&addr) {
            let buf = self.txn.load(addr)?;
            return Ok(self.bufs.insert(buf));
        }
        Ok(self
            .bufs
            .get_mut(&addr)
            .unwrap_or_else(|| unreachable!("buffer for {addr:?} present")))
    }

    /// Lock `addr` if needed and replace its contents without loading
    ///
    /// # Panics
    /// Panics if `data` is not exactly as long as the address.
    pub fn overwrite(&mut self, addr: Address, data: Vec<u8>) {
        self.ensure_locked(addr);
        match self.bufs.get_mut(&addr) {
            Some(buf) => {
                buf.replace(data);
                buf.set_dirty();
            }
            None => self.bufs.insert(Buf::new(addr, data)).set_dirty(),
        }
    }

    /// Forget `addr` and release its lock
    pub fn release(&mut self, addr: Address) {
        self.bufs.remove(&addr);
        if let Some(i) = self.addrs.iter().position(|a| *a == addr) {
            self.addrs.swap_remove(i);
        }
        self.txn.release(addr, self.id);
    }

    /// Number of dirty buffers
    #[must_use]
    pub fn ndirty(&self) -> usize {
        self.bufs.ndirty()
    }

    /// Log capacity in blocks
    #[must_use]
    pub fn log_capacity(&self) -> u64 {
        self.txn.log_capacity()
    }

    /// The transaction manager this transaction runs on
    #[must_use]
    pub fn txn(&self) -> &Arc<Txn> {
        &self.txn
    }

    fn check(&self) {
        for addr in self.bufs.dirty_addrs() {
            assert!(
                self.addrs.contains(&addr),
                "{}: dirty buffer {addr:?} was never locked",
                self.id
            );
        }
    }

    /// Commit dirty buffers and release every lock
    ///
    /// `Error::LogFull` means nothing was committed.
    pub fn commit_wait(mut self, wait: bool, abort: bool) -> Result<()> {
        if cfg!(debug_assertions) {
            self.check();
        }
        debug!("Commit {} wait={} abort={}", self.id, wait, abort);
        self.finished = true;
        let addrs = std::mem::take(&mut self.addrs);
        let bufs = std::mem::take(&mut self.bufs).into_dirty();
        self.txn.commit_wait(&addrs, bufs, wait, abort, self.id)
    }

    /// Discard all changes and release every lock
    pub fn abort(self) {
        // An abort never appends, so it cannot fail.
        let _ = self.commit_wait(false, true);
    }

    /// Wait until the whole log is durable and release every lock
    ///
    /// Buffers of this transaction are discarded, not committed.
    pub fn flush(mut self) -> Result<()> {
        self.finished = true;
        let addrs = std::mem::take(&mut self.addrs);
        self.txn.flush(&addrs, self.id)
    }
}

impl Drop for BufTxn {
    fn drop(&mut self) {
        if !self.finished {
            debug!("{} dropped without commit, releasing locks", self.id);
            for addr in self.addrs.drain(..) {
                self.txn.release(addr, self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::wal::Walog;
    use walfs_common::BLOCK_SIZE;

    const CAP: u64 = 16;
    const HOME: u64 = 64;

    fn setup() -> Arc<Txn> {
        let disk = Arc::new(MemDisk::new(128));
        Walog::format(&*disk, CAP).unwrap();
        let log = Arc::new(Walog::open(disk, CAP).unwrap());
        Arc::new(Txn::new(log))
    }

    #[test]
    fn test_read_your_writes() {
        let txn = setup();
        let addr = Address::bytes(HOME, 0, 128);
        let mut bt = BufTxn::begin(Arc::clone(&txn));

        bt.read_locked(addr).unwrap().put_u64(0, 42);
        assert_eq!(bt.read_locked(addr).unwrap().get_u64(0), 42);
        assert_eq!(bt.ndirty(), 1);
        assert_eq!(bt.addrs.len(), 1);

        // Not visible to others before commit.
        assert_eq!(txn.load(addr).unwrap().get_u64(0), 0);
        bt.commit_wait(true, false).unwrap();
        assert_eq!(txn.load(addr).unwrap().get_u64(0), 42);
    }

    #[test]
    fn test_overwrite_skips_load() {
        let txn = setup();
        let addr = Address::bytes(HOME, 128, 128);
        let mut bt = BufTxn::begin(Arc::clone(&txn));
        bt.overwrite(addr, vec![5; 128]);
        assert_eq!(bt.read_locked(addr).unwrap().data(), &[5u8; 128][..]);
        bt.overwrite(addr, vec![6; 128]);
        bt.commit_wait(true, false).unwrap();

        let block = txn.log().read(HOME).unwrap();
        assert!(block[128..256].iter().all(|&b| b == 6));
        assert!(block[..128].iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_overwrite_wrong_length_panics() {
        let txn = setup();
        let mut bt = BufTxn::begin(txn);
        bt.overwrite(Address::block(HOME), vec![0; 10]);
    }

    #[test]
    fn test_release_drops_lock_and_buffer() {
        let txn = setup();
        let addr = Address::block(HOME);
        let mut bt = BufTxn::begin(Arc::clone(&txn));
        bt.overwrite(addr, vec![1; BLOCK_SIZE]);
        bt.release(addr);
        assert!(!bt.is_locked(addr));
        assert_eq!(bt.ndirty(), 0);

        // Another transaction can take it immediately.
        let mut other = BufTxn::begin(Arc::clone(&txn));
        other.read_locked(addr).unwrap();
        other.commit_wait(false, false).unwrap();
        bt.commit_wait(true, false).unwrap();
        assert_eq!(txn.log_stats().logged, 0);
    }

    #[test]
    fn test_drop_releases_locks() {
        let txn = setup();
        let addr = Address::bit(HOME, 3);
        {
            let mut bt = BufTxn::begin(Arc::clone(&txn));
            bt.overwrite(addr, vec![1]);
        }
        let mut bt = BufTxn::begin(Arc::clone(&txn));
        assert_eq!(bt.read_locked(addr).unwrap().data(), &[0]);
        bt.abort();
    }

    #[test]
    fn test_flush_waits_for_earlier_commits() {
        let txn = setup();
        let mut bt = BufTxn::begin(Arc::clone(&txn));
        bt.overwrite(Address::block(HOME), vec![3; BLOCK_SIZE]);
        bt.commit_wait(false, false).unwrap();

        let bt = BufTxn::begin(Arc::clone(&txn));
        bt.flush().unwrap();
        let stats = txn.log_stats();
        assert_eq!(stats.durable, stats.logged);
    }

    #[test]
    #[should_panic(expected = "never locked")]
    fn test_check_catches_unlocked_dirty_buffer() {
        let txn = setup();
        let mut bt = BufTxn::begin(txn);
        let addr = Address::block(HOME);
        bt.bufs.insert(Buf::new(addr, vec![0; BLOCK_SIZE])).set_dirty();
        bt.check();
    }
}
