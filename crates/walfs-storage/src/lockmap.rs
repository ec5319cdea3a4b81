//! Per-address locks
//!
//! Locks are keyed by the flattened address id and spread over a fixed
//! number of shards, each a mutex-protected map with its own condition
//! variable. An entry exists only while the address is held or awaited.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use tracing::trace;
use walfs_common::TxnId;

/// Number of shards (prime, so block-aligned ids spread evenly)
const N_SHARDS: usize = 43;

#[derive(Debug, Default)]
struct LockState {
    holder: u64,
    waiters: usize,
}

#[derive(Default)]
struct Shard {
    state: Mutex<HashMap<u64, LockState>>,
    cond: Condvar,
}

impl Shard {
    fn acquire(&self, id: u64, txn: TxnId) {
        let mut map = self.state.lock();
        let mut waited = false;
        loop {
            let entry = map.entry(id).or_default();
            if entry.holder == TxnId::UNLOCKED {
                entry.holder = txn.get();
                if waited {
                    entry.waiters -= 1;
                }
                return;
            }
            assert_ne!(
                entry.holder,
                txn.get(),
                "{txn} acquiring lock {id:#x} it already holds"
            );
            if !waited {
                entry.waiters += 1;
                waited = true;
            }
            trace!("{} waiting for lock {:#x} held by txn-{}", txn, id, entry.holder);
            self.cond.wait(&mut map);
        }
    }

    fn release(&self, id: u64, txn: TxnId) {
        let mut map = self.state.lock();
        let holder = map.get(&id).map_or(TxnId::UNLOCKED, |e| e.holder);
        assert_eq!(
            holder,
            txn.get(),
            "{txn} releasing lock {id:#x} held by txn-{holder}"
        );
        let waiters = map.get_mut(&id).map_or(0, |e| {
            e.holder = TxnId::UNLOCKED;
            e.waiters
        });
        if waiters == 0 {
            map.remove(&id);
        } else {
            self.cond.notify_all();
        }
    }

    fn holder(&self, id: u64) -> Option<TxnId> {
        self.state
            .lock()
            .get(&id)
            .filter(|e| e.holder != TxnId::UNLOCKED)
            .map(|e| TxnId::new(e.holder))
    }
}

/// Mutual exclusion over flattened addresses
pub struct LockMap {
    shards: [Shard; N_SHARDS],
}

impl Default for LockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LockMap {
    /// Create an empty lock map
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: [(); N_SHARDS].map(|()| Shard::default()),
        }
    }

    fn shard(&self, id: u64) -> &Shard {
        &self.shards[(id % N_SHARDS as u64) as usize]
    }

    /// Block until `id` is free, then take it for `txn`
    ///
    /// # Panics
    /// Panics if `txn` already holds `id`; that acquisition would never
    /// return.
    pub fn acquire(&self, id: u64, txn: TxnId) {
        self.shard(id).acquire(id, txn);
    }

    /// Release `id`
    ///
    /// # Panics
    /// Panics if `txn` is not the holder.
    pub fn release(&self, id: u64, txn: TxnId) {
        self.shard(id).release(id, txn);
    }

    /// Current holder of `id`, if any
    #[must_use]
    pub fn holder(&self, id: u64) -> Option<TxnId> {
        self.shard(id).holder(id)
    }
}
