//! Write-ahead log with group commit and asynchronous installation
//!
//! Committed blocks move through three regions of one position space:
//!
//! ```text
//!   start            disk_end            mem_end
//!     |  durable, not    |  in memory only   |
//!     |  yet installed   |                   |
//! ----+------------------+-------------------+---->
//! ```
//!
//! `append` extends `mem_end`. The logger thread writes `[disk_end,
//! mem_end)` to the circular store as one batch, which is the group commit.
//! The installer thread copies `[start, disk_end)` to home locations and
//! retires it. `mem_end - start` never exceeds the log capacity; `append`
//! blocks until the installer frees room.

use crate::circular::{self, BlockData, CircularAppender};
use crate::disk::Disk;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace};
use walfs_common::{Block, Bnum, Error, Result};

/// Position in the log (number of blocks ever appended before it)
pub type LogPosition = u64;

/// Snapshot of the log boundaries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogStats {
    /// Everything below this position is installed at home
    pub installed: LogPosition,
    /// Everything below this position is durable in the log
    pub durable: LogPosition,
    /// Everything below this position has been appended
    pub logged: LogPosition,
    /// Log capacity in blocks
    pub capacity: u64,
}

impl LogStats {
    /// Blocks occupying log space
    #[must_use]
    pub const fn in_use(&self) -> u64 {
        self.logged - self.installed
    }
}

/// The three-pointer ring of not-yet-installed blocks
///
/// `entries[i]` lives at position `start + i`.
#[derive(Debug)]
struct LogRing {
    start: LogPosition,
    disk_end: LogPosition,
    entries: VecDeque<BlockData>,
}

impl LogRing {
    fn new(pos: LogPosition) -> Self {
        Self {
            start: pos,
            disk_end: pos,
            entries: VecDeque::new(),
        }
    }

    fn mem_end(&self) -> LogPosition {
        self.start + self.entries.len() as u64
    }

    fn range(&self, from: LogPosition, to: LogPosition) -> Vec<BlockData> {
        let lo = (from - self.start) as usize;
        let hi = (to - self.start) as usize;
        self.entries.range(lo..hi).cloned().collect()
    }

    fn lookup(&self, blkno: Bnum) -> Option<&BlockData> {
        self.entries.iter().rev().find(|b| b.blkno == blkno)
    }

    fn check(&self, capacity: u64) {
        debug_assert!(self.start <= self.disk_end);
        debug_assert!(self.disk_end <= self.mem_end());
        debug_assert!(self.mem_end() - self.start <= capacity);
    }
}

#[derive(Debug)]
struct WalState {
    ring: LogRing,
    shutdown: bool,
    logger_done: bool,
    failure: Option<String>,
}

impl WalState {
    fn check_failed(&self) -> Result<()> {
        match &self.failure {
            Some(msg) => Err(Error::LogFailed(msg.clone())),
            None => Ok(()),
        }
    }
}

struct Shared {
    disk: Arc<dyn Disk>,
    capacity: u64,
    state: Mutex<WalState>,
    /// New entries appended, or `disk_end` advanced
    cond_logger: Condvar,
    /// `disk_end` advanced, or `start` advanced
    cond_install: Condvar,
}

impl Shared {
    fn fail(&self, state: &mut MutexGuard<'_, WalState>, who: &str, err: &Error) {
        error!("Log {} failed: {}", who, err);
        if state.failure.is_none() {
            state.failure = Some(format!("{who}: {err}"));
        }
        self.cond_logger.notify_all();
        self.cond_install.notify_all();
    }
}

/// The write-ahead log
pub struct Walog {
    shared: Arc<Shared>,
    logger: Mutex<Option<JoinHandle<()>>>,
    installer: Mutex<Option<JoinHandle<()>>>,
}

impl Walog {
    /// Write empty log headers to a fresh image
    pub fn format(disk: &dyn Disk, capacity: u64) -> Result<()> {
        circular::format(disk, capacity)
    }

    /// Recover the on-disk log and start the logger and installer
    pub fn open(disk: Arc<dyn Disk>, capacity: u64) -> Result<Self> {
        let (appender, end) = circular::recover(&*disk, capacity)?;
        info!("Log recovered at position {} ({} slots)", end, capacity);

        let wal = Self {
            shared: Arc::new(Shared {
                disk,
                capacity,
                state: Mutex::new(WalState {
                    ring: LogRing::new(end),
                    shutdown: false,
                    logger_done: false,
                    failure: None,
                }),
                cond_logger: Condvar::new(),
                cond_install: Condvar::new(),
            }),
            logger: Mutex::new(None),
            installer: Mutex::new(None),
        };
        wal.start_background(appender);
        Ok(wal)
    }

    fn start_background(&self, appender: CircularAppender) {
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || logger_loop(&shared, appender));
        *self.logger.lock() = Some(handle);

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || installer_loop(&shared));
        *self.installer.lock() = Some(handle);
    }

    /// Log capacity in blocks
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Current boundaries
    #[must_use]
    pub fn stats(&self) -> LogStats {
        let state = self.shared.state.lock();
        LogStats {
            installed: state.ring.start,
            durable: state.ring.disk_end,
            logged: state.ring.mem_end(),
            capacity: self.shared.capacity,
        }
    }

    /// Read the latest committed contents of a block
    pub fn read(&self, blkno: Bnum) -> Result<Block> {
        {
            let state = self.shared.state.lock();
            if let Some(b) = state.ring.lookup(blkno) {
                trace!("read block {} from log", blkno);
                return Ok(b.data.to_vec());
            }
        }
        // Not in the ring, so every logged copy is already installed.
        self.shared.disk.read(blkno)
    }

    /// Append one transaction's blocks atomically
    ///
    /// Blocks until the ring has room. Fails with `LogFull` at once if the
    /// transaction alone is larger than the log.
    pub fn append(&self, blocks: Vec<BlockData>) -> Result<LogPosition> {
        let n = blocks.len() as u64;
        let capacity = self.shared.capacity;
        if n > capacity {
            return Err(Error::LogFull {
                blocks: blocks.len(),
                capacity,
            });
        }

        let mut state = self.shared.state.lock();
        loop {
            state.check_failed()?;
            if state.shutdown {
                return Err(Error::ShuttingDown);
            }
            if state.ring.mem_end() - state.ring.start + n <= capacity {
                break;
            }
            trace!("append of {} blocks waiting for log space", n);
            self.shared.cond_install.wait(&mut state);
        }

        state.ring.entries.extend(blocks);
        state.ring.check(capacity);
        let pos = state.ring.mem_end();
        self.shared.cond_logger.notify_all();
        debug!("appended {} blocks, log end {}", n, pos);
        Ok(pos)
    }

    /// Block until everything below `pos` is durable
    pub fn wait_durable(&self, pos: LogPosition) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.ring.disk_end < pos {
            state.check_failed()?;
            if state.logger_done {
                return Err(Error::ShuttingDown);
            }
            self.shared.cond_logger.wait(&mut state);
        }
        Ok(())
    }

    /// Block until everything appended so far is durable
    pub fn flush(&self) -> Result<()> {
        let pos = self.shared.state.lock().ring.mem_end();
        self.wait_durable(pos)
    }

    /// Block until everything appended so far is installed at home
    pub fn wait_installed(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let pos = state.ring.mem_end();
        while state.ring.start < pos {
            state.check_failed()?;
            if state.logger_done && state.ring.start == state.ring.disk_end {
                return Err(Error::ShuttingDown);
            }
            self.shared.cond_install.wait(&mut state);
        }
        Ok(())
    }

    /// Drain the log and stop the background threads
    ///
    /// Appended blocks are made durable and installed before the threads
    /// exit. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.cond_logger.notify_all();
            self.shared.cond_install.notify_all();
        }

        if let Some(handle) = self.logger.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.installer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Walog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn logger_loop(shared: &Shared, mut appender: CircularAppender) {
    debug!("Logger thread started");
    loop {
        let (from, batch) = {
            let mut state = shared.state.lock();
            while state.ring.disk_end == state.ring.mem_end()
                && !state.shutdown
                && state.failure.is_none()
            {
                shared.cond_logger.wait(&mut state);
            }
            if state.failure.is_some() || state.ring.disk_end == state.ring.mem_end() {
                break;
            }
            let from = state.ring.disk_end;
            (from, state.ring.range(from, state.ring.mem_end()))
        };

        match appender.append(&*shared.disk, from, &batch) {
            Ok(new_end) => {
                let mut state = shared.state.lock();
                state.ring.disk_end = new_end;
                state.ring.check(shared.capacity);
                shared.cond_logger.notify_all();
                shared.cond_install.notify_all();
            }
            Err(e) => {
                let mut state = shared.state.lock();
                shared.fail(&mut state, "logger", &e);
                break;
            }
        }
    }

    let mut state = shared.state.lock();
    state.logger_done = true;
    shared.cond_logger.notify_all();
    shared.cond_install.notify_all();
    debug!("Logger thread stopped");
}

fn install_batch(disk: &dyn Disk, batch: &[BlockData], new_start: LogPosition) -> Result<()> {
    for b in batch {
        disk.write(b.blkno, &b.data)?;
    }
    disk.barrier()?;
    circular::write_start(disk, new_start)
}

fn installer_loop(shared: &Shared) {
    debug!("Installer thread started");
    loop {
        let (from, batch) = {
            let mut state = shared.state.lock();
            while state.ring.start == state.ring.disk_end
                && !state.logger_done
                && state.failure.is_none()
            {
                shared.cond_install.wait(&mut state);
            }
            if state.failure.is_some() || state.ring.start == state.ring.disk_end {
                break;
            }
            let from = state.ring.start;
            (from, state.ring.range(from, state.ring.disk_end))
        };

        let new_start = from + batch.len() as u64;
        match install_batch(&*shared.disk, &batch, new_start) {
            Ok(()) => {
                let mut state = shared.state.lock();
                state.ring.entries.drain(..batch.len());
                state.ring.start = new_start;
                state.ring.check(shared.capacity);
                trace!("installed through position {}", new_start);
                shared.cond_install.notify_all();
            }
            Err(e) => {
                let mut state = shared.state.lock();
                shared.fail(&mut state, "installer", &e);
                break;
            }
        }
    }
    debug!("Installer thread stopped");
}
