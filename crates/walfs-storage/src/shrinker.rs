//! Background release of truncated file blocks
//!
//! Freeing a large file can dirty more blocks than the log holds, so the
//! shrinker releases it over several bounded transactions. Each worker
//! frees from `shrink_target` downward while the transaction has room,
//! commits the lowered target, and repeats until the target meets the
//! file size. Progress is persisted with every commit, so a crash at any
//! point resumes from the last committed target at the next open.

use crate::inode::InodeKind;
use crate::op::{FsOp, FsState};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walfs_common::{Error, Inum, Result, ShrinkConfig};

/// Worker count and shutdown flag, changed together under one lock
#[derive(Default)]
struct Workers {
    active: usize,
    shutting_down: bool,
}

#[derive(Default)]
struct Tracker {
    workers: Mutex<Workers>,
    cond_idle: Condvar,
}

/// Counts one running worker until dropped, including by unwinding
struct WorkerGuard(Arc<Tracker>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut workers = self.0.workers.lock();
        workers.active -= 1;
        if workers.active == 0 {
            self.0.cond_idle.notify_all();
        }
    }
}

/// Shrink worker bookkeeping
pub struct Shrinker {
    config: ShrinkConfig,
    tracker: Arc<Tracker>,
}

impl Shrinker {
    /// Create an idle shrinker
    #[must_use]
    pub fn new(config: ShrinkConfig) -> Self {
        Self {
            config,
            tracker: Arc::default(),
        }
    }

    /// Register a worker unless shutdown has begun
    fn enter(&self) -> Option<WorkerGuard> {
        let mut workers = self.tracker.workers.lock();
        if workers.shutting_down {
            return None;
        }
        workers.active += 1;
        Some(WorkerGuard(Arc::clone(&self.tracker)))
    }

    /// Start a worker that shrinks `inum`
    ///
    /// Ignored once shutdown has begun; the pending shrink is persisted
    /// and resumes at the next open.
    pub fn start(&self, state: &Arc<FsState>, inum: Inum) {
        let Some(guard) = self.enter() else {
            debug!("shrink of inode {} deferred to next open", inum);
            return;
        };

        let state = Arc::clone(state);
        thread::spawn(move || {
            let _guard = guard;
            match shrink(&state, inum) {
                Ok(()) => debug!("shrink of inode {} complete", inum),
                Err(e) => error!("shrink of inode {} stopped: {}", inum, e),
            }
        });
    }

    /// Number of running workers
    #[must_use]
    pub fn active(&self) -> usize {
        self.tracker.workers.lock().active
    }

    /// Block until no worker is running
    pub fn wait_idle(&self) {
        let mut workers = self.tracker.workers.lock();
        while workers.active > 0 {
            self.tracker.cond_idle.wait(&mut workers);
        }
    }

    /// Refuse new work and wait for running workers to finish
    pub fn shutdown(&self) {
        let mut workers = self.tracker.workers.lock();
        workers.shutting_down = true;
        if workers.active > 0 {
            info!("Waiting for {} shrink workers", workers.active);
        }
        while workers.active > 0 {
            self.tracker.cond_idle.wait(&mut workers);
        }
    }
}

/// Outcome of one shrink transaction
enum Step {
    Done,
    More,
}

fn shrink(state: &Arc<FsState>, inum: Inum) -> Result<()> {
    let config = &state.shrinker.config;
    let mut failures = 0u32;
    loop {
        let op = FsOp::begin(state);
        match shrink_step(op, inum, config.reserve_blocks) {
            Ok(Step::Done) => return Ok(()),
            Ok(Step::More) => failures = 0,
            Err(e) if e.is_retryable() && failures < config.max_retries => {
                let backoff = config.backoff_ms.saturating_mul(1 << failures.min(16));
                warn!(
                    "shrink of inode {} failed to commit ({}), retrying in {}ms",
                    inum, e, backoff
                );
                failures += 1;
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Free as many blocks as one transaction allows and commit
fn shrink_step(mut op: FsOp, inum: Inum, reserve: u64) -> Result<Step> {
    let mut ip = op.get_inode(inum)?;
    if ip.kind == InodeKind::Free || (!ip.is_shrinking() && ip.nlink > 0) {
        op.abort();
        return Ok(Step::Done);
    }

    let floor = ip.nblocks();
    let budget = op.log_capacity();
    // The inode is written by every step, so count it from the start.
    op.write_inode(&ip);
    while ip.shrink_target > floor && (op.ndirty() as u64) + reserve < budget {
        ip.shrink_target -= 1;
        ip.free_index(&mut op, ip.shrink_target)?;
    }

    let done = ip.shrink_target <= floor;
    if done {
        ip.shrink_target = floor;
    }
    debug!(
        "inode {}: shrink target {} (size {} blocks), {} dirty",
        inum,
        ip.shrink_target,
        floor,
        op.ndirty()
    );
    if done && ip.nlink == 0 {
        op.free_inode(&mut ip)?;
    } else {
        op.write_inode(&ip);
    }

    match op.commit(false) {
        Ok(()) if done => Ok(Step::Done),
        Ok(()) => Ok(Step::More),
        Err(Error::ShuttingDown) => {
            info!("shrink of inode {} interrupted by shutdown", inum);
            Ok(Step::Done)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_idle_shrinker() {
        let shrinker = Shrinker::new(ShrinkConfig::default());
        assert_eq!(shrinker.active(), 0);
        shrinker.wait_idle();
        shrinker.shutdown();
        assert!(shrinker.tracker.workers.lock().shutting_down);
    }

    #[test]
    fn test_no_worker_registers_after_shutdown() {
        let shrinker = Shrinker::new(ShrinkConfig::default());
        let guard = shrinker.enter().unwrap();
        assert_eq!(shrinker.active(), 1);
        drop(guard);

        shrinker.shutdown();
        assert!(shrinker.enter().is_none());
        assert_eq!(shrinker.active(), 0);
    }

    #[test]
    fn test_panicking_worker_is_released() {
        let shrinker = Shrinker::new(ShrinkConfig::default());
        let guard = shrinker.enter().unwrap();
        let worker = thread::spawn(move || {
            let _guard = guard;
            panic!("worker failed");
        });
        assert!(worker.join().is_err());
        assert_eq!(shrinker.active(), 0);

        let start = Instant::now();
        shrinker.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_waits_for_running_worker() {
        let shrinker = Shrinker::new(ShrinkConfig::default());
        let guard = shrinker.enter().unwrap();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        shrinker.shutdown();
        assert_eq!(shrinker.active(), 0);
        worker.join().unwrap();
    }
}
