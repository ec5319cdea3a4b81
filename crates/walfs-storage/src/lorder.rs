//! Ordered locking of several inodes
//!
//! Operations that touch more than one inode take their locks in
//! ascending inode number. When the full set is only known after looking
//! at the first inode (a name that resolves to another inode), the
//! operation probes: it reports which inodes it still needs, and if any of
//! them sorts below an inode already held, everything is dropped and the
//! operation restarts holding the complete set from the beginning.

use crate::inode::Inode;
use crate::op::{FsOp, FsState};
use std::sync::Arc;
use tracing::{debug, trace};
use walfs_common::{Inum, Result};

/// What an operation body needs next
#[derive(Debug, PartialEq, Eq)]
pub enum Probe<T> {
    /// The body finished with every lock it needed
    Done(T),
    /// The body must also hold these inodes before it can continue
    Need(Vec<Inum>),
}

fn sorted_unique(inums: &[Inum]) -> Vec<Inum> {
    let mut sorted = inums.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Lock `inums` in ascending order and return them in the order given
pub fn lock_inodes(op: &mut FsOp, inums: &[Inum]) -> Result<Vec<Inode>> {
    for inum in sorted_unique(inums) {
        op.get_inode(inum)?;
    }
    // Already locked, so these come from the operation's buffers.
    inums.iter().map(|&inum| op.get_inode(inum)).collect()
}

/// Run `body` holding the inodes it asks for, acquired in ascending order
///
/// `body` runs with `initial` locked. Each time it returns
/// [`Probe::Need`], inodes above everything held are locked and `body`
/// runs again in the same operation; a request that would lock below a
/// held inode aborts the operation and starts over with the union. Since
/// any run may be followed by a restart, `body` must re-read what it
/// depends on every time. On success the operation is returned
/// uncommitted together with the body's result.
pub fn with_ordered_inodes<T, F>(
    state: &Arc<FsState>,
    initial: &[Inum],
    mut body: F,
) -> Result<(FsOp, T)>
where
    F: FnMut(&mut FsOp) -> Result<Probe<T>>,
{
    let mut want = sorted_unique(initial);
    let mut restarts = 0u32;
    'restart: loop {
        let mut op = FsOp::begin(state);
        lock_inodes(&mut op, &want)?;
        let mut held = want.clone();

        loop {
            let more = match body(&mut op)? {
                Probe::Done(value) => {
                    if restarts > 0 {
                        debug!("ordered locking settled after {} restarts", restarts);
                    }
                    return Ok((op, value));
                }
                Probe::Need(more) => more,
            };

            let missing: Vec<Inum> = sorted_unique(&more)
                .into_iter()
                .filter(|inum| !held.contains(inum))
                .collect();
            let highest = held.last().copied().unwrap_or(0);

            if missing.first().is_none_or(|&lowest| lowest > highest) {
                trace!("extending lock set with {:?}", missing);
                lock_inodes(&mut op, &missing)?;
                held.extend(missing);
            } else {
                trace!("{:?} sorts below held {:?}, restarting", missing, held);
                op.abort();
                held.extend(missing);
                want = sorted_unique(&held);
                restarts += 1;
                continue 'restart;
            }
        }
    }
}
