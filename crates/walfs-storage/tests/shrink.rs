//! Background shrinking of truncated and unlinked files

mod common;

use common::{CrashDisk, config, formatted};
use std::sync::Arc;
use walfs_common::{BLOCK_SIZE, Bnum, Error, Handle};
use walfs_storage::{Disk, Engine, InodeKind, MemDisk, NDIRECT, NPTR};

fn free_blocks(disk: &MemDisk, log: u64) -> u64 {
    let engine = Engine::open(Arc::new(disk.snapshot()), &config(log)).unwrap();
    engine.state().blocks().free_count()
}

/// Write one full block at each index, one operation per block
fn build_file(engine: &Engine, indices: &[u64]) -> Handle {
    let mut op = engine.begin();
    let ip = op.alloc_inode().unwrap();
    op.commit(true).unwrap();

    for &idx in indices {
        let mut op = engine.begin();
        let mut ip = op.get_inode_handle(ip.handle()).unwrap();
        let fill = (idx % 251) as u8 + 1;
        ip.write(&mut op, idx * BLOCK_SIZE as u64, &vec![fill; BLOCK_SIZE])
            .unwrap();
        op.write_inode(&ip);
        op.commit(true).unwrap();
    }
    ip.handle()
}

fn truncate(engine: &Engine, handle: Handle, size: u64) {
    let mut op = engine.begin();
    let mut ip = op.get_inode_handle(handle).unwrap();
    ip.truncate(&mut op, size).unwrap();
    op.commit(true).unwrap();
}

fn referenced(engine: &Engine, handle: Handle) -> Vec<Bnum> {
    let mut op = engine.begin();
    let ip = op.get_inode_handle(handle).unwrap();
    let blocks = ip.referenced_blocks(&mut op).unwrap();
    op.abort();
    blocks
}

fn assert_empty(engine: &Engine, handle: Handle) {
    let mut op = engine.begin();
    let ip = op.get_inode_handle(handle).unwrap();
    assert_eq!(ip.size, 0);
    assert_eq!(ip.shrink_target, 0);
    assert!(ip.blks.iter().all(|&b| b == 0));
    op.abort();
}

#[test]
fn test_truncate_to_zero_frees_indirect_blocks() {
    let disk = Arc::new(formatted(1024, 8));
    let base_free = free_blocks(&disk, 8);
    let engine = Engine::open(disk, &config(8)).unwrap();

    let indices: Vec<u64> = (0..NDIRECT + 3).collect();
    let handle = build_file(&engine, &indices);
    let used = referenced(&engine, handle);
    // Thirteen data blocks plus the single-indirect block.
    assert_eq!(used.len(), 14);

    truncate(&engine, handle, 0);
    engine.wait_shrinks();

    assert_empty(&engine, handle);
    let blocks = engine.state().blocks();
    for bn in used {
        assert!(!blocks.is_allocated(bn), "block {bn} still allocated");
    }
    assert_eq!(blocks.free_count(), base_free);
}

#[test]
fn test_partial_truncate_keeps_lower_blocks() {
    let disk = Arc::new(formatted(1024, 8));
    let base_free = free_blocks(&disk, 8);
    let engine = Engine::open(disk, &config(8)).unwrap();

    let indices: Vec<u64> = (0..NDIRECT + 3).collect();
    let handle = build_file(&engine, &indices);
    truncate(&engine, handle, (NDIRECT + 1) * BLOCK_SIZE as u64);
    engine.wait_shrinks();

    let mut op = engine.begin();
    let ip = op.get_inode_handle(handle).unwrap();
    assert!(!ip.is_shrinking());
    assert_ne!(ip.bmap(&mut op, NDIRECT).unwrap(), 0);
    assert_eq!(ip.bmap(&mut op, NDIRECT + 1).unwrap(), 0);
    assert_eq!(ip.bmap(&mut op, NDIRECT + 2).unwrap(), 0);
    let tail = ip
        .read(&mut op, NDIRECT * BLOCK_SIZE as u64, BLOCK_SIZE)
        .unwrap();
    assert_eq!(tail, vec![(NDIRECT % 251) as u8 + 1; BLOCK_SIZE]);
    op.abort();

    // Eleven data blocks and the indirect block remain.
    assert_eq!(engine.state().blocks().free_count(), base_free - 12);
}

#[test]
fn test_unlink_frees_double_indirect_tree_and_inode() {
    let disk = Arc::new(formatted(2048, 16));
    let base_free = free_blocks(&disk, 16);
    let engine = Engine::open(disk, &config(16)).unwrap();

    let far = NDIRECT + NPTR + 5;
    let handle = build_file(&engine, &[0, NDIRECT + 2, far]);
    let used = referenced(&engine, handle);
    // Three data blocks, one single-indirect, a double-indirect root and
    // one of its children.
    assert_eq!(used.len(), 6);

    let mut op = engine.begin();
    let mut ip = op.get_inode_handle(handle).unwrap();
    ip.unlink(&mut op).unwrap();
    assert_eq!(ip.nlink, 0);
    assert!(ip.is_shrinking());
    op.commit(true).unwrap();
    engine.wait_shrinks();

    let state = engine.state();
    assert_eq!(state.blocks().free_count(), base_free);
    assert!(!state.inodes().is_allocated(handle.inum));

    let mut op = engine.begin();
    assert!(matches!(
        op.get_inode_handle(handle),
        Err(Error::Stale { .. })
    ));
    assert_eq!(op.get_inode(handle.inum).unwrap().kind, InodeKind::Free);
    op.abort();
}

#[test]
fn test_pending_shrink_blocks_growth_and_resumes_on_open() {
    let disk = Arc::new(formatted(1024, 8));
    let base_free = free_blocks(&disk, 8);

    let handle = {
        let engine = Engine::open(disk.clone(), &config(8)).unwrap();
        let indices: Vec<u64> = (0..NDIRECT + 3).collect();
        let handle = build_file(&engine, &indices);

        // Keep the shrink pending by refusing new workers.
        engine.state().shrinker().shutdown();
        truncate(&engine, handle, 0);

        let mut op = engine.begin();
        let mut ip = op.get_inode_handle(handle).unwrap();
        assert!(ip.is_shrinking());
        assert!(matches!(
            ip.write(&mut op, 0, b"grow"),
            Err(Error::ShrinkInProgress { .. })
        ));
        assert!(matches!(
            ip.truncate(&mut op, BLOCK_SIZE as u64),
            Err(Error::ShrinkInProgress { .. })
        ));
        op.abort();
        handle
    };

    let engine = Engine::open(disk, &config(8)).unwrap();
    engine.wait_shrinks();
    assert_empty(&engine, handle);
    assert_eq!(engine.state().blocks().free_count(), base_free);

    // Growth works again once the shrink is done.
    let mut op = engine.begin();
    let mut ip = op.get_inode_handle(handle).unwrap();
    ip.write(&mut op, 0, b"grow").unwrap();
    op.write_inode(&ip);
    op.commit(true).unwrap();
}

#[test]
fn test_shrink_survives_crash_at_any_point() {
    let base = formatted(1024, 8);
    let base_free = free_blocks(&base, 8);

    for budget in [0, 2, 5, 11, 23, 47, 95] {
        let disk = Arc::new(CrashDisk::new(&base));
        let handle = {
            let engine = Engine::open(disk.clone(), &config(8)).unwrap();
            let indices: Vec<u64> = (0..NDIRECT + 4).collect();
            let handle = build_file(&engine, &indices);
            truncate(&engine, handle, 0);
            disk.crash_after(budget);
            engine.wait_shrinks();
            handle
        };

        let image = disk.image();
        assert_eq!(image.size(), 1024);
        let engine = Engine::open(Arc::new(image), &config(8)).unwrap();
        engine.wait_shrinks();
        assert_empty(&engine, handle);
        assert_eq!(
            engine.state().blocks().free_count(),
            base_free,
            "leaked blocks after crash at budget {budget}"
        );
    }
}
