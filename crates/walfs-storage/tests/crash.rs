//! Crash consistency of committed operations

mod common;

use common::{CrashDisk, config, formatted};
use std::sync::Arc;
use walfs_common::{BLOCK_SIZE, Inum};
use walfs_storage::{Engine, FileDisk, InodeKind, MemDisk};

const LOG: u64 = 16;
const BLOCKS: u64 = 512;

fn payload(fill: u8) -> Vec<u8> {
    vec![fill; 2 * BLOCK_SIZE + 100]
}

/// Create a file, then rewrite it in a second operation
fn run(engine: &Engine) {
    let mut op = engine.begin();
    let mut ip = op.alloc_inode().unwrap();
    ip.write(&mut op, 0, &payload(1)).unwrap();
    op.write_inode(&ip);
    op.commit(true).unwrap();

    let mut op = engine.begin();
    let mut ip = op.get_inode_handle(ip.handle()).unwrap();
    ip.write(&mut op, 0, &payload(2)).unwrap();
    op.write_inode(&ip);
    op.commit(false).unwrap();
    engine.flush().unwrap();
}

fn free_blocks(disk: &MemDisk) -> u64 {
    let engine = Engine::open(Arc::new(disk.snapshot()), &config(LOG)).unwrap();
    engine.state().blocks().free_count()
}

/// Check that the image holds either no file or one complete version
fn check(image: MemDisk, base_free: u64) {
    let engine = Engine::open(Arc::new(image), &config(LOG)).unwrap();
    let ninodes = engine.geometry().ninodes;
    let mut op = engine.begin();
    let files: Vec<Inum> = (1..ninodes)
        .filter(|&inum| op.get_inode(inum).unwrap().kind == InodeKind::File)
        .collect();

    match files.as_slice() {
        [] => assert_eq!(engine.state().blocks().free_count(), base_free),
        [inum] => {
            let ip = op.get_inode(*inum).unwrap();
            assert_eq!(ip.size, payload(1).len() as u64);
            let data = ip.read(&mut op, 0, payload(1).len()).unwrap();
            assert!(data == payload(1) || data == payload(2), "torn file contents");

            let used = ip.referenced_blocks(&mut op).unwrap();
            for bn in &used {
                assert!(engine.state().blocks().is_allocated(*bn));
            }
            assert_eq!(
                engine.state().blocks().free_count(),
                base_free - used.len() as u64
            );
        }
        more => panic!("expected at most one file, found {more:?}"),
    }
    op.abort();
}

#[test]
fn test_crash_at_every_write_is_atomic() {
    let base = formatted(BLOCKS, LOG);
    let base_free = free_blocks(&base);

    let reference = Arc::new(CrashDisk::new(&base));
    {
        let engine = Engine::open(reference.clone(), &config(LOG)).unwrap();
        run(&engine);
    }
    let total = reference.writes();
    assert!(total > 0);

    for n in 0..=total {
        let disk = Arc::new(CrashDisk::new(&base));
        disk.crash_after(n);
        {
            let engine = Engine::open(disk.clone(), &config(LOG)).unwrap();
            run(&engine);
        }
        check(disk.image(), base_free);
    }
}

#[test]
fn test_crash_during_replay_is_atomic() {
    let base = formatted(BLOCKS, LOG);
    let base_free = free_blocks(&base);

    let reference = Arc::new(CrashDisk::new(&base));
    {
        let engine = Engine::open(reference.clone(), &config(LOG)).unwrap();
        run(&engine);
    }
    let total = reference.writes();

    let mut replayed = 0;
    for n in 0..=total {
        let first = Arc::new(CrashDisk::new(&base));
        first.crash_after(n);
        {
            let engine = Engine::open(first.clone(), &config(LOG)).unwrap();
            run(&engine);
        }
        let image = first.image();

        // A complete reopen of this image; at least one replayed block
        // plus the start header means a log was left to recover.
        let full = Arc::new(CrashDisk::new(&image));
        drop(Engine::open(full.clone(), &config(LOG)).unwrap());
        let recovery_writes = full.writes();
        if recovery_writes > 1 {
            replayed += 1;
        }

        for k in 0..=recovery_writes {
            let second = Arc::new(CrashDisk::new(&image));
            second.crash_after(k);
            drop(Engine::open(second.clone(), &config(LOG)).unwrap());
            check(second.image(), base_free);
        }
    }
    assert!(replayed > 0, "no crash point left a log to replay");
}

#[test]
fn test_durable_commit_survives_crash() {
    let disk = Arc::new(formatted(BLOCKS, LOG));
    let engine = Engine::open(disk.clone(), &config(LOG)).unwrap();

    let mut op = engine.begin();
    let mut ip = op.alloc_inode().unwrap();
    ip.write(&mut op, 0, &[7u8; 100]).unwrap();
    op.write_inode(&ip);
    op.commit(true).unwrap();

    // Crash right after the commit returns.
    let image = disk.snapshot();
    let restarted = Engine::open(Arc::new(image), &config(LOG)).unwrap();
    let mut op = restarted.begin();
    let ip = op.get_inode_handle(ip.handle()).unwrap();
    assert_eq!(ip.size, 100);
    assert_eq!(ip.read(&mut op, 0, 100).unwrap(), vec![7u8; 100]);
    op.abort();
}

#[test]
fn test_clean_shutdown_keeps_unwaited_commits() {
    let disk = Arc::new(formatted(BLOCKS, LOG));
    let handle = {
        let engine = Engine::open(disk.clone(), &config(LOG)).unwrap();
        let mut op = engine.begin();
        let mut ip = op.alloc_inode().unwrap();
        ip.write(&mut op, 0, b"lazy").unwrap();
        op.write_inode(&ip);
        op.commit(false).unwrap();
        ip.handle()
    };

    let engine = Engine::open(disk, &config(LOG)).unwrap();
    let mut op = engine.begin();
    let ip = op.get_inode_handle(handle).unwrap();
    assert_eq!(ip.read(&mut op, 0, 4).unwrap(), b"lazy");
    op.abort();
}

#[test]
fn test_file_backed_image_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("walfs.img");

    let handle = {
        let disk = FileDisk::create(&path, BLOCKS, true).unwrap();
        let engine = Engine::create(Arc::new(disk), &config(LOG)).unwrap();
        let mut op = engine.begin();
        let mut ip = op.alloc_inode().unwrap();
        ip.write(&mut op, 0, &[9u8; 100]).unwrap();
        op.write_inode(&ip);
        op.commit(true).unwrap();
        ip.handle()
    };

    let disk = FileDisk::open(&path, true).unwrap();
    let engine = Engine::open(Arc::new(disk), &config(LOG)).unwrap();
    let mut op = engine.begin();
    let ip = op.get_inode_handle(handle).unwrap();
    assert_eq!(ip.read(&mut op, 0, 100).unwrap(), vec![9u8; 100]);
    op.abort();
}
