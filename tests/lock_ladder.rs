//! File-level locking: the NONE → SHARED → RESERVED → PENDING →
//! EXCLUSIVE ladder, reserved-lock visibility between handles, and the
//! busy-not-block rule, all against real files.

use pagetree::os::vfs::{os_init, vfs_find, Vfs, VfsFile};
use pagetree::storage::pager::{Pager, PagerOpenFlags};
use pagetree::types::{LockLevel, OpenFlags};
use pagetree::ErrorCode;
use std::sync::Arc;
use tempfile::tempdir;

fn default_vfs() -> Arc<dyn Vfs> {
    os_init();
    vfs_find(None).expect("a default vfs is registered")
}

fn open_pair(path: &str) -> (Box<dyn VfsFile>, Box<dyn VfsFile>) {
    let vfs = default_vfs();
    let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB;
    let a = vfs.open(Some(path), flags).unwrap();
    let b = vfs.open(Some(path), flags).unwrap();
    (a, b)
}

#[test]
fn ladder_up_and_down() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ladder.db");
    let path = path.to_str().unwrap();
    let vfs = default_vfs();
    let file = vfs
        .open(
            Some(path),
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB,
        )
        .unwrap();

    file.lock(LockLevel::Shared).unwrap();
    file.lock(LockLevel::Reserved).unwrap();
    file.lock(LockLevel::Exclusive).unwrap();
    file.unlock(LockLevel::Shared).unwrap();
    file.unlock(LockLevel::None).unwrap();

    // Relocking after a full release starts the ladder over.
    file.lock(LockLevel::Shared).unwrap();
    file.unlock(LockLevel::None).unwrap();
}

#[test]
fn reserved_lock_is_visible_to_other_handles() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reserved.db");
    let (a, b) = open_pair(path.to_str().unwrap());

    assert!(!b.check_reserved_lock().unwrap());
    a.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Reserved).unwrap();
    assert!(b.check_reserved_lock().unwrap());

    a.unlock(LockLevel::Shared).unwrap();
    assert!(!b.check_reserved_lock().unwrap());
    a.unlock(LockLevel::None).unwrap();
}

#[test]
fn competing_locks_fail_fast_with_busy() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let (a, b) = open_pair(path.to_str().unwrap());

    // Two readers coexist; only one handle can reserve.
    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Reserved).unwrap();
    let err = b.lock(LockLevel::Reserved).unwrap_err();
    assert_eq!(err.code.primary(), ErrorCode::Busy);

    // The reserving handle cannot go exclusive over a live reader.
    let err = a.lock(LockLevel::Exclusive).unwrap_err();
    assert_eq!(err.code.primary(), ErrorCode::Busy);

    // Once the reader leaves, the writer finishes the climb.
    b.unlock(LockLevel::None).unwrap();
    a.lock(LockLevel::Exclusive).unwrap();

    // A new reader is shut out until the writer descends.
    let err = b.lock(LockLevel::Shared).unwrap_err();
    assert_eq!(err.code.primary(), ErrorCode::Busy);
    a.unlock(LockLevel::None).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    b.unlock(LockLevel::None).unwrap();
}

#[test]
fn two_pagers_one_writer_at_a_time() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("writers.db");
    let path = path.to_str().unwrap();
    let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB;

    let mut a = Pager::open(None, Some(path), PagerOpenFlags::empty(), flags).unwrap();
    let mut b = Pager::open(None, Some(path), PagerOpenFlags::empty(), flags).unwrap();

    a.shared_lock().unwrap();
    a.begin(false).unwrap();

    b.shared_lock().unwrap();
    let err = b.begin(false).unwrap_err();
    assert_eq!(err.code.primary(), ErrorCode::Busy);

    a.commit_phase_one().unwrap();
    a.commit_phase_two().unwrap();

    b.begin(false).unwrap();
    b.rollback().unwrap();

    a.close().unwrap();
    b.close().unwrap();
}
