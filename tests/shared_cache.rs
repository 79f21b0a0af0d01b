//! Shared-cache behavior: two handles on one tree state, the
//! one-writer rule, table locks, cursor save/restore around another
//! cursor's writes, and root relocation when a table is dropped.

use std::sync::atomic::{AtomicU32, Ordering};

use pagetree::storage::btree::{
    Btree, BtreeInsertFlags, BtreeOpenFlags, BtreePayload, CursorOpenFlags,
    BTREE_AUTOVACUUM_FULL, BTREE_INTKEY,
};
use pagetree::types::OpenFlags;
use pagetree::ErrorCode;

fn unique_name(tag: &str) -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!("shared-{}-{}", tag, NEXT.fetch_add(1, Ordering::SeqCst))
}

fn open_shared(name: &str) -> Btree {
    Btree::open(
        Some("mem"),
        Some(name),
        None,
        BtreeOpenFlags::empty(),
        OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::SHAREDCACHE,
    )
    .unwrap()
}

fn row(key: i64, len: usize) -> BtreePayload {
    BtreePayload {
        key: None,
        n_key: key,
        data: Some(vec![(key % 251) as u8; len]),
        n_zero: 0,
    }
}

#[test]
fn second_writer_waits_for_the_first() {
    let name = unique_name("writer");
    let mut a = open_shared(&name);
    let mut b = open_shared(&name);
    assert!(a.is_sharable());
    assert!(b.is_sharable());

    a.begin_trans(true).unwrap();
    let root = a.create_table(BTREE_INTKEY).unwrap();
    {
        let mut cur = a.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        for key in 0..50i64 {
            cur.insert(&row(key, 20), BtreeInsertFlags::APPEND).unwrap();
        }
        cur.close().unwrap();
    }

    // One write transaction per shared cache.
    let err = b.begin_trans(true).unwrap_err();
    assert_eq!(err.code.primary(), ErrorCode::Busy);

    a.commit().unwrap();

    b.begin_trans(true).unwrap();
    let mut cur = b.cursor(root, CursorOpenFlags::empty(), None).unwrap();
    assert_eq!(cur.count().unwrap(), 50);
    cur.close().unwrap();
    b.commit().unwrap();

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn table_locks_shut_out_cross_handle_readers() {
    let name = unique_name("tablelock");
    let mut a = open_shared(&name);
    let mut b = open_shared(&name);

    a.begin_trans(true).unwrap();
    let root = a.create_table(BTREE_INTKEY).unwrap();
    let cur_a = a.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

    // The write cursor's table lock blocks a reader on the same tree
    // through the other handle.
    b.begin_trans(false).unwrap();
    let err = b.cursor(root, CursorOpenFlags::empty(), None).unwrap_err();
    assert_eq!(err.code.primary(), ErrorCode::Locked);

    drop(cur_a);
    a.commit().unwrap();

    let mut cur_b = b.cursor(root, CursorOpenFlags::empty(), None).unwrap();
    assert!(!cur_b.first().unwrap());
    cur_b.close().unwrap();
    b.commit().unwrap();

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn cursor_reseeks_after_a_sibling_cursor_writes() {
    let name = unique_name("reseek");
    let mut tree = open_shared(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();

    let mut writer = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
    for key in (0..2000i64).step_by(2) {
        writer.insert(&row(key, 40), BtreeInsertFlags::APPEND).unwrap();
    }

    // Park a second cursor mid-tree, then let the writer split pages
    // underneath it. The parked cursor saves its key and reseeks.
    let mut reader = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
    assert_eq!(reader.table_moveto(1000, false).unwrap(), 0);

    for key in (1..2000i64).step_by(2) {
        writer.insert(&row(key, 40), BtreeInsertFlags::empty()).unwrap();
    }

    assert!(reader.next().unwrap());
    assert_eq!(reader.key_size().unwrap(), 1001);
    assert!(reader.previous().unwrap());
    assert!(reader.previous().unwrap());
    assert_eq!(reader.key_size().unwrap(), 999);

    writer.close().unwrap();
    reader.close().unwrap();
    tree.commit().unwrap();
    tree.close().unwrap();
}

#[test]
fn dropping_a_table_relocates_the_largest_root() {
    let name = unique_name("droproot");
    let mut tree = open_shared(&name);
    tree.set_auto_vacuum(BTREE_AUTOVACUUM_FULL).unwrap();
    tree.begin_trans(true).unwrap();

    let first = tree.create_table(BTREE_INTKEY).unwrap();
    let second = tree.create_table(BTREE_INTKEY).unwrap();
    assert!(second > first);
    {
        let mut cur = tree.cursor(second, CursorOpenFlags::WRITABLE, None).unwrap();
        for key in 0..100i64 {
            cur.insert(&row(key, 30), BtreeInsertFlags::APPEND).unwrap();
        }
        cur.close().unwrap();
    }

    // Roots stay contiguous: the tree with the largest root moves into
    // the freed slot and reports where it moved from.
    let moved = tree.drop_table(first).unwrap();
    assert_eq!(moved, second);

    let mut cur = tree.cursor(first, CursorOpenFlags::empty(), None).unwrap();
    assert_eq!(cur.count().unwrap(), 100);
    assert_eq!(cur.table_moveto(42, false).unwrap(), 0);
    assert_eq!(cur.data().unwrap(), vec![42u8; 30]);
    cur.close().unwrap();

    let result = tree.integrity_check(&[first], 100).unwrap();
    assert!(result.is_ok(), "integrity errors: {:?}", result.errors);
    tree.commit().unwrap();
    tree.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let name = unique_name("close");
    let mut tree = open_shared(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();
    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
    cur.insert(&row(1, 10), BtreeInsertFlags::empty()).unwrap();

    cur.close().unwrap();
    cur.close().unwrap();
    tree.commit().unwrap();
    tree.close().unwrap();
    tree.close().unwrap();

    // A second handle still reads the committed state.
    let mut again = open_shared(&name);
    again.begin_trans(false).unwrap();
    let mut cur = again.cursor(root, CursorOpenFlags::empty(), None).unwrap();
    assert_eq!(cur.count().unwrap(), 1);
    cur.close().unwrap();
    again.close().unwrap();
}
