//! Data-path tests across page boundaries: splits, merges, overflow
//! chains, and ordered scans, with the integrity checker as referee.

use std::sync::atomic::{AtomicU32, Ordering};

use pagetree::storage::btree::{
    BtCursor, Btree, BtreeInsertFlags, BtreeOpenFlags, BtreePayload, CursorOpenFlags,
    BTREE_FREE_PAGE_COUNT, BTREE_INTKEY,
};
use pagetree::types::OpenFlags;
use pagetree::Pgno;

fn unique_name(tag: &str) -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!("balance-{}-{}", tag, NEXT.fetch_add(1, Ordering::SeqCst))
}

fn open_tree(name: &str) -> Btree {
    Btree::open(
        Some("mem"),
        Some(name),
        None,
        BtreeOpenFlags::UNSHARABLE,
        OpenFlags::READWRITE | OpenFlags::CREATE,
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

fn check_clean(tree: &mut Btree, root: Pgno) {
    let result = tree.integrity_check(&[root], 100).unwrap();
    assert!(result.is_ok(), "integrity errors: {:?}", result.errors);
}

fn scan_keys(cur: &mut BtCursor) -> Vec<i64> {
    let mut keys = Vec::new();
    let mut more = cur.first().unwrap();
    while more {
        keys.push(cur.key_size().unwrap());
        more = cur.next().unwrap();
    }
    keys
}

#[test]
fn round_trip_mixed_order() {
    let name = unique_name("roundtrip");
    let mut tree = open_tree(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();
    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

    // 991 is coprime with 2000, so this visits every key once in a
    // scrambled order that splits pages in the middle.
    let n = 2000i64;
    let mut key = 0i64;
    for _ in 0..n {
        key = (key + 991) % n;
        cur.insert(&row(key, 40), BtreeInsertFlags::empty()).unwrap();
    }

    for key in 0..n {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0, "key {}", key);
        assert_eq!(cur.data().unwrap(), vec![(key % 251) as u8; 40]);
    }
    assert_ne!(cur.table_moveto(n, false).unwrap(), 0);
    assert_eq!(scan_keys(&mut cur), (0..n).collect::<Vec<_>>());

    cur.close().unwrap();
    check_clean(&mut tree, root);
    tree.commit().unwrap();
}

#[test]
fn append_only_hundred_thousand_rowids() {
    let name = unique_name("append");
    let mut tree = open_tree(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();
    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

    let n = 100_000i64;
    for key in 1..=n {
        cur.insert(&row(key, 8), BtreeInsertFlags::APPEND).unwrap();
    }

    assert!(cur.last().unwrap());
    assert_eq!(cur.key_size().unwrap(), n);
    assert!(cur.previous().unwrap());
    assert!(cur.previous().unwrap());
    assert_eq!(cur.key_size().unwrap(), 99_998);

    assert_eq!(cur.count().unwrap(), n);
    cur.close().unwrap();
    check_clean(&mut tree, root);
    tree.commit().unwrap();
}

#[test]
fn interleaved_inserts_and_deletes_stay_balanced() {
    let name = unique_name("churn");
    let mut tree = open_tree(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();
    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

    for key in 0..3000i64 {
        cur.insert(&row(key, 50), BtreeInsertFlags::APPEND).unwrap();
    }
    for key in (0..3000i64).step_by(3) {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
        cur.delete().unwrap();
    }
    for key in 3000..4000i64 {
        cur.insert(&row(key, 50), BtreeInsertFlags::APPEND).unwrap();
    }
    for key in 1000..2000i64 {
        if cur.table_moveto(key, false).unwrap() == 0 {
            cur.delete().unwrap();
        }
    }

    let keys = scan_keys(&mut cur);
    let expected: Vec<i64> = (0..1000i64)
        .chain(2000..3000)
        .filter(|k| k % 3 != 0)
        .chain(3000..4000)
        .collect();
    assert_eq!(keys, expected);

    cur.close().unwrap();
    check_clean(&mut tree, root);
    tree.commit().unwrap();
}

#[test]
fn overflow_chains_survive_balancing() {
    let name = unique_name("overflow");
    let mut tree = open_tree(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();
    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

    // Every payload spills; insert order is scrambled so the spilled
    // cells migrate between siblings as pages split.
    let n = 60i64;
    let mut key = 0i64;
    for _ in 0..n {
        key = (key + 37) % n;
        cur.insert(&row(key, 6000), BtreeInsertFlags::empty()).unwrap();
    }
    for key in 0..n {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
        let data = cur.data().unwrap();
        assert_eq!(data.len(), 6000);
        assert!(data.iter().all(|&b| b == (key % 251) as u8));
    }

    for key in (0..n).step_by(2) {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
        cur.delete().unwrap();
    }
    assert_eq!(cur.count().unwrap(), n / 2);
    cur.close().unwrap();
    check_clean(&mut tree, root);
    assert!(tree.get_meta(BTREE_FREE_PAGE_COUNT).unwrap() > 0);
    tree.commit().unwrap();
}

#[test]
fn deep_tree_keeps_uniform_leaf_depth() {
    let name = unique_name("deep");
    let mut tree = open_tree(&name);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(BTREE_INTKEY).unwrap();
    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

    // Two cells per leaf forces several interior levels. The integrity
    // check fails if any two leaves end up at different depths.
    for key in 0..2000i64 {
        cur.insert(&row(key, 1500), BtreeInsertFlags::APPEND).unwrap();
    }
    assert_eq!(cur.count().unwrap(), 2000);
    cur.close().unwrap();
    check_clean(&mut tree, root);

    let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
    for key in 0..2000i64 {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
        cur.delete().unwrap();
    }
    assert!(!cur.first().unwrap());
    cur.close().unwrap();
    check_clean(&mut tree, root);
    tree.commit().unwrap();
}
