//! B-tree layer over the pager.
//!
//! A database file holds any number of b-trees, each rooted at a fixed
//! page. Tables keyed by 64-bit rowids store their payload in the tree
//! itself; index trees store an opaque byte-string key and no separate
//! payload. Pages follow the SQLite file format: a 100-byte file header
//! on page 1, then fixed-size pages each carrying a page header, a cell
//! pointer array that grows down the page, and cell content that grows
//! up from the end of the usable area. Payloads too large for one page
//! spill onto a singly-linked chain of overflow pages.
//!
//! Several database connections may share one `BtShared` structure for
//! the same file when shared-cache mode is enabled. Cross-handle cursor
//! safety is managed through per-tree cursor slots: before a writer
//! restructures a tree, every other cursor on that tree saves its key
//! and reseeks afterwards.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use lazy_static::lazy_static;

use crate::error::{Error, ErrorCode, Result};
use crate::os::mutex::RecursiveMutex;
use crate::os::vfs::{os_init, vfs_find};
use crate::shared_cache::shared_cache_enabled;
use crate::storage::pager::{Pager, PagerGetFlags, PagerOpenFlags, SavepointOp};
use crate::types::{OpenFlags, Pgno};

mod encoding;
mod types;

pub use encoding::{
    put_varint_at, read_u16, read_u32, read_varint, read_varint32, varint_len, write_u16,
    write_u32, write_varint,
};
pub use types::{
    BtLock, BtreeInsertFlags, BtreeOpenFlags, BtsFlags, BytewiseComparator, CursorOpenFlags,
    CursorState, DbHeader, KeyComparator, PageLimits, TableLockEntry, TransState,
    BTREE_APPLICATION_ID, BTREE_AUTOVACUUM_FULL, BTREE_AUTOVACUUM_INCR, BTREE_AUTOVACUUM_NONE,
    BTREE_BLOBKEY, BTREE_DATA_VERSION, BTREE_DEFAULT_CACHE_SIZE, BTREE_FILE_FORMAT,
    BTREE_FREE_PAGE_COUNT, BTREE_INCR_VACUUM, BTREE_INTKEY, BTREE_LARGEST_ROOT_PAGE,
    BTREE_SCHEMA_VERSION, BTREE_TEXT_ENCODING, BTREE_USER_VERSION, CURSOR_MAX_DEPTH,
    DEFAULT_PAGE_SIZE, FILE_HEADER, FILE_HEADER_SIZE, LEAF_FRACTION, MAX_EMBEDDED_FRACTION,
    MAX_PAGE_SIZE, MIN_EMBEDDED_FRACTION, MIN_PAGE_SIZE, MIN_USABLE_SIZE, N_BTREE_META,
    PAGE_HEADER_SIZE_INTERIOR, PAGE_HEADER_SIZE_LEAF, PTF_INDEX_INTERIOR, PTF_INDEX_LEAF,
    PTF_INTKEY, PTF_LEAF, PTF_LEAFDATA, PTF_TABLE_INTERIOR, PTF_TABLE_LEAF, PTF_ZERODATA,
    PTRMAP_BTREE, PTRMAP_FREEPAGE, PTRMAP_OVERFLOW1, PTRMAP_OVERFLOW2, PTRMAP_ROOTPAGE,
};

/// Neighbors considered on each side when redistributing cells.
const NN: usize = 1;
/// Total sibling pages involved in one redistribution pass.
const NB: usize = 2 * NN + 1;

// ============================================================================
// Byte-order helpers
// ============================================================================

fn get2(data: &[u8], offset: usize) -> Result<u16> {
    read_u16(data, offset).ok_or_else(|| Error::new(ErrorCode::Corrupt))
}

/// Read a 2-byte content-area offset where a stored zero means 65536.
fn get2nz(data: &[u8], offset: usize) -> Result<usize> {
    let raw = get2(data, offset)? as i32;
    Ok((((raw - 1) & 0xffff) + 1) as usize)
}

fn get4(data: &[u8], offset: usize) -> Result<u32> {
    read_u32(data, offset).ok_or_else(|| Error::new(ErrorCode::Corrupt))
}

fn corrupt(msg: &str) -> Error {
    Error::with_message(ErrorCode::Corrupt, msg)
}

// ============================================================================
// Shared-cache registry
// ============================================================================

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    /// Open shared trees keyed by canonical database path. Entries are weak
    /// so an abandoned tree never pins its pager.
    static ref SHARED_TREES: Mutex<Vec<(String, Weak<SharedState>)>> = Mutex::new(Vec::new());
}

fn shared_tree_lookup(key: &str) -> Option<Arc<SharedState>> {
    let mut list = match SHARED_TREES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    list.retain(|(_, weak)| weak.strong_count() > 0);
    list.iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, weak)| weak.upgrade())
}

fn shared_tree_insert(key: &str, shared: &Arc<SharedState>) {
    let mut list = match SHARED_TREES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    list.push((key.to_string(), Arc::downgrade(shared)));
}

fn shared_tree_remove(key: &str) {
    let mut list = match SHARED_TREES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(pos) = list.iter().position(|(k, _)| k == key) {
        list.remove(pos);
    }
}

// ============================================================================
// Cross-tree lock ordering
// ============================================================================

struct SiblingSlot {
    handle_id: u64,
    shared: Arc<SharedState>,
    locked: bool,
    want_to_lock: u32,
}

/// The set of shared trees attached to one database connection, kept in a
/// fixed order so every handle acquires tree mutexes the same way. A handle
/// that blocks on one tree first releases every tree that sorts after it,
/// then reacquires them once its own lock is held.
#[derive(Clone, Default)]
pub struct BtreeSiblings {
    slots: Arc<Mutex<Vec<SiblingSlot>>>,
}

impl BtreeSiblings {
    pub fn new() -> BtreeSiblings {
        BtreeSiblings {
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<SiblingSlot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, handle_id: u64, shared: &Arc<SharedState>) {
        let mut slots = self.lock_slots();
        let identity = Arc::as_ptr(shared) as usize;
        let pos = slots
            .iter()
            .position(|s| (Arc::as_ptr(&s.shared) as usize, s.handle_id) > (identity, handle_id))
            .unwrap_or(slots.len());
        slots.insert(
            pos,
            SiblingSlot {
                handle_id,
                shared: Arc::clone(shared),
                locked: false,
                want_to_lock: 0,
            },
        );
    }

    fn unregister(&self, handle_id: u64) {
        let mut slots = self.lock_slots();
        slots.retain(|s| s.handle_id != handle_id);
    }

    fn enter(&self, handle_id: u64) {
        let mut slots = self.lock_slots();
        let me = match slots.iter().position(|s| s.handle_id == handle_id) {
            Some(i) => i,
            None => return,
        };
        slots[me].want_to_lock += 1;
        if slots[me].locked {
            return;
        }
        let my_shared = Arc::clone(&slots[me].shared);
        // Drop every lock that sorts after ours before blocking, so two
        // handles working through their lists in order can never deadlock.
        for i in (me + 1)..slots.len() {
            if slots[i].locked && !Arc::ptr_eq(&slots[i].shared, &my_shared) {
                slots[i].shared.mutex.leave();
                slots[i].locked = false;
            }
        }
        my_shared.mutex.enter();
        slots[me].locked = true;
        for i in (me + 1)..slots.len() {
            if !slots[i].locked && slots[i].want_to_lock > 0 {
                slots[i].shared.mutex.enter();
                slots[i].locked = true;
            }
        }
    }

    fn leave(&self, handle_id: u64) {
        let mut slots = self.lock_slots();
        if let Some(me) = slots.iter().position(|s| s.handle_id == handle_id) {
            if slots[me].want_to_lock > 0 {
                slots[me].want_to_lock -= 1;
            }
            if slots[me].want_to_lock == 0 && slots[me].locked {
                slots[me].shared.mutex.leave();
                slots[me].locked = false;
            }
        }
    }
}

// ============================================================================
// Shared tree state
// ============================================================================

/// Position of a cursor captured before a tree is restructured. Rowid trees
/// save the integer key; index trees save the full key record, overflow
/// included.
#[derive(Debug, Clone)]
enum SavedKey {
    Rowid(i64),
    Record(Vec<u8>),
}

/// Registration record for one open cursor. Cursor handles are owned by
/// callers; the slot is how other operations on the same tree reach a
/// cursor to save or invalidate its position.
struct CursorSlot {
    id: u64,
    owner: u64,
    root: Pgno,
    state: CursorState,
    pgno: Pgno,
    ix: u16,
    skip: i32,
    saved_key: Option<SavedKey>,
}

/// One open database file, shared between every handle attached to it.
struct BtShared {
    pager: Pager,
    registry_key: Option<String>,
    n_ref: u32,
    page_size: u32,
    usable_size: u32,
    reserve: u8,
    max_local: u16,
    min_local: u16,
    max_leaf: u16,
    min_leaf: u16,
    bts_flags: BtsFlags,
    auto_vacuum: u8,
    incr_vacuum: bool,
    do_truncate: Option<Pgno>,
    in_transaction: TransState,
    n_transaction: u32,
    page1_pinned: bool,
    free_pages: Vec<Pgno>,
    freelist_loaded: bool,
    cursors: Vec<CursorSlot>,
    next_cursor_id: u64,
    table_locks: Vec<TableLockEntry>,
}

/// Lock wrapper shared by all handles on one file: the recursive mutex
/// serializes tree access across handles, the inner lock guards the data.
struct SharedState {
    mutex: RecursiveMutex,
    state: RwLock<BtShared>,
}

impl Drop for BtShared {
    fn drop(&mut self) {
        let _ = self.pager.close();
    }
}

impl BtShared {
    // ------------------------------------------------------------------
    // Page layout
    // ------------------------------------------------------------------

    /// Recompute the payload spill thresholds after a page size change.
    fn apply_page_layout(&mut self) {
        let usable = self.usable_size;
        self.max_local = ((usable - 12) * MAX_EMBEDDED_FRACTION as u32 / 255 - 23) as u16;
        self.min_local = ((usable - 12) * MIN_EMBEDDED_FRACTION as u32 / 255 - 23) as u16;
        self.max_leaf = (usable - 35) as u16;
        self.min_leaf = self.min_local;
    }

    /// Page that overlaps the pending-byte lock region. Never used for data.
    fn pending_page(&self) -> Pgno {
        (crate::storage::pager::PENDING_BYTE / self.page_size as i64) as Pgno + 1
    }

    // ------------------------------------------------------------------
    // Raw page access
    // ------------------------------------------------------------------

    /// Snapshot a page's bytes.
    fn page_data(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        let page = self.pager.acquire(pgno, PagerGetFlags::empty())?;
        let data = page.data.clone();
        self.pager.release(pgno);
        Ok(data)
    }

    /// Journal a page and rewrite it through the supplied closure.
    fn write_page_data<F>(&mut self, pgno: Pgno, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        let mut page = self.pager.acquire(pgno, PagerGetFlags::empty())?;
        let mut rc = self.pager.write(&mut page);
        if rc.is_ok() {
            rc = f(&mut page.data);
        }
        if rc.is_ok() {
            self.pager.update(&page);
        }
        self.pager.release(pgno);
        rc
    }

    /// Journal a page whose old content is irrelevant, zero it, and fill it.
    fn fill_new_page<F>(&mut self, pgno: Pgno, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        let mut page = self.pager.acquire(pgno, PagerGetFlags::NOCONTENT)?;
        let mut rc = self.pager.write(&mut page);
        if rc.is_ok() {
            page.data.fill(0);
            rc = f(&mut page.data);
        }
        if rc.is_ok() {
            self.pager.update(&page);
        }
        self.pager.release(pgno);
        rc
    }

    /// Read and decode a b-tree page.
    fn read_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        let data = self.page_data(pgno)?;
        MemPage::from_data(pgno, data, self)
    }

    /// Write a decoded page image back out. The page must be settled: a
    /// page still carrying parked overflow cells has no on-disk form.
    fn write_page(&mut self, page: &MemPage) -> Result<()> {
        if !page.overflow.is_empty() {
            return Err(Error::new(ErrorCode::Internal));
        }
        self.write_page_data(page.pgno, |data| {
            if data.len() != page.data.len() {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            data.copy_from_slice(&page.data);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // File header and metadata
    // ------------------------------------------------------------------

    /// Read one of the 32-bit metadata slots on page 1. Slot 15 reads the
    /// file change counter, which advances on every commit.
    fn meta(&mut self, idx: usize) -> Result<u32> {
        if idx >= N_BTREE_META {
            return Err(Error::new(ErrorCode::Range));
        }
        let data = self.page_data(1)?;
        if idx == BTREE_DATA_VERSION {
            return get4(&data, 24);
        }
        get4(&data, 36 + 4 * idx)
    }

    fn put_meta(&mut self, idx: usize, value: u32) -> Result<()> {
        if idx == 0 || idx >= BTREE_DATA_VERSION {
            return Err(Error::new(ErrorCode::Range));
        }
        self.write_page_data(1, |data| write_u32(data, 36 + 4 * idx, value))?;
        if idx == BTREE_INCR_VACUUM {
            self.incr_vacuum = value != 0;
            if self.auto_vacuum != BTREE_AUTOVACUUM_NONE {
                self.auto_vacuum = if value != 0 {
                    BTREE_AUTOVACUUM_INCR
                } else {
                    BTREE_AUTOVACUUM_FULL
                };
            }
        }
        Ok(())
    }

    /// Write the file header and an empty rowid-table root into a database
    /// that has no pages yet.
    fn new_db(&mut self) -> Result<()> {
        if self.pager.page_count()? > 0 {
            return Ok(());
        }
        let page_size = self.page_size;
        let usable = self.usable_size;
        let reserve = self.reserve;
        let vacuum_on = self.auto_vacuum != BTREE_AUTOVACUUM_NONE;
        let incremental = self.auto_vacuum == BTREE_AUTOVACUUM_INCR;
        self.fill_new_page(1, |data| {
            data[..16].copy_from_slice(&FILE_HEADER);
            let stored = if page_size == MAX_PAGE_SIZE {
                1u16
            } else {
                page_size as u16
            };
            data[16..18].copy_from_slice(&stored.to_be_bytes());
            data[18] = 1;
            data[19] = 1;
            data[20] = reserve;
            data[21] = MAX_EMBEDDED_FRACTION;
            data[22] = MIN_EMBEDDED_FRACTION;
            data[23] = LEAF_FRACTION;
            write_u32(data, 36 + 4 * BTREE_LARGEST_ROOT_PAGE, vacuum_on as u32)?;
            write_u32(data, 36 + 4 * BTREE_INCR_VACUUM, incremental as u32)?;
            data[FILE_HEADER_SIZE] = PTF_TABLE_LEAF;
            write_u16(data, FILE_HEADER_SIZE + 5, (usable & 0xffff) as u16)?;
            Ok(())
        })?;
        self.bts_flags.insert(BtsFlags::PAGESIZE_FIXED);
        self.freelist_loaded = true;
        Ok(())
    }

    /// Take the shared lock, pin page 1, and verify the header still
    /// matches what this tree was opened with.
    fn lock_btree(&mut self) -> Result<()> {
        if self.page1_pinned {
            return Ok(());
        }
        self.pager.shared_lock()?;
        let n_page = self.pager.page_count()?;
        let page1 = self.pager.acquire(1, PagerGetFlags::empty())?;
        if n_page > 0 {
            let header = match DbHeader::parse(&page1.data) {
                Ok(h) => h,
                Err(e) => {
                    let detail = if e.code == ErrorCode::NotADb {
                        Error::with_message(
                            ErrorCode::NotADb,
                            format!("bad header magic {}", hex::encode(&page1.data[..16])),
                        )
                    } else {
                        e
                    };
                    self.pager.release(1);
                    return Err(detail);
                }
            };
            if header.write_version > 1 {
                self.bts_flags.insert(BtsFlags::READ_ONLY);
            }
            if header.page_size != self.page_size || header.reserve != self.reserve {
                self.pager.release(1);
                return Err(Error::with_message(
                    ErrorCode::NotADb,
                    "page size changed since the file was opened",
                ));
            }
            self.auto_vacuum = if header.largest_root != 0 {
                if header.incr_vacuum {
                    BTREE_AUTOVACUUM_INCR
                } else {
                    BTREE_AUTOVACUUM_FULL
                }
            } else {
                BTREE_AUTOVACUUM_NONE
            };
            self.incr_vacuum = header.incr_vacuum;
            self.bts_flags.insert(BtsFlags::PAGESIZE_FIXED);
        }
        self.page1_pinned = true;
        Ok(())
    }

    /// Drop the page 1 pin once nothing references the tree. Releasing the
    /// last pin is what lets the pager give up its shared file lock.
    fn unlock_if_unused(&mut self) {
        if self.page1_pinned && self.n_transaction == 0 && self.cursors.is_empty() {
            self.pager.release(1);
            self.page1_pinned = false;
        }
    }

    // ------------------------------------------------------------------
    // Freelist
    // ------------------------------------------------------------------

    /// Load the freelist from its trunk chain into memory. Trunk pages are
    /// themselves free and join the in-memory set; the whole list is
    /// rewritten from scratch when the transaction commits.
    fn load_freelist(&mut self) -> Result<()> {
        self.free_pages.clear();
        let header = self.page_data(1)?;
        let mut trunk = get4(&header, 32)?;
        let declared = get4(&header, 36)?;
        let max_leaves = (self.usable_size as usize - 8) / 4;
        let n_page = self.pager.page_count()?;
        while trunk != 0 {
            if trunk < 2 || trunk > n_page {
                return Err(corrupt("freelist trunk page out of range"));
            }
            if self.free_pages.len() as u32 > declared {
                return Err(corrupt("freelist chain longer than its declared size"));
            }
            let data = self.page_data(trunk)?;
            let next = get4(&data, 0)?;
            let count = get4(&data, 4)? as usize;
            if count > max_leaves {
                return Err(corrupt("freelist trunk page holds too many leaves"));
            }
            for i in 0..count {
                let leaf = get4(&data, 8 + 4 * i)?;
                if leaf < 2 || leaf > n_page {
                    return Err(corrupt("freelist leaf page out of range"));
                }
                self.free_pages.push(leaf);
            }
            self.free_pages.push(trunk);
            trunk = next;
        }
        self.freelist_loaded = true;
        Ok(())
    }

    /// Rewrite the trunk chain from the in-memory set. The highest page
    /// numbers become the trunks so data pages keep the low numbers.
    fn save_freelist(&mut self) -> Result<()> {
        if !self.freelist_loaded {
            return Ok(());
        }
        self.free_pages.sort_unstable();
        self.free_pages.dedup();
        let max_leaves = (self.usable_size as usize - 8) / 4;
        let total = self.free_pages.len();
        let mut trunk_head: Pgno = 0;
        if total > 0 {
            let num_trunks = (total + max_leaves) / (max_leaves + 1);
            let split = total - num_trunks;
            let leaves = self.free_pages[..split].to_vec();
            let trunks = self.free_pages[split..].to_vec();
            for (t, &trunk) in trunks.iter().enumerate() {
                let next = trunks.get(t + 1).copied().unwrap_or(0);
                let lo = t * max_leaves;
                let hi = ((t + 1) * max_leaves).min(leaves.len());
                let chunk = leaves[lo..hi].to_vec();
                self.fill_new_page(trunk, |data| {
                    write_u32(data, 0, next)?;
                    write_u32(data, 4, chunk.len() as u32)?;
                    for (i, &leaf) in chunk.iter().enumerate() {
                        write_u32(data, 8 + 4 * i, leaf)?;
                    }
                    Ok(())
                })?;
            }
            trunk_head = trunks[0];
        }
        let count = total as u32;
        self.write_page_data(1, |data| {
            write_u32(data, 32, trunk_head)?;
            write_u32(data, 36, count)
        })
    }

    /// Adjust the free page count stored in the file header.
    fn update_free_page_count(&mut self, delta: i64) -> Result<()> {
        self.write_page_data(1, |data| {
            let current = get4(data, 36)? as i64;
            let next = (current + delta).max(0) as u32;
            write_u32(data, 36, next)
        })
    }

    /// Take a page from the freelist, or extend the file by one page,
    /// skipping pointer-map pages and the pending-byte page.
    fn allocate_page(&mut self) -> Result<Pgno> {
        if let Some(pgno) = self.free_pages.pop() {
            if pgno < 2 || pgno == self.pending_page() {
                return Err(corrupt("freelist contains an unusable page"));
            }
            self.update_free_page_count(-1)?;
            return Ok(pgno);
        }
        let mut pgno = self.pager.page_count()? + 1;
        loop {
            let skip = pgno == self.pending_page()
                || (self.auto_vacuum != BTREE_AUTOVACUUM_NONE && self.is_ptrmap_page(pgno));
            if !skip {
                break;
            }
            pgno += 1;
        }
        let mut page = self.pager.acquire(pgno, PagerGetFlags::NOCONTENT)?;
        let rc = self.pager.write(&mut page);
        self.pager.release(pgno);
        rc?;
        Ok(pgno)
    }

    /// Return a page to the freelist.
    fn free_btree_page(&mut self, pgno: Pgno) -> Result<()> {
        if pgno < 2 {
            return Err(corrupt("attempt to free page 1"));
        }
        self.free_pages.push(pgno);
        self.update_free_page_count(1)?;
        if self.auto_vacuum != BTREE_AUTOVACUUM_NONE {
            self.ptrmap_put(pgno, PTRMAP_FREEPAGE, 0)?;
        }
        Ok(())
    }

    /// Free every page in an overflow chain.
    fn free_overflow_chain(&mut self, first: Pgno) -> Result<()> {
        let mut pgno = first;
        let mut remaining = self.pager.page_count()? as i64 + 1;
        while pgno != 0 {
            if remaining <= 0 {
                return Err(corrupt("overflow chain does not terminate"));
            }
            if pgno < 2 || pgno > self.pager.page_count()? {
                return Err(corrupt("overflow chain runs off the file"));
            }
            let data = self.page_data(pgno)?;
            let next = get4(&data, 0)?;
            self.free_btree_page(pgno)?;
            pgno = next;
            remaining -= 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pointer map
    // ------------------------------------------------------------------

    fn ptrmap_entries_per_page(&self) -> u32 {
        self.usable_size / 5
    }

    /// The pointer-map page carrying the entry for `pgno`, or 0 when the
    /// page has no entry (page 1 and the map pages themselves).
    fn ptrmap_pageno(&self, pgno: Pgno) -> Pgno {
        if pgno < 2 {
            return 0;
        }
        let group = self.ptrmap_entries_per_page() + 1;
        let map_page = 2 + ((pgno - 2) / group) * group;
        if map_page == pgno {
            0
        } else {
            map_page
        }
    }

    fn is_ptrmap_page(&self, pgno: Pgno) -> bool {
        if self.auto_vacuum == BTREE_AUTOVACUUM_NONE {
            return false;
        }
        pgno >= 2 && (pgno - 2) % (self.ptrmap_entries_per_page() + 1) == 0
    }

    fn ptrmap_offset(&self, pgno: Pgno) -> usize {
        let group = self.ptrmap_entries_per_page() + 1;
        (((pgno - 2) % group - 1) * 5) as usize
    }

    /// Record which page points at `pgno`. No-op without auto-vacuum.
    fn ptrmap_put(&mut self, pgno: Pgno, ptype: u8, parent: Pgno) -> Result<()> {
        if self.auto_vacuum == BTREE_AUTOVACUUM_NONE {
            return Ok(());
        }
        let map_page = self.ptrmap_pageno(pgno);
        if map_page == 0 {
            return Err(corrupt("page has no pointer-map entry"));
        }
        let offset = self.ptrmap_offset(pgno);
        self.write_page_data(map_page, |data| {
            if offset + 5 > data.len() {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            data[offset] = ptype;
            write_u32(data, offset + 1, parent)
        })
    }

    /// Look up the pointer-map entry for `pgno`.
    fn ptrmap_get(&mut self, pgno: Pgno) -> Result<(u8, Pgno)> {
        let map_page = self.ptrmap_pageno(pgno);
        if map_page == 0 {
            return Err(corrupt("page has no pointer-map entry"));
        }
        let offset = self.ptrmap_offset(pgno);
        let data = self.page_data(map_page)?;
        if offset + 5 > data.len() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let ptype = data[offset];
        if ptype == 0 || ptype > PTRMAP_BTREE {
            return Err(corrupt("invalid pointer-map entry"));
        }
        let parent = get4(&data, offset + 1)?;
        Ok((ptype, parent))
    }

    /// Refresh the pointer-map entries for everything a page points at:
    /// child pages, the right pointer, and first overflow pages.
    fn ptrmap_fix_page(&mut self, page: &MemPage) -> Result<()> {
        if self.auto_vacuum == BTREE_AUTOVACUUM_NONE {
            return Ok(());
        }
        for i in 0..page.n_cell {
            let off = page.find_cell(i)?;
            let info = page.parse_cell_at(off)?;
            if info.overflow_offset != 0 {
                let first = get4(&page.data, off + info.overflow_offset as usize)?;
                self.ptrmap_put(first, PTRMAP_OVERFLOW1, page.pgno)?;
            }
            if !page.is_leaf {
                let child = get4(&page.data, off)?;
                self.ptrmap_put(child, PTRMAP_BTREE, page.pgno)?;
            }
        }
        if !page.is_leaf {
            if let Some(rm) = page.rightmost {
                self.ptrmap_put(rm, PTRMAP_BTREE, page.pgno)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page relocation and vacuum
    // ------------------------------------------------------------------

    /// Move the content of page `from` to page `to`, repointing whatever
    /// referenced `from`. The caller decides what happens to `from`.
    fn relocate_page(&mut self, from: Pgno, ptype: u8, parent: Pgno, to: Pgno) -> Result<()> {
        let content = self.page_data(from)?;
        self.write_page_data(to, |data| {
            if data.len() != content.len() {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            data.copy_from_slice(&content);
            Ok(())
        })?;

        match ptype {
            PTRMAP_BTREE => {
                // Fix the child pointer in the parent page.
                let mut parent_page = self.read_page(parent)?;
                let mut found = false;
                for i in 0..parent_page.n_cell {
                    let off = parent_page.find_cell(i)?;
                    if get4(&parent_page.data, off)? == from {
                        write_u32(&mut parent_page.data, off, to)?;
                        found = true;
                        break;
                    }
                }
                if !found && parent_page.rightmost == Some(from) {
                    parent_page.set_rightmost(to)?;
                    found = true;
                }
                if !found {
                    return Err(corrupt("relocated page missing from its parent"));
                }
                self.write_page(&parent_page)?;
            }
            PTRMAP_ROOTPAGE => {
                // Root pages have no parent pointer to fix.
            }
            PTRMAP_OVERFLOW1 => {
                // Fix the overflow pointer inside the owning cell.
                let parent_page = self.read_page(parent)?;
                let mut patched = parent_page.clone();
                let mut found = false;
                for i in 0..parent_page.n_cell {
                    let off = parent_page.find_cell(i)?;
                    let info = parent_page.parse_cell_at(off)?;
                    if info.overflow_offset != 0 {
                        let at = off + info.overflow_offset as usize;
                        if get4(&parent_page.data, at)? == from {
                            write_u32(&mut patched.data, at, to)?;
                            found = true;
                            break;
                        }
                    }
                }
                if !found {
                    return Err(corrupt("overflow page missing from its owning cell"));
                }
                self.write_page(&patched)?;
            }
            PTRMAP_OVERFLOW2 => {
                // Fix the next pointer of the preceding overflow page.
                self.write_page_data(parent, |data| write_u32(data, 0, to))?;
            }
            _ => return Err(corrupt("cannot relocate a free page")),
        }

        // Re-parent everything the moved page points at.
        if ptype == PTRMAP_BTREE || ptype == PTRMAP_ROOTPAGE {
            let moved = self.read_page(to)?;
            self.ptrmap_fix_page(&moved)?;
        } else {
            let next = get4(&content, 0)?;
            if next != 0 {
                self.ptrmap_put(next, PTRMAP_OVERFLOW2, to)?;
            }
        }
        self.ptrmap_put(to, ptype, parent)?;
        Ok(())
    }

    /// Move one page off the end of the file into a free slot lower down.
    /// Returns true when nothing movable remains.
    fn incr_vacuum_step(&mut self, i_last: Pgno) -> Result<bool> {
        if i_last <= 1 {
            return Ok(true);
        }
        if self.is_ptrmap_page(i_last) || i_last == self.pending_page() {
            self.do_truncate = Some(i_last - 1);
            return Ok(false);
        }
        if let Some(pos) = self.free_pages.iter().position(|&p| p == i_last) {
            self.free_pages.remove(pos);
            self.update_free_page_count(-1)?;
            self.do_truncate = Some(i_last - 1);
            return Ok(false);
        }
        let (ptype, parent) = self.ptrmap_get(i_last)?;
        if ptype == PTRMAP_ROOTPAGE {
            return Err(corrupt("cannot relocate a root page during vacuum"));
        }
        if ptype == PTRMAP_FREEPAGE {
            return Err(corrupt("free page missing from the freelist"));
        }
        let pending = self.pending_page();
        let target = self
            .free_pages
            .iter()
            .copied()
            .filter(|&p| p >= 2 && p < i_last && p != pending && !self.is_ptrmap_page(p))
            .min();
        let target = match target {
            Some(t) => t,
            None => return Ok(true),
        };
        self.free_pages.retain(|&p| p != target);
        self.update_free_page_count(-1)?;
        self.relocate_page(i_last, ptype, parent, target)?;
        self.do_truncate = Some(i_last - 1);
        Ok(false)
    }

    /// Full auto-vacuum: drain the freelist into the file tail at commit.
    fn auto_vacuum_commit(&mut self) -> Result<()> {
        if self.auto_vacuum != BTREE_AUTOVACUUM_FULL {
            return Ok(());
        }
        loop {
            if self.free_pages.is_empty() {
                break;
            }
            let n_page = self.pager.page_count()?;
            let mut i_last = n_page;
            while i_last > 1 && (self.is_ptrmap_page(i_last) || i_last == self.pending_page()) {
                i_last -= 1;
            }
            let done = self.incr_vacuum_step(i_last)?;
            if let Some(n) = self.do_truncate.take() {
                self.pager.truncate_image(n);
            }
            if done {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursor bookkeeping
    // ------------------------------------------------------------------

    /// Save the key under every valid cursor so a rebuild of the tree
    /// cannot strand them. `root` limits the sweep to one tree; `except`
    /// skips the cursor doing the modifying.
    fn save_all_cursors(&mut self, root: Option<Pgno>, except: Option<u64>) -> Result<()> {
        for i in 0..self.cursors.len() {
            let (id, slot_root, state, pgno, ix) = {
                let slot = &self.cursors[i];
                (slot.id, slot.root, slot.state, slot.pgno, slot.ix)
            };
            if Some(id) == except {
                continue;
            }
            if let Some(r) = root {
                if slot_root != r {
                    continue;
                }
            }
            if state != CursorState::Valid && state != CursorState::SkipNext {
                continue;
            }
            let page = self.read_page(pgno)?;
            let off = page.find_cell(ix)?;
            let info = page.parse_cell_at(off)?;
            let key = if page.is_intkey {
                SavedKey::Rowid(info.n_key)
            } else {
                let mut buf = vec![0u8; info.n_payload as usize];
                self.read_payload_at(&page, off, &info, 0, info.n_payload, &mut buf)?;
                SavedKey::Record(buf)
            };
            let slot = &mut self.cursors[i];
            if state == CursorState::Valid {
                slot.skip = 0;
            }
            slot.saved_key = Some(key);
            slot.state = CursorState::RequireSeek;
        }
        Ok(())
    }

    /// Invalidate every cursor on the file. Used when a rollback discards
    /// pages out from under them.
    fn trip_all_cursors(&mut self) {
        for slot in &mut self.cursors {
            slot.state = CursorState::Fault;
            slot.skip = 0;
            slot.saved_key = None;
        }
    }

    // ------------------------------------------------------------------
    // Table locks
    // ------------------------------------------------------------------

    fn query_table_lock(&self, owner: u64, table: Pgno, lock: BtLock) -> Result<()> {
        for entry in &self.table_locks {
            if entry.table == table
                && entry.owner != owner
                && (entry.lock == BtLock::Write || lock == BtLock::Write)
            {
                return Err(Error::with_message(
                    ErrorCode::Locked,
                    format!("table rooted at page {} is locked", table),
                ));
            }
        }
        Ok(())
    }

    fn set_table_lock(&mut self, owner: u64, table: Pgno, lock: BtLock) {
        for entry in &mut self.table_locks {
            if entry.table == table && entry.owner == owner {
                if lock == BtLock::Write {
                    entry.lock = BtLock::Write;
                }
                return;
            }
        }
        self.table_locks.push(TableLockEntry { table, owner, lock });
    }

    fn clear_table_locks(&mut self, owner: u64) {
        self.table_locks.retain(|e| e.owner != owner);
    }

    // ------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------

    /// Copy `amt` bytes of a cell's payload starting at `offset` into
    /// `out`, following the overflow chain as needed.
    fn read_payload_at(
        &mut self,
        page: &MemPage,
        cell_off: usize,
        info: &CellInfo,
        offset: u32,
        amt: u32,
        out: &mut [u8],
    ) -> Result<()> {
        if amt as usize != out.len() {
            return Err(Error::new(ErrorCode::Internal));
        }
        if offset.checked_add(amt).map_or(true, |end| end > info.n_payload) {
            return Err(Error::with_message(
                ErrorCode::Error,
                "payload read past the end of the entry",
            ));
        }
        let mut offset = offset as usize;
        let mut amt = amt as usize;
        let mut out_pos = 0usize;
        let n_local = info.n_local as usize;
        if offset < n_local {
            let n = (n_local - offset).min(amt);
            let src = cell_off + info.n_header as usize + offset;
            if src + n > page.data.len() {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            out[..n].copy_from_slice(&page.data[src..src + n]);
            out_pos = n;
            amt -= n;
            offset = 0;
        } else {
            offset -= n_local;
        }
        if amt == 0 {
            return Ok(());
        }
        let chunk = self.usable_size as usize - 4;
        let mut ovfl = if info.overflow_offset == 0 {
            0
        } else {
            get4(&page.data, cell_off + info.overflow_offset as usize)?
        };
        while offset >= chunk {
            if ovfl == 0 {
                return Err(corrupt("overflow chain ends before the read offset"));
            }
            let data = self.page_data(ovfl)?;
            ovfl = get4(&data, 0)?;
            offset -= chunk;
        }
        while amt > 0 {
            if ovfl == 0 {
                return Err(corrupt("overflow chain shorter than the payload"));
            }
            let data = self.page_data(ovfl)?;
            let next = get4(&data, 0)?;
            let n = (chunk - offset).min(amt);
            out[out_pos..out_pos + n].copy_from_slice(&data[4 + offset..4 + offset + n]);
            out_pos += n;
            amt -= n;
            offset = 0;
            ovfl = next;
        }
        Ok(())
    }

    /// Free the overflow chain attached to the cell at `off`, if any.
    fn clear_cell_overflow(&mut self, page: &MemPage, off: usize) -> Result<()> {
        let info = page.parse_cell_at(off)?;
        if info.overflow_offset == 0 {
            return Ok(());
        }
        let first = get4(&page.data, off + info.overflow_offset as usize)?;
        self.free_overflow_chain(first)
    }

    /// Build a cell image for the given payload, spilling what does not
    /// fit locally onto freshly allocated overflow pages.
    fn fill_in_cell(&mut self, page: &MemPage, payload: &BtreePayload) -> Result<Vec<u8>> {
        let mut cell = vec![0u8; page.child_ptr_size];
        let (src, n_payload): (&[u8], u32) = if page.is_intkey {
            let data: &[u8] = payload.data.as_deref().unwrap_or(&[]);
            let n = data.len() as u32 + payload.n_zero;
            if page.has_data {
                write_varint(n as u64, &mut cell);
            }
            write_varint(payload.n_key as u64, &mut cell);
            (data, n)
        } else {
            let key: &[u8] = payload
                .key
                .as_deref()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let n = key.len() as u32;
            write_varint(n as u64, &mut cell);
            (key, n)
        };

        let n_local = page.payload_to_local(n_payload) as usize;
        let mut remaining_data = src;
        let mut remaining_zero = if page.is_intkey {
            payload.n_zero as usize
        } else {
            0
        };

        if n_local as u32 >= n_payload {
            cell.extend_from_slice(remaining_data);
            cell.resize(cell.len() + remaining_zero, 0);
            // A cell always occupies at least four bytes on the page.
            if cell.len() < 4 {
                cell.resize(4, 0);
            }
            return Ok(cell);
        }

        // Local prefix, then the overflow chain.
        let take = n_local.min(remaining_data.len());
        cell.extend_from_slice(&remaining_data[..take]);
        remaining_data = &remaining_data[take..];
        let pad = n_local - take;
        if pad > remaining_zero {
            return Err(Error::new(ErrorCode::Internal));
        }
        cell.resize(cell.len() + pad, 0);
        remaining_zero -= pad;

        let chunk = self.usable_size as usize - 4;
        let mut left = n_payload as usize - n_local;
        let ovfl_ptr_at = cell.len();
        cell.extend_from_slice(&[0u8; 4]);
        let mut prev: Option<Pgno> = None;
        while left > 0 {
            let pgno = self.allocate_page()?;
            let n = left.min(chunk);
            let take = n.min(remaining_data.len());
            let head = remaining_data[..take].to_vec();
            remaining_data = &remaining_data[take..];
            let pad = n - take;
            if pad > remaining_zero {
                return Err(Error::new(ErrorCode::Internal));
            }
            remaining_zero -= pad;
            self.fill_new_page(pgno, |data| {
                data[4..4 + head.len()].copy_from_slice(&head);
                Ok(())
            })?;
            match prev {
                None => {
                    cell[ovfl_ptr_at..ovfl_ptr_at + 4].copy_from_slice(&pgno.to_be_bytes());
                    self.ptrmap_put(pgno, PTRMAP_OVERFLOW1, page.pgno)?;
                }
                Some(prior) => {
                    self.write_page_data(prior, |data| write_u32(data, 0, pgno))?;
                    self.ptrmap_put(pgno, PTRMAP_OVERFLOW2, prior)?;
                }
            }
            prev = Some(pgno);
            left -= n;
        }
        Ok(cell)
    }

    // ------------------------------------------------------------------
    // Tree teardown
    // ------------------------------------------------------------------

    /// Delete everything under a page. Children and overflow chains are
    /// freed; the page itself is freed when `free_flag` is set, otherwise
    /// it is reset to an empty leaf of its own kind. Leaf entries removed
    /// are tallied into `count`.
    fn clear_database_page(
        &mut self,
        pgno: Pgno,
        free_flag: bool,
        count: &mut i64,
        depth: usize,
    ) -> Result<()> {
        if depth > CURSOR_MAX_DEPTH {
            return Err(corrupt("tree deeper than the traversal limit"));
        }
        let page = self.read_page(pgno)?;
        for i in 0..page.n_cell {
            let off = page.find_cell(i)?;
            if !page.is_leaf {
                let child = get4(&page.data, off)?;
                self.clear_database_page(child, true, count, depth + 1)?;
            }
            self.clear_cell_overflow(&page, off)?;
        }
        if page.is_leaf {
            *count += page.n_cell as i64;
        } else {
            let rm = page
                .rightmost
                .ok_or_else(|| corrupt("interior page missing its right pointer"))?;
            self.clear_database_page(rm, true, count, depth + 1)?;
        }
        if free_flag {
            self.free_btree_page(pgno)?;
        } else {
            let flags = page.data[page.hdr_offset] | PTF_LEAF;
            let mut reset = page;
            reset.zero(flags, self)?;
            self.write_page(&reset)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integrity check
    // ------------------------------------------------------------------

    fn integrity_check(
        &mut self,
        roots: &[Pgno],
        max_errors: usize,
    ) -> Result<IntegrityCheckResult> {
        // During a write transaction the freelist lives in memory and
        // the on-disk trunk chain lags behind; materialize it so the
        // audit sees a single truth.
        if self.freelist_loaded {
            self.save_freelist()?;
        }
        let n_page = self.pager.page_count()?;
        let mut st = IntegrityState {
            page_refs: vec![0u8; n_page as usize + 1],
            errors: Vec::new(),
            max_errors: max_errors.max(1),
            pages_checked: 0,
        };
        if n_page == 0 {
            return Ok(IntegrityCheckResult {
                errors: st.errors,
                pages_checked: 0,
            });
        }
        let pending = self.pending_page();
        if (pending as usize) < st.page_refs.len() {
            st.page_refs[pending as usize] = 1;
        }
        if self.auto_vacuum != BTREE_AUTOVACUUM_NONE {
            for p in 2..=n_page {
                if self.is_ptrmap_page(p) {
                    st.page_refs[p as usize] = 1;
                }
            }
        }
        self.check_freelist(&mut st)?;
        for &root in roots {
            if st.full() {
                break;
            }
            let context = format!("tree {}", root);
            self.check_tree_page(&mut st, root, &context, 0)?;
        }
        for p in 1..=n_page {
            if st.page_refs[p as usize] == 0 {
                st.error(format!("page {} is never used", p));
            }
        }
        Ok(IntegrityCheckResult {
            errors: st.errors,
            pages_checked: st.pages_checked,
        })
    }

    fn check_freelist(&mut self, st: &mut IntegrityState) -> Result<()> {
        let header = self.page_data(1)?;
        let mut trunk = get4(&header, 32)?;
        let declared = get4(&header, 36)?;
        let max_leaves = (self.usable_size as usize - 8) / 4;
        let mut seen: u32 = 0;
        let mut hops: u32 = 0;
        while trunk != 0 && !st.full() {
            if !st.reference(trunk, "freelist") {
                break;
            }
            hops += 1;
            if hops > declared.saturating_add(1) {
                st.error("freelist chain longer than its declared size".to_string());
                break;
            }
            let data = match self.page_data(trunk) {
                Ok(d) => d,
                Err(_) => {
                    st.error(format!("freelist: trunk page {} is unreadable", trunk));
                    break;
                }
            };
            seen += 1;
            let next = get4(&data, 0)?;
            let count = get4(&data, 4)? as usize;
            if count > max_leaves {
                st.error(format!(
                    "freelist trunk page {} holds {} leaves, limit is {}",
                    trunk, count, max_leaves
                ));
            } else {
                for i in 0..count {
                    let leaf = get4(&data, 8 + 4 * i)?;
                    st.reference(leaf, "freelist");
                    seen += 1;
                }
            }
            trunk = next;
        }
        if seen != declared {
            st.error(format!(
                "freelist declares {} pages but {} were found",
                declared, seen
            ));
        }
        Ok(())
    }

    /// Walk one tree recursively, recording findings. Returns the leaf
    /// depth below this page so sibling depths can be compared.
    fn check_tree_page(
        &mut self,
        st: &mut IntegrityState,
        pgno: Pgno,
        context: &str,
        depth: usize,
    ) -> Result<i32> {
        if st.full() {
            return Ok(0);
        }
        if depth > CURSOR_MAX_DEPTH {
            st.error(format!("{}: tree deeper than the traversal limit", context));
            return Ok(0);
        }
        if !st.reference(pgno, context) {
            return Ok(0);
        }
        st.pages_checked += 1;
        let page = match self.read_page(pgno) {
            Ok(p) => p,
            Err(e) => {
                st.error(format!("{}: page {} is unreadable ({})", context, pgno, e));
                return Ok(0);
            }
        };
        let usable = self.usable_size as usize;
        let mut child_depth: Option<i32> = None;
        let mut last_key: Option<i64> = None;
        for i in 0..page.n_cell {
            if st.full() {
                break;
            }
            let off = match page.find_cell(i) {
                Ok(o) => o,
                Err(_) => {
                    st.error(format!(
                        "{}: page {} cell {} pointer out of range",
                        context, pgno, i
                    ));
                    continue;
                }
            };
            let info = match page.parse_cell_at(off) {
                Ok(info) => info,
                Err(_) => {
                    let end = (off + 9).min(page.data.len());
                    st.error(format!(
                        "{}: page {} cell {} is malformed (head {})",
                        context,
                        pgno,
                        i,
                        hex::encode(&page.data[off..end])
                    ));
                    continue;
                }
            };
            if off + info.n_size as usize > usable {
                st.error(format!(
                    "{}: page {} cell {} extends past the usable area",
                    context, pgno, i
                ));
                continue;
            }
            if page.is_intkey {
                if let Some(prev) = last_key {
                    if info.n_key <= prev {
                        st.error(format!(
                            "{}: page {} cell {}: rowid {} out of order after {}",
                            context, pgno, i, info.n_key, prev
                        ));
                    }
                }
                last_key = Some(info.n_key);
            }
            if info.overflow_offset != 0 {
                let first = get4(&page.data, off + info.overflow_offset as usize)?;
                let chunk = usable - 4;
                let spilled = (info.n_payload - info.n_local as u32) as usize;
                let expected = (spilled + chunk - 1) / chunk;
                let cell_context = format!("{}: page {} cell {}", context, pgno, i);
                self.check_overflow_chain(st, first, expected, &cell_context);
            }
            if !page.is_leaf {
                let child = get4(&page.data, off)?;
                let d = self.check_tree_page(st, child, context, depth + 1)?;
                match child_depth {
                    Some(cd) if cd != d => {
                        st.error(format!("{}: page {} child depths differ", context, pgno));
                    }
                    Some(_) => {}
                    None => child_depth = Some(d),
                }
            }
        }
        if !page.is_leaf && !st.full() {
            match page.rightmost {
                Some(rm) => {
                    let d = self.check_tree_page(st, rm, context, depth + 1)?;
                    if let Some(cd) = child_depth {
                        if cd != d {
                            st.error(format!("{}: page {} child depths differ", context, pgno));
                        }
                    }
                }
                None => st.error(format!("{}: page {} missing right pointer", context, pgno)),
            }
        }
        Ok(child_depth.unwrap_or(0) + if page.is_leaf { 0 } else { 1 })
    }

    fn check_overflow_chain(
        &mut self,
        st: &mut IntegrityState,
        first: Pgno,
        expected: usize,
        context: &str,
    ) {
        let mut pgno = first;
        let mut remaining = expected;
        while remaining > 0 {
            if st.full() {
                return;
            }
            if pgno == 0 {
                st.error(format!(
                    "{}: overflow chain ends {} pages early",
                    context, remaining
                ));
                return;
            }
            if !st.reference(pgno, context) {
                return;
            }
            let data = match self.page_data(pgno) {
                Ok(d) => d,
                Err(_) => {
                    st.error(format!("{}: overflow page {} is unreadable", context, pgno));
                    return;
                }
            };
            pgno = read_u32(&data, 0).unwrap_or(0);
            remaining -= 1;
        }
        if pgno != 0 {
            st.error(format!(
                "{}: overflow chain continues past its payload",
                context
            ));
        }
    }
}

/// Outcome of a structural scan of the file.
#[derive(Debug)]
pub struct IntegrityCheckResult {
    /// Human-readable findings, capped at the caller's error budget.
    pub errors: Vec<String>,
    /// Number of b-tree pages visited.
    pub pages_checked: u32,
}

impl IntegrityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct IntegrityState {
    page_refs: Vec<u8>,
    errors: Vec<String>,
    max_errors: usize,
    pages_checked: u32,
}

impl IntegrityState {
    fn error(&mut self, msg: String) {
        if self.errors.len() < self.max_errors {
            self.errors.push(msg);
        }
    }

    fn full(&self) -> bool {
        self.errors.len() >= self.max_errors
    }

    /// Mark a page as referenced. Reports out-of-range and duplicate
    /// references; returns true only on the first valid reference.
    fn reference(&mut self, pgno: Pgno, context: &str) -> bool {
        if pgno == 0 || pgno as usize >= self.page_refs.len() {
            self.error(format!("{}: page {} out of range", context, pgno));
            return false;
        }
        if self.page_refs[pgno as usize] > 0 {
            self.error(format!(
                "{}: page {} referenced more than once",
                context, pgno
            ));
            return false;
        }
        self.page_refs[pgno as usize] = 1;
        true
    }
}

// ============================================================================
// Page images
// ============================================================================

/// A cell that did not fit on its page. It rides along in memory until the
/// balancer redistributes the page; a page carrying one cannot be written.
#[derive(Debug, Clone)]
struct OverflowCell {
    idx: u16,
    cell: Vec<u8>,
}

/// A fully materialized cell used while redistributing pages.
struct FlatCell {
    data: Vec<u8>,
}

/// Decoded header of one cell.
#[derive(Debug, Clone)]
pub struct CellInfo {
    /// Rowid for table trees; key length for index trees.
    pub n_key: i64,
    /// Bytes of data (tables only).
    pub n_data: u32,
    /// Total payload bytes, local and spilled together.
    pub n_payload: u32,
    /// Bytes before the payload: child pointer plus varints.
    pub n_header: u16,
    /// Payload bytes stored on the page itself.
    pub n_local: u16,
    /// Bytes the cell occupies on its page.
    pub n_size: u16,
    /// Offset from the cell start to the first-overflow-page number,
    /// or 0 when the payload is entirely local.
    pub overflow_offset: u16,
}

/// In-memory image of one b-tree page.
#[derive(Clone)]
struct MemPage {
    pgno: Pgno,
    data: Vec<u8>,
    hdr_offset: usize,
    is_leaf: bool,
    is_intkey: bool,
    has_data: bool,
    child_ptr_size: usize,
    max_local: u16,
    min_local: u16,
    usable_size: u32,
    n_cell: u16,
    cell_offset: usize,
    n_free: i32,
    rightmost: Option<Pgno>,
    overflow: Vec<OverflowCell>,
}

impl MemPage {
    /// Decode a page image. The header is validated and the freeblock
    /// list audited so later space arithmetic can trust the page.
    fn from_data(pgno: Pgno, data: Vec<u8>, bt: &BtShared) -> Result<MemPage> {
        let hdr = if pgno == 1 { FILE_HEADER_SIZE } else { 0 };
        let usable = bt.usable_size as usize;
        if data.len() < usable {
            return Err(corrupt("page image smaller than the usable size"));
        }
        let flag = data[hdr];
        let mut page = MemPage {
            pgno,
            data,
            hdr_offset: hdr,
            is_leaf: false,
            is_intkey: false,
            has_data: false,
            child_ptr_size: 0,
            max_local: 0,
            min_local: 0,
            usable_size: bt.usable_size,
            n_cell: 0,
            cell_offset: 0,
            n_free: 0,
            rightmost: None,
            overflow: Vec::new(),
        };
        page.decode_flags(flag, bt)?;
        page.cell_offset = hdr
            + if page.is_leaf {
                PAGE_HEADER_SIZE_LEAF
            } else {
                PAGE_HEADER_SIZE_INTERIOR
            };
        page.n_cell = get2(&page.data, hdr + 3)?;
        if page.n_cell as usize > (page.data.len() - 8) / 6 {
            return Err(corrupt("cell count exceeds what fits on a page"));
        }
        let top = get2nz(&page.data, hdr + 5)?;
        if top > usable {
            return Err(corrupt("content area starts past the usable size"));
        }
        if !page.is_leaf {
            page.rightmost = Some(get4(&page.data, hdr + 8)?);
        }

        // Free space is the gap, the fragment count, and the freeblocks.
        let first_cell = page.cell_offset + 2 * page.n_cell as usize;
        if first_cell > top {
            return Err(corrupt("cell pointer array overlaps the content area"));
        }
        let mut free = page.data[hdr + 7] as i32 + (top - first_cell) as i32;
        let mut pc = get2(&page.data, hdr + 1)? as usize;
        let mut visits = 0usize;
        while pc > 0 {
            if pc > usable - 4 {
                return Err(corrupt("freeblock outside the usable area"));
            }
            let next = get2(&page.data, pc)? as usize;
            let size = get2(&page.data, pc + 2)? as usize;
            free += size as i32;
            if next > 0 && next <= pc + size + 3 {
                return Err(corrupt("freeblocks out of order"));
            }
            pc = next;
            visits += 1;
            if visits > usable / 4 {
                return Err(corrupt("freeblock list does not terminate"));
            }
        }
        if free > usable as i32 {
            return Err(corrupt("free space accounting exceeds the page"));
        }
        page.n_free = free;
        Ok(page)
    }

    /// Build an empty page of the given kind over a raw buffer.
    fn zeroed(pgno: Pgno, data: Vec<u8>, flags: u8, bt: &BtShared) -> Result<MemPage> {
        let mut page = MemPage {
            pgno,
            data,
            hdr_offset: if pgno == 1 { FILE_HEADER_SIZE } else { 0 },
            is_leaf: false,
            is_intkey: false,
            has_data: false,
            child_ptr_size: 0,
            max_local: 0,
            min_local: 0,
            usable_size: bt.usable_size,
            n_cell: 0,
            cell_offset: 0,
            n_free: 0,
            rightmost: None,
            overflow: Vec::new(),
        };
        page.zero(flags, bt)?;
        Ok(page)
    }

    /// Reset this page to an empty page of the given kind.
    fn zero(&mut self, flags: u8, bt: &BtShared) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = bt.usable_size as usize;
        for b in &mut self.data[hdr..usable] {
            *b = 0;
        }
        self.data[hdr] = flags;
        self.decode_flags(flags, bt)?;
        self.cell_offset = hdr
            + if self.is_leaf {
                PAGE_HEADER_SIZE_LEAF
            } else {
                PAGE_HEADER_SIZE_INTERIOR
            };
        write_u16(&mut self.data, hdr + 5, (usable & 0xffff) as u16)?;
        self.n_cell = 0;
        self.n_free = (usable - self.cell_offset) as i32;
        self.rightmost = None;
        self.overflow.clear();
        Ok(())
    }

    /// Interpret the page-type flag byte. Only the four b-tree page kinds
    /// are legal; anything else is corruption.
    fn decode_flags(&mut self, flag: u8, bt: &BtShared) -> Result<()> {
        self.is_leaf = flag & PTF_LEAF != 0;
        self.child_ptr_size = if self.is_leaf { 0 } else { 4 };
        let kind = flag & !PTF_LEAF;
        if kind == PTF_INTKEY | PTF_LEAFDATA {
            self.is_intkey = true;
            self.has_data = self.is_leaf;
            self.max_local = bt.max_leaf;
            self.min_local = bt.min_leaf;
        } else if kind == PTF_ZERODATA {
            self.is_intkey = false;
            self.has_data = false;
            self.max_local = bt.max_local;
            self.min_local = bt.min_local;
        } else {
            return Err(corrupt("unrecognized page type"));
        }
        Ok(())
    }

    fn total_cells(&self) -> u16 {
        self.n_cell + self.overflow.len() as u16
    }

    /// Byte offset of the cell at `idx` within the page.
    fn find_cell(&self, idx: u16) -> Result<usize> {
        if idx >= self.n_cell {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let ptr = get2(&self.data, self.cell_offset + 2 * idx as usize)? as usize;
        let usable = self.usable_size as usize;
        if ptr < self.cell_offset || ptr > usable - 4 {
            return Err(corrupt("cell pointer out of range"));
        }
        Ok(ptr)
    }

    fn parse_cell_at(&self, off: usize) -> Result<CellInfo> {
        self.parse_cell_slice(&self.data, off)
    }

    /// Decode the cell starting at `off` in `data`, using this page's
    /// kind to pick the header layout and spill thresholds.
    fn parse_cell_slice(&self, data: &[u8], off: usize) -> Result<CellInfo> {
        let mut pos = off + self.child_ptr_size;
        let n_payload: u32;
        let n_key: i64;
        if self.is_intkey {
            if self.has_data {
                let (n, sz) = read_varint32(data, pos)?;
                n_payload = n;
                pos += sz;
            } else {
                n_payload = 0;
            }
            let (k, sz) = read_varint(data, pos)?;
            n_key = k as i64;
            pos += sz;
        } else {
            let (n, sz) = read_varint32(data, pos)?;
            n_payload = n;
            n_key = n as i64;
            pos += sz;
        }
        let n_header = (pos - off) as u16;
        let n_data = if self.has_data { n_payload } else { 0 };

        let max_local = self.max_local as u32;
        if n_payload <= max_local {
            let n_size = (n_header as u32 + n_payload).max(4) as u16;
            return Ok(CellInfo {
                n_key,
                n_data,
                n_payload,
                n_header,
                n_local: n_payload as u16,
                n_size,
                overflow_offset: 0,
            });
        }
        let min_local = self.min_local as u32;
        let surplus = min_local + (n_payload - min_local) % (self.usable_size - 4);
        let n_local = if surplus <= max_local {
            surplus
        } else {
            min_local
        };
        let overflow_offset = n_header + n_local as u16;
        Ok(CellInfo {
            n_key,
            n_data,
            n_payload,
            n_header,
            n_local: n_local as u16,
            n_size: overflow_offset + 4,
            overflow_offset,
        })
    }

    fn cell_size_at(&self, off: usize) -> Result<u16> {
        Ok(self.parse_cell_at(off)?.n_size)
    }

    /// How much of an `n_payload`-byte payload stays on this page.
    fn payload_to_local(&self, n_payload: u32) -> u16 {
        let max_local = self.max_local as u32;
        if n_payload <= max_local {
            return n_payload as u16;
        }
        let min_local = self.min_local as u32;
        let surplus = min_local + (n_payload - min_local) % (self.usable_size - 4);
        if surplus <= max_local {
            surplus as u16
        } else {
            min_local as u16
        }
    }

    /// Carve `n_byte` bytes out of the page's free space and return the
    /// offset. The caller still owes two bytes for the pointer slot.
    fn allocate_space(&mut self, n_byte: usize) -> Result<usize> {
        let hdr = self.hdr_offset;
        let usable = self.usable_size as usize;
        if (n_byte as i32) > self.n_free {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let area = self.cell_offset + 2 * self.n_cell as usize;
        let mut top = get2nz(&self.data, hdr + 5)?;
        if top > usable || area > top {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        if self.data[hdr + 7] < 60 {
            // First fit from the freeblock list.
            let mut addr = hdr + 1;
            let mut guard = 0usize;
            loop {
                let pc = get2(&self.data, addr)? as usize;
                if pc == 0 {
                    break;
                }
                if pc > usable - 4 {
                    return Err(Error::new(ErrorCode::Corrupt));
                }
                let size = get2(&self.data, pc + 2)? as usize;
                if size >= n_byte {
                    if size < n_byte + 4 {
                        // Too small to split; the leftover becomes fragments.
                        let next = get2(&self.data, pc)?;
                        write_u16(&mut self.data, addr, next)?;
                        self.data[hdr + 7] =
                            self.data[hdr + 7].wrapping_add((size - n_byte) as u8);
                        self.n_free -= n_byte as i32;
                        return Ok(pc);
                    }
                    write_u16(&mut self.data, pc + 2, (size - n_byte) as u16)?;
                    self.n_free -= n_byte as i32;
                    return Ok(pc + size - n_byte);
                }
                addr = pc;
                guard += 1;
                if guard > usable / 4 {
                    return Err(Error::new(ErrorCode::Corrupt));
                }
            }
        }
        if self.data[hdr + 7] >= 60 || top < area + n_byte + 2 {
            self.defragment()?;
            top = get2nz(&self.data, hdr + 5)?;
        }
        if top < area + n_byte + 2 {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let top = top - n_byte;
        write_u16(&mut self.data, hdr + 5, (top & 0xffff) as u16)?;
        self.n_free -= n_byte as i32;
        Ok(top)
    }

    /// Return `size` bytes at `start` to the page's free pool, keeping
    /// the freeblock list sorted and coalesced.
    fn free_space(&mut self, start: usize, size: usize) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = self.usable_size as usize;
        let size = size.max(4);
        if start + size > usable || start < hdr + 6 {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        // Find the insertion point, keeping the list sorted by address.
        let mut addr = hdr + 1;
        let mut pbegin = get2(&self.data, addr)? as usize;
        let mut guard = 0usize;
        while pbegin < start && pbegin > 0 {
            if pbegin < addr + 4 {
                return Err(corrupt("freeblock list out of order"));
            }
            addr = pbegin;
            pbegin = get2(&self.data, addr)? as usize;
            guard += 1;
            if guard > usable / 4 {
                return Err(corrupt("freeblock list does not terminate"));
            }
        }
        if pbegin > usable - 4 && pbegin != 0 {
            return Err(corrupt("freeblock outside the usable area"));
        }
        write_u16(&mut self.data, addr, start as u16)?;
        write_u16(&mut self.data, start, pbegin as u16)?;
        write_u16(&mut self.data, start + 2, size as u16)?;
        self.n_free += size as i32;

        // Coalesce adjacent blocks, reclaiming fragment bytes between them.
        let mut addr = hdr + 1;
        let mut guard = 0usize;
        loop {
            let pbegin = get2(&self.data, addr)? as usize;
            if pbegin == 0 {
                break;
            }
            if pbegin <= addr || pbegin > usable - 4 {
                return Err(corrupt("freeblock list out of order"));
            }
            let pnext = get2(&self.data, pbegin)? as usize;
            let psize = get2(&self.data, pbegin + 2)? as usize;
            if pnext > 0 && pbegin + psize + 3 >= pnext {
                let frag = pnext as i32 - (pbegin + psize) as i32;
                if frag < 0 || frag > self.data[hdr + 7] as i32 {
                    return Err(corrupt("fragment accounting out of balance"));
                }
                self.data[hdr + 7] -= frag as u8;
                let after = get2(&self.data, pnext)?;
                let merged = (pnext - pbegin) + get2(&self.data, pnext + 2)? as usize;
                write_u16(&mut self.data, pbegin, after)?;
                write_u16(&mut self.data, pbegin + 2, merged as u16)?;
            } else {
                addr = pbegin;
            }
            guard += 1;
            if guard > usable / 2 {
                return Err(corrupt("freeblock list does not terminate"));
            }
        }

        // A freeblock that touches the content-area top folds into the gap.
        let first = get2(&self.data, hdr + 1)?;
        let top_raw = get2(&self.data, hdr + 5)?;
        if first != 0 && first == top_raw {
            let pbegin = first as usize;
            let next = get2(&self.data, pbegin)?;
            let bsize = get2(&self.data, pbegin + 2)? as u32;
            write_u16(&mut self.data, hdr + 1, next)?;
            let new_top = top_raw as u32 + bsize;
            write_u16(&mut self.data, hdr + 5, (new_top & 0xffff) as u16)?;
        }
        Ok(())
    }

    /// Rebuild the page with every cell packed against the end of the
    /// usable area, discarding freeblocks and fragment bytes.
    fn defragment(&mut self) -> Result<()> {
        let usable = self.usable_size as usize;
        let hdr = self.hdr_offset;
        let temp = self.clone();
        let mut cbrk = usable;
        for i in 0..self.n_cell {
            let src = temp.find_cell(i)?;
            let size = temp.cell_size_at(src)? as usize;
            if size > cbrk || src + size > usable {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            cbrk -= size;
            if cbrk < self.cell_offset + 2 * self.n_cell as usize {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            self.data[cbrk..cbrk + size].copy_from_slice(&temp.data[src..src + size]);
            write_u16(&mut self.data, self.cell_offset + 2 * i as usize, cbrk as u16)?;
        }
        write_u16(&mut self.data, hdr + 5, (cbrk & 0xffff) as u16)?;
        write_u16(&mut self.data, hdr + 1, 0)?;
        self.data[hdr + 7] = 0;
        let first = self.cell_offset + 2 * self.n_cell as usize;
        for b in &mut self.data[first..cbrk] {
            *b = 0;
        }
        Ok(())
    }

    /// Insert a cell image at index `idx`. When the page is full the cell
    /// is parked in memory and `n_free` zeroed so the balancer runs.
    fn insert_cell(&mut self, idx: u16, cell: Vec<u8>) -> Result<()> {
        let sz = cell.len();
        if idx > self.total_cells() || sz > self.usable_size as usize {
            return Err(Error::new(ErrorCode::Internal));
        }
        if !self.overflow.is_empty() || sz as i32 + 2 > self.n_free {
            self.overflow.push(OverflowCell { idx, cell });
            self.n_free = 0;
            return Ok(());
        }
        let ptr = self.allocate_space(sz)?;
        self.data[ptr..ptr + sz].copy_from_slice(&cell);
        let co = self.cell_offset;
        let ins = co + 2 * idx as usize;
        let end = co + 2 * self.n_cell as usize;
        self.data.copy_within(ins..end, ins + 2);
        write_u16(&mut self.data, ins, ptr as u16)?;
        self.n_cell += 1;
        write_u16(&mut self.data, self.hdr_offset + 3, self.n_cell)?;
        self.n_free -= 2;
        Ok(())
    }

    /// Remove the cell at `idx`, returning its space to the free pool.
    fn drop_cell(&mut self, idx: u16) -> Result<()> {
        let ptr = self.find_cell(idx)?;
        let size = self.cell_size_at(ptr)? as usize;
        self.free_space(ptr, size)?;
        let co = self.cell_offset;
        let ins = co + 2 * idx as usize;
        let end = co + 2 * self.n_cell as usize;
        self.data.copy_within(ins + 2..end, ins);
        self.n_cell -= 1;
        write_u16(&mut self.data, self.hdr_offset + 3, self.n_cell)?;
        self.n_free += 2;
        Ok(())
    }

    /// Fill an empty page with the given cells in order.
    fn assemble(&mut self, cells: &[FlatCell]) -> Result<()> {
        if self.n_cell != 0 || !self.overflow.is_empty() {
            return Err(Error::new(ErrorCode::Internal));
        }
        if cells.is_empty() {
            return Ok(());
        }
        let total: usize = cells.iter().map(|c| c.data.len()).sum();
        if (total + 2 * cells.len()) as i32 > self.n_free {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let mut ptr = self.allocate_space(total)?;
        for (i, cell) in cells.iter().enumerate() {
            self.data[ptr..ptr + cell.data.len()].copy_from_slice(&cell.data);
            write_u16(&mut self.data, self.cell_offset + 2 * i, ptr as u16)?;
            ptr += cell.data.len();
        }
        self.n_cell = cells.len() as u16;
        write_u16(&mut self.data, self.hdr_offset + 3, self.n_cell)?;
        self.n_free -= 2 * cells.len() as i32;
        Ok(())
    }

    /// The cell at logical index `i`, reading through parked overflow
    /// cells, as an owned byte image.
    fn flat_cell(&self, i: u16) -> Result<Vec<u8>> {
        let mut i = i;
        for ovfl in self.overflow.iter().rev() {
            if ovfl.idx <= i {
                if ovfl.idx == i {
                    return Ok(ovfl.cell.clone());
                }
                i -= 1;
            }
        }
        let off = self.find_cell(i)?;
        let sz = self.cell_size_at(off)? as usize;
        if off + sz > self.data.len() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        Ok(self.data[off..off + sz].to_vec())
    }

    /// Overwrite the child pointer of the logical cell `i`, which may be
    /// a parked overflow cell.
    fn set_flat_child(&mut self, i: u16, pgno: Pgno) -> Result<()> {
        let mut i = i;
        for idx in (0..self.overflow.len()).rev() {
            let k = self.overflow[idx].idx;
            if k <= i {
                if k == i {
                    let cell = &mut self.overflow[idx].cell;
                    if cell.len() < 4 {
                        return Err(Error::new(ErrorCode::Corrupt));
                    }
                    cell[..4].copy_from_slice(&pgno.to_be_bytes());
                    return Ok(());
                }
                i -= 1;
            }
        }
        let off = self.find_cell(i)?;
        write_u32(&mut self.data, off, pgno)
    }

    /// Remove the logical cell `i`, whether it lives on the page or in
    /// the parked overflow list.
    fn drop_flat_cell(&mut self, i: u16) -> Result<()> {
        let mut i = i;
        for idx in (0..self.overflow.len()).rev() {
            let k = self.overflow[idx].idx;
            if k <= i {
                if k == i {
                    self.overflow.remove(idx);
                    return Ok(());
                }
                i -= 1;
            }
        }
        self.drop_cell(i)
    }

    fn set_rightmost(&mut self, pgno: Pgno) -> Result<()> {
        if self.is_leaf {
            return Err(Error::new(ErrorCode::Internal));
        }
        self.rightmost = Some(pgno);
        write_u32(&mut self.data, self.hdr_offset + 8, pgno)
    }
}

/// Payload handed to `BtCursor::insert`: a rowid plus data bytes for
/// table trees, or a byte-string key for index trees. `n_zero` appends a
/// run of zero bytes to a table payload.
#[derive(Debug, Default, Clone)]
pub struct BtreePayload {
    pub key: Option<Vec<u8>>,
    pub n_key: i64,
    pub data: Option<Vec<u8>>,
    pub n_zero: u32,
}

// ============================================================================
// Connection handles
// ============================================================================

/// One connection's handle on a b-tree file. Handles opened on the same
/// canonical path share a single `BtShared` when shared-cache mode is on.
pub struct Btree {
    shared: Arc<SharedState>,
    siblings: BtreeSiblings,
    handle_id: u64,
    sharable: bool,
    in_trans: TransState,
    closed: bool,
}

impl Btree {
    /// Open a database file, creating it lazily on the first write
    /// transaction. `siblings` is the connection's lock-ordering list;
    /// passing `None` gives the handle a private one.
    pub fn open(
        vfs_name: Option<&str>,
        path: Option<&str>,
        siblings: Option<&BtreeSiblings>,
        flags: BtreeOpenFlags,
        vfs_flags: OpenFlags,
    ) -> Result<Btree> {
        os_init();
        let is_mem = flags.contains(BtreeOpenFlags::MEMORY)
            || path.map_or(true, |p| p.is_empty() || p == ":memory:");
        let handle_id = NEXT_HANDLE_ID.fetch_add(1, AtomicOrdering::SeqCst);
        let sharable = !is_mem
            && !flags.contains(BtreeOpenFlags::UNSHARABLE)
            && !vfs_flags.contains(OpenFlags::PRIVATECACHE)
            && (vfs_flags.contains(OpenFlags::SHAREDCACHE) || shared_cache_enabled());
        let siblings = siblings.cloned().unwrap_or_default();

        let registry_key = if sharable {
            let vfs = vfs_find(vfs_name)
                .ok_or_else(|| Error::with_message(ErrorCode::Error, "no such vfs"))?;
            match path {
                Some(p) => Some(vfs.full_pathname(p)?),
                None => None,
            }
        } else {
            None
        };

        if let Some(key) = registry_key.as_deref() {
            if let Some(existing) = shared_tree_lookup(key) {
                {
                    let mut bt = existing
                        .state
                        .write()
                        .map_err(|_| Error::new(ErrorCode::Internal))?;
                    bt.n_ref += 1;
                }
                let handle = Btree {
                    shared: existing,
                    siblings,
                    handle_id,
                    sharable: true,
                    in_trans: TransState::None,
                    closed: false,
                };
                handle.siblings.register(handle_id, &handle.shared);
                return Ok(handle);
            }
        }

        let mut pager_flags = PagerOpenFlags::empty();
        if flags.contains(BtreeOpenFlags::OMIT_JOURNAL) {
            pager_flags |= PagerOpenFlags::OMIT_JOURNAL;
        }
        if flags.contains(BtreeOpenFlags::MEMORY) {
            pager_flags |= PagerOpenFlags::MEMORY;
        }
        let mut pager = Pager::open(vfs_name, path, pager_flags, vfs_flags)?;

        let mut header_buf = vec![0u8; FILE_HEADER_SIZE];
        pager.read_file_header(&mut header_buf)?;
        let mut bts_flags = BtsFlags::empty();
        let (requested_size, reserve, auto_vacuum, incr) = match DbHeader::parse(&header_buf) {
            Ok(h) => {
                let av = if h.largest_root != 0 {
                    if h.incr_vacuum {
                        BTREE_AUTOVACUUM_INCR
                    } else {
                        BTREE_AUTOVACUUM_FULL
                    }
                } else {
                    BTREE_AUTOVACUUM_NONE
                };
                (h.page_size, h.reserve, av, h.incr_vacuum)
            }
            Err(_) => {
                bts_flags.insert(BtsFlags::INITIALLY_EMPTY);
                (DEFAULT_PAGE_SIZE, 0u8, BTREE_AUTOVACUUM_NONE, false)
            }
        };
        let page_size = pager.set_page_size(requested_size)?;
        if pager.is_readonly() {
            bts_flags.insert(BtsFlags::READ_ONLY);
        }
        let usable_size = page_size - reserve as u32;
        if usable_size < MIN_USABLE_SIZE {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "reserved space leaves the page unusably small",
            ));
        }

        let mut bt = BtShared {
            pager,
            registry_key: registry_key.clone(),
            n_ref: 1,
            page_size,
            usable_size,
            reserve,
            max_local: 0,
            min_local: 0,
            max_leaf: 0,
            min_leaf: 0,
            bts_flags,
            auto_vacuum,
            incr_vacuum: incr,
            do_truncate: None,
            in_transaction: TransState::None,
            n_transaction: 0,
            page1_pinned: false,
            free_pages: Vec::new(),
            freelist_loaded: false,
            cursors: Vec::new(),
            next_cursor_id: 1,
            table_locks: Vec::new(),
        };
        bt.apply_page_layout();
        let shared = Arc::new(SharedState {
            mutex: RecursiveMutex::new(),
            state: RwLock::new(bt),
        });
        if let Some(key) = registry_key.as_deref() {
            shared_tree_insert(key, &shared);
        }
        let handle = Btree {
            shared,
            siblings,
            handle_id,
            sharable,
            in_trans: TransState::None,
            closed: false,
        };
        if handle.sharable {
            handle.siblings.register(handle_id, &handle.shared);
        }
        Ok(handle)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "btree handle is closed",
            ));
        }
        Ok(())
    }

    fn enter(&self) {
        if self.sharable {
            self.siblings.enter(self.handle_id);
        }
    }

    fn leave(&self) {
        if self.sharable {
            self.siblings.leave(self.handle_id);
        }
    }

    fn state_guard(
        shared: &Arc<SharedState>,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BtShared>> {
        shared
            .state
            .write()
            .map_err(|_| Error::new(ErrorCode::Internal))
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a transaction, upgrading an open read transaction when
    /// `write` is set. Write transactions are exclusive per shared tree;
    /// a second writer gets `Busy` so the caller can back off and retry.
    pub fn begin_trans(&mut self, write: bool) -> Result<()> {
        self.check_open()?;
        self.enter();
        let rc = self.begin_trans_locked(write);
        self.leave();
        rc
    }

    fn begin_trans_locked(&mut self, write: bool) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if self.in_trans == TransState::Write || (self.in_trans == TransState::Read && !write) {
            return Ok(());
        }
        if write && bt.bts_flags.contains(BtsFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if write && bt.in_transaction == TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Busy,
                "another handle holds the write transaction",
            ));
        }
        bt.lock_btree()?;
        if write {
            let rc = (|| -> Result<()> {
                bt.pager.begin(false)?;
                bt.new_db()?;
                if !bt.freelist_loaded {
                    bt.load_freelist()?;
                }
                Ok(())
            })();
            if let Err(e) = rc {
                bt.unlock_if_unused();
                return Err(e);
            }
        }
        if self.in_trans == TransState::None {
            bt.n_transaction += 1;
        }
        self.in_trans = if write {
            TransState::Write
        } else {
            TransState::Read
        };
        if self.in_trans > bt.in_transaction {
            bt.in_transaction = self.in_trans;
        }
        Ok(())
    }

    /// First half of a commit: flush the freelist and journal, leaving
    /// the door open for a multi-file atomic commit.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        self.check_open()?;
        if self.in_trans != TransState::Write {
            return Ok(());
        }
        self.enter();
        let rc = self.commit_phase_one_locked();
        self.leave();
        rc
    }

    fn commit_phase_one_locked(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        bt.auto_vacuum_commit()?;
        if let Some(n) = bt.do_truncate.take() {
            bt.pager.truncate_image(n);
        }
        bt.save_freelist()?;
        bt.pager.commit_phase_one()
    }

    /// Second half of a commit: make the change durable and release the
    /// transaction.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        self.check_open()?;
        self.enter();
        let rc = self.commit_phase_two_locked();
        self.leave();
        rc
    }

    fn commit_phase_two_locked(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if self.in_trans == TransState::None {
            return Ok(());
        }
        if self.in_trans == TransState::Write {
            bt.pager.commit_phase_two()?;
            bt.in_transaction = TransState::Read;
            bt.free_pages.clear();
            bt.freelist_loaded = false;
        }
        self.end_transaction(&mut bt);
        Ok(())
    }

    /// Commit the current transaction in one call.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_phase_one()?;
        self.commit_phase_two()
    }

    /// Abandon the current transaction. Rolling back a write transaction
    /// restores every page image and trips open cursors on the file.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.enter();
        let rc = self.rollback_locked();
        self.leave();
        rc
    }

    fn rollback_locked(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if self.in_trans == TransState::None {
            return Ok(());
        }
        let mut rc = Ok(());
        if self.in_trans == TransState::Write {
            bt.trip_all_cursors();
            rc = bt.pager.rollback();
            bt.free_pages.clear();
            bt.freelist_loaded = false;
            bt.do_truncate = None;
            bt.in_transaction = TransState::Read;
        }
        self.end_transaction(&mut bt);
        rc
    }

    fn end_transaction(&mut self, bt: &mut BtShared) {
        if self.in_trans == TransState::None {
            return;
        }
        bt.clear_table_locks(self.handle_id);
        bt.n_transaction = bt.n_transaction.saturating_sub(1);
        if bt.n_transaction == 0 {
            bt.in_transaction = TransState::None;
        }
        self.in_trans = TransState::None;
        bt.unlock_if_unused();
    }

    /// Open, release, or roll back a nested savepoint within the current
    /// write transaction. Rolling back restores the page images taken
    /// when the savepoint opened and trips open cursors.
    pub fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        self.check_open()?;
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "savepoints require a write transaction",
            ));
        }
        self.enter();
        let rc = self.savepoint_locked(op, index);
        self.leave();
        rc
    }

    fn savepoint_locked(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        bt.pager.savepoint(op, index)?;
        if op == SavepointOp::Rollback {
            bt.trip_all_cursors();
            bt.free_pages.clear();
            bt.load_freelist()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Table lifecycle
    // ------------------------------------------------------------------

    /// Create an empty tree of the given kind (`BTREE_INTKEY` or
    /// `BTREE_BLOBKEY`) and return its root page number.
    pub fn create_table(&mut self, kind: u8) -> Result<Pgno> {
        self.check_open()?;
        self.enter();
        let rc = self.create_table_locked(kind);
        self.leave();
        rc
    }

    fn create_table_locked(&mut self, kind: u8) -> Result<Pgno> {
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "creating a table requires a write transaction",
            ));
        }
        if kind != BTREE_INTKEY && kind != BTREE_BLOBKEY {
            return Err(Error::new(ErrorCode::Misuse));
        }
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;

        let root = if bt.auto_vacuum != BTREE_AUTOVACUUM_NONE {
            // Root pages stay contiguous at the front of the file so the
            // largest-root-page header slot remains meaningful.
            let mut candidate = bt.meta(BTREE_LARGEST_ROOT_PAGE)? + 1;
            while candidate == bt.pending_page() || bt.is_ptrmap_page(candidate) {
                candidate += 1;
            }
            let n_page = bt.pager.page_count()?;
            if candidate <= n_page {
                // The slot exists already; evict whatever occupies it.
                if let Some(pos) = bt.free_pages.iter().position(|&p| p == candidate) {
                    bt.free_pages.remove(pos);
                    bt.update_free_page_count(-1)?;
                } else {
                    let (ptype, parent) = bt.ptrmap_get(candidate)?;
                    let target = bt.allocate_page()?;
                    bt.relocate_page(candidate, ptype, parent, target)?;
                }
            } else {
                let mut page = bt.pager.acquire(candidate, PagerGetFlags::NOCONTENT)?;
                let rc = bt.pager.write(&mut page);
                bt.pager.release(candidate);
                rc?;
            }
            bt.ptrmap_put(candidate, PTRMAP_ROOTPAGE, 0)?;
            bt.put_meta(BTREE_LARGEST_ROOT_PAGE, candidate)?;
            candidate
        } else {
            bt.allocate_page()?
        };

        let flags = if kind == BTREE_INTKEY {
            PTF_TABLE_LEAF
        } else {
            PTF_INDEX_LEAF
        };
        let data = vec![0u8; bt.page_size as usize];
        let page = MemPage::zeroed(root, data, flags, &bt)?;
        bt.write_page(&page)?;
        Ok(root)
    }

    /// Delete every entry in the tree rooted at `root`, keeping the root
    /// itself. Returns how many entries were removed.
    pub fn clear_table(&mut self, root: Pgno) -> Result<i64> {
        self.check_open()?;
        self.enter();
        let rc = self.clear_table_locked(root);
        self.leave();
        rc
    }

    fn clear_table_locked(&mut self, root: Pgno) -> Result<i64> {
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "clearing a table requires a write transaction",
            ));
        }
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if self.sharable {
            bt.query_table_lock(self.handle_id, root, BtLock::Write)?;
            bt.set_table_lock(self.handle_id, root, BtLock::Write);
        }
        bt.save_all_cursors(Some(root), None)?;
        let mut count = 0i64;
        bt.clear_database_page(root, false, &mut count, 0)?;
        Ok(count)
    }

    /// Drop the tree rooted at `root`. In auto-vacuum files the tree with
    /// the largest root page is moved into the vacated slot to keep roots
    /// contiguous; the page number it moved from is returned so callers
    /// can fix their root catalog (0 when nothing moved).
    pub fn drop_table(&mut self, root: Pgno) -> Result<Pgno> {
        self.check_open()?;
        self.enter();
        let rc = self.drop_table_locked(root);
        self.leave();
        rc
    }

    fn drop_table_locked(&mut self, root: Pgno) -> Result<Pgno> {
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "dropping a table requires a write transaction",
            ));
        }
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if root < 1 {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        if bt.cursors.iter().any(|slot| slot.root == root) {
            return Err(Error::with_message(
                ErrorCode::Locked,
                "table is in use by an open cursor",
            ));
        }
        let mut count = 0i64;
        bt.clear_database_page(root, false, &mut count, 0)?;

        if root == 1 {
            // The schema tree cannot be deallocated, only emptied.
            let mut page = bt.read_page(1)?;
            page.zero(PTF_TABLE_LEAF, &bt)?;
            bt.write_page(&page)?;
            return Ok(0);
        }

        let mut moved: Pgno = 0;
        if bt.auto_vacuum != BTREE_AUTOVACUUM_NONE {
            let max_root = bt.meta(BTREE_LARGEST_ROOT_PAGE)?;
            if root == max_root {
                bt.free_btree_page(root)?;
            } else {
                bt.relocate_page(max_root, PTRMAP_ROOTPAGE, 0, root)?;
                bt.free_btree_page(max_root)?;
                moved = max_root;
            }
            let mut new_max = max_root - 1;
            if new_max == bt.pending_page() {
                new_max -= 1;
            }
            while new_max > 1 && bt.is_ptrmap_page(new_max) {
                new_max -= 1;
            }
            bt.put_meta(BTREE_LARGEST_ROOT_PAGE, new_max)?;
        } else {
            bt.free_btree_page(root)?;
        }
        Ok(moved)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Read one of the 32-bit header metadata slots. Slot 15 reads the
    /// change counter, which advances on every commit.
    pub fn get_meta(&mut self, idx: usize) -> Result<u32> {
        self.check_open()?;
        self.enter();
        let rc = self.get_meta_locked(idx);
        self.leave();
        rc
    }

    fn get_meta_locked(&mut self, idx: usize) -> Result<u32> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        bt.meta(idx)
    }

    /// Write a header metadata slot. Slot 0 (the free page count) and
    /// slot 15 are maintained internally and rejected here.
    pub fn update_meta(&mut self, idx: usize, value: u32) -> Result<()> {
        self.check_open()?;
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "metadata updates require a write transaction",
            ));
        }
        self.enter();
        let rc = self.update_meta_locked(idx, value);
        self.leave();
        rc
    }

    fn update_meta_locked(&mut self, idx: usize, value: u32) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        bt.put_meta(idx, value)
    }

    // ------------------------------------------------------------------
    // Vacuum control
    // ------------------------------------------------------------------

    /// Current auto-vacuum mode.
    pub fn auto_vacuum_mode(&self) -> u8 {
        self.shared
            .state
            .read()
            .map(|bt| bt.auto_vacuum)
            .unwrap_or(BTREE_AUTOVACUUM_NONE)
    }

    /// Change the auto-vacuum mode. Switching between none and full is
    /// only possible before the file layout is fixed by its first write.
    pub fn set_auto_vacuum(&mut self, mode: u8) -> Result<()> {
        self.check_open()?;
        if mode > BTREE_AUTOVACUUM_INCR {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.enter();
        let rc = self.set_auto_vacuum_locked(mode);
        self.leave();
        rc
    }

    fn set_auto_vacuum_locked(&mut self, mode: u8) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        let enabling = mode != BTREE_AUTOVACUUM_NONE;
        let enabled = bt.auto_vacuum != BTREE_AUTOVACUUM_NONE;
        if bt.bts_flags.contains(BtsFlags::PAGESIZE_FIXED) && enabling != enabled {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        bt.auto_vacuum = mode;
        bt.incr_vacuum = mode == BTREE_AUTOVACUUM_INCR;
        Ok(())
    }

    /// Run one step of incremental vacuum. Returns true once no further
    /// page can be moved down the file.
    pub fn incr_vacuum(&mut self) -> Result<bool> {
        self.check_open()?;
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "incremental vacuum requires a write transaction",
            ));
        }
        self.enter();
        let rc = self.incr_vacuum_locked();
        self.leave();
        rc
    }

    fn incr_vacuum_locked(&mut self) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if bt.auto_vacuum == BTREE_AUTOVACUUM_NONE {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "database is not using incremental vacuum",
            ));
        }
        let n_page = bt.pager.page_count()?;
        let done = bt.incr_vacuum_step(n_page)?;
        if let Some(n) = bt.do_truncate.take() {
            bt.pager.truncate_image(n);
        }
        Ok(done)
    }

    // ------------------------------------------------------------------
    // Table locks and integrity
    // ------------------------------------------------------------------

    /// Take (or verify) a shared-cache table lock for this handle. A
    /// no-op on unshared trees, where the file lock already protects us.
    pub fn lock_table(&mut self, table: Pgno, write: bool) -> Result<()> {
        self.check_open()?;
        if !self.sharable {
            return Ok(());
        }
        self.enter();
        let rc = self.lock_table_locked(table, write);
        self.leave();
        rc
    }

    fn lock_table_locked(&mut self, table: Pgno, write: bool) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        let lock = if write { BtLock::Write } else { BtLock::Read };
        bt.query_table_lock(self.handle_id, table, lock)?;
        bt.set_table_lock(self.handle_id, table, lock);
        Ok(())
    }

    /// Scan the freelist and the listed trees, verifying reachability,
    /// cell sanity, rowid order, overflow chain lengths, and that sibling
    /// subtrees sit at equal depth.
    pub fn integrity_check(
        &mut self,
        roots: &[Pgno],
        max_errors: usize,
    ) -> Result<IntegrityCheckResult> {
        self.check_open()?;
        if self.in_trans == TransState::None {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "integrity check requires an open transaction",
            ));
        }
        self.enter();
        let rc = self.integrity_check_locked(roots, max_errors);
        self.leave();
        rc
    }

    fn integrity_check_locked(
        &mut self,
        roots: &[Pgno],
        max_errors: usize,
    ) -> Result<IntegrityCheckResult> {
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        bt.integrity_check(roots, max_errors)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_in_trans(&self) -> bool {
        self.in_trans == TransState::Write
    }

    pub fn is_in_read_trans(&self) -> bool {
        self.in_trans != TransState::None
    }

    pub fn is_sharable(&self) -> bool {
        self.sharable
    }

    pub fn page_size(&self) -> u32 {
        self.shared
            .state
            .read()
            .map(|bt| bt.page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn is_readonly(&self) -> bool {
        self.shared
            .state
            .read()
            .map(|bt| bt.bts_flags.contains(BtsFlags::READ_ONLY))
            .unwrap_or(false)
    }

    pub fn filename(&self) -> String {
        self.shared
            .state
            .read()
            .map(|bt| bt.pager.filename().to_string())
            .unwrap_or_default()
    }

    /// Number of pages in the database image.
    pub fn page_count(&mut self) -> Result<Pgno> {
        self.check_open()?;
        self.enter();
        let shared = Arc::clone(&self.shared);
        let rc = match shared.state.write() {
            Ok(mut bt) => bt.pager.page_count(),
            Err(_) => Err(Error::new(ErrorCode::Internal)),
        };
        self.leave();
        rc
    }

    /// Suggest a cache size to the pager.
    pub fn set_cache_size(&mut self, n_page: usize) -> Result<()> {
        self.check_open()?;
        self.enter();
        let shared = Arc::clone(&self.shared);
        let rc = match shared.state.write() {
            Ok(mut bt) => {
                bt.pager.set_cache_size(n_page);
                Ok(())
            }
            Err(_) => Err(Error::new(ErrorCode::Internal)),
        };
        self.leave();
        rc
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Close this handle. Any open transaction rolls back; the shared
    /// tree shuts its pager down when the last handle closes. Safe to
    /// call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.enter();
        let shared = Arc::clone(&self.shared);
        let mut registry_cleanup: Option<String> = None;
        let rc = match shared.state.write() {
            Ok(mut bt) => {
                bt.cursors.retain(|slot| slot.owner != self.handle_id);
                if self.in_trans != TransState::None {
                    if self.in_trans == TransState::Write {
                        bt.trip_all_cursors();
                        let _ = bt.pager.rollback();
                        bt.free_pages.clear();
                        bt.freelist_loaded = false;
                        bt.do_truncate = None;
                        bt.in_transaction = TransState::Read;
                    }
                    bt.clear_table_locks(self.handle_id);
                    bt.n_transaction = bt.n_transaction.saturating_sub(1);
                    if bt.n_transaction == 0 {
                        bt.in_transaction = TransState::None;
                    }
                    self.in_trans = TransState::None;
                }
                bt.unlock_if_unused();
                bt.n_ref -= 1;
                if bt.n_ref == 0 {
                    registry_cleanup = bt.registry_key.clone();
                }
                Ok(())
            }
            Err(_) => Err(Error::new(ErrorCode::Internal)),
        };
        self.leave();
        if let Some(key) = registry_cleanup {
            shared_tree_remove(&key);
        }
        self.siblings.unregister(self.handle_id);
        rc
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

// ============================================================================
// Cursors
// ============================================================================

impl Btree {
    /// Open a cursor on the tree rooted at `root`. Every cursor needs an
    /// open transaction; a writable cursor needs the write transaction.
    /// Index trees order their keys through `comparator`; when `None`,
    /// keys compare as plain byte strings.
    pub fn cursor(
        &mut self,
        root: Pgno,
        flags: CursorOpenFlags,
        comparator: Option<Arc<dyn KeyComparator>>,
    ) -> Result<BtCursor> {
        self.check_open()?;
        self.enter();
        let rc = self.cursor_locked(root, flags, comparator);
        self.leave();
        rc
    }

    fn cursor_locked(
        &mut self,
        root: Pgno,
        flags: CursorOpenFlags,
        comparator: Option<Arc<dyn KeyComparator>>,
    ) -> Result<BtCursor> {
        let writable = flags.contains(CursorOpenFlags::WRITABLE);
        if self.in_trans == TransState::None {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "cursors require an open transaction",
            ));
        }
        if writable && self.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "a writable cursor requires a write transaction",
            ));
        }
        let shared = Arc::clone(&self.shared);
        let mut bt = Self::state_guard(&shared)?;
        if writable && bt.bts_flags.contains(BtsFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if root != 1 {
            let n_page = bt.pager.page_count()?;
            if root < 1 || root > n_page {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("cursor root page {} out of range", root),
                ));
            }
        }
        if self.sharable {
            let lock = if writable { BtLock::Write } else { BtLock::Read };
            bt.query_table_lock(self.handle_id, root, lock)?;
            bt.set_table_lock(self.handle_id, root, lock);
        }
        let slot_id = bt.next_cursor_id;
        bt.next_cursor_id += 1;
        bt.cursors.push(CursorSlot {
            id: slot_id,
            owner: self.handle_id,
            root,
            state: CursorState::Invalid,
            pgno: root,
            ix: 0,
            skip: 0,
            saved_key: None,
        });
        drop(bt);
        Ok(BtCursor {
            shared,
            siblings: self.siblings.clone(),
            handle_id: self.handle_id,
            slot_id,
            sharable: self.sharable,
            root,
            writable,
            comparator: comparator.unwrap_or_else(|| Arc::new(BytewiseComparator)),
            state: CursorState::Invalid,
            skip_next: 0,
            pages: Vec::new(),
            idxs: Vec::new(),
            info: None,
            valid_nkey: false,
            at_last: false,
            saved_key: None,
            closed: false,
        })
    }
}

/// A cursor into one tree of the file. The descent path is held as a
/// stack of decoded pages plus the child index taken at each level, so
/// the deepest entry is the page the cursor points into.
pub struct BtCursor {
    shared: Arc<SharedState>,
    siblings: BtreeSiblings,
    handle_id: u64,
    slot_id: u64,
    sharable: bool,
    root: Pgno,
    writable: bool,
    comparator: Arc<dyn KeyComparator>,
    state: CursorState,
    skip_next: i32,
    pages: Vec<MemPage>,
    idxs: Vec<u16>,
    info: Option<CellInfo>,
    valid_nkey: bool,
    at_last: bool,
    saved_key: Option<SavedKey>,
    closed: bool,
}

impl std::fmt::Debug for BtCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtCursor")
            .field("root", &self.root)
            .field("writable", &self.writable)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl BtCursor {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::with_message(ErrorCode::Misuse, "cursor is closed"));
        }
        Ok(())
    }

    fn enter(&self) {
        if self.sharable {
            self.siblings.enter(self.handle_id);
        }
    }

    fn leave(&self) {
        if self.sharable {
            self.siblings.leave(self.handle_id);
        }
    }

    /// Run one cursor operation under the tree lock. `reseek` restores a
    /// position saved around someone else's modification first.
    fn with_tree<T, F>(&mut self, reseek: bool, op: F) -> Result<T>
    where
        F: FnOnce(&mut BtCursor, &mut BtShared) -> Result<T>,
    {
        self.check_open()?;
        self.enter();
        let shared = Arc::clone(&self.shared);
        let rc = match shared.state.write() {
            Ok(mut bt) => {
                let r = (|| {
                    self.prepare(&mut bt)?;
                    if reseek {
                        self.restore(&mut bt)?;
                    }
                    op(self, &mut bt)
                })();
                self.publish(&mut bt);
                r
            }
            Err(_) => Err(Error::new(ErrorCode::Internal)),
        };
        self.leave();
        rc
    }

    /// Adopt whatever happened to this cursor's slot since the last
    /// operation: a rollback trip or a position saved by another writer.
    fn prepare(&mut self, bt: &mut BtShared) -> Result<()> {
        if self.slot_id == 0 {
            return Ok(());
        }
        let slot = bt
            .cursors
            .iter_mut()
            .find(|s| s.id == self.slot_id)
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor is closed"))?;
        match slot.state {
            CursorState::Fault => {
                self.state = CursorState::Fault;
                Err(Error::with_message(
                    ErrorCode::Abort,
                    "cursor tripped by rollback",
                ))
            }
            CursorState::RequireSeek => {
                if let Some(key) = slot.saved_key.take() {
                    self.saved_key = Some(key);
                    self.skip_next = slot.skip;
                    self.state = CursorState::RequireSeek;
                    self.pages.clear();
                    self.idxs.clear();
                    self.info = None;
                    self.valid_nkey = false;
                    self.at_last = false;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Re-seek to the key saved when the position was given up. Lands on
    /// the nearest entry and records which side of the key it fell on.
    fn restore(&mut self, bt: &mut BtShared) -> Result<()> {
        match self.state {
            CursorState::Fault => Err(Error::with_message(
                ErrorCode::Abort,
                "cursor tripped by rollback",
            )),
            CursorState::RequireSeek => {
                let key = self
                    .saved_key
                    .take()
                    .ok_or_else(|| Error::new(ErrorCode::Internal))?;
                self.state = CursorState::Invalid;
                let c = match &key {
                    SavedKey::Rowid(k) => self.table_moveto_impl(bt, *k, false)?,
                    SavedKey::Record(buf) => {
                        let buf = buf.clone();
                        self.index_moveto_impl(bt, &buf, false)?
                    }
                };
                if c != 0 {
                    self.skip_next = c;
                }
                if self.skip_next != 0 && self.state == CursorState::Valid {
                    self.state = CursorState::SkipNext;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Mirror the cursor's state back into its slot so other handles see
    /// an accurate picture.
    fn publish(&mut self, bt: &mut BtShared) {
        if self.slot_id == 0 {
            return;
        }
        if let Some(slot) = bt.cursors.iter_mut().find(|s| s.id == self.slot_id) {
            slot.state = self.state;
            slot.skip = self.skip_next;
            slot.saved_key = self.saved_key.take();
            if self.state == CursorState::Valid || self.state == CursorState::SkipNext {
                if let (Some(page), Some(ix)) = (self.pages.last(), self.idxs.last()) {
                    slot.pgno = page.pgno;
                    slot.ix = *ix;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tree descent
    // ------------------------------------------------------------------

    fn move_to_root(&mut self, bt: &mut BtShared) -> Result<()> {
        self.pages.clear();
        self.idxs.clear();
        self.info = None;
        self.valid_nkey = false;
        self.at_last = false;
        self.skip_next = 0;
        let root = bt.read_page(self.root)?;
        self.pages.push(root);
        self.idxs.push(0);
        let (n_cell, is_leaf, pgno, rightmost) = {
            let page = &self.pages[0];
            (page.n_cell, page.is_leaf, page.pgno, page.rightmost)
        };
        if n_cell == 0 {
            if is_leaf {
                self.state = CursorState::Invalid;
                return Ok(());
            }
            // An empty interior root only exists on page 1, where the
            // header space can make the single child unmergeable.
            if pgno != 1 {
                return Err(corrupt("empty interior tree page"));
            }
            let child =
                rightmost.ok_or_else(|| corrupt("interior page missing right pointer"))?;
            self.state = CursorState::Valid;
            return self.move_to_child(bt, child);
        }
        self.state = CursorState::Valid;
        Ok(())
    }

    fn move_to_child(&mut self, bt: &mut BtShared, pgno: Pgno) -> Result<()> {
        if self.pages.len() >= CURSOR_MAX_DEPTH {
            return Err(corrupt("tree deeper than the cursor limit"));
        }
        let child = bt.read_page(pgno)?;
        self.pages.push(child);
        self.idxs.push(0);
        self.info = None;
        self.valid_nkey = false;
        Ok(())
    }

    fn move_to_parent(&mut self) {
        self.pages.pop();
        self.idxs.pop();
        self.info = None;
        self.valid_nkey = false;
    }

    /// Descend to the leftmost leaf entry under the current position.
    fn move_to_leftmost(&mut self, bt: &mut BtShared) -> Result<()> {
        loop {
            let (is_leaf, child) = {
                let depth = self.pages.len() - 1;
                let page = &self.pages[depth];
                if page.is_leaf {
                    (true, 0)
                } else {
                    let off = page.find_cell(self.idxs[depth])?;
                    (false, get4(&page.data, off)?)
                }
            };
            if is_leaf {
                return Ok(());
            }
            self.move_to_child(bt, child)?;
        }
    }

    /// Descend along right pointers to the last leaf entry of the tree.
    fn move_to_rightmost(&mut self, bt: &mut BtShared) -> Result<()> {
        loop {
            let (is_leaf, n_cell, rightmost) = {
                let page = self
                    .pages
                    .last()
                    .ok_or_else(|| Error::new(ErrorCode::Internal))?;
                (page.is_leaf, page.n_cell, page.rightmost)
            };
            let top = self
                .idxs
                .last_mut()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if is_leaf {
                if n_cell == 0 {
                    return Err(corrupt("empty leaf on a rightmost descent"));
                }
                *top = n_cell - 1;
                return Ok(());
            }
            *top = n_cell;
            let child =
                rightmost.ok_or_else(|| corrupt("interior page missing right pointer"))?;
            self.move_to_child(bt, child)?;
        }
    }

    fn load_info(&mut self) -> Result<()> {
        let page = self
            .pages
            .last()
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let ix = *self
            .idxs
            .last()
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let off = page.find_cell(ix)?;
        let info = page.parse_cell_at(off)?;
        self.valid_nkey = page.is_intkey;
        self.info = Some(info);
        Ok(())
    }

    fn ensure_info(&mut self) -> Result<()> {
        if self.info.is_none() {
            self.load_info()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Positioning
    // ------------------------------------------------------------------

    /// Move to the first entry. Returns false when the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.with_tree(false, |cur, bt| cur.first_impl(bt))
    }

    fn first_impl(&mut self, bt: &mut BtShared) -> Result<bool> {
        self.move_to_root(bt)?;
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        self.move_to_leftmost(bt)?;
        self.load_info()?;
        Ok(true)
    }

    /// Move to the last entry. Returns false when the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.with_tree(false, |cur, bt| cur.last_impl(bt))
    }

    fn last_impl(&mut self, bt: &mut BtShared) -> Result<bool> {
        self.move_to_root(bt)?;
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        self.move_to_rightmost(bt)?;
        self.load_info()?;
        self.at_last = true;
        Ok(true)
    }

    /// Advance to the next entry in key order. Returns false when the
    /// cursor steps off the end.
    pub fn next(&mut self) -> Result<bool> {
        self.with_tree(true, |cur, bt| cur.next_impl(bt))
    }

    fn next_impl(&mut self, bt: &mut BtShared) -> Result<bool> {
        if self.state == CursorState::SkipNext {
            self.state = CursorState::Valid;
            let skip = self.skip_next;
            self.skip_next = 0;
            if skip > 0 {
                self.ensure_info()?;
                return Ok(true);
            }
        }
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        self.info = None;
        self.valid_nkey = false;
        self.at_last = false;

        let depth = self.pages.len() - 1;
        let (is_leaf, n_cell) = {
            let p = &self.pages[depth];
            (p.is_leaf, p.n_cell)
        };
        let ix = self.idxs[depth] + 1;
        self.idxs[depth] = ix;
        if ix >= n_cell {
            if !is_leaf {
                // Stepped past the last divider: the right subtree's
                // smallest entry comes next.
                let child = self.pages[depth]
                    .rightmost
                    .ok_or_else(|| corrupt("interior page missing right pointer"))?;
                self.move_to_child(bt, child)?;
                self.move_to_leftmost(bt)?;
                self.load_info()?;
                return Ok(true);
            }
            loop {
                if self.pages.len() == 1 {
                    self.state = CursorState::Invalid;
                    return Ok(false);
                }
                self.move_to_parent();
                let d = self.pages.len() - 1;
                if self.idxs[d] < self.pages[d].n_cell {
                    break;
                }
            }
            if self.pages[self.pages.len() - 1].is_intkey {
                // Rowid dividers carry no payload of their own.
                return self.next_impl(bt);
            }
            self.load_info()?;
            return Ok(true);
        }
        if is_leaf {
            self.load_info()?;
            return Ok(true);
        }
        // A fresh divider: its left subtree comes before it.
        let child = {
            let p = &self.pages[depth];
            let off = p.find_cell(ix)?;
            get4(&p.data, off)?
        };
        self.move_to_child(bt, child)?;
        self.move_to_leftmost(bt)?;
        self.load_info()?;
        Ok(true)
    }

    /// Step back to the previous entry in key order. Returns false when
    /// the cursor steps off the front.
    pub fn previous(&mut self) -> Result<bool> {
        self.with_tree(true, |cur, bt| cur.previous_impl(bt))
    }

    fn previous_impl(&mut self, bt: &mut BtShared) -> Result<bool> {
        if self.state == CursorState::SkipNext {
            self.state = CursorState::Valid;
            let skip = self.skip_next;
            self.skip_next = 0;
            if skip < 0 {
                self.ensure_info()?;
                return Ok(true);
            }
        }
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        self.info = None;
        self.valid_nkey = false;
        self.at_last = false;

        let depth = self.pages.len() - 1;
        if !self.pages[depth].is_leaf {
            // On a divider: everything under its left child is smaller.
            let child = {
                let p = &self.pages[depth];
                let off = p.find_cell(self.idxs[depth])?;
                get4(&p.data, off)?
            };
            self.move_to_child(bt, child)?;
            self.move_to_rightmost(bt)?;
            self.load_info()?;
            return Ok(true);
        }
        while self.idxs[self.pages.len() - 1] == 0 {
            if self.pages.len() == 1 {
                self.state = CursorState::Invalid;
                return Ok(false);
            }
            self.move_to_parent();
        }
        let d = self.pages.len() - 1;
        self.idxs[d] -= 1;
        let (p_intkey, p_leaf) = {
            let p = &self.pages[d];
            (p.is_intkey, p.is_leaf)
        };
        if p_intkey && !p_leaf {
            return self.previous_impl(bt);
        }
        self.load_info()?;
        Ok(true)
    }

    /// Position on the entry with rowid `key`, or the nearest neighbor.
    /// Returns 0 on an exact hit, a negative value when the cursor ends
    /// up on an entry smaller than `key`, positive when larger.
    pub fn table_moveto(&mut self, key: i64, bias_right: bool) -> Result<i32> {
        self.with_tree(false, |cur, bt| cur.table_moveto_impl(bt, key, bias_right))
    }

    fn table_moveto_impl(&mut self, bt: &mut BtShared, key: i64, bias_right: bool) -> Result<i32> {
        if self.state == CursorState::Valid && self.valid_nkey {
            if let Some(info) = &self.info {
                if info.n_key == key {
                    return Ok(0);
                }
                if info.n_key < key && self.at_last {
                    return Ok(-1);
                }
            }
        }
        self.move_to_root(bt)?;
        if self.state != CursorState::Valid {
            return Ok(-1);
        }
        loop {
            let depth = self.pages.len() - 1;
            let (is_leaf, is_intkey, n_cell) = {
                let p = &self.pages[depth];
                (p.is_leaf, p.is_intkey, p.n_cell)
            };
            if !is_intkey {
                return Err(corrupt("rowid search on an index tree"));
            }
            if n_cell == 0 {
                return Err(corrupt("empty tree page in a rowid search"));
            }
            let mut lwr: i32 = 0;
            let mut upr: i32 = n_cell as i32 - 1;
            let mut idx: i32 = if bias_right { upr } else { (lwr + upr) / 2 };
            let mut c: i32 = -1;
            let mut exact_interior = false;
            loop {
                let cell_key = {
                    let p = &self.pages[depth];
                    let off = p.find_cell(idx as u16)?;
                    let mut pos = off + p.child_ptr_size;
                    if p.has_data {
                        let (_, sz) = read_varint32(&p.data, pos)?;
                        pos += sz;
                    }
                    let (k, _) = read_varint(&p.data, pos)?;
                    k as i64
                };
                if cell_key < key {
                    lwr = idx + 1;
                    if lwr > upr {
                        c = -1;
                        break;
                    }
                } else if cell_key > key {
                    upr = idx - 1;
                    if lwr > upr {
                        c = 1;
                        break;
                    }
                } else {
                    self.idxs[depth] = idx as u16;
                    if !is_leaf {
                        // The matching entry lives in the leaf below;
                        // the divider only mirrors it.
                        lwr = idx;
                        exact_interior = true;
                        break;
                    }
                    self.load_info()?;
                    return Ok(0);
                }
                idx = (lwr + upr) / 2;
            }
            if is_leaf && !exact_interior {
                self.idxs[depth] = idx as u16;
                self.info = None;
                self.valid_nkey = false;
                return Ok(c);
            }
            let child = {
                let p = &self.pages[depth];
                if lwr >= n_cell as i32 {
                    p.rightmost
                        .ok_or_else(|| corrupt("interior page missing right pointer"))?
                } else {
                    let off = p.find_cell(lwr as u16)?;
                    get4(&p.data, off)?
                }
            };
            self.idxs[depth] = lwr as u16;
            self.move_to_child(bt, child)?;
        }
    }

    /// Position on the index entry equal to `key`, or the nearest
    /// neighbor, using the cursor's comparator. Result convention is the
    /// same as `table_moveto`.
    pub fn index_moveto(&mut self, key: &[u8], bias_right: bool) -> Result<i32> {
        self.with_tree(false, |cur, bt| cur.index_moveto_impl(bt, key, bias_right))
    }

    fn index_moveto_impl(&mut self, bt: &mut BtShared, key: &[u8], bias_right: bool) -> Result<i32> {
        self.move_to_root(bt)?;
        if self.state != CursorState::Valid {
            return Ok(-1);
        }
        loop {
            let depth = self.pages.len() - 1;
            let (is_leaf, is_intkey, n_cell) = {
                let p = &self.pages[depth];
                (p.is_leaf, p.is_intkey, p.n_cell)
            };
            if is_intkey {
                return Err(corrupt("record search on a rowid tree"));
            }
            if n_cell == 0 {
                return Err(corrupt("empty tree page in a record search"));
            }
            let mut lwr: i32 = 0;
            let mut upr: i32 = n_cell as i32 - 1;
            let mut idx: i32 = if bias_right { upr } else { (lwr + upr) / 2 };
            let mut c: i32;
            loop {
                let cell_key = self.index_cell_key(bt, depth, idx as u16)?;
                c = match self.comparator.compare(&cell_key, key) {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                };
                if c == 0 {
                    // Index dividers are real entries; stop right here.
                    self.idxs[depth] = idx as u16;
                    self.load_info()?;
                    return Ok(0);
                }
                if c < 0 {
                    lwr = idx + 1;
                } else {
                    upr = idx - 1;
                }
                if lwr > upr {
                    break;
                }
                idx = (lwr + upr) / 2;
            }
            if is_leaf {
                self.idxs[depth] = idx as u16;
                self.info = None;
                self.valid_nkey = false;
                return Ok(c);
            }
            let child = {
                let p = &self.pages[depth];
                if lwr >= n_cell as i32 {
                    p.rightmost
                        .ok_or_else(|| corrupt("interior page missing right pointer"))?
                } else {
                    let off = p.find_cell(lwr as u16)?;
                    get4(&p.data, off)?
                }
            };
            self.idxs[depth] = lwr as u16;
            self.move_to_child(bt, child)?;
        }
    }

    /// Assemble the full key bytes of cell `ix` at stack level `depth`,
    /// following its overflow chain when the key spills.
    fn index_cell_key(&self, bt: &mut BtShared, depth: usize, ix: u16) -> Result<Vec<u8>> {
        let page = &self.pages[depth];
        let off = page.find_cell(ix)?;
        let info = page.parse_cell_at(off)?;
        let mut out = vec![0u8; info.n_payload as usize];
        bt.read_payload_at(page, off, &info, 0, info.n_payload, &mut out)?;
        Ok(out)
    }

    /// True if the cursor currently points at an entry.
    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid || self.state == CursorState::SkipNext
    }

    // ------------------------------------------------------------------
    // Insertion and deletion
    // ------------------------------------------------------------------

    /// Insert a new entry, or replace the entry with the same key. The
    /// cursor is left on the new entry when no rebalancing was needed,
    /// otherwise its position becomes undefined.
    pub fn insert(&mut self, payload: &BtreePayload, flags: BtreeInsertFlags) -> Result<()> {
        self.with_tree(true, |cur, bt| cur.insert_impl(bt, payload, flags))
    }

    fn insert_impl(
        &mut self,
        bt: &mut BtShared,
        payload: &BtreePayload,
        flags: BtreeInsertFlags,
    ) -> Result<()> {
        if !self.writable {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "cursor is not writable",
            ));
        }
        if bt.in_transaction != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "insert requires a write transaction",
            ));
        }
        bt.save_all_cursors(Some(self.root), Some(self.slot_id))?;

        let bias_right = flags.contains(BtreeInsertFlags::APPEND);
        let loc = match &payload.key {
            Some(key) => self.index_moveto_impl(bt, key, bias_right)?,
            None => self.table_moveto_impl(bt, payload.n_key, bias_right)?,
        };
        let depth = self
            .pages
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;

        // On an exact hit the old entry is replaced. An index divider
        // keeps its child pointer; the new cell inherits it.
        let mut old_child: Option<Pgno> = None;
        if loc == 0 && self.state == CursorState::Valid {
            let ix = self.idxs[depth];
            let off = self.pages[depth].find_cell(ix)?;
            if !self.pages[depth].is_leaf {
                old_child = Some(get4(&self.pages[depth].data, off)?);
            }
            bt.clear_cell_overflow(&self.pages[depth], off)?;
            self.pages[depth].drop_cell(ix)?;
        } else if loc < 0 && self.pages[depth].n_cell > 0 {
            // The cursor sits on the entry just below the key; the new
            // cell goes after it.
            self.idxs[depth] += 1;
        }

        let mut cell = bt.fill_in_cell(&self.pages[depth], payload)?;
        if let Some(child) = old_child {
            if cell.len() < 4 {
                return Err(Error::new(ErrorCode::Internal));
            }
            cell[..4].copy_from_slice(&child.to_be_bytes());
        }
        let ix = self.idxs[depth];
        self.pages[depth].insert_cell(ix, cell)?;

        if self.pages[depth].overflow.is_empty() {
            bt.write_page(&self.pages[depth])?;
            self.load_info()?;
            self.state = CursorState::Valid;
            self.skip_next = 0;
            self.at_last = false;
            return Ok(());
        }
        self.balance(bt)?;
        self.invalidate_position();
        Ok(())
    }

    /// Delete the entry under the cursor. The position becomes
    /// undefined afterwards.
    pub fn delete(&mut self) -> Result<()> {
        self.with_tree(true, |cur, bt| cur.delete_impl(bt))
    }

    fn delete_impl(&mut self, bt: &mut BtShared) -> Result<()> {
        if !self.writable {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "cursor is not writable",
            ));
        }
        if bt.in_transaction != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "delete requires a write transaction",
            ));
        }
        if self.state != CursorState::Valid {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "cursor does not point at an entry",
            ));
        }
        bt.save_all_cursors(Some(self.root), Some(self.slot_id))?;

        let cell_depth = self.pages.len() - 1;
        let cell_idx = self.idxs[cell_depth];

        if self.pages[cell_depth].is_leaf {
            let off = self.pages[cell_depth].find_cell(cell_idx)?;
            bt.clear_cell_overflow(&self.pages[cell_depth], off)?;
            self.pages[cell_depth].drop_cell(cell_idx)?;
            bt.write_page(&self.pages[cell_depth])?;
            self.balance(bt)?;
            self.invalidate_position();
            return Ok(());
        }

        // Deleting a divider: its slot is refilled with the next entry
        // in key order, pulled up from the leaf level. Only index trees
        // stop cursors on interior cells.
        if self.pages[cell_depth].is_intkey {
            return Err(corrupt("rowid cursor stopped on an interior cell"));
        }
        if !self.next_impl(bt)? {
            return Err(corrupt("interior entry has no successor"));
        }
        let leaf_depth = self.pages.len() - 1;
        if !self.pages[leaf_depth].is_leaf {
            return Err(corrupt("successor of an interior entry is not on a leaf"));
        }
        let leaf_idx = self.idxs[leaf_depth];
        let succ = self.pages[leaf_depth].flat_cell(leaf_idx)?;
        let succ_key = self.index_cell_key(bt, leaf_depth, leaf_idx)?;

        // The successor's bytes move up wholesale, overflow pointer
        // included, so only the doomed divider's chain is freed.
        self.pages[leaf_depth].drop_cell(leaf_idx)?;
        bt.write_page(&self.pages[leaf_depth])?;

        let old_child = {
            let off = self.pages[cell_depth].find_cell(cell_idx)?;
            let child = get4(&self.pages[cell_depth].data, off)?;
            bt.clear_cell_overflow(&self.pages[cell_depth], off)?;
            child
        };
        let mut divider = Vec::with_capacity(4 + succ.len());
        divider.extend_from_slice(&old_child.to_be_bytes());
        divider.extend_from_slice(&succ);
        let info = self.pages[cell_depth].parse_cell_slice(&divider, 0)?;
        divider.resize(info.n_size as usize, 0);

        self.pages[cell_depth].drop_cell(cell_idx)?;
        self.pages[cell_depth].insert_cell(cell_idx, divider)?;
        if self.pages[cell_depth].overflow.is_empty() {
            bt.write_page(&self.pages[cell_depth])?;
            bt.ptrmap_fix_page(&self.pages[cell_depth])?;
        }

        // Rebalance the interior level first. The leaf that gave up its
        // entry is then found again by a fresh descent, since the first
        // pass may have restructured everything below.
        self.pages.truncate(cell_depth + 1);
        self.idxs.truncate(cell_depth + 1);
        self.idxs[cell_depth] = cell_idx;
        self.info = None;
        self.valid_nkey = false;
        self.balance(bt)?;

        self.seek_leaf_after(bt, &succ_key)?;
        if let Some(p) = self.pages.last() {
            if p.n_cell == 0 || p.n_free * 3 > p.usable_size as i32 * 2 {
                self.balance(bt)?;
            }
        }
        self.invalidate_position();
        Ok(())
    }

    fn invalidate_position(&mut self) {
        self.pages.clear();
        self.idxs.clear();
        self.info = None;
        self.valid_nkey = false;
        self.at_last = false;
        self.skip_next = 0;
        self.state = CursorState::Invalid;
    }

    /// Descend to the leaf that holds the first entry greater than
    /// `key`, treating a divider equal to `key` as belonging to its
    /// left subtree. This lands on the leaf that just promoted an entry
    /// into its ancestry.
    fn seek_leaf_after(&mut self, bt: &mut BtShared, key: &[u8]) -> Result<()> {
        self.move_to_root(bt)?;
        if self.pages.is_empty() {
            return Ok(());
        }
        loop {
            let depth = self.pages.len() - 1;
            let (is_leaf, n_cell) = {
                let p = &self.pages[depth];
                (p.is_leaf, p.n_cell)
            };
            if is_leaf {
                self.idxs[depth] = 0;
                return Ok(());
            }
            let mut lwr: i32 = 0;
            let mut upr: i32 = n_cell as i32 - 1;
            while lwr <= upr {
                let mid = (lwr + upr) / 2;
                let cell_key = self.index_cell_key(bt, depth, mid as u16)?;
                if self.comparator.compare(&cell_key, key) == Ordering::Greater {
                    upr = mid - 1;
                } else {
                    lwr = mid + 1;
                }
            }
            let child = {
                let p = &self.pages[depth];
                if lwr >= n_cell as i32 {
                    p.rightmost
                        .ok_or_else(|| corrupt("interior page missing right pointer"))?
                } else {
                    let off = p.find_cell(lwr as u16)?;
                    get4(&p.data, off)?
                }
            };
            self.idxs[depth] = lwr as u16;
            self.move_to_child(bt, child)?;
        }
    }

    // ------------------------------------------------------------------
    // Balancing
    // ------------------------------------------------------------------

    /// Restore the tree's balance along the cursor's descent path.
    /// Works bottom up: the deepest page is settled first, and any
    /// spill into its parent is handled on the next pass, until a level
    /// needs no work or the root absorbs the change.
    fn balance(&mut self, bt: &mut BtShared) -> Result<()> {
        loop {
            let depth = self.pages.len() - 1;
            let (overfull, underfull, n_cell, is_leaf) = {
                let p = &self.pages[depth];
                (
                    !p.overflow.is_empty(),
                    p.n_free * 3 > p.usable_size as i32 * 2,
                    p.n_cell,
                    p.is_leaf,
                )
            };
            if depth == 0 {
                if overfull {
                    self.balance_deeper(bt)?;
                    continue;
                }
                if n_cell == 0 && !is_leaf {
                    if self.balance_shallower(bt)? {
                        continue;
                    }
                }
                return Ok(());
            }
            if !overfull && !underfull {
                return Ok(());
            }
            let quick = {
                let p = &self.pages[depth];
                let parent = &self.pages[depth - 1];
                p.is_intkey
                    && p.is_leaf
                    && p.overflow.len() == 1
                    && p.overflow[0].idx == p.n_cell
                    && parent.pgno != 1
                    && self.idxs[depth - 1] == parent.n_cell
            };
            if quick {
                self.balance_quick(bt)?;
            } else {
                self.balance_nonroot(bt)?;
            }
            self.pages.pop();
            self.idxs.pop();
            self.info = None;
            self.valid_nkey = false;
        }
    }

    /// The root holds more than one page of content: push everything
    /// into a fresh child and grow the tree one level from the top, so
    /// the root's page number never changes.
    fn balance_deeper(&mut self, bt: &mut BtShared) -> Result<()> {
        let root = self.pages[0].clone();
        let flags = root.data[root.hdr_offset];
        let child_pgno = bt.allocate_page()?;
        let mut child =
            MemPage::zeroed(child_pgno, vec![0u8; bt.page_size as usize], flags, bt)?;
        for i in 0..root.total_cells() {
            let cell = root.flat_cell(i)?;
            child.insert_cell(i, cell)?;
        }
        if let Some(rm) = root.rightmost {
            child.set_rightmost(rm)?;
        }
        let mut new_root = root;
        new_root.zero(flags & !PTF_LEAF, bt)?;
        new_root.set_rightmost(child_pgno)?;
        bt.write_page(&new_root)?;
        bt.ptrmap_put(child_pgno, PTRMAP_BTREE, new_root.pgno)?;
        if child.overflow.is_empty() {
            bt.write_page(&child)?;
            bt.ptrmap_fix_page(&child)?;
        }
        self.pages[0] = new_root;
        self.idxs[0] = 0;
        self.pages.push(child);
        self.idxs.push(0);
        Ok(())
    }

    /// The root is an interior page with no dividers left: absorb its
    /// only child when the content fits, shrinking the tree from the
    /// top. Page 1 cedes space to the file header, so its child may not
    /// fit; the empty root then stays on as a virtual root.
    fn balance_shallower(&mut self, bt: &mut BtShared) -> Result<bool> {
        let root = self.pages[0].clone();
        let child_pgno = root
            .rightmost
            .ok_or_else(|| corrupt("interior page missing right pointer"))?;
        let child = bt.read_page(child_pgno)?;
        let mut need = 0usize;
        for i in 0..child.n_cell {
            let off = child.find_cell(i)?;
            need += child.cell_size_at(off)? as usize + 2;
        }
        let header = if child.is_leaf {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        };
        if need > bt.usable_size as usize - root.hdr_offset - header {
            if root.pgno != 1 {
                return Err(corrupt("empty interior page below the root"));
            }
            return Ok(false);
        }
        let mut cells = Vec::with_capacity(child.n_cell as usize);
        for i in 0..child.n_cell {
            cells.push(FlatCell {
                data: child.flat_cell(i)?,
            });
        }
        let mut new_root = root;
        new_root.zero(child.data[child.hdr_offset], bt)?;
        new_root.assemble(&cells)?;
        if let Some(rm) = child.rightmost {
            new_root.set_rightmost(rm)?;
        }
        bt.write_page(&new_root)?;
        bt.ptrmap_fix_page(&new_root)?;
        bt.free_btree_page(child_pgno)?;
        self.pages[0] = new_root;
        self.idxs[0] = 0;
        Ok(true)
    }

    /// Append split. The overflowing leaf holds in-order rowids and the
    /// new cell belongs past its last one, so the cell goes alone onto
    /// a fresh page hung off the parent's right pointer. The old page's
    /// disk image is already correct and is not rewritten.
    fn balance_quick(&mut self, bt: &mut BtShared) -> Result<()> {
        let depth = self.pages.len() - 1;
        let parent_pgno = self.pages[depth - 1].pgno;
        let (old_pgno, cell, last_key) = {
            let p = &self.pages[depth];
            let off = p.find_cell(p.n_cell - 1)?;
            let info = p.parse_cell_at(off)?;
            (p.pgno, p.overflow[0].cell.clone(), info.n_key)
        };

        let new_pgno = bt.allocate_page()?;
        let mut new_page = MemPage::zeroed(
            new_pgno,
            vec![0u8; bt.page_size as usize],
            PTF_TABLE_LEAF,
            bt,
        )?;
        new_page.insert_cell(0, cell)?;
        bt.write_page(&new_page)?;
        bt.ptrmap_put(new_pgno, PTRMAP_BTREE, parent_pgno)?;
        bt.ptrmap_fix_page(&new_page)?;

        // Reload the old page to shed the parked cell.
        self.pages[depth] = bt.read_page(old_pgno)?;

        // Divider: the old page keyed by its largest rowid.
        let mut divider = Vec::with_capacity(13);
        divider.extend_from_slice(&old_pgno.to_be_bytes());
        write_varint(last_key as u64, &mut divider);
        {
            let parent = &mut self.pages[depth - 1];
            parent.set_rightmost(new_pgno)?;
            let at = parent.total_cells();
            parent.insert_cell(at, divider)?;
        }
        if self.pages[depth - 1].overflow.is_empty() {
            bt.write_page(&self.pages[depth - 1])?;
        }
        Ok(())
    }

    /// Redistribute cells between an out-of-balance page and up to two
    /// of its siblings, rewriting the dividers in the parent. Pages may
    /// split, merge, or shuffle cells sideways; the parent absorbs the
    /// new dividers and overflows in its own turn when they do not fit.
    fn balance_nonroot(&mut self, bt: &mut BtShared) -> Result<()> {
        let depth = self.pages.len() - 1;
        if !self.pages[depth - 1].overflow.is_empty() {
            return Err(Error::new(ErrorCode::Internal));
        }
        let mut parent = self.pages[depth - 1].clone();
        let target = self.pages[depth].clone();
        let idx = self.idxs[depth - 1] as usize;

        // Up to NB siblings centered on the target page.
        let n_old = NB.min(parent.n_cell as usize + 1);
        let nx_div = (idx as i64 - NN as i64)
            .max(0)
            .min(parent.n_cell as i64 + 1 - n_old as i64) as usize;

        let mut old_pages: Vec<MemPage> = Vec::with_capacity(n_old);
        for i in 0..n_old {
            let slot = nx_div + i;
            let pgno = if slot == parent.n_cell as usize {
                parent
                    .rightmost
                    .ok_or_else(|| corrupt("interior page missing right pointer"))?
            } else {
                let off = parent.find_cell(slot as u16)?;
                get4(&parent.data, off)?
            };
            if pgno == target.pgno {
                old_pages.push(target.clone());
            } else {
                old_pages.push(bt.read_page(pgno)?);
            }
        }

        let is_leaf = old_pages[0].is_leaf;
        let leaf_correction: usize = if is_leaf { 4 } else { 0 };
        // Rowid leaves carry the entries themselves; their dividers are
        // synthesized afresh and the old ones simply vanish.
        let leaf_data = old_pages[0].is_intkey && is_leaf;

        // Flatten every sibling cell into one ordered run, with the
        // parent's dividers interleaved where the tree order puts them.
        let mut cells: Vec<FlatCell> = Vec::new();
        for (i, old) in old_pages.iter().enumerate() {
            for j in 0..old.total_cells() {
                cells.push(FlatCell {
                    data: old.flat_cell(j)?,
                });
            }
            if i < n_old - 1 {
                let off = parent.find_cell((nx_div + i) as u16)?;
                let sz = parent.cell_size_at(off)? as usize;
                let raw = parent.data[off..off + sz].to_vec();
                if leaf_data {
                    continue;
                }
                if is_leaf {
                    // An index divider rejoins the leaf stream without
                    // its child pointer.
                    let mut body = raw[4..].to_vec();
                    if body.len() < 4 {
                        body.resize(4, 0);
                    }
                    cells.push(FlatCell { data: body });
                } else {
                    // An interior divider keeps its place, adopting the
                    // left sibling's right pointer as its child.
                    let rm = old
                        .rightmost
                        .ok_or_else(|| corrupt("interior page missing right pointer"))?;
                    let mut body = raw;
                    body[..4].copy_from_slice(&rm.to_be_bytes());
                    cells.push(FlatCell { data: body });
                }
            }
        }

        // Greedy left-to-right packing, then a rightward pass that
        // evens the edge so no page ends up empty or lopsided.
        let usable_space = bt.usable_size as usize - 12 + leaf_correction;
        let cell_sz = |i: usize| cells[i].data.len() + 2;
        let mut cnt: Vec<usize> = Vec::new();
        let mut subtotal = 0usize;
        let mut i = 0usize;
        while i < cells.len() {
            let sz = cell_sz(i);
            if subtotal + sz > usable_space {
                if subtotal == 0 {
                    return Err(corrupt("cell larger than a page"));
                }
                cnt.push(i);
                subtotal = 0;
                if !leaf_data {
                    // The boundary cell becomes this page's divider.
                    i += 1;
                }
                continue;
            }
            subtotal += sz;
            i += 1;
        }
        cnt.push(cells.len());
        let k = cnt.len();

        let mut sz_new = vec![0usize; k];
        {
            let mut start = 0usize;
            for (j, item) in sz_new.iter_mut().enumerate() {
                *item = (start..cnt[j]).map(|c| cell_sz(c)).sum();
                start = cnt[j] + usize::from(!leaf_data);
            }
        }
        for j in (1..k).rev() {
            let mut sz_right = sz_new[j];
            let mut sz_left = sz_new[j - 1];
            loop {
                if cnt[j - 1] == 0 {
                    return Err(corrupt("sibling redistribution ran out of cells"));
                }
                let r = cnt[j - 1] - 1;
                let d = if leaf_data { r } else { r + 1 };
                if d >= cells.len() {
                    return Err(Error::new(ErrorCode::Internal));
                }
                let room = match sz_left.checked_sub(cell_sz(r)) {
                    Some(room) => room,
                    None => break,
                };
                if sz_right != 0 && sz_right + cell_sz(d) > room {
                    break;
                }
                sz_right += cell_sz(d);
                sz_left = room;
                cnt[j - 1] -= 1;
            }
            sz_new[j] = sz_right;
            sz_new[j - 1] = sz_left;
        }

        // Page numbers: reuse the old ones, allocate extras for a
        // split, free leftovers on a merge. Ascending order keeps pages
        // roughly in key order on disk.
        let old_pgnos: Vec<Pgno> = old_pages.iter().map(|p| p.pgno).collect();
        let mut new_pgnos: Vec<Pgno> = Vec::with_capacity(k);
        for j in 0..k {
            if j < n_old {
                new_pgnos.push(old_pgnos[j]);
            } else {
                new_pgnos.push(bt.allocate_page()?);
            }
        }
        for &pgno in old_pgnos.iter().skip(k) {
            bt.free_btree_page(pgno)?;
        }
        new_pgnos.sort_unstable();

        let flags = old_pages[0].data[old_pages[0].hdr_offset];
        let last_rightmost = old_pages[n_old - 1].rightmost;
        let mut new_dividers: Vec<Vec<u8>> = Vec::with_capacity(k - 1);
        let mut start = 0usize;
        for j in 0..k {
            let end = cnt[j];
            let mut page =
                MemPage::zeroed(new_pgnos[j], vec![0u8; bt.page_size as usize], flags, bt)?;
            page.assemble(&cells[start..end])?;
            if !is_leaf {
                let rm = if j < k - 1 {
                    get4(&cells[end].data, 0)?
                } else {
                    last_rightmost
                        .ok_or_else(|| corrupt("interior page missing right pointer"))?
                };
                page.set_rightmost(rm)?;
            }
            if j < k - 1 {
                let mut div: Vec<u8>;
                if leaf_data {
                    // Rowid divider: the page keyed by its largest rowid.
                    let info = page.parse_cell_slice(&cells[end - 1].data, 0)?;
                    div = Vec::with_capacity(13);
                    div.extend_from_slice(&new_pgnos[j].to_be_bytes());
                    write_varint(info.n_key as u64, &mut div);
                } else {
                    div = Vec::with_capacity(4 + cells[end].data.len());
                    div.extend_from_slice(&new_pgnos[j].to_be_bytes());
                    if is_leaf {
                        div.extend_from_slice(&cells[end].data);
                    } else {
                        div.extend_from_slice(&cells[end].data[4..]);
                    }
                }
                // Re-measure in the parent's format; stripped or padded
                // bodies shift the cell's reported size.
                let info = parent.parse_cell_slice(&div, 0)?;
                div.resize(info.n_size as usize, 0);
                new_dividers.push(div);
            }
            bt.write_page(&page)?;
            bt.ptrmap_put(page.pgno, PTRMAP_BTREE, parent.pgno)?;
            bt.ptrmap_fix_page(&page)?;
            start = end + usize::from(!leaf_data);
        }

        // Rewrite the parent's view of this range: out with the old
        // dividers, repoint the slot just right of the range at the
        // last new page, then insert the new dividers.
        for _ in 0..n_old - 1 {
            parent.drop_cell(nx_div as u16)?;
        }
        if nx_div == parent.n_cell as usize {
            parent.set_rightmost(new_pgnos[k - 1])?;
        } else {
            let off = parent.find_cell(nx_div as u16)?;
            write_u32(&mut parent.data, off, new_pgnos[k - 1])?;
        }
        for (j, div) in new_dividers.into_iter().enumerate() {
            parent.insert_cell((nx_div + j) as u16, div)?;
        }
        if parent.overflow.is_empty() {
            bt.write_page(&parent)?;
            bt.ptrmap_fix_page(&parent)?;
        }
        self.pages[depth - 1] = parent;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry access
    // ------------------------------------------------------------------

    /// Rowid of the current entry on a table tree, or the key length on
    /// an index tree. Zero when the cursor points nowhere.
    pub fn key_size(&mut self) -> Result<i64> {
        self.with_tree(true, |cur, _bt| {
            if cur.state != CursorState::Valid && cur.state != CursorState::SkipNext {
                return Ok(0);
            }
            cur.ensure_info()?;
            Ok(cur.info.as_ref().map(|i| i.n_key).unwrap_or(0))
        })
    }

    /// Number of data bytes in the current entry. Zero when the cursor
    /// points nowhere and on index trees, whose entries are all key.
    pub fn data_size(&mut self) -> Result<u32> {
        self.with_tree(true, |cur, _bt| {
            if cur.state != CursorState::Valid && cur.state != CursorState::SkipNext {
                return Ok(0);
            }
            cur.ensure_info()?;
            Ok(cur.info.as_ref().map(|i| i.n_data).unwrap_or(0))
        })
    }

    /// Copy `amt` payload bytes starting at `offset` out of the current
    /// entry. Table entries expose their data; index entries their key.
    pub fn read_payload(&mut self, offset: u32, amt: u32) -> Result<Vec<u8>> {
        self.with_tree(true, |cur, bt| {
            if cur.state != CursorState::Valid && cur.state != CursorState::SkipNext {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "cursor does not point at an entry",
                ));
            }
            cur.ensure_info()?;
            let page = cur
                .pages
                .last()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let ix = *cur
                .idxs
                .last()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let off = page.find_cell(ix)?;
            let info = cur
                .info
                .clone()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let mut out = vec![0u8; amt as usize];
            bt.read_payload_at(page, off, &info, offset, amt, &mut out)?;
            Ok(out)
        })
    }

    /// The current index entry's full key record.
    pub fn key(&mut self) -> Result<Vec<u8>> {
        self.with_tree(true, |cur, bt| {
            if cur.state != CursorState::Valid && cur.state != CursorState::SkipNext {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "cursor does not point at an entry",
                ));
            }
            cur.ensure_info()?;
            let page = cur
                .pages
                .last()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if page.is_intkey {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "rowid tree keys are integers",
                ));
            }
            let ix = *cur
                .idxs
                .last()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let off = page.find_cell(ix)?;
            let info = cur
                .info
                .clone()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let mut out = vec![0u8; info.n_payload as usize];
            bt.read_payload_at(page, off, &info, 0, info.n_payload, &mut out)?;
            Ok(out)
        })
    }

    /// The current table entry's full data payload.
    pub fn data(&mut self) -> Result<Vec<u8>> {
        let n = self.data_size()?;
        self.read_payload(0, n)
    }

    /// Count every entry in the tree. Leaves the cursor position
    /// undefined.
    pub fn count(&mut self) -> Result<i64> {
        self.with_tree(false, |cur, bt| cur.count_impl(bt))
    }

    fn count_impl(&mut self, bt: &mut BtShared) -> Result<i64> {
        let mut n_entry: i64 = 0;
        self.move_to_root(bt)?;
        if self.state != CursorState::Valid {
            return Ok(0);
        }
        loop {
            let depth = self.pages.len() - 1;
            let (is_leaf, is_intkey, n_cell) = {
                let p = &self.pages[depth];
                (p.is_leaf, p.is_intkey, p.n_cell)
            };
            // Interior rowid dividers are not entries; everything else
            // on the page counts.
            if is_leaf || !is_intkey {
                n_entry += n_cell as i64;
            }
            if is_leaf {
                loop {
                    if self.pages.len() == 1 {
                        self.state = CursorState::Invalid;
                        return Ok(n_entry);
                    }
                    self.move_to_parent();
                    let d = self.pages.len() - 1;
                    if self.idxs[d] < self.pages[d].n_cell {
                        break;
                    }
                }
                let d = self.pages.len() - 1;
                self.idxs[d] += 1;
            }
            let d = self.pages.len() - 1;
            let ix = self.idxs[d];
            let child = {
                let p = &self.pages[d];
                if ix == p.n_cell {
                    p.rightmost
                        .ok_or_else(|| corrupt("interior page missing right pointer"))?
                } else {
                    let off = p.find_cell(ix)?;
                    get4(&p.data, off)?
                }
            };
            self.move_to_child(bt, child)?;
        }
    }

    /// Release the cursor's registration and page stack. Safe to call
    /// more than once; dropping the cursor does the same.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.enter();
        let shared = Arc::clone(&self.shared);
        let rc = match shared.state.write() {
            Ok(mut bt) => {
                bt.cursors.retain(|slot| slot.id != self.slot_id);
                bt.unlock_if_unused();
                Ok(())
            }
            Err(_) => Err(Error::new(ErrorCode::Internal)),
        };
        self.leave();
        self.pages.clear();
        self.idxs.clear();
        self.info = None;
        self.state = CursorState::Invalid;
        rc
    }
}

impl Drop for BtCursor {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "btree-{}-{}",
            tag,
            NEXT.fetch_add(1, AtomicOrdering::SeqCst)
        )
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

    fn idx_key(i: u32, len: usize) -> Vec<u8> {
        let mut key = vec![(i % 7) as u8; len];
        key[..4].copy_from_slice(&i.to_be_bytes());
        key
    }

    fn insert_row(cur: &mut BtCursor, key: i64, len: usize) {
        cur.insert(&row(key, len), BtreeInsertFlags::empty()).unwrap();
    }

    fn check_clean(tree: &mut Btree, root: Pgno) {
        let result = tree.integrity_check(&[root], 100).unwrap();
        assert!(result.is_ok(), "integrity errors: {:?}", result.errors);
    }

    #[test]
    fn test_insert_and_lookup_roundtrip() {
        let name = unique_name("roundtrip");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        for key in 1..=20i64 {
            insert_row(&mut cur, key, 24);
        }
        for key in 1..=20i64 {
            assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
            assert_eq!(cur.key_size().unwrap(), key);
            assert_eq!(cur.data().unwrap(), vec![(key % 251) as u8; 24]);
        }
        assert_ne!(cur.table_moveto(21, false).unwrap(), 0);
        cur.close().unwrap();
        check_clean(&mut tree, root);
        tree.commit().unwrap();
    }

    #[test]
    fn test_split_keeps_entries_in_order() {
        let name = unique_name("split");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

        // Insert in a scrambled order so splits land mid-page.
        let n = 800i64;
        let mut key = 0i64;
        for _ in 0..n {
            key = (key + 389) % n;
            insert_row(&mut cur, key, 60);
        }
        assert_eq!(cur.count().unwrap(), n);

        let mut seen = 0i64;
        let mut more = cur.first().unwrap();
        while more {
            assert_eq!(cur.key_size().unwrap(), seen);
            seen += 1;
            more = cur.next().unwrap();
        }
        assert_eq!(seen, n);
        cur.close().unwrap();
        check_clean(&mut tree, root);
        assert!(tree.page_count().unwrap() > 10);
        tree.commit().unwrap();
    }

    #[test]
    fn test_append_heavy_inserts() {
        let name = unique_name("append");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

        // Strictly increasing rowids take the append split path.
        let n = 3000i64;
        for key in 0..n {
            cur.insert(&row(key, 40), BtreeInsertFlags::APPEND).unwrap();
        }
        assert!(cur.last().unwrap());
        assert_eq!(cur.key_size().unwrap(), n - 1);
        assert!(cur.previous().unwrap());
        assert!(cur.previous().unwrap());
        assert_eq!(cur.key_size().unwrap(), n - 3);
        assert_eq!(cur.count().unwrap(), n);
        cur.close().unwrap();
        check_clean(&mut tree, root);
        tree.commit().unwrap();
    }

    #[test]
    fn test_replace_existing_entry() {
        let name = unique_name("replace");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        insert_row(&mut cur, 7, 16);
        cur.insert(
            &BtreePayload {
                key: None,
                n_key: 7,
                data: Some(vec![0x5a; 300]),
                n_zero: 0,
            },
            BtreeInsertFlags::empty(),
        )
        .unwrap();
        assert_eq!(cur.count().unwrap(), 1);
        assert_eq!(cur.table_moveto(7, false).unwrap(), 0);
        assert_eq!(cur.data().unwrap(), vec![0x5a; 300]);
        cur.close().unwrap();
        check_clean(&mut tree, root);
        tree.commit().unwrap();
    }

    #[test]
    fn test_delete_shrinks_tree() {
        let name = unique_name("delete");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        let n = 600i64;
        for key in 0..n {
            cur.insert(&row(key, 60), BtreeInsertFlags::APPEND).unwrap();
        }

        // Remove everything but a handful, odd keys first.
        for key in (1..n).step_by(2) {
            assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
            cur.delete().unwrap();
        }
        for key in (0..n - 10).step_by(2) {
            assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
            cur.delete().unwrap();
        }
        assert_eq!(cur.count().unwrap(), 5);
        let mut more = cur.first().unwrap();
        let mut keys = Vec::new();
        while more {
            keys.push(cur.key_size().unwrap());
            more = cur.next().unwrap();
        }
        assert_eq!(keys, vec![n - 10, n - 8, n - 6, n - 4, n - 2]);
        cur.close().unwrap();
        check_clean(&mut tree, root);

        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        for &key in &[n - 10, n - 8, n - 6, n - 4, n - 2] {
            assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
            cur.delete().unwrap();
        }
        assert!(!cur.first().unwrap());
        cur.close().unwrap();
        check_clean(&mut tree, root);
        tree.commit().unwrap();
    }

    #[test]
    fn test_index_tree_insert_and_delete() {
        let name = unique_name("index");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_BLOBKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

        // Enough keys for a couple of interior levels, so deletions hit
        // divider cells and promote successors.
        let n = 400u32;
        for i in 0..n {
            cur.insert(
                &BtreePayload {
                    key: Some(idx_key(i, 64)),
                    n_key: 0,
                    data: None,
                    n_zero: 0,
                },
                BtreeInsertFlags::empty(),
            )
            .unwrap();
        }
        assert_eq!(cur.count().unwrap(), n as i64);
        assert_eq!(cur.index_moveto(&idx_key(123, 64), false).unwrap(), 0);
        assert_eq!(cur.key().unwrap(), idx_key(123, 64));

        for i in 0..n {
            assert_eq!(cur.index_moveto(&idx_key(i, 64), false).unwrap(), 0);
            cur.delete().unwrap();
            if i % 50 == 0 {
                let result = tree.integrity_check(&[root], 100).unwrap();
                assert!(result.is_ok(), "integrity errors: {:?}", result.errors);
            }
        }
        assert!(!cur.first().unwrap());
        cur.close().unwrap();
        check_clean(&mut tree, root);
        tree.commit().unwrap();
    }

    #[test]
    fn test_overflow_payload_roundtrip() {
        let name = unique_name("overflow");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();

        let big: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        cur.insert(
            &BtreePayload {
                key: None,
                n_key: 1,
                data: Some(big.clone()),
                n_zero: 0,
            },
            BtreeInsertFlags::empty(),
        )
        .unwrap();
        assert_eq!(cur.table_moveto(1, false).unwrap(), 0);
        assert_eq!(cur.data_size().unwrap(), big.len() as u32);
        assert_eq!(cur.data().unwrap(), big);
        assert_eq!(cur.read_payload(9_999, 4).unwrap(), &big[9_999..10_003]);

        cur.delete().unwrap();
        cur.close().unwrap();
        check_clean(&mut tree, root);
        assert!(tree.get_meta(BTREE_FREE_PAGE_COUNT).unwrap() > 0);
        tree.commit().unwrap();
    }

    #[test]
    fn test_clear_table_counts_entries() {
        let name = unique_name("clear");
        let mut tree = open_tree(&name);
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(BTREE_INTKEY).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        for key in 0..250i64 {
            cur.insert(&row(key, 30), BtreeInsertFlags::APPEND).unwrap();
        }
        cur.close().unwrap();
        assert_eq!(tree.clear_table(root).unwrap(), 250);
        let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
        assert!(!cur.first().unwrap());
        cur.close().unwrap();
        check_clean(&mut tree, root);
        tree.commit().unwrap();
    }

    #[test]
    fn test_entries_survive_commit_and_reopen() {
        let name = unique_name("reopen");
        let root;
        {
            let mut tree = open_tree(&name);
            tree.begin_trans(true).unwrap();
            root = tree.create_table(BTREE_INTKEY).unwrap();
            let mut cur = tree.cursor(root, CursorOpenFlags::WRITABLE, None).unwrap();
            for key in 0..100i64 {
                cur.insert(&row(key, 50), BtreeInsertFlags::APPEND).unwrap();
            }
            cur.close().unwrap();
            tree.commit().unwrap();
            tree.close().unwrap();
        }
        let mut tree = open_tree(&name);
        tree.begin_trans(false).unwrap();
        let mut cur = tree.cursor(root, CursorOpenFlags::empty(), None).unwrap();
        assert_eq!(cur.count().unwrap(), 100);
        assert_eq!(cur.table_moveto(42, false).unwrap(), 0);
        assert_eq!(cur.data().unwrap(), vec![42u8; 50]);
        cur.close().unwrap();
        tree.commit().unwrap();
    }
}
