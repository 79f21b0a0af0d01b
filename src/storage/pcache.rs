//! Page cache
//!
//! Every open pager owns a `PCache` handle. The backing storage for all
//! caches lives in one process-wide group so that memory budgets and the
//! recycling order are enforced across caches: each cache keeps its own
//! page-number hash and dirty list, while clean unpinned pages of every
//! purgeable cache queue on a single shared LRU from which the next
//! allocation recycles.
//!
//! Pages cross the API boundary by value. `fetch` pins the slot and
//! copies the content out; `update` copies a modified page back in and
//! reconciles the dirty list with the new flags; `release` drops the pin.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;

use crate::types::Pgno;

/// Default page budget for a cache that never calls `set_cache_size`
pub const DEFAULT_CACHE_SIZE: usize = 2000;

/// Floor below which a cache's budget is never shrunk
const MIN_CACHE_SIZE: usize = 10;

bitflags! {
    /// Per-page state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PgFlags: u32 {
        /// Page content differs from the database file
        const DIRTY      = 0x01;
        /// Never write this page back (freed pages)
        const DONT_WRITE = 0x02;
        /// Journal must be synced before this page may be written
        const NEED_SYNC  = 0x04;
        /// Journalled; the caller may modify the content
        const WRITEABLE  = 0x08;
    }
}

/// A page as seen by the pager: number, content, state bits
#[derive(Debug, Clone)]
pub struct PgHdr {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub flags: PgFlags,
}

/// How `fetch` behaves on a cache miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Return None unless the page is already cached
    DontCreate,
    /// Create the page unless the cache is close to its budget
    CanFail,
    /// Create the page unconditionally
    Force,
}

// ============================================================================
// Shared Group
// ============================================================================

struct CacheEntry {
    cache_id: u64,
    pgno: Pgno,
    data: Vec<u8>,
    flags: PgFlags,
    n_ref: i64,
    // Shared-LRU links. Only clean, unpinned pages of purgeable caches
    // are linked.
    lru_prev: Option<usize>,
    lru_next: Option<usize>,
    // Per-cache dirty-list links, newest at the head.
    dirty_prev: Option<usize>,
    dirty_next: Option<usize>,
}

struct CacheState {
    page_size: usize,
    purgeable: bool,
    hash: HashMap<Pgno, usize>,
    n_page: usize,
    /// Pages of this cache currently on the shared LRU
    n_recyclable: usize,
    n_max: usize,
    n_min: usize,
    /// Threshold above which CanFail fetches are refused
    n90pct: usize,
    dirty_head: Option<usize>,
    dirty_tail: Option<usize>,
}

struct PGroup {
    slots: Vec<Option<CacheEntry>>,
    free_slots: Vec<usize>,
    caches: HashMap<u64, CacheState>,
    next_cache_id: u64,
    /// Most recently unpinned page
    lru_head: Option<usize>,
    /// Next recycling victim
    lru_tail: Option<usize>,
    /// Sum of n_max over purgeable caches
    n_max_page: usize,
    /// Sum of n_min over purgeable caches
    n_min_page: usize,
    /// Current page count across purgeable caches
    n_purgeable: usize,
}

lazy_static::lazy_static! {
    static ref GROUP: Mutex<PGroup> = Mutex::new(PGroup {
        slots: Vec::new(),
        free_slots: Vec::new(),
        caches: HashMap::new(),
        next_cache_id: 1,
        lru_head: None,
        lru_tail: None,
        n_max_page: 0,
        n_min_page: 0,
        n_purgeable: 0,
    });
}

fn group() -> MutexGuard<'static, PGroup> {
    match GROUP.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PGroup {
    fn alloc_slot(&mut self, entry: CacheEntry) -> usize {
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn free_slot(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.free_slots.push(slot);
    }

    // ---- shared LRU ----

    fn lru_push_head(&mut self, slot: usize) {
        let old_head = self.lru_head;
        if let Some(e) = self.slots[slot].as_mut() {
            e.lru_prev = None;
            e.lru_next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(e) = self.slots[h].as_mut() {
                e.lru_prev = Some(slot);
            }
        }
        self.lru_head = Some(slot);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(slot);
        }
        if let Some(id) = self.slots[slot].as_ref().map(|e| e.cache_id) {
            if let Some(c) = self.caches.get_mut(&id) {
                c.n_recyclable += 1;
            }
        }
    }

    fn lru_unlink(&mut self, slot: usize) {
        let (prev, next, cache_id) = match self.slots[slot].as_ref() {
            Some(e) => (e.lru_prev, e.lru_next, e.cache_id),
            None => return,
        };
        if prev.is_none() && next.is_none() && self.lru_head != Some(slot) {
            // Never linked (non-purgeable caches skip the LRU).
            return;
        }
        match prev {
            Some(p) => {
                if let Some(e) = self.slots[p].as_mut() {
                    e.lru_next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.slots[n].as_mut() {
                    e.lru_prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
        if let Some(e) = self.slots[slot].as_mut() {
            e.lru_prev = None;
            e.lru_next = None;
        }
        if let Some(c) = self.caches.get_mut(&cache_id) {
            c.n_recyclable = c.n_recyclable.saturating_sub(1);
        }
    }

    // ---- per-cache dirty list ----

    fn dirty_push_head(&mut self, cache_id: u64, slot: usize) {
        let old_head = self.caches.get(&cache_id).and_then(|c| c.dirty_head);
        if let Some(e) = self.slots[slot].as_mut() {
            e.dirty_prev = None;
            e.dirty_next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(e) = self.slots[h].as_mut() {
                e.dirty_prev = Some(slot);
            }
        }
        if let Some(c) = self.caches.get_mut(&cache_id) {
            c.dirty_head = Some(slot);
            if c.dirty_tail.is_none() {
                c.dirty_tail = Some(slot);
            }
        }
    }

    fn dirty_unlink(&mut self, cache_id: u64, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(e) => (e.dirty_prev, e.dirty_next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.slots[p].as_mut() {
                    e.dirty_next = next;
                }
            }
            None => {
                if let Some(c) = self.caches.get_mut(&cache_id) {
                    c.dirty_head = next;
                }
            }
        }
        match next {
            Some(n) => {
                if let Some(e) = self.slots[n].as_mut() {
                    e.dirty_prev = prev;
                }
            }
            None => {
                if let Some(c) = self.caches.get_mut(&cache_id) {
                    c.dirty_tail = prev;
                }
            }
        }
        if let Some(e) = self.slots[slot].as_mut() {
            e.dirty_prev = None;
            e.dirty_next = None;
        }
    }

    /// Detach a page from its cache entirely and free the slot.
    fn discard(&mut self, slot: usize) {
        let (cache_id, pgno, dirty, unpinned_clean) = match self.slots[slot].as_ref() {
            Some(e) => (
                e.cache_id,
                e.pgno,
                e.flags.contains(PgFlags::DIRTY),
                e.n_ref == 0 && !e.flags.contains(PgFlags::DIRTY),
            ),
            None => return,
        };
        if dirty {
            self.dirty_unlink(cache_id, slot);
        } else if unpinned_clean {
            self.lru_unlink(slot);
        }
        if let Some(c) = self.caches.get_mut(&cache_id) {
            c.hash.remove(&pgno);
            c.n_page = c.n_page.saturating_sub(1);
            if c.purgeable {
                self.n_purgeable = self.n_purgeable.saturating_sub(1);
            }
        }
        self.free_slot(slot);
    }

    /// Free LRU victims until the purgeable page count is back inside
    /// the group budget.
    fn enforce_budget(&mut self) {
        while self.n_purgeable > self.n_max_page {
            match self.lru_tail {
                Some(victim) => self.discard(victim),
                None => break,
            }
        }
    }
}

// ============================================================================
// Cache Handle
// ============================================================================

/// Handle onto one page cache inside the shared group
pub struct PCache {
    id: u64,
}

impl PCache {
    /// Open a new cache for pages of the given size. Non-purgeable
    /// caches (in-memory databases) are exempt from recycling.
    pub fn open(page_size: usize, purgeable: bool) -> Self {
        let mut grp = group();
        let id = grp.next_cache_id;
        grp.next_cache_id += 1;

        let n_max = DEFAULT_CACHE_SIZE;
        grp.caches.insert(
            id,
            CacheState {
                page_size,
                purgeable,
                hash: HashMap::new(),
                n_page: 0,
                n_recyclable: 0,
                n_max,
                n_min: MIN_CACHE_SIZE,
                n90pct: n_max * 9 / 10,
                dirty_head: None,
                dirty_tail: None,
            },
        );
        if purgeable {
            grp.n_max_page += n_max;
            grp.n_min_page += MIN_CACHE_SIZE;
        }
        Self { id }
    }

    /// Change the page budget and evict down to it if necessary.
    pub fn set_cache_size(&self, n_max: usize) {
        let n_max = n_max.max(MIN_CACHE_SIZE);
        let mut grp = group();
        let (old, purgeable) = match grp.caches.get_mut(&self.id) {
            Some(c) => {
                let old = c.n_max;
                c.n_max = n_max;
                c.n90pct = n_max * 9 / 10;
                (old, c.purgeable)
            }
            None => return,
        };
        if purgeable {
            grp.n_max_page = grp.n_max_page + n_max - old;
            grp.enforce_budget();
        }
    }

    /// Change the page size. Drops every cached page.
    pub fn set_page_size(&self, page_size: usize) {
        let mut grp = group();
        let slots: Vec<usize> = match grp.caches.get(&self.id) {
            Some(c) => c.hash.values().copied().collect(),
            None => return,
        };
        for slot in slots {
            grp.discard(slot);
        }
        if let Some(c) = grp.caches.get_mut(&self.id) {
            c.page_size = page_size;
        }
    }

    /// Look up a page, pinning it on a hit. On a miss with a create mode,
    /// recycle the coldest clean page in the group or allocate fresh.
    /// Newly created pages come back zeroed and clean.
    pub fn fetch(&self, pgno: Pgno, mode: CreateMode) -> Option<PgHdr> {
        let mut grp = group();

        if let Some(&slot) = grp.caches.get(&self.id).and_then(|c| c.hash.get(&pgno)) {
            let unpinned_clean = grp.slots[slot]
                .as_ref()
                .map(|e| e.n_ref == 0 && !e.flags.contains(PgFlags::DIRTY))
                .unwrap_or(false);
            if unpinned_clean {
                grp.lru_unlink(slot);
            }
            let entry = grp.slots[slot].as_mut()?;
            entry.n_ref += 1;
            return Some(PgHdr {
                pgno,
                data: entry.data.clone(),
                flags: entry.flags,
            });
        }

        if mode == CreateMode::DontCreate {
            return None;
        }

        let (page_size, purgeable, n_page, n_recyclable, n_max, n90pct) =
            match grp.caches.get(&self.id) {
                Some(c) => (
                    c.page_size,
                    c.purgeable,
                    c.n_page,
                    c.n_recyclable,
                    c.n_max,
                    c.n90pct,
                ),
                None => return None,
            };

        if mode == CreateMode::CanFail && purgeable {
            let n_pinned = n_page - n_recyclable;
            let mx_pinned = grp.n_max_page + 10 - grp.n_min_page;
            if n_pinned >= mx_pinned || n_pinned >= n90pct {
                return None;
            }
        }

        // Recycle the group-wide coldest clean page once this cache is at
        // its budget or the group as a whole is over.
        let mut reuse: Option<usize> = None;
        if purgeable && (n_page + 1 >= n_max || grp.n_purgeable >= grp.n_max_page) {
            if let Some(victim) = grp.lru_tail {
                let same_size = grp.slots[victim]
                    .as_ref()
                    .and_then(|e| grp.caches.get(&e.cache_id))
                    .map(|c| c.page_size == page_size)
                    .unwrap_or(false);
                if same_size {
                    // Detach from the old cache but keep the buffer.
                    let (old_cache, old_pgno) = match grp.slots[victim].as_ref() {
                        Some(e) => (e.cache_id, e.pgno),
                        None => (0, 0),
                    };
                    grp.lru_unlink(victim);
                    if let Some(c) = grp.caches.get_mut(&old_cache) {
                        c.hash.remove(&old_pgno);
                        c.n_page -= 1;
                    }
                    grp.n_purgeable = grp.n_purgeable.saturating_sub(1);
                    reuse = Some(victim);
                } else {
                    grp.discard(victim);
                }
            }
        }

        let slot = match reuse {
            Some(slot) => {
                if let Some(e) = grp.slots[slot].as_mut() {
                    e.cache_id = self.id;
                    e.pgno = pgno;
                    e.data.fill(0);
                    e.flags = PgFlags::empty();
                    e.n_ref = 1;
                }
                slot
            }
            None => grp.alloc_slot(CacheEntry {
                cache_id: self.id,
                pgno,
                data: vec![0u8; page_size],
                flags: PgFlags::empty(),
                n_ref: 1,
                lru_prev: None,
                lru_next: None,
                dirty_prev: None,
                dirty_next: None,
            }),
        };

        if let Some(c) = grp.caches.get_mut(&self.id) {
            c.hash.insert(pgno, slot);
            c.n_page += 1;
        }
        if purgeable {
            grp.n_purgeable += 1;
        }

        Some(PgHdr {
            pgno,
            data: vec![0u8; page_size],
            flags: PgFlags::empty(),
        })
    }

    /// Drop one pin. An unpinned clean page joins the shared LRU, or is
    /// freed outright when the group is over budget.
    pub fn release(&self, pgno: Pgno) {
        let mut grp = group();
        let slot = match grp.caches.get(&self.id).and_then(|c| c.hash.get(&pgno)) {
            Some(&slot) => slot,
            None => return,
        };
        let purgeable = grp.caches.get(&self.id).map(|c| c.purgeable).unwrap_or(false);
        let (now_unpinned, dirty) = match grp.slots[slot].as_mut() {
            Some(e) => {
                if e.n_ref > 0 {
                    e.n_ref -= 1;
                }
                (e.n_ref == 0, e.flags.contains(PgFlags::DIRTY))
            }
            None => return,
        };
        if now_unpinned && !dirty && purgeable {
            if grp.n_purgeable > grp.n_max_page {
                grp.discard(slot);
            } else {
                grp.lru_push_head(slot);
            }
        }
    }

    /// Copy a modified page back into its slot. The flags decide dirty
    /// list membership; content and state always move together.
    pub fn update(&self, page: &PgHdr) {
        let mut grp = group();
        let slot = match grp
            .caches
            .get(&self.id)
            .and_then(|c| c.hash.get(&page.pgno))
        {
            Some(&slot) => slot,
            None => return,
        };
        let was_dirty = match grp.slots[slot].as_mut() {
            Some(e) => {
                let was = e.flags.contains(PgFlags::DIRTY);
                e.data.clear();
                e.data.extend_from_slice(&page.data);
                e.flags = page.flags;
                was
            }
            None => return,
        };
        let now_dirty = page.flags.contains(PgFlags::DIRTY);
        if now_dirty && !was_dirty {
            self.became_dirty(&mut grp, slot);
        } else if was_dirty && !now_dirty {
            self.became_clean(&mut grp, slot);
        }
    }

    fn became_dirty(&self, grp: &mut PGroup, slot: usize) {
        let unpinned = grp.slots[slot].as_ref().map(|e| e.n_ref == 0).unwrap_or(false);
        if unpinned {
            grp.lru_unlink(slot);
        }
        self.dirty_link(grp, slot);
    }

    fn dirty_link(&self, grp: &mut PGroup, slot: usize) {
        grp.dirty_push_head(self.id, slot);
    }

    fn became_clean(&self, grp: &mut PGroup, slot: usize) {
        grp.dirty_unlink(self.id, slot);
        let (unpinned, purgeable) = (
            grp.slots[slot].as_ref().map(|e| e.n_ref == 0).unwrap_or(false),
            grp.caches.get(&self.id).map(|c| c.purgeable).unwrap_or(false),
        );
        if unpinned && purgeable {
            grp.lru_push_head(slot);
        }
    }

    /// Mark a page dirty without changing its content.
    pub fn mark_dirty(&self, pgno: Pgno) {
        let mut grp = group();
        let slot = match grp.caches.get(&self.id).and_then(|c| c.hash.get(&pgno)) {
            Some(&slot) => slot,
            None => return,
        };
        let was_dirty = match grp.slots[slot].as_mut() {
            Some(e) => {
                let was = e.flags.contains(PgFlags::DIRTY);
                e.flags.insert(PgFlags::DIRTY);
                was
            }
            None => return,
        };
        if !was_dirty {
            self.became_dirty(&mut grp, slot);
        }
    }

    /// Clear the dirty state of a page after it reaches the database file.
    pub fn make_clean(&self, pgno: Pgno) {
        let mut grp = group();
        let slot = match grp.caches.get(&self.id).and_then(|c| c.hash.get(&pgno)) {
            Some(&slot) => slot,
            None => return,
        };
        let was_dirty = match grp.slots[slot].as_mut() {
            Some(e) => {
                let was = e.flags.contains(PgFlags::DIRTY);
                e.flags
                    .remove(PgFlags::DIRTY | PgFlags::NEED_SYNC | PgFlags::WRITEABLE);
                was
            }
            None => return,
        };
        if was_dirty {
            self.became_clean(&mut grp, slot);
        }
    }

    /// Clean every dirty page at once (transaction commit or rollback).
    pub fn clean_all(&self) {
        loop {
            let pgno = {
                let grp = group();
                match grp
                    .caches
                    .get(&self.id)
                    .and_then(|c| c.dirty_head)
                    .and_then(|slot| grp.slots[slot].as_ref())
                {
                    Some(e) => e.pgno,
                    None => break,
                }
            };
            self.make_clean(pgno);
        }
    }

    /// Remove NEED_SYNC from every dirty page after a journal sync.
    pub fn clear_sync_flags(&self) {
        let mut grp = group();
        let mut slot = grp.caches.get(&self.id).and_then(|c| c.dirty_head);
        while let Some(s) = slot {
            let next = match grp.slots[s].as_mut() {
                Some(e) => {
                    e.flags.remove(PgFlags::NEED_SYNC);
                    e.dirty_next
                }
                None => None,
            };
            slot = next;
        }
    }

    /// Remove one page regardless of state.
    pub fn drop_page(&self, pgno: Pgno) {
        let mut grp = group();
        if let Some(&slot) = grp.caches.get(&self.id).and_then(|c| c.hash.get(&pgno)) {
            grp.discard(slot);
        }
    }

    /// Discard every page numbered above `pgno_limit`.
    pub fn truncate(&self, pgno_limit: Pgno) {
        let mut grp = group();
        let doomed: Vec<usize> = match grp.caches.get(&self.id) {
            Some(c) => c
                .hash
                .iter()
                .filter(|(&p, _)| p > pgno_limit)
                .map(|(_, &slot)| slot)
                .collect(),
            None => return,
        };
        for slot in doomed {
            grp.discard(slot);
        }
    }

    /// Snapshot of the dirty list, sorted by page number for sequential
    /// write-back.
    pub fn dirty_pages(&self) -> Vec<PgHdr> {
        let grp = group();
        let mut pages = Vec::new();
        let mut slot = grp.caches.get(&self.id).and_then(|c| c.dirty_head);
        while let Some(s) = slot {
            match grp.slots[s].as_ref() {
                Some(e) => {
                    pages.push(PgHdr {
                        pgno: e.pgno,
                        data: e.data.clone(),
                        flags: e.flags,
                    });
                    slot = e.dirty_next;
                }
                None => break,
            }
        }
        pages.sort_by_key(|p| p.pgno);
        pages
    }

    /// Oldest dirty page that can be written without a journal sync, if
    /// any. Used to spill the cache under memory pressure.
    pub fn spill_candidate(&self) -> Option<PgHdr> {
        let grp = group();
        let mut slot = grp.caches.get(&self.id).and_then(|c| c.dirty_tail);
        while let Some(s) = slot {
            match grp.slots[s].as_ref() {
                Some(e) => {
                    if !e.flags.contains(PgFlags::NEED_SYNC) && e.n_ref == 0 {
                        return Some(PgHdr {
                            pgno: e.pgno,
                            data: e.data.clone(),
                            flags: e.flags,
                        });
                    }
                    slot = e.dirty_prev;
                }
                None => break,
            }
        }
        None
    }

    /// Number of resident pages
    pub fn page_count(&self) -> usize {
        group().caches.get(&self.id).map(|c| c.n_page).unwrap_or(0)
    }

    /// Number of dirty pages
    pub fn dirty_count(&self) -> usize {
        let grp = group();
        let mut n = 0;
        let mut slot = grp.caches.get(&self.id).and_then(|c| c.dirty_head);
        while let Some(s) = slot {
            n += 1;
            slot = grp.slots[s].as_ref().and_then(|e| e.dirty_next);
        }
        n
    }

    /// Pin count of one page
    pub fn page_refs(&self, pgno: Pgno) -> i64 {
        let grp = group();
        grp.caches
            .get(&self.id)
            .and_then(|c| c.hash.get(&pgno))
            .and_then(|&slot| grp.slots[slot].as_ref())
            .map(|e| e.n_ref)
            .unwrap_or(0)
    }

    /// Sum of all pins in this cache
    pub fn ref_count(&self) -> i64 {
        let grp = group();
        match grp.caches.get(&self.id) {
            Some(c) => c
                .hash
                .values()
                .filter_map(|&slot| grp.slots[slot].as_ref())
                .map(|e| e.n_ref)
                .sum(),
            None => 0,
        }
    }
}

impl Drop for PCache {
    fn drop(&mut self) {
        let mut grp = group();
        let slots: Vec<usize> = match grp.caches.get(&self.id) {
            Some(c) => c.hash.values().copied().collect(),
            None => return,
        };
        for slot in slots {
            grp.discard(slot);
        }
        if let Some(c) = grp.caches.remove(&self.id) {
            if c.purgeable {
                grp.n_max_page = grp.n_max_page.saturating_sub(c.n_max);
                grp.n_min_page = grp.n_min_page.saturating_sub(c.n_min);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 512;

    fn filled(cache: &PCache, pgno: Pgno, byte: u8) -> PgHdr {
        let mut page = cache.fetch(pgno, CreateMode::Force).unwrap();
        page.data.fill(byte);
        cache.update(&page);
        page
    }

    #[test]
    fn test_miss_without_create() {
        let cache = PCache::open(PAGE_SIZE, true);
        assert!(
            cache.fetch(1, CreateMode::DontCreate).is_none(),
            "empty cache must miss"
        );
        assert_eq!(cache.page_count(), 0);
    }

    #[test]
    fn test_fetch_pins_and_release_unpins() {
        let cache = PCache::open(PAGE_SIZE, true);
        let page = cache.fetch(7, CreateMode::Force).unwrap();
        assert_eq!(page.pgno, 7);
        assert_eq!(page.data.len(), PAGE_SIZE);
        assert_eq!(cache.page_refs(7), 1);

        let _again = cache.fetch(7, CreateMode::DontCreate).unwrap();
        assert_eq!(cache.page_refs(7), 2);

        cache.release(7);
        cache.release(7);
        assert_eq!(cache.page_refs(7), 0);
        cache.release(7);
        assert_eq!(cache.page_refs(7), 0, "pin count must not go negative");
        assert_eq!(cache.page_count(), 1, "unpinned page stays resident");
    }

    #[test]
    fn test_update_roundtrip() {
        let cache = PCache::open(PAGE_SIZE, true);
        filled(&cache, 3, 0xAB);
        cache.release(3);

        let back = cache.fetch(3, CreateMode::DontCreate).unwrap();
        assert!(back.data.iter().all(|&b| b == 0xAB));
        cache.release(3);
    }

    #[test]
    fn test_cache_size_limit_enforced() {
        let cache = PCache::open(PAGE_SIZE, true);
        cache.set_cache_size(10);
        for pgno in 1..=30 {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.release(pgno);
        }
        assert!(
            cache.page_count() <= 10,
            "resident pages exceed the budget: {}",
            cache.page_count()
        );
    }

    #[test]
    fn test_eviction_follows_lru_order() {
        let cache = PCache::open(PAGE_SIZE, true);
        cache.set_cache_size(MIN_CACHE_SIZE);
        for pgno in 1..=10 {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.release(pgno);
        }
        // Touch page 1 so page 2 becomes the coldest.
        cache.fetch(1, CreateMode::DontCreate).unwrap();
        cache.release(1);

        cache.fetch(11, CreateMode::Force).unwrap();
        cache.release(11);

        assert!(
            cache.fetch(2, CreateMode::DontCreate).is_none(),
            "the coldest page must be the one recycled"
        );
        assert!(cache.fetch(1, CreateMode::DontCreate).is_some());
        cache.release(1);
    }

    #[test]
    fn test_pinned_pages_never_recycled() {
        let cache = PCache::open(PAGE_SIZE, true);
        cache.set_cache_size(MIN_CACHE_SIZE);
        let _pinned = cache.fetch(1, CreateMode::Force).unwrap();
        for pgno in 2..=30 {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.release(pgno);
        }
        assert!(
            cache.fetch(1, CreateMode::DontCreate).is_some(),
            "a pinned page must survive any amount of cache pressure"
        );
    }

    #[test]
    fn test_dirty_pages_not_recycled_and_sorted() {
        let cache = PCache::open(PAGE_SIZE, true);
        cache.set_cache_size(MIN_CACHE_SIZE);
        for &pgno in &[9, 2, 5] {
            let mut page = cache.fetch(pgno, CreateMode::Force).unwrap();
            page.flags.insert(PgFlags::DIRTY);
            cache.update(&page);
            cache.release(pgno);
        }
        for pgno in 20..=40 {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.release(pgno);
        }

        let dirty: Vec<Pgno> = cache.dirty_pages().iter().map(|p| p.pgno).collect();
        assert_eq!(dirty, vec![2, 5, 9], "dirty list is complete and sorted");
    }

    #[test]
    fn test_clean_all_moves_pages_to_lru() {
        let cache = PCache::open(PAGE_SIZE, true);
        for &pgno in &[1, 2, 3] {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.mark_dirty(pgno);
            cache.release(pgno);
        }
        assert_eq!(cache.dirty_count(), 3);

        cache.clean_all();
        assert_eq!(cache.dirty_count(), 0);
        let page = cache.fetch(2, CreateMode::DontCreate).unwrap();
        assert!(!page.flags.contains(PgFlags::DIRTY));
        cache.release(2);
    }

    #[test]
    fn test_truncate_discards_above_limit() {
        let cache = PCache::open(PAGE_SIZE, true);
        for pgno in 1..=8 {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.release(pgno);
        }
        cache.truncate(5);
        assert_eq!(cache.page_count(), 5);
        assert!(cache.fetch(6, CreateMode::DontCreate).is_none());
        assert!(cache.fetch(5, CreateMode::DontCreate).is_some());
        cache.release(5);
    }

    #[test]
    fn test_spill_candidate_skips_need_sync() {
        let cache = PCache::open(PAGE_SIZE, true);
        let mut a = cache.fetch(1, CreateMode::Force).unwrap();
        a.flags.insert(PgFlags::DIRTY | PgFlags::NEED_SYNC);
        cache.update(&a);
        cache.release(1);

        let mut b = cache.fetch(2, CreateMode::Force).unwrap();
        b.flags.insert(PgFlags::DIRTY);
        cache.update(&b);
        cache.release(2);

        let spill = cache.spill_candidate().unwrap();
        assert_eq!(spill.pgno, 2, "NEED_SYNC pages cannot spill");

        cache.clear_sync_flags();
        let spill = cache.spill_candidate().unwrap();
        assert_eq!(spill.pgno, 1, "after a sync the oldest dirty page spills");
    }

    #[test]
    fn test_budget_shared_across_caches() {
        let a = PCache::open(PAGE_SIZE, true);
        let b = PCache::open(PAGE_SIZE, true);
        a.set_cache_size(MIN_CACHE_SIZE);
        b.set_cache_size(MIN_CACHE_SIZE);

        for pgno in 1..=10 {
            a.fetch(pgno, CreateMode::Force).unwrap();
            a.release(pgno);
        }
        for pgno in 1..=10 {
            b.fetch(pgno, CreateMode::Force).unwrap();
            b.release(pgno);
        }
        // B at its budget recycles the group-wide coldest page, which
        // belongs to A.
        b.fetch(11, CreateMode::Force).unwrap();
        b.release(11);

        assert!(
            a.page_count() < 10,
            "the victim must come from the cache holding the coldest page"
        );
    }

    #[test]
    fn test_non_purgeable_cache_never_evicts() {
        let cache = PCache::open(PAGE_SIZE, false);
        cache.set_cache_size(MIN_CACHE_SIZE);
        for pgno in 1..=50 {
            cache.fetch(pgno, CreateMode::Force).unwrap();
            cache.release(pgno);
        }
        assert_eq!(
            cache.page_count(),
            50,
            "an in-memory database keeps every page"
        );
    }

    #[test]
    fn test_drop_page() {
        let cache = PCache::open(PAGE_SIZE, true);
        cache.fetch(4, CreateMode::Force).unwrap();
        cache.mark_dirty(4);
        cache.drop_page(4);
        assert_eq!(cache.page_count(), 0);
        assert_eq!(cache.dirty_count(), 0);
    }
}
