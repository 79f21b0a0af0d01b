//! B-tree constants, flag sets, and small shared types
//!
//! Everything here mirrors the single-file database format: page-type
//! flag bytes, the 100-byte file header, the btree meta slots stored in
//! that header, pointer-map entry types, and the cursor / transaction
//! state enums used across the module.

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::encoding::{read_u16, read_u32};
use crate::types::Pgno;

// ============================================================================
// Page type flags (the first byte of every btree page header)
// ============================================================================

/// Cell payloads are rowids; real data lives on leaves.
pub const PTF_INTKEY: u8 = 0x01;
/// Cells carry keys only, no data (index trees).
pub const PTF_ZERODATA: u8 = 0x02;
/// Data is stored on leaf pages only.
pub const PTF_LEAFDATA: u8 = 0x04;
/// The page is a leaf (no child pointers).
pub const PTF_LEAF: u8 = 0x08;

/// Table (rowid) leaf page: 0x0d.
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
/// Table (rowid) interior page: 0x05.
pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
/// Index leaf page: 0x0a.
pub const PTF_INDEX_LEAF: u8 = PTF_ZERODATA | PTF_LEAF;
/// Index interior page: 0x02.
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;

/// Page header bytes on a leaf page (no rightmost child pointer).
pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
/// Page header bytes on an interior page (includes rightmost pointer).
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;

// ============================================================================
// Page geometry
// ============================================================================

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 65536;
/// Default page size for newly created databases.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Fraction limits baked into byte offsets 21..23 of the file header.
/// Files carrying any other values are rejected.
pub const MAX_EMBEDDED_FRACTION: u8 = 64;
pub const MIN_EMBEDDED_FRACTION: u8 = 32;
pub const LEAF_FRACTION: u8 = 32;

/// A usable size below this cannot hold a worst-case cell.
pub const MIN_USABLE_SIZE: u32 = 480;

/// Maximum depth of any cursor page stack. Deeper trees are treated
/// as corrupt.
pub const CURSOR_MAX_DEPTH: usize = 20;

// ============================================================================
// Tree kinds and vacuum modes
// ============================================================================

/// Rowid-keyed table tree (intkey + leafdata).
pub const BTREE_INTKEY: u8 = 1;
/// Index tree keyed by opaque byte records (zerodata).
pub const BTREE_BLOBKEY: u8 = 2;

pub const BTREE_AUTOVACUUM_NONE: u8 = 0;
pub const BTREE_AUTOVACUUM_FULL: u8 = 1;
pub const BTREE_AUTOVACUUM_INCR: u8 = 2;

// ============================================================================
// Meta values stored in the file header at offset 36 + 4*idx
// ============================================================================

pub const BTREE_FREE_PAGE_COUNT: usize = 0;
pub const BTREE_SCHEMA_VERSION: usize = 1;
pub const BTREE_FILE_FORMAT: usize = 2;
pub const BTREE_DEFAULT_CACHE_SIZE: usize = 3;
pub const BTREE_LARGEST_ROOT_PAGE: usize = 4;
pub const BTREE_TEXT_ENCODING: usize = 5;
pub const BTREE_USER_VERSION: usize = 6;
pub const BTREE_INCR_VACUUM: usize = 7;
pub const BTREE_APPLICATION_ID: usize = 8;
pub const BTREE_DATA_VERSION: usize = 15;

/// Number of addressable meta slots.
pub const N_BTREE_META: usize = 16;

// ============================================================================
// Pointer map entry types (auto-vacuum only)
// ============================================================================

/// The page is a btree root; it has no parent.
pub const PTRMAP_ROOTPAGE: u8 = 1;
/// The page is on the freelist.
pub const PTRMAP_FREEPAGE: u8 = 2;
/// First page of an overflow chain; parent is the btree page whose
/// cell points at it.
pub const PTRMAP_OVERFLOW1: u8 = 3;
/// Later page of an overflow chain; parent is the preceding overflow page.
pub const PTRMAP_OVERFLOW2: u8 = 4;
/// Non-root btree page; parent is the interior page pointing at it.
pub const PTRMAP_BTREE: u8 = 5;

// ============================================================================
// File header
// ============================================================================

/// The 16-byte magic string at the start of every database file.
pub const FILE_HEADER: [u8; 16] = *b"SQLite format 3\0";

/// Size of the file header occupying the start of page 1.
pub const FILE_HEADER_SIZE: usize = 100;

// ============================================================================
// Flag sets
// ============================================================================

bitflags! {
    /// Flags accepted by [`super::Btree::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeOpenFlags: u8 {
        /// Skip the rollback journal entirely.
        const OMIT_JOURNAL = 0x01;
        /// In-memory database, discarded on close.
        const MEMORY       = 0x02;
        /// This handle serves a single-use ephemeral tree.
        const SINGLE       = 0x04;
        /// Never share this handle's page cache even when the global
        /// shared-cache mode is on.
        const UNSHARABLE   = 0x08;
    }

    /// State bits on the shared btree structure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtsFlags: u16 {
        /// The underlying file cannot be written.
        const READ_ONLY      = 0x0001;
        /// The page size may no longer change (page 1 has been read or
        /// written).
        const PAGESIZE_FIXED = 0x0002;
        /// Database file was empty at open; a new header is pending.
        const INITIALLY_EMPTY = 0x0008;
    }

    /// Flags accepted by [`super::Btree::cursor`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorOpenFlags: u8 {
        /// The cursor may insert and delete.
        const WRITABLE = 0x01;
    }

    /// Flags accepted by [`super::BtCursor::insert`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeInsertFlags: u8 {
        /// The new key is likely larger than every existing key; bias
        /// the seek toward the right edge.
        const APPEND = 0x08;
    }
}

// ============================================================================
// Transaction and lock enums
// ============================================================================

/// Transaction state of one handle. The shared structure tracks the
/// strongest state across all of its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TransState {
    #[default]
    None,
    Read,
    Write,
}

/// Kind of a shared-cache table lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtLock {
    Read,
    Write,
}

/// Lifecycle of a cursor's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    /// Pointing at an entry; the page stack is trustworthy.
    #[default]
    Valid,
    /// Not pointing at anything (fresh cursor, or the tree is empty).
    Invalid,
    /// Valid position, but the entry it pointed at is gone; `skip_next`
    /// says which direction of travel is already satisfied.
    SkipNext,
    /// The tree changed underneath this cursor; it must reseek from its
    /// saved key before the position can be used.
    RequireSeek,
    /// The transaction this cursor belonged to was rolled back.
    Fault,
}

/// One shared-cache table lock held by a handle.
#[derive(Debug, Clone)]
pub struct TableLockEntry {
    /// Root page of the locked tree.
    pub table: Pgno,
    /// Identity of the handle owning the lock.
    pub owner: u64,
    pub lock: BtLock,
}

// ============================================================================
// Key comparison for index trees
// ============================================================================

/// Ordering of the opaque byte records stored in index trees.
///
/// Table trees order by rowid and never consult a comparator.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;
}

/// Plain memcmp ordering; the default when a cursor is opened without
/// a comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }
}

// ============================================================================
// Page geometry helper
// ============================================================================

/// Geometry of one page: total size, usable size, and where the btree
/// page header starts (page 1 gives up its first 100 bytes to the file
/// header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: u32,
    pub usable_size: u32,
    header_offset: usize,
}

impl PageLimits {
    pub fn new(page_size: u32, usable_size: u32) -> Self {
        PageLimits {
            page_size,
            usable_size,
            header_offset: 0,
        }
    }

    pub fn for_page1(page_size: u32, usable_size: u32) -> Self {
        PageLimits {
            page_size,
            usable_size,
            header_offset: FILE_HEADER_SIZE,
        }
    }

    pub fn for_pgno(pgno: Pgno, page_size: u32, usable_size: u32) -> Self {
        if pgno == 1 {
            Self::for_page1(page_size, usable_size)
        } else {
            Self::new(page_size, usable_size)
        }
    }

    /// Offset of the btree page header within the page buffer.
    pub fn header_start(&self) -> usize {
        self.header_offset
    }

    /// One past the last usable byte.
    pub fn usable_end(&self) -> usize {
        self.usable_size as usize
    }
}

// ============================================================================
// Parsed file header
// ============================================================================

/// Fields of the 100-byte file header needed to bring a database up.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: u32,
    pub reserve: u8,
    pub write_version: u8,
    pub read_version: u8,
    pub change_counter: u32,
    pub freelist_trunk: Pgno,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub largest_root: Pgno,
    pub incr_vacuum: bool,
}

impl DbHeader {
    /// Parse and validate a file header. `buf` must hold at least the
    /// first 100 bytes of page 1.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        if buf[..16] != FILE_HEADER {
            return Err(Error::new(ErrorCode::NotADb));
        }

        // A stored value of 1 means 65536.
        let raw = read_u16(buf, 16).unwrap_or(0) as u32;
        let page_size = if raw == 1 { MAX_PAGE_SIZE } else { raw };
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
            || !page_size.is_power_of_two()
        {
            return Err(Error::new(ErrorCode::NotADb));
        }

        let write_version = buf[18];
        let read_version = buf[19];
        if read_version > 2 {
            return Err(Error::new(ErrorCode::NotADb));
        }

        let reserve = buf[20];
        if page_size.saturating_sub(reserve as u32) < MIN_USABLE_SIZE {
            return Err(Error::new(ErrorCode::NotADb));
        }

        if buf[21] != MAX_EMBEDDED_FRACTION
            || buf[22] != MIN_EMBEDDED_FRACTION
            || buf[23] != LEAF_FRACTION
        {
            return Err(Error::new(ErrorCode::NotADb));
        }

        Ok(DbHeader {
            page_size,
            reserve,
            write_version,
            read_version,
            change_counter: read_u32(buf, 24).unwrap_or(0),
            freelist_trunk: read_u32(buf, 32).unwrap_or(0),
            freelist_count: read_u32(buf, 36).unwrap_or(0),
            schema_cookie: read_u32(buf, 40).unwrap_or(0),
            largest_root: read_u32(buf, 36 + 4 * BTREE_LARGEST_ROOT_PAGE).unwrap_or(0),
            incr_vacuum: read_u32(buf, 36 + 4 * BTREE_INCR_VACUUM).unwrap_or(0) != 0,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header(page_size: u16) -> Vec<u8> {
        let mut h = vec![0u8; FILE_HEADER_SIZE];
        h[..16].copy_from_slice(&FILE_HEADER);
        h[16..18].copy_from_slice(&page_size.to_be_bytes());
        h[18] = 1;
        h[19] = 1;
        h[21] = MAX_EMBEDDED_FRACTION;
        h[22] = MIN_EMBEDDED_FRACTION;
        h[23] = LEAF_FRACTION;
        h
    }

    #[test]
    fn test_page_type_flag_bytes() {
        assert_eq!(PTF_TABLE_LEAF, 0x0d);
        assert_eq!(PTF_TABLE_INTERIOR, 0x05);
        assert_eq!(PTF_INDEX_LEAF, 0x0a);
        assert_eq!(PTF_INDEX_INTERIOR, 0x02);
    }

    #[test]
    fn test_header_parse_round_trip() {
        let h = valid_header(4096);
        let parsed = DbHeader::parse(&h).unwrap();
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.reserve, 0);
        assert_eq!(parsed.freelist_trunk, 0);
    }

    #[test]
    fn test_header_page_size_one_means_64k() {
        let h = valid_header(1);
        let parsed = DbHeader::parse(&h).unwrap();
        assert_eq!(parsed.page_size, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut h = valid_header(4096);
        h[0] = b'X';
        let err = DbHeader::parse(&h).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotADb);
    }

    #[test]
    fn test_header_rejects_non_power_of_two() {
        let h = valid_header(3000);
        assert!(DbHeader::parse(&h).is_err());
    }

    #[test]
    fn test_header_rejects_wrong_fractions() {
        let mut h = valid_header(4096);
        h[21] = 65;
        assert!(DbHeader::parse(&h).is_err());
    }

    #[test]
    fn test_page1_limits_reserve_header_room() {
        let p1 = PageLimits::for_page1(4096, 4096);
        let p2 = PageLimits::new(4096, 4096);
        assert_eq!(p1.header_start(), FILE_HEADER_SIZE);
        assert_eq!(p2.header_start(), 0);
        assert_eq!(p1.usable_end(), 4096);
    }

    #[test]
    fn test_bytewise_comparator() {
        let c = BytewiseComparator;
        assert_eq!(c.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(c.compare(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(c.compare(b"abcd", b"abc"), Ordering::Greater);
    }
}
