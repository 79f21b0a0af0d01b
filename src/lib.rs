//! An embedded, transactional b-tree storage engine using the SQLite
//! file format.
//!
//! The crate is layered the way the file is: [`os`] supplies the VFS
//! abstraction with file locking, [`storage::pcache`] caches page
//! images, [`storage::pager`] adds journaled transactions on top, and
//! [`storage::btree`] organizes pages into rowid tables and byte-string
//! indexes with cursors over them. Connections opened on the same file
//! in shared-cache mode share one tree state; see [`shared_cache`].

pub mod error;
pub mod os;
pub mod shared_cache;
pub mod storage;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use shared_cache::{set_shared_cache_enabled, shared_cache_enabled};
pub use storage::btree::{
    BtCursor, Btree, BtreeInsertFlags, BtreeOpenFlags, BtreePayload, BtreeSiblings,
    BytewiseComparator, CursorOpenFlags, IntegrityCheckResult, KeyComparator, BTREE_BLOBKEY,
    BTREE_INTKEY,
};
pub use types::{LockLevel, OpenFlags, Pgno, RowId};
