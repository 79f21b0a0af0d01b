//! Rollback-journal pager
//!
//! The layer between the B-tree and the VFS. It hands out cached pages,
//! stages a pre-image of every page into the journal file before the
//! first modification, and turns the dirty page set into a durable
//! commit under the byte-range lock ladder. A transaction moves the
//! pager Open -> Reader -> Writer -> WriterLocked -> WriterFinished;
//! an I/O failure mid-commit parks it in Error until rollback recovers.
//!
//! The first shared lock on a file checks for a leftover journal from a
//! crashed writer and plays it back before any page is served.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{vfs_find, Vfs, VfsFile};
use crate::storage::pcache::{CreateMode, PCache};
use crate::types::{AccessFlags, LockLevel, OpenFlags, Pgno, SyncFlags};

pub use crate::storage::pcache::{PgFlags, PgHdr};

// ============================================================================
// Constants
// ============================================================================

/// Journal header magic number
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Size of the journal header in bytes
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Largest page number any database may use
pub const MAX_PGNO: Pgno = 0x7fff_fffe;

/// File offset that is never locked or stored into. The page covering
/// it is skipped by page allocation so the lock bytes stay clear.
pub const PENDING_BYTE: i64 = 0x4000_0000;

/// Byte offset of the 4-byte change counter inside the file header
const CHANGE_COUNTER_OFFSET: usize = 24;

// ============================================================================
// Pager Flags
// ============================================================================

bitflags! {
    /// Flags for `Pager::open`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerOpenFlags: u32 {
        /// Do not use a rollback journal
        const OMIT_JOURNAL = 0x0001;
        /// In-memory database
        const MEMORY = 0x0002;
    }

    /// Flags for `Pager::acquire`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerGetFlags: u8 {
        /// Do not load data from disk; the caller overwrites the page
        const NOCONTENT = 0x01;
    }

    /// Synchronous-mode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerFlags: u32 {
        const SYNCHRONOUS_OFF    = 0x01;
        const SYNCHRONOUS_NORMAL = 0x02;
        const SYNCHRONOUS_FULL   = 0x03;
        const SYNCHRONOUS_MASK   = 0x07;
        const FULLFSYNC          = 0x08;
        const CACHESPILL         = 0x20;
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Pager state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum PagerState {
    /// No lock held, pager is open
    Open = 0,
    /// Shared lock held, can read
    Reader = 1,
    /// Reserved lock held, writing to journal
    Writer = 2,
    /// Exclusive lock held, committing
    WriterLocked = 3,
    /// Commit phase one complete, journal not yet finalized
    WriterFinished = 4,
    /// Error occurred, pager must roll back before reuse
    Error = 5,
}

/// Journal mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JournalMode {
    /// Commit by deleting the journal file
    Delete = 0,
    /// Commit by zeroing the journal header
    Persist = 1,
    /// Journal omitted (unsafe)
    Off = 2,
    /// Commit by truncating the journal to zero
    Truncate = 3,
    /// In-memory journal file
    Memory = 4,
}

/// Locking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LockingMode {
    /// Release file locks at the end of each transaction
    Normal = 0,
    /// Hold the exclusive lock across transactions
    Exclusive = 1,
}

/// Savepoint operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    /// Begin a new savepoint
    Begin,
    /// Release (commit) savepoint
    Release,
    /// Rollback to savepoint
    Rollback,
}

// ============================================================================
// Savepoint
// ============================================================================

/// One open savepoint: enough pre-transaction state to unwind every
/// page written after it opened.
pub struct Savepoint {
    /// Journal offset when the savepoint opened
    pub offset: i64,
    /// Database image size when the savepoint opened
    pub orig_db_size: Pgno,
    /// Pre-images of pages first written after this savepoint opened
    snapshots: HashMap<Pgno, Vec<u8>>,
}

impl Savepoint {
    fn new(offset: i64, db_size: Pgno) -> Self {
        Savepoint {
            offset,
            orig_db_size: db_size,
            snapshots: HashMap::new(),
        }
    }
}

// ============================================================================
// Journal Header
// ============================================================================

/// Rollback journal header (28 bytes)
#[derive(Debug, Clone)]
pub struct JournalHeader {
    /// Magic number (8 bytes)
    pub magic: [u8; 8],
    /// Record count in the journal
    pub page_count: u32,
    /// Random nonce seeding the record checksums
    pub nonce: u32,
    /// Database page count before the transaction
    pub initial_pages: u32,
    /// Disk sector size
    pub sector_size: u32,
    /// Page size
    pub page_size: u32,
}

impl JournalHeader {
    pub fn new(
        page_count: u32,
        nonce: u32,
        initial_pages: u32,
        sector_size: u32,
        page_size: u32,
    ) -> Self {
        JournalHeader {
            magic: JOURNAL_MAGIC,
            page_count,
            nonce,
            initial_pages,
            sector_size,
            page_size,
        }
    }

    /// Parse a journal header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < JOURNAL_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);

        if magic != JOURNAL_MAGIC {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        Ok(JournalHeader {
            magic,
            page_count: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            nonce: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            initial_pages: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            sector_size: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            page_size: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
        })
    }

    /// Serialize journal header to bytes
    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.page_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.initial_pages.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        buf
    }
}

// ============================================================================
// Pager
// ============================================================================

/// Transactional page store over one database file
pub struct Pager {
    vfs: Arc<dyn Vfs>,
    /// Database file handle
    fd: Option<Box<dyn VfsFile>>,
    /// Journal file handle
    jfd: Option<Box<dyn VfsFile>>,
    /// Page cache for this file
    cache: PCache,

    db_path: String,
    journal_path: String,

    state: PagerState,
    lock: LockLevel,
    journal_mode: JournalMode,
    locking_mode: LockingMode,
    err_code: ErrorCode,

    page_size: u32,
    /// Size of the database image in pages
    db_size: Pgno,
    /// Image size when the write transaction began
    db_orig_size: Pgno,
    /// Pages actually present in the file on disk
    db_file_size: Pgno,
    max_page_count: Pgno,

    // Journal state
    journal_offset: i64,
    n_rec: u32,
    cksum_init: u32,
    journal_started: bool,
    /// Pages with a pre-image already in the journal
    in_journal: HashSet<Pgno>,
    change_count_done: bool,

    /// First 16 header bytes past the page size, used to notice another
    /// process changing the file between our read transactions
    db_file_vers: [u8; 16],

    sector_size: u32,
    temp_file: bool,
    mem_db: bool,
    read_only: bool,
    no_sync: bool,

    savepoints: Vec<Savepoint>,

    // Stats
    n_read: u32,
    n_write: u32,
    n_hit: u32,
    n_miss: u32,
}

impl Pager {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open a pager on a database file. `None` or `":memory:"` opens a
    /// private in-memory database.
    pub fn open(
        vfs_name: Option<&str>,
        path: Option<&str>,
        flags: PagerOpenFlags,
        vfs_flags: OpenFlags,
    ) -> Result<Self> {
        let mem_db = flags.contains(PagerOpenFlags::MEMORY)
            || matches!(path, None | Some("") | Some(":memory:"));

        let vfs = if mem_db {
            vfs_find(Some("mem"))
        } else {
            vfs_find(vfs_name)
        }
        .ok_or_else(|| Error::with_message(ErrorCode::CantOpen, "no such vfs"))?;

        let db_path = match path {
            Some(p) if !mem_db => vfs.full_pathname(p)?,
            _ => String::new(),
        };
        let journal_path = if db_path.is_empty() {
            String::new()
        } else {
            format!("{}-journal", db_path)
        };

        let temp_file = db_path.is_empty() && !mem_db;
        let open_flags = if mem_db || temp_file {
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE
        } else {
            vfs_flags | OpenFlags::MAIN_DB
        };
        let path_arg = if db_path.is_empty() {
            None
        } else {
            Some(db_path.as_str())
        };
        let fd = vfs.open(path_arg, open_flags)?;
        let read_only = vfs_flags.contains(OpenFlags::READONLY) && !mem_db && !temp_file;
        let sector_size = fd.sector_size().max(MIN_PAGE_SIZE as i32) as u32;

        let journal_mode = if flags.contains(PagerOpenFlags::OMIT_JOURNAL) {
            JournalMode::Off
        } else if mem_db || temp_file {
            JournalMode::Memory
        } else {
            JournalMode::Delete
        };

        Ok(Pager {
            vfs,
            fd: Some(fd),
            jfd: None,
            cache: PCache::open(DEFAULT_PAGE_SIZE as usize, !mem_db),
            db_path,
            journal_path,
            state: PagerState::Open,
            lock: LockLevel::None,
            journal_mode,
            locking_mode: LockingMode::Normal,
            err_code: ErrorCode::Ok,
            page_size: DEFAULT_PAGE_SIZE,
            db_size: 0,
            db_orig_size: 0,
            db_file_size: 0,
            max_page_count: MAX_PGNO,
            journal_offset: 0,
            n_rec: 0,
            cksum_init: 0,
            journal_started: false,
            in_journal: HashSet::new(),
            change_count_done: false,
            db_file_vers: [0; 16],
            sector_size,
            temp_file,
            mem_db,
            read_only,
            no_sync: mem_db || temp_file,
            savepoints: Vec::new(),
            n_read: 0,
            n_write: 0,
            n_hit: 0,
            n_miss: 0,
        })
    }

    /// Close the pager, rolling back any active transaction.
    pub fn close(&mut self) -> Result<()> {
        if self.state >= PagerState::Writer {
            let _ = self.rollback();
        }
        let _ = self.file_unlock(LockLevel::None);
        self.jfd = None;
        self.fd = None;
        self.state = PagerState::Open;
        Ok(())
    }

    /// Read the first bytes of the database file, zero-filling past EOF.
    /// Valid before any lock is held; used to size the pager at open.
    pub fn read_file_header(&mut self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        if let Some(fd) = self.fd.as_deref() {
            fd.read(buf, 0)?;
        }
        Ok(())
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Set the page size. Only allowed before the first page is fetched.
    pub fn set_page_size(&mut self, page_size: u32) -> Result<u32> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
            || !page_size.is_power_of_two()
        {
            return Ok(self.page_size);
        }
        if self.state != PagerState::Open || self.cache.page_count() > 0 {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.page_size = page_size;
        self.cache.set_page_size(page_size as usize);
        Ok(self.page_size)
    }

    pub fn get_page_size(&self) -> u32 {
        self.page_size
    }

    /// Set the maximum page count; returns the limit in force.
    pub fn set_max_page_count(&mut self, max: Pgno) -> Pgno {
        if max > 0 && max >= self.db_size {
            self.max_page_count = max.min(MAX_PGNO);
        }
        self.max_page_count
    }

    pub fn set_cache_size(&mut self, n_page: usize) {
        self.cache.set_cache_size(n_page);
    }

    pub fn set_locking_mode(&mut self, mode: LockingMode) {
        self.locking_mode = mode;
    }

    /// Change the journal mode; refused inside a write transaction.
    pub fn set_journal_mode(&mut self, mode: JournalMode) -> JournalMode {
        if self.state < PagerState::Writer && !self.mem_db {
            self.journal_mode = mode;
        }
        self.journal_mode
    }

    pub fn get_journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    /// Disable fsync calls (unsafe against power loss).
    pub fn set_no_sync(&mut self, no_sync: bool) {
        if !self.mem_db && !self.temp_file {
            self.no_sync = no_sync;
        }
    }

    pub fn is_no_sync(&self) -> bool {
        self.no_sync
    }

    // ========================================================================
    // Page Acquisition
    // ========================================================================

    /// Fetch a page, pinning it. Content comes from the cache, or from
    /// disk on a miss; pages past the end of the file come back zeroed.
    pub fn acquire(&mut self, pgno: Pgno, flags: PagerGetFlags) -> Result<PgHdr> {
        if pgno == 0 || pgno == self.pending_byte_page() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("page number {} out of range", pgno),
            ));
        }
        if pgno > self.max_page_count {
            return Err(Error::new(ErrorCode::Full));
        }
        if self.state < PagerState::Reader {
            self.shared_lock()?;
        }

        if let Some(page) = self.cache.fetch(pgno, CreateMode::DontCreate) {
            self.n_hit += 1;
            return Ok(page);
        }
        self.n_miss += 1;

        let mut page = match self.cache.fetch(pgno, CreateMode::CanFail) {
            Some(page) => page,
            None => {
                let _ = self.stress();
                self.cache
                    .fetch(pgno, CreateMode::Force)
                    .ok_or_else(|| Error::new(ErrorCode::NoMem))?
            }
        };

        if !flags.contains(PagerGetFlags::NOCONTENT) && pgno <= self.db_file_size {
            let fd = self.file()?;
            let offset = (pgno as i64 - 1) * self.page_size as i64;
            fd.read(&mut page.data, offset)
                .map_err(|e| self.error(e, ErrorCode::IoErrRead))?;
            self.n_read += 1;
            self.cache.update(&page);
        }
        Ok(page)
    }

    /// Fetch a page only if it is already cached. Pins on a hit.
    pub fn lookup(&self, pgno: Pgno) -> Option<PgHdr> {
        self.cache.fetch(pgno, CreateMode::DontCreate)
    }

    /// Drop one pin. Releasing the last pin outside a write transaction
    /// ends the read transaction and releases the shared lock.
    pub fn release(&mut self, pgno: Pgno) {
        self.cache.release(pgno);
        if self.state == PagerState::Reader
            && self.locking_mode == LockingMode::Normal
            && self.cache.ref_count() == 0
        {
            let _ = self.file_unlock(LockLevel::None);
            self.state = PagerState::Open;
        }
    }

    /// Copy a modified page back into the cache. The page must have been
    /// made writeable first.
    pub fn update(&self, page: &PgHdr) {
        self.cache.update(page);
    }

    /// Declare intent to modify a page. The current content is journaled
    /// as the rollback pre-image before the caller touches a byte; the
    /// page is marked dirty and writeable. Starts a write transaction if
    /// none is active.
    pub fn write(&mut self, page: &mut PgHdr) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if self.state == PagerState::Error {
            return Err(Error::new(self.err_code));
        }
        if self.state < PagerState::Writer {
            self.begin(false)?;
        }

        if !page.flags.contains(PgFlags::WRITEABLE) {
            if self.journal_started
                && page.pgno <= self.db_orig_size
                && !self.in_journal.contains(&page.pgno)
            {
                self.journal_page(page)?;
                self.in_journal.insert(page.pgno);
                page.flags.insert(PgFlags::NEED_SYNC);
            }
            page.flags.insert(PgFlags::WRITEABLE | PgFlags::DIRTY);
        } else {
            page.flags.insert(PgFlags::DIRTY);
        }
        self.cache.update(page);

        for sp in &mut self.savepoints {
            if page.pgno <= sp.orig_db_size && !sp.snapshots.contains_key(&page.pgno) {
                sp.snapshots.insert(page.pgno, page.data.clone());
            }
        }

        if page.pgno > self.db_size {
            self.db_size = page.pgno;
        }
        Ok(())
    }

    /// Mark a page as free so commit never writes it back.
    pub fn dont_write(&mut self, pgno: Pgno) {
        if let Some(mut page) = self.cache.fetch(pgno, CreateMode::DontCreate) {
            page.flags.insert(PgFlags::DONT_WRITE);
            self.cache.update(&page);
            self.cache.release(pgno);
        }
    }

    /// Shrink the database image. The file itself is truncated at commit.
    pub fn truncate_image(&mut self, pgno: Pgno) {
        if pgno < self.db_size {
            self.db_size = pgno;
            self.cache.truncate(pgno);
        }
    }

    // ========================================================================
    // Transaction Control
    // ========================================================================

    /// Take a shared lock and settle the database size. Plays back a hot
    /// journal left by a crashed writer before returning.
    pub fn shared_lock(&mut self) -> Result<()> {
        if self.state == PagerState::Error {
            return Err(Error::new(self.err_code));
        }
        if self.state >= PagerState::Reader {
            return Ok(());
        }

        self.file_lock(LockLevel::Shared)?;

        if !self.temp_file && !self.mem_db && self.journal_mode != JournalMode::Off {
            match self.has_hot_journal() {
                Ok(true) => {
                    if let Err(e) = self.recover_hot_journal() {
                        let _ = self.file_unlock(LockLevel::None);
                        return Err(e);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = self.file_unlock(LockLevel::None);
                    return Err(e);
                }
            }
        }

        self.refresh_db_size()?;
        self.state = PagerState::Reader;
        Ok(())
    }

    /// Start a write transaction: RESERVED lock, fresh journal.
    pub fn begin(&mut self, exclusive: bool) -> Result<()> {
        if self.state == PagerState::Error {
            return Err(Error::new(self.err_code));
        }
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if self.state >= PagerState::Writer {
            if exclusive && self.state == PagerState::Writer {
                self.file_lock(LockLevel::Exclusive)?;
                self.state = PagerState::WriterLocked;
            }
            return Ok(());
        }
        if self.state < PagerState::Reader {
            self.shared_lock()?;
        }

        self.file_lock(LockLevel::Reserved)?;
        if exclusive {
            self.file_lock(LockLevel::Exclusive)?;
        }

        self.db_orig_size = self.db_size;
        self.change_count_done = false;
        self.open_journal()?;
        self.state = if exclusive {
            PagerState::WriterLocked
        } else {
            PagerState::Writer
        };
        Ok(())
    }

    /// Commit, phase one: make the journal durable, take the exclusive
    /// lock, write every dirty page in page-number order, sync the file.
    /// After this returns the transaction survives a crash; the journal
    /// still marks it incomplete until phase two.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        if self.state == PagerState::Error {
            return Err(Error::new(self.err_code));
        }
        if self.state < PagerState::Writer || self.state == PagerState::WriterFinished {
            return Ok(());
        }
        if self.cache.dirty_count() == 0 && self.db_size == self.db_orig_size {
            self.state = PagerState::WriterFinished;
            return Ok(());
        }

        match self.commit_phase_one_inner() {
            Ok(()) => {
                self.state = PagerState::WriterFinished;
                Ok(())
            }
            Err(e) => Err(self.into_error_state(e)),
        }
    }

    fn commit_phase_one_inner(&mut self) -> Result<()> {
        self.increment_change_counter()?;
        self.sync_journal()?;
        self.file_lock(LockLevel::Exclusive)?;
        self.write_dirty_pages()?;

        if self.db_file_size > self.db_size {
            let fd = self.file()?;
            fd.truncate(self.db_size as i64 * self.page_size as i64)
                .map_err(|e| rethrow(e, ErrorCode::IoErrTruncate))?;
            self.db_file_size = self.db_size;
        }
        if !self.no_sync {
            let fd = self.file()?;
            fd.sync(SyncFlags::NORMAL)
                .map_err(|e| rethrow(e, ErrorCode::IoErrFsync))?;
        }
        Ok(())
    }

    /// Commit, phase two: finalize the journal (the commit point for
    /// crash recovery) and drop back to an unlocked state.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if self.state == PagerState::Error {
            return Err(Error::new(self.err_code));
        }
        if self.state < PagerState::Writer {
            return Ok(());
        }
        match self.end_transaction() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.into_error_state(e)),
        }
    }

    /// Abandon the write transaction, restoring every journaled page.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state < PagerState::Writer && self.state != PagerState::Error {
            return Ok(());
        }

        let played = if self.journal_started && self.n_rec > 0 {
            self.playback(false)
        } else {
            self.db_size = self.db_orig_size;
            Ok(())
        };

        self.cache.truncate(self.db_size);
        self.cache.clean_all();

        let ended = self.end_transaction();
        match played.and(ended) {
            Ok(()) => {
                self.err_code = ErrorCode::Ok;
                Ok(())
            }
            Err(e) => Err(self.into_error_state(e)),
        }
    }

    fn end_transaction(&mut self) -> Result<()> {
        self.finalize_journal()?;
        self.cache.clean_all();
        self.in_journal.clear();
        self.savepoints.clear();
        self.change_count_done = false;
        self.db_orig_size = 0;
        if self.locking_mode == LockingMode::Normal {
            self.file_unlock(LockLevel::Shared)?;
        }
        self.state = PagerState::Reader;
        Ok(())
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    /// Open, release, or roll back to the numbered savepoint.
    pub fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        match op {
            SavepointOp::Begin => {
                while self.savepoints.len() <= index {
                    self.savepoints
                        .push(Savepoint::new(self.journal_offset, self.db_size));
                }
            }
            SavepointOp::Release => {
                if index < self.savepoints.len() {
                    self.savepoints.truncate(index);
                }
            }
            SavepointOp::Rollback => {
                if index >= self.savepoints.len() {
                    return Err(Error::new(ErrorCode::Misuse));
                }
                self.rollback_savepoint(index)?;
                self.savepoints.truncate(index + 1);
                if let Some(sp) = self.savepoints.last_mut() {
                    sp.snapshots.clear();
                }
            }
        }
        Ok(())
    }

    fn rollback_savepoint(&mut self, index: usize) -> Result<()> {
        let target_size = self.savepoints[index].orig_db_size;

        // The oldest pre-image of each page lives in the outermost
        // savepoint that captured it.
        let mut restored: HashSet<Pgno> = HashSet::new();
        for i in index..self.savepoints.len() {
            let pages: Vec<(Pgno, Vec<u8>)> = self.savepoints[i]
                .snapshots
                .iter()
                .filter(|(pgno, _)| !restored.contains(pgno))
                .map(|(&pgno, data)| (pgno, data.clone()))
                .collect();
            for (pgno, data) in pages {
                restored.insert(pgno);
                if let Some(mut page) = self.cache.fetch(pgno, CreateMode::DontCreate) {
                    page.data.copy_from_slice(&data);
                    self.cache.update(&page);
                    self.cache.release(pgno);
                }
            }
        }

        self.cache.truncate(target_size);
        self.db_size = target_size;
        Ok(())
    }

    // ========================================================================
    // Journal
    // ========================================================================

    fn open_journal(&mut self) -> Result<()> {
        if self.journal_mode == JournalMode::Off {
            self.journal_started = false;
            return Ok(());
        }
        if self.jfd.is_none() {
            let jfd = if self.journal_mode == JournalMode::Memory {
                let mem = vfs_find(Some("mem"))
                    .ok_or_else(|| Error::with_message(ErrorCode::CantOpen, "no mem vfs"))?;
                mem.open(None, OpenFlags::READWRITE | OpenFlags::CREATE)?
            } else {
                self.vfs.open(
                    Some(&self.journal_path),
                    OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_JOURNAL,
                )?
            };
            self.jfd = Some(jfd);
        }

        let mut nonce = [0u8; 4];
        self.vfs.randomness(&mut nonce);
        self.cksum_init = u32::from_be_bytes(nonce);
        self.n_rec = 0;
        self.in_journal.clear();

        let header = JournalHeader::new(
            0,
            self.cksum_init,
            self.db_orig_size,
            self.sector_size,
            self.page_size,
        );
        let jfd = self.journal_file()?;
        jfd.truncate(0)
            .map_err(|e| rethrow(e, ErrorCode::IoErrTruncate))?;
        jfd.write(&header.to_bytes(), 0)
            .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
        self.journal_offset = JOURNAL_HEADER_SIZE as i64;
        self.journal_started = true;
        Ok(())
    }

    fn journal_page(&mut self, page: &PgHdr) -> Result<()> {
        let cksum = self.journal_cksum(&page.data);
        let jfd = self.journal_file()?;
        let mut offset = self.journal_offset;

        jfd.write(&page.pgno.to_be_bytes(), offset)
            .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
        offset += 4;
        jfd.write(&page.data, offset)
            .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
        offset += page.data.len() as i64;
        jfd.write(&cksum.to_be_bytes(), offset)
            .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
        offset += 4;

        self.journal_offset = offset;
        self.n_rec += 1;
        Ok(())
    }

    /// Write the final record count into the header and fsync. After
    /// this the pre-images are durable and dirty pages may reach the
    /// database file.
    fn sync_journal(&mut self) -> Result<()> {
        if !self.journal_started {
            return Ok(());
        }
        let header = JournalHeader::new(
            self.n_rec,
            self.cksum_init,
            self.db_orig_size,
            self.sector_size,
            self.page_size,
        );
        let jfd = self.journal_file()?;
        jfd.write(&header.to_bytes(), 0)
            .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
        if !self.no_sync {
            jfd.sync(SyncFlags::NORMAL)
                .map_err(|e| rethrow(e, ErrorCode::IoErrFsync))?;
        }
        self.cache.clear_sync_flags();
        Ok(())
    }

    fn finalize_journal(&mut self) -> Result<()> {
        if self.jfd.is_none() {
            return Ok(());
        }
        match self.journal_mode {
            JournalMode::Delete => {
                self.jfd = None;
                if !self.journal_path.is_empty()
                    && self.vfs.access(&self.journal_path, AccessFlags::EXISTS)?
                {
                    self.vfs
                        .delete(&self.journal_path, true)
                        .map_err(|e| rethrow(e, ErrorCode::IoErrDelete))?;
                }
            }
            JournalMode::Truncate => {
                let jfd = self.journal_file()?;
                jfd.truncate(0)
                    .map_err(|e| rethrow(e, ErrorCode::IoErrTruncate))?;
            }
            JournalMode::Persist => {
                let jfd = self.journal_file()?;
                jfd.write(&[0u8; JOURNAL_HEADER_SIZE], 0)
                    .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
            }
            JournalMode::Memory | JournalMode::Off => {
                self.jfd = None;
            }
        }
        self.journal_offset = 0;
        self.n_rec = 0;
        self.journal_started = false;
        Ok(())
    }

    /// Replay journal records oldest-first, restoring pre-images into
    /// the file and the cache, then truncate back to the original size.
    ///
    /// `is_hot` relaxes validation for journals left by a crashed
    /// process: a missing or torn header means the transaction never
    /// reached the database file, and a checksum mismatch marks the
    /// first record that never became durable.
    fn playback(&mut self, is_hot: bool) -> Result<()> {
        let page_size = self.page_size as usize;
        let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
        let (n_rec, initial_pages) = {
            let jfd = self.journal_file()?;
            let journal_size = jfd.file_size()?;
            let got = jfd
                .read(&mut header_buf, 0)
                .map_err(|e| rethrow(e, ErrorCode::IoErrRead))?;
            let header = match JournalHeader::from_bytes(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    if is_hot || got < JOURNAL_HEADER_SIZE {
                        return Ok(());
                    }
                    return Err(e);
                }
            };
            if header.page_size != self.page_size {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "journal page size does not match the database",
                ));
            }
            self.cksum_init = header.nonce;

            let mut n_rec = if is_hot { header.page_count } else { self.n_rec };
            if is_hot && n_rec == 0 {
                // Header never finalized; trust whatever records are
                // fully present in the file.
                let record_size = (page_size + 8) as i64;
                n_rec = ((journal_size - JOURNAL_HEADER_SIZE as i64) / record_size) as u32;
            }
            (n_rec, header.initial_pages)
        };

        let record_size = (page_size + 8) as i64;
        let mut record = vec![0u8; page_size + 8];
        for i in 0..n_rec {
            let offset = JOURNAL_HEADER_SIZE as i64 + i as i64 * record_size;
            let got = {
                let jfd = self.journal_file()?;
                jfd.read(&mut record, offset)
                    .map_err(|e| rethrow(e, ErrorCode::IoErrRead))?
            };
            if got < record.len() {
                break;
            }
            let pgno = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
            let data = &record[4..4 + page_size];
            let stored = u32::from_be_bytes([
                record[4 + page_size],
                record[5 + page_size],
                record[6 + page_size],
                record[7 + page_size],
            ]);
            if stored != self.journal_cksum(data) {
                // Torn tail; everything after this record never made
                // it to the database file either.
                break;
            }
            if pgno == 0 || pgno > MAX_PGNO || pgno == self.pending_byte_page() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("journal names page {}", pgno),
                ));
            }
            self.playback_one_page(pgno, data)?;
        }

        let fd = self.file()?;
        fd.truncate(initial_pages as i64 * self.page_size as i64)
            .map_err(|e| rethrow(e, ErrorCode::IoErrTruncate))?;
        if !self.no_sync {
            fd.sync(SyncFlags::NORMAL)
                .map_err(|e| rethrow(e, ErrorCode::IoErrFsync))?;
        }
        self.db_size = initial_pages;
        self.db_file_size = initial_pages;
        Ok(())
    }

    fn playback_one_page(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let offset = (pgno as i64 - 1) * self.page_size as i64;
        {
            let fd = self.file()?;
            fd.write(data, offset)
                .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
        }
        if let Some(mut page) = self.cache.fetch(pgno, CreateMode::DontCreate) {
            page.data.copy_from_slice(data);
            page.flags = PgFlags::empty();
            self.cache.update(&page);
            self.cache.make_clean(pgno);
            self.cache.release(pgno);
        }
        Ok(())
    }

    // ========================================================================
    // Hot journal
    // ========================================================================

    /// A journal file with no live writer behind it means a process
    /// died mid-transaction.
    fn has_hot_journal(&mut self) -> Result<bool> {
        if self.journal_path.is_empty() {
            return Ok(false);
        }
        if !self.vfs.access(&self.journal_path, AccessFlags::EXISTS)? {
            return Ok(false);
        }
        let reserved = self.file()?.check_reserved_lock()?;
        Ok(!reserved)
    }

    fn recover_hot_journal(&mut self) -> Result<()> {
        self.file_lock(LockLevel::Exclusive)?;

        let jfd = self.vfs.open(
            Some(&self.journal_path),
            OpenFlags::READWRITE | OpenFlags::MAIN_JOURNAL,
        )?;
        self.jfd = Some(jfd);

        let result = self.playback(true);
        self.jfd = None;
        if result.is_ok() && self.vfs.access(&self.journal_path, AccessFlags::EXISTS)? {
            self.vfs
                .delete(&self.journal_path, true)
                .map_err(|e| rethrow(e, ErrorCode::IoErrDelete))?;
        }
        self.file_unlock(LockLevel::Shared)?;
        result
    }

    // ========================================================================
    // Commit helpers
    // ========================================================================

    fn write_dirty_pages(&mut self) -> Result<()> {
        let pages = self.cache.dirty_pages();
        for page in pages {
            if page.flags.contains(PgFlags::DONT_WRITE) || page.pgno > self.db_size {
                self.cache.make_clean(page.pgno);
                continue;
            }
            let offset = (page.pgno as i64 - 1) * self.page_size as i64;
            {
                let fd = self.file()?;
                fd.write(&page.data, offset)
                    .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
            }
            self.n_write += 1;
            if page.pgno > self.db_file_size {
                self.db_file_size = page.pgno;
            }
            self.cache.make_clean(page.pgno);
        }
        Ok(())
    }

    /// Bump the 4-byte change counter on page 1 so other processes
    /// notice the file changed under their caches.
    fn increment_change_counter(&mut self) -> Result<()> {
        if self.change_count_done || self.temp_file || self.db_size == 0 {
            return Ok(());
        }
        let mut page1 = self.acquire(1, PagerGetFlags::empty())?;
        self.write(&mut page1)?;
        let old = u32::from_be_bytes([
            page1.data[CHANGE_COUNTER_OFFSET],
            page1.data[CHANGE_COUNTER_OFFSET + 1],
            page1.data[CHANGE_COUNTER_OFFSET + 2],
            page1.data[CHANGE_COUNTER_OFFSET + 3],
        ]);
        page1.data[CHANGE_COUNTER_OFFSET..CHANGE_COUNTER_OFFSET + 4]
            .copy_from_slice(&old.wrapping_add(1).to_be_bytes());
        self.cache.update(&page1);
        self.release(1);
        self.change_count_done = true;
        Ok(())
    }

    /// Write one removable dirty page to the file to relieve cache
    /// pressure. Requires escalating to the exclusive lock; a refusal
    /// is not an error, the cache just grows past its budget.
    fn stress(&mut self) -> Result<bool> {
        if self.state < PagerState::Writer || self.read_only {
            return Ok(false);
        }
        let candidate = match self.cache.spill_candidate() {
            Some(page) => Some(page),
            None if self.cache.dirty_count() > 0 && self.journal_started => {
                self.sync_journal()?;
                self.cache.spill_candidate()
            }
            None => None,
        };
        let page = match candidate {
            Some(page) => page,
            None => return Ok(false),
        };
        if self.file_lock(LockLevel::Exclusive).is_err() {
            return Ok(false);
        }
        if page.pgno <= self.db_size {
            let offset = (page.pgno as i64 - 1) * self.page_size as i64;
            let fd = self.file()?;
            fd.write(&page.data, offset)
                .map_err(|e| rethrow(e, ErrorCode::IoErrWrite))?;
            if page.pgno > self.db_file_size {
                self.db_file_size = page.pgno;
            }
        }
        self.cache.make_clean(page.pgno);
        Ok(true)
    }

    // ========================================================================
    // Lock plumbing
    // ========================================================================

    fn file_lock(&mut self, level: LockLevel) -> Result<()> {
        if level <= self.lock {
            return Ok(());
        }
        self.file()?.lock(level)?;
        self.lock = level;
        Ok(())
    }

    fn file_unlock(&mut self, level: LockLevel) -> Result<()> {
        if self.fd.is_none() || level >= self.lock {
            return Ok(());
        }
        self.file()?.unlock(level)?;
        self.lock = level;
        Ok(())
    }

    // ========================================================================
    // Size bookkeeping
    // ========================================================================

    /// Database size in pages, taking a shared lock if none is held.
    pub fn page_count(&mut self) -> Result<Pgno> {
        if self.state < PagerState::Reader {
            self.shared_lock()?;
        }
        Ok(self.db_size)
    }

    fn refresh_db_size(&mut self) -> Result<()> {
        let (size, mut vers) = {
            let fd = self.file()?;
            let size = fd.file_size()?;
            let mut vers = [0u8; 16];
            if size > 0 {
                fd.read(&mut vers, CHANGE_COUNTER_OFFSET as i64)
                    .map_err(|e| rethrow(e, ErrorCode::IoErrRead))?;
            }
            (size, vers)
        };
        if vers != self.db_file_vers {
            // Another process committed; every cached page is stale.
            self.cache.truncate(0);
            std::mem::swap(&mut self.db_file_vers, &mut vers);
        }
        let pages = (size / self.page_size as i64) as Pgno;
        self.db_file_size = pages;
        self.db_size = pages;
        Ok(())
    }

    fn pending_byte_page(&self) -> Pgno {
        (PENDING_BYTE / self.page_size as i64) as Pgno + 1
    }

    // ========================================================================
    // Checksums and errors
    // ========================================================================

    /// Journal record checksum: the header nonce plus every 200th byte.
    /// Cheap, and the nonce makes records from a stale journal fail.
    fn journal_cksum(&self, data: &[u8]) -> u32 {
        let mut cksum = self.cksum_init;
        let mut i = data.len() as i64 - 200;
        while i > 0 {
            cksum = cksum.wrapping_add(data[i as usize] as u32);
            i -= 200;
        }
        cksum
    }

    fn error(&mut self, e: Error, fallback: ErrorCode) -> Error {
        let e = rethrow(e, fallback);
        self.into_error_state(e)
    }

    fn into_error_state(&mut self, e: Error) -> Error {
        if e.is_io() || e.code == ErrorCode::Corrupt {
            self.err_code = e.code;
            self.state = PagerState::Error;
        }
        e
    }

    fn file(&self) -> Result<&dyn VfsFile> {
        self.fd
            .as_deref()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "pager is closed"))
    }

    fn journal_file(&self) -> Result<&dyn VfsFile> {
        self.jfd
            .as_deref()
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, "journal not open"))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_readonly(&self) -> bool {
        self.read_only
    }

    pub fn is_memdb(&self) -> bool {
        self.mem_db
    }

    pub fn filename(&self) -> &str {
        &self.db_path
    }

    pub fn journal_name(&self) -> &str {
        &self.journal_path
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock
    }

    /// Sum of page pins held by callers
    pub fn ref_count(&self) -> i64 {
        self.cache.ref_count()
    }

    /// (reads, writes, hits, misses) since open
    pub fn stats(&self) -> (u32, u32, u32, u32) {
        (self.n_read, self.n_write, self.n_hit, self.n_miss)
    }
}

fn rethrow(e: Error, code: ErrorCode) -> Error {
    if e.code == ErrorCode::Ok || e.code == ErrorCode::Error {
        Error::new(code)
    } else {
        e
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PAGE_SIZE: u32 = 512;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!("pager-{}-{}", tag, NEXT.fetch_add(1, Ordering::SeqCst))
    }

    fn open_mem(name: &str) -> Pager {
        let mut pager = Pager::open(
            Some("mem"),
            Some(name),
            PagerOpenFlags::empty(),
            OpenFlags::READWRITE | OpenFlags::CREATE,
        )
        .unwrap();
        pager.set_page_size(PAGE_SIZE).unwrap();
        pager
    }

    fn write_filled(pager: &mut Pager, pgno: Pgno, byte: u8) {
        let mut page = pager.acquire(pgno, PagerGetFlags::NOCONTENT).unwrap();
        pager.write(&mut page).unwrap();
        page.data.fill(byte);
        pager.update(&page);
        pager.release(pgno);
    }

    #[test]
    fn test_journal_header_roundtrip() {
        let header = JournalHeader::new(100, 0xdead_beef, 50, 512, 4096);
        let parsed = JournalHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.page_count, 100);
        assert_eq!(parsed.nonce, 0xdead_beef);
        assert_eq!(parsed.initial_pages, 50);
        assert_eq!(parsed.sector_size, 512);
        assert_eq!(parsed.page_size, 4096);

        assert!(JournalHeader::from_bytes(&[0u8; JOURNAL_HEADER_SIZE]).is_err());
    }

    #[test]
    fn test_commit_persists_across_reopen() {
        let name = unique_name("commit");
        {
            let mut pager = open_mem(&name);
            pager.begin(false).unwrap();
            write_filled(&mut pager, 1, 0x11);
            write_filled(&mut pager, 2, 0x22);
            pager.commit_phase_one().unwrap();
            pager.commit_phase_two().unwrap();
            pager.close().unwrap();
        }

        let mut pager = open_mem(&name);
        assert_eq!(pager.page_count().unwrap(), 2);
        let page = pager.acquire(2, PagerGetFlags::empty()).unwrap();
        assert!(page.data.iter().all(|&b| b == 0x22));
        pager.release(2);
        pager.close().unwrap();
    }

    #[test]
    fn test_rollback_restores_content() {
        let name = unique_name("rollback");
        let mut pager = open_mem(&name);

        pager.begin(false).unwrap();
        write_filled(&mut pager, 1, 0xAA);
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();

        pager.begin(false).unwrap();
        write_filled(&mut pager, 1, 0xBB);
        write_filled(&mut pager, 2, 0xCC);
        assert_eq!(pager.page_count().unwrap(), 2);
        pager.rollback().unwrap();

        assert_eq!(pager.page_count().unwrap(), 1, "new page discarded");
        let page = pager.acquire(1, PagerGetFlags::empty()).unwrap();
        assert!(
            page.data.iter().all(|&b| b == 0xAA),
            "rollback must restore the committed image"
        );
        pager.release(1);
        pager.close().unwrap();
    }

    #[test]
    fn test_hot_journal_playback() {
        let name = unique_name("hot");
        {
            let mut pager = open_mem(&name);
            pager.begin(false).unwrap();
            write_filled(&mut pager, 1, 0x01);
            pager.commit_phase_one().unwrap();
            pager.commit_phase_two().unwrap();
            pager.close().unwrap();
        }

        // A crash after phase one leaves new content in the file and a
        // live journal; the file journal mode keeps it on the mem vfs.
        {
            let mut pager = open_mem(&name);
            pager.set_journal_mode(JournalMode::Delete);
            pager.begin(false).unwrap();
            write_filled(&mut pager, 1, 0x99);
            pager.commit_phase_one().unwrap();
            // no phase two: drop without finalizing the journal
        }

        let mem = vfs_find(Some("mem")).unwrap();
        assert!(
            mem.access(&format!("{}-journal", name), AccessFlags::EXISTS)
                .unwrap(),
            "the aborted commit must leave a journal behind"
        );

        let mut pager = open_mem(&name);
        pager.set_journal_mode(JournalMode::Delete);
        let page = pager.acquire(1, PagerGetFlags::empty()).unwrap();
        assert!(
            page.data.iter().all(|&b| b == 0x01),
            "hot journal playback must restore the last commit"
        );
        assert!(
            !mem.access(&format!("{}-journal", name), AccessFlags::EXISTS)
                .unwrap(),
            "playback consumes the journal"
        );
        pager.release(1);
        pager.close().unwrap();
    }

    #[test]
    fn test_savepoint_rollback() {
        let name = unique_name("savepoint");
        let mut pager = open_mem(&name);

        pager.begin(false).unwrap();
        write_filled(&mut pager, 1, 0x10);
        pager.savepoint(SavepointOp::Begin, 0).unwrap();
        write_filled(&mut pager, 1, 0x20);
        write_filled(&mut pager, 2, 0x30);

        pager.savepoint(SavepointOp::Rollback, 0).unwrap();
        let page = pager.acquire(1, PagerGetFlags::empty()).unwrap();
        assert!(page.data.iter().all(|&b| b == 0x10));
        pager.release(1);
        assert_eq!(pager.page_count().unwrap(), 1, "page 2 unwound");

        // The outer transaction still commits what remains.
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_second_writer_gets_busy() {
        let name = unique_name("busy");
        let mut a = open_mem(&name);
        a.begin(false).unwrap();
        write_filled(&mut a, 1, 0x01);

        let mut b = open_mem(&name);
        let err = b.begin(false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        assert!(err.is_retryable());

        a.commit_phase_one().unwrap();
        a.commit_phase_two().unwrap();
        b.begin(false).unwrap();
        b.rollback().unwrap();
        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn test_release_of_last_pin_unlocks() {
        let name = unique_name("unlock");
        let mut pager = open_mem(&name);
        pager.begin(false).unwrap();
        write_filled(&mut pager, 1, 0x42);
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();
        assert_eq!(pager.state(), PagerState::Reader);

        let page = pager.acquire(1, PagerGetFlags::empty()).unwrap();
        assert_eq!(pager.lock_level(), LockLevel::Shared);
        pager.release(page.pgno);
        assert_eq!(pager.state(), PagerState::Open);
        assert_eq!(pager.lock_level(), LockLevel::None);
        pager.close().unwrap();
    }

    #[test]
    fn test_memdb_is_private_and_unjournaled_on_disk() {
        let mut pager = Pager::open(
            None,
            Some(":memory:"),
            PagerOpenFlags::empty(),
            OpenFlags::READWRITE | OpenFlags::CREATE,
        )
        .unwrap();
        assert!(pager.is_memdb());
        pager.set_page_size(PAGE_SIZE).unwrap();

        pager.begin(false).unwrap();
        write_filled(&mut pager, 1, 0x55);
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();

        let page = pager.acquire(1, PagerGetFlags::empty()).unwrap();
        assert!(page.data.iter().all(|&b| b == 0x55));
        pager.release(1);
        pager.close().unwrap();
    }

    #[test]
    fn test_truncate_image_shrinks_on_commit() {
        let name = unique_name("trunc");
        let mut pager = open_mem(&name);
        pager.begin(false).unwrap();
        for pgno in 1..=4 {
            write_filled(&mut pager, pgno, pgno as u8);
        }
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();
        assert_eq!(pager.page_count().unwrap(), 4);

        pager.begin(false).unwrap();
        let mut page = pager.acquire(1, PagerGetFlags::empty()).unwrap();
        pager.write(&mut page).unwrap();
        pager.update(&page);
        pager.release(1);
        pager.truncate_image(2);
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();

        assert_eq!(pager.page_count().unwrap(), 2);
        pager.close().unwrap();
    }
}
