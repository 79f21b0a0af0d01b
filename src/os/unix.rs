//! Unix VFS implementation
//!
//! Positioned I/O via pread/pwrite plus the advisory locking protocol
//! built on fcntl byte-range locks. POSIX locks belong to the process,
//! not the file descriptor, so two handles on the same inode never
//! conflict at the kernel level; a process-wide inode table
//! reference-counts SHARED holders and arbitrates between handles the
//! kernel would treat as one owner.

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{Vfs, VfsFile};
use crate::types::{AccessFlags, LockLevel, OpenFlags, SyncFlags};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ============================================================================
// Lock Byte Ranges
// ============================================================================

/// First byte past the 1GB boundary, never stored as page data
pub const PENDING_BYTE: i64 = 0x4000_0000;
/// Byte locked while a write transaction is underway
pub const RESERVED_BYTE: i64 = PENDING_BYTE + 1;
/// Start of the range read-locked by every reader
pub const SHARED_FIRST: i64 = PENDING_BYTE + 2;
/// Length of the shared lock range
pub const SHARED_SIZE: i64 = 510;

// ============================================================================
// Errno Helpers
// ============================================================================

fn get_errno() -> i32 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    unsafe {
        *libc::__error()
    }
}

fn platform_fdatasync(fd: RawFd) -> i32 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        libc::fdatasync(fd)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe {
        libc::fsync(fd)
    }
}

fn error_from_errno(errno: i32) -> Error {
    let msg = std::io::Error::from_raw_os_error(errno).to_string();
    let code = match errno {
        libc::ENOENT => ErrorCode::CantOpen,
        libc::EACCES | libc::EPERM => ErrorCode::Perm,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::Full,
        libc::EBUSY | libc::EAGAIN => ErrorCode::Busy,
        libc::EINTR => ErrorCode::Interrupt,
        libc::ENOMEM => ErrorCode::NoMem,
        libc::EROFS => ErrorCode::ReadOnly,
        _ => ErrorCode::IoErr,
    };
    Error::with_message(code, msg)
}

// ============================================================================
// Inode Lock Table
// ============================================================================

/// Per-inode lock state shared by every handle this process has open
/// on the same file.
struct InodeLockInfo {
    /// Highest lock level held by any handle in this process
    level: LockLevel,
    /// Number of handles holding SHARED or better
    n_shared: u32,
    /// Descriptors whose close is deferred until all locks clear.
    /// close() drops every POSIX lock the process holds on the inode,
    /// so a handle that closes while a sibling still holds a lock must
    /// leave its descriptor open.
    pending_fds: Vec<RawFd>,
}

lazy_static::lazy_static! {
    static ref INODE_LOCKS: Mutex<HashMap<(u64, u64), InodeLockInfo>> =
        Mutex::new(HashMap::new());
}

fn lock_inode_table() -> std::sync::MutexGuard<'static, HashMap<(u64, u64), InodeLockInfo>> {
    match INODE_LOCKS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Unix VFS
// ============================================================================

/// Unix VFS implementation
pub struct UnixVfs {
    name: String,
}

impl UnixVfs {
    /// Create a new Unix VFS with the default name "unix"
    pub fn new() -> Self {
        Self {
            name: "unix".to_string(),
        }
    }

    pub fn new_with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn create_temp_file(&self) -> Result<(RawFd, PathBuf)> {
        let template = std::env::temp_dir().join("pagetree_XXXXXX");
        let mut bytes = template.into_os_string().into_vec();
        bytes.push(0);
        let fd = unsafe { libc::mkstemp(bytes.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(error_from_errno(get_errno()));
        }
        bytes.pop();
        Ok((fd, PathBuf::from(OsString::from_vec(bytes))))
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let (fd, file_path, delete_on_close) = match path {
            Some(p) => {
                let mut oflags = if flags.contains(OpenFlags::READONLY) {
                    libc::O_RDONLY
                } else {
                    libc::O_RDWR
                };
                if flags.contains(OpenFlags::CREATE) {
                    oflags |= libc::O_CREAT;
                }
                if flags.contains(OpenFlags::EXCLUSIVE) {
                    oflags |= libc::O_EXCL;
                }

                let c_path =
                    CString::new(p).map_err(|_| Error::new(ErrorCode::Misuse))?;
                let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644 as libc::c_uint) };
                if fd < 0 {
                    return Err(error_from_errno(get_errno()));
                }
                (
                    fd,
                    Some(PathBuf::from(p)),
                    flags.contains(OpenFlags::DELETEONCLOSE),
                )
            }
            None => {
                let (fd, p) = self.create_temp_file()?;
                (fd, Some(p), true)
            }
        };

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = error_from_errno(get_errno());
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Box::new(UnixFile {
            fd,
            path: file_path,
            dev_ino: (st.st_dev as u64, st.st_ino as u64),
            lock_level: UnsafeCell::new(LockLevel::None),
            delete_on_close,
        }))
    }

    fn delete(&self, path: &str, sync_dir: bool) -> Result<()> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::Misuse))?;
        let rc = unsafe { libc::unlink(c_path.as_ptr()) };
        if rc != 0 {
            let errno = get_errno();
            if errno != libc::ENOENT {
                return Err(Error::with_message(
                    ErrorCode::IoErrDelete,
                    std::io::Error::from_raw_os_error(errno).to_string(),
                ));
            }
        }

        if sync_dir {
            let parent = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
            let parent = if parent.as_os_str().is_empty() {
                OsStr::new(".")
            } else {
                parent.as_os_str()
            };
            if let Ok(c_dir) = CString::new(parent.as_bytes()) {
                let dfd = unsafe { libc::open(c_dir.as_ptr(), libc::O_RDONLY) };
                if dfd >= 0 {
                    unsafe {
                        libc::fsync(dfd);
                        libc::close(dfd);
                    }
                }
            }
        }

        Ok(())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::Misuse))?;
        let mode = if flags.contains(AccessFlags::READWRITE) {
            libc::R_OK | libc::W_OK
        } else if flags.contains(AccessFlags::READ) {
            libc::R_OK
        } else {
            libc::F_OK
        };
        Ok(unsafe { libc::access(c_path.as_ptr(), mode) } == 0)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let cwd = std::env::current_dir()
            .map_err(|e| Error::with_message(ErrorCode::CantOpen, e.to_string()))?;
        Ok(cwd.join(path).to_string_lossy().into_owned())
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
            use std::io::Read;
            if f.read_exact(buf).is_ok() {
                return buf.len() as i32;
            }
        }

        // Fallback: stir the clock through an LCG.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut seed = now.as_nanos() as u64 ^ 0x9e37_79b9_7f4a_7c15;
        for b in buf.iter_mut() {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *b = (seed >> 33) as u8;
        }
        buf.len() as i32
    }

    fn sleep(&self, microseconds: i32) -> i32 {
        std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
        microseconds
    }

    fn current_time(&self) -> f64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        // Julian day number of the Unix epoch.
        2440587.5 + now.as_secs_f64() / 86400.0
    }
}

// ============================================================================
// Unix File Handle
// ============================================================================

/// Unix file handle
pub struct UnixFile {
    fd: RawFd,
    path: Option<PathBuf>,
    /// (st_dev, st_ino) key into the inode lock table
    dev_ino: (u64, u64),
    lock_level: UnsafeCell<LockLevel>,
    delete_on_close: bool,
}

// The UnsafeCell is only mutated under the inode table mutex.
unsafe impl Send for UnixFile {}
unsafe impl Sync for UnixFile {}

impl UnixFile {
    fn level(&self) -> LockLevel {
        unsafe { *self.lock_level.get() }
    }

    fn set_level(&self, level: LockLevel) {
        unsafe { *self.lock_level.get() = level };
    }

    /// Issue one non-blocking fcntl lock request. EAGAIN and EACCES both
    /// signal a competing holder.
    fn fcntl_lock(&self, l_type: libc::c_short, start: i64, len: i64) -> Result<()> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = l_type;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = len as libc::off_t;

        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLK, &fl) };
        if rc < 0 {
            let errno = get_errno();
            if errno == libc::EAGAIN || errno == libc::EACCES {
                return Err(Error::new(ErrorCode::Busy));
            }
            return Err(Error::with_message(
                if l_type == libc::F_UNLCK as libc::c_short {
                    ErrorCode::IoErrUnlock
                } else {
                    ErrorCode::IoErrLock
                },
                std::io::Error::from_raw_os_error(errno).to_string(),
            ));
        }
        Ok(())
    }
}

impl VfsFile for UnixFile {
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let n = unsafe {
            libc::pread(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(error_from_errno(get_errno()));
        }
        let n = n as usize;
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        let mut written = 0usize;
        while written < buf.len() {
            let n = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                    (offset + written as i64) as libc::off_t,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(error_from_errno(errno));
            }
            if n == 0 {
                return Err(Error::new(ErrorCode::Full));
            }
            written += n as usize;
        }
        Ok(written)
    }

    fn truncate(&self, size: i64) -> Result<()> {
        let rc = unsafe { libc::ftruncate(self.fd, size as libc::off_t) };
        if rc != 0 {
            return Err(Error::with_message(
                ErrorCode::IoErrTruncate,
                std::io::Error::from_raw_os_error(get_errno()).to_string(),
            ));
        }
        Ok(())
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            platform_fdatasync(self.fd)
        } else {
            unsafe { libc::fsync(self.fd) }
        };
        if rc != 0 {
            return Err(Error::with_message(
                ErrorCode::IoErrFsync,
                std::io::Error::from_raw_os_error(get_errno()).to_string(),
            ));
        }
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } != 0 {
            return Err(error_from_errno(get_errno()));
        }
        Ok(st.st_size as i64)
    }

    fn lock(&self, level: LockLevel) -> Result<()> {
        let cur = self.level();
        if cur >= level {
            return Ok(());
        }

        // The ladder never jumps: SHARED comes only from NONE, PENDING is
        // never requested directly.
        debug_assert!(level != LockLevel::Pending);
        debug_assert!(cur != LockLevel::None || level == LockLevel::Shared);

        let mut table = lock_inode_table();
        let entry = table.entry(self.dev_ino).or_insert_with(|| InodeLockInfo {
            level: LockLevel::None,
            n_shared: 0,
            pending_fds: Vec::new(),
        });

        // Another handle in this process holds a level that precludes the
        // requested one.
        if cur != entry.level
            && (entry.level >= LockLevel::Pending || level > LockLevel::Shared)
        {
            return Err(Error::new(ErrorCode::Busy));
        }

        // Join an existing in-process SHARED or RESERVED holder by
        // reference count alone.
        if level == LockLevel::Shared
            && (entry.level == LockLevel::Shared || entry.level == LockLevel::Reserved)
        {
            entry.n_shared += 1;
            self.set_level(LockLevel::Shared);
            return Ok(());
        }

        if level == LockLevel::Shared {
            // A transient PENDING read lock fences new readers behind any
            // writer waiting to go exclusive.
            self.fcntl_lock(libc::F_RDLCK as libc::c_short, PENDING_BYTE, 1)?;
            let rc = self.fcntl_lock(libc::F_RDLCK as libc::c_short, SHARED_FIRST, SHARED_SIZE);
            let _ = self.fcntl_lock(libc::F_UNLCK as libc::c_short, PENDING_BYTE, 1);
            rc?;
            entry.level = LockLevel::Shared;
            entry.n_shared = 1;
            self.set_level(LockLevel::Shared);
            return Ok(());
        }

        if level == LockLevel::Exclusive && entry.n_shared > 1 {
            // A sibling handle still holds SHARED; our own write lock
            // would silently replace it.
            return Err(Error::new(ErrorCode::Busy));
        }

        match level {
            LockLevel::Reserved => {
                self.fcntl_lock(libc::F_WRLCK as libc::c_short, RESERVED_BYTE, 1)?;
                entry.level = LockLevel::Reserved;
                self.set_level(LockLevel::Reserved);
            }
            LockLevel::Exclusive => {
                // Step through PENDING so no new readers arrive while the
                // existing ones drain.
                if cur < LockLevel::Pending {
                    self.fcntl_lock(libc::F_WRLCK as libc::c_short, PENDING_BYTE, 1)?;
                    entry.level = LockLevel::Pending;
                    self.set_level(LockLevel::Pending);
                }
                self.fcntl_lock(libc::F_WRLCK as libc::c_short, SHARED_FIRST, SHARED_SIZE)?;
                entry.level = LockLevel::Exclusive;
                self.set_level(LockLevel::Exclusive);
            }
            _ => return Err(Error::new(ErrorCode::Misuse)),
        }

        Ok(())
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        debug_assert!(level <= LockLevel::Shared);
        let cur = self.level();
        if cur <= level {
            return Ok(());
        }

        let mut table = lock_inode_table();
        let entry = match table.get_mut(&self.dev_ino) {
            Some(entry) => entry,
            None => {
                self.set_level(level);
                return Ok(());
            }
        };

        if cur > LockLevel::Shared {
            // Put the read lock back on the shared range before the write
            // locks go away, then clear PENDING and RESERVED with a single
            // unlock over the two adjacent bytes.
            if level == LockLevel::Shared {
                self.fcntl_lock(libc::F_RDLCK as libc::c_short, SHARED_FIRST, SHARED_SIZE)?;
            }
            self.fcntl_lock(libc::F_UNLCK as libc::c_short, PENDING_BYTE, 2)?;
            entry.level = LockLevel::Shared;
            self.set_level(LockLevel::Shared);
        }

        if level == LockLevel::None {
            entry.n_shared = entry.n_shared.saturating_sub(1);
            let mut rc = Ok(());
            if entry.n_shared == 0 {
                rc = self.fcntl_lock(libc::F_UNLCK as libc::c_short, 0, 0);
                for fd in entry.pending_fds.drain(..) {
                    unsafe { libc::close(fd) };
                }
                table.remove(&self.dev_ino);
            }
            self.set_level(LockLevel::None);
            rc?;
        }

        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        // A handle in this process may hold it.
        {
            let table = lock_inode_table();
            if let Some(entry) = table.get(&self.dev_ino) {
                if entry.level >= LockLevel::Reserved {
                    return Ok(true);
                }
            }
        }

        // Otherwise probe the RESERVED byte.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = RESERVED_BYTE as libc::off_t;
        fl.l_len = 1;

        let rc = unsafe { libc::fcntl(self.fd, libc::F_GETLK, &mut fl) };
        if rc < 0 {
            return Err(Error::with_message(
                ErrorCode::IoErrLock,
                std::io::Error::from_raw_os_error(get_errno()).to_string(),
            ));
        }
        Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        let _ = VfsFile::unlock(self, LockLevel::None);

        let deferred = {
            let mut table = lock_inode_table();
            match table.get_mut(&self.dev_ino) {
                Some(entry) if entry.n_shared > 0 => {
                    // A sibling handle still holds a lock on this inode;
                    // closing now would drop it too.
                    entry.pending_fds.push(self.fd);
                    true
                }
                Some(_) => {
                    table.remove(&self.dev_ino);
                    false
                }
                None => false,
            }
        };
        if !deferred {
            unsafe { libc::close(self.fd) };
        }

        if self.delete_on_close {
            if let Some(path) = &self.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Register the Unix VFS as the process default
pub fn register_unix_vfs() {
    crate::os::vfs::vfs_register(Arc::new(UnixVfs::new()), true);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_pair(dir: &tempfile::TempDir) -> (Box<dyn VfsFile>, Box<dyn VfsFile>) {
        let vfs = UnixVfs::new();
        let path = dir.path().join("test.db");
        let path = path.to_str().unwrap();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        let a = vfs.open(Some(path), flags).unwrap();
        let b = vfs.open(Some(path), flags).unwrap();
        (a, b)
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = UnixVfs::new();
        let path = dir.path().join("rw.db");
        let file = vfs
            .open(
                Some(path.to_str().unwrap()),
                OpenFlags::READWRITE | OpenFlags::CREATE,
            )
            .unwrap();

        file.write(b"hello pager", 0).unwrap();
        file.write(b"tail", 100).unwrap();
        assert_eq!(file.file_size().unwrap(), 104);

        let mut buf = [0u8; 11];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello pager");
    }

    #[test]
    fn test_short_read_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = UnixVfs::new();
        let path = dir.path().join("short.db");
        let file = vfs
            .open(
                Some(path.to_str().unwrap()),
                OpenFlags::READWRITE | OpenFlags::CREATE,
            )
            .unwrap();
        file.write(&[0xAA; 4], 0).unwrap();

        let mut buf = [0xFFu8; 8];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 4, "only four bytes exist");
        assert_eq!(&buf[..4], &[0xAA; 4]);
        assert_eq!(&buf[4..], &[0; 4], "tail must be zero-filled");
    }

    #[test]
    fn test_lock_ladder_progression() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = open_pair(&dir);

        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        assert!(
            b.check_reserved_lock().unwrap(),
            "reserved lock must be visible through the second handle"
        );

        a.lock(LockLevel::Exclusive).unwrap();
        a.unlock(LockLevel::Shared).unwrap();
        assert!(!b.check_reserved_lock().unwrap());
        a.unlock(LockLevel::None).unwrap();
    }

    #[test]
    fn test_shared_lock_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = open_pair(&dir);

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();

        a.lock(LockLevel::Reserved).unwrap();
        let err = b.lock(LockLevel::Reserved).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy, "only one RESERVED at a time");

        a.unlock(LockLevel::None).unwrap();
        b.lock(LockLevel::Reserved).unwrap();
        b.unlock(LockLevel::None).unwrap();
    }

    #[test]
    fn test_exclusive_blocked_by_second_shared() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = open_pair(&dir);

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();

        let err = a.lock(LockLevel::Exclusive).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy, "sibling reader blocks exclusive");

        b.unlock(LockLevel::None).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();
        a.unlock(LockLevel::None).unwrap();
    }

    #[test]
    fn test_shared_blocked_while_writer_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = open_pair(&dir);

        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();

        let err = b.lock(LockLevel::Shared).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy, "readers wait out the writer");

        a.unlock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        a.unlock(LockLevel::None).unwrap();
        b.unlock(LockLevel::None).unwrap();
    }

    #[test]
    fn test_delete_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = UnixVfs::new();
        let path = dir.path().join("doomed.db");
        let path_str = path.to_str().unwrap().to_string();

        let file = vfs
            .open(
                Some(&path_str),
                OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE,
            )
            .unwrap();
        file.write(b"x", 0).unwrap();
        assert!(vfs.access(&path_str, AccessFlags::EXISTS).unwrap());

        drop(file);
        assert!(!vfs.access(&path_str, AccessFlags::EXISTS).unwrap());
    }

    #[test]
    fn test_temp_file_is_anonymous() {
        let vfs = UnixVfs::new();
        let file = vfs
            .open(None, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        file.write(b"scratch", 0).unwrap();
        let mut buf = [0u8; 7];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"scratch");
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = UnixVfs::new();
        let path = dir.path().join("absent.db");
        assert!(vfs.delete(path.to_str().unwrap(), false).is_ok());
    }

    #[test]
    fn test_full_pathname() {
        let vfs = UnixVfs::new();
        assert_eq!(vfs.full_pathname("/a/b.db").unwrap(), "/a/b.db");
        let rel = vfs.full_pathname("b.db").unwrap();
        assert!(rel.starts_with('/'), "relative paths become absolute");
        assert!(rel.ends_with("b.db"));
    }
}
