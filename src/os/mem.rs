//! In-memory VFS
//!
//! Backs ":memory:" databases and transient files without touching disk.
//! Anonymous opens get a private buffer. Named opens share one buffer
//! per name through a process-wide store, so separate handles observe
//! each other's writes and locks the same way they would on a real file.

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{Vfs, VfsFile};
use crate::types::{AccessFlags, LockLevel, OpenFlags, SyncFlags};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Shared File Store
// ============================================================================

/// File body plus the lock state shared by every handle on it. Plays the
/// role the inode table plays for the Unix VFS.
struct MemFileData {
    data: Vec<u8>,
    /// Highest lock level held by any handle
    level: LockLevel,
    /// Number of handles holding SHARED or better
    n_shared: u32,
}

impl MemFileData {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            level: LockLevel::None,
            n_shared: 0,
        }
    }
}

lazy_static::lazy_static! {
    static ref MEM_FILES: Mutex<HashMap<String, Arc<Mutex<MemFileData>>>> =
        Mutex::new(HashMap::new());
}

// ============================================================================
// Memory VFS
// ============================================================================

/// In-memory VFS implementation
pub struct MemVfs {
    name: String,
}

impl MemVfs {
    /// Create a new in-memory VFS with the default name "mem"
    pub fn new() -> Self {
        Self {
            name: "mem".to_string(),
        }
    }
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MemVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let (name, data) = match path {
            None | Some("") | Some(":memory:") => {
                (None, Arc::new(Mutex::new(MemFileData::new())))
            }
            Some(p) => {
                let mut files = guard(&MEM_FILES);
                let data = match files.get(p) {
                    Some(data) => data.clone(),
                    None => {
                        if !flags.contains(OpenFlags::CREATE) {
                            return Err(Error::with_message(
                                ErrorCode::CantOpen,
                                format!("no such in-memory file: {}", p),
                            ));
                        }
                        let data = Arc::new(Mutex::new(MemFileData::new()));
                        files.insert(p.to_string(), data.clone());
                        data
                    }
                };
                (Some(p.to_string()), data)
            }
        };

        Ok(Box::new(MemFile {
            name,
            data,
            level: Mutex::new(LockLevel::None),
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
        }))
    }

    fn delete(&self, path: &str, _sync_dir: bool) -> Result<()> {
        guard(&MEM_FILES).remove(path);
        Ok(())
    }

    fn access(&self, path: &str, _flags: AccessFlags) -> Result<bool> {
        Ok(guard(&MEM_FILES).contains_key(path))
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut seed = now.as_nanos() as u64 ^ 0x2545_f491_4f6c_dd1d;
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
        2440587.5 + now.as_secs_f64() / 86400.0
    }
}

// ============================================================================
// Memory File Handle
// ============================================================================

/// Handle onto an in-memory file
pub struct MemFile {
    name: Option<String>,
    data: Arc<Mutex<MemFileData>>,
    level: Mutex<LockLevel>,
    delete_on_close: bool,
}

impl VfsFile for MemFile {
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let shared = guard(&self.data);
        let offset = offset.max(0) as usize;
        if offset >= shared.data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let n = buf.len().min(shared.data.len() - offset);
        buf[..n].copy_from_slice(&shared.data[offset..offset + n]);
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        let mut shared = guard(&self.data);
        let offset = offset.max(0) as usize;
        let end = offset + buf.len();
        if shared.data.len() < end {
            shared.data.resize(end, 0);
        }
        shared.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, size: i64) -> Result<()> {
        let mut shared = guard(&self.data);
        let size = size.max(0) as usize;
        if shared.data.len() > size {
            shared.data.truncate(size);
        }
        Ok(())
    }

    fn sync(&self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        Ok(guard(&self.data).data.len() as i64)
    }

    fn lock(&self, level: LockLevel) -> Result<()> {
        let mut own = guard(&self.level);
        let cur = *own;
        if cur >= level {
            return Ok(());
        }

        let mut shared = guard(&self.data);

        // Same arbitration as between handles on one inode: a handle at a
        // different, stronger level precludes the request.
        if cur != shared.level
            && (shared.level >= LockLevel::Pending || level > LockLevel::Shared)
        {
            return Err(Error::new(ErrorCode::Busy));
        }

        match level {
            LockLevel::Shared => {
                shared.n_shared += 1;
                if shared.level < LockLevel::Shared {
                    shared.level = LockLevel::Shared;
                }
                *own = LockLevel::Shared;
            }
            LockLevel::Reserved => {
                shared.level = LockLevel::Reserved;
                *own = LockLevel::Reserved;
            }
            LockLevel::Exclusive => {
                if shared.n_shared > 1 {
                    return Err(Error::new(ErrorCode::Busy));
                }
                shared.level = LockLevel::Exclusive;
                *own = LockLevel::Exclusive;
            }
            _ => return Err(Error::new(ErrorCode::Misuse)),
        }

        Ok(())
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        let mut own = guard(&self.level);
        let cur = *own;
        if cur <= level {
            return Ok(());
        }

        let mut shared = guard(&self.data);
        if cur > LockLevel::Shared {
            shared.level = LockLevel::Shared;
            *own = LockLevel::Shared;
        }
        if level == LockLevel::None {
            shared.n_shared = shared.n_shared.saturating_sub(1);
            if shared.n_shared == 0 {
                shared.level = LockLevel::None;
            }
            *own = LockLevel::None;
        }
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        Ok(guard(&self.data).level >= LockLevel::Reserved)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        let _ = VfsFile::unlock(self, LockLevel::None);
        if self.delete_on_close {
            if let Some(name) = &self.name {
                guard(&MEM_FILES).remove(name);
            }
        }
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Register the in-memory VFS under the name "mem"
pub fn register_mem_vfs() {
    crate::os::vfs::vfs_register(Arc::new(MemVfs::new()), false);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_files_share_content() {
        let vfs = MemVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        let a = vfs.open(Some("shared-content"), flags).unwrap();
        let b = vfs.open(Some("shared-content"), flags).unwrap();

        a.write(b"written by a", 0).unwrap();
        let mut buf = [0u8; 12];
        b.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"written by a");

        vfs.delete("shared-content", false).unwrap();
    }

    #[test]
    fn test_anonymous_files_are_private() {
        let vfs = MemVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        let a = vfs.open(None, flags).unwrap();
        let b = vfs.open(Some(":memory:"), flags).unwrap();

        a.write(b"private", 0).unwrap();
        assert_eq!(b.file_size().unwrap(), 0, "anonymous handles never share");
    }

    #[test]
    fn test_open_missing_without_create() {
        let vfs = MemVfs::new();
        let err = vfs
            .open(Some("never-created"), OpenFlags::READWRITE)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CantOpen);
    }

    #[test]
    fn test_lock_arbitration() {
        let vfs = MemVfs::new();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        let a = vfs.open(Some("lock-arb"), flags).unwrap();
        let b = vfs.open(Some("lock-arb"), flags).unwrap();

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        assert!(b.check_reserved_lock().unwrap());
        assert_eq!(
            b.lock(LockLevel::Reserved).unwrap_err().code,
            ErrorCode::Busy
        );
        assert_eq!(
            a.lock(LockLevel::Exclusive).unwrap_err().code,
            ErrorCode::Busy,
            "exclusive must wait for the second reader"
        );

        b.unlock(LockLevel::None).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(
            b.lock(LockLevel::Shared).unwrap_err().code,
            ErrorCode::Busy
        );

        a.unlock(LockLevel::None).unwrap();
        b.lock(LockLevel::Shared).unwrap();

        vfs.delete("lock-arb", false).unwrap();
    }

    #[test]
    fn test_truncate_and_grow() {
        let vfs = MemVfs::new();
        let f = vfs
            .open(None, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        f.write(&[1u8; 100], 0).unwrap();
        f.truncate(40).unwrap();
        assert_eq!(f.file_size().unwrap(), 40);

        f.write(&[2u8; 10], 80).unwrap();
        assert_eq!(f.file_size().unwrap(), 90);
        let mut buf = [9u8; 10];
        f.read(&mut buf, 45).unwrap();
        assert_eq!(buf, [0u8; 10], "gap pages read back as zeroes");
    }
}
