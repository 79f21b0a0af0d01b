//! Virtual File System trait and registry
//!
//! This module defines the VFS abstraction layer that provides
//! platform-independent file and OS operations, mirroring SQLite's os.c
//! interface. Platform implementations register themselves with the
//! process-wide registry; the pager resolves a VFS by name (or the
//! default) at open time.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::types::{AccessFlags, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags};

// ============================================================================
// VFS File Trait
// ============================================================================

/// File handle abstraction (sqlite3_file)
///
/// All methods take `&self`; implementations use positioned I/O and keep
/// their lock bookkeeping behind interior mutability so one handle can be
/// shared through a `Box<dyn VfsFile>`.
pub trait VfsFile: Send + Sync {
    /// Read from the file at the given offset. Short reads zero-fill the
    /// tail of `buf` and return the byte count actually read.
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize>;

    /// Write to the file at the given offset.
    fn write(&self, buf: &[u8], offset: i64) -> Result<usize>;

    /// Truncate the file to the given size.
    fn truncate(&self, size: i64) -> Result<()>;

    /// Sync file contents to durable storage.
    fn sync(&self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self) -> Result<i64>;

    /// Escalate to the given lock level. Never blocks indefinitely;
    /// returns `Busy` when a competing holder is in the way.
    fn lock(&self, level: LockLevel) -> Result<()>;

    /// Release down to the given lock level (`Shared` or `None`).
    fn unlock(&self, level: LockLevel) -> Result<()>;

    /// True when some handle (this process or another) holds RESERVED
    /// or better on the file.
    fn check_reserved_lock(&self) -> Result<bool>;

    /// Sector size for this file
    fn sector_size(&self) -> i32 {
        4096
    }

    /// Device characteristics
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }
}

impl std::fmt::Debug for dyn VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn VfsFile")
    }
}

// ============================================================================
// VFS Trait
// ============================================================================

/// Virtual File System - platform abstraction (sqlite3_vfs)
pub trait Vfs: Send + Sync {
    /// VFS name (e.g., "unix", "win32", "mem")
    fn name(&self) -> &str;

    /// Maximum pathname length supported
    fn max_pathname(&self) -> i32 {
        1024
    }

    /// Open a file. `None` asks for an anonymous temporary file.
    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;

    /// Delete a file
    fn delete(&self, path: &str, sync_dir: bool) -> Result<()>;

    /// Check if a file exists / is accessible
    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool>;

    /// Get full pathname from a relative path
    fn full_pathname(&self, path: &str) -> Result<String>;

    /// Fill buffer with random bytes
    fn randomness(&self, buf: &mut [u8]) -> i32;

    /// Sleep for the given microseconds, returns actual sleep time
    fn sleep(&self, microseconds: i32) -> i32;

    /// Current time as a Julian day number
    fn current_time(&self) -> f64;
}

// ============================================================================
// VFS Registry
// ============================================================================

/// Process-wide VFS registry
pub struct VfsRegistry {
    vfs_list: Vec<Arc<dyn Vfs>>,
    default_vfs: Option<Arc<dyn Vfs>>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        Self {
            vfs_list: Vec::new(),
            default_vfs: None,
        }
    }

    /// Register a VFS implementation, replacing one of the same name.
    pub fn register(&mut self, vfs: Arc<dyn Vfs>, make_default: bool) {
        let name = vfs.name().to_string();
        self.vfs_list.retain(|v| v.name() != name);
        if make_default || self.default_vfs.is_none() {
            self.default_vfs = Some(vfs.clone());
        }
        self.vfs_list.push(vfs);
    }

    /// Unregister a VFS by name
    pub fn unregister(&mut self, name: &str) {
        let was_default = self
            .default_vfs
            .as_ref()
            .map(|v| v.name() == name)
            .unwrap_or(false);

        self.vfs_list.retain(|v| v.name() != name);

        if was_default {
            self.default_vfs = self.vfs_list.first().cloned();
        }
    }

    /// Find a VFS by name, or return the default for `None`
    pub fn find(&self, name: Option<&str>) -> Option<Arc<dyn Vfs>> {
        match name {
            None => self.default_vfs.clone(),
            Some(name) => self.vfs_list.iter().find(|v| v.name() == name).cloned(),
        }
    }
}

impl Default for VfsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref VFS_REGISTRY: Mutex<VfsRegistry> = Mutex::new(VfsRegistry::new());
}

// ============================================================================
// Public API Functions
// ============================================================================

/// Find a VFS by name (or return the default). Registers the platform
/// implementations on first use.
pub fn vfs_find(name: Option<&str>) -> Option<Arc<dyn Vfs>> {
    let found = VFS_REGISTRY.lock().ok()?.find(name);
    if found.is_some() {
        return found;
    }
    os_init();
    VFS_REGISTRY.lock().ok()?.find(name)
}

/// Register a VFS
pub fn vfs_register(vfs: Arc<dyn Vfs>, make_default: bool) {
    if let Ok(mut registry) = VFS_REGISTRY.lock() {
        registry.register(vfs, make_default);
    }
}

/// Unregister a VFS by name
pub fn vfs_unregister(name: &str) {
    if let Ok(mut registry) = VFS_REGISTRY.lock() {
        registry.unregister(name);
    }
}

// ============================================================================
// OS Layer Init / Teardown
// ============================================================================

/// Initialize the OS layer: register the platform VFS as the default and
/// the in-memory VFS under "mem". Safe to call more than once.
pub fn os_init() {
    #[cfg(unix)]
    crate::os::unix::register_unix_vfs();

    #[cfg(windows)]
    crate::os::windows::register_windows_vfs();

    crate::os::mem::register_mem_vfs();
}

/// Tear down the OS layer, dropping every registered VFS.
pub fn os_end() {
    if let Ok(mut registry) = VFS_REGISTRY.lock() {
        *registry = VfsRegistry::new();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorCode};

    struct NullVfs {
        name: &'static str,
    }

    impl Vfs for NullVfs {
        fn name(&self) -> &str {
            self.name
        }
        fn open(&self, _path: Option<&str>, _flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
            Err(Error::new(ErrorCode::CantOpen))
        }
        fn delete(&self, _path: &str, _sync_dir: bool) -> Result<()> {
            Ok(())
        }
        fn access(&self, _path: &str, _flags: AccessFlags) -> Result<bool> {
            Ok(false)
        }
        fn full_pathname(&self, path: &str) -> Result<String> {
            Ok(path.to_string())
        }
        fn randomness(&self, _buf: &mut [u8]) -> i32 {
            0
        }
        fn sleep(&self, microseconds: i32) -> i32 {
            microseconds
        }
        fn current_time(&self) -> f64 {
            0.0
        }
    }

    #[test]
    fn test_registry_register_find_unregister() {
        let mut registry = VfsRegistry::new();
        assert!(registry.find(None).is_none());

        registry.register(Arc::new(NullVfs { name: "a" }), false);
        registry.register(Arc::new(NullVfs { name: "b" }), false);

        // First registration becomes the default.
        assert_eq!(registry.find(None).unwrap().name(), "a");
        assert_eq!(registry.find(Some("b")).unwrap().name(), "b");
        assert!(registry.find(Some("missing")).is_none());

        registry.register(Arc::new(NullVfs { name: "b" }), true);
        assert_eq!(registry.find(None).unwrap().name(), "b");

        registry.unregister("b");
        assert_eq!(registry.find(None).unwrap().name(), "a");
    }

    #[test]
    fn test_platform_vfs_registered() {
        let vfs = vfs_find(None);
        assert!(vfs.is_some());
        assert!(vfs_find(Some("mem")).is_some());
    }
}
