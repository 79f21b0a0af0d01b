//! Core type aliases and flag sets
//!
//! This module defines the foundational numeric aliases, file-open and
//! sync flag sets, and the lock-level ladder shared by the OS layer,
//! the pager, and the B-tree.

use bitflags::bitflags;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type (u32 in SQLite)
pub type Pgno = u32;

/// Row ID type (i64 in SQLite)
pub type RowId = i64;

/// Database file offset
pub type DbOffset = i64;

/// Byte count type
pub type ByteCount = usize;

// ============================================================================
// VFS Flags and Types
// ============================================================================

bitflags! {
    /// File open flags (SQLITE_OPEN_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READONLY       = 0x00000001;
        const READWRITE      = 0x00000002;
        const CREATE         = 0x00000004;
        const DELETEONCLOSE  = 0x00000008;
        const EXCLUSIVE      = 0x00000010;
        const MEMORY         = 0x00000080;
        const MAIN_DB        = 0x00000100;
        const TEMP_DB        = 0x00000200;
        const TRANSIENT_DB   = 0x00000400;
        const MAIN_JOURNAL   = 0x00000800;
        const TEMP_JOURNAL   = 0x00001000;
        const SHAREDCACHE    = 0x00020000;
        const PRIVATECACHE   = 0x00040000;
    }

    /// Sync flags for VfsFile::sync()
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x00002;
        const FULL     = 0x00003;
        const DATAONLY = 0x00010;
    }

    /// Access check flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const EXISTS    = 0;
        const READWRITE = 1;
        const READ      = 2;
    }

    /// Device characteristics (SQLITE_IOCAP_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC                 = 0x00000001;
        const ATOMIC512              = 0x00000002;
        const ATOMIC1K               = 0x00000004;
        const ATOMIC2K               = 0x00000008;
        const ATOMIC4K               = 0x00000010;
        const ATOMIC8K               = 0x00000020;
        const ATOMIC16K              = 0x00000040;
        const ATOMIC32K              = 0x00000080;
        const ATOMIC64K              = 0x00000100;
        const SAFE_APPEND            = 0x00000200;
        const SEQUENTIAL             = 0x00000400;
        const UNDELETABLE_WHEN_OPEN  = 0x00000800;
        const POWERSAFE_OVERWRITE    = 0x00001000;
        const IMMUTABLE              = 0x00002000;
    }
}

/// Lock levels for file locking
///
/// The ladder is strict: SHARED requires nothing, RESERVED requires
/// SHARED, PENDING is the internal step before EXCLUSIVE, and EXCLUSIVE
/// requires PENDING. The ordering of the enum values is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum LockLevel {
    /// No lock held
    #[default]
    None = 0,
    /// Shared (read) lock
    Shared = 1,
    /// Reserved lock (preparing to write)
    Reserved = 2,
    /// Pending lock (waiting for exclusive)
    Pending = 3,
    /// Exclusive (write) lock
    Exclusive = 4,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READWRITE));
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.contains(OpenFlags::READONLY));
    }

    #[test]
    fn test_sync_flags() {
        let flags = SyncFlags::FULL | SyncFlags::DATAONLY;
        assert!(flags.contains(SyncFlags::FULL));
        assert!(flags.contains(SyncFlags::DATAONLY));
    }
}
