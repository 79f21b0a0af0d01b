//! Windows VFS implementation
//!
//! Overlapped positioned I/O plus the advisory locking protocol built on
//! LockFileEx byte ranges. Windows locks are owned by the handle, so
//! unlike the Unix side no process-wide bookkeeping is needed; the
//! SHARED level is represented by one byte picked from the shared range.

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{Vfs, VfsFile};
use crate::types::{AccessFlags, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags};
use std::cell::UnsafeCell;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::sync::Arc;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_DISK_FULL, ERROR_FILE_NOT_FOUND, ERROR_HANDLE_EOF,
    ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_LOCK_VIOLATION, ERROR_PATH_NOT_FOUND,
    ERROR_SHARING_VIOLATION, ERROR_WRITE_PROTECT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, DeleteFileW, FlushFileBuffers, GetFileAttributesW, GetFileSizeEx,
    GetFullPathNameW, GetTempFileNameW, GetTempPathW, LockFileEx, ReadFile, SetEndOfFile,
    SetFilePointerEx, UnlockFileEx, WriteFile, CREATE_ALWAYS, CREATE_NEW, FILE_ATTRIBUTE_NORMAL,
    FILE_BEGIN, FILE_FLAG_DELETE_ON_CLOSE, FILE_FLAG_OVERLAPPED, FILE_FLAG_RANDOM_ACCESS,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS, OPEN_EXISTING,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemTimeAsFileTime, GetTickCount64};
use windows_sys::Win32::System::Threading::{GetCurrentThreadId, Sleep};
use windows_sys::Win32::System::IO::{
    GetOverlappedResult, OVERLAPPED, OVERLAPPED_0, OVERLAPPED_0_0,
};

// ============================================================================
// Windows Constants
// ============================================================================

const MAX_PATH_LEN: usize = 260;
const FILE_SHARE_FLAGS: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;

const PENDING_BYTE: u32 = 0x4000_0000;
const RESERVED_BYTE: u32 = PENDING_BYTE + 1;
const SHARED_FIRST: u32 = PENDING_BYTE + 2;
const SHARED_SIZE: u32 = 510;
const NO_SHARED_LOCK: u16 = 0xFFFF;

// ============================================================================
// Windows VFS
// ============================================================================

/// Windows VFS implementation
pub struct WinVfs {
    name: String,
}

impl WinVfs {
    /// Create a new Windows VFS with the default name "win32"
    pub fn new() -> Self {
        Self {
            name: "win32".to_string(),
        }
    }

    fn error_from_win32_code(code: u32) -> Error {
        let msg = std::io::Error::from_raw_os_error(code as i32).to_string();
        let mapped = match code {
            ERROR_ACCESS_DENIED => ErrorCode::Perm,
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => ErrorCode::CantOpen,
            ERROR_DISK_FULL => ErrorCode::Full,
            ERROR_WRITE_PROTECT => ErrorCode::ReadOnly,
            ERROR_LOCK_VIOLATION | ERROR_SHARING_VIOLATION => ErrorCode::Busy,
            ERROR_INVALID_PARAMETER => ErrorCode::Misuse,
            _ => ErrorCode::IoErr,
        };

        Error::with_message(mapped, msg)
    }

    fn error_from_win32() -> Error {
        let code = unsafe { GetLastError() };
        Self::error_from_win32_code(code)
    }

    fn to_utf16(path: &str) -> Vec<u16> {
        OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    fn create_temp_file(&self) -> Result<String> {
        let mut temp_path = vec![0u16; MAX_PATH_LEN + 1];
        let len = unsafe { GetTempPathW(temp_path.len() as u32, temp_path.as_mut_ptr()) };
        if len == 0 || len as usize >= temp_path.len() {
            return Err(Self::error_from_win32());
        }

        let mut temp_file = vec![0u16; MAX_PATH_LEN + 1];
        let prefix = ['p' as u16, 'g' as u16, 't' as u16, 0];
        let rc = unsafe {
            GetTempFileNameW(
                temp_path.as_ptr(),
                prefix.as_ptr(),
                0,
                temp_file.as_mut_ptr(),
            )
        };
        if rc == 0 {
            return Err(Self::error_from_win32());
        }

        let end = temp_file.iter().position(|&c| c == 0).unwrap_or(0);
        Ok(String::from_utf16_lossy(&temp_file[..end]))
    }
}

impl Default for WinVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for WinVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_pathname(&self) -> i32 {
        MAX_PATH_LEN as i32
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let desired_access = if flags.contains(OpenFlags::READONLY) {
            GENERIC_READ
        } else {
            GENERIC_READ | GENERIC_WRITE
        };

        let mut attributes = FILE_ATTRIBUTE_NORMAL | FILE_FLAG_RANDOM_ACCESS | FILE_FLAG_OVERLAPPED;

        if flags.contains(OpenFlags::DELETEONCLOSE) {
            attributes |= FILE_FLAG_DELETE_ON_CLOSE;
        }

        let creation = if flags.contains(OpenFlags::CREATE) {
            if flags.contains(OpenFlags::EXCLUSIVE) {
                CREATE_NEW
            } else {
                OPEN_ALWAYS
            }
        } else if flags.contains(OpenFlags::EXCLUSIVE) {
            CREATE_ALWAYS
        } else {
            OPEN_EXISTING
        };

        let path_str = match path {
            Some(p) => p.to_string(),
            None => self.create_temp_file()?,
        };

        let wide_path = Self::to_utf16(&path_str);
        let handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                desired_access,
                FILE_SHARE_FLAGS,
                std::ptr::null(),
                creation,
                attributes,
                0,
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            return Err(Self::error_from_win32());
        }

        Ok(Box::new(WinFile {
            handle,
            path: path_str,
            lock_level: UnsafeCell::new(LockLevel::None),
            shared_lock_byte: UnsafeCell::new(NO_SHARED_LOCK),
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
        }))
    }

    fn delete(&self, path: &str, _sync_dir: bool) -> Result<()> {
        let wide_path = Self::to_utf16(path);

        // Retry around indexers and anti-virus scanners that hold files
        // open briefly.
        for _ in 0..3 {
            let rc = unsafe { DeleteFileW(wide_path.as_ptr()) };
            if rc != 0 {
                return Ok(());
            }

            let err = unsafe { GetLastError() };
            if err == ERROR_FILE_NOT_FOUND {
                return Ok(());
            }
            if err != ERROR_SHARING_VIOLATION {
                return Err(Self::error_from_win32_code(err));
            }

            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        Err(Self::error_from_win32())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let wide_path = Self::to_utf16(path);
        let attrs = unsafe { GetFileAttributesW(wide_path.as_ptr()) };

        if attrs == windows_sys::Win32::Storage::FileSystem::INVALID_FILE_ATTRIBUTES {
            let err = unsafe { GetLastError() };
            if err == ERROR_FILE_NOT_FOUND || err == ERROR_PATH_NOT_FOUND {
                return Ok(false);
            }
            return Err(Self::error_from_win32_code(err));
        }

        if flags.contains(AccessFlags::READWRITE) {
            let readonly =
                (attrs & windows_sys::Win32::Storage::FileSystem::FILE_ATTRIBUTE_READONLY) != 0;
            return Ok(!readonly);
        }

        Ok(true)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        let wide_path = Self::to_utf16(path);
        let mut buf = vec![0u16; self.max_pathname() as usize];

        let mut len = unsafe {
            GetFullPathNameW(
                wide_path.as_ptr(),
                buf.len() as u32,
                buf.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };

        if len == 0 {
            return Err(Self::error_from_win32());
        }

        if len as usize >= buf.len() {
            buf.resize(len as usize + 1, 0);
            len = unsafe {
                GetFullPathNameW(
                    wide_path.as_ptr(),
                    buf.len() as u32,
                    buf.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            };
            if len == 0 {
                return Err(Self::error_from_win32());
            }
        }

        Ok(String::from_utf16_lossy(&buf[..len as usize]))
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        let tick = unsafe { GetTickCount64() };
        let mut seed = tick ^ (unsafe { GetCurrentThreadId() } as u64) << 32;
        for b in buf.iter_mut() {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *b = (seed >> 33) as u8;
        }
        buf.len() as i32
    }

    fn sleep(&self, microseconds: i32) -> i32 {
        let milliseconds = (microseconds + 999) / 1000;
        unsafe { Sleep(milliseconds as u32) };
        milliseconds * 1000
    }

    fn current_time(&self) -> f64 {
        let mut ft = windows_sys::Win32::Foundation::FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        unsafe { GetSystemTimeAsFileTime(&mut ft) };

        let ft64 = ((ft.dwHighDateTime as u64) << 32) | (ft.dwLowDateTime as u64);

        const JD_2000: f64 = 2451545.0;
        const FILETIME_2000: u64 = 125911584000000000;
        JD_2000 + ((ft64 as f64 - FILETIME_2000 as f64) / 864000000000.0)
    }
}

// ============================================================================
// Windows File Handle
// ============================================================================

/// Windows file handle
pub struct WinFile {
    handle: HANDLE,
    path: String,
    lock_level: UnsafeCell<LockLevel>,
    /// Offset into the shared range of the byte this handle read-locked,
    /// or NO_SHARED_LOCK
    shared_lock_byte: UnsafeCell<u16>,
    delete_on_close: bool,
}

// Lock state is only mutated by the pager, which serializes access to
// the handle.
unsafe impl Send for WinFile {}
unsafe impl Sync for WinFile {}

impl Drop for WinFile {
    fn drop(&mut self) {
        let _ = VfsFile::unlock(self, LockLevel::None);
        unsafe {
            if self.handle != 0 {
                CloseHandle(self.handle);
            }
        }

        if self.delete_on_close {
            let wide_path = WinVfs::to_utf16(&self.path);
            unsafe {
                DeleteFileW(wide_path.as_ptr());
            }
        }
    }
}

impl WinFile {
    fn level(&self) -> LockLevel {
        unsafe { *self.lock_level.get() }
    }

    fn set_level(&self, level: LockLevel) {
        unsafe { *self.lock_level.get() = level };
    }

    fn lock_region(&self, offset: u32, length: u32, exclusive: bool) -> Result<()> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: offset,
                    OffsetHigh: 0,
                },
            },
            hEvent: 0,
        };

        let flags = if exclusive {
            windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK
                | windows_sys::Win32::Storage::FileSystem::LOCKFILE_FAIL_IMMEDIATELY
        } else {
            windows_sys::Win32::Storage::FileSystem::LOCKFILE_FAIL_IMMEDIATELY
        };

        let rc = unsafe { LockFileEx(self.handle, flags, 0, length, 0, &mut overlapped) };
        if rc == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_LOCK_VIOLATION {
                return Err(Error::new(ErrorCode::Busy));
            }
            return Err(WinVfs::error_from_win32_code(err));
        }

        Ok(())
    }

    fn unlock_region(&self, offset: u32, length: u32) -> Result<()> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: offset,
                    OffsetHigh: 0,
                },
            },
            hEvent: 0,
        };

        let rc = unsafe { UnlockFileEx(self.handle, 0, length, 0, &mut overlapped) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }

        Ok(())
    }

    /// Read-lock one byte of the shared range, probing forward from a
    /// per-thread starting point until a free byte is found.
    fn lock_shared_byte(&self) -> Result<()> {
        let current = unsafe { *self.shared_lock_byte.get() };
        let start = if current == NO_SHARED_LOCK {
            unsafe { GetCurrentThreadId() } % SHARED_SIZE
        } else {
            (current as u32) % SHARED_SIZE
        };

        for i in 0..SHARED_SIZE {
            let idx = (start + i) % SHARED_SIZE;
            match self.lock_region(SHARED_FIRST + idx, 1, false) {
                Ok(()) => {
                    unsafe {
                        *self.shared_lock_byte.get() = idx as u16;
                    }
                    return Ok(());
                }
                Err(err) if err.code == ErrorCode::Busy => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::new(ErrorCode::Busy))
    }

    fn unlock_shared_byte(&self) -> Result<()> {
        let current = unsafe { *self.shared_lock_byte.get() };
        if current == NO_SHARED_LOCK {
            return Ok(());
        }
        self.unlock_region(SHARED_FIRST + (current as u32) % SHARED_SIZE, 1)?;
        unsafe {
            *self.shared_lock_byte.get() = NO_SHARED_LOCK;
        }
        Ok(())
    }
}

impl VfsFile for WinFile {
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: (offset & 0xFFFF_FFFF) as u32,
                    OffsetHigh: ((offset >> 32) & 0xFFFF_FFFF) as u32,
                },
            },
            hEvent: 0,
        };

        let mut bytes_read: u32 = 0;
        let rc = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr() as *mut _,
                buf.len() as u32,
                &mut bytes_read,
                &mut overlapped,
            )
        };

        if rc == 0 {
            let mut err = unsafe { GetLastError() };
            if err == ERROR_IO_PENDING {
                let rc2 = unsafe {
                    GetOverlappedResult(self.handle, &mut overlapped, &mut bytes_read, 1)
                };
                if rc2 == 0 {
                    err = unsafe { GetLastError() };
                } else {
                    err = 0;
                }
            }
            if err != 0 && err != ERROR_HANDLE_EOF {
                return Err(WinVfs::error_from_win32_code(err));
            }
        }

        if (bytes_read as usize) < buf.len() {
            buf[bytes_read as usize..].fill(0);
        }

        Ok(bytes_read as usize)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        let mut overlapped = OVERLAPPED {
            Internal: 0,
            InternalHigh: 0,
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: (offset & 0xFFFF_FFFF) as u32,
                    OffsetHigh: ((offset >> 32) & 0xFFFF_FFFF) as u32,
                },
            },
            hEvent: 0,
        };

        let mut bytes_written: u32 = 0;
        let rc = unsafe {
            WriteFile(
                self.handle,
                buf.as_ptr() as *const _,
                buf.len() as u32,
                &mut bytes_written,
                &mut overlapped,
            )
        };

        if rc == 0 {
            let mut err = unsafe { GetLastError() };
            if err == ERROR_IO_PENDING {
                let rc2 = unsafe {
                    GetOverlappedResult(self.handle, &mut overlapped, &mut bytes_written, 1)
                };
                if rc2 == 0 {
                    err = unsafe { GetLastError() };
                } else {
                    err = 0;
                }
            }
            if err != 0 {
                return Err(WinVfs::error_from_win32_code(err));
            }
        }

        if (bytes_written as usize) != buf.len() {
            return Err(Error::new(ErrorCode::Full));
        }

        Ok(bytes_written as usize)
    }

    fn truncate(&self, size: i64) -> Result<()> {
        let rc = unsafe { SetFilePointerEx(self.handle, size, std::ptr::null_mut(), FILE_BEGIN) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }

        let rc = unsafe { SetEndOfFile(self.handle) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }

        Ok(())
    }

    fn sync(&self, _flags: SyncFlags) -> Result<()> {
        let rc = unsafe { FlushFileBuffers(self.handle) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        let mut size: i64 = 0;
        let rc = unsafe { GetFileSizeEx(self.handle, &mut size as *mut _ as *mut _) };
        if rc == 0 {
            return Err(WinVfs::error_from_win32());
        }
        Ok(size)
    }

    fn lock(&self, level: LockLevel) -> Result<()> {
        let cur = self.level();
        if cur >= level {
            return Ok(());
        }

        debug_assert!(level != LockLevel::Pending);
        debug_assert!(cur != LockLevel::None || level == LockLevel::Shared);

        let mut new_level = cur;
        let mut got_pending = false;
        let mut result: Result<()> = Ok(());

        // The PENDING byte gates both the SHARED acquisition and the
        // climb to EXCLUSIVE. When the target is SHARED it is released
        // again below.
        if cur == LockLevel::None
            || (level == LockLevel::Exclusive && cur <= LockLevel::Reserved)
        {
            self.lock_region(PENDING_BYTE, 1, true)?;
            got_pending = true;
        }

        if level == LockLevel::Shared && result.is_ok() {
            match self.lock_shared_byte() {
                Ok(()) => new_level = LockLevel::Shared,
                Err(err) => result = Err(err),
            }
        }

        if level == LockLevel::Reserved && result.is_ok() {
            match self.lock_region(RESERVED_BYTE, 1, true) {
                Ok(()) => new_level = LockLevel::Reserved,
                Err(err) => result = Err(err),
            }
        }

        if level == LockLevel::Exclusive && result.is_ok() {
            // From here the PENDING byte stays held even on failure.
            new_level = LockLevel::Pending;
            got_pending = false;
            let _ = self.unlock_shared_byte();
            match self.lock_region(SHARED_FIRST, SHARED_SIZE, true) {
                Ok(()) => new_level = LockLevel::Exclusive,
                Err(err) => {
                    // Readers are still draining. Park at PENDING with the
                    // read lock restored; the caller retries.
                    let _ = self.lock_shared_byte();
                    result = Err(err);
                }
            }
        }

        if got_pending && level == LockLevel::Shared {
            let _ = self.unlock_region(PENDING_BYTE, 1);
        }

        self.set_level(new_level);
        result
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        debug_assert!(level <= LockLevel::Shared);
        let cur = self.level();
        if cur <= level {
            return Ok(());
        }

        let mut result: Result<()> = Ok(());

        if cur == LockLevel::Exclusive {
            let _ = self.unlock_region(SHARED_FIRST, SHARED_SIZE);
            if level == LockLevel::Shared && self.lock_shared_byte().is_err() {
                // Reacquiring the read lock cannot race anyone while the
                // PENDING byte is still ours.
                result = Err(Error::new(ErrorCode::IoErrUnlock));
            }
        }
        if cur >= LockLevel::Reserved {
            let _ = self.unlock_region(RESERVED_BYTE, 1);
        }
        if level == LockLevel::None && cur >= LockLevel::Shared {
            let _ = self.unlock_shared_byte();
        }
        if cur >= LockLevel::Pending {
            let _ = self.unlock_region(PENDING_BYTE, 1);
        }

        self.set_level(level);
        result
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.level() >= LockLevel::Reserved {
            return Ok(true);
        }

        match self.lock_region(RESERVED_BYTE, 1, true) {
            Ok(()) => {
                self.unlock_region(RESERVED_BYTE, 1)?;
                Ok(false)
            }
            Err(err) if err.code == ErrorCode::Busy => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::POWERSAFE_OVERWRITE
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Register the Windows VFS as the process default
pub fn register_windows_vfs() {
    crate::os::vfs::vfs_register(Arc::new(WinVfs::new()), true);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_vfs_name() {
        let vfs = WinVfs::new();
        assert_eq!(vfs.name(), "win32");
    }

    #[test]
    fn test_lock_ladder_between_handles() {
        let vfs = WinVfs::new();
        let dir = std::env::temp_dir().join("pagetree_win_lock_test.db");
        let path = dir.to_str().unwrap();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;

        let a = vfs.open(Some(path), flags).unwrap();
        let b = vfs.open(Some(path), flags).unwrap();

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        assert!(b.check_reserved_lock().unwrap());
        assert_eq!(
            b.lock(LockLevel::Reserved).unwrap_err().code,
            ErrorCode::Busy
        );

        // Writer parks at PENDING while the reader drains; new shared
        // requests now fail.
        assert_eq!(
            a.lock(LockLevel::Exclusive).unwrap_err().code,
            ErrorCode::Busy
        );
        b.unlock(LockLevel::None).unwrap();
        assert_eq!(
            b.lock(LockLevel::Shared).unwrap_err().code,
            ErrorCode::Busy
        );

        a.lock(LockLevel::Exclusive).unwrap();
        a.unlock(LockLevel::None).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        b.unlock(LockLevel::None).unwrap();

        drop(a);
        drop(b);
        let _ = vfs.delete(path, false);
    }
}
