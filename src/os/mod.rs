//! OS abstraction layer: VFS, mutex primitive, platform implementations

pub mod mem;
pub mod mutex;
pub mod vfs;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;
