//! Storage capability surface.
//!
//! The low-level storage driver (SD card on the real device) is an external
//! collaborator. Everything above it talks to this trait, which mirrors the
//! driver's primitive surface: open/read/write/rename/exists plus a
//! power-saving `sleep` that transparently reinitializes on the next access.
//!
//! Every operation degrades to a non-fatal [`StorageError`]; nothing in the
//! core treats a storage failure as a reason to halt.

use heapless::String;
use thiserror_no_std::Error;

/// Longest path the core ever builds (`/notes/<name>.txt` fits easily).
pub const MAX_PATH_LEN: usize = 96;
/// Longest directory entry name the catalog accepts.
pub const MAX_NAME_LEN: usize = 64;

pub type PathString = String<MAX_PATH_LEN>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Device absent, asleep, or not yet initialized. Next access retries.
    #[error("storage device unavailable")]
    Unavailable,
    #[error("no such file or directory")]
    NotFound,
    #[error("path or name exceeds the supported length")]
    PathTooLong,
    #[error("device is full")]
    Full,
    #[error("underlying driver error")]
    Io,
}

/// One entry yielded by [`StorageService::iter_dir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String<MAX_NAME_LEN>,
    pub is_directory: bool,
    pub size: u64,
}

/// Exclusive-owner file/directory primitives consumed by the core.
///
/// Only one logical operation touches storage at a time; implementations may
/// therefore open and close the underlying volume per call.
pub trait StorageService {
    fn exists(&mut self, path: &str) -> Result<bool, StorageError>;
    fn mkdir(&mut self, path: &str) -> Result<(), StorageError>;
    fn remove(&mut self, path: &str) -> Result<(), StorageError>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError>;
    fn file_size(&mut self, path: &str) -> Result<u64, StorageError>;

    /// Read the whole file into `buf`, returning the number of bytes read.
    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8])
    -> Result<usize, StorageError>;

    /// Create or truncate `path` and write `data`, returning bytes written.
    ///
    /// A short return is not an error at this layer; the caller is expected
    /// to verify the count (the atomic-save protocol depends on this).
    fn write(&mut self, path: &str, data: &[u8]) -> Result<usize, StorageError>;

    fn iter_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), StorageError>;

    /// Release the device to low power. The next access reinitializes it.
    fn sleep(&mut self);
}
