//! The virtual filesystem seam
// (c) 2024 Ross Younger
//!
//! The engine never touches a disk directly. Everything goes through
//! [`Fs`], which a host implements once per backend (local disk, object
//! storage, encrypted overlay, …). A user may have several backends
//! mounted into one namespace; [`crate::access::User::fs_for_path`]
//! picks the right one for a virtual path.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// How many entries the engines pull from a [`DirLister`] at a time.
pub const LISTER_BATCH_SIZE: usize = 256;

/// What kind of thing a directory entry or stat result is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// Stat data as the engine needs it.
///
/// Backends with their own stat semantics (an encrypted overlay whose
/// on-disk size differs from the plaintext size, say) must report the
/// user-visible values here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Base name of the entry.
    pub name: String,
    pub kind: FileKind,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Unix permission bits (low twelve bits); zero if the backend has
    /// no mode concept.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
}

impl FileStat {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// Invoked to discard a partially written file when a transfer fails.
pub type CancelFn = Box<dyn FnOnce() + Send>;

/// An open file, readable or writable at explicit offsets.
#[async_trait]
pub trait FileHandle: Send {
    async fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Returns the number of bytes read; `Ok(0)` is end of file.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    async fn close(&mut self) -> io::Result<()>;
}

/// Incremental directory listing. An empty batch means the listing is
/// complete.
#[async_trait]
pub trait DirLister: Send {
    async fn next(&mut self, max: usize) -> io::Result<Vec<FileStat>>;
}

/// Options for [`Fs::create`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Truncate any existing content.
    pub truncate: bool,
    /// The engine already determined the target does not exist; backends
    /// may use this to skip their own existence checks.
    pub is_new_file: bool,
}

/// One filesystem backend.
///
/// Path vocabulary: *virtual* paths are what the user sees, absolute and
/// slash-separated; *resolved* paths are concrete within this backend.
/// Only `resolve_path` and `get_relative_path` translate between the two.
#[async_trait]
pub trait Fs: Send + Sync {
    /// Translates a virtual path to a resolved path, rejecting escapes
    /// from the backend root.
    fn resolve_path(&self, virtual_path: &str) -> io::Result<PathBuf>;
    /// Translates a resolved path back to a virtual path.
    fn get_relative_path(&self, resolved: &Path) -> String;
    /// Appends one name to a resolved path.
    fn join(&self, resolved: &Path, name: &str) -> PathBuf;

    /// The temporary write path used for atomic uploads of `resolved`.
    fn atomic_upload_path(&self, resolved: &Path) -> PathBuf;
    fn is_atomic_upload_supported(&self) -> bool;
    fn is_upload_resume_supported(&self) -> bool;
    /// Whether opening with truncation reliably reclaims the old size,
    /// so quota can be debited up front.
    fn has_truncate_support(&self) -> bool;

    async fn stat(&self, resolved: &Path) -> io::Result<FileStat>;
    async fn lstat(&self, resolved: &Path) -> io::Result<FileStat>;
    async fn mkdir(&self, resolved: &Path) -> io::Result<()>;
    async fn create(
        &self,
        resolved: &Path,
        opts: CreateOptions,
    ) -> io::Result<(Box<dyn FileHandle>, Option<CancelFn>)>;
    async fn open(
        &self,
        resolved: &Path,
        offset: u64,
    ) -> io::Result<(Box<dyn FileHandle>, Option<CancelFn>)>;
    async fn read_dir(&self, resolved: &Path) -> io::Result<Box<dyn DirLister>>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Propagates ownership to a freshly created file or directory.
    /// Best-effort; the engine ignores failures.
    async fn set_owner(&self, resolved: &Path, uid: u32, gid: u32) -> io::Result<()>;
}

/// Whether a backend error means "no such file".
#[must_use]
pub fn is_not_exist(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}
