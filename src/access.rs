//! Users, permissions and file-pattern policy
// (c) 2024 Ross Younger
//!
//! The user record and its authorization data live in the host's data
//! store; the engine consumes them through [`User`]. All checks here are
//! pure lookups against data the host loaded at authentication time —
//! the record is immutable for the lifetime of one command.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ScpError;
use crate::vfs::{FileStat, Fs};

/// The per-path permissions SCP cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Create new files below a directory.
    Upload,
    /// Replace existing files.
    Overwrite,
    /// Read files and walk directories.
    Download,
    /// Create directories.
    CreateDirs,
}

/// What to tell the peer when a file-pattern rule denies access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePolicy {
    /// The file is reported as forbidden.
    #[default]
    Deny,
    /// The file is reported as nonexistent.
    Hide,
}

/// The peer-facing error for a file denied by pattern policy.
#[must_use]
pub fn denied_file_error(policy: FilePolicy) -> ScpError {
    match policy {
        FilePolicy::Hide => ScpError::Fs(io::Error::new(
            io::ErrorKind::NotFound,
            "file does not exist",
        )),
        FilePolicy::Deny => ScpError::PermissionDenied,
    }
}

/// A filesystem mounted inside the user's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFolder {
    pub name: String,
    /// Mount point, as an absolute virtual path.
    pub virtual_path: String,
}

/// An authenticated user, as loaded by the host.
pub trait User: Send + Sync {
    fn username(&self) -> &str;
    fn uid(&self) -> u32;
    fn gid(&self) -> u32;

    /// Does this user hold `perm` for `virtual_path`?
    fn has_perm(&self, perm: Permission, virtual_path: &str) -> bool;

    /// Evaluates the file-pattern allow/deny rules for a path. On denial
    /// the returned policy selects the peer-facing error; see
    /// [`denied_file_error`].
    fn is_file_allowed(&self, virtual_path: &str) -> (bool, FilePolicy);

    /// The filesystem backend responsible for a virtual path.
    fn fs_for_path(&self, virtual_path: &str) -> io::Result<Arc<dyn Fs>>;

    /// The virtual folder containing `virtual_path`, if any. Used to
    /// charge quota against the right accounting bucket.
    fn virtual_folder_for_path(&self, virtual_path: &str) -> Option<VirtualFolder>;

    /// Synthetic directory entries for the virtual folders mounted
    /// directly under `virtual_path`. The download engine injects these
    /// into directory listings.
    fn virtual_folders_info(&self, virtual_path: &str) -> Vec<FileStat>;

    /// Removes entries of `virtual_dir` this user must not see.
    fn filter_list_dir(&self, entries: Vec<FileStat>, virtual_dir: &str) -> Vec<FileStat>;
}
