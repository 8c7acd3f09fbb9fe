//! Injected host services
// (c) 2024 Ross Younger
//!
//! Everything the engine needs from the host process beyond the user
//! record and the filesystems: the connection registry, the quota store,
//! the pre-action hook and the transfer factory. They are injected
//! rather than global so tests (and embedders with unusual topologies)
//! can supply their own.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::access::{User, VirtualFolder};
use crate::error::ScpError;
use crate::transfer::TransferFactory;

/// Outcome of a disk-quota check for one prospective write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskQuota {
    /// Whether the write may proceed at all.
    pub has_space: bool,
    /// Remaining byte budget; zero means unlimited.
    pub allowed_size: i64,
}

impl Default for DiskQuota {
    fn default() -> Self {
        Self {
            has_space: true,
            allowed_size: 0,
        }
    }
}

/// Remaining transfer-byte budgets for one user.
///
/// Zero means unlimited; a store that has exhausted a budget reports a
/// negative value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransferQuota {
    pub allowed_total_size: i64,
    pub allowed_ul_size: i64,
    pub allowed_dl_size: i64,
}

impl TransferQuota {
    #[must_use]
    pub fn has_upload_space(&self) -> bool {
        self.allowed_total_size >= 0 && self.allowed_ul_size >= 0
    }

    #[must_use]
    pub fn has_download_space(&self) -> bool {
        self.allowed_total_size >= 0 && self.allowed_dl_size >= 0
    }
}

/// The host's quota accounting.
///
/// The engine consults this before bytes flow and adjusts it directly
/// only for the overwrite pre-credit (§ upload); everything else is
/// committed by the transfer itself at close.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Disk and transfer budgets for one prospective file write.
    async fn has_space(
        &self,
        user: &dyn User,
        is_new_file: bool,
        is_dir: bool,
        virtual_path: &str,
    ) -> (DiskQuota, TransferQuota);

    /// Transfer budgets for a read.
    async fn transfer_quota(&self, user: &dyn User) -> TransferQuota;

    /// The byte cap for one upload, derived from the disk budget; zero
    /// means uncapped.
    fn max_write_size(&self, quota: DiskQuota, file_size: i64, resume_supported: bool) -> i64;

    /// Adjusts the user's stored usage by `files` / `size`.
    async fn update_user_quota(&self, user: &dyn User, files: i64, size: i64);

    /// Adjusts a virtual folder's stored usage by `files` / `size`.
    async fn update_folder_quota(
        &self,
        folder: &VirtualFolder,
        user: &dyn User,
        files: i64,
        size: i64,
    );
}

/// Which operation a pre-action hook is being asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOp {
    PreUpload,
    PreDownload,
}

/// A host-supplied veto point invoked before any file transfer.
#[async_trait]
pub trait PreActionHook: Send + Sync {
    /// Returns an error to deny the operation; the engine reports any
    /// denial to the peer as permission-denied.
    async fn execute(
        &self,
        op: HookOp,
        resolved: &Path,
        virtual_path: &str,
        size: i64,
        truncate: bool,
    ) -> Result<(), ScpError>;
}

/// The process-wide connection tracker, injected per § design notes.
pub trait ConnectionRegistry: Send + Sync {
    /// Registers a new SCP command; an error here rejects the whole
    /// command before any protocol byte is exchanged.
    fn add(&self, id: &str, username: &str) -> Result<(), ScpError>;
    fn remove(&self, id: &str);
    /// Enforces per-user concurrent transfer-count limits.
    fn is_new_transfer_allowed(&self, username: &str) -> Result<(), ScpError>;
    /// Records activity on a connection, driving the host's idle
    /// timeouts.
    fn touch(&self, id: &str);
}

/// The bundle of host services one SCP command runs against.
#[derive(Clone)]
pub struct SessionServices {
    pub registry: Arc<dyn ConnectionRegistry>,
    pub quota: Arc<dyn QuotaStore>,
    pub pre_action: Arc<dyn PreActionHook>,
    pub transfers: Arc<dyn TransferFactory>,
}
