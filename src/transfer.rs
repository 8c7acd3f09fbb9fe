//! The transfer handle bridge
// (c) 2024 Ross Younger
//!
//! A [`Transfer`] wraps one open file for the duration of one streamed
//! copy. The host's implementation is where byte counting, quota commit
//! and audit happen, uniformly for SCP and any sibling protocol the host
//! speaks. The engine's obligations are narrow: `close` exactly once per
//! transfer, `transfer_error` before `close` on any failure, and no
//! writes beyond the declared size.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::ScpError;
use crate::services::TransferQuota;
use crate::vfs::{CancelFn, FileHandle};

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Everything the factory needs to wire one transfer up.
pub struct TransferParams {
    /// The open file.
    pub handle: Box<dyn FileHandle>,
    /// Discards partial data if the transfer fails.
    pub cancel: Option<CancelFn>,
    /// Final resolved path of the file.
    pub resolved_path: PathBuf,
    /// Where the bytes are actually written: the atomic-upload temp path
    /// when in use, otherwise identical to `resolved_path`. Promoting
    /// the temp file on a successful close is the transfer's job.
    pub write_path: PathBuf,
    /// The user-visible path, for accounting and audit.
    pub virtual_path: String,
    pub direction: TransferDirection,
    /// Starting offset; always zero for SCP (no resume on this protocol).
    pub offset: u64,
    /// Bytes already present that remain counted against quota.
    pub initial_size: i64,
    /// Cap on bytes written, from quota; zero means uncapped.
    pub max_write_size: i64,
    /// Bytes truncated away but not yet re-credited; the transfer
    /// settles these against quota at close.
    pub truncated_size: i64,
    pub is_new_file: bool,
    pub transfer_quota: TransferQuota,
}

/// One in-flight file transfer.
#[async_trait]
pub trait Transfer: Send {
    async fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Returns the number of bytes read; `Ok(0)` is end of file.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    /// Marks the transfer failed. Quota must not be credited for a
    /// failed transfer and any atomic temp file must be discarded.
    fn transfer_error(&mut self, err: &ScpError);
    /// Finalizes the transfer and commits quota. Called exactly once.
    async fn close(&mut self) -> Result<(), ScpError>;
}

/// Constructs [`Transfer`]s; implemented by the host.
pub trait TransferFactory: Send + Sync {
    fn begin(&self, connection_id: &str, params: TransferParams) -> Box<dyn Transfer>;
}
