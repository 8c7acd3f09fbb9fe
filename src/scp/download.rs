//! The download engine: `scp -f`, the server drives
// (c) 2024 Ross Younger

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use human_repr::HumanCount as _;
use tracing::{debug, error, info, warn};

use crate::access::{denied_file_error, Permission};
use crate::channel::SessionChannel;
use crate::error::{ScpError, PERMISSION_DENIED_MSG};
use crate::protocol::ProtocolMessage;
use crate::services::HookOp;
use crate::transfer::{Transfer, TransferDirection, TransferParams};
use crate::util::vpath;
use crate::vfs::{FileStat, Fs, LISTER_BATCH_SIZE};

impl<C: SessionChannel> super::ScpCommand<C> {
    /// Sends one entry (file or directory tree) to the peer. Boxed
    /// because directory downloads recurse through it.
    pub(super) fn handle_download<'a>(
        &'a mut self,
        virtual_path: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScpError>> + Send + 'a>> {
        Box::pin(async move { self.download_entry(virtual_path).await })
    }

    async fn download_entry(&mut self, virtual_path: String) -> Result<(), ScpError> {
        self.services.registry.touch(&self.id);

        if let Err(e) = self
            .services
            .registry
            .is_new_transfer_allowed(self.user.username())
        {
            info!("denying file read due to transfer count limits: {e}");
            let err = ScpError::Quota("denying file read due to transfer count limits".into());
            self.channel.send_err(&err.to_string()).await;
            return Err(err);
        }
        let transfer_quota = self.services.quota.transfer_quota(self.user.as_ref()).await;
        if !transfer_quota.has_download_space() {
            info!("denying file read due to quota limits");
            let err = ScpError::Quota("read quota exceeded".into());
            self.channel.send_err(&err.to_string()).await;
            return Err(err);
        }

        let fs = match self.user.fs_for_path(&virtual_path) {
            Ok(fs) => fs,
            Err(e) => {
                error!("error downloading file {virtual_path:?}: {e}");
                self.channel
                    .send_err(&format!("unable to download file {virtual_path:?}: {e}"))
                    .await;
                return Err(ScpError::Fs(e));
            }
        };
        let resolved = match fs.resolve_path(&virtual_path) {
            Ok(p) => p,
            Err(e) => {
                error!("error downloading file {virtual_path:?}: {e}");
                self.channel
                    .send_err(&format!("unable to download file {virtual_path:?}: {e}"))
                    .await;
                return Err(ScpError::Fs(e));
            }
        };
        let stat = match fs.stat(&resolved).await {
            Ok(s) => s,
            Err(e) => {
                error!("error downloading file {virtual_path:?} -> {resolved:?}: {e}");
                self.channel.send_err(&e.to_string()).await;
                return Err(ScpError::Fs(e));
            }
        };

        if stat.is_dir() {
            if !self.user.has_perm(Permission::Download, &virtual_path) {
                warn!("error downloading dir {virtual_path:?}, permission denied");
                self.channel.send_err(PERMISSION_DENIED_MSG).await;
                return Err(ScpError::PermissionDenied);
            }
            return self
                .handle_recursive_download(fs, &resolved, &virtual_path, &stat)
                .await;
        }

        if !self
            .user
            .has_perm(Permission::Download, &vpath::parent(&virtual_path))
        {
            warn!("error downloading file {virtual_path:?}, permission denied");
            self.channel.send_err(PERMISSION_DENIED_MSG).await;
            return Err(ScpError::PermissionDenied);
        }

        let (allowed, policy) = self.user.is_file_allowed(&virtual_path);
        if !allowed {
            warn!("reading file {virtual_path:?} is not allowed");
            self.channel
                .send_err(&denied_file_error(policy).to_string())
                .await;
            return Err(ScpError::PermissionDenied);
        }

        if let Err(e) = self
            .services
            .pre_action
            .execute(HookOp::PreDownload, &resolved, &virtual_path, 0, false)
            .await
        {
            debug!("download for file {virtual_path:?} denied by pre action: {e}");
            self.channel.send_err(PERMISSION_DENIED_MSG).await;
            return Err(ScpError::PermissionDenied);
        }

        let (handle, cancel) = match fs.open(&resolved, 0).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("could not open file {resolved:?} for reading: {e}");
                self.channel.send_err(&e.to_string()).await;
                return Err(ScpError::Fs(e));
            }
        };

        let params = TransferParams {
            handle,
            cancel,
            resolved_path: resolved.clone(),
            write_path: resolved,
            virtual_path: virtual_path.clone(),
            direction: TransferDirection::Download,
            offset: 0,
            initial_size: 0,
            max_write_size: 0,
            truncated_size: 0,
            is_new_file: false,
            transfer_quota,
        };
        let mut transfer = self.services.transfers.begin(&self.id, params);

        match self
            .send_file_data(&stat, &virtual_path, transfer.as_mut())
            .await
        {
            // Close either way; a close failure is the transfer's
            // failure if nothing went wrong earlier.
            Ok(()) => transfer.close().await,
            Err(e) => {
                transfer.transfer_error(&e);
                let _ = transfer.close().await;
                Err(e)
            }
        }
    }

    /// Walks one directory: files and symlinks stream immediately,
    /// subdirectories are deferred to a second pass, then `E` closes
    /// the frame.
    async fn handle_recursive_download(
        &mut self,
        fs: Arc<dyn Fs>,
        dir_real: &Path,
        virtual_path: &str,
        stat: &FileStat,
    ) -> Result<(), ScpError> {
        if !self.is_recursive() {
            let err =
                ScpError::Failure("unable to send directory for non recursive copy".into());
            self.channel.send_err(&err.to_string()).await;
            return Err(err);
        }
        debug!("recursive download, dir path {dir_real:?} virtual path {virtual_path:?}");
        self.send_download_headers(virtual_path, stat).await?;

        let mut lister = match fs.read_dir(dir_real).await {
            Ok(l) => l,
            Err(e) => {
                self.channel.send_err(&e.to_string()).await;
                return Err(ScpError::Fs(e));
            }
        };

        // Mount points belonging under this directory appear once, in
        // the first batch.
        let mut vdirs = self.user.virtual_folders_info(virtual_path);
        let rel_dir = fs.get_relative_path(dir_real);
        let mut dirs: Vec<String> = Vec::new();
        loop {
            let batch = match lister.next(LISTER_BATCH_SIZE).await {
                Ok(b) => b,
                Err(e) => {
                    self.channel.send_err(&e.to_string()).await;
                    return Err(ScpError::Fs(e));
                }
            };
            let finished = batch.is_empty();
            let mut files = self.user.filter_list_dir(batch, &rel_dir);
            if !vdirs.is_empty() {
                files.append(&mut vdirs);
            }
            for file in files {
                let child = fs.get_relative_path(&fs.join(dir_real, &file.name));
                if file.is_file() || file.is_symlink() {
                    if let Err(e) = self.handle_download(child).await {
                        self.channel.send_err(&e.to_string()).await;
                        return Err(e);
                    }
                } else if file.is_dir() {
                    dirs.push(child);
                }
            }
            if finished {
                break;
            }
        }

        for dir in dirs {
            if let Err(e) = self.handle_download(dir).await {
                self.channel.send_err(&e.to_string()).await;
                return Err(e);
            }
        }
        self.channel.write_line("E").await?;
        self.channel.read_ack().await
    }

    async fn send_download_headers(
        &mut self,
        virtual_path: &str,
        stat: &FileStat,
    ) -> Result<(), ScpError> {
        if self.send_file_time() {
            // SCP carries an atime too; we only track mtime, send it twice.
            let times = ProtocolMessage::Times {
                mtime: stat.modified,
                atime: stat.modified,
            };
            self.channel.write_line(&times.to_string()).await?;
            self.channel.read_ack().await?;
        }

        let mut dir_name = vpath::base(virtual_path);
        if dir_name == "/" || dir_name == "." {
            dir_name = self.user.username().to_string();
        }
        let header = ProtocolMessage::Dir {
            mode: stat.mode,
            name: dir_name,
        };
        self.channel.write_line(&header.to_string()).await?;
        self.channel.read_ack().await
    }

    async fn send_file_data(
        &mut self,
        stat: &FileStat,
        virtual_path: &str,
        transfer: &mut dyn Transfer,
    ) -> Result<(), ScpError> {
        if self.send_file_time() {
            let times = ProtocolMessage::Times {
                mtime: stat.modified,
                atime: stat.modified,
            };
            self.channel.write_line(&times.to_string()).await?;
            self.channel.read_ack().await?;
        }

        let header = ProtocolMessage::File {
            mode: stat.mode,
            size: stat.size,
            name: vpath::base(virtual_path),
        };
        self.channel.write_line(&header.to_string()).await?;
        self.channel.read_ack().await?;

        let mut buf = vec![0u8; 32_768];
        let mut offset = 0u64;
        loop {
            match transfer.read_at(&mut buf, offset).await {
                Ok(0) => break,
                Ok(n) => {
                    offset += n as u64;
                    self.channel.write_bytes(&buf[..n]).await?;
                }
                Err(e) => {
                    let err = ScpError::Fs(e);
                    self.channel.send_err(&err.to_string()).await;
                    return Err(err);
                }
            }
        }

        // our completion marker, then the peer's
        self.channel.send_ok().await?;
        self.channel.read_ack().await?;
        debug!("download complete, {}", stat.size.human_count_bytes());
        Ok(())
    }
}
