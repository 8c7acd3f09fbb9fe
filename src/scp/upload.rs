//! The upload engine: `scp -t`, the peer drives
// (c) 2024 Ross Younger

use std::path::PathBuf;
use std::sync::Arc;

use human_repr::HumanCount as _;
use tracing::{debug, error, info, warn};

use crate::access::Permission;
use crate::channel::SessionChannel;
use crate::error::{ScpError, PERMISSION_DENIED_MSG};
use crate::protocol::ProtocolMessage;
use crate::services::HookOp;
use crate::transfer::{Transfer, TransferDirection, TransferParams};
use crate::util::vpath;
use crate::vfs::{self, CreateOptions, Fs};

impl<C: SessionChannel> super::ScpCommand<C> {
    /// The receive loop. The peer announces each entry with a control
    /// line; we track directory nesting, create as we go, and stream
    /// file payloads through the transfer bridge. Clean EOF ends the
    /// session.
    pub(super) async fn handle_uploads(&mut self) -> Result<(), ScpError> {
        let mut num_dirs: i64 = 0;
        let mut dest = self.dest_path();
        loop {
            let fs = self.upload_fs_for(&dest).await?;
            let msg = match self.next_upload_message().await {
                Ok(msg) => msg,
                Err(e) if e.is_eof() => return Ok(()),
                Err(e) => {
                    self.channel.send_err(&e.to_string()).await;
                    return Err(e);
                }
            };
            match msg {
                ProtocolMessage::EndDir => {
                    num_dirs -= 1;
                    debug!("received end dir command, num dirs: {num_dirs}");
                    if num_dirs < 0 {
                        let err = ScpError::Protocol("unacceptable end dir command".into());
                        self.channel.send_err("unacceptable end dir command").await;
                        return Err(err);
                    }
                    // the destination dir is now the parent directory
                    dest = vpath::parent(&dest);
                }
                ProtocolMessage::Dir { name, .. } => {
                    num_dirs += 1;
                    dest = vpath::join(&dest, &name);
                    let fs = self.upload_fs_for(&dest).await?;
                    self.create_dir(fs.as_ref(), &dest).await?;
                    debug!("received start dir command, num dirs: {num_dirs} dest: {dest:?}");
                }
                ProtocolMessage::File { size, name, .. } => {
                    let target = self.upload_dest_path(fs.as_ref(), &dest, &name).await;
                    self.handle_upload(&target, size).await?;
                }
                ProtocolMessage::Times { .. } | ProtocolMessage::Empty => {
                    let err =
                        ScpError::Protocol("unknown or invalid upload message".to_string());
                    self.channel.send_err(&err.to_string()).await;
                    return Err(err);
                }
            }
            self.channel.send_ok().await?;
        }
    }

    /// Reads the next control line, transparently acknowledging and
    /// discarding any `T` (times) lines in front of it.
    async fn next_upload_message(&mut self) -> Result<ProtocolMessage, ScpError> {
        loop {
            let line = self.channel.read_line().await?;
            let msg = ProtocolMessage::parse(&line)?;
            if matches!(msg, ProtocolMessage::Times { .. }) {
                self.channel.send_ok().await?;
                continue;
            }
            return Ok(msg);
        }
    }

    async fn upload_fs_for(&mut self, virtual_path: &str) -> Result<Arc<dyn Fs>, ScpError> {
        match self.user.fs_for_path(virtual_path) {
            Ok(fs) => Ok(fs),
            Err(e) => {
                error!("error uploading to {virtual_path:?}: {e}");
                self.channel
                    .send_err(&format!("unable to get fs for path {virtual_path:?}"))
                    .await;
                Err(ScpError::Fs(e))
            }
        }
    }

    /// Where does this `C` land? For a non-recursive upload whose
    /// destination has no trailing slash, an existing directory means
    /// "inside it", anything else means "this is the new filename".
    /// Recursive uploads and trailing slashes are always "inside".
    async fn upload_dest_path(&self, fs: &dyn Fs, dest: &str, name: &str) -> String {
        if !self.is_recursive() && !dest.ends_with('/') {
            if let Ok(resolved) = fs.resolve_path(dest) {
                match fs.stat(&resolved).await {
                    Ok(stat) if stat.is_dir() => return vpath::join(dest, name),
                    Ok(_) => return dest.to_string(),
                    Err(e) => {
                        if !vfs::is_not_exist(&e) {
                            error!("stat {dest:?} failed probing the upload destination: {e}");
                        }
                        return dest.to_string();
                    }
                }
            }
            return dest.to_string();
        }
        vpath::join(dest, name)
    }

    async fn create_dir(&mut self, fs: &dyn Fs, dir_path: &str) -> Result<(), ScpError> {
        self.services.registry.touch(&self.id);

        let resolved = match fs.resolve_path(dir_path) {
            Ok(p) => p,
            Err(e) => {
                error!("error creating dir {dir_path:?}, invalid path: {e}");
                self.channel.send_err(&e.to_string()).await;
                return Err(ScpError::Fs(e));
            }
        };
        if let Ok(stat) = fs.stat(&resolved).await {
            if stat.is_dir() {
                return Ok(());
            }
        }
        if !self
            .user
            .has_perm(Permission::CreateDirs, &vpath::parent(dir_path))
        {
            warn!("error creating dir {dir_path:?}, permission denied");
            self.channel.send_err(PERMISSION_DENIED_MSG).await;
            return Err(ScpError::PermissionDenied);
        }
        if let Err(e) = fs.mkdir(&resolved).await {
            error!("error creating dir {dir_path:?}: {e}");
            self.channel.send_err(&e.to_string()).await;
            return Err(ScpError::Fs(e));
        }
        let _ = fs
            .set_owner(&resolved, self.user.uid(), self.user.gid())
            .await;
        debug!("created dir {dir_path:?}");
        Ok(())
    }

    /// One `C` line: classify the target (new file / overwrite /
    /// rejected) and run the transfer.
    async fn handle_upload(&mut self, virtual_path: &str, size: u64) -> Result<(), ScpError> {
        self.services.registry.touch(&self.id);

        let fs = self.upload_fs_for(virtual_path).await?;
        let resolved = match fs.resolve_path(virtual_path) {
            Ok(p) => p,
            Err(e) => {
                error!("error uploading file {virtual_path:?}: {e}");
                self.channel.send_err(&e.to_string()).await;
                return Err(ScpError::Fs(e));
            }
        };

        let (allowed, _) = self.user.is_file_allowed(virtual_path);
        if !allowed {
            warn!("writing file {virtual_path:?} is not allowed");
            self.channel.send_err(PERMISSION_DENIED_MSG).await;
            return Err(ScpError::PermissionDenied);
        }

        let atomic = self.config.atomic_uploads && fs.is_atomic_upload_supported();
        let write_path = if atomic {
            fs.atomic_upload_path(&resolved)
        } else {
            resolved.clone()
        };

        match fs.lstat(&resolved).await {
            // Missing, or a symlink we will replace: a new file.
            Err(e) if vfs::is_not_exist(&e) => {
                self.handle_new_file(fs, resolved, write_path, size, virtual_path)
                    .await
            }
            Ok(stat) if stat.is_symlink() => {
                self.handle_new_file(fs, resolved, write_path, size, virtual_path)
                    .await
            }
            Err(e) => {
                error!("error performing file stat {resolved:?}: {e}");
                self.channel.send_err(&e.to_string()).await;
                Err(ScpError::Fs(e))
            }
            Ok(stat) if stat.is_dir() => {
                error!("attempted to open a directory for writing: {resolved:?}");
                let err = ScpError::Failure(format!(
                    "attempted to open a directory for writing: {virtual_path:?}"
                ));
                self.channel.send_err(&err.to_string()).await;
                Err(err)
            }
            Ok(stat) => {
                if !self.user.has_perm(Permission::Overwrite, virtual_path) {
                    warn!("cannot overwrite file {virtual_path:?}, permission denied");
                    self.channel.send_err(PERMISSION_DENIED_MSG).await;
                    return Err(ScpError::PermissionDenied);
                }
                if atomic {
                    // Move the old file out of the way first; the new
                    // content is promoted back on close.
                    if let Err(e) = fs.rename(&resolved, &write_path).await {
                        error!(
                            "error renaming existing file for atomic upload, \
                             source {resolved:?}, dest {write_path:?}: {e}"
                        );
                        self.channel.send_err(&e.to_string()).await;
                        return Err(ScpError::Fs(e));
                    }
                }
                let old_size = i64::try_from(stat.size).unwrap_or(i64::MAX);
                self.handle_upload_file(
                    fs,
                    resolved,
                    write_path,
                    size,
                    false,
                    old_size,
                    virtual_path,
                )
                .await
            }
        }
    }

    async fn handle_new_file(
        &mut self,
        fs: Arc<dyn Fs>,
        resolved: PathBuf,
        write_path: PathBuf,
        size: u64,
        virtual_path: &str,
    ) -> Result<(), ScpError> {
        if !self
            .user
            .has_perm(Permission::Upload, &vpath::parent(virtual_path))
        {
            warn!("cannot upload file {virtual_path:?}, permission denied");
            self.channel.send_err(PERMISSION_DENIED_MSG).await;
            return Err(ScpError::PermissionDenied);
        }
        self.handle_upload_file(fs, resolved, write_path, size, true, 0, virtual_path)
            .await
    }

    /// The gated part: count limits, quotas, the pre-upload hook, then
    /// create the file and stream. Nothing is written anywhere before
    /// every check has passed.
    #[allow(clippy::too_many_arguments)]
    async fn handle_upload_file(
        &mut self,
        fs: Arc<dyn Fs>,
        resolved: PathBuf,
        write_path: PathBuf,
        size: u64,
        is_new_file: bool,
        old_size: i64,
        virtual_path: &str,
    ) -> Result<(), ScpError> {
        if let Err(e) = self
            .services
            .registry
            .is_new_transfer_allowed(self.user.username())
        {
            info!("denying file write due to transfer count limits: {e}");
            let err = ScpError::Quota("denying file write due to transfer count limits".into());
            self.channel.send_err(&err.to_string()).await;
            return Err(err);
        }

        let (disk_quota, transfer_quota) = self
            .services
            .quota
            .has_space(self.user.as_ref(), is_new_file, false, virtual_path)
            .await;
        if !disk_quota.has_space || !transfer_quota.has_upload_space() {
            error!("error uploading file {virtual_path:?}: quota exceeded");
            let err = ScpError::Quota("denying file write due to quota limits".into());
            self.channel.send_err(&err.to_string()).await;
            return Err(err);
        }

        if let Err(e) = self
            .services
            .pre_action
            .execute(HookOp::PreUpload, &resolved, virtual_path, old_size, true)
            .await
        {
            debug!("upload for file {virtual_path:?} denied by pre action: {e}");
            self.channel.send_err(PERMISSION_DENIED_MSG).await;
            return Err(ScpError::PermissionDenied);
        }

        let mut max_write_size =
            self.services
                .quota
                .max_write_size(disk_quota, old_size, fs.is_upload_resume_supported());

        let (handle, cancel) = match fs
            .create(
                &write_path,
                CreateOptions {
                    truncate: true,
                    is_new_file,
                },
            )
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!("error creating file {resolved:?}: {e}");
                self.channel.send_err(&e.to_string()).await;
                return Err(ScpError::Fs(e));
            }
        };

        let mut initial_size = 0i64;
        let mut truncated_size = 0i64; // bytes truncated and not included in quota
        if !is_new_file {
            if fs.has_truncate_support() {
                // The truncating create already reclaimed the old bytes;
                // debit them from the owning quota bucket now.
                match self
                    .user
                    .virtual_folder_for_path(&vpath::parent(virtual_path))
                {
                    Some(folder) => {
                        self.services
                            .quota
                            .update_folder_quota(&folder, self.user.as_ref(), 0, -old_size)
                            .await;
                    }
                    None => {
                        self.services
                            .quota
                            .update_user_quota(self.user.as_ref(), 0, -old_size)
                            .await;
                    }
                }
            } else {
                initial_size = old_size;
                truncated_size = old_size;
            }
            if max_write_size > 0 {
                max_write_size += old_size;
            }
        }

        let _ = fs
            .set_owner(&write_path, self.user.uid(), self.user.gid())
            .await;

        let params = TransferParams {
            handle,
            cancel,
            resolved_path: resolved,
            write_path,
            virtual_path: virtual_path.to_string(),
            direction: TransferDirection::Upload,
            offset: 0,
            initial_size,
            max_write_size,
            truncated_size,
            is_new_file,
            transfer_quota,
        };
        let mut transfer = self.services.transfers.begin(&self.id, params);
        self.receive_file_data(size, transfer.as_mut()).await
    }

    /// Streams exactly `size` payload bytes from the channel into the
    /// transfer, then settles the trailing acks and closes.
    async fn receive_file_data(
        &mut self,
        size: u64,
        transfer: &mut dyn Transfer,
    ) -> Result<(), ScpError> {
        if let Err(e) = self.channel.send_ok().await {
            transfer.transfer_error(&e);
            let _ = transfer.close().await;
            return Err(e);
        }

        if size > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let mut buf = vec![0u8; size.min(32_768) as usize];
            let mut remaining = size;
            while remaining > 0 {
                #[allow(clippy::cast_possible_truncation)]
                let want = remaining.min(buf.len() as u64) as usize;
                let n = match self.channel.read_some(&mut buf[..want]).await {
                    Ok(n) => n,
                    Err(e) => {
                        transfer.transfer_error(&e);
                        let _ = transfer.close().await;
                        self.channel.send_err(&e.to_string()).await;
                        return Err(e);
                    }
                };
                if let Err(e) = transfer.write_at(&buf[..n], size - remaining).await {
                    let err = ScpError::Fs(e);
                    transfer.transfer_error(&err);
                    let _ = transfer.close().await;
                    self.channel.send_err(&err.to_string()).await;
                    return Err(err);
                }
                remaining -= n as u64;
            }
        }

        // the peer's completion marker
        if let Err(e) = self.channel.read_ack().await {
            transfer.transfer_error(&e);
            let _ = transfer.close().await;
            return Err(e);
        }

        if let Err(e) = transfer.close().await {
            self.channel.send_err(&e.to_string()).await;
            return Err(e);
        }
        debug!("upload complete, {}", size.human_count_bytes());
        Ok(())
    }
}
