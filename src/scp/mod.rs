//! The SCP command: dispatch and lifecycle
// (c) 2024 Ross Younger
//!
//! One [`handle`] call services one `exec "scp …"` request on one SSH
//! channel, from the first ack to the exit status. The flags that matter
//! are `-t` (receive files), `-f` (send files), `-r` (recursive), `-p`
//! (preserve times) and `-d` (target is a directory); they arrive as
//! openssh-style clustered single-dash tokens and anything unrecognized
//! is ignored. The destination is always the final argv token.

mod download;
mod upload;

use std::sync::Arc;

use tracing::{debug, info, trace_span, Instrument as _};

use crate::access::User;
use crate::channel::{ScpChannel, SessionChannel};
use crate::config::ScpConfig;
use crate::error::ScpError;
use crate::services::{ConnectionRegistry, SessionServices};
use crate::util::vpath;

/// One SCP command in flight. Owns the channel for its whole lifetime.
struct ScpCommand<C: SessionChannel> {
    channel: ScpChannel<C>,
    args: Vec<String>,
    user: Arc<dyn User>,
    services: SessionServices,
    config: ScpConfig,
    id: String,
}

/// Deregisters the connection on every exit path, panic unwinds
/// included. Connection-limit enforcement must not leak entries when a
/// backend trait implementation panics mid-command.
struct RegistryGuard {
    registry: Arc<dyn ConnectionRegistry>,
    id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Services one SCP command and returns the SSH exit status (0 on
/// success, 1 on any failure). The same status has already been sent on
/// the channel before this returns.
///
/// `args` is the argv of the exec request with the leading `scp` element
/// removed; `connection_id` identifies this channel to the registry and
/// the transfer factory.
pub async fn handle<C: SessionChannel>(
    args: Vec<String>,
    user: Arc<dyn User>,
    services: SessionServices,
    config: ScpConfig,
    connection_id: impl Into<String>,
    channel: C,
) -> u32 {
    let id = connection_id.into();
    let span = trace_span!("SCP", id = %id, user = %user.username());
    async move {
        let mut cmd = ScpCommand {
            channel: ScpChannel::new(channel),
            args,
            user,
            services,
            config,
            id,
        };
        if let Err(e) = cmd.services.registry.add(&cmd.id, cmd.user.username()) {
            info!("unable to add SCP connection: {e}");
            return 1;
        }
        let _registration = RegistryGuard {
            registry: Arc::clone(&cmd.services.registry),
            id: cmd.id.clone(),
        };
        debug!(
            "handle scp command, args: {:?} dest path: {:?}",
            cmd.args,
            cmd.dest_path()
        );
        let status = match cmd.run().await {
            Ok(()) => 0,
            Err(e) => {
                debug!("scp command failed: {e}");
                1
            }
        };
        cmd.channel.send_exit_status(status).await;
        if status != 0 {
            // Backstop: the failing path has normally closed the channel
            // already. A clean run leaves it open for the host.
            cmd.channel.close().await;
        }
        status
    }
    .instrument(span)
    .await
}

impl<C: SessionChannel> ScpCommand<C> {
    async fn run(&mut self) -> Result<(), ScpError> {
        if self.has_flag('t') {
            // -t means "to", so upload
            self.channel.send_ok().await?;
            self.handle_uploads().await
        } else if self.has_flag('f') {
            // -f means "from", so download
            self.channel.read_ack().await?;
            let dest = self.dest_path();
            self.handle_download(dest).await
        } else {
            debug!("unsupported scp command, args: {:?}", self.args);
            Err(ScpError::Failure(format!(
                "scp command not supported, args: {:?}",
                self.args
            )))
        }
    }

    /// Openssh sends flags as clustered single-dash tokens (`-rt`), in
    /// no particular order. A token is a flag carrier if it starts with
    /// exactly one dash; the last token is the destination and never a
    /// flag.
    fn has_flag(&self, flag: char) -> bool {
        let n = self.args.len().saturating_sub(1);
        self.args[..n]
            .iter()
            .any(|arg| !arg.starts_with("--") && arg.starts_with('-') && arg.contains(flag))
    }

    fn is_recursive(&self) -> bool {
        self.has_flag('r')
    }

    fn send_file_time(&self) -> bool {
        self.has_flag('p')
    }

    /// The destination, from the last argv token: quotes stripped, path
    /// canonicalized, but a trailing slash preserved because it changes
    /// the §upload destination rule.
    fn dest_path(&self) -> String {
        let Some(last) = self.args.last() else {
            return String::new();
        };
        let trimmed = last.trim_matches('\'').trim_matches('"');
        let cleaned = vpath::clean(trimmed);
        if trimmed.ends_with('/') && !cleaned.ends_with('/') {
            format!("{cleaned}/")
        } else {
            cleaned
        }
    }
}
